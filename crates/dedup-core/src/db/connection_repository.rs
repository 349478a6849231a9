//! CRM connection (token store) repository implementation

use crate::error::{Error, Result};
use crate::models::{AccountId, Connection, TokenGrant};
use libsql::Connection as LibSqlConnection;

const CONNECTION_COLUMNS: &str = "id, account_id, access_token, refresh_token, expires_at, \
     token_type, portal_id, domain, account_name, active, last_used_at, created_at, updated_at";

/// Trait for connection storage operations (async)
#[allow(async_fn_in_trait)]
pub trait ConnectionRepository {
    /// Deactivate every active connection of the account and insert `connection` as the active one
    async fn activate(&self, connection: &Connection) -> Result<()>;

    /// The account's active connection, if any
    async fn active_for(&self, account_id: &AccountId) -> Result<Option<Connection>>;

    /// All connections of the account, newest first (audit history)
    async fn history_for(&self, account_id: &AccountId) -> Result<Vec<Connection>>;

    /// Replace the credential fields of an active connection after a refresh
    async fn apply_refresh(&self, connection_id: &str, grant: &TokenGrant, now_ms: i64)
        -> Result<()>;

    /// Record that the credential was handed out
    async fn touch(&self, connection_id: &str, now_ms: i64) -> Result<()>;

    /// Deactivate one connection; returns whether it was active
    async fn deactivate(&self, connection_id: &str, now_ms: i64) -> Result<bool>;

    /// Deactivate whatever is active for the account; returns the number of rows changed
    async fn deactivate_account(&self, account_id: &AccountId, now_ms: i64) -> Result<u64>;

    /// Mark an OAuth state nonce as used; `false` if it had already been consumed
    async fn consume_state_nonce(
        &self,
        nonce: &str,
        account_id: &AccountId,
        now_ms: i64,
    ) -> Result<bool>;
}

/// libSQL implementation of `ConnectionRepository`
pub struct LibSqlConnectionRepository<'a> {
    conn: &'a LibSqlConnection,
}

impl<'a> LibSqlConnectionRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a LibSqlConnection) -> Self {
        Self { conn }
    }

    /// Parse a connection from a database row
    fn parse_connection(row: &libsql::Row) -> Result<Connection> {
        let account_id: String = row.get(1)?;
        Ok(Connection {
            id: row.get(0)?,
            account_id: account_id
                .parse()
                .map_err(|_| Error::Database(format!("Invalid account id '{account_id}'")))?,
            access_token: row.get(2)?,
            refresh_token: row.get(3)?,
            expires_at: row.get(4)?,
            token_type: row.get(5)?,
            portal_id: row.get(6)?,
            domain: row.get(7)?,
            account_name: row.get(8)?,
            active: row.get::<i64>(9)? != 0,
            last_used_at: row.get(10)?,
            created_at: row.get(11)?,
            updated_at: row.get(12)?,
        })
    }

    async fn insert_after_deactivation(&self, connection: &Connection) -> Result<()> {
        self.conn
            .execute(
                "UPDATE connections SET active = 0, updated_at = ?
                 WHERE account_id = ? AND active = 1",
                libsql::params![connection.created_at, connection.account_id.as_str()],
            )
            .await?;

        self.conn
            .execute(
                &format!(
                    "INSERT INTO connections ({CONNECTION_COLUMNS})
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
                ),
                libsql::params![
                    connection.id.clone(),
                    connection.account_id.as_str(),
                    connection.access_token.clone(),
                    connection.refresh_token.clone(),
                    connection.expires_at,
                    connection.token_type.clone(),
                    connection.portal_id.clone(),
                    connection.domain.clone(),
                    connection.account_name.clone(),
                    i64::from(connection.active),
                    connection.last_used_at,
                    connection.created_at,
                    connection.updated_at
                ],
            )
            .await?;
        Ok(())
    }
}

impl ConnectionRepository for LibSqlConnectionRepository<'_> {
    async fn activate(&self, connection: &Connection) -> Result<()> {
        self.conn.execute("BEGIN IMMEDIATE", ()).await?;

        if let Err(e) = self.insert_after_deactivation(connection).await {
            self.conn.execute("ROLLBACK", ()).await.ok();
            return Err(e);
        }

        if let Err(e) = self.conn.execute("COMMIT", ()).await {
            self.conn.execute("ROLLBACK", ()).await.ok();
            return Err(e.into());
        }
        Ok(())
    }

    async fn active_for(&self, account_id: &AccountId) -> Result<Option<Connection>> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {CONNECTION_COLUMNS} FROM connections
                     WHERE account_id = ? AND active = 1
                     LIMIT 1"
                ),
                [account_id.as_str()],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(Self::parse_connection(&row)?)),
            None => Ok(None),
        }
    }

    async fn history_for(&self, account_id: &AccountId) -> Result<Vec<Connection>> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {CONNECTION_COLUMNS} FROM connections
                     WHERE account_id = ?
                     ORDER BY created_at DESC, id DESC"
                ),
                [account_id.as_str()],
            )
            .await?;

        let mut connections = Vec::new();
        while let Some(row) = rows.next().await? {
            connections.push(Self::parse_connection(&row)?);
        }
        Ok(connections)
    }

    async fn apply_refresh(
        &self,
        connection_id: &str,
        grant: &TokenGrant,
        now_ms: i64,
    ) -> Result<()> {
        // A grant without a rotated refresh token keeps the stored one
        let rows = self
            .conn
            .execute(
                "UPDATE connections
                 SET access_token = ?,
                     refresh_token = COALESCE(?, refresh_token),
                     expires_at = ?,
                     token_type = ?,
                     last_used_at = ?,
                     updated_at = ?
                 WHERE id = ? AND active = 1",
                libsql::params![
                    grant.access_token.clone(),
                    grant.refresh_token.clone(),
                    grant.expires_at,
                    grant.token_type.clone(),
                    now_ms,
                    now_ms,
                    connection_id
                ],
            )
            .await?;

        if rows == 0 {
            return Err(Error::NotConnected);
        }
        Ok(())
    }

    async fn touch(&self, connection_id: &str, now_ms: i64) -> Result<()> {
        self.conn
            .execute(
                "UPDATE connections SET last_used_at = ? WHERE id = ?",
                libsql::params![now_ms, connection_id],
            )
            .await?;
        Ok(())
    }

    async fn deactivate(&self, connection_id: &str, now_ms: i64) -> Result<bool> {
        let rows = self
            .conn
            .execute(
                "UPDATE connections SET active = 0, updated_at = ? WHERE id = ? AND active = 1",
                libsql::params![now_ms, connection_id],
            )
            .await?;
        Ok(rows > 0)
    }

    async fn deactivate_account(&self, account_id: &AccountId, now_ms: i64) -> Result<u64> {
        let rows = self
            .conn
            .execute(
                "UPDATE connections SET active = 0, updated_at = ?
                 WHERE account_id = ? AND active = 1",
                libsql::params![now_ms, account_id.as_str()],
            )
            .await?;
        Ok(rows)
    }

    async fn consume_state_nonce(
        &self,
        nonce: &str,
        account_id: &AccountId,
        now_ms: i64,
    ) -> Result<bool> {
        let rows = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO oauth_state_nonces (nonce, account_id, consumed_at)
                 VALUES (?, ?, ?)",
                libsql::params![nonce, account_id.as_str(), now_ms],
            )
            .await?;
        Ok(rows == 1)
    }
}
