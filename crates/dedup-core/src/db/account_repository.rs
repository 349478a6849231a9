//! Account repository implementation

use crate::error::{Error, Result};
use crate::models::{Account, AccountId};
use libsql::Connection;

/// Trait for account storage operations (async)
#[allow(async_fn_in_trait)]
pub trait AccountRepository {
    /// Create a new account
    async fn create(&self, display_name: &str) -> Result<Account>;

    /// Get an account by ID
    async fn get(&self, id: &AccountId) -> Result<Option<Account>>;

    /// Check whether an account exists
    async fn exists(&self, id: &AccountId) -> Result<bool>;
}

/// libSQL implementation of `AccountRepository`
pub struct LibSqlAccountRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlAccountRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }
}

impl AccountRepository for LibSqlAccountRepository<'_> {
    async fn create(&self, display_name: &str) -> Result<Account> {
        let display_name = display_name.trim();
        if display_name.is_empty() {
            return Err(Error::InvalidInput(
                "Account display name must not be empty".to_string(),
            ));
        }

        let account = Account::new(display_name);
        self.conn
            .execute(
                "INSERT INTO accounts (id, display_name, created_at) VALUES (?, ?, ?)",
                libsql::params![
                    account.id.as_str(),
                    account.display_name.clone(),
                    account.created_at
                ],
            )
            .await?;
        Ok(account)
    }

    async fn get(&self, id: &AccountId) -> Result<Option<Account>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, display_name, created_at FROM accounts WHERE id = ?",
                [id.as_str()],
            )
            .await?;

        let Some(row) = rows.next().await? else {
            return Ok(None);
        };
        let raw_id: String = row.get(0)?;
        Ok(Some(Account {
            id: raw_id
                .parse()
                .map_err(|_| Error::Database(format!("Invalid account id '{raw_id}'")))?,
            display_name: row.get(1)?,
            created_at: row.get(2)?,
        }))
    }

    async fn exists(&self, id: &AccountId) -> Result<bool> {
        let mut rows = self
            .conn
            .query(
                "SELECT EXISTS(SELECT 1 FROM accounts WHERE id = ?)",
                [id.as_str()],
            )
            .await?;
        Ok(match rows.next().await? {
            Some(row) => row.get::<i32>(0)? != 0,
            None => false,
        })
    }
}
