//! CRM connection lifecycle: authorization, credential refresh, disconnect.

pub mod oauth_state;

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::crm::{with_timeout, CrmClient};
use crate::error::{Error, Result};
use crate::locks::KeyedLocks;
use crate::models::{AccountId, Connection, ConnectionStatus, RemoteAccount};
use crate::services::DatabaseService;
use crate::util::{unix_millis_now, unix_timestamp_now};

pub use oauth_state::OAuthSettings;

pub const DEFAULT_REFRESH_MARGIN: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_CRM_TIMEOUT: Duration = Duration::from_secs(20);

/// Timing knobs for credential handling
#[derive(Debug, Clone, Copy)]
pub struct LifecycleConfig {
    /// Refresh once the token is this close to expiry
    pub refresh_margin: Duration,
    /// Upper bound for each token exchange or refresh call
    pub crm_timeout: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            refresh_margin: DEFAULT_REFRESH_MARGIN,
            crm_timeout: DEFAULT_CRM_TIMEOUT,
        }
    }
}

/// Where to send the operator and the state to expect back
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthorizationRequest {
    pub url: String,
    pub state: String,
}

/// Owns token issuance, expiry detection and refresh for every account.
pub struct ConnectionManager {
    db: DatabaseService,
    crm: Arc<dyn CrmClient>,
    oauth: OAuthSettings,
    config: LifecycleConfig,
    account_locks: KeyedLocks<AccountId>,
}

impl ConnectionManager {
    pub fn new(
        db: DatabaseService,
        crm: Arc<dyn CrmClient>,
        oauth: OAuthSettings,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            db,
            crm,
            oauth,
            config,
            account_locks: KeyedLocks::new(),
        }
    }

    fn margin_secs(&self) -> i64 {
        i64::try_from(self.config.refresh_margin.as_secs()).unwrap_or(i64::MAX)
    }

    /// Build the consent URL and a signed, single-use state for `account_id`.
    pub async fn begin_authorization(&self, account_id: &AccountId) -> Result<AuthorizationRequest> {
        if !self.db.account_exists(account_id).await? {
            return Err(Error::NotFound(format!("Account {account_id}")));
        }

        let state = oauth_state::issue(&self.oauth, account_id, unix_timestamp_now())?;
        let url = self.crm.authorization_url(&state)?;
        tracing::debug!(account_id = %account_id, "Issued authorization request");
        Ok(AuthorizationRequest { url, state })
    }

    /// Finish the consent flow: verify state, exchange the code, store the new connection.
    pub async fn complete_authorization(&self, code: &str, state: &str) -> Result<Connection> {
        let verified = oauth_state::verify(&self.oauth, state)?;
        let account_id = verified.account_id;

        if !self.db.account_exists(&account_id).await? {
            return Err(Error::InvalidState(format!("Unknown account {account_id}")));
        }
        if !self
            .db
            .consume_state_nonce(&verified.nonce, &account_id, unix_millis_now())
            .await?
        {
            return Err(Error::InvalidState(
                "Authorization state was already used".to_string(),
            ));
        }

        let code = code.trim();
        if code.is_empty() {
            return Err(Error::AuthExchangeFailed(
                "Authorization code is missing".to_string(),
            ));
        }

        let grant = with_timeout(self.config.crm_timeout, self.crm.exchange_code(code))
            .await
            .map_err(|failure| Error::AuthExchangeFailed(failure.reason()))?;
        if grant.refresh_token.is_none() {
            return Err(Error::AuthExchangeFailed(
                "CRM did not issue a refresh token".to_string(),
            ));
        }

        let remote = match with_timeout(
            self.config.crm_timeout,
            self.crm.remote_account(&grant.access_token),
        )
        .await
        {
            Ok(remote) => remote,
            Err(failure) => {
                tracing::warn!(
                    account_id = %account_id,
                    reason = %failure.reason(),
                    "Could not resolve CRM account identity"
                );
                RemoteAccount::default()
            }
        };

        let connection = Connection::from_grant(account_id, grant, remote);
        {
            let _guard = self.account_locks.lock(account_id).await;
            self.db.activate_connection(&connection).await?;
        }

        tracing::info!(
            account_id = %account_id,
            connection_id = %connection.id,
            portal_id = ?connection.portal_id,
            "CRM connection established"
        );
        Ok(connection)
    }

    /// Access token for the account's active connection, refreshed if close to expiry.
    pub async fn get_valid_credential(&self, account_id: &AccountId) -> Result<String> {
        let margin = self.margin_secs();

        let connection = self
            .db
            .active_connection(account_id)
            .await?
            .ok_or(Error::NotConnected)?;
        if !connection.needs_refresh(unix_timestamp_now(), margin) {
            self.db
                .touch_connection(&connection.id, unix_millis_now())
                .await?;
            return Ok(connection.access_token);
        }

        tracing::debug!(account_id = %account_id, "Waiting for credential refresh lock");
        let _guard = self.account_locks.lock(*account_id).await;

        // Another caller may have refreshed (or disconnected) while we waited.
        let connection = self
            .db
            .active_connection(account_id)
            .await?
            .ok_or(Error::NotConnected)?;
        if !connection.needs_refresh(unix_timestamp_now(), margin) {
            self.db
                .touch_connection(&connection.id, unix_millis_now())
                .await?;
            return Ok(connection.access_token);
        }

        match with_timeout(
            self.config.crm_timeout,
            self.crm.refresh(&connection.refresh_token),
        )
        .await
        {
            Ok(grant) => {
                self.db
                    .apply_refresh(&connection.id, &grant, unix_millis_now())
                    .await?;
                tracing::info!(
                    account_id = %account_id,
                    connection_id = %connection.id,
                    expires_at = grant.expires_at,
                    "CRM credential refreshed"
                );
                Ok(grant.access_token)
            }
            Err(failure) => {
                let reason = failure.reason();
                tracing::warn!(
                    account_id = %account_id,
                    connection_id = %connection.id,
                    reason = %reason,
                    "CRM credential refresh failed; connection deactivated"
                );
                self.db
                    .deactivate_connection(&connection.id, unix_millis_now())
                    .await?;
                Err(Error::ReconnectRequired(reason))
            }
        }
    }

    /// Deactivate the account's connection. Safe to call when already disconnected.
    pub async fn disconnect(&self, account_id: &AccountId) -> Result<()> {
        let _guard = self.account_locks.lock(*account_id).await;
        let deactivated = self
            .db
            .deactivate_account_connections(account_id, unix_millis_now())
            .await?;
        tracing::info!(account_id = %account_id, deactivated, "CRM connection disconnected");
        Ok(())
    }

    /// Read-only connection projection. Never fails.
    pub async fn status(&self, account_id: &AccountId) -> ConnectionStatus {
        match self.db.active_connection(account_id).await {
            Ok(Some(connection)) => ConnectionStatus::from(&connection),
            Ok(None) => ConnectionStatus::disconnected(),
            Err(error) => {
                tracing::warn!(account_id = %account_id, "Connection status lookup failed: {error}");
                ConnectionStatus::disconnected()
            }
        }
    }
}
