//! CRM connection model

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::AccountId;

/// A stored, refreshable credential pair for one CRM account
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    pub id: String,
    pub account_id: AccountId,
    pub access_token: String,
    pub refresh_token: String,
    /// Absolute access token expiry (Unix seconds)
    pub expires_at: i64,
    pub token_type: String,
    pub portal_id: Option<String>,
    pub domain: Option<String>,
    pub account_name: Option<String>,
    pub active: bool,
    /// Unix ms
    pub last_used_at: Option<i64>,
    /// Unix ms
    pub created_at: i64,
    /// Unix ms
    pub updated_at: i64,
}

impl Connection {
    /// Build a fresh, active connection from a token grant.
    #[must_use]
    pub fn from_grant(account_id: AccountId, grant: TokenGrant, remote: RemoteAccount) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            id: Uuid::now_v7().to_string(),
            account_id,
            access_token: grant.access_token,
            refresh_token: grant.refresh_token.unwrap_or_default(),
            expires_at: grant.expires_at,
            token_type: grant.token_type,
            portal_id: remote.portal_id,
            domain: remote.domain,
            account_name: remote.account_name,
            active: true,
            last_used_at: Some(now),
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the access token expires within `margin_secs` of `now_secs`.
    #[must_use]
    pub const fn needs_refresh(&self, now_secs: i64, margin_secs: i64) -> bool {
        now_secs >= self.expires_at.saturating_sub(margin_secs)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Connection")
            .field("id", &self.id)
            .field("account_id", &self.account_id)
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .field("token_type", &self.token_type)
            .field("portal_id", &self.portal_id)
            .field("domain", &self.domain)
            .field("account_name", &self.account_name)
            .field("active", &self.active)
            .field("last_used_at", &self.last_used_at)
            .finish_non_exhaustive()
    }
}

/// Tokens returned by the CRM for a code exchange or refresh
#[derive(Clone, PartialEq, Eq)]
pub struct TokenGrant {
    pub access_token: String,
    /// Absent when the CRM keeps the previous refresh token valid
    pub refresh_token: Option<String>,
    /// Absolute expiry (Unix seconds)
    pub expires_at: i64,
    pub token_type: String,
}

impl fmt::Debug for TokenGrant {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("TokenGrant")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .field("token_type", &self.token_type)
            .finish()
    }
}

/// Identity of the remote CRM account behind a token
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteAccount {
    pub portal_id: Option<String>,
    pub domain: Option<String>,
    pub account_name: Option<String>,
}

/// Read-only projection surfaced to the presentation layer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub portal_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<i64>,
}

impl ConnectionStatus {
    #[must_use]
    pub fn disconnected() -> Self {
        Self::default()
    }
}

impl From<&Connection> for ConnectionStatus {
    fn from(connection: &Connection) -> Self {
        Self {
            connected: connection.active,
            account_name: connection
                .account_name
                .clone()
                .or_else(|| connection.domain.clone()),
            portal_id: connection.portal_id.clone(),
            last_used_at: connection.last_used_at,
        }
    }
}
