//! Remote CRM operations used by the lifecycle manager and the merge engine.
//!
//! Every call is treated as an opaque remote operation that can fail or hang;
//! callers wrap them in [`with_timeout`] and translate failures into the
//! domain error that fits the operation.

mod hubspot;

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;

use crate::models::{RemoteAccount, TokenGrant};

pub use hubspot::{HubSpotClient, HubSpotConfig};

/// Authenticated calls against the external CRM
#[async_trait]
pub trait CrmClient: Send + Sync {
    /// Consent page URL the operator is sent to, carrying `state`.
    fn authorization_url(&self, state: &str) -> crate::Result<String>;

    /// Exchange an authorization code for a token grant.
    async fn exchange_code(&self, code: &str) -> crate::Result<TokenGrant>;

    /// Exchange a refresh token for a new access token.
    async fn refresh(&self, refresh_token: &str) -> crate::Result<TokenGrant>;

    /// Identity of the CRM account behind `access_token`.
    async fn remote_account(&self, access_token: &str) -> crate::Result<RemoteAccount>;

    /// Write property values onto a record.
    async fn update_record(
        &self,
        access_token: &str,
        record_id: &str,
        properties: &BTreeMap<String, String>,
    ) -> crate::Result<()>;

    /// Fold `retire_record_id` into `keep_record_id`.
    async fn merge_records(
        &self,
        access_token: &str,
        keep_record_id: &str,
        retire_record_id: &str,
    ) -> crate::Result<()>;
}

/// Why a bounded remote call did not produce a value.
#[derive(Debug)]
pub enum CallFailure {
    TimedOut(Duration),
    Failed(crate::Error),
}

impl CallFailure {
    /// One-line reason suitable for an error message.
    #[must_use]
    pub fn reason(&self) -> String {
        match self {
            Self::TimedOut(limit) => format!("CRM did not answer within {}s", limit.as_secs()),
            Self::Failed(error) => crate::util::sanitize(error),
        }
    }
}

/// Run a CRM call with an upper bound on its duration.
pub async fn with_timeout<T, F>(limit: Duration, call: F) -> Result<T, CallFailure>
where
    F: Future<Output = crate::Result<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(error)) => Err(CallFailure::Failed(error)),
        Err(_) => Err(CallFailure::TimedOut(limit)),
    }
}
