//! Signed, self-describing OAuth `state` parameter.

use std::fmt;
use std::time::Duration;

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::AccountId;
use crate::util::sanitize;

pub const MIN_STATE_SECRET_LEN: usize = 32;

/// Secret and lifetime of issued state tokens
#[derive(Clone)]
pub struct OAuthSettings {
    pub state_secret: String,
    pub state_ttl: Duration,
}

impl OAuthSettings {
    pub fn new(state_secret: impl Into<String>, state_ttl: Duration) -> Result<Self> {
        let state_secret = state_secret.into();
        if state_secret.len() < MIN_STATE_SECRET_LEN {
            return Err(Error::InvalidInput(format!(
                "OAuth state secret must be at least {MIN_STATE_SECRET_LEN} characters"
            )));
        }
        Ok(Self {
            state_secret,
            state_ttl,
        })
    }
}

impl fmt::Debug for OAuthSettings {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("OAuthSettings")
            .field("state_secret", &"[REDACTED]")
            .field("state_ttl", &self.state_ttl)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateClaims {
    pub sub: String,
    pub nonce: String,
    pub iat: i64,
    pub exp: i64,
}

/// Decoded and signature-checked state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedState {
    pub account_id: AccountId,
    pub nonce: String,
}

/// Sign a state token for `account_id` issued at `now_secs`.
pub fn issue(settings: &OAuthSettings, account_id: &AccountId, now_secs: i64) -> Result<String> {
    let ttl = i64::try_from(settings.state_ttl.as_secs()).unwrap_or(i64::MAX);
    let claims = StateClaims {
        sub: account_id.as_str(),
        nonce: Uuid::new_v4().to_string(),
        iat: now_secs,
        exp: now_secs.saturating_add(ttl),
    };
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(settings.state_secret.as_bytes()),
    )
    .map_err(|error| Error::InvalidState(format!("State signing failed: {}", sanitize(&error))))
}

/// Check signature and expiry and recover the account id.
pub fn verify(settings: &OAuthSettings, token: &str) -> Result<VerifiedState> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.leeway = 0;
    validation.validate_aud = false;
    validation.set_required_spec_claims(&["exp", "sub"]);

    let decoded = decode::<StateClaims>(
        token.trim(),
        &DecodingKey::from_secret(settings.state_secret.as_bytes()),
        &validation,
    )
    .map_err(|error| Error::InvalidState(sanitize(&error)))?;

    let account_id = decoded
        .claims
        .sub
        .parse::<AccountId>()
        .map_err(|_| Error::InvalidState("State subject is not an account id".to_string()))?;
    if decoded.claims.nonce.trim().is_empty() {
        return Err(Error::InvalidState("State nonce is missing".to_string()));
    }

    Ok(VerifiedState {
        account_id,
        nonce: decoded.claims.nonce,
    })
}
