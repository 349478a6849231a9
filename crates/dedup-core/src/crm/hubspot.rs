//! HubSpot implementation of [`CrmClient`] (OAuth v1 + CRM v3 contacts).

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::instrument;
use url::Url;

use super::CrmClient;
use crate::error::{Error, Result};
use crate::models::{RemoteAccount, TokenGrant};
use crate::util::{compact_text, sanitize, unix_timestamp_now};

/// OAuth app registration and endpoints
#[derive(Clone)]
pub struct HubSpotConfig {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    pub scopes: Vec<String>,
    pub api_base_url: String,
    pub authorize_url: String,
    pub timeout: Duration,
}

impl fmt::Debug for HubSpotConfig {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("HubSpotConfig")
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .field("redirect_uri", &self.redirect_uri)
            .field("scopes", &self.scopes)
            .field("api_base_url", &self.api_base_url)
            .field("authorize_url", &self.authorize_url)
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct HubSpotClient {
    client: Client,
    config: HubSpotConfig,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    expires_in: i64,
    #[serde(default)]
    token_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AccessTokenInfo {
    #[serde(default)]
    hub_id: Option<i64>,
    #[serde(default)]
    hub_domain: Option<String>,
}

#[derive(Debug, Serialize)]
struct MergeRequest<'a> {
    #[serde(rename = "primaryObjectId")]
    primary_object_id: &'a str,
    #[serde(rename = "objectIdToMerge")]
    object_id_to_merge: &'a str,
}

#[derive(Debug, Serialize)]
struct UpdateRequest<'a> {
    properties: &'a BTreeMap<String, String>,
}

impl TokenResponse {
    fn into_grant(self, now_secs: i64) -> Result<TokenGrant> {
        let access_token = self.access_token.trim().to_string();
        if access_token.is_empty() {
            return Err(Error::Crm("token response carried no access token".to_string()));
        }
        Ok(TokenGrant {
            access_token,
            refresh_token: crate::util::normalize_text_option(self.refresh_token),
            expires_at: now_secs.saturating_add(self.expires_in.max(0)),
            token_type: self.token_type.unwrap_or_else(|| "bearer".to_string()),
        })
    }
}

impl HubSpotClient {
    pub fn new(config: HubSpotConfig) -> Result<Self> {
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self { client, config })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.config.api_base_url.trim_end_matches('/'), path)
    }

    async fn token_request(&self, form: &[(&str, &str)]) -> Result<TokenGrant> {
        let response = self
            .client
            .post(self.endpoint("/oauth/v1/token"))
            .header("Accept", "application/json")
            .form(form)
            .send()
            .await?;
        let payload: TokenResponse = read_json(response, "token request").await?;
        payload.into_grant(unix_timestamp_now())
    }
}

#[async_trait]
impl CrmClient for HubSpotClient {
    fn authorization_url(&self, state: &str) -> Result<String> {
        let mut url = Url::parse(&self.config.authorize_url).map_err(|error| {
            Error::InvalidInput(format!("Invalid CRM authorize URL: {}", sanitize(&error)))
        })?;
        url.query_pairs_mut()
            .append_pair("client_id", &self.config.client_id)
            .append_pair("redirect_uri", &self.config.redirect_uri)
            .append_pair("scope", &self.config.scopes.join(" "))
            .append_pair("state", state);
        Ok(url.into())
    }

    #[instrument(level = "debug", skip_all)]
    async fn exchange_code(&self, code: &str) -> Result<TokenGrant> {
        self.token_request(&[
            ("grant_type", "authorization_code"),
            ("client_id", &self.config.client_id),
            ("client_secret", &self.config.client_secret),
            ("redirect_uri", &self.config.redirect_uri),
            ("code", code),
        ])
        .await
    }

    #[instrument(level = "debug", skip_all)]
    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant> {
        self.token_request(&[
            ("grant_type", "refresh_token"),
            ("client_id", &self.config.client_id),
            ("client_secret", &self.config.client_secret),
            ("redirect_uri", &self.config.redirect_uri),
            ("refresh_token", refresh_token),
        ])
        .await
    }

    #[instrument(level = "debug", skip_all)]
    async fn remote_account(&self, access_token: &str) -> Result<RemoteAccount> {
        let response = self
            .client
            .get(self.endpoint(&format!("/oauth/v1/access-tokens/{access_token}")))
            .header("Accept", "application/json")
            .send()
            .await?;
        let info: AccessTokenInfo = read_json(response, "access token lookup").await?;
        Ok(RemoteAccount {
            portal_id: info.hub_id.map(|id| id.to_string()),
            domain: info.hub_domain,
            account_name: None,
        })
    }

    #[instrument(level = "debug", skip(self, access_token, properties))]
    async fn update_record(
        &self,
        access_token: &str,
        record_id: &str,
        properties: &BTreeMap<String, String>,
    ) -> Result<()> {
        let response = self
            .client
            .patch(self.endpoint(&format!("/crm/v3/objects/contacts/{record_id}")))
            .bearer_auth(access_token)
            .json(&UpdateRequest { properties })
            .send()
            .await?;
        expect_success(response, "contact update").await
    }

    #[instrument(level = "debug", skip(self, access_token))]
    async fn merge_records(
        &self,
        access_token: &str,
        keep_record_id: &str,
        retire_record_id: &str,
    ) -> Result<()> {
        let response = self
            .client
            .post(self.endpoint("/crm/v3/objects/contacts/merge"))
            .bearer_auth(access_token)
            .json(&MergeRequest {
                primary_object_id: keep_record_id,
                object_id_to_merge: retire_record_id,
            })
            .send()
            .await?;
        expect_success(response, "contact merge").await
    }
}

async fn expect_success(response: reqwest::Response, what: &str) -> Result<()> {
    if response.status().is_success() {
        return Ok(());
    }
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    Err(Error::Crm(format!(
        "{what} failed with HTTP {status}: {}",
        compact_text(&body)
    )))
}

async fn read_json<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
    what: &str,
) -> Result<T> {
    if !response.status().is_success() {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        return Err(Error::Crm(format!(
            "{what} failed with HTTP {status}: {}",
            compact_text(&body)
        )));
    }
    response
        .json::<T>()
        .await
        .map_err(|error| Error::Crm(format!("{what} parse failed: {}", sanitize(&error))))
}
