use std::collections::HashMap;
use std::env;
use std::fmt;
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::time::Duration;

use dedup_core::crm::HubSpotConfig;
use dedup_core::merge::MAX_PAGE_SIZE;
use dedup_core::{LifecycleConfig, MergeConfig, OAuthSettings};
use thiserror::Error;

const DEFAULT_SCOPES: &str = "oauth crm.objects.contacts.read crm.objects.contacts.write";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(&'static str),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    pub database_path: PathBuf,
    pub export_dir: PathBuf,
    pub crm_client_id: String,
    pub crm_client_secret: String,
    pub crm_redirect_uri: String,
    pub crm_api_base_url: String,
    pub crm_authorize_url: String,
    pub crm_scopes: Vec<String>,
    pub crm_timeout: Duration,
    pub token_refresh_margin: Duration,
    pub oauth_state_secret: String,
    pub oauth_state_ttl: Duration,
    pub app_redirect_url: String,
    pub plan_merge_group_limit: Option<u64>,
}

impl fmt::Debug for AppConfig {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("AppConfig")
            .field("bind_addr", &self.bind_addr)
            .field("database_path", &self.database_path)
            .field("export_dir", &self.export_dir)
            .field("crm_client_id", &self.crm_client_id)
            .field("crm_client_secret", &"[REDACTED]")
            .field("crm_redirect_uri", &self.crm_redirect_uri)
            .field("crm_api_base_url", &self.crm_api_base_url)
            .field("crm_authorize_url", &self.crm_authorize_url)
            .field("crm_scopes", &self.crm_scopes)
            .field("crm_timeout", &self.crm_timeout)
            .field("token_refresh_margin", &self.token_refresh_margin)
            .field("oauth_state_secret", &"[REDACTED]")
            .field("oauth_state_ttl", &self.oauth_state_ttl)
            .field("app_redirect_url", &self.app_redirect_url)
            .field("plan_merge_group_limit", &self.plan_merge_group_limit)
            .finish()
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let bind_addr = value_or_default(&lookup, "DEDUP_API_BIND_ADDR", "127.0.0.1:8080");
        let database_path =
            PathBuf::from(value_or_default(&lookup, "DEDUP_DATABASE_PATH", "dedup.db"));
        let export_dir = PathBuf::from(value_or_default(&lookup, "DEDUP_EXPORT_DIR", "exports"));

        let crm_client_id = required_trimmed(&lookup, "CRM_CLIENT_ID")?;
        let crm_client_secret = required_trimmed(&lookup, "CRM_CLIENT_SECRET")?;
        let crm_redirect_uri = required_url(&lookup, "CRM_REDIRECT_URI")?;

        let crm_api_base_url = value_or_default(&lookup, "CRM_API_BASE_URL", "https://api.hubapi.com");
        if !is_http_url(&crm_api_base_url) {
            return Err(ConfigError::Invalid(
                "CRM_API_BASE_URL must start with http:// or https://".to_string(),
            ));
        }
        let crm_api_base_url = trim_trailing(&crm_api_base_url).to_string();

        let crm_authorize_url = value_or_default(
            &lookup,
            "CRM_AUTHORIZE_URL",
            "https://app.hubspot.com/oauth/authorize",
        );
        if !is_http_url(&crm_authorize_url) {
            return Err(ConfigError::Invalid(
                "CRM_AUTHORIZE_URL must start with http:// or https://".to_string(),
            ));
        }

        let crm_scopes = value_or_default(&lookup, "CRM_SCOPES", DEFAULT_SCOPES)
            .split([' ', ','])
            .map(str::trim)
            .filter(|scope| !scope.is_empty())
            .map(str::to_string)
            .collect::<Vec<_>>();

        let crm_timeout = ranged_secs(&lookup, "CRM_TIMEOUT_SECS", 20, 1..=120)?;
        let token_refresh_margin =
            ranged_secs(&lookup, "TOKEN_REFRESH_MARGIN_SECS", 300, 60..=3_600)?;
        let oauth_state_ttl = ranged_secs(&lookup, "OAUTH_STATE_TTL_SECS", 600, 60..=3_600)?;

        let oauth_state_secret = required_trimmed(&lookup, "OAUTH_STATE_SECRET")?;
        if oauth_state_secret.len() < dedup_core::connection::oauth_state::MIN_STATE_SECRET_LEN {
            return Err(ConfigError::Invalid(
                "OAUTH_STATE_SECRET must be at least 32 characters".to_string(),
            ));
        }

        let app_redirect_url = required_url(&lookup, "APP_REDIRECT_URL")?;

        let plan_merge_group_limit = optional_trimmed(&lookup, "PLAN_MERGE_GROUP_LIMIT")
            .map(|value| {
                value.parse::<u64>().map_err(|_| {
                    ConfigError::Invalid(
                        "PLAN_MERGE_GROUP_LIMIT must be a non-negative integer".to_string(),
                    )
                })
            })
            .transpose()?;

        Ok(Self {
            bind_addr,
            database_path,
            export_dir,
            crm_client_id,
            crm_client_secret,
            crm_redirect_uri,
            crm_api_base_url,
            crm_authorize_url,
            crm_scopes,
            crm_timeout,
            token_refresh_margin,
            oauth_state_secret,
            oauth_state_ttl,
            app_redirect_url,
            plan_merge_group_limit,
        })
    }

    pub fn hubspot_config(&self) -> HubSpotConfig {
        HubSpotConfig {
            client_id: self.crm_client_id.clone(),
            client_secret: self.crm_client_secret.clone(),
            redirect_uri: self.crm_redirect_uri.clone(),
            scopes: self.crm_scopes.clone(),
            api_base_url: self.crm_api_base_url.clone(),
            authorize_url: self.crm_authorize_url.clone(),
            timeout: self.crm_timeout,
        }
    }

    pub fn oauth_settings(&self) -> Result<OAuthSettings, ConfigError> {
        OAuthSettings::new(self.oauth_state_secret.clone(), self.oauth_state_ttl)
            .map_err(|error| ConfigError::Invalid(error.to_string()))
    }

    pub const fn lifecycle_config(&self) -> LifecycleConfig {
        LifecycleConfig {
            refresh_margin: self.token_refresh_margin,
            crm_timeout: self.crm_timeout,
        }
    }

    pub const fn merge_config(&self) -> MergeConfig {
        MergeConfig {
            crm_timeout: self.crm_timeout,
            max_page_size: MAX_PAGE_SIZE,
        }
    }
}

fn ranged_secs(
    lookup: impl Fn(&str) -> Option<String>,
    name: &str,
    default: u64,
    range: RangeInclusive<u64>,
) -> Result<Duration, ConfigError> {
    let secs = match optional_trimmed(lookup, name) {
        Some(value) => value.parse::<u64>().map_err(|_| {
            ConfigError::Invalid(format!(
                "{name} must be an integer in [{}, {}]",
                range.start(),
                range.end()
            ))
        })?,
        None => default,
    };
    if !range.contains(&secs) {
        return Err(ConfigError::Invalid(format!(
            "{name} must be in [{}, {}]",
            range.start(),
            range.end()
        )));
    }
    Ok(Duration::from_secs(secs))
}

fn required_url(
    lookup: impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<String, ConfigError> {
    let value = required_trimmed(&lookup, name)?;
    if url::Url::parse(&value).is_err() || !is_http_url(&value) {
        return Err(ConfigError::Invalid(format!(
            "{name} must be an absolute http:// or https:// URL"
        )));
    }
    Ok(value)
}

fn value_or_default(lookup: impl Fn(&str) -> Option<String>, name: &str, default: &str) -> String {
    optional_trimmed(lookup, name).unwrap_or_else(|| default.to_string())
}

fn required_trimmed(
    lookup: impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<String, ConfigError> {
    optional_trimmed(lookup, name).ok_or(ConfigError::MissingVar(name))
}

fn optional_trimmed(lookup: impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    dedup_core::util::normalize_text_option(lookup(name))
}

fn is_http_url(value: &str) -> bool {
    dedup_core::util::is_http_url(value)
}

fn trim_trailing(value: &str) -> &str {
    value.trim_end_matches('/')
}
