//! Error types for dedup-core

use thiserror::Error;

/// Result type alias using dedup-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in dedup-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// The CRM rejected (or never answered) an authorization code exchange
    #[error("Authorization exchange failed: {0}")]
    AuthExchangeFailed(String),

    /// OAuth state token could not be parsed, expired, was reused, or names an unknown account
    #[error("Invalid authorization state: {0}")]
    InvalidState(String),

    /// No active CRM connection exists for the account
    #[error("No active CRM connection for this account")]
    NotConnected,

    /// The stored credential could not be refreshed; the operator must reconnect
    #[error("CRM connection must be re-authorized: {0}")]
    ReconnectRequired(String),

    /// A referenced record is not (or no longer) a member of the group
    #[error("Record is not a member of this group")]
    RecordNotInGroup,

    /// Keep and retire reference the same record
    #[error("Cannot merge a record into itself")]
    SameRecord,

    /// Group does not exist
    #[error("Duplicate group not found: {0}")]
    GroupNotFound(i64),

    /// The CRM merge call failed or timed out; local state is untouched
    #[error("Merge failed: {0}")]
    MergeFailed(String),

    /// Some groups of the run are not terminal yet
    #[error("{0} group(s) still pending")]
    GroupsPending(usize),

    /// Page and page size must be positive
    #[error("Page and page size must be positive")]
    InvalidPage,

    /// The account's plan does not permit the action
    #[error("Plan limit reached: {0}")]
    PlanLimitReached(String),

    /// A run phase transition that would move backwards or skip
    #[error("Cannot move run from {from} to {to}")]
    InvalidPhaseTransition {
        from: &'static str,
        to: &'static str,
    },

    /// Group membership only changes while its run is ready to merge
    #[error("Run is {0}; groups can only change while it is ready to merge")]
    RunNotReady(&'static str),

    /// Generic lookup miss (accounts, runs)
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// libSQL error
    #[error("libSQL error: {0}")]
    LibSql(#[from] libsql::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The CRM answered with an unsuccessful status or an unreadable body
    #[error("CRM request failed: {0}")]
    Crm(String),

    /// HTTP transport error
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
}

impl Error {
    /// Stable machine-readable name for API clients.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::AuthExchangeFailed(_) => "auth_exchange_failed",
            Self::InvalidState(_) => "invalid_state",
            Self::NotConnected => "not_connected",
            Self::ReconnectRequired(_) => "reconnect_required",
            Self::RecordNotInGroup => "record_not_in_group",
            Self::SameRecord => "same_record",
            Self::GroupNotFound(_) => "group_not_found",
            Self::MergeFailed(_) => "merge_failed",
            Self::GroupsPending(_) => "groups_pending",
            Self::InvalidPage => "invalid_page",
            Self::PlanLimitReached(_) => "plan_limit_reached",
            Self::InvalidPhaseTransition { .. } => "invalid_phase_transition",
            Self::RunNotReady(_) => "run_not_ready",
            Self::NotFound(_) => "not_found",
            Self::InvalidInput(_) => "invalid_input",
            Self::Database(_) | Self::LibSql(_) | Self::Io(_) | Self::Serialization(_) => {
                "internal"
            }
            Self::Crm(_) | Self::Http(_) => "upstream",
        }
    }

    /// Whether the operator has to go through the authorization flow again.
    #[must_use]
    pub const fn requires_reauthorization(&self) -> bool {
        matches!(self, Self::NotConnected | Self::ReconnectRequired(_))
    }

    /// Whether the client's view of a group is out of date and should be reloaded.
    #[must_use]
    pub const fn is_stale_view(&self) -> bool {
        matches!(
            self,
            Self::RecordNotInGroup | Self::SameRecord | Self::GroupNotFound(_)
        )
    }
}
