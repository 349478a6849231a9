//! Process run model

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Phase of an import/merge session
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Importing,
    ReadyToMerge,
    Finished,
}

impl RunPhase {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Importing => "importing",
            Self::ReadyToMerge => "ready_to_merge",
            Self::Finished => "finished",
        }
    }

    /// Forward by exactly one step; backwards only through an explicit re-run.
    #[must_use]
    pub const fn can_advance_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Importing, Self::ReadyToMerge) | (Self::ReadyToMerge, Self::Finished)
        )
    }
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunPhase {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "importing" => Ok(Self::Importing),
            "ready_to_merge" => Ok(Self::ReadyToMerge),
            "finished" => Ok(Self::Finished),
            other => Err(Error::Database(format!("Unknown run phase '{other}'"))),
        }
    }
}

/// One import/resolve session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessRun {
    pub run_key: String,
    pub account_id: String,
    pub display_name: String,
    pub phase: RunPhase,
    pub export_reference: Option<String>,
    /// Unix ms
    pub created_at: i64,
    /// Unix ms
    pub updated_at: i64,
}

/// Status snapshot polled by clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStatus {
    pub run_key: String,
    pub display_name: String,
    pub phase: RunPhase,
    pub total_groups: u64,
    pub merged_groups: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub export_reference: Option<String>,
}
