//! Duplicate group model and its membership transitions

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// One contact record that may be a duplicate of the others in its group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateRecord {
    /// CRM-side record id
    pub record_id: String,
    /// Last modification in the CRM (Unix ms)
    pub last_modified_at: i64,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl CandidateRecord {
    #[must_use]
    pub fn new(record_id: impl Into<String>, last_modified_at: i64) -> Self {
        Self {
            record_id: record_id.into(),
            last_modified_at,
            first_name: None,
            last_name: None,
            email: None,
            company: None,
            properties: BTreeMap::new(),
        }
    }

    /// "First Last", falling back to the email and then the record id.
    #[must_use]
    pub fn display_name(&self) -> String {
        let name = [self.first_name.as_deref(), self.last_name.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        if !name.is_empty() {
            return name;
        }
        self.email
            .clone()
            .unwrap_or_else(|| self.record_id.clone())
    }
}

/// Resolution state derived from a group's membership
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupState {
    /// Untouched, two or more members
    Pending,
    /// At least one member retired, still more than one left
    PartiallyReduced,
    /// Exactly one member left; terminal
    Merged,
}

/// A cluster of candidate records believed to be the same contact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateGroup {
    pub id: i64,
    pub run_key: String,
    /// Order within the run as ingested
    pub position: i64,
    pub original_members: Vec<CandidateRecord>,
    pub members: Vec<CandidateRecord>,
    pub merged: bool,
    pub retained_record_id: Option<String>,
    /// Bumped on every persisted mutation
    pub version: i64,
    /// Unix ms
    pub created_at: i64,
    /// Unix ms
    pub updated_at: i64,
}

impl DuplicateGroup {
    #[must_use]
    pub fn state(&self) -> GroupState {
        if self.is_terminal() {
            GroupState::Merged
        } else if self.members.len() < self.original_members.len() {
            GroupState::PartiallyReduced
        } else {
            GroupState::Pending
        }
    }

    /// A group with a single remaining member needs no further action.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.members.len() <= 1
    }

    #[must_use]
    pub fn contains(&self, record_id: &str) -> bool {
        self.members.iter().any(|record| record.record_id == record_id)
    }

    /// Original members that are no longer part of the group, in original order.
    #[must_use]
    pub fn retired_record_ids(&self) -> Vec<String> {
        self.original_members
            .iter()
            .filter(|record| !self.contains(&record.record_id))
            .map(|record| record.record_id.clone())
            .collect()
    }

    /// Check a pairwise merge against the current membership without changing anything.
    pub fn validate_merge(&self, keep_record_id: &str, retire_record_id: &str) -> Result<()> {
        if keep_record_id == retire_record_id {
            return Err(Error::SameRecord);
        }
        if !self.contains(keep_record_id) || !self.contains(retire_record_id) {
            return Err(Error::RecordNotInGroup);
        }
        Ok(())
    }

    /// Membership after `retire_record_id` has been folded into `keep_record_id`.
    pub fn after_merge(&self, keep_record_id: &str, retire_record_id: &str) -> Result<Self> {
        self.validate_merge(keep_record_id, retire_record_id)?;

        let mut next = self.clone();
        next.members
            .retain(|record| record.record_id != retire_record_id);
        next.retained_record_id = Some(keep_record_id.to_string());
        next.merged = next.is_terminal();
        Ok(next)
    }

    /// Membership after an operator decided `record_id` is not a duplicate.
    pub fn after_removal(&self, record_id: &str) -> Result<Self> {
        if !self.contains(record_id) {
            return Err(Error::RecordNotInGroup);
        }
        if self.members.len() == 1 {
            return Err(Error::InvalidInput(
                "Cannot remove the last remaining record of a group".to_string(),
            ));
        }

        let mut next = self.clone();
        next.members.retain(|record| record.record_id != record_id);
        if next.retained_record_id.as_deref() == Some(record_id) {
            next.retained_record_id = None;
        }
        if next.is_terminal() {
            next.merged = true;
            next.retained_record_id = next.members.first().map(|record| record.record_id.clone());
        }
        Ok(next)
    }

    /// Original membership with merge bookkeeping cleared.
    #[must_use]
    pub fn after_reset(&self) -> Self {
        let mut next = self.clone();
        next.members = self.original_members.clone();
        next.merged = false;
        next.retained_record_id = None;
        next
    }
}

/// A request to fold one group member into another
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeCommand {
    pub keep_record_id: String,
    pub retire_record_id: String,
    /// Property values written to the kept record before merging
    #[serde(default)]
    pub field_values: BTreeMap<String, String>,
}

impl MergeCommand {
    #[must_use]
    pub fn new(keep_record_id: impl Into<String>, retire_record_id: impl Into<String>) -> Self {
        Self {
            keep_record_id: keep_record_id.into(),
            retire_record_id: retire_record_id.into(),
            field_values: BTreeMap::new(),
        }
    }
}

/// One page of groups in creation order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupPage {
    pub groups: Vec<DuplicateGroup>,
    pub page: u32,
    pub page_size: u32,
    pub total_groups: u64,
    pub total_pages: u64,
}

/// Kind of mutation recorded in the merge audit trail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Merge,
    Remove,
    Reset,
}

impl AuditAction {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Merge => "merge",
            Self::Remove => "remove",
            Self::Reset => "reset",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "merge" => Some(Self::Merge),
            "remove" => Some(Self::Remove),
            "reset" => Some(Self::Reset),
            _ => None,
        }
    }
}

/// Recorded group mutation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeAuditEntry {
    pub id: i64,
    pub group_id: i64,
    pub action: AuditAction,
    pub kept_record_id: Option<String>,
    pub retired_record_id: Option<String>,
    pub field_values: BTreeMap<String, String>,
    pub account_id: String,
    /// Unix ms
    pub created_at: i64,
}
