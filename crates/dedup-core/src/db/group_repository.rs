//! Duplicate group repository implementation

#![allow(clippy::cast_possible_wrap)] // SQLite uses i64 for LIMIT/OFFSET

use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::models::{AuditAction, CandidateRecord, DuplicateGroup, MergeAuditEntry, RunPhase};
use libsql::Connection;

const GROUP_COLUMNS: &str = "id, run_key, position, original_members, members, merged, \
     retained_record_id, version, created_at, updated_at";

/// Audit row to write alongside a group transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAuditEntry {
    pub action: AuditAction,
    pub kept_record_id: Option<String>,
    pub retired_record_id: Option<String>,
    pub field_values: BTreeMap<String, String>,
    pub account_id: String,
}

/// Trait for duplicate group storage operations (async)
#[allow(async_fn_in_trait)]
pub trait GroupRepository {
    /// Insert one group per cluster, preserving cluster order; returns the number inserted
    async fn insert_groups(&self, run_key: &str, clusters: &[Vec<CandidateRecord>])
        -> Result<usize>;

    /// Get a group by ID
    async fn get(&self, id: i64) -> Result<Option<DuplicateGroup>>;

    /// List a run's groups in creation order
    async fn list(&self, run_key: &str, limit: usize, offset: usize) -> Result<Vec<DuplicateGroup>>;

    /// Number of groups in a run
    async fn count(&self, run_key: &str) -> Result<u64>;

    /// Number of terminal (merged) groups in a run
    async fn count_merged(&self, run_key: &str) -> Result<u64>;

    /// Persist `next` if the stored version still equals `next.version`, and write the audit row.
    ///
    /// Returns the stored group on success, `None` if another writer got there first
    /// or the run is no longer ready to merge.
    async fn commit_transition(
        &self,
        next: &DuplicateGroup,
        audit: &NewAuditEntry,
    ) -> Result<Option<DuplicateGroup>>;

    /// Audit trail of a group, oldest first
    async fn audit_for(&self, group_id: i64) -> Result<Vec<MergeAuditEntry>>;
}

/// libSQL implementation of `GroupRepository`
pub struct LibSqlGroupRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlGroupRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Parse a group from a database row
    fn parse_group(row: &libsql::Row) -> Result<DuplicateGroup> {
        let original_members: String = row.get(3)?;
        let members: String = row.get(4)?;
        Ok(DuplicateGroup {
            id: row.get(0)?,
            run_key: row.get(1)?,
            position: row.get(2)?,
            original_members: serde_json::from_str(&original_members)?,
            members: serde_json::from_str(&members)?,
            merged: row.get::<i64>(5)? != 0,
            retained_record_id: row.get(6)?,
            version: row.get(7)?,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
        })
    }

    fn parse_audit(row: &libsql::Row) -> Result<MergeAuditEntry> {
        let action: String = row.get(2)?;
        let field_values: String = row.get(5)?;
        Ok(MergeAuditEntry {
            id: row.get(0)?,
            group_id: row.get(1)?,
            action: AuditAction::parse(&action)
                .ok_or_else(|| Error::Database(format!("Unknown audit action '{action}'")))?,
            kept_record_id: row.get(3)?,
            retired_record_id: row.get(4)?,
            field_values: serde_json::from_str(&field_values)?,
            account_id: row.get(6)?,
            created_at: row.get(7)?,
        })
    }

    fn read_count(row: Option<libsql::Row>) -> Result<u64> {
        let count: i64 = match row {
            Some(row) => row.get(0)?,
            None => 0,
        };
        Ok(u64::try_from(count).unwrap_or(0))
    }

    async fn next_position(&self, run_key: &str) -> Result<i64> {
        let mut rows = self
            .conn
            .query(
                "SELECT COALESCE(MAX(position) + 1, 0) FROM duplicate_groups WHERE run_key = ?",
                [run_key],
            )
            .await?;
        Ok(match rows.next().await? {
            Some(row) => row.get(0)?,
            None => 0,
        })
    }

    async fn insert_all(&self, run_key: &str, clusters: &[Vec<CandidateRecord>]) -> Result<usize> {
        let start = self.next_position(run_key).await?;
        let now = chrono::Utc::now().timestamp_millis();

        for (offset, cluster) in clusters.iter().enumerate() {
            let members = serde_json::to_string(cluster)?;
            self.conn
                .execute(
                    &format!(
                        "INSERT INTO duplicate_groups ({GROUP_COLUMNS})
                         VALUES (NULL, ?, ?, ?, ?, 0, NULL, 0, ?, ?)"
                    ),
                    libsql::params![
                        run_key,
                        start + offset as i64,
                        members.clone(),
                        members,
                        now,
                        now
                    ],
                )
                .await?;
        }
        Ok(clusters.len())
    }

    async fn write_transition(
        &self,
        next: &DuplicateGroup,
        audit: &NewAuditEntry,
        now: i64,
    ) -> Result<bool> {
        let rows = self
            .conn
            .execute(
                "UPDATE duplicate_groups
                 SET members = ?, merged = ?, retained_record_id = ?,
                     version = version + 1, updated_at = ?
                 WHERE id = ? AND version = ?
                   AND EXISTS (
                       SELECT 1 FROM process_runs
                       WHERE process_runs.run_key = duplicate_groups.run_key
                         AND process_runs.phase = ?
                   )",
                libsql::params![
                    serde_json::to_string(&next.members)?,
                    i64::from(next.merged),
                    next.retained_record_id.clone(),
                    now,
                    next.id,
                    next.version,
                    RunPhase::ReadyToMerge.as_str()
                ],
            )
            .await?;

        if rows == 0 {
            return Ok(false);
        }

        self.conn
            .execute(
                "INSERT INTO merge_audit (
                    group_id, action, kept_record_id, retired_record_id,
                    field_values, account_id, created_at
                 ) VALUES (?, ?, ?, ?, ?, ?, ?)",
                libsql::params![
                    next.id,
                    audit.action.as_str(),
                    audit.kept_record_id.clone(),
                    audit.retired_record_id.clone(),
                    serde_json::to_string(&audit.field_values)?,
                    audit.account_id.clone(),
                    now
                ],
            )
            .await?;
        Ok(true)
    }
}

impl GroupRepository for LibSqlGroupRepository<'_> {
    async fn insert_groups(
        &self,
        run_key: &str,
        clusters: &[Vec<CandidateRecord>],
    ) -> Result<usize> {
        self.conn.execute("BEGIN IMMEDIATE", ()).await?;

        let inserted = match self.insert_all(run_key, clusters).await {
            Ok(inserted) => inserted,
            Err(e) => {
                self.conn.execute("ROLLBACK", ()).await.ok();
                return Err(e);
            }
        };

        if let Err(e) = self.conn.execute("COMMIT", ()).await {
            self.conn.execute("ROLLBACK", ()).await.ok();
            return Err(e.into());
        }
        Ok(inserted)
    }

    async fn get(&self, id: i64) -> Result<Option<DuplicateGroup>> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {GROUP_COLUMNS} FROM duplicate_groups WHERE id = ?"),
                [id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(Self::parse_group(&row)?)),
            None => Ok(None),
        }
    }

    async fn list(
        &self,
        run_key: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<DuplicateGroup>> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {GROUP_COLUMNS} FROM duplicate_groups
                     WHERE run_key = ?
                     ORDER BY id ASC
                     LIMIT ? OFFSET ?"
                ),
                libsql::params![run_key, limit as i64, offset as i64],
            )
            .await?;

        let mut groups = Vec::new();
        while let Some(row) = rows.next().await? {
            groups.push(Self::parse_group(&row)?);
        }
        Ok(groups)
    }

    async fn count(&self, run_key: &str) -> Result<u64> {
        let mut rows = self
            .conn
            .query(
                "SELECT COUNT(*) FROM duplicate_groups WHERE run_key = ?",
                [run_key],
            )
            .await?;
        Self::read_count(rows.next().await?)
    }

    async fn count_merged(&self, run_key: &str) -> Result<u64> {
        let mut rows = self
            .conn
            .query(
                "SELECT COUNT(*) FROM duplicate_groups WHERE run_key = ? AND merged = 1",
                [run_key],
            )
            .await?;
        Self::read_count(rows.next().await?)
    }

    async fn commit_transition(
        &self,
        next: &DuplicateGroup,
        audit: &NewAuditEntry,
    ) -> Result<Option<DuplicateGroup>> {
        let now = chrono::Utc::now().timestamp_millis();
        self.conn.execute("BEGIN IMMEDIATE", ()).await?;

        let written = match self.write_transition(next, audit, now).await {
            Ok(written) => written,
            Err(e) => {
                self.conn.execute("ROLLBACK", ()).await.ok();
                return Err(e);
            }
        };

        if !written {
            self.conn.execute("ROLLBACK", ()).await.ok();
            return Ok(None);
        }

        if let Err(e) = self.conn.execute("COMMIT", ()).await {
            self.conn.execute("ROLLBACK", ()).await.ok();
            return Err(e.into());
        }

        self.get(next.id).await
    }

    async fn audit_for(&self, group_id: i64) -> Result<Vec<MergeAuditEntry>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, group_id, action, kept_record_id, retired_record_id,
                        field_values, account_id, created_at
                 FROM merge_audit
                 WHERE group_id = ?
                 ORDER BY id ASC",
                [group_id],
            )
            .await?;

        let mut entries = Vec::new();
        while let Some(row) = rows.next().await? {
            entries.push(Self::parse_audit(&row)?);
        }
        Ok(entries)
    }
}
