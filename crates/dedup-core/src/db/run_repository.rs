//! Process run repository implementation

use crate::error::Result;
use crate::models::{AccountId, ProcessRun, RunPhase};
use libsql::Connection;

const RUN_COLUMNS: &str =
    "run_key, account_id, display_name, phase, export_reference, created_at, updated_at";

/// Trait for process run storage operations (async)
#[allow(async_fn_in_trait)]
pub trait RunRepository {
    /// Create a run in the `Importing` phase
    async fn create(
        &self,
        account_id: &AccountId,
        run_key: &str,
        display_name: &str,
    ) -> Result<ProcessRun>;

    /// Get a run by key
    async fn get(&self, run_key: &str) -> Result<Option<ProcessRun>>;

    /// Move a run from `from` to `to`; `false` if the run was not in `from`
    async fn transition(&self, run_key: &str, from: RunPhase, to: RunPhase) -> Result<bool>;

    /// Store the export reference and move the run from `ReadyToMerge` to `Finished`;
    /// `false` if the run was in another phase or still has pending groups
    async fn finish(&self, run_key: &str, export_reference: &str) -> Result<bool>;
}

/// libSQL implementation of `RunRepository`
pub struct LibSqlRunRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlRunRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn parse_run(row: &libsql::Row) -> Result<ProcessRun> {
        let phase: String = row.get(3)?;
        Ok(ProcessRun {
            run_key: row.get(0)?,
            account_id: row.get(1)?,
            display_name: row.get(2)?,
            phase: phase.parse()?,
            export_reference: row.get(4)?,
            created_at: row.get(5)?,
            updated_at: row.get(6)?,
        })
    }
}

impl RunRepository for LibSqlRunRepository<'_> {
    async fn create(
        &self,
        account_id: &AccountId,
        run_key: &str,
        display_name: &str,
    ) -> Result<ProcessRun> {
        let now = chrono::Utc::now().timestamp_millis();
        let run = ProcessRun {
            run_key: run_key.to_string(),
            account_id: account_id.as_str(),
            display_name: display_name.to_string(),
            phase: RunPhase::Importing,
            export_reference: None,
            created_at: now,
            updated_at: now,
        };

        self.conn
            .execute(
                &format!("INSERT INTO process_runs ({RUN_COLUMNS}) VALUES (?, ?, ?, ?, NULL, ?, ?)"),
                libsql::params![
                    run.run_key.clone(),
                    run.account_id.clone(),
                    run.display_name.clone(),
                    run.phase.as_str(),
                    run.created_at,
                    run.updated_at
                ],
            )
            .await?;
        Ok(run)
    }

    async fn get(&self, run_key: &str) -> Result<Option<ProcessRun>> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {RUN_COLUMNS} FROM process_runs WHERE run_key = ?"),
                [run_key],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(Self::parse_run(&row)?)),
            None => Ok(None),
        }
    }

    async fn transition(&self, run_key: &str, from: RunPhase, to: RunPhase) -> Result<bool> {
        let now = chrono::Utc::now().timestamp_millis();
        let rows = self
            .conn
            .execute(
                "UPDATE process_runs SET phase = ?, updated_at = ?
                 WHERE run_key = ? AND phase = ?",
                libsql::params![to.as_str(), now, run_key, from.as_str()],
            )
            .await?;
        Ok(rows > 0)
    }

    async fn finish(&self, run_key: &str, export_reference: &str) -> Result<bool> {
        let now = chrono::Utc::now().timestamp_millis();
        let rows = self
            .conn
            .execute(
                "UPDATE process_runs
                 SET phase = ?, export_reference = ?, updated_at = ?
                 WHERE run_key = ? AND phase = ?
                   AND NOT EXISTS (
                       SELECT 1 FROM duplicate_groups
                       WHERE duplicate_groups.run_key = process_runs.run_key
                         AND duplicate_groups.merged = 0
                   )",
                libsql::params![
                    RunPhase::Finished.as_str(),
                    export_reference,
                    now,
                    run_key,
                    RunPhase::ReadyToMerge.as_str()
                ],
            )
            .await?;
        Ok(rows > 0)
    }
}
