//! Run phases and live progress counts for polling clients.

use std::collections::HashSet;

use crate::error::{Error, Result};
use crate::models::{AccountId, CandidateRecord, ProcessRun, RunPhase, RunStatus};
use crate::services::DatabaseService;

#[derive(Clone)]
pub struct StatusTracker {
    db: DatabaseService,
}

impl StatusTracker {
    pub const fn new(db: DatabaseService) -> Self {
        Self { db }
    }

    async fn run(&self, run_key: &str) -> Result<ProcessRun> {
        self.db
            .get_run(run_key)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Run {run_key}")))
    }

    /// The run, provided it belongs to `account_id`.
    pub async fn owned_run(&self, account_id: &AccountId, run_key: &str) -> Result<ProcessRun> {
        let run = self.run(run_key).await?;
        if run.account_id != account_id.as_str() {
            return Err(Error::NotFound(format!("Run {run_key}")));
        }
        Ok(run)
    }

    /// Open a new run in the `Importing` phase.
    pub async fn start_run(
        &self,
        account_id: &AccountId,
        run_key: &str,
        display_name: &str,
    ) -> Result<ProcessRun> {
        let run_key = run_key.trim();
        if run_key.is_empty() {
            return Err(Error::InvalidInput("Run key cannot be empty".to_string()));
        }
        if !self.db.account_exists(account_id).await? {
            return Err(Error::NotFound(format!("Account {account_id}")));
        }
        if self.db.get_run(run_key).await?.is_some() {
            return Err(Error::InvalidInput(format!("Run {run_key} already exists")));
        }

        let display_name = match display_name.trim() {
            "" => run_key,
            name => name,
        };
        let run = self.db.create_run(account_id, run_key, display_name).await?;
        tracing::info!(account_id = %account_id, run_key, "Run started");
        Ok(run)
    }

    /// Store pre-clustered candidates as groups. Clusters with fewer than two
    /// distinct records are skipped; returns how many groups were created.
    pub async fn ingest_groups(
        &self,
        run_key: &str,
        clusters: Vec<Vec<CandidateRecord>>,
    ) -> Result<usize> {
        let run = self.run(run_key).await?;
        if run.phase != RunPhase::Importing {
            return Err(Error::InvalidInput(format!(
                "Run {run_key} is {}; groups can only be added while importing",
                run.phase
            )));
        }

        let clusters: Vec<Vec<CandidateRecord>> = clusters
            .into_iter()
            .map(distinct_records)
            .filter(|cluster| cluster.len() >= 2)
            .collect();
        let inserted = self.db.insert_groups(run_key, &clusters).await?;
        tracing::info!(run_key, inserted, "Ingested duplicate groups");
        Ok(inserted)
    }

    /// `Importing -> ReadyToMerge`.
    pub async fn mark_ready(&self, run_key: &str) -> Result<ProcessRun> {
        self.advance(run_key, RunPhase::ReadyToMerge).await
    }

    /// Explicit re-run: back to `Importing`. Existing groups stay for audit.
    pub async fn restart_run(&self, run_key: &str) -> Result<ProcessRun> {
        let run = self.run(run_key).await?;
        if run.phase == RunPhase::Importing {
            return Ok(run);
        }
        if !self
            .db
            .transition_run(run_key, run.phase, RunPhase::Importing)
            .await?
        {
            return Err(Error::InvalidPhaseTransition {
                from: run.phase.as_str(),
                to: RunPhase::Importing.as_str(),
            });
        }
        tracing::info!(run_key, from = %run.phase, "Run restarted");
        self.run(run_key).await
    }

    async fn advance(&self, run_key: &str, to: RunPhase) -> Result<ProcessRun> {
        let run = self.run(run_key).await?;
        if !run.phase.can_advance_to(to) {
            return Err(Error::InvalidPhaseTransition {
                from: run.phase.as_str(),
                to: to.as_str(),
            });
        }
        if !self.db.transition_run(run_key, run.phase, to).await? {
            let current = self.run(run_key).await?;
            return Err(Error::InvalidPhaseTransition {
                from: current.phase.as_str(),
                to: to.as_str(),
            });
        }
        tracing::info!(run_key, phase = %to, "Run advanced");
        self.run(run_key).await
    }

    /// Phase plus live group counts. Always read from storage.
    pub async fn status(&self, run_key: &str) -> Result<RunStatus> {
        let run = self.run(run_key).await?;
        let (total_groups, merged_groups) = self.db.group_counts(run_key).await?;
        Ok(RunStatus {
            run_key: run.run_key,
            display_name: run.display_name,
            phase: run.phase,
            total_groups,
            merged_groups,
            export_reference: run.export_reference,
        })
    }
}

fn distinct_records(cluster: Vec<CandidateRecord>) -> Vec<CandidateRecord> {
    let mut seen = HashSet::new();
    cluster
        .into_iter()
        .filter(|record| !record.record_id.trim().is_empty())
        .filter(|record| seen.insert(record.record_id.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::models::MergeCommand;

    async fn setup() -> (StatusTracker, DatabaseService, AccountId) {
        let db = DatabaseService::open_in_memory().await.unwrap();
        let account = db.create_account("Acme").await.unwrap();
        (StatusTracker::new(db.clone()), db, account.id)
    }

    fn cluster(ids: &[&str]) -> Vec<CandidateRecord> {
        ids.iter().map(|id| CandidateRecord::new(*id, 0)).collect()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn start_run_rejects_duplicates_and_unknown_accounts() {
        let (tracker, _db, account_id) = setup().await;

        let run = tracker.start_run(&account_id, "run-1", "  ").await.unwrap();
        assert_eq!(run.phase, RunPhase::Importing);
        assert_eq!(run.display_name, "run-1");

        assert!(matches!(
            tracker.start_run(&account_id, "run-1", "Again").await,
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            tracker.start_run(&AccountId::new(), "run-2", "x").await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn ingest_skips_clusters_without_real_duplicates() {
        let (tracker, _db, account_id) = setup().await;
        tracker.start_run(&account_id, "run-1", "Import").await.unwrap();

        let inserted = tracker
            .ingest_groups(
                "run-1",
                vec![
                    cluster(&["1", "2"]),
                    cluster(&["3"]),
                    cluster(&["4", "4"]),
                    cluster(&["5", "6", "5"]),
                ],
            )
            .await
            .unwrap();
        assert_eq!(inserted, 2);

        let status = tracker.status("run-1").await.unwrap();
        assert_eq!(status.total_groups, 2);
        assert_eq!(status.merged_groups, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn ingest_only_while_importing() {
        let (tracker, _db, account_id) = setup().await;
        tracker.start_run(&account_id, "run-1", "Import").await.unwrap();
        tracker.mark_ready("run-1").await.unwrap();

        let result = tracker.ingest_groups("run-1", vec![cluster(&["1", "2"])]).await;
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn phases_move_forward_and_restart_goes_back() {
        let (tracker, _db, account_id) = setup().await;
        tracker.start_run(&account_id, "run-1", "Import").await.unwrap();

        let ready = tracker.mark_ready("run-1").await.unwrap();
        assert_eq!(ready.phase, RunPhase::ReadyToMerge);
        assert!(matches!(
            tracker.mark_ready("run-1").await,
            Err(Error::InvalidPhaseTransition {
                from: "ready_to_merge",
                to: "ready_to_merge"
            })
        ));

        let restarted = tracker.restart_run("run-1").await.unwrap();
        assert_eq!(restarted.phase, RunPhase::Importing);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn status_counts_are_live() {
        let (tracker, db, account_id) = setup().await;
        tracker.start_run(&account_id, "run-1", "Import").await.unwrap();
        tracker
            .ingest_groups("run-1", vec![cluster(&["1", "2"]), cluster(&["3", "4"])])
            .await
            .unwrap();
        tracker.mark_ready("run-1").await.unwrap();

        let group = db.list_groups("run-1", 1, 0).await.unwrap().remove(0);
        let command = MergeCommand::new("1", "2");
        let next = group
            .after_merge(&command.keep_record_id, &command.retire_record_id)
            .unwrap();
        db.commit_group_transition(
            &next,
            &crate::db::NewAuditEntry {
                action: crate::models::AuditAction::Merge,
                kept_record_id: Some("1".to_string()),
                retired_record_id: Some("2".to_string()),
                field_values: Default::default(),
                account_id: account_id.as_str(),
            },
        )
        .await
        .unwrap()
        .unwrap();

        let status = tracker.status("run-1").await.unwrap();
        assert_eq!((status.total_groups, status.merged_groups), (2, 1));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn owned_run_hides_other_accounts() {
        let (tracker, db, account_id) = setup().await;
        tracker.start_run(&account_id, "run-1", "Import").await.unwrap();
        let other = db.create_account("Other").await.unwrap();

        assert!(tracker.owned_run(&account_id, "run-1").await.is_ok());
        assert!(matches!(
            tracker.owned_run(&other.id, "run-1").await,
            Err(Error::NotFound(_))
        ));
    }
}
