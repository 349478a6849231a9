//! Duplicate-group merge state machine.
//!
//! Each mutation runs under a per-group lock from membership check through the
//! persisted update. The remote merge always happens before the local commit,
//! so a failed or timed-out CRM call leaves the group exactly as it was.

mod plan;

use std::sync::Arc;
use std::time::Duration;

use crate::connection::{ConnectionManager, DEFAULT_CRM_TIMEOUT};
use crate::crm::{with_timeout, CrmClient};
use crate::db::NewAuditEntry;
use crate::error::{Error, Result};
use crate::export::{render_json_export, suggested_export_file_name, ExportSink};
use crate::locks::KeyedLocks;
use crate::models::{
    AccountId, AuditAction, DuplicateGroup, GroupPage, MergeAuditEntry, MergeCommand, ProcessRun,
    RunPhase,
};
use crate::services::DatabaseService;
use crate::util::unix_millis_now;

pub use plan::{PlanGate, PlanLedger, UnlimitedPlan};

pub const MAX_PAGE_SIZE: u32 = 200;

#[derive(Debug, Clone, Copy)]
pub struct MergeConfig {
    /// Upper bound for each field update and merge call
    pub crm_timeout: Duration,
    /// Largest page `list_groups` will return
    pub max_page_size: u32,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            crm_timeout: DEFAULT_CRM_TIMEOUT,
            max_page_size: MAX_PAGE_SIZE,
        }
    }
}

pub struct MergeEngine {
    db: DatabaseService,
    connections: Arc<ConnectionManager>,
    crm: Arc<dyn CrmClient>,
    plan: Arc<dyn PlanGate>,
    exports: Arc<dyn ExportSink>,
    config: MergeConfig,
    group_locks: KeyedLocks<i64>,
    run_locks: KeyedLocks<String>,
}

impl MergeEngine {
    pub fn new(
        db: DatabaseService,
        connections: Arc<ConnectionManager>,
        crm: Arc<dyn CrmClient>,
        plan: Arc<dyn PlanGate>,
        exports: Arc<dyn ExportSink>,
        config: MergeConfig,
    ) -> Self {
        Self {
            db,
            connections,
            crm,
            plan,
            exports,
            config,
            group_locks: KeyedLocks::new(),
            run_locks: KeyedLocks::new(),
        }
    }

    /// Load a group, hiding groups that belong to another account's runs.
    async fn owned_group(
        &self,
        account_id: &AccountId,
        group_id: i64,
    ) -> Result<(DuplicateGroup, ProcessRun)> {
        let group = self
            .db
            .get_group(group_id)
            .await?
            .ok_or(Error::GroupNotFound(group_id))?;
        let run = self
            .db
            .get_run(&group.run_key)
            .await?
            .filter(|run| run.account_id == account_id.as_str())
            .ok_or(Error::GroupNotFound(group_id))?;
        Ok((group, run))
    }

    /// Like `owned_group`, but only while the run is ready to merge.
    async fn changeable_group(&self, account_id: &AccountId, group_id: i64) -> Result<DuplicateGroup> {
        let (group, run) = self.owned_group(account_id, group_id).await?;
        if run.phase != RunPhase::ReadyToMerge {
            return Err(Error::RunNotReady(run.phase.as_str()));
        }
        Ok(group)
    }

    /// Explain a guarded commit that wrote nothing.
    async fn commit_conflict(&self, run_key: &str) -> Error {
        match self.db.get_run(run_key).await {
            Ok(Some(run)) if run.phase != RunPhase::ReadyToMerge => {
                Error::RunNotReady(run.phase.as_str())
            }
            Ok(_) => Error::RecordNotInGroup,
            Err(error) => error,
        }
    }

    /// One page of a run's groups in creation order.
    pub async fn list_groups(&self, run_key: &str, page: u32, page_size: u32) -> Result<GroupPage> {
        if page == 0 || page_size == 0 {
            return Err(Error::InvalidPage);
        }
        if self.db.get_run(run_key).await?.is_none() {
            return Err(Error::NotFound(format!("Run {run_key}")));
        }

        let page_size = page_size.min(self.config.max_page_size);
        let (total_groups, _) = self.db.group_counts(run_key).await?;
        let total_pages = total_groups.div_ceil(u64::from(page_size));
        let offset = (page as usize - 1).saturating_mul(page_size as usize);
        let groups = self
            .db
            .list_groups(run_key, page_size as usize, offset)
            .await?;

        Ok(GroupPage {
            groups,
            page,
            page_size,
            total_groups,
            total_pages,
        })
    }

    /// Fold `command.retire_record_id` into `command.keep_record_id` in the CRM, then locally.
    pub async fn merge_pair(
        &self,
        account_id: &AccountId,
        group_id: i64,
        command: &MergeCommand,
    ) -> Result<DuplicateGroup> {
        let keep = command.keep_record_id.trim();
        let retire = command.retire_record_id.trim();

        tracing::debug!(group_id, "Waiting for group lock");
        let _guard = self.group_locks.lock(group_id).await;

        let group = self.changeable_group(account_id, group_id).await?;
        let next = group.after_merge(keep, retire)?;
        self.plan.check_group(account_id, group_id).await?;

        if let Err(error) = self.merge_remote(account_id, command, keep, retire).await {
            self.plan.release_group(account_id, group_id).await;
            return Err(error);
        }
        self.plan.record_merged_group(account_id, group_id).await;

        let audit = NewAuditEntry {
            action: AuditAction::Merge,
            kept_record_id: Some(keep.to_string()),
            retired_record_id: Some(retire.to_string()),
            field_values: command.field_values.clone(),
            account_id: account_id.as_str(),
        };
        let Some(committed) = self.db.commit_group_transition(&next, &audit).await? else {
            tracing::warn!(
                account_id = %account_id,
                group_id,
                kept = keep,
                retired = retire,
                "Group changed while the CRM merge was in flight; local membership not updated"
            );
            return Err(self.commit_conflict(&group.run_key).await);
        };

        tracing::info!(
            account_id = %account_id,
            group_id,
            kept = keep,
            retired = retire,
            remaining = committed.members.len(),
            "Merged records"
        );
        Ok(committed)
    }

    /// Field update (when requested) then pairwise merge, each under the CRM timeout.
    async fn merge_remote(
        &self,
        account_id: &AccountId,
        command: &MergeCommand,
        keep: &str,
        retire: &str,
    ) -> Result<()> {
        let token = self.connections.get_valid_credential(account_id).await?;

        if !command.field_values.is_empty() {
            with_timeout(
                self.config.crm_timeout,
                self.crm.update_record(&token, keep, &command.field_values),
            )
            .await
            .map_err(|failure| {
                Error::MergeFailed(format!("Updating record {keep}: {}", failure.reason()))
            })?;
        }

        with_timeout(
            self.config.crm_timeout,
            self.crm.merge_records(&token, keep, retire),
        )
        .await
        .map_err(|failure| Error::MergeFailed(failure.reason()))
    }

    /// Drop a member the operator decided is not a duplicate. Local only.
    pub async fn remove_candidate(
        &self,
        account_id: &AccountId,
        group_id: i64,
        record_id: &str,
    ) -> Result<DuplicateGroup> {
        let record_id = record_id.trim();
        let _guard = self.group_locks.lock(group_id).await;

        let group = self.changeable_group(account_id, group_id).await?;
        let next = group.after_removal(record_id)?;
        let audit = NewAuditEntry {
            action: AuditAction::Remove,
            kept_record_id: None,
            retired_record_id: Some(record_id.to_string()),
            field_values: Default::default(),
            account_id: account_id.as_str(),
        };
        let Some(committed) = self.db.commit_group_transition(&next, &audit).await? else {
            return Err(self.commit_conflict(&group.run_key).await);
        };

        tracing::info!(account_id = %account_id, group_id, removed = record_id, "Removed candidate");
        Ok(committed)
    }

    /// Restore the original membership. Does not undo merges already applied in the CRM.
    pub async fn reset_group(&self, account_id: &AccountId, group_id: i64) -> Result<DuplicateGroup> {
        let _guard = self.group_locks.lock(group_id).await;

        let group = self.changeable_group(account_id, group_id).await?;
        let remote_merges = self
            .db
            .group_audit(group_id)
            .await?
            .iter()
            .rev()
            .take_while(|entry| entry.action != AuditAction::Reset)
            .filter(|entry| entry.action == AuditAction::Merge)
            .count();
        if remote_merges > 0 {
            tracing::warn!(
                account_id = %account_id,
                group_id,
                remote_merges,
                "Resetting a group whose records were already merged in the CRM"
            );
        }

        let audit = NewAuditEntry {
            action: AuditAction::Reset,
            kept_record_id: None,
            retired_record_id: None,
            field_values: Default::default(),
            account_id: account_id.as_str(),
        };
        match self
            .db
            .commit_group_transition(&group.after_reset(), &audit)
            .await?
        {
            Some(committed) => Ok(committed),
            None => Err(self.commit_conflict(&group.run_key).await),
        }
    }

    /// Mutation history of a group, oldest first.
    pub async fn audit_trail(
        &self,
        account_id: &AccountId,
        group_id: i64,
    ) -> Result<Vec<MergeAuditEntry>> {
        self.owned_group(account_id, group_id).await?;
        self.db.group_audit(group_id).await
    }

    /// Export the run's resolution and mark it finished. Returns the export reference.
    pub async fn finish(&self, run_key: &str) -> Result<String> {
        let _guard = self.run_locks.lock(run_key.to_string()).await;

        let run = self
            .db
            .get_run(run_key)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Run {run_key}")))?;
        match run.phase {
            RunPhase::Finished => {
                return run.export_reference.ok_or_else(|| {
                    Error::Database(format!("Finished run {run_key} has no export reference"))
                });
            }
            RunPhase::ReadyToMerge => {}
            RunPhase::Importing => {
                return Err(Error::InvalidPhaseTransition {
                    from: run.phase.as_str(),
                    to: RunPhase::Finished.as_str(),
                });
            }
        }

        let (total, merged) = self.db.group_counts(run_key).await?;
        if merged < total {
            let pending = usize::try_from(total - merged).unwrap_or(usize::MAX);
            return Err(Error::GroupsPending(pending));
        }

        let limit = usize::try_from(total).unwrap_or(usize::MAX);
        let groups = self.db.list_groups(run_key, limit, 0).await?;
        let now = unix_millis_now();
        let body = render_json_export(&run, &groups, now)?;
        let reference = self
            .exports
            .store(&suggested_export_file_name(run_key, now), &body)
            .await?;

        if !self.db.finish_run(run_key, &reference).await? {
            return Err(self.finish_refused(run_key).await?);
        }
        tracing::info!(run_key, groups = total, reference = %reference, "Run finished");
        Ok(reference)
    }

    /// Re-read the run after the guarded finish wrote nothing.
    async fn finish_refused(&self, run_key: &str) -> Result<Error> {
        let current = self
            .db
            .get_run(run_key)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Run {run_key}")))?;
        if current.phase == RunPhase::ReadyToMerge {
            let (total, merged) = self.db.group_counts(run_key).await?;
            let pending = usize::try_from(total.saturating_sub(merged)).unwrap_or(usize::MAX);
            return Ok(Error::GroupsPending(pending));
        }
        Ok(Error::InvalidPhaseTransition {
            from: current.phase.as_str(),
            to: RunPhase::Finished.as_str(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::Ordering;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::connection::{LifecycleConfig, OAuthSettings};
    use crate::export::DirectoryExportSink;
    use crate::models::{CandidateRecord, Connection, GroupState, RemoteAccount, TokenGrant};
    use crate::test_support::{CountingPlan, FakeCrm};
    use crate::util::unix_timestamp_now;

    struct Fixture {
        engine: Arc<MergeEngine>,
        crm: Arc<FakeCrm>,
        plan: Arc<CountingPlan>,
        db: DatabaseService,
        account_id: AccountId,
        _exports: tempfile::TempDir,
    }

    async fn fixture_with(clusters: &[&[&str]], limit: Option<u64>, connected: bool) -> Fixture {
        let db = DatabaseService::open_in_memory().await.unwrap();
        let account = db.create_account("Acme").await.unwrap();
        let crm = FakeCrm::new();
        let plan = CountingPlan::new(limit);
        let exports = tempfile::tempdir().unwrap();

        let connections = Arc::new(ConnectionManager::new(
            db.clone(),
            crm.clone(),
            OAuthSettings::new("0123456789abcdef0123456789abcdef", Duration::from_secs(600))
                .unwrap(),
            LifecycleConfig::default(),
        ));
        if connected {
            let connection = Connection::from_grant(
                account.id,
                TokenGrant {
                    access_token: "live-token".to_string(),
                    refresh_token: Some("refresh".to_string()),
                    expires_at: unix_timestamp_now() + 3_600,
                    token_type: "bearer".to_string(),
                },
                RemoteAccount::default(),
            );
            db.activate_connection(&connection).await.unwrap();
        }

        db.create_run(&account.id, "run-1", "March import")
            .await
            .unwrap();
        let clusters: Vec<Vec<CandidateRecord>> = clusters
            .iter()
            .map(|ids| ids.iter().map(|id| CandidateRecord::new(*id, 0)).collect())
            .collect();
        db.insert_groups("run-1", &clusters).await.unwrap();
        db.transition_run("run-1", RunPhase::Importing, RunPhase::ReadyToMerge)
            .await
            .unwrap();

        let engine = Arc::new(MergeEngine::new(
            db.clone(),
            connections,
            crm.clone(),
            plan.clone(),
            Arc::new(DirectoryExportSink::new(exports.path())),
            MergeConfig {
                crm_timeout: Duration::from_millis(200),
                max_page_size: MAX_PAGE_SIZE,
            },
        ));

        Fixture {
            engine,
            crm,
            plan,
            db,
            account_id: account.id,
            _exports: exports,
        }
    }

    async fn fixture(clusters: &[&[&str]]) -> Fixture {
        fixture_with(clusters, None, true).await
    }

    async fn first_group_id(f: &Fixture) -> i64 {
        f.db.list_groups("run-1", 1, 0).await.unwrap()[0].id
    }

    fn ids(group: &DuplicateGroup) -> Vec<&str> {
        group
            .members
            .iter()
            .map(|record| record.record_id.as_str())
            .collect()
    }

    fn assert_membership_accounts(group: &DuplicateGroup) {
        let mut seen: Vec<String> = group
            .members
            .iter()
            .map(|record| record.record_id.clone())
            .chain(group.retired_record_ids())
            .collect();
        seen.sort();
        let mut original: Vec<String> = group
            .original_members
            .iter()
            .map(|record| record.record_id.clone())
            .collect();
        original.sort();
        assert_eq!(seen, original);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn three_member_group_needs_two_merges() {
        let f = fixture(&[&["A", "B", "C"]]).await;
        let group_id = first_group_id(&f).await;

        let after_first = f
            .engine
            .merge_pair(&f.account_id, group_id, &MergeCommand::new("A", "B"))
            .await
            .unwrap();
        assert_eq!(ids(&after_first), vec!["A", "C"]);
        assert_eq!(after_first.state(), GroupState::PartiallyReduced);
        assert!(!after_first.merged);
        assert_membership_accounts(&after_first);

        let after_second = f
            .engine
            .merge_pair(&f.account_id, group_id, &MergeCommand::new("A", "C"))
            .await
            .unwrap();
        assert_eq!(ids(&after_second), vec!["A"]);
        assert_eq!(after_second.state(), GroupState::Merged);
        assert_eq!(after_second.retained_record_id.as_deref(), Some("A"));
        assert_membership_accounts(&after_second);

        assert_eq!(
            f.crm.merged_pairs(),
            vec![
                ("A".to_string(), "B".to_string()),
                ("A".to_string(), "C".to_string())
            ]
        );
        assert_eq!(f.plan.used(&f.account_id), 1);

        let audit = f.engine.audit_trail(&f.account_id, group_id).await.unwrap();
        assert_eq!(audit.len(), 2);
        assert!(audit.iter().all(|entry| entry.action == AuditAction::Merge));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn field_values_are_written_to_kept_record_first() {
        let f = fixture(&[&["A", "B"]]).await;
        let group_id = first_group_id(&f).await;
        let mut command = MergeCommand::new("A", "B");
        command
            .field_values
            .insert("email".to_string(), "b@acme.example".to_string());

        f.engine
            .merge_pair(&f.account_id, group_id, &command)
            .await
            .unwrap();

        let expected: BTreeMap<String, String> =
            [("email".to_string(), "b@acme.example".to_string())].into();
        assert_eq!(f.crm.updated_records(), vec![("A".to_string(), expected)]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn same_record_is_rejected_without_crm_call() {
        let f = fixture(&[&["A", "B"]]).await;
        let group_id = first_group_id(&f).await;

        let result = f
            .engine
            .merge_pair(&f.account_id, group_id, &MergeCommand::new("A", "A"))
            .await;
        assert!(matches!(result, Err(Error::SameRecord)));
        assert_eq!(f.crm.merge_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn non_member_is_rejected() {
        let f = fixture(&[&["A", "B"]]).await;
        let group_id = first_group_id(&f).await;

        let result = f
            .engine
            .merge_pair(&f.account_id, group_id, &MergeCommand::new("A", "Z"))
            .await;
        assert!(matches!(result, Err(Error::RecordNotInGroup)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unknown_and_foreign_groups_are_not_found() {
        let f = fixture(&[&["A", "B"]]).await;
        let group_id = first_group_id(&f).await;

        let unknown = f
            .engine
            .merge_pair(&f.account_id, 9_999, &MergeCommand::new("A", "B"))
            .await;
        assert!(matches!(unknown, Err(Error::GroupNotFound(9_999))));

        let other = f.db.create_account("Other").await.unwrap();
        let foreign = f
            .engine
            .merge_pair(&other.id, group_id, &MergeCommand::new("A", "B"))
            .await;
        assert!(matches!(foreign, Err(Error::GroupNotFound(_))));
        assert_eq!(f.crm.merge_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_retire_of_same_record_has_one_winner() {
        let f = fixture(&[&["A", "B", "C"]]).await;
        let group_id = first_group_id(&f).await;
        f.crm.set_merge_delay(Duration::from_millis(50));

        let first = {
            let engine = Arc::clone(&f.engine);
            let account_id = f.account_id;
            tokio::spawn(async move {
                engine
                    .merge_pair(&account_id, group_id, &MergeCommand::new("A", "B"))
                    .await
            })
        };
        let second = {
            let engine = Arc::clone(&f.engine);
            let account_id = f.account_id;
            tokio::spawn(async move {
                engine
                    .merge_pair(&account_id, group_id, &MergeCommand::new("C", "B"))
                    .await
            })
        };

        let results = [first.await.unwrap(), second.await.unwrap()];
        let wins = results.iter().filter(|result| result.is_ok()).count();
        let stale = results
            .iter()
            .filter(|result| matches!(result, Err(Error::RecordNotInGroup)))
            .count();
        assert_eq!((wins, stale), (1, 1));
        assert_eq!(f.crm.merge_calls.load(Ordering::SeqCst), 1);

        let stored = f.db.get_group(group_id).await.unwrap().unwrap();
        assert_eq!(stored.members.len(), 2);
        assert!(!stored.contains("B"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn merge_timeout_leaves_group_untouched_and_retry_succeeds() {
        let f = fixture(&[&["A", "B"]]).await;
        let group_id = first_group_id(&f).await;
        let before = f.db.get_group(group_id).await.unwrap().unwrap();

        f.crm.set_merge_delay(Duration::from_secs(2));
        let result = f
            .engine
            .merge_pair(&f.account_id, group_id, &MergeCommand::new("A", "B"))
            .await;
        assert!(matches!(result, Err(Error::MergeFailed(_))));
        assert_eq!(f.db.get_group(group_id).await.unwrap().unwrap(), before);
        assert!(f.db.group_audit(group_id).await.unwrap().is_empty());

        f.crm.set_merge_delay(Duration::ZERO);
        let retried = f
            .engine
            .merge_pair(&f.account_id, group_id, &MergeCommand::new("A", "B"))
            .await
            .unwrap();
        assert!(retried.merged);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn crm_failure_is_merge_failed() {
        let f = fixture(&[&["A", "B"]]).await;
        let group_id = first_group_id(&f).await;
        f.crm.fail_merge.store(true, Ordering::SeqCst);

        let result = f
            .engine
            .merge_pair(&f.account_id, group_id, &MergeCommand::new("A", "B"))
            .await;
        assert!(matches!(result, Err(Error::MergeFailed(_))));
        assert_eq!(
            f.db.get_group(group_id).await.unwrap().unwrap().members.len(),
            2
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn merge_without_connection_is_not_connected() {
        let f = fixture_with(&[&["A", "B"]], None, false).await;
        let group_id = first_group_id(&f).await;

        let result = f
            .engine
            .merge_pair(&f.account_id, group_id, &MergeCommand::new("A", "B"))
            .await;
        assert!(matches!(result, Err(Error::NotConnected)));
        assert_eq!(f.crm.merge_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn plan_limit_blocks_further_groups() {
        let f = fixture_with(&[&["A", "B"], &["C", "D"]], Some(1), true).await;
        let groups = f.db.list_groups("run-1", 10, 0).await.unwrap();

        f.engine
            .merge_pair(&f.account_id, groups[0].id, &MergeCommand::new("A", "B"))
            .await
            .unwrap();
        let blocked = f
            .engine
            .merge_pair(&f.account_id, groups[1].id, &MergeCommand::new("C", "D"))
            .await;

        assert!(matches!(blocked, Err(Error::PlanLimitReached(_))));
        assert_eq!(f.crm.merge_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn remove_candidate_makes_two_member_group_terminal() {
        let f = fixture(&[&["A", "B"]]).await;
        let group_id = first_group_id(&f).await;

        let group = f
            .engine
            .remove_candidate(&f.account_id, group_id, "B")
            .await
            .unwrap();
        assert!(group.merged);
        assert_eq!(group.retained_record_id.as_deref(), Some("A"));
        assert_eq!(f.crm.merge_calls.load(Ordering::SeqCst), 0);

        let last = f.engine.remove_candidate(&f.account_id, group_id, "A").await;
        assert!(matches!(last, Err(Error::InvalidInput(_))));
        let absent = f.engine.remove_candidate(&f.account_id, group_id, "B").await;
        assert!(matches!(absent, Err(Error::RecordNotInGroup)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn reset_restores_original_membership() {
        let f = fixture(&[&["A", "B", "C"]]).await;
        let group_id = first_group_id(&f).await;
        f.engine
            .merge_pair(&f.account_id, group_id, &MergeCommand::new("A", "B"))
            .await
            .unwrap();
        f.engine
            .remove_candidate(&f.account_id, group_id, "C")
            .await
            .unwrap();

        let reset = f.engine.reset_group(&f.account_id, group_id).await.unwrap();
        assert_eq!(reset.members, reset.original_members);
        assert!(!reset.merged);
        assert_eq!(reset.retained_record_id, None);
        assert_eq!(reset.state(), GroupState::Pending);

        let actions: Vec<AuditAction> = f
            .engine
            .audit_trail(&f.account_id, group_id)
            .await
            .unwrap()
            .into_iter()
            .map(|entry| entry.action)
            .collect();
        assert_eq!(
            actions,
            vec![AuditAction::Merge, AuditAction::Remove, AuditAction::Reset]
        );

        let missing = f.engine.reset_group(&f.account_id, 9_999).await;
        assert!(matches!(missing, Err(Error::GroupNotFound(9_999))));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn list_groups_paginates_in_creation_order() {
        let f = fixture(&[
            &["1", "2"],
            &["3", "4"],
            &["5", "6"],
            &["7", "8"],
            &["9", "10"],
        ])
        .await;

        let first = f.engine.list_groups("run-1", 1, 2).await.unwrap();
        assert_eq!(first.total_groups, 5);
        assert_eq!(first.total_pages, 3);
        assert_eq!(first.groups.len(), 2);
        assert!(first.groups[0].id < first.groups[1].id);

        let last = f.engine.list_groups("run-1", 3, 2).await.unwrap();
        assert_eq!(last.groups.len(), 1);
        assert_eq!(ids(&last.groups[0]), vec!["9", "10"]);

        let beyond = f.engine.list_groups("run-1", 4, 2).await.unwrap();
        assert!(beyond.groups.is_empty());

        let capped = f.engine.list_groups("run-1", 1, 10_000).await.unwrap();
        assert_eq!(capped.page_size, MAX_PAGE_SIZE);

        assert!(matches!(
            f.engine.list_groups("run-1", 0, 10).await,
            Err(Error::InvalidPage)
        ));
        assert!(matches!(
            f.engine.list_groups("run-1", 1, 0).await,
            Err(Error::InvalidPage)
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn finish_requires_every_group_terminal() {
        let f = fixture(&[&["A", "B"], &["C", "D"]]).await;
        let groups = f.db.list_groups("run-1", 10, 0).await.unwrap();

        f.engine
            .merge_pair(&f.account_id, groups[0].id, &MergeCommand::new("A", "B"))
            .await
            .unwrap();
        assert!(matches!(
            f.engine.finish("run-1").await,
            Err(Error::GroupsPending(1))
        ));

        f.engine
            .remove_candidate(&f.account_id, groups[1].id, "D")
            .await
            .unwrap();
        let reference = f.engine.finish("run-1").await.unwrap();

        let exported: crate::export::RunExport =
            serde_json::from_str(&std::fs::read_to_string(&reference).unwrap()).unwrap();
        assert_eq!(exported.groups.len(), 2);
        assert_eq!(exported.groups[0].retained_record_id.as_deref(), Some("A"));
        assert_eq!(exported.groups[0].retired_record_ids, vec!["B".to_string()]);

        let run = f.db.get_run("run-1").await.unwrap().unwrap();
        assert_eq!(run.phase, RunPhase::Finished);
        assert_eq!(f.engine.finish("run-1").await.unwrap(), reference);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn finish_rejects_importing_run() {
        let f = fixture(&[&["A", "B"]]).await;
        f.db.create_run(&f.account_id, "run-2", "Still importing")
            .await
            .unwrap();

        assert!(matches!(
            f.engine.finish("run-2").await,
            Err(Error::InvalidPhaseTransition { .. })
        ));
        assert!(matches!(
            f.engine.finish("missing").await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn finished_run_rejects_group_changes() {
        let f = fixture(&[&["A", "B"]]).await;
        let group_id = first_group_id(&f).await;
        f.engine
            .merge_pair(&f.account_id, group_id, &MergeCommand::new("A", "B"))
            .await
            .unwrap();
        let reference = f.engine.finish("run-1").await.unwrap();

        let reset = f.engine.reset_group(&f.account_id, group_id).await;
        assert!(matches!(reset, Err(Error::RunNotReady("finished"))));
        let removed = f.engine.remove_candidate(&f.account_id, group_id, "A").await;
        assert!(matches!(removed, Err(Error::RunNotReady("finished"))));

        let stored = f.db.get_group(group_id).await.unwrap().unwrap();
        assert!(stored.merged);
        assert_eq!(f.db.group_counts("run-1").await.unwrap(), (1, 1));
        assert_eq!(f.engine.finish("run-1").await.unwrap(), reference);

        // Audit stays readable after the run is closed
        assert_eq!(
            f.engine.audit_trail(&f.account_id, group_id).await.unwrap().len(),
            1
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn importing_run_rejects_merges_before_any_crm_call() {
        let f = fixture(&[&["A", "B"]]).await;
        f.db.create_run(&f.account_id, "run-2", "Still importing")
            .await
            .unwrap();
        f.db.insert_groups(
            "run-2",
            &[vec![CandidateRecord::new("X", 0), CandidateRecord::new("Y", 0)]],
        )
        .await
        .unwrap();
        let group_id = f.db.list_groups("run-2", 1, 0).await.unwrap()[0].id;

        let result = f
            .engine
            .merge_pair(&f.account_id, group_id, &MergeCommand::new("X", "Y"))
            .await;
        assert!(matches!(result, Err(Error::RunNotReady("importing"))));
        assert_eq!(f.crm.merge_calls.load(Ordering::SeqCst), 0);
        assert_eq!(f.plan.used(&f.account_id), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn group_finished_by_removal_after_a_merge_is_charged() {
        let f = fixture_with(&[&["A", "B", "C"], &["D", "E"]], Some(1), true).await;
        let groups = f.db.list_groups("run-1", 10, 0).await.unwrap();

        f.engine
            .merge_pair(&f.account_id, groups[0].id, &MergeCommand::new("A", "B"))
            .await
            .unwrap();
        let done = f
            .engine
            .remove_candidate(&f.account_id, groups[0].id, "C")
            .await
            .unwrap();
        assert!(done.merged);
        assert_eq!(f.plan.used(&f.account_id), 1);

        let blocked = f
            .engine
            .merge_pair(&f.account_id, groups[1].id, &MergeCommand::new("D", "E"))
            .await;
        assert!(matches!(blocked, Err(Error::PlanLimitReached(_))));
        assert_eq!(f.crm.merge_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn reset_and_merge_again_is_charged_once() {
        let f = fixture_with(&[&["A", "B"]], Some(1), true).await;
        let group_id = first_group_id(&f).await;

        f.engine
            .merge_pair(&f.account_id, group_id, &MergeCommand::new("A", "B"))
            .await
            .unwrap();
        f.engine.reset_group(&f.account_id, group_id).await.unwrap();
        let again = f
            .engine
            .merge_pair(&f.account_id, group_id, &MergeCommand::new("B", "A"))
            .await
            .unwrap();

        assert!(again.merged);
        assert_eq!(f.plan.used(&f.account_id), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_merges_cannot_overrun_the_plan() {
        let f = fixture_with(&[&["A", "B"], &["C", "D"]], Some(1), true).await;
        let groups = f.db.list_groups("run-1", 10, 0).await.unwrap();
        f.crm.set_merge_delay(Duration::from_millis(50));

        let handles: Vec<_> = [(groups[0].id, "A", "B"), (groups[1].id, "C", "D")]
            .into_iter()
            .map(|(group_id, keep, retire)| {
                let engine = Arc::clone(&f.engine);
                let account_id = f.account_id;
                tokio::spawn(async move {
                    engine
                        .merge_pair(&account_id, group_id, &MergeCommand::new(keep, retire))
                        .await
                })
            })
            .collect();

        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap());
        }
        assert_eq!(results.iter().filter(|result| result.is_ok()).count(), 1);
        assert!(results
            .iter()
            .any(|result| matches!(result, Err(Error::PlanLimitReached(_)))));
        assert_eq!(f.crm.merge_calls.load(Ordering::SeqCst), 1);
        assert_eq!(f.plan.used(&f.account_id), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_merge_gives_the_plan_slot_back() {
        let f = fixture_with(&[&["A", "B"], &["C", "D"]], Some(1), true).await;
        let groups = f.db.list_groups("run-1", 10, 0).await.unwrap();

        f.crm.fail_merge.store(true, Ordering::SeqCst);
        let failed = f
            .engine
            .merge_pair(&f.account_id, groups[0].id, &MergeCommand::new("A", "B"))
            .await;
        assert!(matches!(failed, Err(Error::MergeFailed(_))));
        assert_eq!(f.plan.used(&f.account_id), 0);

        f.crm.fail_merge.store(false, Ordering::SeqCst);
        f.engine
            .merge_pair(&f.account_id, groups[1].id, &MergeCommand::new("C", "D"))
            .await
            .unwrap();
        assert_eq!(f.plan.used(&f.account_id), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn refused_finish_reports_the_stored_phase() {
        let f = fixture(&[&["A", "B"]]).await;

        let pending = f.engine.finish_refused("run-1").await.unwrap();
        assert!(matches!(pending, Error::GroupsPending(1)));

        f.db.transition_run("run-1", RunPhase::ReadyToMerge, RunPhase::Importing)
            .await
            .unwrap();
        let importing = f.engine.finish_refused("run-1").await.unwrap();
        assert!(matches!(
            importing,
            Error::InvalidPhaseTransition {
                from: "importing",
                to: "finished"
            }
        ));
    }
}
