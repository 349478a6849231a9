//! Shared database service wrapper used by the lifecycle manager, merge engine and API.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::db::{
    AccountRepository, ConnectionRepository, Database, GroupRepository, LibSqlAccountRepository,
    LibSqlConnectionRepository, LibSqlGroupRepository, LibSqlRunRepository, NewAuditEntry,
    RunRepository,
};
use crate::models::{
    Account, AccountId, CandidateRecord, Connection, DuplicateGroup, MergeAuditEntry, ProcessRun,
    RunPhase, TokenGrant,
};
use crate::Result;

/// Thread-safe service for DB and repository operations.
#[derive(Clone)]
pub struct DatabaseService {
    db: Arc<Mutex<Database>>,
    db_path: Option<PathBuf>,
}

impl DatabaseService {
    /// Open a database service at the given filesystem path.
    pub async fn open_path(db_path: impl Into<PathBuf>) -> Result<Self> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        tracing::info!("Opening database at {}", db_path.display());
        let db = Database::open(&db_path).await?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            db_path: Some(db_path),
        })
    }

    /// Open an in-memory database service (primarily for tests).
    pub async fn open_in_memory() -> Result<Self> {
        let db = Database::open_in_memory().await?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            db_path: None,
        })
    }

    /// Filesystem location, `None` for in-memory databases.
    pub fn path(&self) -> Option<&PathBuf> {
        self.db_path.as_ref()
    }

    // Accounts

    /// Create a local account.
    pub async fn create_account(&self, display_name: &str) -> Result<Account> {
        let db = self.db.lock().await;
        let repo = LibSqlAccountRepository::new(db.connection());
        repo.create(display_name).await
    }

    /// Fetch an account by id.
    pub async fn get_account(&self, id: &AccountId) -> Result<Option<Account>> {
        let db = self.db.lock().await;
        let repo = LibSqlAccountRepository::new(db.connection());
        repo.get(id).await
    }

    /// Whether the account exists.
    pub async fn account_exists(&self, id: &AccountId) -> Result<bool> {
        let db = self.db.lock().await;
        let repo = LibSqlAccountRepository::new(db.connection());
        repo.exists(id).await
    }

    // Connections

    /// Make `connection` the account's only active connection.
    pub async fn activate_connection(&self, connection: &Connection) -> Result<()> {
        let db = self.db.lock().await;
        let repo = LibSqlConnectionRepository::new(db.connection());
        repo.activate(connection).await
    }

    /// The account's active connection.
    pub async fn active_connection(&self, account_id: &AccountId) -> Result<Option<Connection>> {
        let db = self.db.lock().await;
        let repo = LibSqlConnectionRepository::new(db.connection());
        repo.active_for(account_id).await
    }

    /// Every connection the account ever had, newest first.
    pub async fn connection_history(&self, account_id: &AccountId) -> Result<Vec<Connection>> {
        let db = self.db.lock().await;
        let repo = LibSqlConnectionRepository::new(db.connection());
        repo.history_for(account_id).await
    }

    /// Replace credential fields after a refresh.
    pub async fn apply_refresh(
        &self,
        connection_id: &str,
        grant: &TokenGrant,
        now_ms: i64,
    ) -> Result<()> {
        let db = self.db.lock().await;
        let repo = LibSqlConnectionRepository::new(db.connection());
        repo.apply_refresh(connection_id, grant, now_ms).await
    }

    /// Update `last_used_at`.
    pub async fn touch_connection(&self, connection_id: &str, now_ms: i64) -> Result<()> {
        let db = self.db.lock().await;
        let repo = LibSqlConnectionRepository::new(db.connection());
        repo.touch(connection_id, now_ms).await
    }

    /// Deactivate a single connection.
    pub async fn deactivate_connection(&self, connection_id: &str, now_ms: i64) -> Result<bool> {
        let db = self.db.lock().await;
        let repo = LibSqlConnectionRepository::new(db.connection());
        repo.deactivate(connection_id, now_ms).await
    }

    /// Deactivate whatever is active for the account.
    pub async fn deactivate_account_connections(
        &self,
        account_id: &AccountId,
        now_ms: i64,
    ) -> Result<u64> {
        let db = self.db.lock().await;
        let repo = LibSqlConnectionRepository::new(db.connection());
        repo.deactivate_account(account_id, now_ms).await
    }

    /// Consume a one-time OAuth state nonce.
    pub async fn consume_state_nonce(
        &self,
        nonce: &str,
        account_id: &AccountId,
        now_ms: i64,
    ) -> Result<bool> {
        let db = self.db.lock().await;
        let repo = LibSqlConnectionRepository::new(db.connection());
        repo.consume_state_nonce(nonce, account_id, now_ms).await
    }

    // Runs

    /// Create a run in the `Importing` phase.
    pub async fn create_run(
        &self,
        account_id: &AccountId,
        run_key: &str,
        display_name: &str,
    ) -> Result<ProcessRun> {
        let db = self.db.lock().await;
        let repo = LibSqlRunRepository::new(db.connection());
        repo.create(account_id, run_key, display_name).await
    }

    /// Fetch a run by key.
    pub async fn get_run(&self, run_key: &str) -> Result<Option<ProcessRun>> {
        let db = self.db.lock().await;
        let repo = LibSqlRunRepository::new(db.connection());
        repo.get(run_key).await
    }

    /// Compare-and-set a run's phase.
    pub async fn transition_run(&self, run_key: &str, from: RunPhase, to: RunPhase) -> Result<bool> {
        let db = self.db.lock().await;
        let repo = LibSqlRunRepository::new(db.connection());
        repo.transition(run_key, from, to).await
    }

    /// Record the export reference and finish the run.
    pub async fn finish_run(&self, run_key: &str, export_reference: &str) -> Result<bool> {
        let db = self.db.lock().await;
        let repo = LibSqlRunRepository::new(db.connection());
        repo.finish(run_key, export_reference).await
    }

    // Groups

    /// Bulk-insert groups for a run.
    pub async fn insert_groups(
        &self,
        run_key: &str,
        clusters: &[Vec<CandidateRecord>],
    ) -> Result<usize> {
        let db = self.db.lock().await;
        let repo = LibSqlGroupRepository::new(db.connection());
        repo.insert_groups(run_key, clusters).await
    }

    /// Fetch a group by id.
    pub async fn get_group(&self, id: i64) -> Result<Option<DuplicateGroup>> {
        let db = self.db.lock().await;
        let repo = LibSqlGroupRepository::new(db.connection());
        repo.get(id).await
    }

    /// List a run's groups in creation order.
    pub async fn list_groups(
        &self,
        run_key: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<DuplicateGroup>> {
        let db = self.db.lock().await;
        let repo = LibSqlGroupRepository::new(db.connection());
        repo.list(run_key, limit, offset).await
    }

    /// Total and merged group counts for a run, read under one lock.
    pub async fn group_counts(&self, run_key: &str) -> Result<(u64, u64)> {
        let db = self.db.lock().await;
        let repo = LibSqlGroupRepository::new(db.connection());
        let total = repo.count(run_key).await?;
        let merged = repo.count_merged(run_key).await?;
        Ok((total, merged))
    }

    /// Persist a group transition with its audit row (optimistic version check).
    pub async fn commit_group_transition(
        &self,
        next: &DuplicateGroup,
        audit: &NewAuditEntry,
    ) -> Result<Option<DuplicateGroup>> {
        let db = self.db.lock().await;
        let repo = LibSqlGroupRepository::new(db.connection());
        repo.commit_transition(next, audit).await
    }

    /// Audit trail of a group.
    pub async fn group_audit(&self, group_id: i64) -> Result<Vec<MergeAuditEntry>> {
        let db = self.db.lock().await;
        let repo = LibSqlGroupRepository::new(db.connection());
        repo.audit_for(group_id).await
    }
}
