use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dedup_core::merge::PlanLedger;
use dedup_core::models::AccountId;
use dedup_core::{PlanGate, Result};
use tokio::sync::Mutex;

use crate::config::AppConfig;

/// Per-account merge group allowance. Usage lives in process memory.
#[derive(Clone)]
pub struct MergeGroupQuota {
    ledger: Arc<Mutex<PlanLedger>>,
    limit: Option<u64>,
    metrics: Arc<QuotaMetrics>,
}

#[derive(Default)]
struct QuotaMetrics {
    allowed: AtomicU64,
    limited: AtomicU64,
    charged: AtomicU64,
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct QuotaMetricsSnapshot {
    pub limit: Option<u64>,
    pub allowed: u64,
    pub limited: u64,
    pub charged: u64,
}

impl MergeGroupQuota {
    pub fn from_config(config: &AppConfig) -> Self {
        Self::with_limit(config.plan_merge_group_limit)
    }

    pub fn with_limit(limit: Option<u64>) -> Self {
        Self {
            ledger: Arc::new(Mutex::new(PlanLedger::new())),
            limit,
            metrics: Arc::new(QuotaMetrics::default()),
        }
    }

    pub fn metrics_snapshot(&self) -> QuotaMetricsSnapshot {
        QuotaMetricsSnapshot {
            limit: self.limit,
            allowed: self.metrics.allowed.load(Ordering::Relaxed),
            limited: self.metrics.limited.load(Ordering::Relaxed),
            charged: self.metrics.charged.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl PlanGate for MergeGroupQuota {
    async fn check_group(&self, account_id: &AccountId, group_id: i64) -> Result<()> {
        let reserved = self
            .ledger
            .lock()
            .await
            .reserve(account_id, group_id, self.limit);
        match reserved {
            Ok(()) => {
                self.metrics.allowed.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(error) => {
                self.metrics.limited.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    account = account_fingerprint(account_id),
                    group_id,
                    limit = self.limit,
                    "Merge group quota exhausted"
                );
                Err(error)
            }
        }
    }

    async fn record_merged_group(&self, account_id: &AccountId, group_id: i64) {
        let (first_charge, used) = {
            let mut ledger = self.ledger.lock().await;
            let first_charge = ledger.charge(account_id, group_id);
            (first_charge, ledger.charged(account_id))
        };
        if first_charge {
            self.metrics.charged.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                account = account_fingerprint(account_id),
                group_id,
                used,
                "Charged merge group"
            );
        }
    }

    async fn release_group(&self, account_id: &AccountId, group_id: i64) {
        self.ledger.lock().await.release(account_id, group_id);
    }
}

fn account_fingerprint(account_id: &AccountId) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    account_id.hash(&mut hasher);
    hasher.finish()
}
