//! In-process fakes shared by the unit tests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::crm::CrmClient;
use crate::error::{Error, Result};
use crate::merge::{PlanGate, PlanLedger};
use crate::models::{AccountId, RemoteAccount, TokenGrant};
use crate::util::unix_timestamp_now;

/// Scripted CRM: counts calls, can be told to fail or stall.
#[derive(Default)]
pub struct FakeCrm {
    pub exchange_calls: AtomicUsize,
    pub refresh_calls: AtomicUsize,
    pub update_calls: AtomicUsize,
    pub merge_calls: AtomicUsize,
    pub fail_exchange: AtomicBool,
    pub fail_refresh: AtomicBool,
    pub fail_merge: AtomicBool,
    /// Whether refresh responses carry a rotated refresh token
    pub rotate_refresh_token: AtomicBool,
    issued: AtomicU64,
    delay: Mutex<Duration>,
    merge_delay: Mutex<Duration>,
    merged: Mutex<Vec<(String, String)>>,
    updated: Mutex<Vec<(String, BTreeMap<String, String>)>>,
}

impl FakeCrm {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Delay applied to token exchange and refresh.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    /// Delay applied to record merges.
    pub fn set_merge_delay(&self, delay: Duration) {
        *self.merge_delay.lock().unwrap() = delay;
    }

    pub fn merged_pairs(&self) -> Vec<(String, String)> {
        self.merged.lock().unwrap().clone()
    }

    pub fn updated_records(&self) -> Vec<(String, BTreeMap<String, String>)> {
        self.updated.lock().unwrap().clone()
    }

    fn grant(&self, refresh_token: Option<String>) -> TokenGrant {
        let serial = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        TokenGrant {
            access_token: format!("access-{serial}"),
            refresh_token,
            expires_at: unix_timestamp_now() + 1_800,
            token_type: "bearer".to_string(),
        }
    }

    async fn stall(&self) {
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl CrmClient for FakeCrm {
    fn authorization_url(&self, state: &str) -> Result<String> {
        Ok(format!("https://crm.test/oauth/authorize?state={state}"))
    }

    async fn exchange_code(&self, code: &str) -> Result<TokenGrant> {
        self.exchange_calls.fetch_add(1, Ordering::SeqCst);
        self.stall().await;
        if self.fail_exchange.load(Ordering::SeqCst) {
            return Err(Error::Crm("invalid_grant".to_string()));
        }
        Ok(self.grant(Some(format!("refresh-for-{code}"))))
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        self.stall().await;
        if self.fail_refresh.load(Ordering::SeqCst) {
            return Err(Error::Crm("refresh token revoked".to_string()));
        }
        let rotated = self
            .rotate_refresh_token
            .load(Ordering::SeqCst)
            .then(|| format!("{refresh_token}-rotated"));
        Ok(self.grant(rotated))
    }

    async fn remote_account(&self, _access_token: &str) -> Result<RemoteAccount> {
        Ok(RemoteAccount {
            portal_id: Some("4242".to_string()),
            domain: Some("acme.example".to_string()),
            account_name: Some("Acme".to_string()),
        })
    }

    async fn update_record(
        &self,
        _access_token: &str,
        record_id: &str,
        properties: &BTreeMap<String, String>,
    ) -> Result<()> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        self.updated
            .lock()
            .unwrap()
            .push((record_id.to_string(), properties.clone()));
        Ok(())
    }

    async fn merge_records(
        &self,
        _access_token: &str,
        keep_record_id: &str,
        retire_record_id: &str,
    ) -> Result<()> {
        self.merge_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.merge_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail_merge.load(Ordering::SeqCst) {
            return Err(Error::Crm("contact merge failed with HTTP 500".to_string()));
        }
        self.merged
            .lock()
            .unwrap()
            .push((keep_record_id.to_string(), retire_record_id.to_string()));
        Ok(())
    }
}

/// Plan gate that allows `limit` charged groups per account.
pub struct CountingPlan {
    limit: Option<u64>,
    ledger: Mutex<PlanLedger>,
}

impl CountingPlan {
    pub fn new(limit: Option<u64>) -> Arc<Self> {
        Arc::new(Self {
            limit,
            ledger: Mutex::new(PlanLedger::new()),
        })
    }

    pub fn used(&self, account_id: &AccountId) -> u64 {
        self.ledger.lock().unwrap().charged(account_id)
    }
}

#[async_trait]
impl PlanGate for CountingPlan {
    async fn check_group(&self, account_id: &AccountId, group_id: i64) -> Result<()> {
        self.ledger
            .lock()
            .unwrap()
            .reserve(account_id, group_id, self.limit)
    }

    async fn record_merged_group(&self, account_id: &AccountId, group_id: i64) {
        self.ledger.lock().unwrap().charge(account_id, group_id);
    }

    async fn release_group(&self, account_id: &AccountId, group_id: i64) {
        self.ledger.lock().unwrap().release(account_id, group_id);
    }
}
