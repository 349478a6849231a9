//! Billing plan gate consulted before merge work.
//!
//! A group is charged once, on the first CRM merge that succeeds in it.
//! Resetting and merging it again, or finishing it by removal, does not
//! change the charge.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::models::AccountId;

/// Answers "may this account process this group" and receives usage reports.
#[async_trait]
pub trait PlanGate: Send + Sync {
    /// Reserve room for `group_id`, or `Err(Error::PlanLimitReached)` when the
    /// plan has no room left. Groups already charged always pass.
    async fn check_group(&self, account_id: &AccountId, group_id: i64) -> Result<()>;

    /// A CRM merge succeeded in the group. Idempotent per group.
    async fn record_merged_group(&self, account_id: &AccountId, group_id: i64);

    /// The reserved merge never reached the CRM; give the slot back.
    async fn release_group(&self, account_id: &AccountId, group_id: i64);
}

/// Gate that permits everything and ignores usage.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnlimitedPlan;

#[async_trait]
impl PlanGate for UnlimitedPlan {
    async fn check_group(&self, _account_id: &AccountId, _group_id: i64) -> Result<()> {
        Ok(())
    }

    async fn record_merged_group(&self, _account_id: &AccountId, _group_id: i64) {}

    async fn release_group(&self, _account_id: &AccountId, _group_id: i64) {}
}

#[derive(Debug, Default)]
struct AccountUsage {
    charged: HashSet<i64>,
    reserved: HashSet<i64>,
}

impl AccountUsage {
    fn slots_taken(&self) -> u64 {
        u64::try_from(self.charged.len() + self.reserved.len()).unwrap_or(u64::MAX)
    }
}

/// Per-account group accounting shared by plan gate implementations.
///
/// Callers hold it behind one lock so the limit check and the reservation
/// happen together.
#[derive(Debug, Default)]
pub struct PlanLedger {
    accounts: HashMap<AccountId, AccountUsage>,
}

impl PlanLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reserve(&mut self, account_id: &AccountId, group_id: i64, limit: Option<u64>) -> Result<()> {
        let usage = self.accounts.entry(*account_id).or_default();
        if usage.charged.contains(&group_id) || usage.reserved.contains(&group_id) {
            return Ok(());
        }
        if let Some(limit) = limit {
            if usage.slots_taken() >= limit {
                return Err(Error::PlanLimitReached(format!(
                    "The current plan covers {limit} merge group(s)"
                )));
            }
        }
        usage.reserved.insert(group_id);
        Ok(())
    }

    /// Returns `true` only the first time the group is charged.
    pub fn charge(&mut self, account_id: &AccountId, group_id: i64) -> bool {
        let usage = self.accounts.entry(*account_id).or_default();
        usage.reserved.remove(&group_id);
        usage.charged.insert(group_id)
    }

    pub fn release(&mut self, account_id: &AccountId, group_id: i64) {
        if let Some(usage) = self.accounts.get_mut(account_id) {
            usage.reserved.remove(&group_id);
        }
    }

    pub fn charged(&self, account_id: &AccountId) -> u64 {
        self.accounts.get(account_id).map_or(0, |usage| {
            u64::try_from(usage.charged.len()).unwrap_or(u64::MAX)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reservations_count_against_the_limit() {
        let mut ledger = PlanLedger::new();
        let account = AccountId::new();

        ledger.reserve(&account, 1, Some(1)).unwrap();
        assert!(matches!(
            ledger.reserve(&account, 2, Some(1)),
            Err(Error::PlanLimitReached(_))
        ));

        ledger.release(&account, 1);
        ledger.reserve(&account, 2, Some(1)).unwrap();
        assert_eq!(ledger.charged(&account), 0);
    }

    #[test]
    fn groups_are_charged_once() {
        let mut ledger = PlanLedger::new();
        let account = AccountId::new();

        ledger.reserve(&account, 7, Some(1)).unwrap();
        assert!(ledger.charge(&account, 7));
        ledger.reserve(&account, 7, Some(1)).unwrap();
        assert!(!ledger.charge(&account, 7));
        ledger.release(&account, 7);

        assert_eq!(ledger.charged(&account), 1);
        assert!(ledger.reserve(&account, 8, Some(1)).is_err());
        assert!(ledger.reserve(&AccountId::new(), 8, Some(1)).is_ok());
    }
}
