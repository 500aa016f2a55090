//! Quota ledger: credit grant, consumption and the unlimited override.
//!
//! All mutations go through the store's conditional primitives; the ledger
//! itself holds no state beyond its policy constants.

use std::sync::Arc;

use chrono::NaiveDate;

use crate::{
    domain::{CreditBalance, UserId},
    store::UserStore,
    Result,
};

/// Outcome of a pre-flight quota check. No credit is reserved; the decrement
/// happens only at [`QuotaLedger::commit`], after the lookup delivered value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QuotaDecision {
    Allowed(CreditBalance),
    Denied,
}

pub struct QuotaLedger {
    store: Arc<dyn UserStore>,
    initial_credits: i64,
    grant_amount: i64,
}

impl QuotaLedger {
    pub fn new(store: Arc<dyn UserStore>, initial_credits: i64, grant_amount: i64) -> Self {
        Self {
            store,
            initial_credits,
            grant_amount,
        }
    }

    pub fn initial_credits(&self) -> i64 {
        self.initial_credits
    }

    /// Read-only admission check. Creates the record on first interaction so
    /// the daily grant pass sees the user from then on.
    pub async fn check(&self, id: UserId) -> Result<QuotaDecision> {
        let rec = self.store.create_if_absent(id, self.initial_credits).await?;
        if rec.unlimited {
            return Ok(QuotaDecision::Allowed(CreditBalance::Unlimited));
        }
        if rec.credits > 0 {
            return Ok(QuotaDecision::Allowed(CreditBalance::Limited(rec.credits)));
        }
        Ok(QuotaDecision::Denied)
    }

    /// Consume one credit after a confirmed successful lookup. The store-side
    /// condition re-checks `credits > 0 && !unlimited`, so two concurrent
    /// lookups cannot both spend the last credit; `None` means the condition
    /// failed and the consumption is void.
    pub async fn commit(&self, id: UserId) -> Result<Option<i64>> {
        self.store.consume_credit(id).await
    }

    /// Apply the daily free-credit top-up if it has not been applied for
    /// `today` yet. Idempotent per calendar day.
    pub async fn grant_if_due(&self, id: UserId, today: NaiveDate) -> Result<bool> {
        self.store.grant_daily(id, today, self.grant_amount).await
    }

    pub async fn set_unlimited(&self, id: UserId, unlimited: bool) -> Result<()> {
        self.store.set_unlimited(id, unlimited).await
    }

    pub async fn adjust_credits(&self, id: UserId, delta: i64) -> Result<()> {
        self.store.adjust_credits(id, delta).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn ledger(store: Arc<MemoryStore>) -> QuotaLedger {
        QuotaLedger::new(store, 2, 1)
    }

    #[tokio::test]
    async fn check_denies_at_zero_and_allows_unlimited_regardless() {
        let store = Arc::new(MemoryStore::new());
        let ledger = ledger(store.clone());

        store.create_if_absent(UserId(1), 0).await.unwrap();
        assert_eq!(ledger.check(UserId(1)).await.unwrap(), QuotaDecision::Denied);

        ledger.set_unlimited(UserId(1), true).await.unwrap();
        assert_eq!(
            ledger.check(UserId(1)).await.unwrap(),
            QuotaDecision::Allowed(CreditBalance::Unlimited)
        );
    }

    #[tokio::test]
    async fn check_creates_record_with_initial_grant() {
        let store = Arc::new(MemoryStore::new());
        let ledger = ledger(store.clone());

        assert_eq!(
            ledger.check(UserId(5)).await.unwrap(),
            QuotaDecision::Allowed(CreditBalance::Limited(2))
        );
        assert_eq!(store.get(UserId(5)).await.unwrap().unwrap().credits, 2);
    }

    #[tokio::test]
    async fn commit_is_void_once_credits_run_out() {
        let store = Arc::new(MemoryStore::new());
        let ledger = ledger(store.clone());
        store.create_if_absent(UserId(2), 1).await.unwrap();

        assert_eq!(ledger.commit(UserId(2)).await.unwrap(), Some(0));
        assert_eq!(ledger.commit(UserId(2)).await.unwrap(), None);
        assert_eq!(store.get(UserId(2)).await.unwrap().unwrap().credits, 0);
    }

    #[tokio::test]
    async fn grant_if_due_applies_once_per_day() {
        let store = Arc::new(MemoryStore::new());
        let ledger = ledger(store.clone());
        store.create_if_absent(UserId(3), 0).await.unwrap();
        let today = "2026-08-06".parse().unwrap();

        assert!(ledger.grant_if_due(UserId(3), today).await.unwrap());
        assert!(!ledger.grant_if_due(UserId(3), today).await.unwrap());
        assert_eq!(store.get(UserId(3)).await.unwrap().unwrap().credits, 1);
    }
}
