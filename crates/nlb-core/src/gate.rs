//! Lookup gate: the per-request orchestration in front of the paid lookup.
//!
//! The order is deliberate: term validation, then the protection registry,
//! then the quota check, then the fetch. A credit is committed only after
//! the upstream returned a non-empty result.

use std::sync::Arc;

use crate::{
    domain::{CreditBalance, UserId},
    lookup::{LookupClient, SubscriberRecord},
    quota::{QuotaDecision, QuotaLedger},
    store::ProtectedRegistry,
    term::CanonicalTerm,
    Result,
};

#[derive(Clone, Debug)]
pub enum SearchOutcome {
    /// Non-empty result; exactly one credit was committed unless the user is
    /// unlimited.
    Hit {
        records: Vec<SubscriberRecord>,
        remaining: CreditBalance,
    },
    /// Upstream answered with an empty set. No credit was spent.
    NoResults,
    Denied(DenialReason),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DenialReason {
    InvalidTerm,
    Protected,
    NoCredits,
}

pub struct LookupGate {
    ledger: Arc<QuotaLedger>,
    protected: Arc<dyn ProtectedRegistry>,
    lookup: Arc<dyn LookupClient>,
}

impl LookupGate {
    pub fn new(
        ledger: Arc<QuotaLedger>,
        protected: Arc<dyn ProtectedRegistry>,
        lookup: Arc<dyn LookupClient>,
    ) -> Self {
        Self {
            ledger,
            protected,
            lookup,
        }
    }

    pub async fn search(&self, user: UserId, raw_term: &str) -> Result<SearchOutcome> {
        let Some(term) = CanonicalTerm::parse(raw_term) else {
            return Ok(SearchOutcome::Denied(DenialReason::InvalidTerm));
        };

        // Protection overrides everything, including unlimited status, and is
        // checked before quota is touched.
        if self.protected.contains(term.as_str()).await? {
            return Ok(SearchOutcome::Denied(DenialReason::Protected));
        }

        let balance = match self.ledger.check(user).await? {
            QuotaDecision::Allowed(balance) => balance,
            QuotaDecision::Denied => return Ok(SearchOutcome::Denied(DenialReason::NoCredits)),
        };

        let records = self.lookup.fetch(&term).await?;
        if records.is_empty() {
            // Credits are never spent on a non-answer.
            return Ok(SearchOutcome::NoResults);
        }

        let remaining = match balance {
            CreditBalance::Unlimited => CreditBalance::Unlimited,
            CreditBalance::Limited(_) => match self.ledger.commit(user).await? {
                Some(left) => CreditBalance::Limited(left),
                // A concurrent duplicate spent the last credit between the
                // check and the commit; the delivered result is a loss leader.
                None => CreditBalance::Limited(0),
            },
        };

        Ok(SearchOutcome::Hit { records, remaining })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, UserStore};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Lookup fake fed with a script of responses, consumed in order.
    #[derive(Default)]
    struct ScriptedLookup {
        responses: Mutex<VecDeque<Result<Vec<SubscriberRecord>>>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedLookup {
        fn push(&self, response: Result<Vec<SubscriberRecord>>) {
            self.responses.lock().unwrap().push_back(response);
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl LookupClient for ScriptedLookup {
        async fn fetch(&self, term: &CanonicalTerm) -> Result<Vec<SubscriberRecord>> {
            self.calls.lock().unwrap().push(term.as_str().to_string());
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(Vec::new()))
        }
    }

    fn records(n: usize) -> Vec<SubscriberRecord> {
        (0..n)
            .map(|i| SubscriberRecord {
                mobile: Some("9876543210".to_string()),
                name: Some(format!("subscriber {i}")),
                ..Default::default()
            })
            .collect()
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        lookup: Arc<ScriptedLookup>,
        gate: LookupGate,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let lookup = Arc::new(ScriptedLookup::default());
        let ledger = Arc::new(QuotaLedger::new(store.clone(), 2, 1));
        let gate = LookupGate::new(ledger, store.clone(), lookup.clone());
        Fixture { store, lookup, gate }
    }

    #[tokio::test]
    async fn invalid_term_is_denied_without_touching_anything() {
        let f = fixture();
        let out = f.gate.search(UserId(1), "not a number").await.unwrap();
        assert!(matches!(out, SearchOutcome::Denied(DenialReason::InvalidTerm)));
        assert_eq!(f.lookup.call_count(), 0);
        assert!(f.store.get(UserId(1)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn protected_term_denied_even_for_unlimited_user() {
        let f = fixture();
        f.store.add("9876543210").await.unwrap();
        f.store.create_if_absent(UserId(1), 5).await.unwrap();
        f.store.set_unlimited(UserId(1), true).await.unwrap();

        let out = f.gate.search(UserId(1), "+91 98765 43210").await.unwrap();
        assert!(matches!(out, SearchOutcome::Denied(DenialReason::Protected)));
        assert_eq!(f.lookup.call_count(), 0);
    }

    #[tokio::test]
    async fn exhausted_user_is_denied_before_the_fetch() {
        let f = fixture();
        f.store.create_if_absent(UserId(1), 2).await.unwrap();
        f.store.adjust_credits(UserId(1), -2).await.unwrap();

        let out = f.gate.search(UserId(1), "9876543210").await.unwrap();
        assert!(matches!(out, SearchOutcome::Denied(DenialReason::NoCredits)));
        assert_eq!(f.lookup.call_count(), 0);
    }

    #[tokio::test]
    async fn empty_result_leaves_credits_untouched() {
        let f = fixture();
        f.store.create_if_absent(UserId(1), 2).await.unwrap();
        f.lookup.push(Ok(Vec::new()));

        let out = f.gate.search(UserId(1), "9876543210").await.unwrap();
        assert!(matches!(out, SearchOutcome::NoResults));
        assert_eq!(f.store.get(UserId(1)).await.unwrap().unwrap().credits, 2);
    }

    #[tokio::test]
    async fn upstream_error_propagates_and_spends_nothing() {
        let f = fixture();
        f.store.create_if_absent(UserId(1), 2).await.unwrap();
        f.lookup
            .push(Err(crate::Error::Upstream("timed out".to_string())));

        let err = f.gate.search(UserId(1), "9876543210").await.unwrap_err();
        assert!(matches!(err, crate::Error::Upstream(_)));
        assert_eq!(f.store.get(UserId(1)).await.unwrap().unwrap().credits, 2);
    }

    #[tokio::test]
    async fn hit_commits_exactly_one_credit() {
        let f = fixture();
        f.store.create_if_absent(UserId(1), 2).await.unwrap();
        f.lookup.push(Ok(records(3)));

        let out = f.gate.search(UserId(1), "9876543210").await.unwrap();
        match out {
            SearchOutcome::Hit { records, remaining } => {
                assert_eq!(records.len(), 3);
                assert_eq!(remaining, CreditBalance::Limited(1));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unlimited_hit_spends_nothing() {
        let f = fixture();
        f.store.create_if_absent(UserId(1), 0).await.unwrap();
        f.store.set_unlimited(UserId(1), true).await.unwrap();
        f.lookup.push(Ok(records(1)));

        let out = f.gate.search(UserId(1), "9876543210").await.unwrap();
        match out {
            SearchOutcome::Hit { remaining, .. } => {
                assert_eq!(remaining, CreditBalance::Unlimited)
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(f.store.get(UserId(1)).await.unwrap().unwrap().credits, 0);
    }

    #[tokio::test]
    async fn two_searches_one_hit_one_empty_spend_one_credit() {
        let f = fixture();
        f.store.create_if_absent(UserId(1), 2).await.unwrap();
        f.lookup.push(Ok(records(3)));
        f.lookup.push(Ok(Vec::new()));

        let first = f.gate.search(UserId(1), "9876543210").await.unwrap();
        assert!(matches!(first, SearchOutcome::Hit { .. }));
        let second = f.gate.search(UserId(1), "9876543211").await.unwrap();
        assert!(matches!(second, SearchOutcome::NoResults));

        assert_eq!(f.store.get(UserId(1)).await.unwrap().unwrap().credits, 1);
    }

    /// Store wrapper that drains the user's last credit between the gate's
    /// check and its commit, emulating a concurrent duplicate request.
    struct RacingStore {
        inner: Arc<MemoryStore>,
        victim: UserId,
    }

    #[async_trait]
    impl UserStore for RacingStore {
        async fn get(&self, id: UserId) -> Result<Option<crate::domain::UserRecord>> {
            self.inner.get(id).await
        }

        async fn create_if_absent(
            &self,
            id: UserId,
            initial_credits: i64,
        ) -> Result<crate::domain::UserRecord> {
            self.inner.create_if_absent(id, initial_credits).await
        }

        async fn consume_credit(&self, id: UserId) -> Result<Option<i64>> {
            if id == self.victim {
                // The duplicate wins the race for the last credit.
                self.inner.consume_credit(id).await?;
            }
            self.inner.consume_credit(id).await
        }

        async fn grant_daily(
            &self,
            id: UserId,
            today: chrono::NaiveDate,
            amount: i64,
        ) -> Result<bool> {
            self.inner.grant_daily(id, today, amount).await
        }

        async fn set_unlimited(&self, id: UserId, unlimited: bool) -> Result<()> {
            self.inner.set_unlimited(id, unlimited).await
        }

        async fn adjust_credits(&self, id: UserId, delta: i64) -> Result<()> {
            self.inner.adjust_credits(id, delta).await
        }

        async fn all_users(
            &self,
        ) -> Result<futures_util::stream::BoxStream<'static, Result<crate::domain::UserRecord>>>
        {
            self.inner.all_users().await
        }

        async fn count(&self) -> Result<u64> {
            self.inner.count().await
        }
    }

    #[tokio::test]
    async fn void_commit_reports_zero_balance_not_negative() {
        let inner = Arc::new(MemoryStore::new());
        inner.create_if_absent(UserId(1), 1).await.unwrap();
        let store = Arc::new(RacingStore {
            inner: inner.clone(),
            victim: UserId(1),
        });
        let lookup = Arc::new(ScriptedLookup::default());
        lookup.push(Ok(records(1)));
        let ledger = Arc::new(QuotaLedger::new(store, 2, 1));
        let gate = LookupGate::new(ledger, inner.clone(), lookup);

        let out = gate.search(UserId(1), "9876543210").await.unwrap();
        match out {
            SearchOutcome::Hit { remaining, .. } => {
                assert_eq!(remaining, CreditBalance::Limited(0))
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(inner.get(UserId(1)).await.unwrap().unwrap().credits, 0);
    }
}
