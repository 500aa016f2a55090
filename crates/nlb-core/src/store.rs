//! Ports for the user-record store and the protected-term registry.
//!
//! Credit mutations are expressed as conditional operations so every backend
//! is forced into single-document atomic updates. A read-then-write pair at
//! the store boundary would lose updates under concurrent requests for the
//! same user.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use futures_util::stream::{self, BoxStream, StreamExt};

use crate::{
    domain::{UserId, UserRecord},
    Result,
};

/// Key-indexed store of per-user quota state.
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn get(&self, id: UserId) -> Result<Option<UserRecord>>;

    /// Insert a fresh record unless one already exists; returns the current
    /// record either way.
    async fn create_if_absent(&self, id: UserId, initial_credits: i64) -> Result<UserRecord>;

    /// Atomically decrement `credits` by 1 if `credits > 0 && !unlimited`.
    /// Returns the remaining balance, or `None` if the condition failed.
    async fn consume_credit(&self, id: UserId) -> Result<Option<i64>>;

    /// Atomically add `amount` credits and set `last_grant_date = today`, if
    /// `last_grant_date != today`. Returns whether the grant applied.
    async fn grant_daily(&self, id: UserId, today: NaiveDate, amount: i64) -> Result<bool>;

    /// Set the unlimited override, creating the record if absent.
    async fn set_unlimited(&self, id: UserId, unlimited: bool) -> Result<()>;

    /// Add `delta` (may be negative) to the balance, creating the record if
    /// absent. The stored balance is clamped at 0.
    async fn adjust_credits(&self, id: UserId, delta: i64) -> Result<()>;

    /// Cursor over the user population. Users created or removed while the
    /// cursor is open may or may not be yielded; callers must not assume a
    /// point-in-time snapshot.
    async fn all_users(&self) -> Result<BoxStream<'static, Result<UserRecord>>>;

    async fn count(&self) -> Result<u64>;
}

/// Denylist of search terms, consulted before quota is touched.
#[async_trait]
pub trait ProtectedRegistry: Send + Sync {
    async fn contains(&self, term: &str) -> Result<bool>;

    /// Returns `false` if the term was already protected.
    async fn add(&self, term: &str) -> Result<bool>;

    /// Returns `false` if the term was not protected.
    async fn remove(&self, term: &str) -> Result<bool>;

    async fn list(&self) -> Result<Vec<String>>;
}

/// In-memory store with the same conditional-update semantics as the Mongo
/// backend. Backs the unit tests; also usable as a throwaway dev backend.
#[derive(Default)]
pub struct MemoryStore {
    users: Mutex<BTreeMap<i64, UserRecord>>,
    protected: Mutex<BTreeSet<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn fresh(id: UserId, credits: i64) -> UserRecord {
        UserRecord {
            id,
            credits,
            unlimited: false,
            last_grant_date: None,
            created_at: Utc::now(),
        }
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn get(&self, id: UserId) -> Result<Option<UserRecord>> {
        Ok(self.users.lock().unwrap().get(&id.0).cloned())
    }

    async fn create_if_absent(&self, id: UserId, initial_credits: i64) -> Result<UserRecord> {
        let mut users = self.users.lock().unwrap();
        let rec = users
            .entry(id.0)
            .or_insert_with(|| Self::fresh(id, initial_credits));
        Ok(rec.clone())
    }

    async fn consume_credit(&self, id: UserId) -> Result<Option<i64>> {
        let mut users = self.users.lock().unwrap();
        match users.get_mut(&id.0) {
            Some(rec) if !rec.unlimited && rec.credits > 0 => {
                rec.credits -= 1;
                Ok(Some(rec.credits))
            }
            _ => Ok(None),
        }
    }

    async fn grant_daily(&self, id: UserId, today: NaiveDate, amount: i64) -> Result<bool> {
        let mut users = self.users.lock().unwrap();
        match users.get_mut(&id.0) {
            Some(rec) if rec.last_grant_date != Some(today) => {
                rec.credits += amount;
                rec.last_grant_date = Some(today);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn set_unlimited(&self, id: UserId, unlimited: bool) -> Result<()> {
        let mut users = self.users.lock().unwrap();
        let rec = users.entry(id.0).or_insert_with(|| Self::fresh(id, 0));
        rec.unlimited = unlimited;
        Ok(())
    }

    async fn adjust_credits(&self, id: UserId, delta: i64) -> Result<()> {
        let mut users = self.users.lock().unwrap();
        let rec = users.entry(id.0).or_insert_with(|| Self::fresh(id, 0));
        rec.credits = (rec.credits + delta).max(0);
        Ok(())
    }

    async fn all_users(&self) -> Result<BoxStream<'static, Result<UserRecord>>> {
        // Snapshot; close enough to a live cursor for a process-local map.
        let snapshot: Vec<Result<UserRecord>> =
            self.users.lock().unwrap().values().cloned().map(Ok).collect();
        Ok(stream::iter(snapshot).boxed())
    }

    async fn count(&self) -> Result<u64> {
        Ok(self.users.lock().unwrap().len() as u64)
    }
}

#[async_trait]
impl ProtectedRegistry for MemoryStore {
    async fn contains(&self, term: &str) -> Result<bool> {
        Ok(self.protected.lock().unwrap().contains(term))
    }

    async fn add(&self, term: &str) -> Result<bool> {
        Ok(self.protected.lock().unwrap().insert(term.to_string()))
    }

    async fn remove(&self, term: &str) -> Result<bool> {
        Ok(self.protected.lock().unwrap().remove(term))
    }

    async fn list(&self) -> Result<Vec<String>> {
        Ok(self.protected.lock().unwrap().iter().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn consume_refuses_at_zero_and_for_unlimited() {
        let store = MemoryStore::new();
        store.create_if_absent(UserId(1), 1).await.unwrap();

        assert_eq!(store.consume_credit(UserId(1)).await.unwrap(), Some(0));
        assert_eq!(store.consume_credit(UserId(1)).await.unwrap(), None);

        store.set_unlimited(UserId(1), true).await.unwrap();
        store.adjust_credits(UserId(1), 5).await.unwrap();
        assert_eq!(store.consume_credit(UserId(1)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn grant_is_idempotent_per_date() {
        let store = MemoryStore::new();
        store.create_if_absent(UserId(7), 0).await.unwrap();

        assert!(store.grant_daily(UserId(7), date("2026-08-06"), 1).await.unwrap());
        assert!(!store.grant_daily(UserId(7), date("2026-08-06"), 1).await.unwrap());
        assert!(store.grant_daily(UserId(7), date("2026-08-07"), 1).await.unwrap());

        let rec = store.get(UserId(7)).await.unwrap().unwrap();
        assert_eq!(rec.credits, 2);
        assert_eq!(rec.last_grant_date, Some(date("2026-08-07")));
    }

    #[tokio::test]
    async fn adjust_clamps_at_zero_and_upserts() {
        let store = MemoryStore::new();
        store.adjust_credits(UserId(3), -10).await.unwrap();
        assert_eq!(store.get(UserId(3)).await.unwrap().unwrap().credits, 0);

        store.adjust_credits(UserId(3), 4).await.unwrap();
        store.adjust_credits(UserId(3), -2).await.unwrap();
        assert_eq!(store.get(UserId(3)).await.unwrap().unwrap().credits, 2);
    }

    #[tokio::test]
    async fn create_if_absent_keeps_existing_record() {
        let store = MemoryStore::new();
        store.create_if_absent(UserId(9), 2).await.unwrap();
        store.consume_credit(UserId(9)).await.unwrap();

        let rec = store.create_if_absent(UserId(9), 2).await.unwrap();
        assert_eq!(rec.credits, 1);
    }

    #[tokio::test]
    async fn registry_round_trip() {
        let store = MemoryStore::new();
        assert!(store.add("9876543210").await.unwrap());
        assert!(!store.add("9876543210").await.unwrap());
        assert!(store.contains("9876543210").await.unwrap());
        assert_eq!(store.list().await.unwrap(), vec!["9876543210".to_string()]);
        assert!(store.remove("9876543210").await.unwrap());
        assert!(!store.contains("9876543210").await.unwrap());
    }
}
