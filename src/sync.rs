//! Named locks — single-flight coordination keyed by string
//!
//! A [`MutexMap`] hands out one async mutex per key on demand. The
//! turbocharger uses these so that N concurrent cache misses for the same
//! content produce exactly one origin download: the first caller to win
//! `try_lock` hydrates the cache, everyone else parks on `lock` and re-reads
//! the cache afterwards.
//!
//! Entries are never removed; memory cost is O(distinct keys observed), which
//! for content IDs is bounded by the size of the deployed sites.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// A map of named async mutexes, created on demand
#[derive(Default)]
pub struct MutexMap {
    inner: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl MutexMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to take the lock for `key` without waiting.
    /// Returns a guard if this caller was first, `None` if somebody else
    /// already holds it.
    pub fn try_lock(&self, key: &str) -> Option<OwnedMutexGuard<()>> {
        self.entry(key).try_lock_owned().ok()
    }

    /// Wait for the lock for `key`.
    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let entry = self.entry(key);
        entry.lock_owned().await
    }

    fn entry(&self, key: &str) -> Arc<Mutex<()>> {
        let mut map = self.inner.lock().expect("mutex map poisoned");
        map.entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_first_try_lock_wins() {
        let locks = MutexMap::new();
        let guard = locks.try_lock("a");
        assert!(guard.is_some());

        // same key is now contended
        assert!(locks.try_lock("a").is_none());

        // a different key is independent
        assert!(locks.try_lock("b").is_some());
    }

    #[tokio::test]
    async fn test_release_allows_relock() {
        let locks = MutexMap::new();
        let guard = locks.try_lock("a").unwrap();
        drop(guard);
        assert!(locks.try_lock("a").is_some());
    }

    #[tokio::test]
    async fn test_lock_waits_for_holder() {
        let locks = Arc::new(MutexMap::new());
        let guard = locks.try_lock("key").unwrap();

        let locks2 = locks.clone();
        let waiter = tokio::spawn(async move {
            let _guard = locks2.lock("key").await;
        });

        // the waiter cannot finish while we hold the lock
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        drop(guard);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn test_single_winner_under_contention() {
        let locks = Arc::new(MutexMap::new());

        let mut winners = 0;
        let mut guards = Vec::new();
        for _ in 0..10 {
            if let Some(g) = locks.try_lock("contended") {
                winners += 1;
                guards.push(g);
            }
        }
        assert_eq!(winners, 1);
    }
}
