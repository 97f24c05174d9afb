//! In-process store backend.
//!
//! Backs tests, the CLI simulator and single-process deployments. Concurrency
//! is bounded by a semaphore so pool exhaustion behaves like a real pool, and
//! latency/outage injection lets callers rehearse a degraded store.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use super::pool::{ConnectionPool, ListConnection};
use crate::{Error, Result};

#[derive(Debug, Default, Clone, Copy)]
struct Faults {
    latency: Duration,
    unavailable: bool,
}

#[derive(Debug, Default)]
struct Shared {
    lists: DashMap<String, VecDeque<String>>,
    scored: DashMap<String, BTreeMap<u64, String>>,
    sets: DashMap<String, BTreeSet<String>>,
    faults: RwLock<Faults>,
}

/// Semaphore-bounded pool over a shared in-memory list/set map
#[derive(Debug)]
pub struct MemoryPool {
    shared: Arc<Shared>,
    permits: Arc<Semaphore>,
    in_use: AtomicUsize,
}

impl MemoryPool {
    /// Create a pool allowing `max_connections` concurrent checkouts
    #[must_use]
    pub fn new(max_connections: usize) -> Self {
        Self {
            shared: Arc::new(Shared::default()),
            permits: Arc::new(Semaphore::new(max_connections)),
            in_use: AtomicUsize::new(0),
        }
    }

    /// Delay every operation by `latency`
    pub fn set_latency(&self, latency: Duration) {
        self.shared.faults.write().latency = latency;
    }

    /// Refuse new checkouts while `unavailable` is set
    pub fn set_unavailable(&self, unavailable: bool) {
        self.shared.faults.write().unavailable = unavailable;
    }

    /// Close the pool; pending and future checkouts fail
    pub fn close(&self) {
        self.permits.close();
    }

    /// Connections currently checked out
    #[must_use]
    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Relaxed)
    }

    /// Length of the list at `key`
    #[must_use]
    pub fn list_len(&self, key: &str) -> usize {
        self.shared.lists.get(key).map_or(0, |l| l.len())
    }

    /// Entries in the sorted set at `key`
    #[must_use]
    pub fn scored_len(&self, key: &str) -> usize {
        self.shared.scored.get(key).map_or(0, |s| s.len())
    }
}

#[async_trait]
impl ConnectionPool for MemoryPool {
    type Connection = MemoryConnection;

    async fn acquire(&self) -> Result<MemoryConnection> {
        if self.shared.faults.read().unavailable {
            return Err(Error::StoreUnavailable("connection refused".to_string()));
        }
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| Error::StoreUnavailable("pool closed".to_string()))?;
        self.in_use.fetch_add(1, Ordering::Relaxed);
        Ok(MemoryConnection {
            shared: Arc::clone(&self.shared),
            _permit: permit,
        })
    }

    fn release(&self, conn: MemoryConnection) {
        self.in_use.fetch_sub(1, Ordering::Relaxed);
        drop(conn);
    }
}

/// Checked-out handle; returns its permit when dropped
#[derive(Debug)]
pub struct MemoryConnection {
    shared: Arc<Shared>,
    _permit: OwnedSemaphorePermit,
}

impl MemoryConnection {
    async fn round_trip(&self) {
        let latency = self.shared.faults.read().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl ListConnection for MemoryConnection {
    async fn push_trimmed(&self, key: &str, values: Vec<String>, max_len: usize) -> Result<usize> {
        self.round_trip().await;
        let mut list = self.shared.lists.entry(key.to_string()).or_default();
        list.extend(values);
        while list.len() > max_len {
            list.pop_front();
        }
        Ok(list.len())
    }

    async fn range(&self, key: &str) -> Result<Vec<String>> {
        self.round_trip().await;
        Ok(self
            .shared
            .lists
            .get(key)
            .map(|l| l.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn add_scored(
        &self,
        key: &str,
        entries: Vec<(u64, String)>,
        max_len: usize,
    ) -> Result<usize> {
        self.round_trip().await;
        // The entry lock makes check-and-insert atomic across connections
        let mut set = self.shared.scored.entry(key.to_string()).or_default();
        let mut added = 0;
        for (score, value) in entries {
            if set.contains_key(&score) {
                continue;
            }
            if set.len() >= max_len && set.first_key_value().is_none_or(|(low, _)| score < *low) {
                continue;
            }
            set.insert(score, value);
            added += 1;
            while set.len() > max_len {
                set.pop_first();
            }
        }
        Ok(added)
    }

    async fn range_by_score(&self, key: &str) -> Result<Vec<String>> {
        self.round_trip().await;
        Ok(self
            .shared
            .scored
            .get(key)
            .map(|s| s.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn add_member(&self, key: &str, member: &str) -> Result<bool> {
        self.round_trip().await;
        Ok(self
            .shared
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string()))
    }

    async fn members(&self, key: &str) -> Result<Vec<String>> {
        self.round_trip().await;
        Ok(self
            .shared
            .sets
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn push_trims_oldest_first() {
        let pool = MemoryPool::new(2);
        let conn = pool.acquire().await.unwrap();
        let values = |r: std::ops::Range<u32>| r.map(|i| i.to_string()).collect::<Vec<_>>();

        assert_eq!(conn.push_trimmed("k", values(0..3), 4).await.unwrap(), 3);
        assert_eq!(conn.push_trimmed("k", values(3..6), 4).await.unwrap(), 4);
        assert_eq!(conn.range("k").await.unwrap(), vec!["2", "3", "4", "5"]);
        pool.release(conn);
        assert_eq!(pool.list_len("k"), 4);
    }

    #[tokio::test]
    async fn scored_entries_keep_first_write_per_score() {
        let pool = MemoryPool::new(2);
        let conn = pool.acquire().await.unwrap();
        let entries = |r: std::ops::Range<u64>, tag: &str| {
            r.map(|i| (i, format!("{tag}{i}"))).collect::<Vec<_>>()
        };

        assert_eq!(conn.add_scored("z", entries(0..3, "a"), 3).await.unwrap(), 3);
        // Existing scores are kept, new high scores push out the lowest
        assert_eq!(conn.add_scored("z", entries(2..5, "b"), 3).await.unwrap(), 2);
        assert_eq!(conn.range_by_score("z").await.unwrap(), vec!["a2", "b3", "b4"]);
        // A score below a full set is not added at all
        assert_eq!(conn.add_scored("z", entries(0..1, "c"), 3).await.unwrap(), 0);
        pool.release(conn);
        assert_eq!(pool.scored_len("z"), 3);
    }

    #[tokio::test]
    async fn missing_keys_read_empty() {
        let pool = MemoryPool::new(1);
        let conn = pool.acquire().await.unwrap();
        assert!(conn.range("nope").await.unwrap().is_empty());
        assert!(conn.range_by_score("nope").await.unwrap().is_empty());
        assert!(conn.members("nope").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn set_members_are_unique() {
        let pool = MemoryPool::new(1);
        let conn = pool.acquire().await.unwrap();
        assert!(conn.add_member("s", "a").await.unwrap());
        assert!(!conn.add_member("s", "a").await.unwrap());
        assert!(conn.add_member("s", "b").await.unwrap());
        assert_eq!(conn.members("s").await.unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn checkouts_are_counted_and_released() {
        let pool = MemoryPool::new(2);
        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        assert_eq!(pool.in_use(), 2);
        pool.release(a);
        pool.release(b);
        assert_eq!(pool.in_use(), 0);
    }

    #[tokio::test]
    async fn unavailable_and_closed_pools_refuse() {
        let pool = MemoryPool::new(1);
        pool.set_unavailable(true);
        assert!(matches!(pool.acquire().await, Err(Error::StoreUnavailable(_))));
        pool.set_unavailable(false);
        pool.close();
        assert!(matches!(pool.acquire().await, Err(Error::StoreUnavailable(_))));
    }
}
