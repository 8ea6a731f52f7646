//! Bounded key to mutex store with TTL eviction
//!
//! Serializes work that shares a secondary resource (for example the
//! credential set of one cluster) across concurrent reconciliations of
//! different objects. Built once at startup and passed by `Arc`.
//!
//! This is best-effort and single-process; writers in other processes are
//! caught by the store's optimistic concurrency instead.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;

/// Default maximum number of idle entries kept
pub const DEFAULT_LOCK_CAPACITY: usize = 1024;

/// Default idle time after which an unused entry is dropped
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(600);

struct Entry {
    mutex: Arc<Mutex<()>>,
    last_used: Instant,
}

/// Named mutexes keyed by string
pub struct KeyedLocks {
    entries: DashMap<String, Entry>,
    capacity: usize,
    ttl: Duration,
}

impl Default for KeyedLocks {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_CAPACITY, DEFAULT_LOCK_TTL)
    }
}

impl KeyedLocks {
    /// Create a store holding at most `capacity` idle entries for `ttl`
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            capacity: capacity.max(1),
            ttl,
        }
    }

    /// Acquire the mutex for `key`, waiting for any current holder
    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let mutex = {
            let mut entry = self.entries.entry(key.to_string()).or_insert_with(|| Entry {
                mutex: Arc::new(Mutex::new(())),
                last_used: Instant::now(),
            });
            entry.last_used = Instant::now();
            entry.mutex.clone()
        };
        self.evict();
        mutex.lock_owned().await
    }

    /// Number of entries currently tracked
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no entries are tracked
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop idle entries past their TTL, then the oldest idle ones over capacity
    ///
    /// An entry is idle when nothing but the store holds its mutex; entries
    /// with a holder or a waiter are never dropped, so two callers can never
    /// end up with different mutexes for the same key.
    fn evict(&self) {
        let now = Instant::now();
        self.entries.retain(|_, entry| {
            Arc::strong_count(&entry.mutex) > 1 || now.duration_since(entry.last_used) < self.ttl
        });

        let excess = self.entries.len().saturating_sub(self.capacity);
        if excess == 0 {
            return;
        }
        let mut idle: Vec<(String, Instant)> = self
            .entries
            .iter()
            .filter(|e| Arc::strong_count(&e.mutex) == 1)
            .map(|e| (e.key().clone(), e.last_used))
            .collect();
        idle.sort_by_key(|(_, used)| *used);
        for (key, _) in idle.into_iter().take(excess) {
            self.entries
                .remove_if(&key, |_, entry| Arc::strong_count(&entry.mutex) == 1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_same_key_is_serialized() {
        let locks = Arc::new(KeyedLocks::default());
        let inside = Arc::new(AtomicU32::new(0));
        let max_inside = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let inside = inside.clone();
            let max_inside = max_inside.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.lock("default/prod").await;
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_inside.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_different_keys_do_not_block() {
        let locks = KeyedLocks::default();
        let _a = locks.lock("a").await;
        let b = tokio::time::timeout(Duration::from_millis(50), locks.lock("b")).await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn test_idle_entries_expire() {
        let locks = KeyedLocks::new(10, Duration::from_millis(20));
        drop(locks.lock("a").await);
        assert_eq!(locks.len(), 1);

        tokio::time::sleep(Duration::from_millis(40)).await;
        drop(locks.lock("b").await);
        assert_eq!(locks.len(), 1);
    }

    #[tokio::test]
    async fn test_capacity_evicts_oldest_idle_but_not_held() {
        let locks = KeyedLocks::new(2, Duration::from_secs(600));
        let held = locks.lock("held").await;
        drop(locks.lock("idle-1").await);
        drop(locks.lock("idle-2").await);
        drop(locks.lock("idle-3").await);

        assert!(locks.len() <= 3);
        assert!(locks.entries.contains_key("held"));
        drop(held);
    }
}
