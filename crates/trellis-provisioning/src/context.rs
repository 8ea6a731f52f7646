//! Shared controller context
//!
//! One [`Context`] is built at startup and handed to every controller by
//! `Arc`. It carries the store, the runtime settings, the keyed lock store
//! and the apply engine, so components never reach for globals.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use kube::runtime::controller::Action;
use trellis_common::keyed_lock::KeyedLocks;
use trellis_common::store::ObjectStore;
use trellis_common::{Error, Settings};

use crate::apply::ApplyEngine;

/// Dependencies shared by the provisioning controllers
pub struct Context {
    /// Backing object store (trait object for testability)
    pub store: Arc<dyn ObjectStore>,
    /// Runtime settings
    pub settings: Arc<Settings>,
    /// Per-key mutexes for work that spans objects (credential issuance)
    pub locks: Arc<KeyedLocks>,
    /// Materializes desired object sets
    pub apply: ApplyEngine,
    /// Consecutive transient failures per object key
    pub failures: FailureCounter,
}

impl Context {
    /// Build a context over `store`, sizing the lock store from `settings`
    pub fn new(store: Arc<dyn ObjectStore>, settings: Settings) -> Self {
        let locks = Arc::new(KeyedLocks::new(settings.lock_capacity, settings.lock_ttl));
        Self::with_locks(store, settings, locks)
    }

    /// Build a context sharing an existing lock store
    pub fn with_locks(
        store: Arc<dyn ObjectStore>,
        settings: Settings,
        locks: Arc<KeyedLocks>,
    ) -> Self {
        let apply = ApplyEngine::new(
            store.clone(),
            settings.system_namespace.clone(),
            settings.owner_references,
        );
        Self {
            store,
            settings: Arc::new(settings),
            locks,
            apply,
            failures: FailureCounter::default(),
        }
    }
}

/// Requeue interval after a transient failure
const RETRY_REQUEUE: Duration = Duration::from_secs(5);

/// Requeue decision shared by the controllers' error policies
///
/// Permanent and security failures wait for the object to change; retrying
/// them cannot succeed. Everything else requeues shortly.
pub fn action_for_error(error: &Error) -> Action {
    if error.is_permanent() || error.is_security() {
        Action::await_change()
    } else {
        Action::requeue(RETRY_REQUEUE)
    }
}

/// Counts consecutive transient failures per key
///
/// Controllers only surface a "Waiting" condition once the count passes
/// the configured threshold; a success resets it.
#[derive(Default)]
pub struct FailureCounter {
    counts: DashMap<String, u32>,
}

impl FailureCounter {
    /// Record a failure and return the new consecutive count
    pub fn record(&self, key: &str) -> u32 {
        let mut entry = self.counts.entry(key.to_string()).or_insert(0);
        *entry += 1;
        *entry
    }

    /// Current consecutive count
    pub fn get(&self, key: &str) -> u32 {
        self.counts.get(key).map(|c| *c).unwrap_or(0)
    }

    /// Forget failures for `key` after a success
    pub fn reset(&self, key: &str) {
        self.counts.remove(key);
    }
}
