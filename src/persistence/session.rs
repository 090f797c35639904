use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::identity::Identity;
use crate::window::MetricAggregate;

struct Cached {
    aggregate: MetricAggregate,
    last_update: Instant,
}

/// Aggregates this process has persisted, keyed by identity.
///
/// A hit spares the storage read at flush time. Entries not touched for
/// `timeout` are evicted, so rows of past buckets do not pile up.
pub struct SessionCache {
    entries: DashMap<Identity, Cached>,
    timeout: Duration,
}

impl SessionCache {
    pub fn new(timeout: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            timeout,
        }
    }

    pub fn get(&self, identity: &Identity) -> Option<MetricAggregate> {
        self.entries
            .get(identity)
            .map(|cached| cached.aggregate.clone())
    }

    pub fn contains(&self, identity: &Identity) -> bool {
        self.entries.contains_key(identity)
    }

    pub fn put(&self, identity: Identity, aggregate: MetricAggregate, now: Instant) {
        self.entries.insert(
            identity,
            Cached {
                aggregate,
                last_update: now,
            },
        );
    }

    pub fn remove(&self, identity: &Identity) {
        self.entries.remove(identity);
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Evicts entries idle for longer than the timeout. Returns how many.
    pub fn expire(&self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, cached| now.saturating_duration_since(cached.last_update) <= self.timeout);
        before - self.entries.len()
    }
}
