//! Double-buffered aggregation window.
//!
//! Writers always target the buffer currently installed as active. `hold()`
//! swaps a fresh buffer in with one atomic pointer exchange and hands the
//! previous one out for draining. A write racing with the swap lands in
//! exactly one of the two buffers: writers pin the buffer they loaded with a
//! strong reference, and `hold()` waits for those references to go away
//! before returning the held buffer.

pub mod aggregate;
pub mod histogram;

pub use aggregate::{Formula, MetricAggregate, MetricSchema, RecordAggregate, Reducer};
pub use histogram::Boundaries;

use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use dashmap::DashMap;

use crate::error::PipelineError;
use crate::identity::Identity;

/// One side of the double buffer.
pub struct Buffer<K, V> {
    entries: DashMap<K, V>,
}

impl<K: Eq + Hash, V> Buffer<K, V> {
    fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Active/held buffer pair keyed by `K`.
pub struct Window<K, V> {
    active: ArcSwap<Buffer<K, V>>,
    holding: Arc<AtomicBool>,
}

impl<K, V> Window<K, V>
where
    K: Eq + Hash + Clone,
    V: Default,
{
    pub fn new() -> Self {
        Self {
            active: ArcSwap::from_pointee(Buffer::new()),
            holding: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Applies `f` to the aggregate for `key` in the active buffer, creating a
    /// zero aggregate first if needed.
    pub fn get_or_create<R>(&self, key: K, f: impl FnOnce(&mut V) -> R) -> R {
        // `load_full` takes a strong reference; `hold` waits on it.
        let buffer = self.active.load_full();
        let mut entry = buffer.entries.entry(key).or_default();
        f(entry.value_mut())
    }

    /// Installs a fresh active buffer and returns the previous one as held.
    ///
    /// Fails with [`PipelineError::WindowAlreadyHeld`] until the previous
    /// [`Held`] is released.
    pub fn hold(&self) -> Result<Held<K, V>, PipelineError> {
        if self
            .holding
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(PipelineError::WindowAlreadyHeld);
        }

        let buffer = self.active.swap(Arc::new(Buffer::new()));

        // Writers that loaded the old buffer before the swap finish first.
        while Arc::strong_count(&buffer) > 1 {
            std::thread::yield_now();
        }

        Ok(Held {
            buffer,
            holding: Arc::clone(&self.holding),
        })
    }

    pub fn is_held(&self) -> bool {
        self.holding.load(Ordering::Acquire)
    }

    /// Entries in the active buffer.
    pub fn active_len(&self) -> usize {
        self.active.load().len()
    }
}

impl<K, V> Default for Window<K, V>
where
    K: Eq + Hash + Clone,
    V: Default,
{
    fn default() -> Self {
        Self::new()
    }
}

/// The held side of a window. Dropping it releases the hold.
pub struct Held<K, V> {
    buffer: Arc<Buffer<K, V>>,
    holding: Arc<AtomicBool>,
}

impl<K: Eq + Hash + Clone, V> Held<K, V> {
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Removes and returns every entry of the held buffer.
    pub fn drain(&self) -> Vec<(K, V)> {
        let keys: Vec<K> = self
            .buffer
            .entries
            .iter()
            .map(|entry| entry.key().clone())
            .collect();

        keys.into_iter()
            .filter_map(|key| self.buffer.entries.remove(&key))
            .collect()
    }

    /// Discards the held buffer.
    pub fn release(self) {}
}

impl<K, V> Drop for Held<K, V> {
    fn drop(&mut self) {
        self.holding.store(false, Ordering::Release);
    }
}

/// Key of one record: the identity plus the sub-key separating records that
/// share it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordKey {
    pub identity: Identity,
    pub sub_key: String,
}

impl RecordKey {
    /// Storage address of the record.
    pub fn storage_key(&self) -> String {
        self.identity.record_key(&self.sub_key)
    }
}
