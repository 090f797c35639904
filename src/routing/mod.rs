//! Replica selection.
//!
//! A [`WorkerSelector`] picks the one replica of a role that receives a
//! message. Roles that hold aggregation state must use [`SelectorKind::KeyHash`]
//! so every update for one identity reaches the same window.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::Deserialize;

use crate::error::PipelineError;

/// Selection policy as named in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectorKind {
    /// Spread load evenly; no key affinity.
    RoundRobin,
    /// Route by hash of the routing key.
    #[default]
    KeyHash,
}

/// Picks a replica for a message.
#[derive(Debug)]
pub enum WorkerSelector {
    RoundRobin { next: AtomicUsize },
    KeyHash,
}

impl WorkerSelector {
    pub fn new(kind: SelectorKind) -> Self {
        match kind {
            SelectorKind::RoundRobin => Self::RoundRobin {
                next: AtomicUsize::new(0),
            },
            SelectorKind::KeyHash => Self::KeyHash,
        }
    }

    pub fn kind(&self) -> SelectorKind {
        match self {
            Self::RoundRobin { .. } => SelectorKind::RoundRobin,
            Self::KeyHash => SelectorKind::KeyHash,
        }
    }

    /// Selects the replica for `routing_key` among `replicas` of `role`.
    pub fn select<'a, T>(
        &self,
        role: &str,
        replicas: &'a [T],
        routing_key: &str,
    ) -> Result<&'a T, PipelineError> {
        if replicas.is_empty() {
            return Err(PipelineError::RoleNotFound(role.to_string()));
        }

        let index = match self {
            Self::RoundRobin { next } => next.fetch_add(1, Ordering::Relaxed) % replicas.len(),
            Self::KeyHash => shard_for(routing_key, replicas.len()),
        };

        Ok(&replicas[index])
    }
}

/// Stable shard index of `key` among `count` replicas.
///
/// `DefaultHasher::new()` uses fixed keys, so the result is identical across
/// calls and processes built with the same standard library.
pub fn shard_for(key: &str, count: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % count as u64) as usize
}
