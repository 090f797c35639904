//! Actor-style worker runtime.
//!
//! Workers come in two closed variants sharing one capability trait:
//!
//! - [`AsyncWorker`]: bounded FIFO queue drained by a single consumer task.
//!   Senders wait when the queue is full.
//! - [`SyncWorker`]: invoked by direct call; the caller awaits the reply.
//!
//! Replicas of one [`Role`] are created by a [`Provider`] and registered in a
//! [`WorkerRegistry`], which hands out [`WorkerRefs`] to producers.

mod async_worker;
mod refs;
mod registry;
mod sync_worker;

pub use async_worker::{AsyncWorker, BATCH_SIZE, DEFAULT_QUEUE_CAPACITY};
pub use refs::WorkerRefs;
pub use registry::{Provider, WorkerMode, WorkerRegistry};
pub use sync_worker::SyncWorker;

use std::borrow::Borrow;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use crate::event::{Row, TelemetryEvent};
use crate::identity::Granularity;

/// Logical responsibility shared by interchangeable replicas.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Role(Arc<str>);

impl Role {
    pub fn new(name: impl Into<String>) -> Self {
        Self(Arc::from(name.into()))
    }

    /// Role aggregating metric stream `stream` at `granularity`.
    pub fn stream(stream: &str, granularity: Granularity) -> Self {
        Self::new(format!("{stream}/{granularity}"))
    }

    /// Role persisting record stream `stream`.
    pub fn record(stream: &str) -> Self {
        Self::new(format!("{stream}/record"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for Role {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Role({})", self.0)
    }
}

/// A unit of work addressed to a role.
#[derive(Debug, Clone)]
pub enum Message {
    /// Telemetry to aggregate.
    Event(TelemetryEvent),
    /// Request for the persisted row stored under `key`.
    Lookup { key: String },
}

impl Message {
    /// Key used by key-hash selectors.
    pub fn routing_key(&self) -> &str {
        match self {
            Self::Event(event) => event.identity.key(),
            Self::Lookup { key } => key,
        }
    }

    pub fn shared_key(&self) -> Arc<str> {
        match self {
            Self::Event(event) => event.identity.shared_key(),
            Self::Lookup { key } => Arc::from(key.as_str()),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Event(_) => "event",
            Self::Lookup { .. } => "lookup",
        }
    }
}

/// Result of handling a message.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Done,
    Row(Option<Row>),
}

/// The single capability every worker implements.
pub trait Work: Send + Sync + 'static {
    /// Handles one message.
    fn on_work(&self, message: Message) -> impl Future<Output = anyhow::Result<Reply>> + Send;

    /// Called by async consumers after each drained batch.
    fn on_batch_end(&self) {}
}

/// One replica of a role.
pub enum Worker {
    Async(AsyncWorker),
    Sync(SyncWorker),
}

impl Worker {
    pub fn role(&self) -> &Role {
        match self {
            Self::Async(w) => w.role(),
            Self::Sync(w) => w.role(),
        }
    }

    pub fn replica(&self) -> usize {
        match self {
            Self::Async(w) => w.replica(),
            Self::Sync(w) => w.replica(),
        }
    }

    pub fn as_async(&self) -> Option<&AsyncWorker> {
        match self {
            Self::Async(w) => Some(w),
            Self::Sync(_) => None,
        }
    }
}
