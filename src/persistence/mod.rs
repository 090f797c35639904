//! Scheduled drain of aggregation windows into row storage.

pub mod clickhouse;
pub mod memory;
pub mod query;
pub mod session;
pub mod storage;
pub mod timer;
pub mod worker;

pub use clickhouse::ClickHouseStorage;
pub use memory::MemoryStorage;
pub use query::RowQueryWorker;
pub use session::SessionCache;
pub use storage::Storage;
pub use timer::{PersistenceTimer, RoundReport};
pub use worker::{MetricPersistenceWorker, RecordPersistenceWorker};

use std::sync::Arc;

use anyhow::{anyhow, Result};

use crate::event::Row;
use crate::identity::Granularity;
use crate::worker::{Role, Worker, WorkerRefs};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOp {
    /// No row existed for the key when the batch was prepared.
    Insert,
    /// The row was read, merged and is written back.
    Update,
}

impl WriteOp {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
        }
    }
}

/// One row write in a combined batch.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteRequest {
    pub op: WriteOp,
    pub row: Row,
}

/// A persistence worker implementation behind a flush target.
#[derive(Clone)]
pub enum Persistent {
    Metric(Arc<MetricPersistenceWorker>),
    Record(Arc<RecordPersistenceWorker>),
}

impl Persistent {
    /// Granularity used to order flushes; records rank with minutes.
    fn granularity(&self) -> Granularity {
        match self {
            Self::Metric(w) => w.granularity(),
            Self::Record(_) => Granularity::Minute,
        }
    }
}

/// One async replica whose window the timer drains.
#[derive(Clone)]
pub struct FlushTarget {
    refs: WorkerRefs,
    replica: usize,
    worker: Persistent,
}

impl FlushTarget {
    pub fn new(refs: WorkerRefs, replica: usize, worker: Persistent) -> Self {
        Self {
            refs,
            replica,
            worker,
        }
    }

    pub fn role(&self) -> &Role {
        self.refs.role()
    }

    pub fn replica(&self) -> usize {
        self.replica
    }

    pub fn granularity(&self) -> Granularity {
        self.worker.granularity()
    }

    /// Holds the replica's window on its own consumer and turns the drained
    /// entries into write requests.
    pub async fn flush(&self) -> Result<Vec<WriteRequest>> {
        let queue = self
            .refs
            .replicas()
            .get(self.replica)
            .and_then(Worker::as_async)
            .ok_or_else(|| anyhow!("{} replica {} has no queue", self.role(), self.replica))?;

        match &self.worker {
            Persistent::Metric(w) => w.flush(queue).await,
            Persistent::Record(w) => w.flush(queue).await,
        }
    }
}

/// Flush targets ordered finest granularity first.
///
/// Populated while persistence workers are constructed, so that a finer
/// role's forwarded deltas are queued before the coarser role is held in the
/// same round.
#[derive(Clone, Default)]
pub struct FlushRegistry {
    targets: Vec<FlushTarget>,
}

impl FlushRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, target: FlushTarget) {
        // Stable: equal granularities keep registration order.
        let at = self
            .targets
            .partition_point(|t| t.granularity() <= target.granularity());
        self.targets.insert(at, target);
    }

    pub fn iter(&self) -> impl Iterator<Item = &FlushTarget> {
        self.targets.iter()
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}
