use std::sync::Arc;

use super::{Message, Reply, Role, Worker};
use crate::error::PipelineError;
use crate::health::HealthMetrics;
use crate::routing::WorkerSelector;

/// Producer-side handle to every replica of one role.
///
/// Cloning is cheap; all clones share the replica set and the selector state.
#[derive(Clone)]
pub struct WorkerRefs {
    role: Role,
    replicas: Arc<[Worker]>,
    selector: Arc<WorkerSelector>,
    health: Arc<HealthMetrics>,
}

impl WorkerRefs {
    pub(crate) fn new(
        role: Role,
        replicas: Vec<Worker>,
        selector: WorkerSelector,
        health: Arc<HealthMetrics>,
    ) -> Self {
        Self {
            role,
            replicas: replicas.into(),
            selector: Arc::new(selector),
            health,
        }
    }

    pub fn role(&self) -> &Role {
        &self.role
    }

    pub fn replicas(&self) -> &[Worker] {
        &self.replicas
    }

    /// Replica that `message` routes to.
    pub fn select(&self, message: &Message) -> Result<&Worker, PipelineError> {
        self.selector
            .select(self.role.as_str(), &self.replicas, message.routing_key())
    }

    /// Delivers `message` to one replica.
    ///
    /// Async replicas enqueue and wait only for queue space. Sync replicas run
    /// the handler inline and the reply is discarded.
    pub async fn tell(&self, message: Message) -> Result<(), PipelineError> {
        match self.select(&message)? {
            Worker::Async(worker) => worker.send(message).await,
            Worker::Sync(worker) => worker.allocate_job(message).await.map(|_| ()),
        }
    }

    /// Delivers from a plain OS thread, blocking while the selected queue is
    /// full. Must not be called from within an async context.
    pub fn blocking_tell(&self, message: Message) -> Result<(), PipelineError> {
        match self.select(&message)? {
            Worker::Async(worker) => worker.blocking_send(message),
            Worker::Sync(_) => Err(PipelineError::UnsupportedMessage {
                role: self.role.to_string(),
                message: "blocking",
            }),
        }
    }

    /// Delivers without waiting for queue space.
    ///
    /// Returns `false`, and counts the rejection, when the selected queue is
    /// full.
    pub fn try_tell(&self, message: Message) -> Result<bool, PipelineError> {
        match self.select(&message)? {
            Worker::Async(worker) => {
                let accepted = worker.try_send(message)?;
                if !accepted {
                    self.health
                        .events_rejected
                        .with_label_values(&[self.role.as_str()])
                        .inc();
                }
                Ok(accepted)
            }
            Worker::Sync(_) => Err(PipelineError::UnsupportedMessage {
                role: self.role.to_string(),
                message: "non-blocking",
            }),
        }
    }

    /// Runs `message` on a sync replica and returns its reply.
    pub async fn ask(&self, message: Message) -> Result<Reply, PipelineError> {
        match self.select(&message)? {
            Worker::Sync(worker) => worker.allocate_job(message).await,
            Worker::Async(worker) => Err(PipelineError::UnsupportedAsk {
                role: self.role.to_string(),
                replica: worker.replica(),
            }),
        }
    }

    /// Publishes queue length gauges for async replicas.
    pub fn record_queue_stats(&self) {
        for worker in self.replicas.iter().filter_map(Worker::as_async) {
            self.health
                .worker_queue_length
                .with_label_values(&[self.role.as_str(), &worker.replica().to_string()])
                .set(worker.queue_len() as f64);
        }
    }
}
