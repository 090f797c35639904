use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use futures_util::FutureExt;
use prometheus::Counter;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{Message, Role, Work};
use crate::error::PipelineError;
use crate::health::HealthMetrics;

/// Default bounded queue capacity per async replica.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Maximum messages processed before the end-of-batch hook runs.
pub const BATCH_SIZE: usize = 256;

enum Envelope {
    Message(Message),
    /// Closure executed on the consumer task, in queue order.
    Run(Box<dyn FnOnce() + Send>),
}

/// A replica with a bounded FIFO queue and one consumer task.
///
/// `send` waits while the queue is full; nothing is ever dropped by the
/// blocking path. The consumer handles messages strictly in enqueue order.
pub struct AsyncWorker {
    role: Role,
    replica: usize,
    capacity: usize,
    tx: mpsc::Sender<Envelope>,
}

impl AsyncWorker {
    /// Creates the queue and spawns the consumer on the current runtime.
    pub fn spawn<W: Work>(
        role: Role,
        replica: usize,
        capacity: usize,
        handler: Arc<W>,
        cancel: CancellationToken,
        health: &HealthMetrics,
    ) -> (Self, JoinHandle<()>) {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);

        let replica_label = replica.to_string();
        health
            .worker_queue_capacity
            .with_label_values(&[role.as_str(), &replica_label])
            .set(capacity as f64);

        let consumer = Consumer {
            role: role.clone(),
            replica,
            handler,
            received: health.events_received.with_label_values(&[role.as_str()]),
            dropped: health.events_dropped.with_label_values(&[role.as_str()]),
        };
        let task = tokio::spawn(consumer.run(rx, cancel));

        let worker = Self {
            role,
            replica,
            capacity,
            tx,
        };

        (worker, task)
    }

    pub fn role(&self) -> &Role {
        &self.role
    }

    pub fn replica(&self) -> usize {
        self.replica
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Messages currently waiting in the queue.
    pub fn queue_len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    /// Enqueues a message, waiting for a free slot when the queue is full.
    pub async fn send(&self, message: Message) -> Result<(), PipelineError> {
        self.tx
            .send(Envelope::Message(message))
            .await
            .map_err(|_| self.closed())
    }

    /// Enqueues from a thread outside the runtime, blocking while the queue
    /// is full. Panics if called from within an async context.
    pub fn blocking_send(&self, message: Message) -> Result<(), PipelineError> {
        self.tx
            .blocking_send(Envelope::Message(message))
            .map_err(|_| self.closed())
    }

    /// Enqueues without waiting. Returns `false` when the queue is full.
    pub fn try_send(&self, message: Message) -> Result<bool, PipelineError> {
        match self.tx.try_send(Envelope::Message(message)) {
            Ok(()) => Ok(true),
            Err(TrySendError::Full(_)) => Ok(false),
            Err(TrySendError::Closed(_)) => Err(self.closed()),
        }
    }

    /// Runs `f` on the consumer task after every message enqueued before it.
    pub async fn execute<F, R>(&self, f: F) -> Result<R, PipelineError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let job = Box::new(move || {
            let _ = reply_tx.send(f());
        });

        self.tx
            .send(Envelope::Run(job))
            .await
            .map_err(|_| self.closed())?;

        reply_rx.await.map_err(|_| self.closed())
    }

    /// Resolves once every previously enqueued message has been handled.
    pub async fn barrier(&self) -> Result<(), PipelineError> {
        self.execute(|| ()).await
    }

    fn closed(&self) -> PipelineError {
        PipelineError::QueueClosed {
            role: self.role.to_string(),
            replica: self.replica,
        }
    }
}

struct Consumer<W> {
    role: Role,
    replica: usize,
    handler: Arc<W>,
    received: Counter,
    dropped: Counter,
}

impl<W: Work> Consumer<W> {
    async fn run(self, mut rx: mpsc::Receiver<Envelope>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    // Refuse new sends, then handle whatever is already queued.
                    rx.close();
                    let mut drained = 0usize;
                    while let Ok(envelope) = rx.try_recv() {
                        self.process(envelope).await;
                        drained += 1;
                    }
                    if drained > 0 {
                        self.handler.on_batch_end();
                    }
                    tracing::debug!(
                        role = %self.role,
                        replica = self.replica,
                        drained,
                        "worker consumer stopped"
                    );
                    return;
                }

                envelope = rx.recv() => {
                    let Some(envelope) = envelope else {
                        return;
                    };
                    self.process(envelope).await;

                    // Drain what is immediately available, up to one batch.
                    for _ in 1..BATCH_SIZE {
                        match rx.try_recv() {
                            Ok(envelope) => self.process(envelope).await,
                            Err(_) => break,
                        }
                    }

                    self.handler.on_batch_end();
                }
            }
        }
    }

    /// Handles one envelope. Panics are caught so one bad message cannot
    /// stop the queue.
    async fn process(&self, envelope: Envelope) {
        match envelope {
            Envelope::Run(job) => {
                // The caller sees the dropped reply channel as an error.
                if catch_unwind(AssertUnwindSafe(job)).is_err() {
                    tracing::error!(
                        role = %self.role,
                        replica = self.replica,
                        "queued job panicked"
                    );
                }
            }
            Envelope::Message(message) => {
                self.received.inc();
                let subject = message.shared_key();

                let result = AssertUnwindSafe(self.handler.on_work(message))
                    .catch_unwind()
                    .await;

                let error = match result {
                    Ok(Ok(_)) => return,
                    Ok(Err(e)) => e,
                    Err(_) => anyhow::anyhow!("handler panicked"),
                };

                self.dropped.inc();
                tracing::warn!(
                    role = %self.role,
                    replica = self.replica,
                    identity = %subject,
                    error = %error,
                    "dropping message after processing error"
                );
            }
        }
    }
}
