use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use super::{Message, Reply, Role, Work};
use crate::error::PipelineError;

type JobFuture = Pin<Box<dyn Future<Output = anyhow::Result<Reply>> + Send>>;
type Job = Box<dyn Fn(Message) -> JobFuture + Send + Sync>;

/// A replica invoked by direct call.
///
/// Calls on one instance are serialized, so handlers need not be reentrant.
pub struct SyncWorker {
    role: Role,
    replica: usize,
    job: Job,
    gate: tokio::sync::Mutex<()>,
}

impl SyncWorker {
    pub fn new<W: Work>(role: Role, replica: usize, handler: Arc<W>) -> Self {
        let job: Job = Box::new(move |message| -> JobFuture {
            let handler = Arc::clone(&handler);
            Box::pin(async move { handler.on_work(message).await })
        });

        Self {
            role,
            replica,
            job,
            gate: tokio::sync::Mutex::new(()),
        }
    }

    pub fn role(&self) -> &Role {
        &self.role
    }

    pub fn replica(&self) -> usize {
        self.replica
    }

    /// Runs the handler and returns its reply. Handler errors propagate.
    pub async fn allocate_job(&self, message: Message) -> Result<Reply, PipelineError> {
        let _serialized = self.gate.lock().await;
        (self.job)(message).await.map_err(PipelineError::Job)
    }
}
