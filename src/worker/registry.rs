use std::collections::HashMap;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{AsyncWorker, Role, SyncWorker, Work, Worker, WorkerRefs};
use crate::error::PipelineError;
use crate::health::HealthMetrics;
use crate::routing::{SelectorKind, WorkerSelector};

/// Execution variant of a role's replicas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerMode {
    Async { queue_capacity: usize },
    Sync,
}

/// Factory for the replicas of one role.
///
/// `factory` is called once per replica index, in order.
pub struct Provider<F> {
    pub role: Role,
    pub replicas: usize,
    pub mode: WorkerMode,
    pub selector: SelectorKind,
    pub factory: F,
}

/// Role to replica-set map for one pipeline.
///
/// Populated through `&mut self` during startup and shared read-only
/// afterwards.
pub struct WorkerRegistry {
    roles: HashMap<Role, WorkerRefs>,
    order: Vec<Role>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
    health: Arc<HealthMetrics>,
}

impl WorkerRegistry {
    pub fn new(health: Arc<HealthMetrics>) -> Self {
        Self {
            roles: HashMap::new(),
            order: Vec::new(),
            tasks: parking_lot::Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
            health,
        }
    }

    /// Builds every replica of `provider.role` and registers them.
    ///
    /// Async replicas spawn their consumer on the current tokio runtime.
    pub fn register<W, F>(&mut self, provider: Provider<F>) -> Result<WorkerRefs, PipelineError>
    where
        W: Work,
        F: FnMut(usize) -> Arc<W>,
    {
        let Provider {
            role,
            replicas,
            mode,
            selector,
            mut factory,
        } = provider;

        if self.roles.contains_key(&role) {
            return Err(PipelineError::DuplicateRole(role.to_string()));
        }

        let mut workers = Vec::with_capacity(replicas);
        for replica in 0..replicas {
            let handler = factory(replica);
            let worker = match mode {
                WorkerMode::Async { queue_capacity } => {
                    let (worker, task) = AsyncWorker::spawn(
                        role.clone(),
                        replica,
                        queue_capacity,
                        handler,
                        self.cancel.child_token(),
                        &self.health,
                    );
                    self.tasks.lock().push(task);
                    Worker::Async(worker)
                }
                WorkerMode::Sync => Worker::Sync(SyncWorker::new(role.clone(), replica, handler)),
            };
            workers.push(worker);
        }

        tracing::debug!(role = %role, replicas, ?mode, ?selector, "registered role");

        let refs = WorkerRefs::new(
            role.clone(),
            workers,
            WorkerSelector::new(selector),
            Arc::clone(&self.health),
        );
        self.roles.insert(role.clone(), refs.clone());
        self.order.push(role);

        Ok(refs)
    }

    /// Handle to the replicas of `role`.
    pub fn lookup(&self, role: &str) -> Result<WorkerRefs, PipelineError> {
        self.roles
            .get(role)
            .cloned()
            .ok_or_else(|| PipelineError::RoleNotFound(role.to_string()))
    }

    /// Registered roles in registration order.
    pub fn roles(&self) -> impl Iterator<Item = &WorkerRefs> {
        self.order.iter().filter_map(|role| self.roles.get(role))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Publishes queue length gauges for every async replica.
    pub fn record_queue_stats(&self) {
        for refs in self.roles() {
            refs.record_queue_stats();
        }
    }

    /// Stops every consumer after it drains its queue, then waits for them.
    pub async fn shutdown(&self) {
        self.cancel.cancel();

        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "worker consumer task failed");
            }
        }
    }
}
