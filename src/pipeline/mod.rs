//! The pipeline context: every registry, route and background task of one
//! aggregation pipeline, built from configuration at startup.

pub mod ingest;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::{Config, StorageBackend};
use crate::downsample::Downstream;
use crate::error::PipelineError;
use crate::event::{Kind, Row, TelemetryEvent};
use crate::health::HealthMetrics;
use crate::identity::Granularity;
use crate::persistence::{
    ClickHouseStorage, FlushRegistry, FlushTarget, MemoryStorage, MetricPersistenceWorker,
    PersistenceTimer, Persistent, RecordPersistenceWorker, RoundReport, RowQueryWorker, Storage,
};
use crate::routing::SelectorKind;
use crate::worker::{Message, Provider, Reply, Role, Work, WorkerMode, WorkerRefs, WorkerRegistry};

/// One running aggregation pipeline.
///
/// Owns the worker registry, the persistence timer and the storage backend.
/// Nothing here is global: tests build as many pipelines as they like.
pub struct Pipeline {
    registry: Arc<WorkerRegistry>,
    metrics: HashMap<String, HashMap<Granularity, WorkerRefs>>,
    records: HashMap<String, WorkerRefs>,
    query: WorkerRefs,
    timer: Arc<PersistenceTimer>,
    storage: Storage,
    health: Arc<HealthMetrics>,
    serve_health: bool,
    cancel: CancellationToken,
    timer_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Pipeline {
    /// Connects storage and builds every role. Must run inside a tokio
    /// runtime: async replicas spawn their consumers immediately.
    pub async fn build(cfg: &Config) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);

        let storage = match cfg.storage.backend {
            StorageBackend::Memory => Storage::Memory(Arc::new(MemoryStorage::new())),
            StorageBackend::ClickHouse => {
                let clickhouse = ClickHouseStorage::connect(cfg.storage.clickhouse.clone())
                    .await
                    .context("connecting ClickHouse storage")?;
                Storage::ClickHouse(Arc::new(clickhouse))
            }
        };

        Self::with_storage(cfg, storage, health)
    }

    /// Builds every role on top of an existing storage backend.
    pub fn with_storage(cfg: &Config, storage: Storage, health: Arc<HealthMetrics>) -> Result<Self> {
        health
            .storage_connected
            .with_label_values(&[storage.name()])
            .set(1.0);

        let mut registry = WorkerRegistry::new(Arc::clone(&health));
        let mut targets = FlushRegistry::new();

        let mut metrics = HashMap::with_capacity(cfg.metrics.len());
        for stream in &cfg.metrics {
            let schema = Arc::new(stream.schema());
            let replicas = cfg.replicas(stream.replicas);
            let mut routes = HashMap::new();

            // Coarser roles first: the minute role needs their refs.
            let mut downstream = Downstream::new();
            for granularity in stream.downsampling_targets().into_iter().rev() {
                let refs = register_flushed(
                    &mut registry,
                    &mut targets,
                    Role::stream(&stream.name, granularity),
                    replicas,
                    cfg.queue_capacity,
                    || {
                        Arc::new(MetricPersistenceWorker::new(
                            Role::stream(&stream.name, granularity),
                            granularity,
                            Arc::clone(&schema),
                            storage.clone(),
                            Arc::clone(&health),
                        )
                        .with_session(cfg.session)
                        .with_support_update(stream.support_update))
                    },
                    Persistent::Metric,
                )?;
                downstream = downstream.with_target(granularity, refs.clone());
                routes.insert(granularity, refs);
            }

            let minute = Role::stream(&stream.name, Granularity::Minute);
            let refs = register_flushed(
                &mut registry,
                &mut targets,
                minute.clone(),
                replicas,
                cfg.queue_capacity,
                || {
                    Arc::new(MetricPersistenceWorker::new(
                        minute.clone(),
                        Granularity::Minute,
                        Arc::clone(&schema),
                        storage.clone(),
                        Arc::clone(&health),
                    )
                    .with_downstream(downstream.clone())
                    .with_session(cfg.session)
                    .with_support_update(stream.support_update))
                },
                Persistent::Metric,
            )?;
            routes.insert(Granularity::Minute, refs);

            metrics.insert(stream.name.clone(), routes);
        }

        let mut records = HashMap::with_capacity(cfg.records.len());
        for stream in &cfg.records {
            let role = Role::record(&stream.name);
            let refs = register_flushed(
                &mut registry,
                &mut targets,
                role.clone(),
                cfg.replicas(stream.replicas),
                cfg.queue_capacity,
                || Arc::new(RecordPersistenceWorker::new(role.clone(), Arc::clone(&health))),
                Persistent::Record,
            )?;
            records.insert(stream.name.clone(), refs);
        }

        let query_storage = storage.clone();
        let query = registry.register(Provider {
            role: Role::new(RowQueryWorker::ROLE),
            replicas: cfg.query.replicas,
            mode: WorkerMode::Sync,
            selector: SelectorKind::RoundRobin,
            factory: move |_| Arc::new(RowQueryWorker::new(query_storage.clone())),
        })?;

        info!(
            roles = registry.len(),
            flush_targets = targets.len(),
            backend = storage.name(),
            "pipeline built"
        );

        let registry = Arc::new(registry);
        let timer = PersistenceTimer::new(
            targets,
            storage.clone(),
            Arc::clone(&registry),
            Arc::clone(&health),
        )
        .with_interval(cfg.flush_interval, cfg.initial_delay)
        .with_retention(cfg.retention.clone());

        Ok(Self {
            registry,
            metrics,
            records,
            query,
            timer: Arc::new(timer),
            storage,
            health,
            serve_health: cfg.health.enabled,
            cancel: CancellationToken::new(),
            timer_task: parking_lot::Mutex::new(None),
        })
    }

    /// Starts the health server (when enabled) and the persistence timer.
    pub async fn start(&self) -> Result<()> {
        if self.serve_health {
            self.health
                .start()
                .await
                .context("starting health metrics server")?;
        }

        let task = self.timer.start(self.cancel.child_token());
        *self.timer_task.lock() = Some(task);

        Ok(())
    }

    /// Routes `event` to the role owning its stream and granularity, waiting
    /// while that replica's queue is full.
    pub async fn deliver(&self, event: TelemetryEvent) -> Result<(), PipelineError> {
        self.route(&event)?.tell(Message::Event(event)).await
    }

    /// Like [`deliver`](Self::deliver) but returns `false` instead of waiting
    /// when the queue is full.
    pub fn try_deliver(&self, event: TelemetryEvent) -> Result<bool, PipelineError> {
        self.route(&event)?.try_tell(Message::Event(event))
    }

    /// Like [`deliver`](Self::deliver), for producers on plain OS threads.
    pub fn blocking_deliver(&self, event: TelemetryEvent) -> Result<(), PipelineError> {
        self.route(&event)?.blocking_tell(Message::Event(event))
    }

    /// Reads the persisted row stored under `key` through the `row-query`
    /// role.
    pub async fn lookup_row(&self, key: &str) -> Result<Option<Row>, PipelineError> {
        let reply = self
            .query
            .ask(Message::Lookup {
                key: key.to_string(),
            })
            .await?;

        match reply {
            Reply::Row(row) => Ok(row),
            Reply::Done => Ok(None),
        }
    }

    /// Handle to the replicas of `role`.
    pub fn lookup(&self, role: &str) -> Result<WorkerRefs, PipelineError> {
        self.registry.lookup(role)
    }

    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    pub fn health(&self) -> &Arc<HealthMetrics> {
        &self.health
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Runs one persistence round now, outside the timer schedule.
    pub async fn flush(&self) -> RoundReport {
        self.timer.run_round().await
    }

    /// Stops the timer, runs a final round over everything already queued,
    /// then drains and joins every consumer.
    pub async fn stop(&self) -> Result<()> {
        self.cancel.cancel();

        let task = self.timer_task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(error = %e, "persistence timer task failed");
            }
        }

        let report = self.timer.run_round().await;
        info!(
            requests = report.requests,
            written = report.written,
            failed = report.failed.len(),
            "final persistence round"
        );

        self.registry.shutdown().await;

        if let Err(e) = self.storage.stop().await {
            error!(error = %e, "error stopping storage");
        }
        self.health
            .storage_connected
            .with_label_values(&[self.storage.name()])
            .set(0.0);

        self.health.stop().await?;

        Ok(())
    }

    fn route(&self, event: &TelemetryEvent) -> Result<&WorkerRefs, PipelineError> {
        let name = event.identity.name();

        match event.kind {
            Kind::Metric => {
                let granularity = event.identity.bucket().granularity();
                self.metrics
                    .get(name)
                    .and_then(|routes| routes.get(&granularity))
                    .ok_or_else(|| {
                        PipelineError::RoleNotFound(Role::stream(name, granularity).to_string())
                    })
            }
            Kind::Record => self
                .records
                .get(name)
                .ok_or_else(|| PipelineError::RoleNotFound(Role::record(name).to_string())),
        }
    }
}

/// Registers an async key-hash role and adds each replica as a flush target.
fn register_flushed<W: Work>(
    registry: &mut WorkerRegistry,
    targets: &mut FlushRegistry,
    role: Role,
    replicas: usize,
    queue_capacity: usize,
    mut make: impl FnMut() -> Arc<W>,
    persistent: fn(Arc<W>) -> Persistent,
) -> Result<WorkerRefs, PipelineError> {
    let mut built = Vec::with_capacity(replicas);

    let refs = registry.register(Provider {
        role,
        replicas,
        mode: WorkerMode::Async { queue_capacity },
        selector: SelectorKind::KeyHash,
        factory: |_| {
            let worker = make();
            built.push(Arc::clone(&worker));
            worker
        },
    })?;

    for (replica, worker) in built.into_iter().enumerate() {
        targets.add(FlushTarget::new(refs.clone(), replica, persistent(worker)));
    }

    Ok(refs)
}
