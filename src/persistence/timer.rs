use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{FlushRegistry, Storage, WriteOp, WriteRequest};
use crate::config::RetentionConfig;
use crate::health::HealthMetrics;
use crate::identity::{Granularity, TimeBucket};
use crate::worker::{Role, WorkerRegistry};

/// Outcome of one persistence round.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RoundReport {
    /// Flush targets visited.
    pub workers: usize,
    /// Roles whose flush failed, one entry per failed replica.
    pub failed: Vec<Role>,
    /// Write requests in the combined batch.
    pub requests: usize,
    /// Requests acknowledged by storage; zero when the batch write failed.
    pub written: usize,
}

/// Drives persistence rounds on a fixed interval.
///
/// A round flushes every target sequentially, finest granularity first, then
/// writes all prepared requests in one batch. Rounds never overlap: the
/// shutdown round waits for a tick that is still running.
pub struct PersistenceTimer {
    targets: FlushRegistry,
    storage: Storage,
    registry: Arc<WorkerRegistry>,
    health: Arc<HealthMetrics>,
    interval: Duration,
    initial_delay: Duration,
    retention: RetentionConfig,
    last_purge: parking_lot::Mutex<Option<Instant>>,
    round: tokio::sync::Mutex<()>,
}

impl PersistenceTimer {
    pub fn new(
        targets: FlushRegistry,
        storage: Storage,
        registry: Arc<WorkerRegistry>,
        health: Arc<HealthMetrics>,
    ) -> Self {
        Self {
            targets,
            storage,
            registry,
            health,
            interval: Duration::from_secs(10),
            initial_delay: Duration::from_secs(5),
            retention: RetentionConfig::default(),
            last_purge: parking_lot::Mutex::new(None),
            round: tokio::sync::Mutex::new(()),
        }
    }

    pub fn with_interval(mut self, interval: Duration, initial_delay: Duration) -> Self {
        self.interval = interval;
        self.initial_delay = initial_delay;
        self
    }

    pub fn with_retention(mut self, retention: RetentionConfig) -> Self {
        self.retention = retention;
        self
    }

    /// Spawns the tick loop. The first round runs after the initial delay.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let timer = Arc::clone(self);

        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(timer.initial_delay) => {}
            }

            let mut ticker = tokio::time::interval(timer.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            info!(
                interval = ?timer.interval,
                targets = timer.targets.len(),
                "persistence timer started"
            );

            loop {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => break,

                    _ = ticker.tick() => {
                        let report = timer.run_round().await;
                        tracing::debug!(
                            workers = report.workers,
                            failed = report.failed.len(),
                            requests = report.requests,
                            written = report.written,
                            "persistence round"
                        );
                    }
                }
            }

            info!("persistence timer stopped");
        })
    }

    /// Flushes every target and writes the combined batch.
    pub async fn run_round(&self) -> RoundReport {
        let _round = self.round.lock().await;
        let round_started = Instant::now();

        let mut report = RoundReport::default();
        let mut requests: Vec<WriteRequest> = Vec::new();

        for target in self.targets.iter() {
            let role = target.role().as_str();
            let started = Instant::now();

            match target.flush().await {
                Ok(mut prepared) => requests.append(&mut prepared),
                Err(e) => {
                    self.health.flush_errors.with_label_values(&[role]).inc();
                    warn!(
                        role,
                        replica = target.replica(),
                        error = ?e,
                        "flush failed"
                    );
                    report.failed.push(target.role().clone());
                }
            }

            self.health
                .flush_duration
                .with_label_values(&[role])
                .observe(started.elapsed().as_secs_f64());
            report.workers += 1;
        }

        self.health
            .timer_prepare_latency
            .observe(round_started.elapsed().as_secs_f64());

        report.requests = requests.len();
        if !requests.is_empty() {
            report.written = self.execute(&requests).await;
        }

        self.purge_history().await;
        self.registry.record_queue_stats();

        self.health.timer_rounds.inc();
        self.health
            .timer_all_latency
            .observe(round_started.elapsed().as_secs_f64());

        report
    }

    /// Writes one combined batch. Failures are counted and not retried.
    async fn execute(&self, requests: &[WriteRequest]) -> usize {
        let started = Instant::now();
        self.health.batch_size.observe(requests.len() as f64);

        let result = self.storage.batch_write(requests).await;
        self.health
            .timer_execute_latency
            .observe(started.elapsed().as_secs_f64());

        let connected = self
            .health
            .storage_connected
            .with_label_values(&[self.storage.name()]);

        match result {
            Ok(()) => {
                connected.set(1.0);
                let updates = requests
                    .iter()
                    .filter(|r| r.op == WriteOp::Update)
                    .count();
                let inserts = requests.len() - updates;
                for (op, count) in [(WriteOp::Insert, inserts), (WriteOp::Update, updates)] {
                    self.health
                        .rows_written
                        .with_label_values(&[op.as_str()])
                        .inc_by(count as f64);
                }
                requests.len()
            }
            Err(e) => {
                connected.set(0.0);
                self.health.batch_errors.inc();
                tracing::error!(
                    backend = self.storage.name(),
                    requests = requests.len(),
                    error = ?e,
                    "batch write failed"
                );
                0
            }
        }
    }

    /// Removes rows older than their granularity's retention, at most once
    /// per check interval.
    async fn purge_history(&self) {
        if self.retention.is_empty() {
            return;
        }

        {
            let mut last = self.last_purge.lock();
            if last.is_some_and(|at| at.elapsed() < self.retention.check_interval) {
                return;
            }
            *last = Some(Instant::now());
        }

        let now = Utc::now().timestamp_millis();
        for granularity in Granularity::ALL {
            let Some(keep) = self.retention.get(granularity) else {
                continue;
            };

            let keep_ms = i64::try_from(keep.as_millis()).unwrap_or(i64::MAX);
            let cutoff = now.saturating_sub(keep_ms);
            let before = match TimeBucket::from_timestamp_millis(cutoff, granularity) {
                Ok(before) => before,
                Err(e) => {
                    warn!(%granularity, error = %e, "skipping history purge");
                    continue;
                }
            };

            match self.storage.delete_history(before).await {
                Ok(()) => info!(%granularity, before = before.value(), "purged history"),
                Err(e) => warn!(%granularity, error = ?e, "history purge failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downsample::Downstream;
    use crate::event::{fields, TelemetryEvent, Value};
    use crate::identity::Identity;
    use crate::persistence::{FlushTarget, MemoryStorage, MetricPersistenceWorker, Persistent};
    use crate::routing::SelectorKind;
    use crate::window::{MetricSchema, Reducer};
    use crate::worker::{Message, Provider, WorkerMode, WorkerRefs};

    struct Fixture {
        timer: PersistenceTimer,
        registry: Arc<WorkerRegistry>,
        memory: Arc<MemoryStorage>,
        minute: WorkerRefs,
        hour: WorkerRefs,
    }

    /// `cpu/hour` fed by `cpu/minute`, backed by memory storage.
    fn fixture() -> Fixture {
        let health = HealthMetrics::detached().unwrap();
        let memory = Arc::new(MemoryStorage::new());
        let storage = Storage::Memory(Arc::clone(&memory));
        let schema = Arc::new(MetricSchema::new("cpu").column("cpu", Reducer::Sum));

        let mut registry = WorkerRegistry::new(Arc::clone(&health));
        let mut targets = FlushRegistry::new();

        let mut register = |granularity: Granularity, downstream: Downstream| {
            let worker = Arc::new(MetricPersistenceWorker::new(
                Role::stream("cpu", granularity),
                granularity,
                Arc::clone(&schema),
                storage.clone(),
                Arc::clone(&health),
            )
            .with_downstream(downstream));
            let handler = Arc::clone(&worker);
            let refs = registry
                .register(Provider {
                    role: worker.role().clone(),
                    replicas: 1,
                    mode: WorkerMode::Async { queue_capacity: 64 },
                    selector: SelectorKind::KeyHash,
                    factory: move |_| Arc::clone(&handler),
                })
                .unwrap();
            targets.add(FlushTarget::new(refs.clone(), 0, Persistent::Metric(worker)));
            refs
        };

        let hour = register(Granularity::Hour, Downstream::new());
        let minute = register(
            Granularity::Minute,
            Downstream::new().with_target(Granularity::Hour, hour.clone()),
        );

        let registry = Arc::new(registry);
        let timer = PersistenceTimer::new(targets, storage, Arc::clone(&registry), health);

        Fixture {
            timer,
            registry,
            memory,
            minute,
            hour,
        }
    }

    fn cpu(bucket: i64, value: i64) -> Message {
        cpu_of("svc-A", bucket, value)
    }

    fn cpu_of(tag: &str, bucket: i64, value: i64) -> Message {
        let identity = Identity::new("cpu", TimeBucket::new(bucket).unwrap(), [tag]);
        Message::Event(TelemetryEvent::metric(identity, fields([("cpu", value)])))
    }

    fn stored_cpu(memory: &MemoryStorage, bucket: i64) -> Option<Value> {
        stored_cpu_of(memory, "svc-A", bucket)
    }

    fn stored_cpu_of(memory: &MemoryStorage, tag: &str, bucket: i64) -> Option<Value> {
        let identity = Identity::new("cpu", TimeBucket::new(bucket).unwrap(), [tag]);
        memory
            .row(&identity)
            .and_then(|row| row.fields.get("cpu").cloned())
    }

    #[tokio::test]
    async fn test_flush_registry_orders_finest_first() {
        let f = fixture();
        let order: Vec<_> = f.timer.targets.iter().map(|t| t.granularity()).collect();
        assert_eq!(order, vec![Granularity::Minute, Granularity::Hour]);
    }

    #[tokio::test]
    async fn test_round_persists_and_downsamples_in_one_pass() {
        let f = fixture();
        f.minute.tell(cpu(202401011001, 10)).await.unwrap();
        f.minute.tell(cpu(202401011001, 30)).await.unwrap();

        let report = f.timer.run_round().await;
        assert_eq!(report.workers, 2);
        assert!(report.failed.is_empty());
        assert_eq!(report.requests, 2);
        assert_eq!(report.written, 2);

        assert_eq!(stored_cpu(&f.memory, 202401011001), Some(Value::Int(40)));
        assert_eq!(stored_cpu(&f.memory, 2024010110), Some(Value::Int(40)));

        let second = f.timer.run_round().await;
        assert_eq!(second.requests, 0);
        assert_eq!(stored_cpu(&f.memory, 2024010110), Some(Value::Int(40)));

        f.registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_batch_write_is_counted_not_retried() {
        let f = fixture();
        f.minute.tell(cpu(202401011001, 5)).await.unwrap();

        f.memory.fail_writes(true);
        let report = f.timer.run_round().await;
        assert_eq!(report.requests, 2);
        assert_eq!(report.written, 0);

        let rendered = f.timer.health.render().unwrap();
        assert!(rendered.contains(r#"aggregoor_storage_connected{backend="memory"} 0"#));

        f.memory.fail_writes(false);
        let report = f.timer.run_round().await;
        assert_eq!(report.requests, 0);
        assert!(f.memory.is_empty());

        let rendered = f.timer.health.render().unwrap();
        assert!(rendered.contains("aggregoor_batch_errors_total 1"));

        f.minute.tell(cpu(202401011002, 1)).await.unwrap();
        let report = f.timer.run_round().await;
        assert_eq!(report.written, 2);

        let rendered = f.timer.health.render().unwrap();
        assert!(rendered.contains(r#"aggregoor_storage_connected{backend="memory"} 1"#));

        f.registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_unmergeable_row_does_not_block_other_identities() {
        let f = fixture();
        f.memory
            .batch_write(&[WriteRequest {
                op: WriteOp::Insert,
                row: crate::event::Row {
                    key: "cpu#202401011001#svc-A".to_string(),
                    name: "cpu".to_string(),
                    time_bucket: 202401011001,
                    kind: crate::event::Kind::Metric,
                    fields: fields([("cpu", "corrupt")]),
                },
            }])
            .unwrap();

        f.minute.tell(cpu_of("svc-A", 202401011001, 5)).await.unwrap();
        f.minute.tell(cpu_of("svc-B", 202401011001, 7)).await.unwrap();

        let report = f.timer.run_round().await;
        assert!(report.failed.is_empty());
        assert_eq!(report.requests, 2);
        assert_eq!(report.written, 2);

        assert_eq!(stored_cpu_of(&f.memory, "svc-B", 202401011001), Some(Value::Int(7)));
        assert_eq!(stored_cpu_of(&f.memory, "svc-B", 2024010110), Some(Value::Int(7)));
        assert_eq!(stored_cpu_of(&f.memory, "svc-A", 2024010110), None);
        assert_eq!(
            stored_cpu_of(&f.memory, "svc-A", 202401011001),
            Some(Value::Text("corrupt".to_string()))
        );

        let rendered = f.timer.health.render().unwrap();
        assert!(rendered.contains(r#"aggregoor_flush_errors_total{role="cpu/minute"} 1"#));

        f.registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_flush_failure_is_isolated_per_worker() {
        let f = fixture();
        f.minute.tell(cpu(202401011001, 5)).await.unwrap();
        f.hour.tell(cpu(2024010111, 7)).await.unwrap();

        // A stale hold makes the minute flush fail; the hour role still flushes.
        let minute_target = f.timer.targets.iter().next().unwrap().clone();
        let Persistent::Metric(minute_worker) = &minute_target.worker else {
            panic!("expected a metric target");
        };
        let stale = minute_worker.window().hold().unwrap();

        let report = f.timer.run_round().await;
        assert_eq!(report.failed, vec![Role::stream("cpu", Granularity::Minute)]);
        assert_eq!(stored_cpu(&f.memory, 2024010111), Some(Value::Int(7)));

        drop(stale);
        f.registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_retention_purges_old_rows() {
        let f = fixture();
        let timer = f.timer.with_retention(RetentionConfig {
            minute: Some(Duration::from_secs(60 * 60)),
            ..Default::default()
        });

        timer
            .storage
            .batch_write(&[WriteRequest {
                op: WriteOp::Insert,
                row: crate::event::Row {
                    key: "cpu#200001010000#svc-A".to_string(),
                    name: "cpu".to_string(),
                    time_bucket: 200001010000,
                    kind: crate::event::Kind::Metric,
                    fields: fields([("cpu", 1)]),
                },
            }])
            .await
            .unwrap();

        timer.run_round().await;
        assert!(f.memory.is_empty());

        f.registry.shutdown().await;
    }
}
