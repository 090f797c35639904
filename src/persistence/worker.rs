use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};

use super::{SessionCache, Storage, WriteOp, WriteRequest};
use crate::config::SessionConfig;
use crate::downsample::Downstream;
use crate::error::PipelineError;
use crate::event::{Kind, Row};
use crate::health::HealthMetrics;
use crate::identity::{Granularity, Identity};
use crate::window::{MetricAggregate, MetricSchema, RecordAggregate, RecordKey, Window};
use crate::worker::{AsyncWorker, Message, Reply, Role, Work};

/// Aggregates one metric stream at one granularity.
///
/// Events merge into the active window on the consumer task. At flush the
/// held window is merged with the persisted rows, and the drained deltas are
/// forwarded to the coarser roles.
///
/// Persisted rows are looked up in the session cache first; storage is read
/// once per flush, in one batch, for the misses. An entry that cannot be
/// merged with its stored row is skipped at every granularity without
/// affecting the rest of the flush.
pub struct MetricPersistenceWorker {
    role: Role,
    granularity: Granularity,
    schema: Arc<MetricSchema>,
    window: Arc<Window<Identity, MetricAggregate>>,
    storage: Storage,
    downstream: Downstream,
    health: Arc<HealthMetrics>,
    session: SessionCache,
    keep_session: bool,
    support_update: bool,
}

impl MetricPersistenceWorker {
    pub fn new(
        role: Role,
        granularity: Granularity,
        schema: Arc<MetricSchema>,
        storage: Storage,
        health: Arc<HealthMetrics>,
    ) -> Self {
        let session = SessionConfig::default();

        Self {
            role,
            granularity,
            schema,
            window: Arc::new(Window::new()),
            storage,
            downstream: Downstream::new(),
            health,
            session: SessionCache::new(session.timeout),
            keep_session: session.enabled,
            support_update: true,
        }
    }

    /// Coarser roles fed with this worker's deltas.
    pub fn with_downstream(mut self, downstream: Downstream) -> Self {
        self.downstream = downstream;
        self
    }

    pub fn with_session(mut self, session: SessionConfig) -> Self {
        self.session = SessionCache::new(session.timeout);
        self.keep_session = session.enabled;
        self
    }

    /// With `false`, a stored row is never rewritten: later deltas for it
    /// are discarded.
    pub fn with_support_update(mut self, support_update: bool) -> Self {
        self.support_update = support_update;
        self
    }

    pub fn role(&self) -> &Role {
        &self.role
    }

    pub fn granularity(&self) -> Granularity {
        self.granularity
    }

    pub fn window(&self) -> &Window<Identity, MetricAggregate> {
        &self.window
    }

    pub fn session(&self) -> &SessionCache {
        &self.session
    }

    /// Drains the window through `queue` and prepares the row writes.
    pub(crate) async fn flush(&self, queue: &AsyncWorker) -> Result<Vec<WriteRequest>> {
        let window = Arc::clone(&self.window);
        let held = queue.execute(move || window.hold()).await??;
        let mut deltas = held.drain();
        held.release();

        let now = Instant::now();
        if !self.keep_session {
            self.session.clear();
        }

        // A rejected first event leaves an empty aggregate behind.
        deltas.retain(|(_, delta)| !delta.is_empty());
        if deltas.is_empty() {
            self.session.expire(now);
            return Ok(Vec::new());
        }

        let mut stored = match self.load_uncached(&deltas).await {
            Ok(stored) => stored,
            Err(e) => {
                let restored = self.restore_uncached(&mut deltas);
                self.count_flush_error();
                tracing::warn!(
                    role = %self.role,
                    restored,
                    error = ?e,
                    "reading stored rows failed, retrying next round"
                );
                HashMap::new()
            }
        };

        let mut requests = Vec::with_capacity(deltas.len());
        let mut kept = Vec::with_capacity(deltas.len());
        let mut discarded = 0usize;

        for (identity, delta) in deltas {
            let existing = match self.session.get(&identity) {
                Some(cached) => Some(cached),
                None => stored
                    .remove(identity.key())
                    .map(|row| MetricAggregate::from_fields(&self.schema, &row.fields)),
            };

            let (op, merged) = match existing {
                None => (WriteOp::Insert, delta.clone()),
                Some(existing) if !self.support_update => {
                    self.session.put(identity.clone(), existing, now);
                    discarded += 1;
                    kept.push((identity, delta));
                    continue;
                }
                Some(mut existing) => match existing.merge(&self.schema, &delta) {
                    Ok(()) => (WriteOp::Update, existing),
                    Err(e) => {
                        self.session.remove(&identity);
                        self.count_flush_error();
                        tracing::warn!(
                            role = %self.role,
                            identity = %identity,
                            error = %e,
                            "skipping entry whose stored row cannot be merged"
                        );
                        continue;
                    }
                },
            };

            requests.push(WriteRequest {
                op,
                row: Row {
                    key: identity.key().to_string(),
                    name: identity.name().to_string(),
                    time_bucket: identity.bucket().value(),
                    kind: Kind::Metric,
                    fields: merged.to_row_fields(&self.schema),
                },
            });
            self.session.put(identity.clone(), merged, now);
            kept.push((identity, delta));
        }

        // The requests stand even when forwarding fails part way.
        let forwarded = match self.downstream.forward(&self.schema, &kept).await {
            Ok(forwarded) => forwarded,
            Err(e) => {
                self.count_flush_error();
                tracing::error!(
                    role = %self.role,
                    error = %e,
                    "forwarding deltas to coarser roles failed"
                );
                0
            }
        };

        let expired = self.session.expire(now);

        self.health
            .flushed_entries
            .with_label_values(&[self.role.as_str()])
            .inc_by(kept.len() as f64);
        self.health
            .downsampled_entries
            .with_label_values(&[self.role.as_str()])
            .inc_by(forwarded as f64);

        tracing::debug!(
            role = %self.role,
            entries = kept.len(),
            requests = requests.len(),
            discarded,
            forwarded,
            cached = self.session.len(),
            expired,
            elapsed_ms = now.elapsed().as_millis() as u64,
            "prepared metric rows"
        );

        Ok(requests)
    }

    /// Reads the stored rows of every entry missing from the session cache.
    async fn load_uncached(
        &self,
        deltas: &[(Identity, MetricAggregate)],
    ) -> Result<HashMap<String, Row>> {
        let keys: Vec<String> = deltas
            .iter()
            .filter(|(identity, _)| !self.session.contains(identity))
            .map(|(identity, _)| identity.key().to_string())
            .collect();

        let rows = self
            .storage
            .multi_get(&keys)
            .await
            .with_context(|| format!("reading {} stored rows", keys.len()))?;

        Ok(rows.into_iter().map(|row| (row.key.clone(), row)).collect())
    }

    /// Moves the entries without a cached row back into the active window.
    fn restore_uncached(&self, deltas: &mut Vec<(Identity, MetricAggregate)>) -> usize {
        let mut restored = 0;

        deltas.retain(|(identity, delta)| {
            if self.session.contains(identity) {
                return true;
            }

            let merged = self
                .window
                .get_or_create(identity.clone(), |agg| agg.merge(&self.schema, delta));
            if let Err(e) = merged {
                tracing::warn!(
                    role = %self.role,
                    identity = %identity,
                    error = %e,
                    "dropping entry that cannot be restored"
                );
            }
            restored += 1;
            false
        });

        restored
    }

    fn count_flush_error(&self) {
        self.health
            .flush_errors
            .with_label_values(&[self.role.as_str()])
            .inc();
    }
}

impl Work for MetricPersistenceWorker {
    async fn on_work(&self, message: Message) -> Result<Reply> {
        let label = message.label();
        let Message::Event(event) = message else {
            return Err(PipelineError::UnsupportedMessage {
                role: self.role.to_string(),
                message: label,
            }
            .into());
        };

        if event.kind != Kind::Metric {
            bail!("{} accepts metrics only, got a {}", self.role, event.kind.as_str());
        }

        let granularity = event.identity.bucket().granularity();
        if granularity != self.granularity {
            bail!(
                "{} expects {} buckets, got {} for {}",
                self.role,
                self.granularity,
                granularity,
                event.identity
            );
        }

        let schema = &self.schema;
        let fields = &event.fields;
        self.window
            .get_or_create(event.identity, |agg| agg.merge_fields(schema, fields))?;

        Ok(Reply::Done)
    }
}

/// Keeps the latest payload per record key and writes it at flush.
pub struct RecordPersistenceWorker {
    role: Role,
    window: Arc<Window<RecordKey, RecordAggregate>>,
    health: Arc<HealthMetrics>,
}

impl RecordPersistenceWorker {
    pub fn new(role: Role, health: Arc<HealthMetrics>) -> Self {
        Self {
            role,
            window: Arc::new(Window::new()),
            health,
        }
    }

    pub fn role(&self) -> &Role {
        &self.role
    }

    pub(crate) async fn flush(&self, queue: &AsyncWorker) -> Result<Vec<WriteRequest>> {
        let window = Arc::clone(&self.window);
        let held = queue.execute(move || window.hold()).await??;
        let drained = held.drain();
        held.release();

        self.health
            .flushed_entries
            .with_label_values(&[self.role.as_str()])
            .inc_by(drained.len() as f64);

        // Records replace on write, so storage is never read here.
        let requests = drained
            .into_iter()
            .map(|(key, record)| WriteRequest {
                op: WriteOp::Insert,
                row: Row {
                    key: key.storage_key(),
                    name: key.identity.name().to_string(),
                    time_bucket: key.identity.bucket().value(),
                    kind: Kind::Record,
                    fields: record.into_fields(),
                },
            })
            .collect();

        Ok(requests)
    }
}

impl Work for RecordPersistenceWorker {
    async fn on_work(&self, message: Message) -> Result<Reply> {
        let label = message.label();
        let Message::Event(event) = message else {
            return Err(PipelineError::UnsupportedMessage {
                role: self.role.to_string(),
                message: label,
            }
            .into());
        };

        if event.kind != Kind::Record {
            bail!("{} accepts records only, got a {}", self.role, event.kind.as_str());
        }

        let Some(sub_key) = event.sub_key else {
            bail!("record {} has no sub_key", event.identity);
        };

        let key = RecordKey {
            identity: event.identity,
            sub_key,
        };
        let fields = event.fields;
        self.window.get_or_create(key, |record| record.replace(fields));

        Ok(Reply::Done)
    }
}
