use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::identity::Granularity;
use crate::window::histogram;
use crate::window::{Boundaries, Formula, MetricSchema, Reducer};
use crate::worker::DEFAULT_QUEUE_CAPACITY;

/// Top-level configuration for the aggregation pipeline.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Bounded queue capacity of every async replica. Default: 1024.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Default replica count of each aggregating role. Default: 2.
    #[serde(default = "default_replica_count")]
    pub replica_count: usize,

    /// Interval between persistence rounds. Default: 10s.
    #[serde(default = "default_flush_interval", with = "humantime_serde")]
    pub flush_interval: Duration,

    /// Delay before the first persistence round. Default: 5s.
    #[serde(default = "default_initial_delay", with = "humantime_serde")]
    pub initial_delay: Duration,

    /// Row storage configuration.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,

    /// Row lookup role configuration.
    #[serde(default)]
    pub query: QueryConfig,

    /// How long persisted rows are kept, per granularity.
    #[serde(default)]
    pub retention: RetentionConfig,

    /// Cache of rows persisted by this process.
    #[serde(default)]
    pub session: SessionConfig,

    /// Metric streams and their columns.
    #[serde(default)]
    pub metrics: Vec<MetricStreamConfig>,

    /// Record streams.
    #[serde(default)]
    pub records: Vec<RecordStreamConfig>,
}

/// Row storage configuration.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct StorageConfig {
    /// Backend kind. Default: memory.
    #[serde(default)]
    pub backend: StorageBackend,

    /// ClickHouse connection configuration, used by the clickhouse backend.
    #[serde(default)]
    pub clickhouse: ClickHouseConfig,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    #[default]
    Memory,
    #[serde(rename = "clickhouse")]
    ClickHouse,
}

/// ClickHouse connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ClickHouseConfig {
    /// ClickHouse native protocol address (host:port).
    #[serde(default)]
    pub endpoint: String,

    /// Target database name. Default: "default".
    #[serde(default = "default_database")]
    pub database: String,

    /// Row table name. Default: "aggregated_rows".
    #[serde(default = "default_table")]
    pub table: String,

    /// Maximum rows per INSERT statement. Default: 10000.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// ClickHouse username.
    #[serde(default)]
    pub username: String,

    /// ClickHouse password.
    #[serde(default)]
    pub password: String,

    /// Create the row table on startup if missing. Default: true.
    #[serde(default = "default_true")]
    pub create_table: bool,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Deserialize)]
pub struct HealthConfig {
    /// Serve /metrics and /healthz. Default: true.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

/// Row lookup role configuration.
#[derive(Debug, Deserialize)]
pub struct QueryConfig {
    /// Replicas of the `row-query` role. Default: 1.
    #[serde(default = "default_query_replicas")]
    pub replicas: usize,
}

/// Per-worker cache of persisted rows, consulted before storage reads.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct SessionConfig {
    /// Keep rows across rounds. When off, storage is read every round.
    /// Default: true.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Rows not updated for this long are evicted. Default: 70s.
    #[serde(default = "default_session_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

/// Row retention per granularity. Absent means rows are kept forever.
#[derive(Debug, Clone, Deserialize)]
pub struct RetentionConfig {
    #[serde(default, with = "humantime_serde")]
    pub minute: Option<Duration>,

    #[serde(default, with = "humantime_serde")]
    pub hour: Option<Duration>,

    #[serde(default, with = "humantime_serde")]
    pub day: Option<Duration>,

    #[serde(default, with = "humantime_serde")]
    pub month: Option<Duration>,

    /// Minimum time between two purges. Default: 1h.
    #[serde(default = "default_retention_check_interval", with = "humantime_serde")]
    pub check_interval: Duration,
}

/// One metric stream: its columns, derived formulas and coarser
/// granularities.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricStreamConfig {
    pub name: String,

    /// Replicas per granularity role. Default: `replica_count`.
    #[serde(default)]
    pub replicas: Option<usize>,

    pub columns: Vec<ColumnConfig>,

    #[serde(default)]
    pub formulas: Vec<FormulaConfig>,

    /// Coarser granularities maintained by downsampling.
    /// Default: [hour, day, month].
    #[serde(default = "default_downsampling")]
    pub downsampling: Vec<Granularity>,

    /// Merge new deltas into stored rows. When false, a row is written once
    /// and later deltas for it are discarded. Default: true.
    #[serde(default = "default_true")]
    pub support_update: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ColumnConfig {
    pub name: String,
    pub reducer: ReducerKind,

    /// Histogram upper bounds in milliseconds. Empty selects the defaults.
    #[serde(default)]
    pub boundaries: Vec<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReducerKind {
    Sum,
    Max,
    Min,
    Latest,
    Histogram,
}

/// Derived ratio column `numerator / denominator`.
#[derive(Debug, Clone, Deserialize)]
pub struct FormulaConfig {
    pub name: String,
    pub numerator: String,
    pub denominator: String,
}

/// One record stream.
#[derive(Debug, Clone, Deserialize)]
pub struct RecordStreamConfig {
    pub name: String,

    /// Replicas of the record role. Default: `replica_count`.
    #[serde(default)]
    pub replicas: Option<usize>,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

fn default_replica_count() -> usize {
    2
}

fn default_flush_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_true() -> bool {
    true
}

fn default_database() -> String {
    "default".to_string()
}

fn default_table() -> String {
    "aggregated_rows".to_string()
}

fn default_batch_size() -> usize {
    10000
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

fn default_query_replicas() -> usize {
    1
}

fn default_retention_check_interval() -> Duration {
    Duration::from_secs(60 * 60)
}

fn default_session_timeout() -> Duration {
    Duration::from_secs(70)
}

fn default_downsampling() -> Vec<Granularity> {
    vec![Granularity::Hour, Granularity::Day, Granularity::Month]
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            queue_capacity: default_queue_capacity(),
            replica_count: default_replica_count(),
            flush_interval: default_flush_interval(),
            initial_delay: default_initial_delay(),
            storage: StorageConfig::default(),
            health: HealthConfig::default(),
            query: QueryConfig::default(),
            retention: RetentionConfig::default(),
            session: SessionConfig::default(),
            metrics: Vec::new(),
            records: Vec::new(),
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            minute: None,
            hour: None,
            day: None,
            month: None,
            check_interval: default_retention_check_interval(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout: default_session_timeout(),
        }
    }
}

impl Default for ClickHouseConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            database: default_database(),
            table: default_table(),
            batch_size: default_batch_size(),
            username: String::new(),
            password: String::new(),
            create_table: true,
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            addr: default_health_addr(),
        }
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            replicas: default_query_replicas(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        Self::from_yaml(&contents)
            .with_context(|| format!("parsing config file {}", path.display()))
    }

    /// Parse and validate configuration from YAML text.
    pub fn from_yaml(contents: &str) -> Result<Self> {
        let cfg: Config = serde_yaml::from_str(contents)?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            bail!("queue_capacity must be positive");
        }

        if self.replica_count == 0 {
            bail!("replica_count must be positive");
        }

        if self.flush_interval.is_zero() {
            bail!("flush_interval must be positive");
        }

        if self.query.replicas == 0 {
            bail!("query.replicas must be positive");
        }

        if self.session.enabled && self.session.timeout.is_zero() {
            bail!("session.timeout must be positive when the session is enabled");
        }

        if self.storage.backend == StorageBackend::ClickHouse {
            if self.storage.clickhouse.endpoint.is_empty() {
                bail!("storage.clickhouse.endpoint is required for the clickhouse backend");
            }
            if self.storage.clickhouse.batch_size == 0 {
                bail!("storage.clickhouse.batch_size must be positive");
            }
        }

        for granularity in Granularity::ALL {
            if self.retention.get(granularity).is_some_and(|d| d.is_zero()) {
                bail!("retention.{granularity} must be positive when set");
            }
        }

        if self.metrics.is_empty() && self.records.is_empty() {
            bail!("at least one metric or record stream is required");
        }

        let mut streams = HashSet::new();
        let names = self
            .metrics
            .iter()
            .map(|m| (&m.name, m.replicas))
            .chain(self.records.iter().map(|r| (&r.name, r.replicas)));

        for (name, replicas) in names {
            if name.is_empty() || name.contains('/') {
                bail!("invalid stream name {name:?}: must be non-empty and contain no '/'");
            }
            if !streams.insert(name.as_str()) {
                bail!("stream {name} is declared more than once");
            }
            if replicas == Some(0) {
                bail!("stream {name}: replicas must be positive");
            }
        }

        for stream in &self.metrics {
            stream.validate()?;
        }

        Ok(())
    }

    /// Replica count for a stream, falling back to `replica_count`.
    pub fn replicas(&self, requested: Option<usize>) -> usize {
        requested.unwrap_or(self.replica_count)
    }
}

impl RetentionConfig {
    pub fn get(&self, granularity: Granularity) -> Option<Duration> {
        match granularity {
            Granularity::Minute => self.minute,
            Granularity::Hour => self.hour,
            Granularity::Day => self.day,
            Granularity::Month => self.month,
        }
    }

    pub fn is_empty(&self) -> bool {
        Granularity::ALL.iter().all(|g| self.get(*g).is_none())
    }
}

impl MetricStreamConfig {
    fn validate(&self) -> Result<()> {
        let name = &self.name;

        if self.columns.is_empty() {
            bail!("metric stream {name}: at least one column is required");
        }

        let mut columns = HashSet::new();
        for column in &self.columns {
            if !columns.insert(column.name.as_str()) {
                bail!("metric stream {name}: column {} declared twice", column.name);
            }
            if column.reducer == ReducerKind::Histogram && !histogram::is_valid(&column.boundaries)
            {
                bail!(
                    "metric stream {name}: column {} boundaries must be finite and strictly increasing",
                    column.name
                );
            }
        }

        for formula in &self.formulas {
            if columns.contains(formula.name.as_str()) {
                bail!("metric stream {name}: formula {} shadows a column", formula.name);
            }
            for operand in [&formula.numerator, &formula.denominator] {
                if !columns.contains(operand.as_str()) {
                    bail!(
                        "metric stream {name}: formula {} references unknown column {operand}",
                        formula.name
                    );
                }
            }
        }

        for granularity in &self.downsampling {
            if *granularity == Granularity::Minute {
                bail!("metric stream {name}: downsampling targets must be coarser than minute");
            }
        }

        Ok(())
    }

    /// Builds the column layout of the stream.
    pub fn schema(&self) -> MetricSchema {
        let schema = self
            .columns
            .iter()
            .fold(MetricSchema::new(&self.name), |schema, column| {
                let reducer = match column.reducer {
                    ReducerKind::Sum => Reducer::Sum,
                    ReducerKind::Max => Reducer::Max,
                    ReducerKind::Min => Reducer::Min,
                    ReducerKind::Latest => Reducer::Latest,
                    ReducerKind::Histogram => {
                        Reducer::Histogram(Boundaries::new(&column.boundaries))
                    }
                };
                schema.column(&column.name, reducer)
            });

        self.formulas.iter().fold(schema, |schema, f| {
            schema.formula(Formula {
                name: f.name.clone(),
                numerator: f.numerator.clone(),
                denominator: f.denominator.clone(),
            })
        })
    }

    /// Enabled coarser granularities, deduplicated, finest first.
    pub fn downsampling_targets(&self) -> Vec<Granularity> {
        let mut targets = self.downsampling.clone();
        targets.sort();
        targets.dedup();
        targets
    }
}
