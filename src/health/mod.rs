use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, GaugeVec, Histogram, HistogramOpts, HistogramVec, Opts,
    Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const NAMESPACE: &str = "aggregoor";

/// Prometheus metrics for pipeline health.
///
/// Every metric lives in a private registry under the "aggregoor" namespace,
/// so several pipelines (e.g. in tests) can coexist in one process.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    // === Ingest ===
    /// Messages accepted by worker consumers, by role.
    pub events_received: CounterVec,
    /// Messages dropped after a processing error, by role.
    pub events_dropped: CounterVec,
    /// Messages rejected by non-blocking sends on a full queue, by role.
    pub events_rejected: CounterVec,
    /// Current queue length by role and replica.
    pub worker_queue_length: GaugeVec,
    /// Queue capacity by role and replica.
    pub worker_queue_capacity: GaugeVec,

    // === Flush ===
    /// Per-worker flush duration by role.
    pub flush_duration: HistogramVec,
    /// Per-worker flush failures by role.
    pub flush_errors: CounterVec,
    /// Window entries drained by flushes, by role.
    pub flushed_entries: CounterVec,
    /// Deltas forwarded to coarser roles, by source role.
    pub downsampled_entries: CounterVec,

    // === Persistence timer ===
    /// Completed timer rounds.
    pub timer_rounds: Counter,
    /// Time spent preparing write requests across all workers.
    pub timer_prepare_latency: Histogram,
    /// Time spent executing the combined batch write.
    pub timer_execute_latency: Histogram,
    /// Total round duration.
    pub timer_all_latency: Histogram,
    /// Failed batch writes.
    pub batch_errors: Counter,
    /// Requests per combined batch.
    pub batch_size: Histogram,
    /// Rows written by operation (insert/update).
    pub rows_written: CounterVec,
    /// Storage backend reachability (1=connected, 0=disconnected).
    pub storage_connected: GaugeVec,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let events_received = CounterVec::new(
            Opts::new(
                "events_received_total",
                "Messages accepted by worker consumers.",
            )
            .namespace(NAMESPACE),
            &["role"],
        )?;
        let events_dropped = CounterVec::new(
            Opts::new(
                "events_dropped_total",
                "Messages dropped after a processing error.",
            )
            .namespace(NAMESPACE),
            &["role"],
        )?;
        let events_rejected = CounterVec::new(
            Opts::new(
                "events_rejected_total",
                "Messages rejected by non-blocking sends on a full queue.",
            )
            .namespace(NAMESPACE),
            &["role"],
        )?;
        let worker_queue_length = GaugeVec::new(
            Opts::new("worker_queue_length", "Current worker queue length.").namespace(NAMESPACE),
            &["role", "replica"],
        )?;
        let worker_queue_capacity = GaugeVec::new(
            Opts::new("worker_queue_capacity", "Worker queue capacity.").namespace(NAMESPACE),
            &["role", "replica"],
        )?;

        let flush_duration = HistogramVec::new(
            HistogramOpts::new("flush_duration_seconds", "Per-worker flush duration.")
                .namespace(NAMESPACE)
                .buckets(vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            &["role"],
        )?;
        let flush_errors = CounterVec::new(
            Opts::new("flush_errors_total", "Per-worker flush failures.").namespace(NAMESPACE),
            &["role"],
        )?;
        let flushed_entries = CounterVec::new(
            Opts::new(
                "flushed_entries_total",
                "Window entries drained by flushes.",
            )
            .namespace(NAMESPACE),
            &["role"],
        )?;
        let downsampled_entries = CounterVec::new(
            Opts::new(
                "downsampled_entries_total",
                "Deltas forwarded to coarser roles.",
            )
            .namespace(NAMESPACE),
            &["role"],
        )?;

        let timer_rounds = Counter::with_opts(
            Opts::new("timer_rounds_total", "Completed persistence timer rounds.")
                .namespace(NAMESPACE),
        )?;
        let latency_buckets = vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0];
        let timer_prepare_latency = Histogram::with_opts(
            HistogramOpts::new(
                "timer_prepare_latency_seconds",
                "Time spent preparing write requests in one round.",
            )
            .namespace(NAMESPACE)
            .buckets(latency_buckets.clone()),
        )?;
        let timer_execute_latency = Histogram::with_opts(
            HistogramOpts::new(
                "timer_execute_latency_seconds",
                "Time spent executing the combined batch write.",
            )
            .namespace(NAMESPACE)
            .buckets(latency_buckets.clone()),
        )?;
        let timer_all_latency = Histogram::with_opts(
            HistogramOpts::new("timer_all_latency_seconds", "Total persistence round duration.")
                .namespace(NAMESPACE)
                .buckets(latency_buckets),
        )?;
        let batch_errors = Counter::with_opts(
            Opts::new("batch_errors_total", "Failed combined batch writes.").namespace(NAMESPACE),
        )?;
        let batch_size = Histogram::with_opts(
            HistogramOpts::new("batch_size", "Write requests per combined batch.")
                .namespace(NAMESPACE)
                .buckets(vec![
                    10.0, 100.0, 500.0, 1000.0, 5000.0, 10000.0, 50000.0,
                ]),
        )?;
        let rows_written = CounterVec::new(
            Opts::new("rows_written_total", "Rows written by operation.").namespace(NAMESPACE),
            &["op"],
        )?;
        let storage_connected = GaugeVec::new(
            Opts::new(
                "storage_connected",
                "Storage backend reachability (1=connected, 0=disconnected).",
            )
            .namespace(NAMESPACE),
            &["backend"],
        )?;

        registry.register(Box::new(events_received.clone()))?;
        registry.register(Box::new(events_dropped.clone()))?;
        registry.register(Box::new(events_rejected.clone()))?;
        registry.register(Box::new(worker_queue_length.clone()))?;
        registry.register(Box::new(worker_queue_capacity.clone()))?;

        registry.register(Box::new(flush_duration.clone()))?;
        registry.register(Box::new(flush_errors.clone()))?;
        registry.register(Box::new(flushed_entries.clone()))?;
        registry.register(Box::new(downsampled_entries.clone()))?;

        registry.register(Box::new(timer_rounds.clone()))?;
        registry.register(Box::new(timer_prepare_latency.clone()))?;
        registry.register(Box::new(timer_execute_latency.clone()))?;
        registry.register(Box::new(timer_all_latency.clone()))?;
        registry.register(Box::new(batch_errors.clone()))?;
        registry.register(Box::new(batch_size.clone()))?;
        registry.register(Box::new(rows_written.clone()))?;
        registry.register(Box::new(storage_connected.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            events_received,
            events_dropped,
            events_rejected,
            worker_queue_length,
            worker_queue_capacity,
            flush_duration,
            flush_errors,
            flushed_entries,
            downsampled_entries,
            timer_rounds,
            timer_prepare_latency,
            timer_execute_latency,
            timer_all_latency,
            batch_errors,
            batch_size,
            rows_written,
            storage_connected,
        })
    }

    /// Metrics instance bound to no address, for tests and embedded use.
    pub fn detached() -> Result<Arc<Self>> {
        Ok(Arc::new(Self::new("")?))
    }

    /// Renders the registry in Prometheus text format.
    pub fn render(&self) -> Result<String> {
        encode(&self.registry)
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<()> {
        let bind_addr = bind_addr(&self.addr);

        let app_state = Arc::new(AppState {
            registry: self.registry.clone(),
        });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(())
    }

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

/// Resolves the configured address, handling the ":port" shorthand.
fn bind_addr(addr: &str) -> String {
    let addr = if addr.is_empty() { ":9090" } else { addr };

    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}

fn encode(registry: &Registry) -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .context("encoding metrics")?;

    String::from_utf8(buffer).context("converting metrics to string")
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match encode(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "encoding metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_addr_shorthand() {
        assert_eq!(bind_addr(""), "0.0.0.0:9090");
        assert_eq!(bind_addr(":9191"), "0.0.0.0:9191");
        assert_eq!(bind_addr("127.0.0.1:9000"), "127.0.0.1:9000");
    }

    #[test]
    fn test_render_contains_namespaced_metrics() {
        let health = HealthMetrics::new("").unwrap();
        health.events_received.with_label_values(&["cpu/minute"]).inc();
        health.batch_errors.inc();

        let text = health.render().unwrap();
        assert!(text.contains("aggregoor_events_received_total{role=\"cpu/minute\"} 1"));
        assert!(text.contains("aggregoor_batch_errors_total 1"));
    }

    #[test]
    fn test_instances_do_not_share_registries() {
        let a = HealthMetrics::new("").unwrap();
        let b = HealthMetrics::new("").unwrap();
        a.timer_rounds.inc();
        assert_eq!(a.timer_rounds.get(), 1.0);
        assert_eq!(b.timer_rounds.get(), 0.0);
    }

    #[tokio::test]
    async fn test_stop_without_start_is_noop() {
        let health = HealthMetrics::new(":0").unwrap();
        health.stop().await.unwrap();
    }
}
