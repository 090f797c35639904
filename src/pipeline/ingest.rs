//! JSON-lines ingestion: one event object per line.
//!
//! ```text
//! {"name":"cpu","tags":["svc-A"],"time_bucket":202401011001,"fields":{"cpu":10}}
//! {"name":"segment","tags":["svc-A"],"timestamp_ms":1704103260000,"kind":"record","sub_key":"t1","fields":{"status":"ok"}}
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::Pipeline;
use crate::event::{Fields, Kind, TelemetryEvent};
use crate::identity::{Granularity, Identity, TimeBucket};

#[derive(Debug, Deserialize)]
struct Line {
    name: String,
    #[serde(default)]
    tags: Vec<String>,
    /// Encoded bucket; wins over `timestamp_ms`.
    time_bucket: Option<i64>,
    /// UTC milliseconds, bucketed by minute.
    timestamp_ms: Option<i64>,
    #[serde(default = "default_kind")]
    kind: Kind,
    #[serde(default)]
    sub_key: Option<String>,
    fields: Fields,
}

fn default_kind() -> Kind {
    Kind::Metric
}

/// Counters of one ingestion run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IngestStats {
    pub accepted: u64,
    pub rejected: u64,
}

/// Parses one line into an event.
pub fn parse_line(line: &str) -> Result<TelemetryEvent> {
    let line: Line = serde_json::from_str(line).context("decoding event")?;

    let bucket = match (line.time_bucket, line.timestamp_ms) {
        (Some(value), _) => TimeBucket::new(value)?,
        (None, Some(millis)) => TimeBucket::from_timestamp_millis(millis, Granularity::Minute)?,
        (None, None) => bail!("event {} has neither time_bucket nor timestamp_ms", line.name),
    };

    let identity = Identity::new(line.name, bucket, line.tags);

    Ok(match line.kind {
        Kind::Metric => TelemetryEvent::metric(identity, line.fields),
        Kind::Record => {
            let Some(sub_key) = line.sub_key else {
                bail!("record {identity} has no sub_key");
            };
            TelemetryEvent::record(identity, sub_key, line.fields)
        }
    })
}

/// Feeds every line of `reader` into `pipeline` until EOF or cancellation.
///
/// Malformed lines and undeliverable events are logged and skipped.
pub async fn ingest<R>(
    pipeline: &Pipeline,
    reader: R,
    cancel: CancellationToken,
) -> Result<IngestStats>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut stats = IngestStats::default();

    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => line.context("reading input")?,
        };

        let Some(line) = line else {
            break;
        };

        if line.trim().is_empty() {
            continue;
        }

        let delivered = match parse_line(&line) {
            Ok(event) => pipeline.deliver(event).await.map_err(anyhow::Error::from),
            Err(e) => Err(e),
        };

        match delivered {
            Ok(()) => stats.accepted += 1,
            Err(e) => {
                stats.rejected += 1;
                warn!(error = ?e, "skipping input line");
            }
        }
    }

    info!(
        accepted = stats.accepted,
        rejected = stats.rejected,
        "ingestion finished"
    );

    Ok(stats)
}

/// Reads events from standard input.
pub async fn ingest_stdin(pipeline: &Pipeline, cancel: CancellationToken) -> Result<IngestStats> {
    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    ingest(pipeline, stdin, cancel).await
}
