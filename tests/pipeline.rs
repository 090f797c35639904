use std::sync::Arc;

use aggregoor::config::Config;
use aggregoor::event::{fields, Kind, TelemetryEvent, Value};
use aggregoor::health::HealthMetrics;
use aggregoor::identity::{Identity, TimeBucket};
use aggregoor::persistence::{MemoryStorage, Storage};
use aggregoor::{Pipeline, PipelineError};

const CONFIG: &str = r#"
replica_count: 2
health:
  enabled: false
metrics:
  - name: cpu
    columns:
      - { name: cpu, reducer: sum }
      - { name: calls, reducer: sum }
      - { name: peak, reducer: max }
    formulas:
      - { name: cpu_avg, numerator: cpu, denominator: calls }
    downsampling: [hour, day]
records:
  - name: segment
"#;

fn build() -> (Pipeline, Arc<MemoryStorage>) {
    let cfg = Config::from_yaml(CONFIG).expect("valid config");
    let memory = Arc::new(MemoryStorage::new());
    let pipeline = Pipeline::with_storage(
        &cfg,
        Storage::Memory(Arc::clone(&memory)),
        HealthMetrics::detached().expect("health metrics"),
    )
    .expect("pipeline");

    (pipeline, memory)
}

fn cpu(bucket: i64, tag: &str, value: i64, peak: i64) -> TelemetryEvent {
    let identity = Identity::new("cpu", TimeBucket::new(bucket).unwrap(), [tag]);
    TelemetryEvent::metric(
        identity,
        fields([("cpu", value), ("calls", 1), ("peak", peak)]),
    )
}

fn field(memory: &MemoryStorage, key: &str, column: &str) -> Value {
    let row = memory
        .get(key)
        .unwrap()
        .unwrap_or_else(|| panic!("no row stored under {key}"));
    row.fields[column].clone()
}

#[tokio::test]
async fn pipeline_minute_events_reach_every_granularity() {
    let (pipeline, memory) = build();

    pipeline.deliver(cpu(202401011001, "svc-A", 10, 7)).await.unwrap();
    pipeline.deliver(cpu(202401011001, "svc-A", 30, 3)).await.unwrap();
    pipeline.deliver(cpu(202401011002, "svc-A", 20, 9)).await.unwrap();

    let report = pipeline.flush().await;
    assert!(report.failed.is_empty());
    assert_eq!(report.requests, report.written);

    assert_eq!(field(&memory, "cpu#202401011001#svc-A", "cpu"), Value::Int(40));
    assert_eq!(field(&memory, "cpu#202401011001#svc-A", "peak"), Value::Int(7));
    assert_eq!(field(&memory, "cpu#202401011002#svc-A", "cpu"), Value::Int(20));

    assert_eq!(field(&memory, "cpu#2024010110#svc-A", "cpu"), Value::Int(60));
    assert_eq!(field(&memory, "cpu#2024010110#svc-A", "calls"), Value::Int(3));
    assert_eq!(field(&memory, "cpu#2024010110#svc-A", "peak"), Value::Int(9));
    assert_eq!(
        field(&memory, "cpu#2024010110#svc-A", "cpu_avg"),
        Value::Float(20.0)
    );
    assert_eq!(field(&memory, "cpu#20240101#svc-A", "cpu"), Value::Int(60));

    // Nothing new arrived: the second round writes nothing and changes nothing.
    let report = pipeline.flush().await;
    assert_eq!(report.requests, 0);
    assert_eq!(field(&memory, "cpu#2024010110#svc-A", "cpu"), Value::Int(60));

    pipeline.stop().await.unwrap();
}

#[tokio::test]
async fn pipeline_later_rounds_merge_into_stored_rows() {
    let (pipeline, memory) = build();

    pipeline.deliver(cpu(202401011001, "svc-A", 10, 1)).await.unwrap();
    pipeline.flush().await;

    pipeline.deliver(cpu(202401011001, "svc-A", 5, 4)).await.unwrap();
    pipeline.deliver(cpu(202401011059, "svc-A", 5, 2)).await.unwrap();
    pipeline.flush().await;

    assert_eq!(field(&memory, "cpu#202401011001#svc-A", "cpu"), Value::Int(15));
    assert_eq!(field(&memory, "cpu#202401011001#svc-A", "peak"), Value::Int(4));
    assert_eq!(field(&memory, "cpu#2024010110#svc-A", "cpu"), Value::Int(20));
    assert_eq!(field(&memory, "cpu#20240101#svc-A", "calls"), Value::Int(3));

    pipeline.stop().await.unwrap();
}

#[tokio::test]
async fn pipeline_tags_keep_identities_apart() {
    let (pipeline, memory) = build();

    pipeline.deliver(cpu(202401011001, "svc-A", 10, 1)).await.unwrap();
    pipeline.deliver(cpu(202401011001, "svc-B", 1, 1)).await.unwrap();
    pipeline.stop().await.unwrap();

    assert_eq!(field(&memory, "cpu#2024010110#svc-A", "cpu"), Value::Int(10));
    assert_eq!(field(&memory, "cpu#2024010110#svc-B", "cpu"), Value::Int(1));
}

#[tokio::test]
async fn pipeline_records_replace_and_can_be_looked_up() {
    let (pipeline, _memory) = build();
    let identity = Identity::new("segment", TimeBucket::new(202401011001).unwrap(), ["svc-A"]);

    for status in ["pending", "ok"] {
        pipeline
            .deliver(TelemetryEvent::record(
                identity.clone(),
                "t1",
                fields([("status", status)]),
            ))
            .await
            .unwrap();
    }
    pipeline.flush().await;

    let row = pipeline
        .lookup_row(&identity.record_key("t1"))
        .await
        .unwrap()
        .expect("record row");
    assert_eq!(row.kind, Kind::Record);
    assert_eq!(row.fields["status"], Value::Text("ok".to_string()));

    let missing = pipeline.lookup_row("segment#202401011001#svc-A#t2").await.unwrap();
    assert!(missing.is_none());

    pipeline.stop().await.unwrap();
}

#[tokio::test]
async fn pipeline_unknown_stream_is_role_not_found() {
    let (pipeline, _memory) = build();

    let identity = Identity::new("mem", TimeBucket::new(202401011001).unwrap(), ["svc-A"]);
    let err = pipeline
        .deliver(TelemetryEvent::metric(identity, fields([("mem", 1)])))
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::RoleNotFound(role) if role == "mem/minute"));

    // Streams without month downsampling have no month role.
    let err = pipeline.try_deliver(cpu(202401, "svc-A", 1, 1)).unwrap_err();
    assert!(matches!(err, PipelineError::RoleNotFound(role) if role == "cpu/month"));

    pipeline.stop().await.unwrap();
}

#[tokio::test]
async fn pipeline_rejected_events_leave_no_row() {
    let (pipeline, memory) = build();

    let identity = Identity::new("cpu", TimeBucket::new(202401011001).unwrap(), ["svc-A"]);
    pipeline
        .deliver(TelemetryEvent::metric(identity, fields([("unknown", 1)])))
        .await
        .unwrap();
    pipeline.deliver(cpu(202401011001, "svc-B", 2, 2)).await.unwrap();
    pipeline.stop().await.unwrap();

    assert!(memory.get("cpu#202401011001#svc-A").unwrap().is_none());
    assert_eq!(field(&memory, "cpu#202401011001#svc-B", "cpu"), Value::Int(2));

    let rendered = pipeline.health().render().unwrap();
    assert!(rendered.contains("aggregoor_events_dropped_total"));
}

#[test]
fn pipeline_blocking_deliver_from_plain_threads() {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap();

    let (pipeline, memory) = rt.block_on(async { build() });
    let pipeline = Arc::new(pipeline);

    let producers: Vec<_> = (0..4)
        .map(|_| {
            let pipeline = Arc::clone(&pipeline);
            std::thread::spawn(move || {
                for _ in 0..250 {
                    pipeline
                        .blocking_deliver(cpu(202401011001, "svc-A", 1, 1))
                        .unwrap();
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().unwrap();
    }

    rt.block_on(pipeline.stop()).unwrap();

    assert_eq!(field(&memory, "cpu#202401011001#svc-A", "cpu"), Value::Int(1000));
    assert_eq!(field(&memory, "cpu#20240101#svc-A", "calls"), Value::Int(1000));
}
