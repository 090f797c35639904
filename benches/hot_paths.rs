use criterion::{black_box, criterion_group, criterion_main, Criterion};
use aggregoor::downsample::project;
use aggregoor::event::{fields, Fields};
use aggregoor::identity::{Granularity, Identity, TimeBucket};
use aggregoor::routing::{SelectorKind, WorkerSelector};
use aggregoor::window::{Boundaries, MetricAggregate, MetricSchema, Reducer, Window};

const IDENTITIES: usize = 512;

fn schema() -> MetricSchema {
    MetricSchema::new("endpoint")
        .column("latency_sum", Reducer::Sum)
        .column("calls", Reducer::Sum)
        .column("peak", Reducer::Max)
        .column("latency", Reducer::Histogram(Boundaries::new(&[5.0, 50.0, 500.0])))
}

fn identities() -> Vec<Identity> {
    (0..IDENTITIES)
        .map(|i| {
            let bucket = TimeBucket::new(202401011000 + (i % 60) as i64).unwrap();
            Identity::new("endpoint", bucket, [format!("svc-{}", i % 32), format!("/api/{i}")])
        })
        .collect()
}

fn sample(i: usize) -> Fields {
    let latency = (i % 700) as i64;
    fields([
        ("latency_sum", latency),
        ("calls", 1),
        ("peak", latency),
        ("latency", latency),
    ])
}

fn bench_identity(c: &mut Criterion) {
    let bucket = TimeBucket::new(202401011001).unwrap();

    c.bench_function("identity/new_three_tags", |b| {
        b.iter(|| {
            let identity = Identity::new(
                black_box("endpoint"),
                bucket,
                [black_box("svc-A"), black_box("/api/users"), black_box("GET")],
            );
            black_box(identity.key().len())
        })
    });

    c.bench_function("identity/to_hour", |b| {
        let identity = Identity::new("endpoint", bucket, ["svc-A"]);
        b.iter(|| black_box(identity.to_granularity(Granularity::Hour)))
    });
}

fn bench_window(c: &mut Criterion) {
    let schema = schema();
    let keys = identities();
    let samples: Vec<Fields> = (0..IDENTITIES).map(sample).collect();

    c.bench_function("window/get_or_create_merge", |b| {
        let window: Window<Identity, MetricAggregate> = Window::new();
        let mut i = 0usize;
        b.iter(|| {
            let idx = i % IDENTITIES;
            i += 1;
            window
                .get_or_create(keys[idx].clone(), |agg| {
                    agg.merge_fields(&schema, black_box(&samples[idx]))
                })
                .unwrap()
        })
    });

    c.bench_function("window/hold_and_drain_medium", |b| {
        let window: Window<Identity, MetricAggregate> = Window::new();
        b.iter(|| {
            for (key, fields) in keys.iter().zip(&samples) {
                window
                    .get_or_create(key.clone(), |agg| agg.merge_fields(&schema, fields))
                    .unwrap();
            }
            let held = window.hold().unwrap();
            let drained = held.drain();
            held.release();
            black_box(drained.len())
        })
    });
}

fn bench_downsample(c: &mut Criterion) {
    let schema = schema();
    let deltas: Vec<(Identity, MetricAggregate)> = identities()
        .into_iter()
        .enumerate()
        .map(|(i, identity)| {
            let mut agg = MetricAggregate::default();
            agg.merge_fields(&schema, &sample(i)).unwrap();
            (identity, agg)
        })
        .collect();

    c.bench_function("downsample/project_to_hour", |b| {
        b.iter(|| {
            let projected = project(&schema, black_box(&deltas), Granularity::Hour).unwrap();
            black_box(projected.len())
        })
    });
}

fn bench_selector(c: &mut Criterion) {
    let replicas: Vec<usize> = (0..8).collect();
    let keys: Vec<String> = identities().iter().map(|id| id.key().to_string()).collect();

    for kind in [SelectorKind::KeyHash, SelectorKind::RoundRobin] {
        let selector = WorkerSelector::new(kind);
        let name = format!("selector/{kind:?}");
        c.bench_function(&name, |b| {
            let mut i = 0usize;
            b.iter(|| {
                let key = &keys[i % keys.len()];
                i += 1;
                black_box(*selector.select("endpoint/minute", &replicas, key).unwrap())
            })
        });
    }
}

fn bench_suite(c: &mut Criterion) {
    bench_identity(c);
    bench_window(c);
    bench_downsample(c);
    bench_selector(c);
}

criterion_group!(benches, bench_suite);
criterion_main!(benches);
