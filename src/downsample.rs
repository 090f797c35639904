//! Roll-up of per-flush deltas into coarser time buckets.
//!
//! A finer worker forwards what it drained in one flush, never what storage
//! already holds, so every contribution reaches each coarser bucket once.

use std::collections::HashMap;

use crate::error::PipelineError;
use crate::event::TelemetryEvent;
use crate::identity::{Granularity, Identity};
use crate::window::{MetricAggregate, MetricSchema};
use crate::worker::{Message, WorkerRefs};

/// Merges `deltas` into one aggregate per identity projected onto `target`.
///
/// Deltas whose bucket is already coarser than `target` are skipped.
pub fn project(
    schema: &MetricSchema,
    deltas: &[(Identity, MetricAggregate)],
    target: Granularity,
) -> Result<HashMap<Identity, MetricAggregate>, PipelineError> {
    let mut projected: HashMap<Identity, MetricAggregate> = HashMap::new();

    for (identity, delta) in deltas {
        let Some(coarser) = identity.to_granularity(target) else {
            continue;
        };
        projected.entry(coarser).or_default().merge(schema, delta)?;
    }

    Ok(projected)
}

/// Coarser roles fed by one metric role.
#[derive(Clone, Default)]
pub struct Downstream {
    targets: Vec<(Granularity, WorkerRefs)>,
}

impl Downstream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_target(mut self, granularity: Granularity, refs: WorkerRefs) -> Self {
        self.targets.push((granularity, refs));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn granularities(&self) -> impl Iterator<Item = Granularity> + '_ {
        self.targets.iter().map(|(g, _)| *g)
    }

    /// Sends the projection of `deltas` to every target role.
    ///
    /// Returns the number of aggregates forwarded.
    pub async fn forward(
        &self,
        schema: &MetricSchema,
        deltas: &[(Identity, MetricAggregate)],
    ) -> Result<usize, PipelineError> {
        let mut forwarded = 0;

        for (granularity, refs) in &self.targets {
            for (identity, aggregate) in project(schema, deltas, *granularity)? {
                let event = TelemetryEvent::metric(identity, aggregate.fields().clone());
                refs.tell(Message::Event(event)).await?;
                forwarded += 1;
            }
        }

        Ok(forwarded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{fields, Value};
    use crate::identity::TimeBucket;
    use crate::window::Reducer;

    fn schema() -> MetricSchema {
        MetricSchema::new("cpu")
            .column("cpu", Reducer::Sum)
            .column("peak", Reducer::Max)
    }

    fn delta(bucket: i64, tag: &str, cpu: i64, peak: i64) -> (Identity, MetricAggregate) {
        let schema = schema();
        let mut agg = MetricAggregate::default();
        agg.merge_fields(&schema, &fields([("cpu", cpu), ("peak", peak)]))
            .unwrap();
        (
            Identity::new("cpu", TimeBucket::new(bucket).unwrap(), [tag]),
            agg,
        )
    }

    #[test]
    fn test_minutes_of_one_hour_collapse() {
        let deltas = vec![
            delta(202401011001, "svc-A", 10, 3),
            delta(202401011059, "svc-A", 30, 7),
            delta(202401011101, "svc-A", 5, 1),
            delta(202401011001, "svc-B", 1, 1),
        ];

        let hours = project(&schema(), &deltas, Granularity::Hour).unwrap();
        assert_eq!(hours.len(), 3);

        let ten = Identity::new("cpu", TimeBucket::new(2024010110).unwrap(), ["svc-A"]);
        assert_eq!(hours[&ten].get("cpu"), Some(&Value::Int(40)));
        assert_eq!(hours[&ten].get("peak"), Some(&Value::Int(7)));

        let days = project(&schema(), &deltas, Granularity::Day).unwrap();
        let day = Identity::new("cpu", TimeBucket::new(20240101).unwrap(), ["svc-A"]);
        assert_eq!(days[&day].get("cpu"), Some(&Value::Int(45)));
    }

    #[test]
    fn test_projecting_successive_deltas_adds_each_once() {
        let schema = schema();
        let hour = Identity::new("cpu", TimeBucket::new(2024010110).unwrap(), ["svc-A"]);

        // Two flush cycles: the second drains only what arrived after the first.
        let first = vec![delta(202401011001, "svc-A", 40, 30)];
        let second: Vec<(Identity, MetricAggregate)> = Vec::new();

        let mut persisted = MetricAggregate::default();
        for cycle in [first, second] {
            if let Some(agg) = project(&schema, &cycle, Granularity::Hour)
                .unwrap()
                .get(&hour)
            {
                persisted.merge(&schema, agg).unwrap();
            }
        }

        assert_eq!(persisted.get("cpu"), Some(&Value::Int(40)));
    }

    #[test]
    fn test_finer_target_is_skipped() {
        let deltas = vec![delta(202401011001, "svc-A", 1, 1)];
        let day_deltas = project(&schema(), &deltas, Granularity::Day).unwrap();
        let pairs: Vec<_> = day_deltas.into_iter().collect();

        assert!(project(&schema(), &pairs, Granularity::Hour)
            .unwrap()
            .is_empty());
    }
}
