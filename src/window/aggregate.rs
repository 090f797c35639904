use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::error::PipelineError;
use crate::event::{Fields, Value};

use super::histogram::Boundaries;

/// Associative, commutative combine law of one metric column.
#[derive(Debug, Clone, PartialEq)]
pub enum Reducer {
    Sum,
    Max,
    Min,
    /// Newest `Sample` by timestamp; equal timestamps keep the larger value.
    Latest,
    /// Bucket counts over fixed boundaries.
    Histogram(Boundaries),
}

impl Reducer {
    /// Converts an incoming value to the column's accumulated form.
    fn normalize(&self, column: &str, value: &Value) -> Result<Value, PipelineError> {
        match (self, value) {
            (Self::Sum | Self::Max | Self::Min, Value::Int(_) | Value::Float(_)) => {
                Ok(value.clone())
            }
            (Self::Latest, Value::Sample { .. }) => Ok(value.clone()),
            (Self::Histogram(bounds), Value::Buckets(counts)) => {
                if counts.len() != bounds.num_buckets() {
                    return Err(mismatch(column, "buckets of matching length", value));
                }
                Ok(value.clone())
            }
            (Self::Histogram(bounds), Value::Int(_) | Value::Float(_)) => {
                let sample = value.as_f64().unwrap_or_default();
                Ok(Value::Buckets(bounds.observe(sample)))
            }
            (Self::Sum | Self::Max | Self::Min, _) => Err(mismatch(column, "number", value)),
            (Self::Latest, _) => Err(mismatch(column, "sample", value)),
            (Self::Histogram(_), _) => Err(mismatch(column, "number or buckets", value)),
        }
    }

    /// Combines two normalized values.
    fn combine(
        &self,
        column: &str,
        acc: &Value,
        incoming: &Value,
    ) -> Result<Value, PipelineError> {
        let combined = match (self, acc, incoming) {
            (Self::Sum, Value::Int(a), Value::Int(b)) => Value::Int(a.saturating_add(*b)),
            (Self::Max, Value::Int(a), Value::Int(b)) => Value::Int(*a.max(b)),
            (Self::Min, Value::Int(a), Value::Int(b)) => Value::Int(*a.min(b)),
            (Self::Sum | Self::Max | Self::Min, a, b) => {
                let (a, b) = match (a.as_f64(), b.as_f64()) {
                    (Some(a), Some(b)) => (a, b),
                    _ => return Err(mismatch(column, "number", incoming)),
                };
                Value::Float(match self {
                    Self::Sum => a + b,
                    Self::Max => a.max(b),
                    _ => a.min(b),
                })
            }
            (
                Self::Latest,
                Value::Sample { at: a_at, value: a },
                Value::Sample { at: b_at, value: b },
            ) => {
                let incoming_wins = match b_at.cmp(a_at) {
                    Ordering::Greater => true,
                    Ordering::Less => false,
                    Ordering::Equal => b.total_cmp(a) == Ordering::Greater,
                };
                if incoming_wins {
                    incoming.clone()
                } else {
                    acc.clone()
                }
            }
            (Self::Histogram(_), Value::Buckets(a), Value::Buckets(b)) if a.len() == b.len() => {
                Value::Buckets(
                    a.iter()
                        .zip(b.iter())
                        .map(|(x, y)| x.saturating_add(*y))
                        .collect(),
                )
            }
            (Self::Latest, ..) => return Err(mismatch(column, "sample", incoming)),
            (Self::Histogram(_), ..) => {
                return Err(mismatch(column, "buckets of matching length", incoming))
            }
        };

        Ok(combined)
    }
}

fn mismatch(column: &str, expected: &'static str, got: &Value) -> PipelineError {
    PipelineError::TypeMismatch {
        column: column.to_string(),
        expected,
        got: got.type_name(),
    }
}

/// Derived column `numerator / denominator`, computed after the storage
/// merge and never merged itself.
#[derive(Debug, Clone, PartialEq)]
pub struct Formula {
    pub name: String,
    pub numerator: String,
    pub denominator: String,
}

impl Formula {
    /// Zero when the denominator is zero or either column is absent.
    pub fn evaluate(&self, fields: &Fields) -> Value {
        let numerator = fields.get(&self.numerator).and_then(Value::as_f64);
        let denominator = fields.get(&self.denominator).and_then(Value::as_f64);

        match (numerator, denominator) {
            (Some(n), Some(d)) if d != 0.0 => Value::Float(n / d),
            _ => Value::Float(0.0),
        }
    }
}

/// Column layout of one metric stream.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSchema {
    stream: String,
    columns: BTreeMap<String, Reducer>,
    formulas: Vec<Formula>,
}

impl MetricSchema {
    pub fn new(stream: impl Into<String>) -> Self {
        Self {
            stream: stream.into(),
            columns: BTreeMap::new(),
            formulas: Vec::new(),
        }
    }

    pub fn column(mut self, name: impl Into<String>, reducer: Reducer) -> Self {
        self.columns.insert(name.into(), reducer);
        self
    }

    pub fn formula(mut self, formula: Formula) -> Self {
        self.formulas.push(formula);
        self
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    pub fn reducer(&self, column: &str) -> Result<&Reducer, PipelineError> {
        self.columns
            .get(column)
            .ok_or_else(|| PipelineError::UnknownColumn {
                stream: self.stream.clone(),
                column: column.to_string(),
            })
    }

    pub fn formulas(&self) -> &[Formula] {
        &self.formulas
    }
}

/// Accumulated metric columns for one identity.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricAggregate {
    values: Fields,
}

impl MetricAggregate {
    /// Folds `incoming` into the aggregate.
    ///
    /// Either every column is applied or, on error, none is.
    pub fn merge_fields(
        &mut self,
        schema: &MetricSchema,
        incoming: &Fields,
    ) -> Result<(), PipelineError> {
        let mut staged = Vec::with_capacity(incoming.len());
        for (column, value) in incoming {
            let reducer = schema.reducer(column)?;
            let value = reducer.normalize(column, value)?;
            let merged = match self.values.get(column) {
                Some(acc) => reducer.combine(column, acc, &value)?,
                None => value,
            };
            staged.push((column.clone(), merged));
        }

        self.values.extend(staged);
        Ok(())
    }

    /// Folds another aggregate of the same stream into this one.
    pub fn merge(
        &mut self,
        schema: &MetricSchema,
        other: &MetricAggregate,
    ) -> Result<(), PipelineError> {
        self.merge_fields(schema, &other.values)
    }

    /// Rebuilds an aggregate from a persisted row, ignoring derived and
    /// undeclared columns.
    pub fn from_fields(schema: &MetricSchema, fields: &Fields) -> Self {
        let values = fields
            .iter()
            .filter(|(column, _)| schema.columns.contains_key(*column))
            .map(|(column, value)| (column.clone(), value.clone()))
            .collect();
        Self { values }
    }

    /// Accumulated columns only.
    pub fn fields(&self) -> &Fields {
        &self.values
    }

    /// Accumulated columns plus derived formula columns.
    pub fn to_row_fields(&self, schema: &MetricSchema) -> Fields {
        let mut fields = self.values.clone();
        for formula in schema.formulas() {
            let value = formula.evaluate(&self.values);
            fields.insert(formula.name.clone(), value);
        }
        fields
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.values.get(column)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// One opaque record payload; the last write wins.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordAggregate {
    fields: Fields,
}

impl RecordAggregate {
    pub fn replace(&mut self, fields: Fields) {
        self.fields = fields;
    }

    pub fn fields(&self) -> &Fields {
        &self.fields
    }

    pub fn into_fields(self) -> Fields {
        self.fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::fields;

    fn schema() -> MetricSchema {
        MetricSchema::new("http")
            .column("calls", Reducer::Sum)
            .column("latency_sum", Reducer::Sum)
            .column("peak", Reducer::Max)
            .column("floor", Reducer::Min)
            .column("last", Reducer::Latest)
            .column("latency", Reducer::Histogram(Boundaries::new(&[10.0, 100.0])))
            .formula(Formula {
                name: "avg_latency".into(),
                numerator: "latency_sum".into(),
                denominator: "calls".into(),
            })
    }

    fn sample(at: i64, value: f64) -> Value {
        Value::Sample { at, value }
    }

    fn merged(schema: &MetricSchema, events: &[&Fields]) -> MetricAggregate {
        let mut agg = MetricAggregate::default();
        for event in events {
            agg.merge_fields(schema, event).unwrap();
        }
        agg
    }

    #[test]
    fn test_merge_is_commutative_for_every_reducer() {
        let schema = schema();
        let pairs: Vec<(Fields, Fields)> = vec![
            (fields([("calls", 1)]), fields([("calls", 4)])),
            (fields([("calls", 1.5)]), fields([("calls", 2)])),
            (fields([("peak", 3)]), fields([("peak", 9)])),
            (fields([("peak", 3.5)]), fields([("peak", 2)])),
            (fields([("floor", -1)]), fields([("floor", 7)])),
            (
                fields([("last", sample(10, 1.0))]),
                fields([("last", sample(20, 0.5))]),
            ),
            (
                fields([("last", sample(10, 1.0))]),
                fields([("last", sample(10, 2.0))]),
            ),
            (fields([("latency", 5)]), fields([("latency", 50.0)])),
            (
                fields([("latency", Value::Buckets(vec![1, 0, 2]))]),
                fields([("latency", 500)]),
            ),
        ];

        for (e1, e2) in &pairs {
            let forward = merged(&schema, &[e1, e2]);
            let backward = merged(&schema, &[e2, e1]);
            assert_eq!(forward, backward, "e1={e1:?} e2={e2:?}");
        }
    }

    #[test]
    fn test_merge_is_associative_for_sums() {
        let schema = schema();
        let (a, b, c) = (
            fields([("calls", 1)]),
            fields([("calls", 2)]),
            fields([("calls", 3)]),
        );

        let left = merged(&schema, &[&a, &b, &c]);

        let bc = merged(&schema, &[&b, &c]);
        let mut right = merged(&schema, &[&a]);
        right.merge(&schema, &bc).unwrap();

        assert_eq!(left, right);
        assert_eq!(left.get("calls"), Some(&Value::Int(6)));
    }

    #[test]
    fn test_reducer_results() {
        let schema = schema();
        let agg = merged(
            &schema,
            &[
                &fields([("peak", 3), ("floor", 3), ("calls", 1)]),
                &fields([("peak", 9), ("floor", -2), ("calls", 1)]),
            ],
        );
        assert_eq!(agg.get("peak"), Some(&Value::Int(9)));
        assert_eq!(agg.get("floor"), Some(&Value::Int(-2)));
        assert_eq!(agg.get("calls"), Some(&Value::Int(2)));

        let latest = merged(
            &schema,
            &[
                &fields([("last", sample(20, 1.0))]),
                &fields([("last", sample(10, 5.0))]),
            ],
        );
        assert_eq!(latest.get("last"), Some(&sample(20, 1.0)));

        let hist = merged(
            &schema,
            &[
                &fields([("latency", 5)]),
                &fields([("latency", 50)]),
                &fields([("latency", 60)]),
                &fields([("latency", 1000)]),
            ],
        );
        assert_eq!(hist.get("latency"), Some(&Value::Buckets(vec![1, 2, 1])));
    }

    #[test]
    fn test_unknown_column_is_rejected_atomically() {
        let schema = schema();
        let mut agg = merged(&schema, &[&fields([("calls", 1)])]);

        let err = agg
            .merge_fields(&schema, &fields([("calls", 5), ("bogus", 1)]))
            .unwrap_err();
        assert!(matches!(err, PipelineError::UnknownColumn { column, .. } if column == "bogus"));
        assert_eq!(agg.get("calls"), Some(&Value::Int(1)));
    }

    #[test]
    fn test_type_mismatch() {
        let schema = schema();
        let mut agg = MetricAggregate::default();

        let err = agg
            .merge_fields(&schema, &fields([("calls", "many")]))
            .unwrap_err();
        assert!(matches!(err, PipelineError::TypeMismatch { got: "text", .. }));

        let err = agg
            .merge_fields(&schema, &fields([("last", 3)]))
            .unwrap_err();
        assert!(matches!(err, PipelineError::TypeMismatch { expected: "sample", .. }));

        let err = agg
            .merge_fields(&schema, &fields([("latency", Value::Buckets(vec![1]))]))
            .unwrap_err();
        assert!(matches!(err, PipelineError::TypeMismatch { .. }));
    }

    #[test]
    fn test_formula_columns() {
        let schema = schema();
        let agg = merged(&schema, &[&fields([("calls", 4), ("latency_sum", 100)])]);

        let row = agg.to_row_fields(&schema);
        assert_eq!(row["avg_latency"], Value::Float(25.0));

        let empty = MetricAggregate::default().to_row_fields(&schema);
        assert_eq!(empty["avg_latency"], Value::Float(0.0));
    }

    #[test]
    fn test_from_fields_drops_derived_columns() {
        let schema = schema();
        let row = fields([("calls", 4.0), ("avg_latency", 25.0), ("stale", 1.0)]);
        let agg = MetricAggregate::from_fields(&schema, &row);
        assert_eq!(agg.fields().len(), 1);
        assert_eq!(agg.get("calls"), Some(&Value::Float(4.0)));
    }

    #[test]
    fn test_record_replace_on_write() {
        let mut record = RecordAggregate::default();
        record.replace(fields([("status", "pending")]));
        record.replace(fields([("status", "done")]));
        assert_eq!(record.fields()["status"], Value::Text("done".into()));
    }
}
