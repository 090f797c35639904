use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::identity::Identity;

/// Column name to value map carried by events and rows.
pub type Fields = BTreeMap<String, Value>;

/// A single column value.
///
/// Deserialized untagged, so JSON `10` is an `Int`, `10.5` a `Float`,
/// `{"at": .., "value": ..}` a timestamped `Sample` and `[1, 0, 3]` a
/// histogram `Buckets` vector. Anything else lands in `Json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Int(i64),
    Float(f64),
    Sample { at: i64, value: f64 },
    Buckets(Vec<u64>),
    Text(String),
    Json(serde_json::Value),
}

impl Value {
    /// Short type name used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Sample { .. } => "sample",
            Self::Buckets(_) => "buckets",
            Self::Text(_) => "text",
            Self::Json(_) => "json",
        }
    }

    /// Numeric view of scalar values.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            Self::Sample { value, .. } => Some(*value),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

/// Aggregation family of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    Metric,
    Record,
}

impl Kind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Metric => "metric",
            Self::Record => "record",
        }
    }
}

/// A normalized telemetry event as handed over by decoders.
#[derive(Debug, Clone)]
pub struct TelemetryEvent {
    pub identity: Identity,
    pub kind: Kind,
    pub fields: Fields,
    /// Distinguishes records sharing one identity. Unused for metrics.
    pub sub_key: Option<String>,
}

impl TelemetryEvent {
    pub fn metric(identity: Identity, fields: Fields) -> Self {
        Self {
            identity,
            kind: Kind::Metric,
            fields,
            sub_key: None,
        }
    }

    pub fn record(identity: Identity, sub_key: impl Into<String>, fields: Fields) -> Self {
        Self {
            identity,
            kind: Kind::Record,
            fields,
            sub_key: Some(sub_key.into()),
        }
    }
}

/// A persisted aggregate row as seen by storage backends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub key: String,
    pub name: String,
    pub time_bucket: i64,
    pub kind: Kind,
    pub fields: Fields,
}

/// Builds a [`Fields`] map from `(name, value)` pairs.
pub fn fields<I, K, V>(pairs: I) -> Fields
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<Value>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}
