use std::sync::Arc;

/// Default upper bounds in milliseconds.
/// 10 buckets: <1ms, 1-5ms, 5-10ms, 10-25ms, 25-50ms, 50-100ms,
/// 100-250ms, 250-500ms, 500ms-1s, 1s+.
const DEFAULT_BOUNDARIES: [f64; 9] = [1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0];

/// Ascending upper bounds of a histogram column.
///
/// `n` boundaries define `n + 1` buckets; the last one is unbounded.
#[derive(Debug, Clone, PartialEq)]
pub struct Boundaries(Arc<[f64]>);

impl Boundaries {
    /// Uses `bounds` when non-empty, the default latency layout otherwise.
    pub fn new(bounds: &[f64]) -> Self {
        if bounds.is_empty() {
            Self::default()
        } else {
            Self(Arc::from(bounds))
        }
    }

    /// Number of buckets including the unbounded one.
    pub fn num_buckets(&self) -> usize {
        self.0.len() + 1
    }

    /// Index of the bucket `value` falls into.
    pub fn bucket_index(&self, value: f64) -> usize {
        // Linear scan is fine for the handful of boundaries in use.
        for (i, &boundary) in self.0.iter().enumerate() {
            if value < boundary {
                return i;
            }
        }
        self.0.len()
    }

    /// Bucket vector with a single observation of `value`.
    pub fn observe(&self, value: f64) -> Vec<u64> {
        let mut buckets = vec![0; self.num_buckets()];
        buckets[self.bucket_index(value)] = 1;
        buckets
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }
}

impl Default for Boundaries {
    fn default() -> Self {
        Self(Arc::from(DEFAULT_BOUNDARIES.as_slice()))
    }
}

/// Whether `bounds` is strictly ascending and finite.
pub fn is_valid(bounds: &[f64]) -> bool {
    bounds.iter().all(|b| b.is_finite()) && bounds.windows(2).all(|w| w[0] < w[1])
}
