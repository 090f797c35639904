//! Aggregate identities.
//!
//! An [`Identity`] names one aggregate row: the stream name, the time bucket
//! and the aggregation tag values. Its string key is the storage address of
//! the row and the routing key used by key-hash selectors.

mod bucket;

pub use bucket::{Granularity, TimeBucket};

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Separator between key components.
pub const SEPARATOR: char = '#';

/// Stable, collision-free key of one aggregate.
///
/// Components are joined with [`SEPARATOR`]. A `#` or `%` inside a component
/// is percent-encoded, so distinct component lists never produce the same key.
#[derive(Clone)]
pub struct Identity {
    name: String,
    bucket: TimeBucket,
    tags: Vec<String>,
    key: Arc<str>,
}

impl Identity {
    pub fn new<I, S>(name: impl Into<String>, bucket: TimeBucket, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let name = name.into();
        let tags: Vec<String> = tags.into_iter().map(Into::into).collect();
        let key = build_key(&name, bucket, &tags);

        Self {
            name,
            bucket,
            tags,
            key,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bucket(&self) -> TimeBucket {
        self.bucket
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    /// The encoded key string.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Shared handle to the key, cheap to keep alongside a moved identity.
    pub fn shared_key(&self) -> Arc<str> {
        Arc::clone(&self.key)
    }

    /// Same aggregate in another bucket.
    pub fn with_bucket(&self, bucket: TimeBucket) -> Self {
        Self {
            name: self.name.clone(),
            bucket,
            tags: self.tags.clone(),
            key: build_key(&self.name, bucket, &self.tags),
        }
    }

    /// Projects the identity onto a coarser granularity.
    pub fn to_granularity(&self, target: Granularity) -> Option<Self> {
        self.bucket
            .to_granularity(target)
            .map(|bucket| self.with_bucket(bucket))
    }

    /// Key of one record under this identity, distinguished by `sub_key`.
    pub fn record_key(&self, sub_key: &str) -> String {
        let mut key = String::with_capacity(self.key.len() + sub_key.len() + 1);
        key.push_str(&self.key);
        key.push(SEPARATOR);
        escape_into(sub_key, &mut key);
        key
    }
}

impl PartialEq for Identity {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for Identity {}

impl Hash for Identity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Identity").field(&self.key).finish()
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

fn build_key(name: &str, bucket: TimeBucket, tags: &[String]) -> Arc<str> {
    let tags_len: usize = tags.iter().map(|t| t.len() + 1).sum();
    let mut key = String::with_capacity(name.len() + 13 + tags_len);

    escape_into(name, &mut key);
    key.push(SEPARATOR);
    key.push_str(&bucket.value().to_string());
    for tag in tags {
        key.push(SEPARATOR);
        escape_into(tag, &mut key);
    }

    Arc::from(key)
}

fn escape_into(component: &str, out: &mut String) {
    for ch in component.chars() {
        match ch {
            '%' => out.push_str("%25"),
            SEPARATOR => out.push_str("%23"),
            c => out.push(c),
        }
    }
}
