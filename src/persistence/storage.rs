use std::sync::Arc;

use anyhow::Result;

use super::clickhouse::ClickHouseStorage;
use super::memory::MemoryStorage;
use super::WriteRequest;
use crate::event::Row;
use crate::identity::TimeBucket;

/// Storage backend for persisted rows.
///
/// Enum dispatch keeps the async methods free of boxed futures. Clones share
/// the underlying backend.
#[derive(Clone)]
pub enum Storage {
    Memory(Arc<MemoryStorage>),
    ClickHouse(Arc<ClickHouseStorage>),
}

impl Storage {
    /// Returns the backend name for logging and metric labels.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Memory(_) => "memory",
            Self::ClickHouse(_) => "clickhouse",
        }
    }

    /// Fetches the row stored under `key`.
    pub async fn get(&self, key: &str) -> Result<Option<Row>> {
        match self {
            Self::Memory(s) => s.get(key),
            Self::ClickHouse(s) => s.get(key).await,
        }
    }

    /// Fetches every row stored under one of `keys` in one round trip per
    /// backend batch. Absent keys are skipped.
    pub async fn multi_get(&self, keys: &[String]) -> Result<Vec<Row>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        match self {
            Self::Memory(s) => s.multi_get(keys),
            Self::ClickHouse(s) => s.multi_get(keys).await,
        }
    }

    /// Writes every request. Inserting an existing key replaces the row.
    pub async fn batch_write(&self, requests: &[WriteRequest]) -> Result<()> {
        match self {
            Self::Memory(s) => s.batch_write(requests),
            Self::ClickHouse(s) => s.batch_write(requests).await,
        }
    }

    /// Removes rows of `before`'s granularity whose bucket is older than it.
    pub async fn delete_history(&self, before: TimeBucket) -> Result<()> {
        match self {
            Self::Memory(s) => s.delete_history(before),
            Self::ClickHouse(s) => s.delete_history(before).await,
        }
    }

    /// Releases backend resources.
    pub async fn stop(&self) -> Result<()> {
        match self {
            Self::Memory(_) => Ok(()),
            Self::ClickHouse(s) => s.stop().await,
        }
    }
}
