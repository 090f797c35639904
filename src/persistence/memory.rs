#[cfg(test)]
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use anyhow::Result;
use dashmap::DashMap;

use super::WriteRequest;
use crate::event::Row;
use crate::identity::{Identity, TimeBucket};

/// In-process row store.
#[derive(Default)]
pub struct MemoryStorage {
    rows: DashMap<String, Row>,
    #[cfg(test)]
    fail_writes: AtomicBool,
    #[cfg(test)]
    fail_reads: AtomicBool,
    #[cfg(test)]
    reads: AtomicUsize,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Result<Option<Row>> {
        self.check_read()?;
        Ok(self.rows.get(key).map(|row| row.value().clone()))
    }

    /// Rows stored under any of `keys`. Absent keys are skipped.
    pub fn multi_get(&self, keys: &[String]) -> Result<Vec<Row>> {
        self.check_read()?;
        Ok(keys
            .iter()
            .filter_map(|key| self.rows.get(key).map(|row| row.value().clone()))
            .collect())
    }

    /// Convenience lookup by identity.
    pub fn row(&self, identity: &Identity) -> Option<Row> {
        self.rows.get(identity.key()).map(|row| row.value().clone())
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn batch_write(&self, requests: &[WriteRequest]) -> Result<()> {
        #[cfg(test)]
        if self.fail_writes.load(Ordering::Relaxed) {
            anyhow::bail!("memory storage configured to fail writes");
        }

        for request in requests {
            self.rows
                .insert(request.row.key.clone(), request.row.clone());
        }

        Ok(())
    }

    pub fn delete_history(&self, before: TimeBucket) -> Result<()> {
        let floor = before.granularity().floor();
        self.rows
            .retain(|_, row| !(row.time_bucket >= floor && row.time_bucket < before.value()));
        Ok(())
    }

    #[cfg(test)]
    fn check_read(&self) -> Result<()> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        if self.fail_reads.load(Ordering::Relaxed) {
            anyhow::bail!("memory storage configured to fail reads");
        }
        Ok(())
    }

    #[cfg(not(test))]
    fn check_read(&self) -> Result<()> {
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }

    #[cfg(test)]
    pub(crate) fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::Relaxed);
    }

    /// Read calls served so far.
    #[cfg(test)]
    pub(crate) fn reads(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }
}
