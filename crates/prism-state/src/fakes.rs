//! In-memory fakes for storage traits
//!
//! Provides `MemoryHealthStore`, `MemoryProgressSink`, `NoopProgressSink` and
//! `MemoryAnalysisCache` that satisfy the trait contracts without any
//! external dependencies. Shared state is process-local, so these are meant
//! for tests and single-process runs.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use crate::storage_traits::*;

// ---------------------------------------------------------------------------
// MemoryHealthStore
// ---------------------------------------------------------------------------

/// In-memory health store backed by a `HashMap<provider, ProviderHealth>`.
///
/// Every operation holds the mutex for its whole read-modify-write, which
/// gives the same atomicity the database backend gets from single statements.
#[derive(Debug, Default)]
pub struct MemoryHealthStore {
    records: Mutex<HashMap<String, ProviderHealth>>,
}

impl MemoryHealthStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HealthStore for MemoryHealthStore {
    async fn get(&self, provider: &str) -> StorageResult<Option<ProviderHealth>> {
        let records = self.records.lock().unwrap();
        Ok(records.get(provider).cloned())
    }

    async fn increment_failures(
        &self,
        provider: &str,
        now_ms: i64,
        window_ms: u64,
        base_cooldown_ms: u64,
    ) -> StorageResult<ProviderHealth> {
        let mut records = self.records.lock().unwrap();
        let record = records
            .entry(provider.to_string())
            .or_insert_with(|| ProviderHealth::closed(provider, base_cooldown_ms));

        let window_floor = now_ms.saturating_sub(window_ms as i64);
        match record.window_started_at_ms {
            Some(started) if started >= window_floor => {
                record.consecutive_failures += 1;
            }
            _ => {
                record.consecutive_failures = 1;
                record.window_started_at_ms = Some(now_ms);
            }
        }
        record.version += 1;
        Ok(record.clone())
    }

    async fn reset(&self, provider: &str, base_cooldown_ms: u64) -> StorageResult<ProviderHealth> {
        let mut records = self.records.lock().unwrap();
        let version = records.get(provider).map(|r| r.version).unwrap_or(0);
        let mut record = ProviderHealth::closed(provider, base_cooldown_ms);
        record.version = version + 1;
        records.insert(provider.to_string(), record.clone());
        Ok(record)
    }

    async fn compare_and_swap(
        &self,
        expected_version: u64,
        next: ProviderHealth,
    ) -> StorageResult<bool> {
        let mut records = self.records.lock().unwrap();
        match records.get_mut(&next.provider) {
            Some(current) if current.version == expected_version => {
                let mut next = next;
                next.version = expected_version + 1;
                *current = next;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list(&self) -> StorageResult<Vec<ProviderHealth>> {
        let records = self.records.lock().unwrap();
        let mut all: Vec<ProviderHealth> = records.values().cloned().collect();
        all.sort_by(|a, b| a.provider.cmp(&b.provider));
        Ok(all)
    }
}

// ---------------------------------------------------------------------------
// Progress sinks
// ---------------------------------------------------------------------------

/// Records every published update in order.
#[derive(Debug, Default)]
pub struct MemoryProgressSink {
    updates: Mutex<Vec<ProgressUpdate>>,
}

impl MemoryProgressSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// All updates published so far, in publish order.
    pub fn updates(&self) -> Vec<ProgressUpdate> {
        self.updates.lock().unwrap().clone()
    }

    /// Updates for a single run, in publish order.
    pub fn updates_for(&self, run_id: &str) -> Vec<ProgressUpdate> {
        self.updates
            .lock()
            .unwrap()
            .iter()
            .filter(|u| u.run_id == run_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ProgressSink for MemoryProgressSink {
    async fn publish(&self, update: ProgressUpdate) -> StorageResult<()> {
        self.updates.lock().unwrap().push(update);
        Ok(())
    }
}

/// Discards every update.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProgressSink;

#[async_trait]
impl ProgressSink for NoopProgressSink {
    async fn publish(&self, _update: ProgressUpdate) -> StorageResult<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryAnalysisCache
// ---------------------------------------------------------------------------

/// In-memory last-known-good cache keyed by image reference.
#[derive(Debug, Default)]
pub struct MemoryAnalysisCache {
    entries: Mutex<HashMap<String, CachedAnalysis>>,
}

impl MemoryAnalysisCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AnalysisCache for MemoryAnalysisCache {
    async fn get_last_known_good(&self, image_ref: &str) -> StorageResult<Option<CachedAnalysis>> {
        let entries = self.entries.lock().unwrap();
        Ok(entries.get(image_ref).cloned())
    }

    async fn put_last_known_good(
        &self,
        image_ref: &str,
        analysis: serde_json::Value,
    ) -> StorageResult<()> {
        let mut entries = self.entries.lock().unwrap();
        entries.insert(
            image_ref.to_string(),
            CachedAnalysis {
                image_ref: image_ref.to_string(),
                analysis,
                stored_at: Utc::now(),
            },
        );
        Ok(())
    }
}
