//! Storage trait definitions for Prism
//!
//! These traits define the shared-store abstractions the pipeline consumes:
//! - `HealthStore`: per-provider circuit breaker state (atomic ops + CAS)
//! - `ProgressSink`: fire-and-forget job progress updates
//! - `AnalysisCache`: last-known-good analysis per image reference
//!
//! All traits are async and backend-agnostic. In-memory fakes are provided
//! for testing via the `fakes` module.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// HealthStore: Circuit Breaker State
// ---------------------------------------------------------------------------

/// Circuit breaker state of a single provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    /// Stable string form used by the database backends.
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half-open",
        }
    }

    /// Parse the stable string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "closed" => Some(BreakerState::Closed),
            "open" => Some(BreakerState::Open),
            "half-open" => Some(BreakerState::HalfOpen),
            _ => None,
        }
    }
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared health record for one provider.
///
/// `version` increases by one on every successful write and is the token
/// used by [`HealthStore::compare_and_swap`]. Timestamps are Unix epoch
/// milliseconds so every process sharing the store compares the same clock
/// domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderHealth {
    pub provider: String,
    pub state: BreakerState,
    pub consecutive_failures: u32,
    /// Start of the current failure streak's sliding window.
    pub window_started_at_ms: Option<i64>,
    pub opened_at_ms: Option<i64>,
    /// Cool-down applied the next time the breaker is open.
    pub cooldown_ms: u64,
    /// When the current half-open trial call was handed out.
    pub trial_started_at_ms: Option<i64>,
    pub version: u64,
}

impl ProviderHealth {
    /// A never-written, healthy record (version 0).
    pub fn closed(provider: impl Into<String>, cooldown_ms: u64) -> Self {
        Self {
            provider: provider.into(),
            state: BreakerState::Closed,
            consecutive_failures: 0,
            window_started_at_ms: None,
            opened_at_ms: None,
            cooldown_ms,
            trial_started_at_ms: None,
            version: 0,
        }
    }

    /// Whether an open breaker's cool-down has elapsed at `now_ms`.
    pub fn cooldown_elapsed(&self, now_ms: i64) -> bool {
        match self.opened_at_ms {
            Some(opened) => now_ms.saturating_sub(opened) >= self.cooldown_ms as i64,
            None => true,
        }
    }
}

/// Shared store for circuit breaker state.
///
/// Guarantees:
/// - `increment_failures` and `reset` are single atomic operations; racing
///   callers never lose an update.
/// - `compare_and_swap` writes only when the stored `version` equals
///   `expected_version`, and bumps the version on success.
#[async_trait]
pub trait HealthStore: Send + Sync {
    /// Current record for a provider, `None` if never written.
    async fn get(&self, provider: &str) -> StorageResult<Option<ProviderHealth>>;

    /// Atomically count one failure.
    ///
    /// If the streak's window started before `now_ms - window_ms` (or no
    /// streak exists) the count restarts at 1 with the window starting at
    /// `now_ms`. Creates the record when absent, using `base_cooldown_ms`.
    async fn increment_failures(
        &self,
        provider: &str,
        now_ms: i64,
        window_ms: u64,
        base_cooldown_ms: u64,
    ) -> StorageResult<ProviderHealth>;

    /// Atomically close the breaker and clear the failure streak.
    async fn reset(&self, provider: &str, base_cooldown_ms: u64) -> StorageResult<ProviderHealth>;

    /// Replace the record if its version still equals `expected_version`.
    ///
    /// Returns `false` when another writer got there first (or the record
    /// does not exist).
    async fn compare_and_swap(
        &self,
        expected_version: u64,
        next: ProviderHealth,
    ) -> StorageResult<bool>;

    /// Every known provider record, sorted by provider name.
    async fn list(&self) -> StorageResult<Vec<ProviderHealth>>;
}

// ---------------------------------------------------------------------------
// ProgressSink: Job Progress
// ---------------------------------------------------------------------------

/// One progress update for a pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub run_id: String,
    /// Stage the update refers to (`None` for run-level updates).
    pub stage: Option<String>,
    /// Status label (e.g. "running", "retrying", "succeeded", "completed").
    pub status: String,
    /// Run completion percentage, 0-100.
    pub progress: u8,
    pub message: String,
    pub metadata: serde_json::Value,
    pub emitted_at: DateTime<Utc>,
}

/// Job/progress store.
///
/// Callers treat publishing as fire-and-forget: an error is logged by the
/// caller and never fails the run.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    /// Persist/broadcast one update.
    async fn publish(&self, update: ProgressUpdate) -> StorageResult<()>;
}

// ---------------------------------------------------------------------------
// AnalysisCache: Last Known Good
// ---------------------------------------------------------------------------

/// A cached analysis body for an image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedAnalysis {
    pub image_ref: String,
    /// Serialized analysis (shape owned by the pipeline crate).
    pub analysis: serde_json::Value,
    pub stored_at: DateTime<Utc>,
}

/// Last-known-good analysis cache keyed by image reference.
#[async_trait]
pub trait AnalysisCache: Send + Sync {
    /// Most recent good analysis for the image, if any.
    async fn get_last_known_good(&self, image_ref: &str) -> StorageResult<Option<CachedAnalysis>>;

    /// Replace the cached analysis for the image.
    async fn put_last_known_good(
        &self,
        image_ref: &str,
        analysis: serde_json::Value,
    ) -> StorageResult<()>;
}
