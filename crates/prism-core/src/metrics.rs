//! Global atomic counters for pipeline observability.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event (e.g. at the end of a run).

use std::sync::atomic::{AtomicU64, Ordering};

use crate::domain::RecoveryMode;

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Lightweight atomic counters: no allocations, no locking.
pub struct Metrics {
    provider_calls: AtomicU64,
    retries: AtomicU64,
    breaker_rejections: AtomicU64,
    runs_full: AtomicU64,
    runs_partial: AtomicU64,
    runs_degraded: AtomicU64,
    runs_failed: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            provider_calls: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            breaker_rejections: AtomicU64::new(0),
            runs_full: AtomicU64::new(0),
            runs_partial: AtomicU64::new(0),
            runs_degraded: AtomicU64::new(0),
            runs_failed: AtomicU64::new(0),
        }
    }

    /// One provider call was issued.
    pub fn inc_provider_calls(&self) {
        self.provider_calls.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "provider_calls", "counter incremented");
    }

    /// One retry was scheduled.
    pub fn inc_retries(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "retries", "counter incremented");
    }

    /// One call was rejected by an open breaker.
    pub fn inc_breaker_rejections(&self) {
        self.breaker_rejections.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "breaker_rejections", "counter incremented");
    }

    /// One run finished; `None` means it failed.
    pub fn inc_run_finished(&self, mode: Option<RecoveryMode>) {
        let counter = match mode {
            Some(RecoveryMode::Full) => &self.runs_full,
            Some(RecoveryMode::Partial) => &self.runs_partial,
            Some(RecoveryMode::Degraded) => &self.runs_degraded,
            None => &self.runs_failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "runs_finished", "counter incremented");
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            provider_calls = self.provider_calls(),
            retries = self.retries(),
            breaker_rejections = self.breaker_rejections(),
            runs_full = self.runs_full.load(Ordering::Relaxed),
            runs_partial = self.runs_partial.load(Ordering::Relaxed),
            runs_degraded = self.runs_degraded.load(Ordering::Relaxed),
            runs_failed = self.runs_failed.load(Ordering::Relaxed),
        );
    }

    pub fn provider_calls(&self) -> u64 {
        self.provider_calls.load(Ordering::Relaxed)
    }

    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    pub fn breaker_rejections(&self) -> u64 {
        self.breaker_rejections.load(Ordering::Relaxed)
    }

    /// Finished runs for a mode (`None` = failed).
    pub fn runs_finished(&self, mode: Option<RecoveryMode>) -> u64 {
        match mode {
            Some(RecoveryMode::Full) => self.runs_full.load(Ordering::Relaxed),
            Some(RecoveryMode::Partial) => self.runs_partial.load(Ordering::Relaxed),
            Some(RecoveryMode::Degraded) => self.runs_degraded.load(Ordering::Relaxed),
            None => self.runs_failed.load(Ordering::Relaxed),
        }
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        for counter in [
            &self.provider_calls,
            &self.retries,
            &self.breaker_rejections,
            &self.runs_full,
            &self.runs_partial,
            &self.runs_degraded,
            &self.runs_failed,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}
