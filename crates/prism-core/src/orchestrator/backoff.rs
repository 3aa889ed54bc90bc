//! Retry delays: exponential, capped, raised to the classifier's floor,
//! plus jitter.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    /// Upper bound of the exponential part.
    pub cap_ms: u64,
    /// Extra random delay as a fraction of the base delay, in `[0, 1]`.
    pub jitter_ratio: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            cap_ms: 30_000,
            jitter_ratio: 0.1,
        }
    }
}

impl BackoffPolicy {
    /// A policy without jitter, for deterministic timing.
    pub fn without_jitter(cap_ms: u64) -> Self {
        Self {
            cap_ms,
            jitter_ratio: 0.0,
        }
    }

    /// `max(min(retry_delay * 2^(attempt-1), cap), floor)` in milliseconds.
    ///
    /// The floor wins over the cap: a provider asking us to wait longer
    /// than the cap gets its wait.
    pub fn base_delay_ms(&self, retry_delay_ms: u64, attempt: u32, floor_ms: Option<u64>) -> u64 {
        let factor = 2u64
            .checked_pow(attempt.saturating_sub(1))
            .unwrap_or(u64::MAX);
        retry_delay_ms
            .saturating_mul(factor)
            .min(self.cap_ms)
            .max(floor_ms.unwrap_or(0))
    }

    /// Base delay plus uniform jitter in `[0, base * jitter_ratio]`.
    pub fn delay(&self, retry_delay_ms: u64, attempt: u32, floor_ms: Option<u64>) -> Duration {
        let base = self.base_delay_ms(retry_delay_ms, attempt, floor_ms);
        let max_jitter = (base as f64 * self.jitter_ratio.clamp(0.0, 1.0)) as u64;
        let jitter = if max_jitter == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=max_jitter)
        };
        Duration::from_millis(base.saturating_add(jitter))
    }
}
