//! Circuit breaker registry.
//!
//! Breaker state lives in a shared [`HealthStore`] so every process calling
//! a provider sees the same picture. The registry itself keeps no state:
//! failures are counted with the store's atomic increment, and every state
//! change is a version-checked compare-and-swap.
//!
//! ```text
//! closed --(threshold failures in window)--> open
//! open   --(cool-down elapsed, CAS winner)--> half-open (one trial call)
//! half-open --trial healthy--> closed (cool-down back to base)
//! half-open --trial failure--> open   (cool-down doubled, capped)
//! half-open --trial neutral--> open   (cool-down unchanged)
//! ```
//!
//! Store errors never block a call: the registry logs them and lets the
//! call through.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::classify::BreakerEffect;
use crate::domain::Result;
use crate::obs::emit_breaker_transition;
use prism_state::{BreakerState, HealthStore, ProviderHealth};

/// Source of wall-clock milliseconds.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

/// Unix epoch milliseconds from the system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// Breaker thresholds and timings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub failure_window_ms: u64,
    pub base_cooldown_ms: u64,
    pub max_cooldown_ms: u64,
    /// A half-open trial older than this may be handed to another caller.
    pub trial_lease_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window_ms: 60_000,
            base_cooldown_ms: 30_000,
            max_cooldown_ms: 300_000,
            trial_lease_ms: 60_000,
        }
    }
}

/// What kind of call the caller was allowed to make.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permit {
    /// Breaker closed.
    Normal,
    /// The single half-open trial call.
    Trial,
}

/// Answer to [`CircuitBreakerRegistry::try_acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Granted(Permit),
    Rejected { retry_in_ms: u64 },
}

impl Admission {
    pub fn is_granted(&self) -> bool {
        matches!(self, Admission::Granted(_))
    }
}

/// Per-provider circuit breakers over a shared health store.
#[derive(Clone)]
pub struct CircuitBreakerRegistry {
    store: Arc<dyn HealthStore>,
    clock: Arc<dyn Clock>,
    config: BreakerConfig,
}

impl std::fmt::Debug for CircuitBreakerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreakerRegistry")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl CircuitBreakerRegistry {
    pub fn new(store: Arc<dyn HealthStore>, clock: Arc<dyn Clock>, config: BreakerConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    async fn load(&self, provider: &str) -> Option<ProviderHealth> {
        match self.store.get(provider).await {
            Ok(health) => health,
            Err(e) => {
                warn!(provider = %provider, error = %e, "health store read failed; breaker treated as closed");
                None
            }
        }
    }

    async fn swap(&self, current: &ProviderHealth, next: ProviderHealth) -> bool {
        match self.store.compare_and_swap(current.version, next).await {
            Ok(swapped) => swapped,
            Err(e) => {
                warn!(provider = %current.provider, error = %e, "health store write failed");
                false
            }
        }
    }

    fn trial_expired(&self, health: &ProviderHealth, now_ms: i64) -> bool {
        match health.trial_started_at_ms {
            Some(started) => now_ms.saturating_sub(started) >= self.config.trial_lease_ms as i64,
            None => true,
        }
    }

    /// Whether a call to `provider` would be rejected right now.
    pub async fn is_open(&self, provider: &str) -> bool {
        let now = self.clock.now_ms();
        match self.load(provider).await {
            Some(health) => match health.state {
                BreakerState::Closed => false,
                BreakerState::Open => !health.cooldown_elapsed(now),
                BreakerState::HalfOpen => !self.trial_expired(&health, now),
            },
            None => false,
        }
    }

    /// Ask to call `provider`.
    ///
    /// Once an open breaker's cool-down has elapsed, exactly one caller wins
    /// the trial; the rest are rejected until it reports back or its lease
    /// runs out.
    pub async fn try_acquire(&self, provider: &str) -> Admission {
        let now = self.clock.now_ms();
        let Some(health) = self.load(provider).await else {
            return Admission::Granted(Permit::Normal);
        };

        match health.state {
            BreakerState::Closed => Admission::Granted(Permit::Normal),
            BreakerState::Open => {
                if !health.cooldown_elapsed(now) {
                    let opened = health.opened_at_ms.unwrap_or(now);
                    let remaining = (opened + health.cooldown_ms as i64 - now).max(0) as u64;
                    return Admission::Rejected {
                        retry_in_ms: remaining,
                    };
                }
                self.claim_trial(health, now, BreakerState::Open).await
            }
            BreakerState::HalfOpen => {
                if !self.trial_expired(&health, now) {
                    let started = health.trial_started_at_ms.unwrap_or(now);
                    let remaining =
                        (started + self.config.trial_lease_ms as i64 - now).max(0) as u64;
                    return Admission::Rejected {
                        retry_in_ms: remaining,
                    };
                }
                debug!(provider = %health.provider, "reclaiming expired trial lease");
                self.claim_trial(health, now, BreakerState::HalfOpen).await
            }
        }
    }

    async fn claim_trial(&self, health: ProviderHealth, now: i64, from: BreakerState) -> Admission {
        let mut next = health.clone();
        next.state = BreakerState::HalfOpen;
        next.trial_started_at_ms = Some(now);

        if self.swap(&health, next).await {
            if from != BreakerState::HalfOpen {
                emit_breaker_transition(&health.provider, from, BreakerState::HalfOpen);
            }
            Admission::Granted(Permit::Trial)
        } else {
            Admission::Rejected {
                retry_in_ms: self.config.trial_lease_ms,
            }
        }
    }

    /// Report how a permitted call went.
    pub async fn record_outcome(&self, provider: &str, permit: Permit, effect: BreakerEffect) {
        match (permit, effect) {
            (Permit::Normal, BreakerEffect::Failure) => self.count_failure(provider).await,
            (Permit::Normal, BreakerEffect::Healthy) => {
                if let Some(health) = self.load(provider).await {
                    if health.state == BreakerState::Closed && health.consecutive_failures > 0 {
                        self.reset_quietly(provider).await;
                    }
                }
            }
            (Permit::Normal, BreakerEffect::Neutral) => {}
            (Permit::Trial, BreakerEffect::Healthy) => {
                let from = self
                    .load(provider)
                    .await
                    .map(|h| h.state)
                    .unwrap_or(BreakerState::HalfOpen);
                self.reset_quietly(provider).await;
                if from != BreakerState::Closed {
                    emit_breaker_transition(provider, from, BreakerState::Closed);
                }
            }
            (Permit::Trial, BreakerEffect::Failure) => self.end_trial(provider, true).await,
            (Permit::Trial, BreakerEffect::Neutral) => self.end_trial(provider, false).await,
        }
    }

    async fn count_failure(&self, provider: &str) {
        let now = self.clock.now_ms();
        let health = match self
            .store
            .increment_failures(
                provider,
                now,
                self.config.failure_window_ms,
                self.config.base_cooldown_ms,
            )
            .await
        {
            Ok(health) => health,
            Err(e) => {
                warn!(provider = %provider, error = %e, "failed to count provider failure");
                return;
            }
        };

        if health.state == BreakerState::Closed
            && health.consecutive_failures >= self.config.failure_threshold
        {
            let mut next = health.clone();
            next.state = BreakerState::Open;
            next.opened_at_ms = Some(now);
            next.trial_started_at_ms = None;
            if self.swap(&health, next).await {
                emit_breaker_transition(provider, BreakerState::Closed, BreakerState::Open);
            }
        }
    }

    /// Put a half-open breaker back to open. A failed trial doubles the
    /// cool-down and restarts it; a neutral one leaves both untouched.
    async fn end_trial(&self, provider: &str, failed: bool) {
        let Some(health) = self.load(provider).await else {
            return;
        };
        if health.state != BreakerState::HalfOpen {
            return;
        }

        let mut next = health.clone();
        next.state = BreakerState::Open;
        next.trial_started_at_ms = None;
        if failed {
            next.opened_at_ms = Some(self.clock.now_ms());
            next.cooldown_ms = health
                .cooldown_ms
                .saturating_mul(2)
                .min(self.config.max_cooldown_ms);
        }
        if self.swap(&health, next).await {
            emit_breaker_transition(provider, BreakerState::HalfOpen, BreakerState::Open);
        }
    }

    async fn reset_quietly(&self, provider: &str) {
        if let Err(e) = self
            .store
            .reset(provider, self.config.base_cooldown_ms)
            .await
        {
            warn!(provider = %provider, error = %e, "failed to reset provider health");
        }
    }

    /// Current record for a provider; a never-seen provider reads as closed.
    pub async fn snapshot(&self, provider: &str) -> Result<ProviderHealth> {
        Ok(self
            .store
            .get(provider)
            .await?
            .unwrap_or_else(|| ProviderHealth::closed(provider, self.config.base_cooldown_ms)))
    }

    /// Every provider the store knows about.
    pub async fn list(&self) -> Result<Vec<ProviderHealth>> {
        Ok(self.store.list().await?)
    }

    /// Force a provider's breaker closed.
    pub async fn reset(&self, provider: &str) -> Result<ProviderHealth> {
        let before = self.store.get(provider).await?;
        let health = self
            .store
            .reset(provider, self.config.base_cooldown_ms)
            .await?;
        if let Some(before) = before {
            if before.state != BreakerState::Closed {
                emit_breaker_transition(provider, before.state, BreakerState::Closed);
            }
        }
        Ok(health)
    }
}
