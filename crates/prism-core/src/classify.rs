//! Error classifier: the single source of truth for retry decisions and
//! breaker health accounting.

use regex::RegexSet;
use serde::{Deserialize, Serialize};

use crate::domain::{FailureKind, PrismError, Result};
use crate::provider::{AttemptError, ProviderError, ResponseMeta};

/// Classifier settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Minimum backoff before retrying a rate-limited call.
    pub rate_limit_floor_ms: u64,
    /// Case-insensitive patterns that mark a response body as a quota signal.
    pub quota_patterns: Vec<String>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            rate_limit_floor_ms: 5_000,
            quota_patterns: vec![
                r"quota".to_string(),
                r"rate[ _-]?limit".to_string(),
                r"resource[ _-]?exhausted".to_string(),
                r"overloaded".to_string(),
            ],
        }
    }
}

/// How an outcome affects the provider's breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerEffect {
    /// Counts toward opening the breaker.
    Failure,
    /// The provider answered; clears the failure streak.
    Healthy,
    /// Says nothing about provider health.
    Neutral,
}

/// Classification of one failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub kind: FailureKind,
    pub retryable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_floor_ms: Option<u64>,
}

impl Classification {
    fn new(kind: FailureKind, retryable: bool) -> Self {
        Self {
            kind,
            retryable,
            backoff_floor_ms: None,
        }
    }

    pub fn breaker_effect(&self) -> BreakerEffect {
        breaker_effect(self.kind)
    }
}

/// Breaker accounting for a failure kind.
pub fn breaker_effect(kind: FailureKind) -> BreakerEffect {
    match kind {
        FailureKind::Transient | FailureKind::RateLimited => BreakerEffect::Failure,
        FailureKind::MalformedResponse | FailureKind::Permanent => BreakerEffect::Healthy,
        FailureKind::AuthConfig
        | FailureKind::Cancelled
        | FailureKind::ProviderUnavailable
        | FailureKind::ExhaustedRetries
        | FailureKind::InvalidRequest => BreakerEffect::Neutral,
    }
}

/// Maps attempt failures onto [`FailureKind`]s.
#[derive(Debug, Clone)]
pub struct ErrorClassifier {
    rate_limit_floor_ms: u64,
    quota_signals: RegexSet,
}

impl ErrorClassifier {
    /// Compile the configured quota patterns.
    pub fn new(config: &ClassifierConfig) -> Result<Self> {
        let patterns = config.quota_patterns.iter().map(|p| format!("(?i){p}"));
        let quota_signals = RegexSet::new(patterns)
            .map_err(|e| PrismError::Config(format!("invalid quota pattern: {e}")))?;
        Ok(Self {
            rate_limit_floor_ms: config.rate_limit_floor_ms,
            quota_signals,
        })
    }

    fn has_quota_signal(&self, text: &str) -> bool {
        self.quota_signals.is_match(text)
    }

    fn rate_limited(&self, retry_after_ms: Option<u64>) -> Classification {
        let floor = retry_after_ms
            .unwrap_or(0)
            .max(self.rate_limit_floor_ms);
        Classification {
            kind: FailureKind::RateLimited,
            retryable: true,
            backoff_floor_ms: Some(floor),
        }
    }

    pub fn classify(&self, error: &AttemptError, meta: &ResponseMeta) -> Classification {
        match error {
            AttemptError::Malformed { .. } => Classification::new(
                FailureKind::MalformedResponse,
                meta.prior_malformed_attempts == 0,
            ),
            AttemptError::Provider(err) => self.classify_provider(err),
        }
    }

    fn classify_provider(&self, error: &ProviderError) -> Classification {
        match error {
            ProviderError::Timeout { .. } | ProviderError::Connection(_) => {
                Classification::new(FailureKind::Transient, true)
            }
            ProviderError::Quota(_) => self.rate_limited(None),
            ProviderError::MissingCredential { .. } | ProviderError::NotConfigured { .. } => {
                Classification::new(FailureKind::AuthConfig, false)
            }
            ProviderError::Http {
                status,
                body,
                retry_after_ms,
            } => {
                if *status == 429 || self.has_quota_signal(body) {
                    self.rate_limited(*retry_after_ms)
                } else if *status >= 500 || *status == 408 {
                    Classification::new(FailureKind::Transient, true)
                } else if *status == 401 || *status == 403 {
                    Classification::new(FailureKind::AuthConfig, false)
                } else {
                    Classification::new(FailureKind::Permanent, false)
                }
            }
            ProviderError::Other(message) => {
                let lower = message.to_lowercase();
                if self.has_quota_signal(message) {
                    self.rate_limited(None)
                } else if lower.contains("connection reset")
                    || lower.contains("connection refused")
                    || lower.contains("timed out")
                {
                    Classification::new(FailureKind::Transient, true)
                } else {
                    Classification::new(FailureKind::Permanent, false)
                }
            }
        }
    }
}
