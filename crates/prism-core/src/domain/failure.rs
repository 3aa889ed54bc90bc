//! Failure taxonomy shared by the classifier, breaker, orchestrator and
//! recovery synthesizer.

use std::fmt;

use serde::{Deserialize, Serialize};

/// What kind of failure a stage attempt (or a whole run) ended with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    #[serde(rename = "transient")]
    Transient,
    #[serde(rename = "rate-limited")]
    RateLimited,
    #[serde(rename = "malformed-response")]
    MalformedResponse,
    #[serde(rename = "auth/config")]
    AuthConfig,
    #[serde(rename = "permanent")]
    Permanent,
    #[serde(rename = "provider-unavailable")]
    ProviderUnavailable,
    #[serde(rename = "cancelled")]
    Cancelled,
    #[serde(rename = "exhausted-retries")]
    ExhaustedRetries,
    #[serde(rename = "invalid-request")]
    InvalidRequest,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Transient => "transient",
            FailureKind::RateLimited => "rate-limited",
            FailureKind::MalformedResponse => "malformed-response",
            FailureKind::AuthConfig => "auth/config",
            FailureKind::Permanent => "permanent",
            FailureKind::ProviderUnavailable => "provider-unavailable",
            FailureKind::Cancelled => "cancelled",
            FailureKind::ExhaustedRetries => "exhausted-retries",
            FailureKind::InvalidRequest => "invalid-request",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal failure recorded on a stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageFailure {
    pub kind: FailureKind,
    /// For `exhausted-retries`, the kind of the last failed attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub underlying: Option<FailureKind>,
    pub message: String,
}

impl StageFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            underlying: None,
            message: message.into(),
        }
    }

    /// A retryable failure that ran out of attempts.
    pub fn exhausted(last: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::ExhaustedRetries,
            underlying: Some(last),
            message: message.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self::new(FailureKind::Cancelled, "run was cancelled")
    }
}

/// Why a run ended `failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureCause {
    pub kind: FailureKind,
    /// Stage whose failure decided the run, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    pub message: String,
}

impl FailureCause {
    pub fn cancelled() -> Self {
        Self {
            kind: FailureKind::Cancelled,
            stage: None,
            message: "run was cancelled".to_string(),
        }
    }

    /// Cause taken from a failed stage.
    pub fn from_stage(stage: &str, failure: &StageFailure) -> Self {
        Self {
            kind: failure.kind,
            stage: Some(stage.to_string()),
            message: failure.message.clone(),
        }
    }
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.stage {
            Some(stage) => write!(f, "{} in stage {}: {}", self.kind, stage, self.message),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_kind_wire_names() {
        let json = serde_json::to_string(&FailureKind::AuthConfig).unwrap();
        assert_eq!(json, "\"auth/config\"");
        let back: FailureKind = serde_json::from_str("\"rate-limited\"").unwrap();
        assert_eq!(back, FailureKind::RateLimited);
        assert_eq!(FailureKind::ExhaustedRetries.to_string(), "exhausted-retries");
    }

    #[test]
    fn test_exhausted_keeps_underlying_kind() {
        let failure = StageFailure::exhausted(FailureKind::Transient, "503 after 4 attempts");
        assert_eq!(failure.kind, FailureKind::ExhaustedRetries);
        assert_eq!(failure.underlying, Some(FailureKind::Transient));

        let cause = FailureCause::from_stage("scene_extraction", &failure);
        assert!(cause.to_string().contains("scene_extraction"));
    }
}
