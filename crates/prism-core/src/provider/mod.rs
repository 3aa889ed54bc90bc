//! Provider invocation boundary.
//!
//! The pipeline never builds prompts or vendor envelopes; it hands a stage
//! payload to a [`ProviderClient`] and gets raw text back.

pub mod fakes;
pub mod http;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use http::{HttpProviderClient, ProviderEndpoint};

/// Failure raised by a provider call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum ProviderError {
    #[error("HTTP {status}: {body}")]
    Http {
        status: u16,
        body: String,
        /// Parsed `Retry-After`, if the provider sent one.
        retry_after_ms: Option<u64>,
    },

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("call timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("missing credential for provider {provider}")]
    MissingCredential { provider: String },

    #[error("provider {provider} is not configured")]
    NotConfigured { provider: String },

    #[error("quota exhausted: {0}")]
    Quota(String),

    #[error("{0}")]
    Other(String),
}

/// Why one attempt of a stage failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AttemptError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// The provider answered but no strategy could normalize the payload.
    #[error("malformed response: {reason}")]
    Malformed { reason: String },
}

/// Context about the attempt being classified.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResponseMeta {
    /// 1-based attempt number.
    pub attempt: u32,
    /// Earlier attempts of the same stage that ended malformed.
    pub prior_malformed_attempts: u32,
}

/// Calls an external AI provider for one stage.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Invoke `provider` for `stage` and return its raw text response.
    ///
    /// `timeout_ms` is advisory; the orchestrator enforces it regardless.
    async fn call(
        &self,
        stage: &str,
        provider: &str,
        payload: &serde_json::Value,
        timeout_ms: u64,
    ) -> Result<String, ProviderError>;
}
