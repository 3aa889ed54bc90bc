//! HTTP provider client.
//!
//! Posts `{stage, payload}` as JSON to each provider's endpoint with bearer
//! auth read from an environment variable, and maps transport and status
//! failures onto [`ProviderError`].

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use super::{ProviderClient, ProviderError};
use crate::domain::{PrismError, Result};

/// Where and how to reach one provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderEndpoint {
    pub endpoint: String,
    /// Environment variable holding the API key.
    pub api_key_env: String,
}

/// reqwest-backed [`ProviderClient`].
pub struct HttpProviderClient {
    http_client: reqwest::Client,
    providers: BTreeMap<String, ProviderEndpoint>,
}

impl HttpProviderClient {
    pub fn new(providers: BTreeMap<String, ProviderEndpoint>) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .user_agent(concat!("prism/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| PrismError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http_client,
            providers,
        })
    }
}

#[async_trait]
impl ProviderClient for HttpProviderClient {
    #[instrument(skip(self, payload), fields(stage = %stage, provider = %provider))]
    async fn call(
        &self,
        stage: &str,
        provider: &str,
        payload: &serde_json::Value,
        timeout_ms: u64,
    ) -> std::result::Result<String, ProviderError> {
        let endpoint = self
            .providers
            .get(provider)
            .ok_or_else(|| ProviderError::NotConfigured {
                provider: provider.to_string(),
            })?;

        let api_key = std::env::var(&endpoint.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| ProviderError::MissingCredential {
                provider: provider.to_string(),
            })?;

        let body = serde_json::json!({ "stage": stage, "payload": payload });

        let resp = self
            .http_client
            .post(&endpoint.endpoint)
            .bearer_auth(api_key)
            .timeout(Duration::from_millis(timeout_ms))
            .json(&body)
            .send()
            .await
            .map_err(|e| map_transport_error(e, timeout_ms))?;

        let status = resp.status();
        if !status.is_success() {
            let retry_after_ms = retry_after_ms(resp.headers());
            let body = resp.text().await.unwrap_or_default();
            debug!(status = status.as_u16(), "provider returned an error status");
            return Err(ProviderError::Http {
                status: status.as_u16(),
                body,
                retry_after_ms,
            });
        }

        resp.text()
            .await
            .map_err(|e| map_transport_error(e, timeout_ms))
    }
}

fn map_transport_error(err: reqwest::Error, timeout_ms: u64) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Timeout { timeout_ms }
    } else if err.is_connect() || err.is_request() || err.is_body() {
        ProviderError::Connection(err.to_string())
    } else {
        ProviderError::Other(err.to_string())
    }
}

/// `Retry-After` in delta-seconds form. HTTP-date values are ignored.
fn retry_after_ms(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(|secs| secs.saturating_mul(1_000))
}
