//! Analysis requests.

use serde::{Deserialize, Serialize};

use crate::domain::error::{PrismError, Result};
use crate::domain::stage::STANDARD_STAGES;

/// Scheduling priority carried through to providers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

/// Per-request recovery and retry knobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestOptions {
    pub enable_partial_recovery: bool,
    /// Retries allowed per stage (0 = a single attempt).
    pub max_retry_attempts: u32,
    /// Base delay for exponential backoff between retries (milliseconds).
    pub retry_delay_ms: u64,
    pub enable_degraded_mode: bool,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            enable_partial_recovery: true,
            max_retry_attempts: 3,
            retry_delay_ms: 1_000,
            enable_degraded_mode: true,
        }
    }
}

/// A validated, immutable analysis request.
///
/// Built through [`AnalysisRequest::builder`]; there is no way to mutate a
/// request after `build()`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisRequest {
    image_ref: String,
    user_context: Option<String>,
    requested_stages: Vec<String>,
    priority: Priority,
    options: RequestOptions,
}

impl AnalysisRequest {
    /// Start building a request for an image. Defaults to the standard stages.
    pub fn builder(image_ref: impl Into<String>) -> AnalysisRequestBuilder {
        AnalysisRequestBuilder {
            image_ref: image_ref.into(),
            user_context: None,
            requested_stages: STANDARD_STAGES.iter().map(|s| s.to_string()).collect(),
            priority: Priority::default(),
            options: RequestOptions::default(),
        }
    }

    pub fn image_ref(&self) -> &str {
        &self.image_ref
    }

    pub fn user_context(&self) -> Option<&str> {
        self.user_context.as_deref()
    }

    /// Stage names in the order the caller asked for them.
    pub fn requested_stages(&self) -> &[String] {
        &self.requested_stages
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn options(&self) -> &RequestOptions {
        &self.options
    }

    pub fn requests_stage(&self, stage: &str) -> bool {
        self.requested_stages.iter().any(|s| s == stage)
    }
}

/// Builder for [`AnalysisRequest`].
#[derive(Debug, Clone)]
pub struct AnalysisRequestBuilder {
    image_ref: String,
    user_context: Option<String>,
    requested_stages: Vec<String>,
    priority: Priority,
    options: RequestOptions,
}

impl AnalysisRequestBuilder {
    pub fn user_context(mut self, context: impl Into<String>) -> Self {
        self.user_context = Some(context.into());
        self
    }

    /// Replace the requested stages (order is preserved).
    pub fn stages<I, S>(mut self, stages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.requested_stages = stages.into_iter().map(Into::into).collect();
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn options(mut self, options: RequestOptions) -> Self {
        self.options = options;
        self
    }

    pub fn max_retry_attempts(mut self, attempts: u32) -> Self {
        self.options.max_retry_attempts = attempts;
        self
    }

    pub fn retry_delay_ms(mut self, delay_ms: u64) -> Self {
        self.options.retry_delay_ms = delay_ms;
        self
    }

    pub fn partial_recovery(mut self, enabled: bool) -> Self {
        self.options.enable_partial_recovery = enabled;
        self
    }

    pub fn degraded_mode(mut self, enabled: bool) -> Self {
        self.options.enable_degraded_mode = enabled;
        self
    }

    /// Validate and freeze the request.
    pub fn build(self) -> Result<AnalysisRequest> {
        let image_ref = self.image_ref.trim().to_string();
        if image_ref.is_empty() {
            return Err(PrismError::InvalidRequest(
                "image_ref must not be empty".to_string(),
            ));
        }
        if self.requested_stages.is_empty() {
            return Err(PrismError::InvalidRequest(
                "at least one stage must be requested".to_string(),
            ));
        }
        for (i, stage) in self.requested_stages.iter().enumerate() {
            if stage.trim().is_empty() {
                return Err(PrismError::InvalidRequest(
                    "stage names must not be empty".to_string(),
                ));
            }
            if self.requested_stages[..i].contains(stage) {
                return Err(PrismError::InvalidRequest(format!(
                    "stage `{stage}` requested more than once"
                )));
            }
        }

        let user_context = self
            .user_context
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty());

        Ok(AnalysisRequest {
            image_ref,
            user_context,
            requested_stages: self.requested_stages,
            priority: self.priority,
            options: self.options,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults_to_standard_stages() {
        let req = AnalysisRequest::builder("img-1").build().unwrap();
        assert_eq!(
            req.requested_stages(),
            &["scene_extraction", "interpretation", "synthesis"]
        );
        assert_eq!(req.priority(), Priority::Normal);
        assert_eq!(req.options(), &RequestOptions::default());
        assert!(req.user_context().is_none());
    }

    #[test]
    fn test_builder_rejects_empty_image_ref() {
        let err = AnalysisRequest::builder("   ").build().unwrap_err();
        assert!(matches!(err, PrismError::InvalidRequest(_)));
    }

    #[test]
    fn test_builder_rejects_duplicate_stages() {
        let err = AnalysisRequest::builder("img-1")
            .stages(["scene_extraction", "scene_extraction"])
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn test_builder_rejects_no_stages() {
        let err = AnalysisRequest::builder("img-1")
            .stages(Vec::<String>::new())
            .build()
            .unwrap_err();
        assert!(matches!(err, PrismError::InvalidRequest(_)));
    }

    #[test]
    fn test_blank_context_is_dropped() {
        let req = AnalysisRequest::builder("img-1")
            .user_context("  ")
            .build()
            .unwrap();
        assert!(req.user_context().is_none());
    }

    #[test]
    fn test_options_deserialize_with_defaults() {
        let opts: RequestOptions = serde_json::from_str(r#"{"max_retry_attempts": 1}"#).unwrap();
        assert_eq!(opts.max_retry_attempts, 1);
        assert!(opts.enable_degraded_mode);
        assert_eq!(opts.retry_delay_ms, 1_000);
    }
}
