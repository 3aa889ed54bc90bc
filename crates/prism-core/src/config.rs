//! Pipeline configuration (TOML).
//!
//! ```toml
//! [[stages]]
//! name = "scene_extraction"
//! provider = "vision"
//! schema = "extraction"
//!
//! [breaker]
//! failure_threshold = 5
//!
//! [providers.vision]
//! endpoint = "https://vision.example.com/v1/analyze"
//! api_key_env = "PRISM_VISION_API_KEY"
//! ```
//!
//! Every section is optional; missing sections take their defaults, and the
//! default pipeline is the standard three-stage one.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::breaker::BreakerConfig;
use crate::classify::{ClassifierConfig, ErrorClassifier};
use crate::domain::{
    AnalysisRequest, PrismError, RequestOptions, Result, StageCatalog, StageDefinition,
};
use crate::orchestrator::{BackoffPolicy, ExecutionPlan};
use crate::provider::ProviderEndpoint;
use crate::quality::QualityWeights;
use crate::recovery::RecoveryConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub stages: Vec<StageDefinition>,
    pub breaker: BreakerConfig,
    pub backoff: BackoffPolicy,
    pub classifier: ClassifierConfig,
    pub quality: QualityWeights,
    pub recovery: RecoveryConfig,
    /// Request options used when the caller does not override them.
    pub defaults: RequestOptions,
    pub providers: BTreeMap<String, ProviderEndpoint>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let mut providers = BTreeMap::new();
        providers.insert(
            "vision".to_string(),
            ProviderEndpoint {
                endpoint: "http://127.0.0.1:8080/v1/vision".to_string(),
                api_key_env: "PRISM_VISION_API_KEY".to_string(),
            },
        );
        providers.insert(
            "reasoning".to_string(),
            ProviderEndpoint {
                endpoint: "http://127.0.0.1:8080/v1/reasoning".to_string(),
                api_key_env: "PRISM_REASONING_API_KEY".to_string(),
            },
        );

        Self {
            stages: StageCatalog::standard().iter().cloned().collect(),
            breaker: BreakerConfig::default(),
            backoff: BackoffPolicy::default(),
            classifier: ClassifierConfig::default(),
            quality: QualityWeights::default(),
            recovery: RecoveryConfig::default(),
            defaults: RequestOptions::default(),
            providers,
        }
    }
}

impl PipelineConfig {
    /// Read and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    /// Parse and validate TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| PrismError::Config(format!("invalid TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn catalog(&self) -> StageCatalog {
        self.stages.iter().cloned().collect()
    }

    pub fn validate(&self) -> Result<()> {
        if self.stages.is_empty() {
            return Err(PrismError::Config("at least one stage is required".into()));
        }

        let mut names = BTreeSet::new();
        for stage in &self.stages {
            if !names.insert(stage.name.as_str()) {
                return Err(PrismError::Config(format!(
                    "stage `{}` is defined more than once",
                    stage.name
                )));
            }
            if !self.providers.contains_key(&stage.provider) {
                return Err(PrismError::Config(format!(
                    "stage `{}` uses unknown provider `{}`",
                    stage.name, stage.provider
                )));
            }
            if stage.timeout_ms == 0 {
                return Err(PrismError::Config(format!(
                    "stage `{}` has a zero timeout",
                    stage.name
                )));
            }
        }
        for stage in &self.stages {
            if let Some(dep) = stage.depends_on.iter().find(|d| !names.contains(d.as_str())) {
                return Err(PrismError::Config(format!(
                    "stage `{}` depends on undefined stage `{dep}`",
                    stage.name
                )));
            }
        }

        let everything = AnalysisRequest::builder("config-validation")
            .stages(self.stages.iter().map(|s| s.name.clone()))
            .build()?;
        ExecutionPlan::build(&everything, &self.catalog())
            .map_err(|e| PrismError::Config(e.to_string()))?;

        if self.breaker.failure_threshold == 0 {
            return Err(PrismError::Config(
                "breaker.failure_threshold must be at least 1".into(),
            ));
        }
        if self.breaker.base_cooldown_ms > self.breaker.max_cooldown_ms {
            return Err(PrismError::Config(
                "breaker.base_cooldown_ms exceeds breaker.max_cooldown_ms".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.backoff.jitter_ratio) {
            return Err(PrismError::Config(
                "backoff.jitter_ratio must be within [0, 1]".into(),
            ));
        }
        if self.recovery.placeholder_score > 100 {
            return Err(PrismError::Config(
                "recovery.placeholder_score must be within [0, 100]".into(),
            ));
        }
        ErrorClassifier::new(&self.classifier)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{OutputSchema, SCENE_EXTRACTION};
    use std::io::Write;

    #[test]
    fn test_default_is_valid_standard_pipeline() {
        let config = PipelineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.catalog(), StageCatalog::standard());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = PipelineConfig::from_toml_str(
            r#"
            [breaker]
            failure_threshold = 2

            [quality]
            retry_penalty = 7.5
            "#,
        )
        .unwrap();
        assert_eq!(config.breaker.failure_threshold, 2);
        assert_eq!(config.breaker.base_cooldown_ms, 30_000);
        assert_eq!(config.quality.retry_penalty, 7.5);
        assert_eq!(config.stages.len(), 3);
    }

    #[test]
    fn test_custom_stages() {
        let config = PipelineConfig::from_toml_str(
            r#"
            [[stages]]
            name = "full_review"
            provider = "reasoning"
            schema = "full"
            timeout_ms = 90000
            "#,
        )
        .unwrap();
        let catalog = config.catalog();
        let stage = catalog.get("full_review").unwrap();
        assert_eq!(stage.schema, OutputSchema::Full);
        assert!(stage.required);
        assert!(catalog.get(SCENE_EXTRACTION).is_none());
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let err = PipelineConfig::from_toml_str(
            r#"
            [[stages]]
            name = "ocr"
            provider = "tesseract"
            schema = "extraction"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("tesseract"));
    }

    #[test]
    fn test_cycle_rejected() {
        let err = PipelineConfig::from_toml_str(
            r#"
            [[stages]]
            name = "a"
            provider = "vision"
            schema = "full"
            depends_on = ["b"]

            [[stages]]
            name = "b"
            provider = "vision"
            schema = "full"
            depends_on = ["a"]
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, PrismError::Config(_)));
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_bad_quota_pattern_rejected() {
        let err = PipelineConfig::from_toml_str(
            r#"
            [classifier]
            quota_patterns = ["(oops"]
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, PrismError::Config(_)));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[defaults]\nmax_retry_attempts = 1\nretry_delay_ms = 250").unwrap();
        let config = PipelineConfig::load(file.path()).unwrap();
        assert_eq!(config.defaults.max_retry_attempts, 1);
        assert_eq!(config.defaults.retry_delay_ms, 250);
        assert!(config.defaults.enable_degraded_mode);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = PipelineConfig::load("/definitely/not/here.toml").unwrap_err();
        assert!(matches!(err, PrismError::Io(_)));
    }
}
