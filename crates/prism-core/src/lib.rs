//! Prism Core Library
//!
//! Resilient multi-stage image analysis: drives an image reference and user
//! context through AI provider stages, normalizes their replies, classifies
//! failures, trips per-provider circuit breakers, and degrades gracefully
//! when stages cannot complete.

pub mod breaker;
pub mod classify;
pub mod config;
pub mod domain;
pub mod metrics;
pub mod normalize;
pub mod obs;
pub mod orchestrator;
pub mod provider;
pub mod quality;
pub mod recovery;
pub mod service;
pub mod telemetry;

pub use breaker::{
    Admission, BreakerConfig, CircuitBreakerRegistry, Clock, Permit, SystemClock,
};
pub use classify::{BreakerEffect, Classification, ClassifierConfig, ErrorClassifier};
pub use config::PipelineConfig;
pub use domain::{
    AnalysisMetadata, AnalysisRequest, AnalysisRequestBuilder, FailureCause, FailureKind,
    NormalizedAnalysis, OutputSchema, OverallStatus, PipelineRun, Priority, PrismError,
    RecoveryMode, RequestOptions, Result, RunId, StageCatalog, StageDefinition, StageFailure,
    StageOutput, StageResult, StageStatus, Summary,
};
pub use normalize::{NormalizeOutcome, Normalizer};
pub use orchestrator::{BackoffPolicy, ExecutionPlan, Orchestrator, OrchestratorBuilder};
pub use provider::{
    AttemptError, HttpProviderClient, ProviderClient, ProviderEndpoint, ProviderError,
    ResponseMeta,
};
pub use quality::QualityWeights;
pub use recovery::{RecoveryConfig, RecoveryDecision, RecoverySynthesizer, Synthesis};
pub use service::{AnalysisService, CompletionPayload};

/// Prism version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
