//! Domain models for Prism.
//!
//! Canonical definitions for the core entities:
//! - `AnalysisRequest`: immutable request to analyse one image
//! - `StageDefinition` / `StageCatalog`: static stage configuration
//! - `StageResult`: per-run outcome of one stage
//! - `PipelineRun`: one request driven to a terminal status
//! - `NormalizedAnalysis`: the final analysis body

pub mod analysis;
pub mod error;
pub mod failure;
pub mod request;
pub mod run;
pub mod stage;

// Re-export main types and errors
pub use analysis::{
    AnalysisMetadata, AnnotationKind, CategoryScores, Level, NormalizedAnalysis, RecoveryMode,
    Severity, StageOutput, Suggestion, SuggestionCategory, Summary, VisualAnnotation,
};
pub use error::{PrismError, Result};
pub use failure::{FailureCause, FailureKind, StageFailure};
pub use request::{AnalysisRequest, AnalysisRequestBuilder, Priority, RequestOptions};
pub use run::{OverallStatus, PipelineRun, RunId};
pub use stage::{
    AttemptRecord, OutputSchema, Section, StageCatalog, StageDefinition, StageResult,
    StageStatus, INTERPRETATION, SCENE_EXTRACTION, STANDARD_STAGES, SYNTHESIS,
};
