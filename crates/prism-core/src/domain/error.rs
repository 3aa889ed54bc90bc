//! Domain-level error taxonomy for Prism.

use crate::domain::run::RunId;
use crate::domain::stage::StageStatus;

/// Prism domain errors.
#[derive(Debug, thiserror::Error)]
pub enum PrismError {
    #[error("invalid analysis request: {0}")]
    InvalidRequest(String),

    #[error("invalid stage plan: {0}")]
    InvalidPlan(String),

    #[error("stage {stage} is already terminal ({status})")]
    StageAlreadyTerminal { stage: String, status: StageStatus },

    #[error("stage {stage} cannot move from {from} to {to}")]
    InvalidTransition {
        stage: String,
        from: StageStatus,
        to: StageStatus,
    },

    #[error("run not found: {0}")]
    RunNotFound(RunId),

    #[error("run {0} ended without a terminal status")]
    RunInterrupted(RunId),

    #[error("storage error: {0}")]
    Storage(#[from] prism_state::StorageError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for Prism domain operations.
pub type Result<T> = std::result::Result<T, PrismError>;
