//! Pipeline runs and their overall status.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::analysis::{NormalizedAnalysis, RecoveryMode};
use crate::domain::error::{PrismError, Result};
use crate::domain::failure::FailureCause;
use crate::domain::request::AnalysisRequest;
use crate::domain::stage::{StageCatalog, StageResult, StageStatus};

/// Identifier of one pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RunId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Run-level state machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum OverallStatus {
    Running,
    Completed,
    Partial { missing_stages: Vec<String> },
    Degraded { limitations: Vec<String> },
    Failed { cause: FailureCause },
}

impl OverallStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, OverallStatus::Running)
    }

    pub fn label(&self) -> &'static str {
        match self {
            OverallStatus::Running => "running",
            OverallStatus::Completed => "completed",
            OverallStatus::Partial { .. } => "partial",
            OverallStatus::Degraded { .. } => "degraded",
            OverallStatus::Failed { .. } => "failed",
        }
    }

    /// Recovery mode implied by a terminal status (`None` for running/failed).
    pub fn mode(&self) -> Option<RecoveryMode> {
        match self {
            OverallStatus::Completed => Some(RecoveryMode::Full),
            OverallStatus::Partial { .. } => Some(RecoveryMode::Partial),
            OverallStatus::Degraded { .. } => Some(RecoveryMode::Degraded),
            OverallStatus::Running | OverallStatus::Failed { .. } => None,
        }
    }
}

/// One request driven through the pipeline.
///
/// Owns its stage results exclusively; only the orchestrator running it
/// mutates them.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineRun {
    pub id: RunId,
    pub request: AnalysisRequest,
    /// One entry per requested stage, in request order.
    pub stage_results: Vec<StageResult>,
    pub overall_status: OverallStatus,
    pub quality_score: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analysis: Option<NormalizedAnalysis>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl PipelineRun {
    /// A running run with a pending result for every requested stage.
    pub fn new(id: RunId, request: AnalysisRequest, catalog: &StageCatalog) -> Result<Self> {
        let stage_results = request
            .requested_stages()
            .iter()
            .map(|name| {
                catalog
                    .get(name)
                    .map(|def| StageResult::pending(name.clone(), def.provider.clone()))
                    .ok_or_else(|| PrismError::InvalidPlan(format!("unknown stage `{name}`")))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            id,
            request,
            stage_results,
            overall_status: OverallStatus::Running,
            quality_score: 0,
            analysis: None,
            created_at: Utc::now(),
            completed_at: None,
        })
    }

    pub fn stage(&self, name: &str) -> Option<&StageResult> {
        self.stage_results.iter().find(|r| r.stage == name)
    }

    pub fn stage_mut(&mut self, name: &str) -> Option<&mut StageResult> {
        self.stage_results.iter_mut().find(|r| r.stage == name)
    }

    pub fn is_terminal(&self) -> bool {
        self.overall_status.is_terminal()
    }

    /// Names of stages with the given status, in request order.
    pub fn stages_with(&self, status: StageStatus) -> Vec<String> {
        self.stage_results
            .iter()
            .filter(|r| r.status == status)
            .map(|r| r.stage.clone())
            .collect()
    }

    /// Retries across all stages.
    pub fn total_retries(&self) -> u32 {
        self.stage_results.iter().map(StageResult::retries).sum()
    }

    /// Completion percentage: terminal stages over requested stages.
    pub fn progress_percent(&self) -> u8 {
        if self.is_terminal() {
            return 100;
        }
        let total = self.stage_results.len();
        if total == 0 {
            return 0;
        }
        let done = self.stage_results.iter().filter(|r| r.is_terminal()).count();
        ((done * 100) / total) as u8
    }

    pub fn duration_ms(&self) -> u64 {
        let end = self.completed_at.unwrap_or_else(Utc::now);
        (end - self.created_at).num_milliseconds().max(0) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::stage::{SCENE_EXTRACTION, SYNTHESIS};

    #[test]
    fn test_new_run_has_pending_results_in_request_order() {
        let request = AnalysisRequest::builder("img-1")
            .stages([SYNTHESIS, SCENE_EXTRACTION])
            .build()
            .unwrap();
        let run = PipelineRun::new(RunId::new(), request, &StageCatalog::standard()).unwrap();

        assert_eq!(run.stage_results[0].stage, SYNTHESIS);
        assert_eq!(run.stage_results[1].provider, "vision");
        assert!(run
            .stage_results
            .iter()
            .all(|r| r.status == StageStatus::Pending));
        assert_eq!(run.overall_status, OverallStatus::Running);
        assert_eq!(run.progress_percent(), 0);
    }

    #[test]
    fn test_unknown_stage_is_invalid_plan() {
        let request = AnalysisRequest::builder("img-1")
            .stages(["ocr"])
            .build()
            .unwrap();
        let err = PipelineRun::new(RunId::new(), request, &StageCatalog::standard()).unwrap_err();
        assert!(matches!(err, PrismError::InvalidPlan(_)));
    }

    #[test]
    fn test_overall_status_serializes_tagged() {
        let status = OverallStatus::Partial {
            missing_stages: vec!["synthesis".to_string()],
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["status"], "partial");
        assert_eq!(json["missing_stages"][0], "synthesis");
        assert_eq!(status.mode(), Some(RecoveryMode::Partial));
        assert!(status.is_terminal());
        assert!(!OverallStatus::Running.is_terminal());
    }

    #[test]
    fn test_progress_percent_counts_terminal_stages() {
        let request = AnalysisRequest::builder("img-1").build().unwrap();
        let mut run = PipelineRun::new(RunId::new(), request, &StageCatalog::standard()).unwrap();
        run.stage_mut(SYNTHESIS).unwrap().skip("test").unwrap();
        assert_eq!(run.progress_percent(), 33);

        run.overall_status = OverallStatus::Completed;
        assert_eq!(run.progress_percent(), 100);
    }
}
