//! Recovery and degraded-mode synthesis.
//!
//! After a stage fails, [`RecoverySynthesizer::decide_after_failure`] says
//! whether the run keeps going. Once every stage is terminal,
//! [`RecoverySynthesizer::synthesize`] picks the run's terminal status and
//! builds the analysis body:
//!
//! | situation                                                  | status    |
//! |------------------------------------------------------------|-----------|
//! | every requested stage succeeded                            | completed |
//! | every required stage succeeded, partial recovery off       | completed |
//! | some stage missing, partial on, root required stages ok    | partial   |
//! | required stage missing, degraded on                        | degraded  |
//! | anything else                                              | failed    |

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::domain::{
    AnalysisMetadata, CategoryScores, FailureCause, FailureKind, NormalizedAnalysis,
    OverallStatus, PipelineRun, RecoveryMode, StageCatalog, StageResult, StageStatus, Summary,
};
use prism_state::AnalysisCache;

/// Recovery settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Neutral score used by placeholder and template summaries.
    pub placeholder_score: u8,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            placeholder_score: 50,
        }
    }
}

/// Whether a run keeps scheduling stages after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryDecision {
    Continue,
    Abort,
}

/// Terminal status plus the analysis body, if the run produced one.
#[derive(Debug, Clone, PartialEq)]
pub struct Synthesis {
    pub status: OverallStatus,
    pub analysis: Option<NormalizedAnalysis>,
}

/// Decides recovery and builds final analyses.
#[derive(Debug, Clone)]
pub struct RecoverySynthesizer {
    catalog: Arc<StageCatalog>,
    config: RecoveryConfig,
}

impl RecoverySynthesizer {
    pub fn new(catalog: Arc<StageCatalog>, config: RecoveryConfig) -> Self {
        Self { catalog, config }
    }

    fn is_required(&self, stage: &str) -> bool {
        self.catalog.get(stage).map(|d| d.required).unwrap_or(true)
    }

    /// Required with none of its dependencies part of this run.
    fn is_root_required(&self, run: &PipelineRun, stage: &str) -> bool {
        match self.catalog.get(stage) {
            Some(def) => {
                def.required
                    && def
                        .depends_on
                        .iter()
                        .all(|dep| !run.request.requests_stage(dep))
            }
            None => true,
        }
    }

    pub fn decide_after_failure(&self, run: &PipelineRun, failed: &StageResult) -> RecoveryDecision {
        if failed.error.as_ref().map(|e| e.kind) == Some(FailureKind::Cancelled) {
            return RecoveryDecision::Abort;
        }
        let options = run.request.options();
        if self.is_required(&failed.stage)
            && !options.enable_partial_recovery
            && !options.enable_degraded_mode
        {
            return RecoveryDecision::Abort;
        }
        RecoveryDecision::Continue
    }

    /// Pick the terminal status of a run whose stages are all terminal.
    ///
    /// The cache is read only on the degraded path; a cache error falls back
    /// to the template response.
    pub async fn synthesize(&self, run: &PipelineRun, cache: &dyn AnalysisCache) -> Synthesis {
        let options = run.request.options();
        let succeeded: Vec<&StageResult> = run
            .stage_results
            .iter()
            .filter(|r| r.status == StageStatus::Succeeded)
            .collect();
        let missing: Vec<&StageResult> = run
            .stage_results
            .iter()
            .filter(|r| r.status != StageStatus::Succeeded)
            .collect();
        let required_missing = missing.iter().any(|r| self.is_required(&r.stage));

        if missing.is_empty() || (!required_missing && !options.enable_partial_recovery) {
            return self.full(run, &succeeded, &missing);
        }

        let roots_ok = run
            .stage_results
            .iter()
            .filter(|r| self.is_root_required(run, &r.stage))
            .all(|r| r.status == StageStatus::Succeeded);
        if options.enable_partial_recovery && !succeeded.is_empty() && (roots_ok || !required_missing)
        {
            return self.partial(run, &succeeded, &missing);
        }

        // Degraded needs a required stage that actually failed; a required
        // stage skipped behind a failed optional one does not qualify.
        let required_failed = missing
            .iter()
            .any(|r| r.status == StageStatus::Failed && self.is_required(&r.stage));
        if required_failed && options.enable_degraded_mode {
            return self.degraded(run, &succeeded, &missing, cache).await;
        }

        Synthesis {
            status: OverallStatus::Failed {
                cause: self.failure_cause(&missing),
            },
            analysis: None,
        }
    }

    fn placeholder_summary(&self) -> Summary {
        Summary {
            overall_score: self.config.placeholder_score,
            category_scores: CategoryScores::uniform(self.config.placeholder_score),
            key_issues: Vec::new(),
            strengths: Vec::new(),
        }
    }

    /// Merge succeeded outputs; a missing summary becomes a placeholder and
    /// yields a note for the caller.
    fn merge(&self, succeeded: &[&StageResult]) -> (NormalizedAnalysis, Option<String>) {
        let (mut analysis, has_summary) =
            NormalizedAnalysis::merge(succeeded.iter().filter_map(|r| r.normalized_output.as_ref()));
        analysis.metadata.warnings = stage_warnings(succeeded);
        if has_summary {
            (analysis, None)
        } else {
            analysis.summary = self.placeholder_summary();
            (
                analysis,
                Some("no stage produced a summary; a neutral placeholder summary is shown".into()),
            )
        }
    }

    fn full(&self, run: &PipelineRun, succeeded: &[&StageResult], missing: &[&StageResult]) -> Synthesis {
        let (mut analysis, note) = self.merge(succeeded);
        analysis.metadata.recovery_mode = Some(RecoveryMode::Full);
        if !missing.is_empty() {
            analysis.metadata.available_stages = Some(names(succeeded));
            analysis.metadata.missing_stages = Some(names(missing));
        }
        analysis
            .metadata
            .warnings
            .extend(missing.iter().map(|r| describe_missing(r)));
        if let Some(note) = note {
            analysis.metadata.warnings.push(note);
        }
        debug!(run_id = %run.id, "all required stages succeeded");
        Synthesis {
            status: OverallStatus::Completed,
            analysis: Some(analysis),
        }
    }

    fn partial(&self, run: &PipelineRun, succeeded: &[&StageResult], missing: &[&StageResult]) -> Synthesis {
        let (mut analysis, note) = self.merge(succeeded);
        let missing_stages = names(missing);
        let mut limitations: Vec<String> = missing.iter().map(|r| describe_missing(r)).collect();
        limitations.extend(note);

        analysis.metadata = AnalysisMetadata {
            recovery_mode: Some(RecoveryMode::Partial),
            available_stages: Some(names(succeeded)),
            missing_stages: Some(missing_stages.clone()),
            limitations: Some(limitations),
            quality_score: None,
            warnings: std::mem::take(&mut analysis.metadata.warnings),
        };
        debug!(run_id = %run.id, missing = missing_stages.len(), "partial result synthesized");
        Synthesis {
            status: OverallStatus::Partial { missing_stages },
            analysis: Some(analysis),
        }
    }

    async fn degraded(
        &self,
        run: &PipelineRun,
        succeeded: &[&StageResult],
        missing: &[&StageResult],
        cache: &dyn AnalysisCache,
    ) -> Synthesis {
        let mut limitations: Vec<String> = missing.iter().map(|r| describe_missing(r)).collect();
        let image_ref = run.request.image_ref();

        let cached = match cache.get_last_known_good(image_ref).await {
            Ok(Some(entry)) => match serde_json::from_value::<NormalizedAnalysis>(entry.analysis) {
                Ok(analysis) => Some((analysis, entry.stored_at)),
                Err(e) => {
                    warn!(run_id = %run.id, error = %e, "cached analysis is unreadable; using template");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(run_id = %run.id, error = %e, "analysis cache lookup failed; using template");
                None
            }
        };

        let (mut analysis, warnings) = match cached {
            Some((analysis, stored_at)) => {
                limitations.push(format!(
                    "showing the last known good analysis for this image from {}",
                    stored_at.to_rfc3339()
                ));
                (analysis, stage_warnings(succeeded))
            }
            None => {
                let (mut analysis, note) = self.merge(succeeded);
                if note.is_some() {
                    limitations.push(
                        "automated analysis is unavailable; the summary is a neutral template"
                            .to_string(),
                    );
                    analysis.summary.key_issues =
                        vec!["Automated analysis could not be completed".to_string()];
                }
                let warnings = std::mem::take(&mut analysis.metadata.warnings);
                (analysis, warnings)
            }
        };

        analysis.metadata = AnalysisMetadata {
            recovery_mode: Some(RecoveryMode::Degraded),
            available_stages: Some(names(succeeded)),
            missing_stages: Some(names(missing)),
            limitations: Some(limitations.clone()),
            quality_score: None,
            warnings,
        };
        debug!(run_id = %run.id, "degraded result synthesized");
        Synthesis {
            status: OverallStatus::Degraded { limitations },
            analysis: Some(analysis),
        }
    }

    /// First failed required stage, else the first failed stage at all.
    fn failure_cause(&self, missing: &[&StageResult]) -> FailureCause {
        let failed = |r: &&&StageResult| r.status == StageStatus::Failed && r.error.is_some();
        let chosen = missing
            .iter()
            .filter(failed)
            .find(|r| self.is_required(&r.stage))
            .or_else(|| missing.iter().find(failed));

        match chosen.and_then(|r| r.error.as_ref().map(|e| (r, e))) {
            Some((r, error)) => FailureCause::from_stage(&r.stage, error),
            None => FailureCause {
                kind: FailureKind::Permanent,
                stage: missing.first().map(|r| r.stage.clone()),
                message: "required stages did not succeed".to_string(),
            },
        }
    }
}

fn names(results: &[&StageResult]) -> Vec<String> {
    results.iter().map(|r| r.stage.clone()).collect()
}

fn stage_warnings(results: &[&StageResult]) -> Vec<String> {
    results
        .iter()
        .flat_map(|r| r.warnings.iter().map(move |w| format!("{}: {}", r.stage, w)))
        .collect()
}

fn describe_missing(result: &StageResult) -> String {
    match (result.status, &result.error, &result.skip_reason) {
        (StageStatus::Failed, Some(error), _) => match error.underlying {
            Some(underlying) => format!(
                "stage `{}` failed ({} after {})",
                result.stage, error.kind, underlying
            ),
            None => format!("stage `{}` failed ({})", result.stage, error.kind),
        },
        (StageStatus::Skipped, _, Some(reason)) => {
            format!("stage `{}` skipped: {}", result.stage, reason)
        }
        _ => format!("stage `{}` did not run", result.stage),
    }
}
