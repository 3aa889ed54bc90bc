//! Caller-facing analysis service.
//!
//! Each submitted request runs in its own task. The service keeps a watch
//! channel per run so status reads never block the run, and a cancellation
//! token so callers can stop it. Finished runs are kept for a retention
//! period and pruned on the next submit.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn, Instrument};

use crate::domain::{
    AnalysisMetadata, AnalysisRequest, FailureCause, FailureKind, OverallStatus, PipelineRun,
    PrismError, RecoveryMode, Result, RunId, Suggestion, Summary, VisualAnnotation,
};
use crate::obs::RunSpan;
use crate::orchestrator::Orchestrator;

/// How long a finished run stays queryable by default.
pub const DEFAULT_RUN_RETENTION: Duration = Duration::from_secs(60 * 60);

struct RunHandle {
    snapshots: watch::Receiver<PipelineRun>,
    cancel: CancellationToken,
}

/// Submits, tracks and cancels pipeline runs.
#[derive(Clone)]
pub struct AnalysisService {
    orchestrator: Arc<Orchestrator>,
    runs: Arc<RwLock<HashMap<RunId, RunHandle>>>,
    retention: Duration,
}

impl std::fmt::Debug for AnalysisService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnalysisService")
            .field("orchestrator", &self.orchestrator)
            .field("retention", &self.retention)
            .finish_non_exhaustive()
    }
}

impl AnalysisService {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self::with_retention(orchestrator, DEFAULT_RUN_RETENTION)
    }

    /// Keep finished runs for `retention` after they complete.
    pub fn with_retention(orchestrator: Arc<Orchestrator>, retention: Duration) -> Self {
        Self {
            orchestrator,
            runs: Arc::new(RwLock::new(HashMap::new())),
            retention,
        }
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    /// Validate a request and start running it in the background.
    ///
    /// Invalid requests and plans are rejected here, before a run exists.
    #[instrument(skip_all, fields(image_ref = %request.image_ref()))]
    pub async fn submit_analysis(&self, request: AnalysisRequest) -> Result<RunId> {
        let run_id = RunId::new();
        let initial = self.orchestrator.prepare(run_id.clone(), request.clone())?;
        let (tx, rx) = watch::channel(initial);
        let cancel = CancellationToken::new();

        {
            let mut runs = self.runs.write().await;
            self.prune_finished(&mut runs);
            runs.insert(
                run_id.clone(),
                RunHandle {
                    snapshots: rx,
                    cancel: cancel.clone(),
                },
            );
        }

        let orchestrator = Arc::clone(&self.orchestrator);
        let id = run_id.clone();
        let span = RunSpan::span(run_id.as_str());
        tokio::spawn(
            async move {
                match orchestrator.run_with(id.clone(), request, cancel, Some(&tx)).await {
                    Ok(run) => {
                        tx.send_replace(run);
                    }
                    Err(e) => {
                        warn!(run_id = %id, error = %e, "run ended with an internal error");
                        let mut run = tx.borrow().clone();
                        run.overall_status = OverallStatus::Failed {
                            cause: internal_cause(&e),
                        };
                        run.completed_at = Some(Utc::now());
                        tx.send_replace(run);
                    }
                }
            }
            .instrument(span),
        );

        info!(run_id = %run_id, "analysis submitted");
        Ok(run_id)
    }

    /// Latest snapshot of a run.
    pub async fn get_run_status(&self, run_id: &RunId) -> Result<PipelineRun> {
        let runs = self.runs.read().await;
        let handle = runs
            .get(run_id)
            .ok_or_else(|| PrismError::RunNotFound(run_id.clone()))?;
        let run = handle.snapshots.borrow().clone();
        Ok(run)
    }

    /// Request cancellation. Cancelling a finished run is a no-op.
    #[instrument(skip(self), fields(run_id = %run_id))]
    pub async fn cancel_run(&self, run_id: &RunId) -> Result<()> {
        let runs = self.runs.read().await;
        let handle = runs
            .get(run_id)
            .ok_or_else(|| PrismError::RunNotFound(run_id.clone()))?;
        handle.cancel.cancel();
        Ok(())
    }

    /// Wait until the run reaches a terminal status.
    pub async fn wait_for_completion(&self, run_id: &RunId) -> Result<PipelineRun> {
        let mut rx = {
            let runs = self.runs.read().await;
            runs.get(run_id)
                .ok_or_else(|| PrismError::RunNotFound(run_id.clone()))?
                .snapshots
                .clone()
        };
        let run = rx
            .wait_for(PipelineRun::is_terminal)
            .await
            .map_err(|_| PrismError::RunInterrupted(run_id.clone()))?
            .clone();
        Ok(run)
    }

    /// Drop a finished run. Returns `false` for unknown or still-running
    /// runs, which are left in place.
    pub async fn forget_run(&self, run_id: &RunId) -> bool {
        let mut runs = self.runs.write().await;
        let finished = runs
            .get(run_id)
            .is_some_and(|h| h.snapshots.borrow().is_terminal());
        if finished {
            runs.remove(run_id);
        }
        finished
    }

    fn prune_finished(&self, runs: &mut HashMap<RunId, RunHandle>) {
        let now = Utc::now();
        let before = runs.len();
        runs.retain(|_, handle| {
            let run = handle.snapshots.borrow();
            match run.completed_at {
                Some(done) if run.is_terminal() => now
                    .signed_duration_since(done)
                    .to_std()
                    .map_or(true, |age| age < self.retention),
                _ => true,
            }
        });
        let pruned = before - runs.len();
        if pruned > 0 {
            debug!(pruned, "pruned finished runs past retention");
        }
    }

    /// Ids of every run this service knows about.
    pub async fn run_ids(&self) -> Vec<RunId> {
        let mut ids: Vec<RunId> = self.runs.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}

fn internal_cause(error: &PrismError) -> FailureCause {
    let kind = match error {
        PrismError::InvalidRequest(_) | PrismError::InvalidPlan(_) => FailureKind::InvalidRequest,
        _ => FailureKind::Permanent,
    };
    FailureCause {
        kind,
        stage: None,
        message: error.to_string(),
    }
}

/// Completion event body delivered to callers when a run produced an
/// analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionPayload {
    pub id: RunId,
    pub mode: RecoveryMode,
    pub visual_annotations: Vec<VisualAnnotation>,
    pub suggestions: Vec<Suggestion>,
    pub summary: Summary,
    pub metadata: AnalysisMetadata,
}

impl CompletionPayload {
    /// `None` while the run is running, or when it failed.
    pub fn from_run(run: &PipelineRun) -> Option<Self> {
        let mode = run.overall_status.mode()?;
        let analysis = run.analysis.as_ref()?;
        let mut metadata = analysis.metadata.clone();
        metadata.recovery_mode = Some(mode);
        metadata.quality_score = Some(run.quality_score);

        Some(Self {
            id: run.id.clone(),
            mode,
            visual_annotations: analysis.visual_annotations.clone(),
            suggestions: analysis.suggestions.clone(),
            summary: analysis.summary.clone(),
            metadata,
        })
    }
}
