//! Progress reporting for one run: progress-sink updates and watch
//! snapshots, emitted sequentially from the run task.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;

use crate::domain::{PipelineRun, StageResult};
use crate::obs::emit_side_effect_error;
use prism_state::{ProgressSink, ProgressUpdate};

pub(crate) struct Reporter<'a> {
    sink: Arc<dyn ProgressSink>,
    snapshots: Option<&'a watch::Sender<PipelineRun>>,
}

impl<'a> Reporter<'a> {
    pub(crate) fn new(
        sink: Arc<dyn ProgressSink>,
        snapshots: Option<&'a watch::Sender<PipelineRun>>,
    ) -> Self {
        Self { sink, snapshots }
    }

    /// Report a stage-level event.
    pub(crate) async fn stage(&self, run: &PipelineRun, result: &StageResult, label: &str, message: String) {
        let metadata = serde_json::json!({
            "provider": result.provider,
            "attempt": result.attempt_count,
            "qualityScore": run.quality_score,
            "error": result.error,
        });
        self.publish(run, Some(result.stage.clone()), label, message, metadata)
            .await;
    }

    /// Report a run-level event.
    pub(crate) async fn run(&self, run: &PipelineRun, label: &str, message: String) {
        let metadata = serde_json::json!({
            "qualityScore": run.quality_score,
            "retries": run.total_retries(),
        });
        self.publish(run, None, label, message, metadata).await;
    }

    async fn publish(
        &self,
        run: &PipelineRun,
        stage: Option<String>,
        label: &str,
        message: String,
        metadata: serde_json::Value,
    ) {
        let update = ProgressUpdate {
            run_id: run.id.to_string(),
            stage,
            status: label.to_string(),
            progress: run.progress_percent(),
            message,
            metadata,
            emitted_at: Utc::now(),
        };
        if let Err(e) = self.sink.publish(update).await {
            emit_side_effect_error(run.id.as_str(), "progress", &e);
        }
        if let Some(tx) = self.snapshots {
            tx.send_replace(run.clone());
        }
    }
}
