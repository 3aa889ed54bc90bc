//! Structured observability hooks for pipeline run lifecycle events.
//!
//! This module provides:
//! - Run-scoped tracing spans via `RunSpan`
//! - Emission functions for run start/finish, stage transitions and
//!   breaker transitions
//!
//! Events are emitted at `info!` level; filter with `RUST_LOG`.

use tracing::info;

use crate::domain::{OverallStatus, StageStatus};
use prism_state::BreakerState;

/// RAII guard that enters a run-scoped tracing span.
///
/// Holding an entered span across `.await` is not allowed, so async code
/// uses [`RunSpan::span`] with `tracing::Instrument` instead.
pub struct RunSpan {
    _span: tracing::span::EnteredSpan,
}

impl RunSpan {
    /// Create and enter a span tagged with the run_id.
    pub fn enter(run_id: &str) -> Self {
        Self {
            _span: Self::span(run_id).entered(),
        }
    }

    /// The `prism.run` span for a run, not entered.
    pub fn span(run_id: &str) -> tracing::Span {
        tracing::info_span!("prism.run", run_id = %run_id)
    }
}

/// Emit event: run started for an image.
pub fn emit_run_started(run_id: &str, image_ref: &str, stage_count: usize) {
    info!(
        event = "run.started",
        run_id = %run_id,
        image_ref = %image_ref,
        stages = stage_count,
    );
}

/// Emit event: a stage changed status.
pub fn emit_stage_transition(run_id: &str, stage: &str, status: StageStatus, attempt: u32) {
    info!(
        event = "stage.transition",
        run_id = %run_id,
        stage = %stage,
        status = %status,
        attempt = attempt,
    );
}

/// Emit event: a provider's breaker changed state.
pub fn emit_breaker_transition(provider: &str, from: BreakerState, to: BreakerState) {
    info!(
        event = "breaker.transition",
        provider = %provider,
        from = %from,
        to = %to,
    );
}

/// Emit event: run finished with its terminal status and quality score.
pub fn emit_run_finished(run_id: &str, status: &OverallStatus, quality_score: u8, duration_ms: u64) {
    info!(
        event = "run.finished",
        run_id = %run_id,
        status = %status.label(),
        quality_score = quality_score,
        duration_ms = duration_ms,
    );
}

/// Emit event: a side write (progress, cache) failed; the run continues.
pub fn emit_side_effect_error(run_id: &str, what: &str, error: &dyn std::fmt::Display) {
    tracing::warn!(event = "run.side_effect_error", run_id = %run_id, what = %what, error = %error);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_span_create() {
        let _span = RunSpan::enter("test-run-id");
    }

    #[test]
    fn test_emitters_do_not_panic() {
        emit_run_started("run-1", "img-1", 3);
        emit_stage_transition("run-1", "scene_extraction", StageStatus::Running, 1);
        emit_breaker_transition("vision", BreakerState::Closed, BreakerState::Open);
        emit_run_finished("run-1", &OverallStatus::Completed, 90, 12);
        emit_side_effect_error("run-1", "progress", &"store offline");
    }
}
