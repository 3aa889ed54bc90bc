//! End-to-end pipeline scenarios against scripted providers.
//!
//! Time-dependent scenarios run on a paused tokio clock so backoff and
//! timeouts advance instantly; breaker time comes from a `ManualClock`.

use std::sync::Arc;
use std::time::Duration;

use prism_core::provider::fakes::{canned_response, ManualClock, ScriptedProvider, ScriptedReply};
use prism_core::{
    AnalysisRequest, AnalysisService, BackoffPolicy, BreakerConfig, FailureKind, Orchestrator,
    OutputSchema, OverallStatus, PipelineRun, ProviderError, RecoveryMode, StageCatalog,
    StageDefinition, StageStatus,
};
use prism_core::domain::{INTERPRETATION, SCENE_EXTRACTION, SYNTHESIS};
use prism_state::fakes::{MemoryHealthStore, MemoryProgressSink};
use prism_state::BreakerState;

const T0: i64 = 1_700_000_000_000;

fn http(status: u16) -> ScriptedReply {
    ScriptedReply::err(ProviderError::Http {
        status,
        body: format!("status {status}"),
        retry_after_ms: None,
    })
}

fn orchestrator(provider: Arc<ScriptedProvider>) -> Orchestrator {
    Orchestrator::builder()
        .provider(provider)
        .backoff(BackoffPolicy::without_jitter(60_000))
        .build()
        .unwrap()
}

fn request() -> AnalysisRequest {
    AnalysisRequest::builder("img-checkout")
        .user_context("checkout page, mobile")
        .build()
        .unwrap()
}

fn stage_status(run: &PipelineRun, stage: &str) -> StageStatus {
    run.stage(stage).unwrap().status
}

// ===========================================================================
// Happy path
// ===========================================================================

#[tokio::test]
async fn test_all_stages_succeed_first_try() {
    let provider = Arc::new(ScriptedProvider::new());
    let run = orchestrator(Arc::clone(&provider))
        .run(request())
        .await
        .unwrap();

    assert_eq!(run.overall_status, OverallStatus::Completed);
    for result in &run.stage_results {
        assert_eq!(result.status, StageStatus::Succeeded);
        assert_eq!(result.attempt_count, 1);
        assert!(result.attempts.is_empty());
    }
    assert_eq!(provider.call_count(), 3);

    let analysis = run.analysis.as_ref().unwrap();
    assert_eq!(analysis.metadata.recovery_mode, Some(RecoveryMode::Full));
    assert_eq!(analysis.summary.overall_score, 74);
    assert_eq!(analysis.visual_annotations.len(), 2);
    assert_eq!(analysis.metadata.quality_score, Some(run.quality_score));
    assert!(run.quality_score >= 70);
    assert!(run.completed_at.is_some());
}

#[tokio::test]
async fn test_stages_receive_dependency_outputs_in_order() {
    let provider = Arc::new(ScriptedProvider::new());
    orchestrator(Arc::clone(&provider))
        .run(request())
        .await
        .unwrap();

    let calls = provider.calls();
    let stages: Vec<&str> = calls.iter().map(|c| c.stage.as_str()).collect();
    assert_eq!(stages, [SCENE_EXTRACTION, INTERPRETATION, SYNTHESIS]);
    assert_eq!(calls[0].provider, "vision");
    assert_eq!(calls[1].provider, "reasoning");
    assert!(calls[1].payload["previous"].get(SCENE_EXTRACTION).is_some());
    assert!(calls[2].payload["previous"].get(INTERPRETATION).is_some());
    assert_eq!(calls[0].payload["userContext"], "checkout page, mobile");
}

#[tokio::test]
async fn test_quality_score_is_deterministic() {
    let first = orchestrator(Arc::new(ScriptedProvider::new()))
        .run(request())
        .await
        .unwrap();
    let second = orchestrator(Arc::new(ScriptedProvider::new()))
        .run(request())
        .await
        .unwrap();
    assert_eq!(first.quality_score, second.quality_score);
    assert!(first.quality_score <= 100);
}

// ===========================================================================
// Retries
// ===========================================================================

#[tokio::test(start_paused = true)]
async fn test_transient_failure_then_success() {
    let provider = Arc::new(ScriptedProvider::new().on_stage(
        SCENE_EXTRACTION,
        [http(503), ScriptedReply::ok(canned_response(OutputSchema::Extraction))],
    ));
    let run = orchestrator(Arc::clone(&provider))
        .run(request())
        .await
        .unwrap();

    assert_eq!(run.overall_status, OverallStatus::Completed);
    let scene = run.stage(SCENE_EXTRACTION).unwrap();
    assert_eq!(scene.status, StageStatus::Succeeded);
    assert_eq!(scene.attempt_count, 2);
    assert_eq!(scene.attempts.len(), 1);
    assert_eq!(scene.attempts[0].kind, FailureKind::Transient);
    assert_eq!(scene.attempts[0].backoff_ms, Some(1_000));
    assert_eq!(run.total_retries(), 1);
    assert_eq!(provider.calls_for(SCENE_EXTRACTION), 2);
}

#[tokio::test]
async fn test_retried_run_scores_lower() {
    let clean = orchestrator(Arc::new(ScriptedProvider::new()))
        .run(request())
        .await
        .unwrap();

    let provider = Arc::new(ScriptedProvider::new().on_stage(
        SCENE_EXTRACTION,
        [
            http(502),
            http(502),
            ScriptedReply::ok(canned_response(OutputSchema::Extraction)),
        ],
    ));
    let retried = orchestrator(provider)
        .run(
            AnalysisRequest::builder("img-checkout")
                .user_context("checkout page, mobile")
                .retry_delay_ms(1)
                .build()
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(retried.overall_status, OverallStatus::Completed);
    assert!(retried.quality_score < clean.quality_score);
}

#[tokio::test(start_paused = true)]
async fn test_retry_budget_exhausted() {
    let provider = Arc::new(ScriptedProvider::new().on_stage(SCENE_EXTRACTION, [http(500)]));
    let request = AnalysisRequest::builder("img")
        .max_retry_attempts(2)
        .partial_recovery(false)
        .degraded_mode(false)
        .build()
        .unwrap();
    let run = orchestrator(Arc::clone(&provider))
        .run(request)
        .await
        .unwrap();

    let scene = run.stage(SCENE_EXTRACTION).unwrap();
    assert_eq!(scene.attempt_count, 3);
    let error = scene.error.as_ref().unwrap();
    assert_eq!(error.kind, FailureKind::ExhaustedRetries);
    assert_eq!(error.underlying, Some(FailureKind::Transient));
    assert_eq!(provider.call_count(), 3);

    // 1s, then 2s between attempts
    let delays: Vec<Option<u64>> = scene.attempts.iter().map(|a| a.backoff_ms).collect();
    assert_eq!(delays, [Some(1_000), Some(2_000), None]);

    let OverallStatus::Failed { cause } = &run.overall_status else {
        panic!("expected failed, got {:?}", run.overall_status);
    };
    assert_eq!(cause.kind, FailureKind::ExhaustedRetries);
    assert_eq!(cause.stage.as_deref(), Some(SCENE_EXTRACTION));
    assert_eq!(stage_status(&run, INTERPRETATION), StageStatus::Skipped);
    assert_eq!(stage_status(&run, SYNTHESIS), StageStatus::Skipped);
}

#[tokio::test(start_paused = true)]
async fn test_rate_limit_waits_at_least_retry_after() {
    let provider = Arc::new(ScriptedProvider::new().on_stage(
        SCENE_EXTRACTION,
        [
            ScriptedReply::err(ProviderError::Http {
                status: 429,
                body: "slow down".into(),
                retry_after_ms: Some(12_000),
            }),
            ScriptedReply::ok(canned_response(OutputSchema::Extraction)),
        ],
    ));
    let run = orchestrator(provider).run(request()).await.unwrap();

    let scene = run.stage(SCENE_EXTRACTION).unwrap();
    assert_eq!(scene.status, StageStatus::Succeeded);
    assert_eq!(scene.attempts[0].kind, FailureKind::RateLimited);
    assert_eq!(scene.attempts[0].backoff_ms, Some(12_000));
}

#[tokio::test(start_paused = true)]
async fn test_timeout_is_transient() {
    let provider = Arc::new(ScriptedProvider::new().on_stage(
        SCENE_EXTRACTION,
        [ScriptedReply::ok(canned_response(OutputSchema::Extraction)).delayed(600_000)],
    ));
    let request = AnalysisRequest::builder("img")
        .stages([SCENE_EXTRACTION])
        .max_retry_attempts(0)
        .build()
        .unwrap();
    let run = orchestrator(provider).run(request).await.unwrap();

    let scene = run.stage(SCENE_EXTRACTION).unwrap();
    assert_eq!(scene.status, StageStatus::Failed);
    assert_eq!(scene.attempts[0].kind, FailureKind::Transient);
    assert!(scene.attempts[0].message.contains("timed out"));
}

#[tokio::test]
async fn test_malformed_reply_retried_once() {
    let garbage = "I'm sorry, I cannot help with that image.";
    let provider = Arc::new(
        ScriptedProvider::new().on_stage(SCENE_EXTRACTION, [ScriptedReply::ok(garbage)]),
    );
    let request = AnalysisRequest::builder("img")
        .stages([SCENE_EXTRACTION])
        .retry_delay_ms(1)
        .degraded_mode(false)
        .build()
        .unwrap();
    let run = orchestrator(Arc::clone(&provider))
        .run(request)
        .await
        .unwrap();

    let scene = run.stage(SCENE_EXTRACTION).unwrap();
    assert_eq!(scene.attempt_count, 2);
    assert_eq!(provider.call_count(), 2);
    let error = scene.error.as_ref().unwrap();
    assert_eq!(error.kind, FailureKind::MalformedResponse);
    assert_eq!(scene.raw_response.as_deref(), Some(garbage));
}

#[tokio::test]
async fn test_auth_failure_is_not_retried() {
    let provider = Arc::new(ScriptedProvider::new().on_stage(SCENE_EXTRACTION, [http(401)]));
    let run = orchestrator(Arc::clone(&provider))
        .run(request())
        .await
        .unwrap();

    assert_eq!(provider.calls_for(SCENE_EXTRACTION), 1);
    let scene = run.stage(SCENE_EXTRACTION).unwrap();
    assert_eq!(scene.error.as_ref().unwrap().kind, FailureKind::AuthConfig);
}

// ===========================================================================
// Recovery
// ===========================================================================

#[tokio::test]
async fn test_late_stage_failure_is_partial() {
    let provider = Arc::new(ScriptedProvider::new().on_stage(SYNTHESIS, [http(400)]));
    let run = orchestrator(provider).run(request()).await.unwrap();

    assert_eq!(
        run.overall_status,
        OverallStatus::Partial {
            missing_stages: vec![SYNTHESIS.to_string()]
        }
    );
    let analysis = run.analysis.as_ref().unwrap();
    assert_eq!(analysis.metadata.recovery_mode, Some(RecoveryMode::Partial));
    assert_eq!(
        analysis.metadata.available_stages.as_deref(),
        Some(&[SCENE_EXTRACTION.to_string(), INTERPRETATION.to_string()][..])
    );
    assert_eq!(analysis.visual_annotations.len(), 2);
    assert_eq!(analysis.suggestions.len(), 1);
    // No stage produced a summary, so a neutral one stands in.
    assert_eq!(analysis.summary.overall_score, 50);
}

#[tokio::test]
async fn test_root_failure_without_cache_is_degraded() {
    let provider = Arc::new(ScriptedProvider::new().on_stage(SCENE_EXTRACTION, [http(401)]));
    let run = orchestrator(Arc::clone(&provider))
        .run(request())
        .await
        .unwrap();

    let OverallStatus::Degraded { limitations } = &run.overall_status else {
        panic!("expected degraded, got {:?}", run.overall_status);
    };
    assert!(limitations
        .iter()
        .any(|l| l.contains(SCENE_EXTRACTION) && l.contains("auth/config")));
    assert_eq!(provider.call_count(), 1);
    assert_eq!(stage_status(&run, INTERPRETATION), StageStatus::Skipped);

    let analysis = run.analysis.as_ref().unwrap();
    assert_eq!(analysis.metadata.recovery_mode, Some(RecoveryMode::Degraded));
    assert_eq!(analysis.summary.overall_score, 50);
    assert_eq!(
        analysis.summary.key_issues,
        ["Automated analysis could not be completed"]
    );
}

#[tokio::test]
async fn test_degraded_serves_last_known_good() {
    let provider = Arc::new(ScriptedProvider::new().on_stage(
        SCENE_EXTRACTION,
        [
            ScriptedReply::ok(canned_response(OutputSchema::Extraction)),
            http(403),
        ],
    ));
    let orchestrator = orchestrator(provider);

    let good = orchestrator.run(request()).await.unwrap();
    assert_eq!(good.overall_status, OverallStatus::Completed);

    let run = orchestrator.run(request()).await.unwrap();
    let OverallStatus::Degraded { limitations } = &run.overall_status else {
        panic!("expected degraded, got {:?}", run.overall_status);
    };
    assert!(limitations.iter().any(|l| l.contains("last known good")));
    let analysis = run.analysis.as_ref().unwrap();
    assert_eq!(analysis.summary.overall_score, 74);
    assert_eq!(analysis.metadata.recovery_mode, Some(RecoveryMode::Degraded));
}

#[tokio::test]
async fn test_no_recovery_fails_fast() {
    let provider = Arc::new(ScriptedProvider::new().on_stage(SCENE_EXTRACTION, [http(401)]));
    let request = AnalysisRequest::builder("img")
        .partial_recovery(false)
        .degraded_mode(false)
        .build()
        .unwrap();
    let run = orchestrator(Arc::clone(&provider))
        .run(request)
        .await
        .unwrap();

    let OverallStatus::Failed { cause } = &run.overall_status else {
        panic!("expected failed, got {:?}", run.overall_status);
    };
    assert_eq!(cause.kind, FailureKind::AuthConfig);
    assert!(run.analysis.is_none());
    assert_eq!(provider.call_count(), 1);
    assert!(run
        .stage(SYNTHESIS)
        .unwrap()
        .skip_reason
        .as_deref()
        .unwrap()
        .contains("aborted"));
}

// ===========================================================================
// Circuit breaker
// ===========================================================================

#[tokio::test]
async fn test_open_breaker_short_circuits_until_cooldown() {
    let clock = Arc::new(ManualClock::new(T0));
    let store = Arc::new(MemoryHealthStore::new());
    let provider = Arc::new(ScriptedProvider::new().on_stage(
        SCENE_EXTRACTION,
        [
            ScriptedReply::err(ProviderError::Connection("reset by peer".into())),
            ScriptedReply::err(ProviderError::Connection("reset by peer".into())),
            ScriptedReply::ok(canned_response(OutputSchema::Extraction)),
        ],
    ));
    let orchestrator = Orchestrator::builder()
        .provider(Arc::clone(&provider) as _)
        .health_store(store)
        .clock(Arc::clone(&clock) as _)
        .breaker_config(BreakerConfig {
            failure_threshold: 2,
            base_cooldown_ms: 10_000,
            ..BreakerConfig::default()
        })
        .build()
        .unwrap();
    let request = || {
        AnalysisRequest::builder("img")
            .stages([SCENE_EXTRACTION])
            .max_retry_attempts(0)
            .build()
            .unwrap()
    };

    orchestrator.run(request()).await.unwrap();
    orchestrator.run(request()).await.unwrap();
    assert_eq!(provider.call_count(), 2);
    assert!(orchestrator.breaker().is_open("vision").await);

    let rejected = orchestrator.run(request()).await.unwrap();
    assert_eq!(provider.call_count(), 2);
    let scene = rejected.stage(SCENE_EXTRACTION).unwrap();
    assert_eq!(scene.attempt_count, 0);
    assert_eq!(
        scene.error.as_ref().unwrap().kind,
        FailureKind::ProviderUnavailable
    );

    clock.advance(10_001);
    let recovered = orchestrator.run(request()).await.unwrap();
    assert_eq!(recovered.overall_status, OverallStatus::Completed);
    assert_eq!(provider.call_count(), 3);
    let health = orchestrator.breaker().snapshot("vision").await.unwrap();
    assert_eq!(health.state, BreakerState::Closed);
    assert_eq!(health.consecutive_failures, 0);
}

#[tokio::test]
async fn test_breakers_are_per_provider() {
    let clock = Arc::new(ManualClock::new(T0));
    let provider = Arc::new(ScriptedProvider::new().on_stage(SCENE_EXTRACTION, [http(503)]));
    let orchestrator = Orchestrator::builder()
        .provider(Arc::clone(&provider) as _)
        .clock(clock as _)
        .breaker_config(BreakerConfig {
            failure_threshold: 1,
            ..BreakerConfig::default()
        })
        .build()
        .unwrap();
    let request = AnalysisRequest::builder("img")
        .max_retry_attempts(0)
        .build()
        .unwrap();
    orchestrator.run(request).await.unwrap();

    assert!(orchestrator.breaker().is_open("vision").await);
    assert!(!orchestrator.breaker().is_open("reasoning").await);
}

// ===========================================================================
// Progress and cancellation
// ===========================================================================

#[tokio::test]
async fn test_progress_events_are_ordered() {
    let sink = Arc::new(MemoryProgressSink::new());
    let orchestrator = Orchestrator::builder()
        .provider(Arc::new(ScriptedProvider::new()))
        .progress_sink(Arc::clone(&sink) as _)
        .build()
        .unwrap();
    let run = orchestrator.run(request()).await.unwrap();

    let updates = sink.updates_for(run.id.as_str());
    assert!(updates.len() >= 7);
    let first = updates.first().unwrap();
    assert_eq!(first.status, "running");
    assert!(first.stage.is_none());
    let last = updates.last().unwrap();
    assert_eq!(last.status, "completed");
    assert_eq!(last.progress, 100);
    assert_eq!(last.metadata["qualityScore"], run.quality_score);

    assert!(updates.windows(2).all(|w| w[0].progress <= w[1].progress));

    for stage in [SCENE_EXTRACTION, INTERPRETATION, SYNTHESIS] {
        let labels: Vec<&str> = updates
            .iter()
            .filter(|u| u.stage.as_deref() == Some(stage))
            .map(|u| u.status.as_str())
            .collect();
        assert_eq!(labels.first(), Some(&"running"));
        assert_eq!(labels.last(), Some(&"succeeded"));
    }
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_backoff() {
    let provider = Arc::new(ScriptedProvider::new().on_stage(SCENE_EXTRACTION, [http(503)]));
    let service = AnalysisService::new(Arc::new(orchestrator(Arc::clone(&provider))));
    let request = AnalysisRequest::builder("img")
        .retry_delay_ms(5_000)
        .build()
        .unwrap();

    let id = service.submit_analysis(request).await.unwrap();
    assert!(provider.wait_for_calls(1, Duration::from_secs(1)).await);
    service.cancel_run(&id).await.unwrap();
    let run = service.wait_for_completion(&id).await.unwrap();

    let OverallStatus::Failed { cause } = &run.overall_status else {
        panic!("expected failed, got {:?}", run.overall_status);
    };
    assert_eq!(cause.kind, FailureKind::Cancelled);
    assert_eq!(provider.call_count(), 1);

    let scene = run.stage(SCENE_EXTRACTION).unwrap();
    assert_eq!(scene.error.as_ref().unwrap().kind, FailureKind::Cancelled);
    for stage in [INTERPRETATION, SYNTHESIS] {
        let result = run.stage(stage).unwrap();
        assert_eq!(result.status, StageStatus::Skipped);
    }

    // Status reads after the fact see the same terminal run.
    let status = service.get_run_status(&id).await.unwrap();
    assert_eq!(status.overall_status, run.overall_status);
}

#[tokio::test]
async fn test_service_runs_concurrently() {
    let service = AnalysisService::new(Arc::new(orchestrator(Arc::new(ScriptedProvider::new()))));
    let mut ids = Vec::new();
    for i in 0..4 {
        let request = AnalysisRequest::builder(format!("img-{i}")).build().unwrap();
        ids.push(service.submit_analysis(request).await.unwrap());
    }
    for id in &ids {
        let run = service.wait_for_completion(id).await.unwrap();
        assert_eq!(run.overall_status, OverallStatus::Completed);
        assert_eq!(&run.id, id);
    }
    assert_eq!(service.run_ids().await.len(), 4);
}

// ===========================================================================
// Independent stages
// ===========================================================================

fn independent(layout_required: bool) -> StageCatalog {
    let layout = StageDefinition::new("layout", "vision", OutputSchema::Extraction);
    let layout = if layout_required { layout } else { layout.optional() };
    [
        layout,
        StageDefinition::new("contrast", "reasoning", OutputSchema::Full),
    ]
    .into_iter()
    .collect()
}

fn independent_orchestrator(provider: Arc<ScriptedProvider>, catalog: StageCatalog) -> Orchestrator {
    Orchestrator::builder()
        .provider(provider)
        .catalog(catalog)
        .backoff(BackoffPolicy::without_jitter(60_000))
        .build()
        .unwrap()
}

fn independent_request() -> AnalysisRequest {
    AnalysisRequest::builder("img-landing")
        .stages(["layout", "contrast"])
        .build()
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_independent_stages_overlap() {
    let provider = Arc::new(
        ScriptedProvider::new()
            .on_stage("layout", [ScriptedReply::ok(canned_response(OutputSchema::Extraction)).delayed(1_000)])
            .on_stage("contrast", [ScriptedReply::ok(canned_response(OutputSchema::Full)).delayed(1_000)]),
    );
    let orchestrator = independent_orchestrator(Arc::clone(&provider), independent(true));

    let started = tokio::time::Instant::now();
    let run = orchestrator.run(independent_request()).await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(run.overall_status, OverallStatus::Completed);
    assert!(elapsed >= Duration::from_millis(1_000), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(1_500), "{elapsed:?}");
    assert_eq!(provider.call_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_sibling_keeps_running_after_failure() {
    let provider = Arc::new(
        ScriptedProvider::new()
            .on_stage("layout", [http(400)])
            .on_stage("contrast", [ScriptedReply::ok(canned_response(OutputSchema::Full)).delayed(1_000)]),
    );
    let orchestrator = independent_orchestrator(Arc::clone(&provider), independent(false));

    let started = tokio::time::Instant::now();
    let run = orchestrator.run(independent_request()).await.unwrap();

    assert!(started.elapsed() < Duration::from_millis(1_500));
    assert_eq!(stage_status(&run, "layout"), StageStatus::Failed);
    assert_eq!(stage_status(&run, "contrast"), StageStatus::Succeeded);
    assert_eq!(
        run.overall_status,
        OverallStatus::Partial {
            missing_stages: vec!["layout".to_string()]
        }
    );
    assert_eq!(provider.calls_for("layout"), 1);
}
