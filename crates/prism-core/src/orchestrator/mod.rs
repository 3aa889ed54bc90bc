//! Stage orchestrator.
//!
//! Drives one [`AnalysisRequest`] to a terminal [`PipelineRun`]:
//! - stages run in dependency order; independent ready stages are polled
//!   concurrently inside the run's task
//! - each attempt asks the breaker first, calls the provider under the
//!   stage timeout, normalizes the reply, and classifies any failure
//! - retryable failures back off and retry until the request's budget runs out
//! - after a stage fails, the recovery synthesizer decides whether the run
//!   continues; at the end it picks the terminal status
//!
//! Stage tasks own their [`StageResult`] and send copies back over a channel;
//! only the driver loop mutates the run, so progress events come out in order.

mod backoff;
mod plan;
mod progress;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

pub use backoff::BackoffPolicy;
pub use plan::ExecutionPlan;

use crate::breaker::{Admission, BreakerConfig, CircuitBreakerRegistry, Clock, SystemClock};
use crate::classify::{BreakerEffect, ClassifierConfig, ErrorClassifier};
use crate::config::PipelineConfig;
use crate::domain::{
    AnalysisRequest, AttemptRecord, FailureCause, FailureKind, OverallStatus, PipelineRun,
    PrismError, RequestOptions, Result, RunId, StageCatalog, StageDefinition, StageFailure,
    StageResult, StageStatus,
};
use crate::metrics::METRICS;
use crate::normalize::Normalizer;
use crate::obs::{emit_run_finished, emit_run_started, emit_side_effect_error, emit_stage_transition};
use crate::provider::{AttemptError, ProviderClient, ProviderError, ResponseMeta};
use crate::quality::{self, QualityWeights};
use crate::recovery::{RecoveryConfig, RecoveryDecision, RecoverySynthesizer};
use prism_state::fakes::{MemoryAnalysisCache, MemoryHealthStore, NoopProgressSink};
use prism_state::{AnalysisCache, HealthStore, ProgressSink};
use progress::Reporter;

/// Runs analysis requests through the configured stages.
pub struct Orchestrator {
    provider: Arc<dyn ProviderClient>,
    breaker: CircuitBreakerRegistry,
    progress: Arc<dyn ProgressSink>,
    cache: Arc<dyn AnalysisCache>,
    catalog: Arc<StageCatalog>,
    normalizer: Normalizer,
    classifier: ErrorClassifier,
    backoff: BackoffPolicy,
    weights: QualityWeights,
    recovery: RecoverySynthesizer,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("catalog", &self.catalog)
            .field("breaker", &self.breaker)
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

/// Builder for [`Orchestrator`]. Only the provider client is mandatory.
#[derive(Default)]
pub struct OrchestratorBuilder {
    provider: Option<Arc<dyn ProviderClient>>,
    health_store: Option<Arc<dyn HealthStore>>,
    clock: Option<Arc<dyn Clock>>,
    breaker_config: BreakerConfig,
    progress: Option<Arc<dyn ProgressSink>>,
    cache: Option<Arc<dyn AnalysisCache>>,
    catalog: Option<StageCatalog>,
    normalizer: Normalizer,
    classifier_config: ClassifierConfig,
    backoff: BackoffPolicy,
    weights: QualityWeights,
    recovery_config: RecoveryConfig,
}

impl OrchestratorBuilder {
    pub fn provider(mut self, provider: Arc<dyn ProviderClient>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Shared breaker state. Defaults to a process-local store.
    pub fn health_store(mut self, store: Arc<dyn HealthStore>) -> Self {
        self.health_store = Some(store);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn breaker_config(mut self, config: BreakerConfig) -> Self {
        self.breaker_config = config;
        self
    }

    pub fn progress_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.progress = Some(sink);
        self
    }

    pub fn cache(mut self, cache: Arc<dyn AnalysisCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn catalog(mut self, catalog: StageCatalog) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn normalizer(mut self, normalizer: Normalizer) -> Self {
        self.normalizer = normalizer;
        self
    }

    pub fn classifier_config(mut self, config: ClassifierConfig) -> Self {
        self.classifier_config = config;
        self
    }

    pub fn backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn quality_weights(mut self, weights: QualityWeights) -> Self {
        self.weights = weights;
        self
    }

    pub fn recovery_config(mut self, config: RecoveryConfig) -> Self {
        self.recovery_config = config;
        self
    }

    /// Take stages and tuning from a loaded configuration.
    pub fn config(self, config: &PipelineConfig) -> Self {
        self.catalog(config.catalog())
            .breaker_config(config.breaker.clone())
            .classifier_config(config.classifier.clone())
            .backoff(config.backoff.clone())
            .quality_weights(config.quality.clone())
            .recovery_config(config.recovery.clone())
    }

    pub fn build(self) -> Result<Orchestrator> {
        let provider = self
            .provider
            .ok_or_else(|| PrismError::Config("a provider client is required".to_string()))?;
        let catalog = Arc::new(self.catalog.unwrap_or_else(StageCatalog::standard));
        let breaker = CircuitBreakerRegistry::new(
            self.health_store
                .unwrap_or_else(|| Arc::new(MemoryHealthStore::new())),
            self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            self.breaker_config,
        );

        Ok(Orchestrator {
            provider,
            breaker,
            progress: self.progress.unwrap_or_else(|| Arc::new(NoopProgressSink)),
            cache: self
                .cache
                .unwrap_or_else(|| Arc::new(MemoryAnalysisCache::new())),
            recovery: RecoverySynthesizer::new(Arc::clone(&catalog), self.recovery_config),
            catalog,
            normalizer: self.normalizer,
            classifier: ErrorClassifier::new(&self.classifier_config)?,
            backoff: self.backoff,
            weights: self.weights,
        })
    }
}

impl Orchestrator {
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::default()
    }

    pub fn catalog(&self) -> &StageCatalog {
        &self.catalog
    }

    pub fn breaker(&self) -> &CircuitBreakerRegistry {
        &self.breaker
    }

    /// Validate a request against the catalog and create its pending run.
    pub fn prepare(&self, run_id: RunId, request: AnalysisRequest) -> Result<PipelineRun> {
        ExecutionPlan::build(&request, &self.catalog)?;
        PipelineRun::new(run_id, request, &self.catalog)
    }

    /// Run a request to completion with a fresh id and no cancellation.
    pub async fn run(&self, request: AnalysisRequest) -> Result<PipelineRun> {
        self.run_with(RunId::new(), request, CancellationToken::new(), None)
            .await
    }

    /// Run a request to completion.
    ///
    /// Every transition is published to the progress sink and, when given,
    /// as a snapshot on `snapshots`. Cancelling `cancel` stops scheduling,
    /// drops in-flight calls and backoff waits, and ends the run
    /// `failed` with a `cancelled` cause.
    #[instrument(skip_all, fields(run_id = %run_id, image_ref = %request.image_ref()))]
    pub async fn run_with(
        &self,
        run_id: RunId,
        request: AnalysisRequest,
        cancel: CancellationToken,
        snapshots: Option<&watch::Sender<PipelineRun>>,
    ) -> Result<PipelineRun> {
        let plan = ExecutionPlan::build(&request, &self.catalog)?;
        let mut run = PipelineRun::new(run_id, request, &self.catalog)?;
        let reporter = Reporter::new(Arc::clone(&self.progress), snapshots);
        let options = run.request.options().clone();

        emit_run_started(run.id.as_str(), run.request.image_ref(), plan.len());
        reporter
            .run(
                &run,
                "running",
                format!("analysis started with {} stages", plan.len()),
            )
            .await;

        let (updates_tx, mut updates_rx) = mpsc::unbounded_channel::<StageResult>();
        let mut in_flight = FuturesUnordered::new();
        let mut abort_reason: Option<String> = None;

        loop {
            if abort_reason.is_none() && !cancel.is_cancelled() {
                for def in plan.stages() {
                    if run.stage(&def.name).map(|r| r.status) != Some(StageStatus::Pending) {
                        continue;
                    }
                    let deps = plan.deps(&def.name);
                    let deps_done = deps
                        .iter()
                        .all(|d| run.stage(d).map(StageResult::is_terminal).unwrap_or(true));
                    if !deps_done {
                        continue;
                    }

                    let failed_dep = deps.iter().find(|d| {
                        run.stage(d)
                            .map(|r| r.status != StageStatus::Succeeded)
                            .unwrap_or(false)
                    });
                    if let Some(dep) = failed_dep {
                        let reason = format!("dependency `{dep}` did not succeed");
                        self.skip_stage(&mut run, &reporter, &def.name, reason)
                            .await?;
                        continue;
                    }

                    let payload = stage_payload(&run, def, deps);
                    let started = {
                        let stage = stage_mut(&mut run, &def.name)?;
                        stage.start()?;
                        stage.clone()
                    };
                    self.rescore(&mut run);
                    emit_stage_transition(run.id.as_str(), &def.name, StageStatus::Running, 0);
                    reporter
                        .stage(&run, &started, "running", format!("stage `{}` started", def.name))
                        .await;

                    in_flight.push(self.execute_stage(
                        def,
                        started,
                        payload,
                        &options,
                        &cancel,
                        updates_tx.clone(),
                    ));
                }
            }

            if in_flight.is_empty() {
                break;
            }

            tokio::select! {
                biased;
                Some(update) = updates_rx.recv() => {
                    self.apply_update(&mut run, &reporter, update).await;
                }
                Some(done) = in_flight.next() => {
                    while let Ok(update) = updates_rx.try_recv() {
                        self.apply_update(&mut run, &reporter, update).await;
                    }
                    let finished = done?;
                    if let Some(reason) = self.finish_stage(&mut run, &reporter, finished).await? {
                        abort_reason.get_or_insert(reason);
                    }
                }
                else => break,
            }
        }

        self.finalize(run, &reporter, &cancel, abort_reason).await
    }

    fn rescore(&self, run: &mut PipelineRun) {
        run.quality_score = quality::score(&self.weights, &run.stage_results, run.analysis.as_ref());
    }

    async fn skip_stage(
        &self,
        run: &mut PipelineRun,
        reporter: &Reporter<'_>,
        stage: &str,
        reason: String,
    ) -> Result<()> {
        let skipped = {
            let result = stage_mut(run, stage)?;
            result.skip(reason.clone())?;
            result.clone()
        };
        self.rescore(run);
        emit_stage_transition(run.id.as_str(), stage, StageStatus::Skipped, skipped.attempt_count);
        reporter.stage(run, &skipped, "skipped", reason).await;
        Ok(())
    }

    /// Mid-flight copy of a running stage (attempt started or retry scheduled).
    async fn apply_update(&self, run: &mut PipelineRun, reporter: &Reporter<'_>, update: StageResult) {
        let Some(current) = run.stage_mut(&update.stage) else {
            return;
        };
        if current.is_terminal() {
            return;
        }
        *current = update.clone();
        self.rescore(run);

        let (label, message) = match update.attempts.last() {
            Some(last) if last.attempt == update.attempt_count && last.backoff_ms.is_some() => (
                "retrying",
                format!(
                    "attempt {} of stage `{}` failed ({}); retrying in {}ms",
                    last.attempt,
                    update.stage,
                    last.kind,
                    last.backoff_ms.unwrap_or_default()
                ),
            ),
            _ => (
                "running",
                format!("stage `{}` attempt {}", update.stage, update.attempt_count),
            ),
        };
        debug!(stage = %update.stage, attempt = update.attempt_count, label, "stage update");
        reporter.stage(run, &update, label, message).await;
    }

    /// Record a terminal stage. Returns an abort reason when the run should
    /// stop scheduling.
    async fn finish_stage(
        &self,
        run: &mut PipelineRun,
        reporter: &Reporter<'_>,
        finished: StageResult,
    ) -> Result<Option<String>> {
        let name = finished.stage.clone();
        *stage_mut(run, &name)? = finished.clone();
        self.rescore(run);
        emit_stage_transition(run.id.as_str(), &name, finished.status, finished.attempt_count);

        let message = match &finished.error {
            Some(error) => format!("stage `{name}` failed: {} ({})", error.message, error.kind),
            None => format!(
                "stage `{name}` {} after {} attempt(s)",
                finished.status, finished.attempt_count
            ),
        };
        reporter
            .stage(run, &finished, finished.status.as_str(), message)
            .await;

        if finished.status != StageStatus::Failed {
            return Ok(None);
        }
        match self.recovery.decide_after_failure(run, &finished) {
            RecoveryDecision::Continue => Ok(None),
            RecoveryDecision::Abort => Ok(Some(format!("run aborted after stage `{name}` failed"))),
        }
    }

    async fn finalize(
        &self,
        mut run: PipelineRun,
        reporter: &Reporter<'_>,
        cancel: &CancellationToken,
        abort_reason: Option<String>,
    ) -> Result<PipelineRun> {
        let cancelled = cancel.is_cancelled();
        let reason = if cancelled {
            "run was cancelled".to_string()
        } else {
            abort_reason.unwrap_or_else(|| "run ended before the stage was scheduled".to_string())
        };
        for pending in run.stages_with(StageStatus::Pending) {
            self.skip_stage(&mut run, reporter, &pending, reason.clone())
                .await?;
        }

        let (status, analysis) = if cancelled {
            let cause = FailureCause::cancelled();
            (OverallStatus::Failed { cause }, None)
        } else {
            let synthesis = self.recovery.synthesize(&run, self.cache.as_ref()).await;
            (synthesis.status, synthesis.analysis)
        };

        run.analysis = analysis;
        self.rescore(&mut run);
        let score = run.quality_score;
        if let Some(analysis) = run.analysis.as_mut() {
            analysis.metadata.quality_score = Some(score);
        }
        run.overall_status = status;
        run.completed_at = Some(Utc::now());

        if run.overall_status == OverallStatus::Completed {
            self.remember(&run).await;
        }

        METRICS.inc_run_finished(run.overall_status.mode());
        emit_run_finished(
            run.id.as_str(),
            &run.overall_status,
            run.quality_score,
            run.duration_ms(),
        );
        let label = run.overall_status.label();
        reporter.run(&run, label, finish_message(&run.overall_status)).await;
        METRICS.flush();
        Ok(run)
    }

    /// Store a completed analysis as the image's last known good result.
    async fn remember(&self, run: &PipelineRun) {
        let Some(analysis) = &run.analysis else {
            return;
        };
        let result = match serde_json::to_value(analysis) {
            Ok(value) => self
                .cache
                .put_last_known_good(run.request.image_ref(), value)
                .await
                .map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        if let Err(e) = result {
            emit_side_effect_error(run.id.as_str(), "cache", &e);
        }
    }

    /// Attempt loop for one stage. Returns the stage in a terminal status.
    async fn execute_stage(
        &self,
        def: &StageDefinition,
        mut result: StageResult,
        payload: serde_json::Value,
        options: &RequestOptions,
        cancel: &CancellationToken,
        updates: mpsc::UnboundedSender<StageResult>,
    ) -> Result<StageResult> {
        let provider = def.provider.as_str();
        let mut prior_malformed = 0u32;

        loop {
            if cancel.is_cancelled() {
                result.fail(StageFailure::cancelled(), None)?;
                return Ok(result);
            }

            let permit = match self.breaker.try_acquire(provider).await {
                Admission::Granted(permit) => permit,
                Admission::Rejected { retry_in_ms } => {
                    METRICS.inc_breaker_rejections();
                    let failure = StageFailure::new(
                        FailureKind::ProviderUnavailable,
                        format!("circuit open for provider `{provider}`; retry in {retry_in_ms}ms"),
                    );
                    result.fail(failure, None)?;
                    return Ok(result);
                }
            };

            let attempt = result.begin_attempt()?;
            let _ = updates.send(result.clone());
            METRICS.inc_provider_calls();

            let call = tokio::time::timeout(
                Duration::from_millis(def.timeout_ms),
                self.provider
                    .call(&def.name, provider, &payload, def.timeout_ms),
            );
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                outcome = call => Some(outcome),
            };
            let Some(outcome) = outcome else {
                self.breaker
                    .record_outcome(provider, permit, BreakerEffect::Neutral)
                    .await;
                result.fail(StageFailure::cancelled(), None)?;
                return Ok(result);
            };

            let mut raw = None;
            let error = match outcome {
                Err(_elapsed) => AttemptError::Provider(ProviderError::Timeout {
                    timeout_ms: def.timeout_ms,
                }),
                Ok(Err(e)) => AttemptError::Provider(e),
                Ok(Ok(text)) => {
                    let normalized = self.normalizer.normalize(&text, def.schema);
                    let reason = (!normalized.ok).then(|| normalized.failure_reason());
                    match (normalized.data, reason) {
                        (Some(data), None) => {
                            self.breaker
                                .record_outcome(provider, permit, BreakerEffect::Healthy)
                                .await;
                            result.succeed(text, data, normalized.warnings)?;
                            return Ok(result);
                        }
                        (_, reason) => {
                            raw = Some(text);
                            AttemptError::Malformed {
                                reason: reason
                                    .unwrap_or_else(|| "normalizer returned no data".to_string()),
                            }
                        }
                    }
                }
            };

            let meta = ResponseMeta {
                attempt,
                prior_malformed_attempts: prior_malformed,
            };
            let class = self.classifier.classify(&error, &meta);
            self.breaker
                .record_outcome(provider, permit, class.breaker_effect())
                .await;
            if class.kind == FailureKind::MalformedResponse {
                prior_malformed += 1;
            }

            let message = error.to_string();
            if !class.retryable || attempt > options.max_retry_attempts {
                result.record_attempt(AttemptRecord {
                    attempt,
                    kind: class.kind,
                    message: message.clone(),
                    backoff_ms: None,
                })?;
                let failure = if class.retryable {
                    StageFailure::exhausted(
                        class.kind,
                        format!("{message} (gave up after {attempt} attempts)"),
                    )
                } else {
                    StageFailure::new(class.kind, message)
                };
                result.fail(failure, raw)?;
                return Ok(result);
            }

            let delay = self
                .backoff
                .delay(options.retry_delay_ms, attempt, class.backoff_floor_ms);
            result.record_attempt(AttemptRecord {
                attempt,
                kind: class.kind,
                message,
                backoff_ms: Some(delay.as_millis() as u64),
            })?;
            METRICS.inc_retries();
            debug!(stage = %def.name, attempt, kind = %class.kind, delay_ms = delay.as_millis() as u64, "retrying stage");
            let _ = updates.send(result.clone());

            let slept = tokio::select! {
                biased;
                _ = cancel.cancelled() => false,
                _ = tokio::time::sleep(delay) => true,
            };
            if !slept {
                result.fail(StageFailure::cancelled(), raw)?;
                return Ok(result);
            }
        }
    }
}

fn stage_mut<'a>(run: &'a mut PipelineRun, stage: &str) -> Result<&'a mut StageResult> {
    run.stage_mut(stage)
        .ok_or_else(|| PrismError::InvalidPlan(format!("stage `{stage}` is not part of the run")))
}

/// What a provider receives for one stage: the request plus the outputs of
/// the stage's succeeded dependencies.
fn stage_payload(run: &PipelineRun, def: &StageDefinition, deps: &[String]) -> serde_json::Value {
    let previous: serde_json::Map<String, serde_json::Value> = deps
        .iter()
        .filter_map(|dep| {
            let output = run.stage(dep)?.normalized_output.as_ref()?;
            Some((dep.clone(), serde_json::to_value(output).unwrap_or_default()))
        })
        .collect();

    serde_json::json!({
        "stage": def.name,
        "imageRef": run.request.image_ref(),
        "userContext": run.request.user_context(),
        "priority": run.request.priority(),
        "schema": def.schema,
        "expectedSections": def.schema.expected_sections(),
        "previous": previous,
    })
}

fn finish_message(status: &OverallStatus) -> String {
    match status {
        OverallStatus::Running => "analysis running".to_string(),
        OverallStatus::Completed => "analysis completed".to_string(),
        OverallStatus::Partial { missing_stages } => {
            format!("partial analysis; missing: {}", missing_stages.join(", "))
        }
        OverallStatus::Degraded { limitations } => {
            format!("degraded analysis: {}", limitations.join("; "))
        }
        OverallStatus::Failed { cause } => format!("analysis failed: {cause}"),
    }
}
