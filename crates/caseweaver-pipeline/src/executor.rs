//! Stage executor: drives one stage through the retry controller.
//!
//! The executor interprets the effects emitted by [`crate::machine`]: it
//! builds prompts, calls the generation backend under a timeout, runs the
//! parse/normalize/validate path, and feeds the results back into the
//! machine as events. Every backend call is charged to the ledger and
//! recorded in the artifact store whether or not it succeeds.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};

use caseweaver_gen::{parse_candidate, DynBackend, GenerationRequest, GenerationResponse, Parsed};
use caseweaver_schema::{
    normalize, validate, DeclaredTargets, NormalizeOptions, PlaceholderPolicy, SchemaRegistry,
    CLUES_SCHEMA,
};
use caseweaver_types::{
    variation_seed, variation_tag, AttemptCharge, Artifact, CostLedger, Result, RevisionRecord,
    ValidationError, ValidationResult, WeaverError,
};

use crate::clue_rules;
use crate::events::{EventEmitter, PipelineEvent};
use crate::machine::{self, AttemptEvent, AttemptState, Effect, StageLimits};
use crate::prompt;
use crate::revision::{describe_fixes, ErrorReport};
use crate::stage::StageDefinition;
use crate::store::{ArtifactStore, StoredAttempt};

/// Delay policy between transient backend retries.
#[derive(Debug, Clone)]
pub enum BackoffPolicy {
    Fixed(Duration),
    /// base * 2^attempt, capped at max.
    Exponential { base: Duration, max: Duration },
    None,
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        match self {
            BackoffPolicy::Fixed(d) => *d,
            BackoffPolicy::Exponential { base, max } => {
                let millis = base.as_millis() as u64 * 2u64.saturating_pow(attempt as u32);
                Duration::from_millis(millis).min(*max)
            }
            BackoffPolicy::None => Duration::ZERO,
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::Exponential {
            base: Duration::from_millis(500),
            max: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    pub request_timeout: Duration,
    pub max_output_tokens: u32,
    pub transient_retries: usize,
    pub backoff: BackoffPolicy,
    pub placeholder_policy: PlaceholderPolicy,
    /// Sampled errors per category in retry/revision reports.
    pub error_sample_cap: usize,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(60),
            max_output_tokens: 4_096,
            transient_retries: 2,
            backoff: BackoffPolicy::default(),
            placeholder_policy: PlaceholderPolicy::default(),
            error_sample_cap: 3,
        }
    }
}

/// Per-stage invocation context. Artifacts are passed as payload values;
/// upstream content is never mutated here.
#[derive(Debug, Clone)]
pub struct StageRun {
    pub run_id: String,
    pub project_id: String,
    pub domain: Value,
    pub upstream: BTreeMap<String, Value>,
    pub targets: DeclaredTargets,
    /// Attempt numbering continues from here, so audit-driven
    /// regenerations keep appending versions instead of restarting at 1.
    pub attempt_offset: u32,
    /// Extra prompt requirements (audit feedback, repair guardrails).
    pub guidance: Vec<String>,
}

impl StageRun {
    pub fn new(run_id: impl Into<String>, project_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            project_id: project_id.into(),
            domain: Value::Null,
            upstream: BTreeMap::new(),
            targets: DeclaredTargets::new(),
            attempt_offset: 0,
            guidance: Vec::new(),
        }
    }
}

/// Outcome of a successfully accepted stage.
#[derive(Debug, Clone)]
pub struct StageResult {
    pub artifact: Artifact,
    pub validation: ValidationResult,
    pub revisions: Vec<RevisionRecord>,
    pub backend_attempts: u32,
}

#[derive(Clone)]
pub struct StageExecutor {
    backend: DynBackend,
    registry: Arc<SchemaRegistry>,
    ledger: CostLedger,
    store: ArtifactStore,
    emitter: EventEmitter,
    options: ExecutorOptions,
}

impl StageExecutor {
    pub fn new(
        backend: DynBackend,
        registry: Arc<SchemaRegistry>,
        ledger: CostLedger,
        store: ArtifactStore,
        emitter: EventEmitter,
        options: ExecutorOptions,
    ) -> Self {
        Self {
            backend,
            registry,
            ledger,
            store,
            emitter,
            options,
        }
    }

    pub fn ledger(&self) -> &CostLedger {
        &self.ledger
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    /// Drive one stage to acceptance or a fatal failure.
    pub async fn run_stage(
        &self,
        stage: &StageDefinition,
        limits: StageLimits,
        temperature: f32,
        run: &StageRun,
    ) -> Result<StageResult> {
        let schema_id = stage.schema_id().ok_or_else(|| {
            WeaverError::InvalidPlan(format!("stage '{}' has no generation schema", stage.name))
        })?;
        let schema = self
            .registry
            .get(schema_id)
            .ok_or_else(|| WeaverError::SchemaUnknown {
                schema_id: schema_id.to_string(),
            })?;

        let mut driver = Driver {
            raw_text: None,
            candidate: None,
            last_errors: Vec::new(),
            revision_baseline: None,
            revisions: Vec::new(),
            in_revision: false,
            regressed: None,
            backend_attempts: 0,
            total_cost: 0.0,
            total_latency_ms: 0,
            failure: None,
            last_validation: None,
            accepted: None,
        };

        let (mut state, effects) = machine::step(&limits, AttemptState::Pending, AttemptEvent::Start);
        let mut queue: VecDeque<Effect> = effects.into();

        while let Some(effect) = queue.pop_front() {
            let event = match effect {
                Effect::Generate { .. } => {
                    let report = (!driver.last_errors.is_empty())
                        .then(|| ErrorReport::build(&driver.last_errors, self.options.error_sample_cap));
                    let text = prompt::generation_prompt(
                        stage,
                        schema,
                        &run.domain,
                        &run.upstream,
                        &variation_tag(variation_seed(
                            &run.run_id,
                            &stage.name,
                            run.attempt_offset + driver.backend_attempts + 1,
                        )),
                        &run.guidance,
                        report.as_ref(),
                    );
                    self.attempt_call(stage, schema_id, temperature, run, &mut driver, text)
                        .await
                }
                Effect::Revise { .. } => {
                    driver.in_revision = true;
                    driver.revision_baseline = (!driver.last_errors.is_empty())
                        .then(|| driver.last_errors.clone());
                    let report =
                        ErrorReport::build(&driver.last_errors, self.options.error_sample_cap);
                    let text =
                        prompt::revision_prompt(stage, schema, driver.candidate.as_ref(), &report);
                    self.attempt_call(stage, schema_id, temperature, run, &mut driver, text)
                        .await
                }
                Effect::Parse => {
                    let text = driver.raw_text.take().unwrap_or_default();
                    match parse_candidate(&text) {
                        Parsed::Record {
                            mut value,
                            route,
                            commented_lines,
                        } => {
                            if schema_id == CLUES_SCHEMA {
                                let set = clue_rules::annotate_categories(&mut value);
                                if set > 0 {
                                    tracing::debug!(
                                        stage = %stage.name,
                                        inferred = set,
                                        "clue categories inferred from descriptions"
                                    );
                                }
                            }
                            tracing::debug!(
                                stage = %stage.name,
                                route = ?route,
                                commented = commented_lines.len(),
                                "candidate parsed"
                            );
                            driver.candidate = Some(value);
                            AttemptEvent::ParseSucceeded
                        }
                        Parsed::Failure { reason } => {
                            let attempt = run.attempt_offset + driver.backend_attempts;
                            self.record_failed_attempt(
                                stage,
                                schema_id,
                                run,
                                attempt,
                                json!({ "unparsed": text }),
                                None,
                                &driver,
                            );
                            self.note_attempt_failure(stage, run, attempt, &reason);
                            driver.failure = Some(WeaverError::ParseError {
                                stage: stage.name.clone(),
                                message: reason,
                            });
                            AttemptEvent::ParseFailed
                        }
                    }
                }
                Effect::Normalize { final_attempt } => {
                    let raw = driver.candidate.take().unwrap_or(Value::Null);
                    let (value, applied) = normalize(
                        schema,
                        raw,
                        &run.targets,
                        NormalizeOptions {
                            final_attempt,
                            policy: self.options.placeholder_policy,
                        },
                    );
                    if !applied.is_empty() {
                        tracing::debug!(
                            stage = %stage.name,
                            defaults = applied.len(),
                            "normalizer applied defaults"
                        );
                    }
                    driver.candidate = Some(value);
                    AttemptEvent::Normalized
                }
                Effect::Validate => {
                    let candidate = driver.candidate.clone().unwrap_or(Value::Null);
                    let result = validate(schema, &candidate);
                    let attempt = run.attempt_offset + driver.backend_attempts;
                    if result.valid {
                        if driver.in_revision {
                            driver.push_revision_record(&self.emitter, stage, run, attempt, &[]);
                        }
                        driver.last_validation = Some(result.clone());
                        let artifact = driver
                            .build_artifact(stage, schema_id, attempt, candidate)
                            .accepted();
                        self.store.record(StoredAttempt {
                            run_id: run.run_id.clone(),
                            stage: stage.name.clone(),
                            attempt,
                            artifact: artifact.clone(),
                            validation: Some(result.clone()),
                            revisions: driver.revisions.clone(),
                        });
                        driver.accepted = Some(artifact);
                        AttemptEvent::ValidationPassed
                    } else {
                        let count = result.error_count();
                        if driver.in_revision {
                            driver.push_revision_record(
                                &self.emitter,
                                stage,
                                run,
                                attempt,
                                &result.errors,
                            );
                        }
                        self.record_failed_attempt(
                            stage,
                            schema_id,
                            run,
                            attempt,
                            candidate,
                            Some(result.clone()),
                            &driver,
                        );
                        self.note_attempt_failure(
                            stage,
                            run,
                            attempt,
                            &format!("validation failed with {count} error(s)"),
                        );
                        driver.last_errors = result.errors.clone();
                        driver.failure = Some(WeaverError::ValidationFailed {
                            stage: stage.name.clone(),
                            error_count: count,
                        });
                        AttemptEvent::ValidationFailed { error_count: count }
                    }
                }
                Effect::Accept => {
                    let artifact = driver.accepted.take().ok_or_else(|| {
                        WeaverError::Other(format!(
                            "stage '{}' accepted without an artifact",
                            stage.name
                        ))
                    })?;
                    return Ok(StageResult {
                        artifact,
                        validation: driver.last_validation.take().unwrap_or_default(),
                        revisions: driver.revisions,
                        backend_attempts: driver.backend_attempts,
                    });
                }
                Effect::Fail => {
                    return Err(driver.into_failure(stage));
                }
            };

            let (next, effects) = machine::step(&limits, state, event);
            state = next;
            queue.extend(effects);
        }

        Err(WeaverError::Other(format!(
            "stage '{}' retry machine stalled in {state:?}",
            stage.name
        )))
    }

    /// One backend call: prompt out, event in. Charges the ledger either way.
    async fn attempt_call(
        &self,
        stage: &StageDefinition,
        schema_id: &str,
        temperature: f32,
        run: &StageRun,
        driver: &mut Driver,
        prompt_text: String,
    ) -> AttemptEvent {
        let attempt = run.attempt_offset + driver.backend_attempts + 1;
        self.emitter.emit(PipelineEvent::RequestStarted {
            run_id: run.run_id.clone(),
            project_id: run.project_id.clone(),
            stage: stage.name.clone(),
            attempt,
        });

        let request = GenerationRequest {
            prompt: prompt_text,
            temperature,
            max_output_tokens: self.options.max_output_tokens,
            structured_hint: Some(schema_id.to_string()),
        };
        let (result, elapsed_ms) = self.call_backend(&request).await;
        driver.backend_attempts += 1;

        match result {
            Ok(response) => {
                self.ledger.record(AttemptCharge {
                    stage: stage.name.clone(),
                    attempt,
                    cost: response.token_cost,
                    latency_ms: response.latency_ms,
                    succeeded: true,
                });
                driver.total_cost += response.token_cost;
                driver.total_latency_ms += response.latency_ms;
                tracing::info!(
                    stage = %stage.name,
                    attempt,
                    run_id = %run.run_id,
                    project_id = %run.project_id,
                    latency_ms = response.latency_ms,
                    model_id = %response.model_id,
                    "generation response received"
                );
                self.emitter.emit(PipelineEvent::ResponseReceived {
                    run_id: run.run_id.clone(),
                    stage: stage.name.clone(),
                    attempt,
                    model_id: response.model_id.clone(),
                    latency_ms: response.latency_ms,
                });
                driver.raw_text = Some(response.text);
                AttemptEvent::BackendResponded
            }
            Err(error) => {
                self.ledger.record(AttemptCharge {
                    stage: stage.name.clone(),
                    attempt,
                    cost: 0.0,
                    latency_ms: elapsed_ms,
                    succeeded: false,
                });
                driver.total_latency_ms += elapsed_ms;
                self.record_failed_attempt(
                    stage,
                    schema_id,
                    run,
                    attempt,
                    Value::Null,
                    None,
                    driver,
                );
                self.note_attempt_failure(stage, run, attempt, &error.to_string());
                driver.failure = Some(error);
                AttemptEvent::BackendFailed
            }
        }
    }

    /// Call the backend under the configured timeout, retrying transient
    /// faults with backoff. A timeout is returned immediately; it charges
    /// the attempt budget like a parse failure rather than the transient
    /// budget.
    async fn call_backend(
        &self,
        request: &GenerationRequest,
    ) -> (Result<GenerationResponse>, u64) {
        let started = Instant::now();
        let mut transient = 0usize;
        let result = loop {
            let outcome = match tokio::time::timeout(
                self.options.request_timeout,
                self.backend.generate(request),
            )
            .await
            {
                Ok(inner) => inner,
                Err(_) => Err(WeaverError::RequestTimeout {
                    backend: self.backend.name().to_string(),
                    timeout_ms: self.options.request_timeout.as_millis() as u64,
                }),
            };
            match outcome {
                Ok(response) => break Ok(response),
                Err(error @ WeaverError::RequestTimeout { .. }) => break Err(error),
                Err(error)
                    if error.is_retryable() && transient < self.options.transient_retries =>
                {
                    let delay = self.options.backoff.delay_for_attempt(transient);
                    tracing::warn!(
                        backend = %self.backend.name(),
                        transient_attempt = transient,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "transient backend fault, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    transient += 1;
                }
                Err(error) => break Err(error),
            }
        };
        (result, started.elapsed().as_millis() as u64)
    }

    fn record_failed_attempt(
        &self,
        stage: &StageDefinition,
        schema_id: &str,
        run: &StageRun,
        attempt: u32,
        payload: Value,
        validation: Option<ValidationResult>,
        driver: &Driver,
    ) {
        let artifact = Artifact::draft(&stage.name, schema_id, attempt, payload)
            .with_charge(driver.total_cost, driver.total_latency_ms)
            .with_revisions(driver.revisions.len() as u32)
            .failed();
        self.store.record(StoredAttempt {
            run_id: run.run_id.clone(),
            stage: stage.name.clone(),
            attempt,
            artifact,
            validation,
            revisions: driver.revisions.clone(),
        });
    }

    fn note_attempt_failure(
        &self,
        stage: &StageDefinition,
        run: &StageRun,
        attempt: u32,
        reason: &str,
    ) {
        tracing::warn!(
            stage = %stage.name,
            attempt,
            run_id = %run.run_id,
            project_id = %run.project_id,
            reason,
            "stage attempt failed"
        );
        self.emitter.emit(PipelineEvent::AttemptFailed {
            run_id: run.run_id.clone(),
            stage: stage.name.clone(),
            attempt,
            reason: reason.to_string(),
        });
    }
}

/// Mutable working set for one `run_stage` invocation.
struct Driver {
    raw_text: Option<String>,
    candidate: Option<Value>,
    last_errors: Vec<ValidationError>,
    /// Errors the current revision set out to fix.
    revision_baseline: Option<Vec<ValidationError>>,
    revisions: Vec<RevisionRecord>,
    in_revision: bool,
    regressed: Option<(usize, usize)>,
    backend_attempts: u32,
    total_cost: f64,
    total_latency_ms: u64,
    failure: Option<WeaverError>,
    last_validation: Option<ValidationResult>,
    accepted: Option<Artifact>,
}

impl Driver {
    fn build_artifact(
        &self,
        stage: &StageDefinition,
        schema_id: &str,
        attempt: u32,
        payload: Value,
    ) -> Artifact {
        Artifact::draft(&stage.name, schema_id, attempt, payload)
            .with_charge(self.total_cost, self.total_latency_ms)
            .with_revisions(self.revisions.len() as u32)
    }

    fn push_revision_record(
        &mut self,
        emitter: &EventEmitter,
        stage: &StageDefinition,
        run: &StageRun,
        attempt: u32,
        remaining: &[ValidationError],
    ) {
        let baseline = self.revision_baseline.take().unwrap_or_default();
        let before = if baseline.is_empty() {
            remaining.len()
        } else {
            baseline.len()
        };
        let after = remaining.len();
        if after > before {
            self.regressed = Some((before, after));
        }
        self.revisions.push(RevisionRecord {
            attempt,
            error_count_before: before,
            error_count_after: after,
            applied_fixes: describe_fixes(&baseline, remaining, 8),
        });
        tracing::info!(
            stage = %stage.name,
            attempt,
            errors_before = before,
            errors_after = after,
            "revision applied"
        );
        emitter.emit(PipelineEvent::RevisionApplied {
            run_id: run.run_id.clone(),
            stage: stage.name.clone(),
            attempt,
            errors_before: before,
            errors_after: after,
        });
    }

    fn into_failure(self, stage: &StageDefinition) -> WeaverError {
        if let Some((before, after)) = self.regressed {
            return WeaverError::RevisionRegressed {
                stage: stage.name.clone(),
                before,
                after,
            };
        }
        if self.in_revision {
            return WeaverError::RevisionExhausted {
                stage: stage.name.clone(),
                attempts: self.revisions.len() as u32,
            };
        }
        self.failure
            .unwrap_or_else(|| WeaverError::Other(format!("stage '{}' failed", stage.name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use caseweaver_gen::GenerationBackend;
    use caseweaver_schema::SchemaRegistry;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Serves scripted responses; `Err` entries become backend faults.
    struct ScriptedBackend {
        script: Mutex<VecDeque<Result<String>>>,
        calls: AtomicUsize,
    }

    impl ScriptedBackend {
        fn new(script: Vec<Result<String>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl GenerationBackend for ScriptedBackend {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn generate(&self, _request: &GenerationRequest) -> Result<GenerationResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok("{}".into()));
            next.map(|text| GenerationResponse {
                text,
                model_id: "scripted".into(),
                latency_ms: 7,
                token_cost: 0.01,
            })
        }
    }

    fn executor_with(script: Vec<Result<String>>) -> StageExecutor {
        StageExecutor::new(
            DynBackend::new(ScriptedBackend::new(script)),
            Arc::new(SchemaRegistry::builtin()),
            CostLedger::new(),
            ArtifactStore::new(),
            EventEmitter::default(),
            ExecutorOptions {
                backoff: BackoffPolicy::None,
                ..ExecutorOptions::default()
            },
        )
    }

    fn setting_stage() -> StageDefinition {
        StageDefinition::generate(
            "setting_refinement",
            &[],
            caseweaver_schema::SETTING_SCHEMA,
            "Refine the setting.",
        )
    }

    fn valid_setting() -> String {
        serde_json::json!({
            "era": "1920s",
            "locale": "a fen-country manor",
            "tone": "gothic",
            "locations": [{"name": "the boat house", "detail": "half-sunk"}],
        })
        .to_string()
    }

    fn limits(generation: u32, revision: u32) -> StageLimits {
        StageLimits {
            max_generation_attempts: generation,
            max_revision_attempts: revision,
        }
    }

    #[tokio::test]
    async fn clean_first_attempt_is_accepted_unrevised() {
        let executor = executor_with(vec![Ok(valid_setting())]);
        let run = StageRun::new("r1", "p1");
        let result = executor
            .run_stage(&setting_stage(), limits(3, 2), 0.8, &run)
            .await
            .unwrap();
        assert_eq!(result.artifact.attempt, 1);
        assert!(!result.artifact.revised);
        assert_eq!(result.backend_attempts, 1);
        assert!(result.validation.valid);

        let ledger = executor.ledger().entries();
        assert_eq!(ledger.len(), 1);
        assert!(ledger[0].succeeded);
        assert_eq!(
            executor.store().attempt_count("r1", "setting_refinement"),
            1
        );
    }

    #[tokio::test]
    async fn invalid_attempts_escalate_to_revision_then_accept() {
        // Two invalid generations (missing locale), then a revision that
        // fixes everything.
        let invalid = serde_json::json!({
            "era": "1920s",
            "locations": [{"name": "the boat house"}],
        })
        .to_string();
        let executor = executor_with(vec![
            Ok(invalid.clone()),
            Ok(invalid),
            Ok(valid_setting()),
        ]);
        let run = StageRun::new("r1", "p1");
        let result = executor
            .run_stage(&setting_stage(), limits(2, 2), 0.8, &run)
            .await
            .unwrap();

        assert_eq!(result.artifact.attempt, 3);
        assert!(result.artifact.revised);
        assert_eq!(result.artifact.revision_count, 1);
        assert_eq!(result.revisions.len(), 1);
        assert_eq!(result.revisions[0].error_count_before, 1);
        assert_eq!(result.revisions[0].error_count_after, 0);
        assert!(result.revisions[0]
            .applied_fixes
            .contains(&"reduced errors from 1 to 0".to_string()));

        // All three attempts charged, failed ones included.
        assert_eq!(executor.ledger().entries().len(), 3);
        // All three versions retained.
        let history = executor.store().history("r1", "setting_refinement");
        assert_eq!(history.len(), 3);
        assert_eq!(
            history[2].artifact.status,
            caseweaver_types::ArtifactStatus::Accepted
        );
    }

    #[tokio::test]
    async fn garbage_output_exhausts_and_fails_without_revision_budget() {
        let executor = executor_with(vec![Ok("???".into()), Ok("@@@".into())]);
        let run = StageRun::new("r1", "p1");
        let err = executor
            .run_stage(&setting_stage(), limits(2, 0), 0.8, &run)
            .await
            .unwrap_err();
        assert!(matches!(err, WeaverError::ParseError { .. }));
        assert_eq!(executor.ledger().entries().len(), 2);
    }

    #[tokio::test]
    async fn transient_fault_is_retried_within_the_same_attempt() {
        let executor = executor_with(vec![
            Err(WeaverError::RateLimited {
                backend: "scripted".into(),
                retry_after_ms: 0,
            }),
            Ok(valid_setting()),
        ]);
        let run = StageRun::new("r1", "p1");
        let result = executor
            .run_stage(&setting_stage(), limits(1, 0), 0.8, &run)
            .await
            .unwrap();
        // The rate limit burned a transient retry, not a generation attempt.
        assert_eq!(result.backend_attempts, 1);
        assert_eq!(result.artifact.attempt, 1);
    }

    #[tokio::test]
    async fn non_retryable_backend_fault_burns_the_attempt() {
        let executor = executor_with(vec![
            Err(WeaverError::BackendError {
                backend: "scripted".into(),
                status: 400,
                message: "bad request".into(),
                retryable: false,
            }),
            Ok(valid_setting()),
        ]);
        let run = StageRun::new("r1", "p1");
        let result = executor
            .run_stage(&setting_stage(), limits(2, 0), 0.8, &run)
            .await
            .unwrap();
        assert_eq!(result.backend_attempts, 2);
        assert_eq!(result.artifact.attempt, 2);
        let charges = executor.ledger().entries();
        assert!(!charges[0].succeeded);
        assert!(charges[1].succeeded);
    }

    #[tokio::test]
    async fn revision_regression_fails_with_the_count_pair() {
        // One invalid generation (1 error), then a revision that breaks two
        // more fields.
        let one_error = serde_json::json!({
            "era": "1920s",
            "locations": [{"name": "the boat house"}],
        })
        .to_string();
        let three_errors = serde_json::json!({
            "era": 7,
            "locations": [{"name": ""}],
        })
        .to_string();
        let executor = executor_with(vec![Ok(one_error), Ok(three_errors)]);
        let run = StageRun::new("r1", "p1");
        let err = executor
            .run_stage(&setting_stage(), limits(1, 3), 0.8, &run)
            .await
            .unwrap_err();
        match err {
            WeaverError::RevisionRegressed { before, after, .. } => {
                assert_eq!(before, 1);
                assert!(after > before);
            }
            other => panic!("expected RevisionRegressed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn attempt_offset_continues_version_numbering() {
        let executor = executor_with(vec![Ok(valid_setting())]);
        let mut run = StageRun::new("r1", "p1");
        run.attempt_offset = 4;
        let result = executor
            .run_stage(&setting_stage(), limits(3, 2), 0.8, &run)
            .await
            .unwrap();
        assert_eq!(result.artifact.attempt, 5);
        assert!(executor.store().get("r1", "setting_refinement", 5).is_some());
    }

    #[tokio::test]
    async fn timeout_counts_as_a_failed_attempt() {
        struct SlowBackend;

        #[async_trait]
        impl GenerationBackend for SlowBackend {
            fn name(&self) -> &str {
                "slow"
            }

            async fn generate(&self, _r: &GenerationRequest) -> Result<GenerationResponse> {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(GenerationResponse {
                    text: "{}".into(),
                    model_id: "slow".into(),
                    latency_ms: 200,
                    token_cost: 0.0,
                })
            }
        }

        let executor = StageExecutor::new(
            DynBackend::new(SlowBackend),
            Arc::new(SchemaRegistry::builtin()),
            CostLedger::new(),
            ArtifactStore::new(),
            EventEmitter::default(),
            ExecutorOptions {
                request_timeout: Duration::from_millis(10),
                backoff: BackoffPolicy::None,
                ..ExecutorOptions::default()
            },
        );
        let run = StageRun::new("r1", "p1");
        let err = executor
            .run_stage(&setting_stage(), limits(1, 0), 0.8, &run)
            .await
            .unwrap_err();
        assert!(matches!(err, WeaverError::RequestTimeout { .. }));
        let charges = executor.ledger().entries();
        assert_eq!(charges.len(), 1);
        assert!(!charges[0].succeeded);
    }

    #[tokio::test]
    async fn clue_categories_are_inferred_before_validation() {
        // Clue arrives without a category; the rule table fills it from the
        // description so validation passes without the enum fallback.
        let clues = serde_json::json!({
            "clue_count": 1,
            "clues": [{
                "id": "c1",
                "description": "A torn letter in the grate",
                "source_reference": "/facts/0",
                "placement": "early",
                "criticality": "supporting",
            }],
        })
        .to_string();
        let executor = executor_with(vec![Ok(clues)]);
        let stage = StageDefinition::generate(
            "clue_distribution",
            &[],
            CLUES_SCHEMA,
            "Distribute clues.",
        );
        let run = StageRun::new("r1", "p1");
        let result = executor
            .run_stage(&stage, limits(1, 0), 0.8, &run)
            .await
            .unwrap();
        assert_eq!(
            result.artifact.payload["clues"][0]["category"],
            "documentary"
        );
    }
}
