//! Pipeline orchestrator.
//!
//! Resolves the stage DAG by dependency, runs independent branches
//! concurrently on a [`tokio::task::JoinSet`], propagates fatal failures to
//! transitive dependents, and drives the audit feedback loops: a negative
//! audit verdict becomes a bounded regeneration of the audited target, never
//! an automatic accept and never an unbounded loop.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::task::JoinSet;

use caseweaver_gen::DynBackend;
use caseweaver_schema::SchemaRegistry;
use caseweaver_types::{
    Artifact, CostLedger, PipelineRun, Result, StageCostSummary, StageRecord, StageStatus,
    WeaverError,
};

use crate::audit::fair_play::audit_fair_play;
use crate::audit::novelty::{audit_novelty, NoveltyVerdict};
use crate::audit::AuditVerdict;
use crate::config::RunConfig;
use crate::events::{EventEmitter, PipelineEvent};
use crate::executor::{
    BackoffPolicy, ExecutorOptions, StageExecutor, StageResult, StageRun,
};
use crate::machine::StageLimits;
use crate::prose;
use crate::stage::{self, StageDefinition, StageKind, StagePlan};
use crate::store::{ArtifactStore, StoredAttempt};

const FAIR_PLAY_REPORT_SCHEMA: &str = "audit.fair_play.v1";
const NOVELTY_REPORT_SCHEMA: &str = "audit.novelty.v1";

/// User-visible result of a pipeline run: per-stage status, the accepted
/// artifacts, and any non-blocking warnings.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run: PipelineRun,
    pub artifacts: BTreeMap<String, Artifact>,
    pub warnings: Vec<String>,
}

impl RunReport {
    pub fn status_of(&self, stage: &str) -> Option<StageStatus> {
        self.run
            .stages
            .iter()
            .find(|s| s.stage == stage)
            .map(|s| s.status)
    }
}

pub struct Orchestrator {
    executor: StageExecutor,
    plan: StagePlan,
    registry: Arc<SchemaRegistry>,
    store: ArtifactStore,
    ledger: CostLedger,
    emitter: EventEmitter,
    config: RunConfig,
}

#[derive(Debug, Clone)]
enum Slot {
    NotStarted,
    Running,
    Accepted,
    Failed(String),
    Skipped(String),
}

/// What a spawned stage task hands back to the scheduler.
struct TaskOutput {
    stage: String,
    attempts: u32,
    warnings: Vec<String>,
    /// Upstream artifacts replaced by audit-driven regeneration.
    replaced: Vec<(String, Artifact)>,
    outcome: Result<Artifact>,
}

impl Orchestrator {
    pub fn new(backend: DynBackend, config: RunConfig) -> Self {
        Self::with_plan(backend, config, stage::default_plan())
    }

    pub fn with_plan(backend: DynBackend, config: RunConfig, plan: StagePlan) -> Self {
        let registry = Arc::new(SchemaRegistry::builtin());
        let ledger = CostLedger::new();
        let store = ArtifactStore::new();
        let emitter = EventEmitter::default();
        let executor = StageExecutor::new(
            backend,
            Arc::clone(&registry),
            ledger.clone(),
            store.clone(),
            emitter.clone(),
            ExecutorOptions {
                request_timeout: std::time::Duration::from_millis(config.request_timeout_ms),
                max_output_tokens: config.max_output_tokens,
                transient_retries: config.transient_retries,
                backoff: BackoffPolicy::default(),
                placeholder_policy: config.placeholder_policy,
                error_sample_cap: 3,
            },
        );
        Self {
            executor,
            plan,
            registry,
            store,
            ledger,
            emitter,
            config,
        }
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<PipelineEvent> {
        self.emitter.subscribe()
    }

    pub fn ledger(&self) -> &CostLedger {
        &self.ledger
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    /// Run the plan to completion. Individual stage failures end up in the
    /// report; only a malformed plan is an error here.
    pub async fn run(&self) -> Result<RunReport> {
        stage::lint(&self.plan, &self.registry)?;

        let run_id = self.config.run_id.clone();
        self.emitter.emit(PipelineEvent::RunStarted {
            run_id: run_id.clone(),
            project_id: self.config.project_id.clone(),
            stage_count: self.plan.stages.len(),
        });
        tracing::info!(
            run_id = %run_id,
            project_id = %self.config.project_id,
            stages = self.plan.stages.len(),
            "pipeline run started"
        );

        let mut slots: HashMap<String, Slot> = self
            .plan
            .stages
            .iter()
            .map(|s| (s.name.clone(), Slot::NotStarted))
            .collect();
        let mut artifacts: BTreeMap<String, Artifact> = BTreeMap::new();
        let mut attempts: HashMap<String, u32> = HashMap::new();
        let mut warnings: Vec<String> = Vec::new();
        let mut tasks: JoinSet<TaskOutput> = JoinSet::new();

        loop {
            self.propagate_skips(&mut slots);
            self.spawn_ready(&mut slots, &artifacts, &mut tasks);

            let Some(joined) = tasks.join_next().await else {
                break;
            };
            let output = match joined {
                Ok(output) => output,
                Err(join_error) => {
                    // A panicked task poisons nothing; the run carries on
                    // and the panic is surfaced as an internal failure.
                    tracing::error!(error = %join_error, "stage task aborted");
                    continue;
                }
            };

            attempts.insert(output.stage.clone(), output.attempts);
            warnings.extend(output.warnings);
            for (name, artifact) in output.replaced {
                artifacts.insert(name, artifact);
            }
            match output.outcome {
                Ok(artifact) => {
                    self.emitter.emit(PipelineEvent::StageAccepted {
                        run_id: run_id.clone(),
                        stage: output.stage.clone(),
                        attempt: artifact.attempt,
                        revised: artifact.revised,
                    });
                    tracing::info!(
                        run_id = %run_id,
                        stage = %output.stage,
                        attempt = artifact.attempt,
                        revised = artifact.revised,
                        "stage accepted"
                    );
                    artifacts.insert(output.stage.clone(), artifact);
                    slots.insert(output.stage, Slot::Accepted);
                }
                Err(error) => {
                    self.emitter.emit(PipelineEvent::StageFailed {
                        run_id: run_id.clone(),
                        stage: output.stage.clone(),
                        error: error.to_string(),
                    });
                    tracing::error!(
                        run_id = %run_id,
                        stage = %output.stage,
                        error = %error,
                        "stage failed"
                    );
                    slots.insert(output.stage, Slot::Failed(error.to_string()));
                }
            }
        }

        let report = self.build_report(slots, artifacts, attempts, warnings);
        self.emitter.emit(PipelineEvent::RunCompleted {
            run_id,
            accepted: report
                .run
                .stages
                .iter()
                .filter(|s| s.status == StageStatus::Accepted)
                .count(),
            failed: report
                .run
                .stages
                .iter()
                .filter(|s| s.status == StageStatus::Failed)
                .count(),
            skipped: report
                .run
                .stages
                .iter()
                .filter(|s| s.status == StageStatus::Skipped)
                .count(),
            total_cost: report.run.total_cost,
        });
        Ok(report)
    }

    /// Mark every not-yet-started stage with a failed or skipped dependency
    /// as skipped, to a fixpoint. Running stages are left to finish.
    fn propagate_skips(&self, slots: &mut HashMap<String, Slot>) {
        loop {
            let mut skip: Option<(String, String)> = None;
            for stage in &self.plan.stages {
                if !matches!(slots.get(&stage.name), Some(Slot::NotStarted)) {
                    continue;
                }
                let blocked = stage.depends_on.iter().find(|dep| {
                    matches!(slots.get(dep.as_str()), Some(Slot::Failed(_) | Slot::Skipped(_)))
                });
                if let Some(upstream) = blocked {
                    skip = Some((stage.name.clone(), upstream.clone()));
                    break;
                }
            }
            let Some((name, upstream)) = skip else { break };
            tracing::warn!(stage = %name, upstream = %upstream, "stage skipped");
            self.emitter.emit(PipelineEvent::StageSkipped {
                run_id: self.config.run_id.clone(),
                stage: name.clone(),
                upstream: upstream.clone(),
            });
            slots.insert(name, Slot::Skipped(upstream));
        }
    }

    fn spawn_ready(
        &self,
        slots: &mut HashMap<String, Slot>,
        artifacts: &BTreeMap<String, Artifact>,
        tasks: &mut JoinSet<TaskOutput>,
    ) {
        let ready: Vec<StageDefinition> = self
            .plan
            .stages
            .iter()
            .filter(|s| matches!(slots.get(&s.name), Some(Slot::NotStarted)))
            .filter(|s| {
                s.depends_on
                    .iter()
                    .all(|dep| matches!(slots.get(dep.as_str()), Some(Slot::Accepted)))
            })
            .cloned()
            .collect();

        for stage in ready {
            slots.insert(stage.name.clone(), Slot::Running);
            self.emitter.emit(PipelineEvent::StageStarted {
                run_id: self.config.run_id.clone(),
                stage: stage.name.clone(),
            });

            let executor = self.executor.clone();
            let config = self.config.clone();
            let store = self.store.clone();
            let emitter = self.emitter.clone();
            let plan = self.plan.clone();
            let snapshot = artifacts.clone();

            tasks.spawn(async move {
                match stage.kind.clone() {
                    StageKind::Generate { .. } => {
                        run_generate(executor, config, store, stage, snapshot).await
                    }
                    StageKind::Prose { .. } => {
                        run_prose(executor, config, store, stage, snapshot).await
                    }
                    StageKind::FairPlayAudit { target } => {
                        run_fair_play(executor, config, store, emitter, plan, stage, target, snapshot)
                            .await
                    }
                    StageKind::NoveltyAudit { target } => {
                        run_novelty(executor, config, store, emitter, plan, stage, target, snapshot)
                            .await
                    }
                }
            });
        }
    }

    fn build_report(
        &self,
        slots: HashMap<String, Slot>,
        artifacts: BTreeMap<String, Artifact>,
        attempts: HashMap<String, u32>,
        warnings: Vec<String>,
    ) -> RunReport {
        let summaries = self.ledger.summary_by_stage();
        let stages = self
            .plan
            .stages
            .iter()
            .map(|stage| {
                let slot = slots.get(&stage.name).cloned().unwrap_or(Slot::NotStarted);
                let artifact = artifacts.get(&stage.name);
                let (cost, latency_ms) = charge_for(&summaries, &stage.name);
                let (status, failure) = match slot {
                    Slot::Accepted => (StageStatus::Accepted, None),
                    Slot::Failed(message) => (StageStatus::Failed, Some(message)),
                    Slot::Skipped(upstream) => (
                        StageStatus::Skipped,
                        Some(format!("upstream '{upstream}' did not complete")),
                    ),
                    // Running cannot survive the join loop; NotStarted only
                    // remains if the scheduler never reached the stage.
                    Slot::Running | Slot::NotStarted => {
                        (StageStatus::Skipped, Some("never scheduled".into()))
                    }
                };
                StageRecord {
                    stage: stage.name.clone(),
                    status,
                    attempts: attempts.get(&stage.name).copied().unwrap_or(0),
                    revised: artifact.map(|a| a.revised).unwrap_or(false),
                    revision_count: artifact.map(|a| a.revision_count).unwrap_or(0),
                    cost,
                    latency_ms,
                    failure,
                }
            })
            .collect();

        RunReport {
            run: PipelineRun {
                run_id: self.config.run_id.clone(),
                project_id: self.config.project_id.clone(),
                stages,
                total_cost: self.ledger.total_cost(),
                total_latency_ms: self.ledger.total_latency_ms(),
            },
            artifacts,
            warnings,
        }
    }
}

fn failed_output(stage: &str, error: WeaverError) -> TaskOutput {
    TaskOutput {
        stage: stage.to_string(),
        attempts: 0,
        warnings: Vec::new(),
        replaced: Vec::new(),
        outcome: Err(error),
    }
}

/// Ledger charges for a stage, including its `<stage>/...` sub-executions
/// (prose batches, repair passes).
fn charge_for(summaries: &[StageCostSummary], stage: &str) -> (f64, u64) {
    let prefix = format!("{stage}/");
    summaries
        .iter()
        .filter(|s| s.stage == stage || s.stage.starts_with(&prefix))
        .fold((0.0, 0), |(cost, latency), s| {
            (cost + s.cost, latency + s.latency_ms)
        })
}

fn upstream_payloads(
    depends_on: &[String],
    artifacts: &BTreeMap<String, Artifact>,
) -> BTreeMap<String, Value> {
    depends_on
        .iter()
        .filter_map(|dep| {
            artifacts
                .get(dep)
                .map(|a| (dep.clone(), a.payload.clone()))
        })
        .collect()
}

fn stage_context(
    config: &RunConfig,
    store: &ArtifactStore,
    stage: &StageDefinition,
    artifacts: &BTreeMap<String, Artifact>,
) -> StageRun {
    let mut run = StageRun::new(config.run_id.clone(), config.project_id.clone());
    run.domain = config.domain.clone();
    run.upstream = upstream_payloads(&stage.depends_on, artifacts);
    run.attempt_offset = store.attempt_count(&config.run_id, &stage.name);
    run
}

fn limits_of(config: &RunConfig, stage: &StageDefinition) -> (StageLimits, f32) {
    let (generation, revision, temperature) = config.limits_for(stage);
    (
        StageLimits {
            max_generation_attempts: generation,
            max_revision_attempts: revision,
        },
        temperature,
    )
}

// ---------------------------------------------------------------------------
// Stage task bodies
// ---------------------------------------------------------------------------

async fn run_generate(
    executor: StageExecutor,
    config: RunConfig,
    store: ArtifactStore,
    stage: StageDefinition,
    artifacts: BTreeMap<String, Artifact>,
) -> TaskOutput {
    let context = stage_context(&config, &store, &stage, &artifacts);
    let (limits, temperature) = limits_of(&config, &stage);
    let offset = context.attempt_offset;
    match executor.run_stage(&stage, limits, temperature, &context).await {
        Ok(StageResult {
            artifact,
            backend_attempts,
            ..
        }) => TaskOutput {
            stage: stage.name,
            attempts: offset + backend_attempts,
            warnings: Vec::new(),
            replaced: Vec::new(),
            outcome: Ok(artifact),
        },
        Err(error) => TaskOutput {
            stage: stage.name.clone(),
            attempts: store.attempt_count(&config.run_id, &stage.name),
            warnings: Vec::new(),
            replaced: Vec::new(),
            outcome: Err(error),
        },
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_fair_play(
    executor: StageExecutor,
    config: RunConfig,
    store: ArtifactStore,
    emitter: EventEmitter,
    plan: StagePlan,
    stage: StageDefinition,
    target: String,
    mut artifacts: BTreeMap<String, Artifact>,
) -> TaskOutput {
    // The case is whichever dependency is not the audited clue stage.
    let case_name = stage
        .depends_on
        .iter()
        .find(|dep| **dep != target)
        .cloned()
        .unwrap_or_else(|| stage::CASE_GENERATION.to_string());
    let Some(case) = artifacts.get(&case_name).cloned() else {
        return failed_output(
            &stage.name,
            WeaverError::DependencyFailure {
                stage: stage.name.clone(),
                upstream: case_name,
            },
        );
    };
    let Some(target_def) = plan.get(&target).cloned() else {
        return failed_output(
            &stage.name,
            WeaverError::InvalidPlan(format!("audit target '{target}' missing from plan")),
        );
    };

    let mut iteration = 0u32;
    let mut regenerated = false;
    loop {
        let Some(clues) = artifacts.get(&target).cloned() else {
            return failed_output(
                &stage.name,
                WeaverError::DependencyFailure {
                    stage: stage.name.clone(),
                    upstream: target.clone(),
                },
            );
        };
        let report = audit_fair_play(&case.payload, &clues.payload, &config.fair_play);
        emitter.emit(PipelineEvent::AuditCompleted {
            run_id: config.run_id.clone(),
            audit: stage.name.clone(),
            verdict: report.verdict.to_string(),
            violations: report.violations.len(),
        });
        tracing::info!(
            audit = %stage.name,
            verdict = %report.verdict,
            violations = report.violations.len(),
            "fair-play audit completed"
        );

        if report.verdict == AuditVerdict::Pass {
            let attempt = iteration + 1;
            let payload = serde_json::to_value(&report).unwrap_or(Value::Null);
            let artifact =
                Artifact::draft(&stage.name, FAIR_PLAY_REPORT_SCHEMA, attempt, payload).accepted();
            store.record(StoredAttempt {
                run_id: config.run_id.clone(),
                stage: stage.name.clone(),
                attempt,
                artifact: artifact.clone(),
                validation: None,
                revisions: Vec::new(),
            });
            return TaskOutput {
                stage: stage.name,
                attempts: attempt,
                warnings: Vec::new(),
                replaced: if regenerated {
                    vec![(target, clues)]
                } else {
                    Vec::new()
                },
                outcome: Ok(artifact),
            };
        }

        if iteration >= config.fair_play_max_regenerations {
            return failed_output(
                &stage.name,
                WeaverError::AuditRejected {
                    audit: stage.name.clone(),
                    target,
                    iterations: iteration,
                },
            );
        }
        iteration += 1;
        emitter.emit(PipelineEvent::RegenerationRequested {
            run_id: config.run_id.clone(),
            audit: stage.name.clone(),
            target: target.clone(),
            iteration,
        });
        tracing::warn!(
            audit = %stage.name,
            target = %target,
            iteration,
            "audit requested bounded regeneration"
        );

        let mut context = stage_context(&config, &store, &target_def, &artifacts);
        context.guidance = report.feedback_lines();
        let (limits, temperature) = limits_of(&config, &target_def);
        match executor
            .run_stage(&target_def, limits, temperature, &context)
            .await
        {
            Ok(result) => {
                artifacts.insert(target.clone(), result.artifact);
                regenerated = true;
            }
            Err(error) => return failed_output(&stage.name, error),
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_novelty(
    executor: StageExecutor,
    config: RunConfig,
    store: ArtifactStore,
    emitter: EventEmitter,
    plan: StagePlan,
    stage: StageDefinition,
    target: String,
    mut artifacts: BTreeMap<String, Artifact>,
) -> TaskOutput {
    let Some(target_def) = plan.get(&target).cloned() else {
        return failed_output(
            &stage.name,
            WeaverError::InvalidPlan(format!("audit target '{target}' missing from plan")),
        );
    };

    let mut iteration = 0u32;
    let mut regenerated = false;
    loop {
        let Some(case) = artifacts.get(&target).cloned() else {
            return failed_output(
                &stage.name,
                WeaverError::DependencyFailure {
                    stage: stage.name.clone(),
                    upstream: target.clone(),
                },
            );
        };
        let report = audit_novelty(&case.payload, &config.references, &config.novelty);
        emitter.emit(PipelineEvent::AuditCompleted {
            run_id: config.run_id.clone(),
            audit: stage.name.clone(),
            verdict: report.verdict.to_string(),
            violations: 0,
        });
        tracing::info!(
            audit = %stage.name,
            verdict = %report.verdict,
            most_similar = report
                .most_similar
                .as_ref()
                .map(|s| s.reference.as_str())
                .unwrap_or("-"),
            "novelty audit completed"
        );

        if report.verdict != NoveltyVerdict::Fail {
            let attempt = iteration + 1;
            let mut warnings = Vec::new();
            if report.verdict == NoveltyVerdict::Warning {
                if let Some(score) = &report.most_similar {
                    warnings.push(format!(
                        "novelty warning: closest reference '{}' at similarity {:.2}",
                        score.reference, score.similarity
                    ));
                }
            }
            let payload = serde_json::to_value(&report).unwrap_or(Value::Null);
            let artifact =
                Artifact::draft(&stage.name, NOVELTY_REPORT_SCHEMA, attempt, payload).accepted();
            store.record(StoredAttempt {
                run_id: config.run_id.clone(),
                stage: stage.name.clone(),
                attempt,
                artifact: artifact.clone(),
                validation: None,
                revisions: Vec::new(),
            });
            return TaskOutput {
                stage: stage.name,
                attempts: attempt,
                warnings,
                replaced: if regenerated {
                    vec![(target, case)]
                } else {
                    Vec::new()
                },
                outcome: Ok(artifact),
            };
        }

        if iteration >= config.novelty.max_regenerations {
            return failed_output(
                &stage.name,
                WeaverError::AuditRejected {
                    audit: stage.name.clone(),
                    target,
                    iterations: iteration,
                },
            );
        }
        iteration += 1;
        emitter.emit(PipelineEvent::RegenerationRequested {
            run_id: config.run_id.clone(),
            audit: stage.name.clone(),
            target: target.clone(),
            iteration,
        });

        let mut context = stage_context(&config, &store, &target_def, &artifacts);
        if let Some(score) = &report.most_similar {
            context.guidance.push(format!(
                "the previous case was too close to '{}' (similarity {:.2}); diverge in plot, cast, and solution",
                score.reference, score.similarity
            ));
        }
        let (limits, temperature) = limits_of(&config, &target_def);
        match executor
            .run_stage(&target_def, limits, temperature, &context)
            .await
        {
            Ok(result) => {
                artifacts.insert(target.clone(), result.artifact);
                regenerated = true;
            }
            Err(error) => return failed_output(&stage.name, error),
        }
    }
}

async fn run_prose(
    executor: StageExecutor,
    config: RunConfig,
    store: ArtifactStore,
    stage: StageDefinition,
    artifacts: BTreeMap<String, Artifact>,
) -> TaskOutput {
    // Dependencies are recognized by shape so custom plans keep working:
    // the outline carries `scenes`, the case carries `solution`.
    let dep = |key: &str| {
        stage
            .depends_on
            .iter()
            .filter_map(|d| artifacts.get(d))
            .find(|a| a.payload.get(key).is_some())
    };
    let Some(outline) = dep("scenes") else {
        return failed_output(
            &stage.name,
            WeaverError::DependencyFailure {
                stage: stage.name.clone(),
                upstream: stage::NARRATIVE_OUTLINE.into(),
            },
        );
    };
    let case_payload = dep("solution")
        .map(|a| a.payload.clone())
        .unwrap_or(Value::Null);
    let profiles_payload = dep("profiles")
        .map(|a| a.payload.clone())
        .unwrap_or(Value::Null);

    let scenes: Vec<Value> = outline
        .payload
        .get("scenes")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let scene_count = scenes.len();
    if scene_count == 0 {
        return failed_output(
            &stage.name,
            WeaverError::ValidationFailed {
                stage: stage.name.clone(),
                error_count: 1,
            },
        );
    }

    let batches = prose::plan_batches(scene_count, config.prose_batch_size);
    let semaphore = Arc::new(tokio::sync::Semaphore::new(config.prose_parallelism.max(1)));
    let mut batch_tasks: JoinSet<(usize, u32, Result<Artifact>)> = JoinSet::new();

    for batch in &batches {
        let batch = *batch;
        let executor = executor.clone();
        let config = config.clone();
        let store = store.clone();
        let stage = stage.clone();
        let semaphore = Arc::clone(&semaphore);
        let batch_scenes = scenes[batch.start..batch.end].to_vec();
        let case_payload = case_payload.clone();
        let profiles_payload = profiles_payload.clone();

        batch_tasks.spawn(async move {
            let Ok(_permit) = semaphore.acquire_owned().await else {
                return (
                    batch.index,
                    0,
                    Err(WeaverError::Other("prose scheduler closed".into())),
                );
            };
            let sub_stage = StageDefinition {
                name: format!("{}/batch{}", stage.name, batch.index),
                depends_on: Vec::new(),
                kind: stage.kind.clone(),
                max_generation_attempts: stage.max_generation_attempts,
                max_revision_attempts: stage.max_revision_attempts,
                temperature: stage.temperature,
                intent: stage.intent.clone(),
            };
            let mut context = stage_context(&config, &store, &sub_stage, &BTreeMap::new());
            context.upstream.insert(
                "narrative_outline".into(),
                json!({ "scenes": batch_scenes }),
            );
            context
                .upstream
                .insert("case_generation".into(), case_payload);
            context
                .upstream
                .insert("character_profiles".into(), profiles_payload);
            context.targets.insert("chapters".into(), batch.len());
            context.guidance.push(format!(
                "write exactly {} chapter(s), one per listed scene, keeping each scene_index",
                batch.len()
            ));
            let (limits, temperature) = limits_of(&config, &stage);
            let result = executor
                .run_stage(&sub_stage, limits, temperature, &context)
                .await;
            match result {
                Ok(done) => (batch.index, done.backend_attempts, Ok(done.artifact)),
                Err(error) => (batch.index, 0, Err(error)),
            }
        });
    }

    let mut completed: Vec<(usize, Value)> = Vec::new();
    let mut total_attempts = 0u32;
    let mut total_cost = 0.0;
    let mut total_latency = 0u64;
    while let Some(joined) = batch_tasks.join_next().await {
        match joined {
            Ok((index, batch_attempts, Ok(artifact))) => {
                total_attempts += batch_attempts;
                total_cost += artifact.cost;
                total_latency += artifact.latency_ms;
                completed.push((index, artifact.payload));
            }
            Ok((_, _, Err(error))) => return failed_output(&stage.name, error),
            Err(join_error) => {
                return failed_output(
                    &stage.name,
                    WeaverError::Other(format!("prose batch task aborted: {join_error}")),
                )
            }
        }
    }

    // Reassembly is by scene index, never completion order.
    let mut assembled = prose::assemble_chapters(completed);
    let invariant = prose::chapter_count_invariant(&assembled, scene_count);
    if !invariant.valid {
        tracing::error!(
            stage = %stage.name,
            error = %invariant.errors[0].message,
            "chapter count invariant violated"
        );
        return failed_output(
            &stage.name,
            WeaverError::ValidationFailed {
                stage: stage.name.clone(),
                error_count: invariant.error_count(),
            },
        );
    }

    // Coverage repair: at most one targeted pass, and gaps never fail the
    // stage. Without a case there are no story beats to probe for.
    let mut warnings = Vec::new();
    let mut gaps = if case_payload.is_object() {
        prose::check_coverage(&case_payload, &prose::full_text(&assembled))
    } else {
        Vec::new()
    };
    if !gaps.is_empty() {
        tracing::warn!(stage = %stage.name, gaps = gaps.len(), "prose coverage gaps found");
        let repair_stage = StageDefinition {
            name: format!("{}/repair", stage.name),
            depends_on: Vec::new(),
            kind: stage.kind.clone(),
            max_generation_attempts: 1,
            max_revision_attempts: 0,
            temperature: stage.temperature,
            intent: stage.intent.clone(),
        };
        let mut context = stage_context(&config, &store, &repair_stage, &BTreeMap::new());
        context
            .upstream
            .insert("draft_chapters".into(), assembled.clone());
        context
            .upstream
            .insert("case_generation".into(), case_payload.clone());
        context.targets.insert("chapters".into(), scene_count);
        context.guidance = prose::repair_guidance(&gaps);
        context.guidance.push(format!(
            "rewrite the draft chapters, keeping all {scene_count} of them and their scene_index values"
        ));
        let (_, temperature) = limits_of(&config, &stage);
        match executor
            .run_stage(
                &repair_stage,
                StageLimits {
                    max_generation_attempts: 1,
                    max_revision_attempts: 0,
                },
                temperature,
                &context,
            )
            .await
        {
            Ok(repaired) => {
                total_attempts += repaired.backend_attempts;
                total_cost += repaired.artifact.cost;
                total_latency += repaired.artifact.latency_ms;
                let repaired_ok =
                    prose::chapter_count_invariant(&repaired.artifact.payload, scene_count).valid;
                let repaired_gaps =
                    prose::check_coverage(&case_payload, &prose::full_text(&repaired.artifact.payload));
                if repaired_ok && repaired_gaps.len() < gaps.len() {
                    assembled = repaired.artifact.payload;
                    gaps = repaired_gaps;
                } else {
                    tracing::warn!(stage = %stage.name, "coverage repair did not improve; keeping draft");
                }
            }
            Err(error) => {
                warnings.push(format!("prose coverage repair failed: {error}"));
            }
        }
    }
    for gap in &gaps {
        warnings.push(format!("prose coverage gap ({}): {}", gap.rule, gap.detail));
    }

    let attempt = store.attempt_count(&config.run_id, &stage.name) + 1;
    let artifact = Artifact::draft(
        &stage.name,
        stage.schema_id().unwrap_or("prose_batch.v1"),
        attempt,
        assembled,
    )
    .with_charge(total_cost, total_latency)
    .accepted();
    store.record(StoredAttempt {
        run_id: config.run_id.clone(),
        stage: stage.name.clone(),
        attempt,
        artifact: artifact.clone(),
        validation: Some(invariant),
        revisions: Vec::new(),
    });

    TaskOutput {
        stage: stage.name,
        attempts: total_attempts,
        warnings,
        replaced: Vec::new(),
        outcome: Ok(artifact),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use caseweaver_gen::{GenerationBackend, GenerationRequest, GenerationResponse};
    use caseweaver_schema::SETTING_SCHEMA;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Routes responses by the `Stage: <name>` line the prompt builder
    /// always emits; serves each stage's scripted answers in order,
    /// repeating the last one when the script runs out.
    struct RoutedBackend {
        scripts: Mutex<HashMap<String, (Vec<String>, usize)>>,
        calls: AtomicUsize,
    }

    impl RoutedBackend {
        fn new(scripts: Vec<(&str, Vec<String>)>) -> Self {
            Self {
                scripts: Mutex::new(
                    scripts
                        .into_iter()
                        .map(|(stage, responses)| (stage.to_string(), (responses, 0)))
                        .collect(),
                ),
                calls: AtomicUsize::new(0),
            }
        }

        fn total_calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl GenerationBackend for RoutedBackend {
        fn name(&self) -> &str {
            "routed"
        }

        async fn generate(&self, request: &GenerationRequest) -> Result<GenerationResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let stage = request
                .prompt
                .lines()
                .find_map(|line| line.strip_prefix("Stage: "))
                .map(|s| {
                    s.trim_end_matches(" (revision)")
                        .split('/')
                        .next()
                        .unwrap_or(s)
                        .to_string()
                })
                .unwrap_or_default();
            let mut scripts = self.scripts.lock().unwrap();
            let Some((responses, cursor)) = scripts.get_mut(&stage) else {
                return Err(WeaverError::BackendError {
                    backend: "routed".into(),
                    status: 0,
                    message: format!("no script for stage '{stage}'"),
                    retryable: false,
                });
            };
            let text = responses[(*cursor).min(responses.len() - 1)].clone();
            *cursor += 1;
            Ok(GenerationResponse {
                text,
                model_id: "routed".into(),
                latency_ms: 3,
                token_cost: 0.01,
            })
        }
    }

    fn valid_setting() -> String {
        json!({
            "era": "1920s",
            "locale": "a fen-country manor",
            "locations": [{"name": "the boat house"}],
        })
        .to_string()
    }

    fn config(run_id: &str) -> RunConfig {
        RunConfig {
            run_id: run_id.into(),
            project_id: "p1".into(),
            ..RunConfig::default()
        }
    }

    fn setting_stage(name: &str, deps: &[&str]) -> StageDefinition {
        StageDefinition::generate(name, deps, SETTING_SCHEMA, "Refine the setting.")
    }

    #[tokio::test]
    async fn independent_stages_both_accept() {
        let backend = RoutedBackend::new(vec![
            ("left", vec![valid_setting()]),
            ("right", vec![valid_setting()]),
        ]);
        let plan = StagePlan::new(vec![
            setting_stage("left", &[]),
            setting_stage("right", &[]),
        ]);
        let orchestrator =
            Orchestrator::with_plan(DynBackend::new(backend), config("r1"), plan);
        let report = orchestrator.run().await.unwrap();
        assert_eq!(report.status_of("left"), Some(StageStatus::Accepted));
        assert_eq!(report.status_of("right"), Some(StageStatus::Accepted));
        assert_eq!(report.artifacts.len(), 2);
        assert!(report.run.total_cost > 0.0);
    }

    #[tokio::test]
    async fn fatal_stage_skips_transitive_dependents() {
        let backend = RoutedBackend::new(vec![
            ("a", vec!["not json at all ???".into(), "@@@".into()]),
            ("b", vec![valid_setting()]),
            ("c", vec![valid_setting()]),
            ("d", vec![valid_setting()]),
        ]);
        let mut a = setting_stage("a", &[]);
        a.max_generation_attempts = 2;
        a.max_revision_attempts = 0;
        let plan = StagePlan::new(vec![
            a,
            setting_stage("b", &["a"]),
            setting_stage("c", &["b"]),
            setting_stage("d", &[]),
        ]);
        let orchestrator =
            Orchestrator::with_plan(DynBackend::new(backend), config("r1"), plan);
        let report = orchestrator.run().await.unwrap();

        assert_eq!(report.status_of("a"), Some(StageStatus::Failed));
        assert_eq!(report.status_of("b"), Some(StageStatus::Skipped));
        assert_eq!(report.status_of("c"), Some(StageStatus::Skipped));
        // The independent branch still finishes.
        assert_eq!(report.status_of("d"), Some(StageStatus::Accepted));
        assert!(report
            .run
            .stages
            .iter()
            .find(|s| s.stage == "b")
            .unwrap()
            .failure
            .as_deref()
            .unwrap()
            .contains("upstream 'a'"));
        // Failed attempts are still charged.
        assert_eq!(orchestrator.ledger().entries().len(), 3);
    }

    #[tokio::test]
    async fn dependent_prompt_carries_upstream_payload() {
        struct LoggingBackend {
            inner: RoutedBackend,
            prompts: Arc<Mutex<Vec<String>>>,
        }

        #[async_trait]
        impl GenerationBackend for LoggingBackend {
            fn name(&self) -> &str {
                "logging"
            }
            async fn generate(&self, request: &GenerationRequest) -> Result<GenerationResponse> {
                self.prompts.lock().unwrap().push(request.prompt.clone());
                self.inner.generate(request).await
            }
        }

        let prompts = Arc::new(Mutex::new(Vec::new()));
        let backend = LoggingBackend {
            inner: RoutedBackend::new(vec![
                ("first", vec![valid_setting()]),
                ("second", vec![valid_setting()]),
            ]),
            prompts: Arc::clone(&prompts),
        };
        let plan = StagePlan::new(vec![
            setting_stage("first", &[]),
            setting_stage("second", &["first"]),
        ]);
        let orchestrator =
            Orchestrator::with_plan(DynBackend::new(backend), config("r1"), plan);
        let report = orchestrator.run().await.unwrap();
        assert_eq!(report.status_of("second"), Some(StageStatus::Accepted));

        let prompts = prompts.lock().unwrap();
        let second_prompt = prompts
            .iter()
            .find(|p| p.starts_with("Stage: second"))
            .expect("second stage prompt");
        assert!(second_prompt.contains("Upstream first"));
        assert!(second_prompt.contains("fen-country manor"));
    }

    #[tokio::test]
    async fn lint_failure_surfaces_before_any_call() {
        let backend = RoutedBackend::new(vec![]);
        let plan = StagePlan::new(vec![setting_stage("a", &["ghost"])]);
        let orchestrator =
            Orchestrator::with_plan(DynBackend::new(backend), config("r1"), plan);
        let err = orchestrator.run().await.unwrap_err();
        assert!(matches!(err, WeaverError::InvalidPlan(_)));
    }

    #[tokio::test]
    async fn routed_backend_repeats_last_response() {
        let backend = RoutedBackend::new(vec![("a", vec![valid_setting()])]);
        let request = GenerationRequest {
            prompt: "Stage: a\n".into(),
            temperature: 0.1,
            max_output_tokens: 10,
            structured_hint: None,
        };
        backend.generate(&request).await.unwrap();
        backend.generate(&request).await.unwrap();
        assert_eq!(backend.total_calls(), 2);
    }
}
