//! The Caseweaver pipeline engine.
//!
//! Turns a small set of high-level parameters into a fully elaborated,
//! internally consistent case plus derived artifacts (clues, outline,
//! prose) by running a DAG of generation stages under schema validation,
//! bounded retries, error-targeted revision, and cross-artifact consistency
//! audits.
//!
//! - [`stage`] — stage definitions, the default DAG, and the plan lint
//! - [`machine`] — the retry controller as a pure state machine
//! - [`executor`] — effect interpreter around the generation backend
//! - [`revision`] — grouped, bounded error reports for repair prompts
//! - [`orchestrator`] — dependency scheduling and audit feedback loops
//! - [`audit`] — fair-play and novelty auditors
//! - [`prose`] — scene batching, reassembly, coverage repair
//! - [`events`] / [`store`] — observability and append-only persistence

pub mod audit;
pub mod clue_rules;
pub mod config;
pub mod events;
pub mod executor;
pub mod machine;
pub mod orchestrator;
pub mod prompt;
pub mod prose;
pub mod revision;
pub mod stage;
pub mod store;

pub use audit::fair_play::{audit_fair_play, FairPlayConfig};
pub use audit::novelty::{audit_novelty, NoveltyConfig, NoveltyReport, NoveltyVerdict, ReferenceCase};
pub use audit::{AuditReport, AuditVerdict};
pub use config::{RunConfig, StageOverride};
pub use events::{EventEmitter, PipelineEvent};
pub use executor::{BackoffPolicy, ExecutorOptions, StageExecutor, StageResult, StageRun};
pub use machine::{step, AttemptEvent, AttemptState, Effect, Phase, StageLimits};
pub use orchestrator::{Orchestrator, RunReport};
pub use stage::{default_plan, lint, StageDefinition, StageKind, StagePlan};
pub use store::{ArtifactStore, StoredAttempt};
