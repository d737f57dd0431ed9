//! Shared types, errors, and cross-cutting services for the Caseweaver pipeline engine.
//!
//! This crate provides the foundational types used across all other Caseweaver crates:
//! - `WeaverError` — unified error taxonomy
//! - `Artifact` — immutable, versioned stage output
//! - `ValidationResult` / `RevisionRecord` — validation and repair provenance
//! - `CostLedger` — append-only cost/latency accounting threaded through a run
//! - `variation_seed` — deterministic per-attempt variation seeds

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// Unified error type for all Caseweaver subsystems.
#[derive(Debug, thiserror::Error)]
pub enum WeaverError {
    // === Generation backend errors ===
    #[error("Backend {backend} returned status {status}: {message}")]
    BackendError {
        backend: String,
        status: u16,
        message: String,
        retryable: bool,
    },

    #[error("Rate limited by {backend}, retry after {retry_after_ms}ms")]
    RateLimited {
        backend: String,
        retry_after_ms: u64,
    },

    #[error("Request to {backend} timed out after {timeout_ms}ms")]
    RequestTimeout { backend: String, timeout_ms: u64 },

    // === Parsing / validation ===
    #[error("Stage '{stage}' produced unparseable output: {message}")]
    ParseError { stage: String, message: String },

    #[error("Unknown schema id '{schema_id}'")]
    SchemaUnknown { schema_id: String },

    #[error("Stage '{stage}' failed validation with {error_count} errors")]
    ValidationFailed { stage: String, error_count: usize },

    // === Retry / revision ===
    #[error("Revision exhausted for stage '{stage}' after {attempts} attempts")]
    RevisionExhausted { stage: String, attempts: u32 },

    #[error("Revision regressed for stage '{stage}': {before} errors before, {after} after")]
    RevisionRegressed {
        stage: String,
        before: usize,
        after: usize,
    },

    // === Audits / pipeline ===
    #[error("Audit '{audit}' rejected stage '{target}' after {iterations} regeneration(s)")]
    AuditRejected {
        audit: String,
        target: String,
        iterations: u32,
    },

    #[error("Stage '{stage}' skipped: upstream '{upstream}' did not complete")]
    DependencyFailure { stage: String, upstream: String },

    #[error("Pipeline plan invalid: {0}")]
    InvalidPlan(String),

    // === Generic ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl WeaverError {
    /// Returns `true` if the error is transient and the operation may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            WeaverError::RateLimited { .. }
                | WeaverError::RequestTimeout { .. }
                | WeaverError::BackendError {
                    retryable: true,
                    ..
                }
        )
    }

    /// Returns `true` if the error halts the stage and its transitive dependents.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            WeaverError::RevisionExhausted { .. }
                | WeaverError::RevisionRegressed { .. }
                | WeaverError::AuditRejected { .. }
                | WeaverError::DependencyFailure { .. }
                | WeaverError::SchemaUnknown { .. }
                | WeaverError::InvalidPlan(_)
        )
    }
}

/// A convenience alias for `Result<T, WeaverError>`.
pub type Result<T> = std::result::Result<T, WeaverError>;

// ---------------------------------------------------------------------------
// Validation types
// ---------------------------------------------------------------------------

/// Category of a single validation error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    MissingRequired,
    TypeMismatch,
    EnumViolation,
    CrossFieldMismatch,
    CountMismatch,
}

/// One validation error with the field path it applies to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationError {
    pub path: String,
    pub kind: ErrorKind,
    pub message: String,
}

impl ValidationError {
    pub fn new(path: impl Into<String>, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind,
            message: message.into(),
        }
    }
}

/// The outcome of validating a candidate against a schema.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    /// A passing result with no errors or warnings.
    pub fn ok() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    /// Build a result from collected errors and warnings; `valid` is derived.
    pub fn from_errors(errors: Vec<ValidationError>, warnings: Vec<String>) -> Self {
        Self {
            valid: errors.is_empty(),
            errors,
            warnings,
        }
    }

    pub fn error_count(&self) -> usize {
        self.errors.len()
    }
}

// ---------------------------------------------------------------------------
// Artifact — immutable, versioned stage output
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactStatus {
    Draft,
    Accepted,
    Failed,
}

/// User-visible terminal status of a pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Accepted,
    Failed,
    Skipped,
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StageStatus::Accepted => "accepted",
            StageStatus::Failed => "failed",
            StageStatus::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// One versioned payload produced by a stage attempt. Never mutated in place;
/// a new attempt produces a new `Artifact` value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub stage: String,
    pub schema_id: String,
    pub attempt: u32,
    pub status: ArtifactStatus,
    pub payload: serde_json::Value,
    pub cost: f64,
    pub latency_ms: u64,
    pub revised: bool,
    pub revision_count: u32,
    pub created_at: DateTime<Utc>,
}

impl Artifact {
    /// Create a draft artifact for the given stage attempt.
    pub fn draft(
        stage: impl Into<String>,
        schema_id: impl Into<String>,
        attempt: u32,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            stage: stage.into(),
            schema_id: schema_id.into(),
            attempt,
            status: ArtifactStatus::Draft,
            payload,
            cost: 0.0,
            latency_ms: 0,
            revised: false,
            revision_count: 0,
            created_at: Utc::now(),
        }
    }

    pub fn accepted(mut self) -> Self {
        self.status = ArtifactStatus::Accepted;
        self
    }

    pub fn failed(mut self) -> Self {
        self.status = ArtifactStatus::Failed;
        self
    }

    pub fn with_charge(mut self, cost: f64, latency_ms: u64) -> Self {
        self.cost = cost;
        self.latency_ms = latency_ms;
        self
    }

    /// Record how many revision passes contributed to this version.
    pub fn with_revisions(mut self, revision_count: u32) -> Self {
        self.revised = revision_count > 0;
        self.revision_count = revision_count;
        self
    }
}

// ---------------------------------------------------------------------------
// Revision provenance
// ---------------------------------------------------------------------------

/// Human-auditable record of one revision attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevisionRecord {
    pub attempt: u32,
    pub error_count_before: usize,
    pub error_count_after: usize,
    pub applied_fixes: Vec<String>,
}

/// The error count across a revision sequence must never increase.
pub fn revision_counts_non_increasing(records: &[RevisionRecord]) -> bool {
    records
        .windows(2)
        .all(|w| w[1].error_count_before >= w[1].error_count_after)
        && records
            .iter()
            .all(|r| r.error_count_after <= r.error_count_before)
}

// ---------------------------------------------------------------------------
// Consistency violations (auditor output)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationSeverity {
    Critical,
    Moderate,
    Minor,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsistencyViolation {
    pub severity: ViolationSeverity,
    pub rule: String,
    pub location: String,
    pub suggestion: String,
}

// ---------------------------------------------------------------------------
// CostLedger — append-only accounting, threaded through the run explicitly
// ---------------------------------------------------------------------------

/// The cost and latency of one backend attempt, successful or not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptCharge {
    pub stage: String,
    pub attempt: u32,
    pub cost: f64,
    pub latency_ms: u64,
    pub succeeded: bool,
}

/// Per-stage aggregate view over the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageCostSummary {
    pub stage: String,
    pub attempts: usize,
    pub cost: f64,
    pub latency_ms: u64,
}

/// Append-only ledger of attempt charges.
///
/// Cloning yields another handle to the **same** ledger. Appends are atomic;
/// no lock is held across a suspension point.
#[derive(Clone, Default)]
pub struct CostLedger {
    inner: Arc<Mutex<Vec<AttemptCharge>>>,
}

impl CostLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<AttemptCharge>> {
        // A poisoned ledger still holds valid append-only data.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn record(&self, charge: AttemptCharge) {
        self.lock().push(charge);
    }

    /// Total cost over every attempt, failed ones included.
    pub fn total_cost(&self) -> f64 {
        self.lock().iter().map(|c| c.cost).sum()
    }

    /// Total latency over every attempt, failed ones included.
    pub fn total_latency_ms(&self) -> u64 {
        self.lock().iter().map(|c| c.latency_ms).sum()
    }

    /// Snapshot of all charges in append order.
    pub fn entries(&self) -> Vec<AttemptCharge> {
        self.lock().clone()
    }

    /// Aggregate charges by stage name, sorted by stage.
    pub fn summary_by_stage(&self) -> Vec<StageCostSummary> {
        let mut by_stage: BTreeMap<String, StageCostSummary> = BTreeMap::new();
        for charge in self.lock().iter() {
            let entry = by_stage
                .entry(charge.stage.clone())
                .or_insert_with(|| StageCostSummary {
                    stage: charge.stage.clone(),
                    attempts: 0,
                    cost: 0.0,
                    latency_ms: 0,
                });
            entry.attempts += 1;
            entry.cost += charge.cost;
            entry.latency_ms += charge.latency_ms;
        }
        by_stage.into_values().collect()
    }
}

// ---------------------------------------------------------------------------
// Run-level records
// ---------------------------------------------------------------------------

/// Execution log entry for one stage of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage: String,
    pub status: StageStatus,
    pub attempts: u32,
    pub revised: bool,
    pub revision_count: u32,
    pub cost: f64,
    pub latency_ms: u64,
    pub failure: Option<String>,
}

/// Top-level record of a completed pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub run_id: String,
    pub project_id: String,
    pub stages: Vec<StageRecord>,
    pub total_cost: f64,
    pub total_latency_ms: u64,
}

// ---------------------------------------------------------------------------
// Variation seeds
// ---------------------------------------------------------------------------

/// Deterministic variation seed for a (run, stage, attempt) triple.
///
/// FNV-1a over the identifying bytes, finalized with a splitmix64-style mixer
/// so consecutive attempts land far apart.
pub fn variation_seed(run_id: &str, stage: &str, attempt: u32) -> u64 {
    let mut hash = 0xcbf29ce484222325_u64;
    let bytes = run_id
        .bytes()
        .chain(std::iter::once(0u8))
        .chain(stage.bytes())
        .chain(std::iter::once(0u8))
        .chain(attempt.to_le_bytes());
    for byte in bytes {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x100000001b3);
    }
    mix64(hash)
}

fn mix64(mut x: u64) -> u64 {
    x = (x ^ (x >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94d049bb133111eb);
    x ^ (x >> 31)
}

/// Map a seed onto the uniform unit interval.
pub fn seed_fraction(seed: u64) -> f64 {
    (seed >> 11) as f64 / (1u64 << 53) as f64
}

/// Short hex tag for embedding a seed in a prompt.
pub fn variation_tag(seed: u64) -> String {
    format!("{seed:016x}")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
