//! Read-only consistency auditors over completed artifacts.
//!
//! Auditors never mutate what they inspect; a negative verdict becomes
//! structured feedback into a bounded regeneration of the audited stage's
//! target, driven by the orchestrator.

pub mod fair_play;
pub mod novelty;

use serde::{Deserialize, Serialize};

use caseweaver_types::ConsistencyViolation;

/// Outcome of an audit pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuditVerdict {
    Pass,
    Fail,
    NeedsRevision,
}

impl std::fmt::Display for AuditVerdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AuditVerdict::Pass => "pass",
            AuditVerdict::Fail => "fail",
            AuditVerdict::NeedsRevision => "needs-revision",
        };
        f.write_str(s)
    }
}

/// Structured audit result, serialized as the audit stage's artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditReport {
    pub audit: String,
    pub verdict: AuditVerdict,
    pub violations: Vec<ConsistencyViolation>,
}

impl AuditReport {
    /// One feedback line per violation, for injection into a regeneration
    /// prompt.
    pub fn feedback_lines(&self) -> Vec<String> {
        self.violations
            .iter()
            .map(|v| format!("{} (at {}): {}", v.rule, v.location, v.suggestion))
            .collect()
    }
}
