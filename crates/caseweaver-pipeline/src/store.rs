//! Append-only artifact store.
//!
//! Every attempt of every stage is recorded as its own version, retrievable
//! by `(run_id, stage, attempt)` together with its validation result and
//! revision history. Versions are never mutated in place; acceptance and
//! failure both append. Cloning a store yields another handle to the same
//! underlying log.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use caseweaver_types::{Artifact, ArtifactStatus, RevisionRecord, ValidationResult};

/// One recorded attempt: the artifact version plus its provenance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredAttempt {
    pub run_id: String,
    pub stage: String,
    pub attempt: u32,
    pub artifact: Artifact,
    /// Absent when the attempt never reached validation (parse or backend
    /// failure).
    pub validation: Option<ValidationResult>,
    pub revisions: Vec<RevisionRecord>,
}

#[derive(Clone, Default)]
pub struct ArtifactStore {
    inner: Arc<Mutex<Vec<StoredAttempt>>>,
}

impl ArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<StoredAttempt>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn record(&self, attempt: StoredAttempt) {
        self.lock().push(attempt);
    }

    pub fn get(&self, run_id: &str, stage: &str, attempt: u32) -> Option<StoredAttempt> {
        self.lock()
            .iter()
            .find(|a| a.run_id == run_id && a.stage == stage && a.attempt == attempt)
            .cloned()
    }

    /// Every recorded version of a stage, in append order.
    pub fn history(&self, run_id: &str, stage: &str) -> Vec<StoredAttempt> {
        self.lock()
            .iter()
            .filter(|a| a.run_id == run_id && a.stage == stage)
            .cloned()
            .collect()
    }

    /// Number of attempts recorded for a stage.
    pub fn attempt_count(&self, run_id: &str, stage: &str) -> u32 {
        self.lock()
            .iter()
            .filter(|a| a.run_id == run_id && a.stage == stage)
            .count() as u32
    }

    /// The most recently accepted version of a stage, if any.
    pub fn latest_accepted(&self, run_id: &str, stage: &str) -> Option<Artifact> {
        self.lock()
            .iter()
            .rev()
            .find(|a| {
                a.run_id == run_id
                    && a.stage == stage
                    && a.artifact.status == ArtifactStatus::Accepted
            })
            .map(|a| a.artifact.clone())
    }

    /// Serialize the full log for external persistence.
    pub fn export(&self) -> serde_json::Value {
        serde_json::to_value(&*self.lock()).unwrap_or(serde_json::Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn stored(run: &str, stage: &str, attempt: u32, accepted: bool) -> StoredAttempt {
        let artifact = Artifact::draft(stage, "case.v1", attempt, json!({"attempt": attempt}));
        StoredAttempt {
            run_id: run.into(),
            stage: stage.into(),
            attempt,
            artifact: if accepted {
                artifact.accepted()
            } else {
                artifact.failed()
            },
            validation: Some(ValidationResult::ok()),
            revisions: Vec::new(),
        }
    }

    #[test]
    fn versions_are_retrievable_by_key() {
        let store = ArtifactStore::new();
        store.record(stored("r1", "case_generation", 1, false));
        store.record(stored("r1", "case_generation", 2, true));

        let v1 = store.get("r1", "case_generation", 1).unwrap();
        assert_eq!(v1.artifact.status, ArtifactStatus::Failed);
        assert_eq!(v1.artifact.payload["attempt"], 1);

        assert!(store.get("r1", "case_generation", 3).is_none());
        assert!(store.get("r2", "case_generation", 1).is_none());
    }

    #[test]
    fn history_preserves_append_order_and_failed_versions() {
        let store = ArtifactStore::new();
        store.record(stored("r1", "clue_distribution", 1, false));
        store.record(stored("r1", "clue_distribution", 2, false));
        store.record(stored("r1", "clue_distribution", 3, true));
        store.record(stored("r1", "case_generation", 1, true));

        let history = store.history("r1", "clue_distribution");
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].attempt, 1);
        assert_eq!(history[2].attempt, 3);
        assert_eq!(store.attempt_count("r1", "clue_distribution"), 3);
    }

    #[test]
    fn latest_accepted_skips_failed_versions() {
        let store = ArtifactStore::new();
        store.record(stored("r1", "case_generation", 1, true));
        store.record(stored("r1", "case_generation", 2, false));
        let latest = store.latest_accepted("r1", "case_generation").unwrap();
        assert_eq!(latest.attempt, 1);

        store.record(stored("r1", "case_generation", 3, true));
        let latest = store.latest_accepted("r1", "case_generation").unwrap();
        assert_eq!(latest.attempt, 3);
    }

    #[test]
    fn clone_shares_the_log() {
        let store = ArtifactStore::new();
        let handle = store.clone();
        handle.record(stored("r1", "s", 1, true));
        assert_eq!(store.attempt_count("r1", "s"), 1);
    }

    #[test]
    fn export_serializes_every_version() {
        let store = ArtifactStore::new();
        store.record(stored("r1", "s", 1, false));
        store.record(stored("r1", "s", 2, true));
        let exported = store.export();
        assert_eq!(exported.as_array().map(Vec::len), Some(2));
        assert_eq!(exported[0]["attempt"], 1);
    }
}
