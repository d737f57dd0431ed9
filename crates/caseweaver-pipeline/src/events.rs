//! Pipeline event channel for observability.
//!
//! Every attempt, transition, and audit emits a [`PipelineEvent`] on a
//! [`tokio::sync::broadcast`] channel; telemetry sinks subscribe without
//! coupling to the orchestrator internals.

use serde::{Deserialize, Serialize};

/// Events emitted during a pipeline run, keyed by run/project/stage/attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum PipelineEvent {
    RunStarted {
        run_id: String,
        project_id: String,
        stage_count: usize,
    },
    RunCompleted {
        run_id: String,
        accepted: usize,
        failed: usize,
        skipped: usize,
        total_cost: f64,
    },
    StageStarted {
        run_id: String,
        stage: String,
    },
    StageAccepted {
        run_id: String,
        stage: String,
        attempt: u32,
        revised: bool,
    },
    StageFailed {
        run_id: String,
        stage: String,
        error: String,
    },
    StageSkipped {
        run_id: String,
        stage: String,
        upstream: String,
    },
    RequestStarted {
        run_id: String,
        project_id: String,
        stage: String,
        attempt: u32,
    },
    ResponseReceived {
        run_id: String,
        stage: String,
        attempt: u32,
        model_id: String,
        latency_ms: u64,
    },
    AttemptFailed {
        run_id: String,
        stage: String,
        attempt: u32,
        reason: String,
    },
    RevisionApplied {
        run_id: String,
        stage: String,
        attempt: u32,
        errors_before: usize,
        errors_after: usize,
    },
    AuditCompleted {
        run_id: String,
        audit: String,
        verdict: String,
        violations: usize,
    },
    RegenerationRequested {
        run_id: String,
        audit: String,
        target: String,
        iteration: u32,
    },
}

/// Event emitter wrapping a broadcast sender.
#[derive(Clone)]
pub struct EventEmitter {
    sender: tokio::sync::broadcast::Sender<PipelineEvent>,
}

impl EventEmitter {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit to all current subscribers. With no receivers the event is
    /// silently dropped.
    pub fn emit(&self, event: PipelineEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<PipelineEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}
