//! Run configuration.
//!
//! Everything a run needs beyond the backend itself: identifiers, the
//! opaque domain parameters passed through to prompts untouched, retry and
//! batching knobs, audit thresholds, and per-stage overrides. Deserialized
//! from JSON by the CLI; every field has a default.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use caseweaver_schema::PlaceholderPolicy;

use crate::audit::fair_play::FairPlayConfig;
use crate::audit::novelty::{NoveltyConfig, ReferenceCase};

/// Per-stage overrides of the plan's defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StageOverride {
    pub max_generation_attempts: Option<u32>,
    pub max_revision_attempts: Option<u32>,
    pub temperature: Option<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub run_id: String,
    pub project_id: String,
    /// Opaque domain parameters (setting, era, tone, ...). Passed through
    /// to prompts untouched; the core never interprets them.
    pub domain: serde_json::Value,
    pub placeholder_policy: PlaceholderPolicy,
    pub prose_batch_size: usize,
    /// Concurrency cap for prose scene batches.
    pub prose_parallelism: usize,
    pub request_timeout_ms: u64,
    pub max_output_tokens: u32,
    /// Bounded backoff retries for transient backend faults, per attempt.
    pub transient_retries: usize,
    /// Bounded clue regenerations driven by the fair-play audit.
    pub fair_play_max_regenerations: u32,
    pub fair_play: FairPlayConfig,
    pub novelty: NoveltyConfig,
    pub references: Vec<ReferenceCase>,
    pub stages: HashMap<String, StageOverride>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            run_id: String::new(),
            project_id: String::new(),
            domain: serde_json::Value::Null,
            placeholder_policy: PlaceholderPolicy::default(),
            prose_batch_size: 5,
            prose_parallelism: 2,
            request_timeout_ms: 60_000,
            max_output_tokens: 4_096,
            transient_retries: 2,
            fair_play_max_regenerations: 1,
            fair_play: FairPlayConfig::default(),
            novelty: NoveltyConfig::default(),
            references: Vec::new(),
            stages: HashMap::new(),
        }
    }
}

impl RunConfig {
    /// Apply any override for `stage` onto the plan's defaults.
    pub fn limits_for(&self, stage: &crate::stage::StageDefinition) -> (u32, u32, f32) {
        let over = self.stages.get(&stage.name);
        (
            over.and_then(|o| o.max_generation_attempts)
                .unwrap_or(stage.max_generation_attempts),
            over.and_then(|o| o.max_revision_attempts)
                .unwrap_or(stage.max_revision_attempts),
            over.and_then(|o| o.temperature).unwrap_or(stage.temperature),
        )
    }
}
