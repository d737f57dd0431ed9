//! Prose batching, reassembly, and coverage repair.
//!
//! Prose generation is decomposed into scene batches that are validated and
//! retried independently, then reassembled by scene index under a strict
//! chapter-count invariant. After assembly a lightweight coverage check
//! probes the text for recoverable story gaps; gaps trigger at most one
//! repair generation and otherwise become non-blocking warnings.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::{json, Value};

use caseweaver_types::{ErrorKind, ValidationError, ValidationResult};

/// A half-open range of scene indices `[start, end)` assigned to one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SceneBatch {
    pub index: usize,
    pub start: usize,
    pub end: usize,
}

impl SceneBatch {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }
}

/// Split `scene_count` scenes into `ceil(scene_count / batch_size)` batches.
pub fn plan_batches(scene_count: usize, batch_size: usize) -> Vec<SceneBatch> {
    let batch_size = batch_size.max(1);
    (0..scene_count.div_ceil(batch_size))
        .map(|index| SceneBatch {
            index,
            start: index * batch_size,
            end: ((index + 1) * batch_size).min(scene_count),
        })
        .collect()
}

/// Reassemble batch payloads into one prose artifact, ordered by scene
/// index rather than completion order.
pub fn assemble_chapters(mut batches: Vec<(usize, Value)>) -> Value {
    batches.sort_by_key(|(index, _)| *index);
    let chapters: Vec<Value> = batches
        .into_iter()
        .flat_map(|(_, payload)| {
            payload
                .get("chapters")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default()
        })
        .collect();
    json!({
        "chapter_count": chapters.len(),
        "chapters": chapters,
    })
}

/// The concatenated chapter count must equal the outline's scene count
/// exactly.
pub fn chapter_count_invariant(assembled: &Value, scene_count: usize) -> ValidationResult {
    let actual = assembled
        .get("chapters")
        .and_then(Value::as_array)
        .map(Vec::len)
        .unwrap_or(0);
    if actual == scene_count {
        ValidationResult::ok()
    } else {
        ValidationResult::from_errors(
            vec![ValidationError::new(
                "/chapters",
                ErrorKind::CountMismatch,
                format!("assembled {actual} chapters, outline declares {scene_count} scenes"),
            )],
            Vec::new(),
        )
    }
}

/// All chapter text in scene order, for coverage probing.
pub fn full_text(assembled: &Value) -> String {
    assembled
        .get("chapters")
        .and_then(Value::as_array)
        .map(|chapters| {
            chapters
                .iter()
                .filter_map(|c| c.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n\n")
        })
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Coverage
// ---------------------------------------------------------------------------

/// A recoverable story gap found in assembled prose.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoverageGap {
    pub rule: String,
    pub detail: String,
}

fn elimination_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)\b(only \w+ (could|had|knew)|rules? out|ruled out|eliminat\w*|narrow\w* down|proves?|proved|proving)\b",
        )
        .expect("elimination regex")
    })
}

fn closure_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(confess\w*|arrest\w*|guilt\w*|expos\w*|caught|apprehend\w*)\b")
            .expect("closure regex")
    })
}

fn culprit_name(case: &Value) -> Option<String> {
    let culprit_id = case.pointer("/solution/culprit_id")?.as_str()?;
    case.get("suspects")?
        .as_array()?
        .iter()
        .find(|s| s.get("id").and_then(Value::as_str) == Some(culprit_id))?
        .get("name")?
        .as_str()
        .map(str::to_string)
}

/// Probe assembled prose for gaps the pipeline can still repair: a missing
/// discriminating-test realization and a missing culprit closure.
pub fn check_coverage(case: &Value, prose_text: &str) -> Vec<CoverageGap> {
    let mut gaps = Vec::new();

    if !elimination_regex().is_match(prose_text) {
        gaps.push(CoverageGap {
            rule: "discriminating_test_realization".into(),
            detail: "no elimination language; the discriminating test is never shown to bite"
                .into(),
        });
    }

    match culprit_name(case) {
        Some(name) => {
            let named = prose_text.contains(&name);
            if !named || !closure_regex().is_match(prose_text) {
                gaps.push(CoverageGap {
                    rule: "culprit_closure".into(),
                    detail: format!(
                        "the culprit '{name}' is never confronted with the evidence chain"
                    ),
                });
            }
        }
        None => gaps.push(CoverageGap {
            rule: "culprit_closure".into(),
            detail: "the case names no resolvable culprit".into(),
        }),
    }

    gaps
}

/// Guardrail lines appended to the single repair generation.
pub fn repair_guidance(gaps: &[CoverageGap]) -> Vec<String> {
    gaps.iter()
        .map(|gap| match gap.rule.as_str() {
            "discriminating_test_realization" => {
                "show the discriminating test on the page: a scene where the decisive \
comparison eliminates every other suspect"
                    .to_string()
            }
            "culprit_closure" => {
                "end with the culprit confronted: the evidence chain laid out and the \
culprit exposed, arrested, or confessing"
                    .to_string()
            }
            _ => gap.detail.clone(),
        })
        .collect()
}
