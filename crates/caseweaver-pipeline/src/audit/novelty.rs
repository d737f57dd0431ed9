//! Novelty audit: weighted similarity against a reference corpus.
//!
//! The case is compared to each reference across five axes; the overall
//! similarity is the weighted sum and the verdict follows the banding:
//! below the warning threshold is a pass, a 10-point band above it is a
//! warning, anything beyond is a fail.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Axis weights: plot 30%, characters 25%, setting 15%, solution 25%,
/// structure 5%.
const AXIS_WEIGHTS: [(Axis, f64); 5] = [
    (Axis::Plot, 0.30),
    (Axis::Characters, 0.25),
    (Axis::Setting, 0.15),
    (Axis::Solution, 0.25),
    (Axis::Structure, 0.05),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Axis {
    Plot,
    Characters,
    Setting,
    Solution,
    Structure,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NoveltyConfig {
    /// Overall similarity at which a warning starts.
    pub warning_threshold: f64,
    /// Width of the warning band; fail starts at threshold + band.
    pub warning_band: f64,
    /// Bounded regenerations of the audited target on a fail verdict.
    pub max_regenerations: u32,
}

impl Default for NoveltyConfig {
    fn default() -> Self {
        Self {
            warning_threshold: 0.70,
            warning_band: 0.10,
            max_regenerations: 0,
        }
    }
}

/// One reference work, pre-decomposed into the comparison axes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferenceCase {
    pub title: String,
    pub plot: String,
    pub characters: String,
    pub setting: String,
    pub solution: String,
    pub structure: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoveltyVerdict {
    Pass,
    Warning,
    Fail,
}

impl std::fmt::Display for NoveltyVerdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NoveltyVerdict::Pass => "pass",
            NoveltyVerdict::Warning => "warning",
            NoveltyVerdict::Fail => "fail",
        };
        f.write_str(s)
    }
}

/// Serialized as the novelty stage's artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoveltyReport {
    pub verdict: NoveltyVerdict,
    /// The single most-similar reference and its overall similarity.
    pub most_similar: Option<SimilarityScore>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimilarityScore {
    pub reference: String,
    pub similarity: f64,
}

/// Verdict for an overall similarity under the configured banding.
pub fn verdict_for(similarity: f64, config: &NoveltyConfig) -> NoveltyVerdict {
    if similarity >= config.warning_threshold + config.warning_band {
        NoveltyVerdict::Fail
    } else if similarity >= config.warning_threshold {
        NoveltyVerdict::Warning
    } else {
        NoveltyVerdict::Pass
    }
}

/// Token-set Jaccard similarity between two texts.
fn jaccard(a: &str, b: &str) -> f64 {
    let tokens = |text: &str| -> HashSet<String> {
        text.to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| t.len() > 2)
            .map(str::to_string)
            .collect()
    };
    let set_a = tokens(a);
    let set_b = tokens(b);
    if set_a.is_empty() && set_b.is_empty() {
        return 0.0;
    }
    let intersection = set_a.intersection(&set_b).count() as f64;
    let union = set_a.union(&set_b).count() as f64;
    intersection / union
}

/// Decompose a case payload into the comparison axes.
fn case_axis(case: &Value, axis: Axis) -> String {
    let join_strings = |values: Vec<&str>| values.join(" ");
    match axis {
        Axis::Plot => {
            let facts = case
                .get("facts")
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter_map(|f| f.get("description").and_then(Value::as_str))
                        .collect()
                })
                .unwrap_or_default();
            join_strings(facts)
        }
        Axis::Characters => {
            let suspects = case
                .get("suspects")
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .flat_map(|s| {
                            ["name", "motive"]
                                .iter()
                                .filter_map(|k| s.get(k).and_then(Value::as_str))
                                .collect::<Vec<_>>()
                        })
                        .collect()
                })
                .unwrap_or_default();
            join_strings(suspects)
        }
        Axis::Setting => case
            .get("setting_summary")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string(),
        Axis::Solution => {
            let mut parts: Vec<&str> = case
                .pointer("/solution/inference_chain")
                .and_then(Value::as_array)
                .map(|chain| {
                    chain
                        .iter()
                        .filter_map(|s| s.get("claim").and_then(Value::as_str))
                        .collect()
                })
                .unwrap_or_default();
            if let Some(test) = case
                .pointer("/solution/discriminating_test/description")
                .and_then(Value::as_str)
            {
                parts.push(test);
            }
            join_strings(parts)
        }
        Axis::Structure => {
            let count = |key: &str| {
                case.get(key)
                    .and_then(Value::as_array)
                    .map(Vec::len)
                    .unwrap_or(0)
            };
            let chain = case
                .pointer("/solution/inference_chain")
                .and_then(Value::as_array)
                .map(Vec::len)
                .unwrap_or(0);
            format!(
                "facts{} suspects{} chain{}",
                count("facts"),
                count("suspects"),
                chain
            )
        }
    }
}

fn reference_axis(reference: &ReferenceCase, axis: Axis) -> &str {
    match axis {
        Axis::Plot => &reference.plot,
        Axis::Characters => &reference.characters,
        Axis::Setting => &reference.setting,
        Axis::Solution => &reference.solution,
        Axis::Structure => &reference.structure,
    }
}

/// Weighted overall similarity of a case against one reference.
pub fn overall_similarity(case: &Value, reference: &ReferenceCase) -> f64 {
    AXIS_WEIGHTS
        .iter()
        .map(|(axis, weight)| weight * jaccard(&case_axis(case, *axis), reference_axis(reference, *axis)))
        .sum()
}

pub fn audit_novelty(
    case: &Value,
    references: &[ReferenceCase],
    config: &NoveltyConfig,
) -> NoveltyReport {
    let most_similar = references
        .iter()
        .map(|reference| SimilarityScore {
            reference: reference.title.clone(),
            similarity: overall_similarity(case, reference),
        })
        .max_by(|a, b| a.similarity.total_cmp(&b.similarity));

    let verdict = match &most_similar {
        Some(score) => verdict_for(score.similarity, config),
        // An empty corpus has nothing to be derivative of.
        None => NoveltyVerdict::Pass,
    };

    NoveltyReport {
        verdict,
        most_similar,
    }
}
