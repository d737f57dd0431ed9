//! Fair-play audit: every fact needed to derive the solution must be
//! exposed before it is revealed.
//!
//! Four checks over the paired case and clue artifacts:
//! (a) every clue traces to a concrete case location,
//! (b) essential clues sit strictly before the discriminating-test point,
//! (c) every inference-chain step has supporting clue evidence,
//! (d) red herrings stay within budget and never contradict the facts the
//!     solution rests on.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use caseweaver_types::{ConsistencyViolation, ViolationSeverity};

use super::{AuditReport, AuditVerdict};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FairPlayConfig {
    pub max_red_herrings: usize,
}

impl Default for FairPlayConfig {
    fn default() -> Self {
        Self { max_red_herrings: 3 }
    }
}

fn placement_ordinal(placement: &str) -> u8 {
    match placement {
        "early" => 0,
        "mid" => 1,
        _ => 2,
    }
}

/// Resolve a slash path (`/facts/0`) inside a payload; array segments are
/// numeric indices.
fn resolve<'a>(payload: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = payload;
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        current = match current {
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            other => other.get(segment)?,
        };
    }
    Some(current)
}

/// The fact id a clue's source reference lands on, if it points into the
/// case's fact list.
fn referenced_fact_id<'a>(case: &'a Value, reference: &str) -> Option<&'a str> {
    resolve(case, reference)?.get("id")?.as_str()
}

pub fn audit_fair_play(case: &Value, clues: &Value, config: &FairPlayConfig) -> AuditReport {
    let mut violations = Vec::new();
    let empty = Vec::new();
    let clue_items = clues
        .get("clues")
        .and_then(Value::as_array)
        .unwrap_or(&empty);

    // (a) traceability: every clue resolves to a concrete case location.
    for (i, clue) in clue_items.iter().enumerate() {
        let reference = clue
            .get("source_reference")
            .and_then(Value::as_str)
            .unwrap_or("");
        if reference.is_empty() || resolve(case, reference).is_none() {
            violations.push(ConsistencyViolation {
                severity: ViolationSeverity::Critical,
                rule: "clue_traceability".into(),
                location: format!("/clues/{i}"),
                suggestion: format!(
                    "point source_reference at an existing case location instead of '{reference}'"
                ),
            });
        }
    }

    // (b) essential clues strictly before the discriminating-test point.
    let test_point = case
        .pointer("/solution/discriminating_test/placement")
        .and_then(Value::as_str)
        .map(placement_ordinal)
        .unwrap_or(2);
    for (i, clue) in clue_items.iter().enumerate() {
        let essential = clue.get("criticality").and_then(Value::as_str) == Some("essential");
        if !essential {
            continue;
        }
        let placement = clue
            .get("placement")
            .and_then(Value::as_str)
            .unwrap_or("late");
        if placement_ordinal(placement) >= test_point {
            violations.push(ConsistencyViolation {
                severity: ViolationSeverity::Critical,
                rule: "essential_before_test".into(),
                location: format!("/clues/{i}/placement"),
                suggestion: format!(
                    "move this essential clue before the discriminating test (currently {placement})"
                ),
            });
        }
    }

    // (c) every inference-chain step has supporting clue evidence.
    let covered: HashSet<&str> = clue_items
        .iter()
        .filter(|c| c.get("category").and_then(Value::as_str) != Some("red_herring"))
        .filter_map(|c| c.get("source_reference").and_then(Value::as_str))
        .filter_map(|r| referenced_fact_id(case, r))
        .collect();
    if let Some(chain) = case
        .pointer("/solution/inference_chain")
        .and_then(Value::as_array)
    {
        for (i, step) in chain.iter().enumerate() {
            let fact_ids: Vec<&str> = step
                .get("fact_ids")
                .and_then(Value::as_array)
                .map(|ids| ids.iter().filter_map(Value::as_str).collect())
                .unwrap_or_default();
            if !fact_ids.iter().any(|id| covered.contains(id)) {
                violations.push(ConsistencyViolation {
                    severity: ViolationSeverity::Critical,
                    rule: "inference_support".into(),
                    location: format!("/solution/inference_chain/{i}"),
                    suggestion: format!(
                        "add a clue exposing one of the facts this step rests on ({})",
                        fact_ids.join(", ")
                    ),
                });
            }
        }
    }

    // (d) red herrings: within budget, and never pointing at a fact the
    // solution rests on.
    let solution_facts: HashSet<&str> = case
        .pointer("/solution/inference_chain")
        .and_then(Value::as_array)
        .map(|chain| {
            chain
                .iter()
                .filter_map(|s| s.get("fact_ids").and_then(Value::as_array))
                .flatten()
                .filter_map(Value::as_str)
                .collect()
        })
        .unwrap_or_default();
    let mut red_herrings = 0usize;
    for (i, clue) in clue_items.iter().enumerate() {
        if clue.get("category").and_then(Value::as_str) != Some("red_herring") {
            continue;
        }
        red_herrings += 1;
        let reference = clue
            .get("source_reference")
            .and_then(Value::as_str)
            .unwrap_or("");
        if let Some(fact_id) = referenced_fact_id(case, reference) {
            if solution_facts.contains(fact_id) {
                violations.push(ConsistencyViolation {
                    severity: ViolationSeverity::Moderate,
                    rule: "red_herring_contradiction".into(),
                    location: format!("/clues/{i}"),
                    suggestion: format!(
                        "this red herring points at fact '{fact_id}', which the solution rests on; aim it elsewhere"
                    ),
                });
            }
        }
    }
    if red_herrings > config.max_red_herrings {
        violations.push(ConsistencyViolation {
            severity: ViolationSeverity::Moderate,
            rule: "red_herring_budget".into(),
            location: "/clues".into(),
            suggestion: format!(
                "{red_herrings} red herrings exceed the budget of {}",
                config.max_red_herrings
            ),
        });
    }

    let verdict = if violations.is_empty() {
        AuditVerdict::Pass
    } else if violations
        .iter()
        .any(|v| v.severity == ViolationSeverity::Critical)
    {
        AuditVerdict::Fail
    } else {
        AuditVerdict::NeedsRevision
    };

    AuditReport {
        audit: "fair_play".into(),
        verdict,
        violations,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn case() -> Value {
        json!({
            "title": "The Glasshouse Affair",
            "victim": "Edmund Kerr",
            "setting_summary": "A conservatory estate",
            "facts": [
                {"id": "f1", "description": "A bloodstained glove under the fern bench"},
                {"id": "f2", "description": "The conservatory key was copied"},
                {"id": "f3", "description": "Muddy boots by the servant stair"},
            ],
            "suspects": [
                {"id": "s1", "name": "Amos Vane", "motive": "debt"},
                {"id": "s2", "name": "Livia Crane", "motive": "inheritance"},
            ],
            "solution": {
                "culprit_id": "s1",
                "inference_chain": [
                    {"claim": "Only Vane had glasshouse access", "fact_ids": ["f2"]},
                    {"claim": "The glove matches Vane", "fact_ids": ["f1"]},
                ],
                "discriminating_test": {
                    "description": "Compare glove stitching to Vane's tailor records",
                    "placement": "late",
                },
            },
        })
    }

    fn clue(id: &str, reference: &str, placement: &str, criticality: &str, category: &str) -> Value {
        json!({
            "id": id,
            "description": "d",
            "category": category,
            "source_reference": reference,
            "placement": placement,
            "criticality": criticality,
        })
    }

    fn clues(items: Vec<Value>) -> Value {
        json!({ "clue_count": items.len(), "clues": items })
    }

    #[test]
    fn well_formed_distribution_passes() {
        let clues = clues(vec![
            clue("c1", "/facts/0", "early", "essential", "physical"),
            clue("c2", "/facts/1", "mid", "essential", "documentary"),
            clue("c3", "/facts/2", "late", "optional", "red_herring"),
        ]);
        let report = audit_fair_play(&case(), &clues, &FairPlayConfig::default());
        assert_eq!(report.verdict, AuditVerdict::Pass);
        assert!(report.violations.is_empty());
    }

    #[test]
    fn unresolvable_reference_is_critical() {
        let clues = clues(vec![
            clue("c1", "/facts/9", "early", "essential", "physical"),
            clue("c2", "/facts/1", "mid", "essential", "documentary"),
            clue("c3", "/facts/0", "early", "supporting", "physical"),
        ]);
        let report = audit_fair_play(&case(), &clues, &FairPlayConfig::default());
        assert_eq!(report.verdict, AuditVerdict::Fail);
        assert!(report
            .violations
            .iter()
            .any(|v| v.rule == "clue_traceability" && v.location == "/clues/0"));
    }

    #[test]
    fn empty_reference_is_critical() {
        let clues = clues(vec![clue("c1", "", "early", "supporting", "physical")]);
        let report = audit_fair_play(&case(), &clues, &FairPlayConfig::default());
        assert!(report
            .violations
            .iter()
            .any(|v| v.rule == "clue_traceability"));
    }

    #[test]
    fn essential_clue_at_test_point_fails() {
        // Discriminating test is late; a late essential clue is not strictly
        // before it.
        let clues = clues(vec![
            clue("c1", "/facts/0", "late", "essential", "physical"),
            clue("c2", "/facts/1", "mid", "essential", "documentary"),
        ]);
        let report = audit_fair_play(&case(), &clues, &FairPlayConfig::default());
        assert!(report
            .violations
            .iter()
            .any(|v| v.rule == "essential_before_test"));
    }

    #[test]
    fn unsupported_inference_step_fails() {
        // No clue exposes f2, which the first chain step rests on.
        let clues = clues(vec![clue("c1", "/facts/0", "early", "essential", "physical")]);
        let report = audit_fair_play(&case(), &clues, &FairPlayConfig::default());
        assert_eq!(report.verdict, AuditVerdict::Fail);
        assert!(report.violations.iter().any(
            |v| v.rule == "inference_support" && v.location == "/solution/inference_chain/0"
        ));
    }

    #[test]
    fn red_herring_does_not_count_as_support() {
        // f2 is only "exposed" by a red herring; the step is unsupported.
        let clues = clues(vec![
            clue("c1", "/facts/0", "early", "essential", "physical"),
            clue("c2", "/facts/1", "mid", "optional", "red_herring"),
        ]);
        let report = audit_fair_play(&case(), &clues, &FairPlayConfig::default());
        assert!(report
            .violations
            .iter()
            .any(|v| v.rule == "inference_support"));
    }

    #[test]
    fn red_herring_budget_and_contradiction_are_moderate() {
        let config = FairPlayConfig { max_red_herrings: 1 };
        let clues = clues(vec![
            clue("c1", "/facts/0", "early", "essential", "physical"),
            clue("c2", "/facts/1", "mid", "essential", "documentary"),
            // Points at f1, which the solution rests on.
            clue("c3", "/facts/0", "mid", "optional", "red_herring"),
            clue("c4", "/facts/2", "late", "optional", "red_herring"),
        ]);
        let report = audit_fair_play(&case(), &clues, &config);
        assert_eq!(report.verdict, AuditVerdict::NeedsRevision);
        assert!(report
            .violations
            .iter()
            .any(|v| v.rule == "red_herring_contradiction"));
        assert!(report
            .violations
            .iter()
            .any(|v| v.rule == "red_herring_budget"));
        assert!(report
            .violations
            .iter()
            .all(|v| v.severity == ViolationSeverity::Moderate));
    }

    #[test]
    fn feedback_lines_carry_rule_and_location() {
        let clues = clues(vec![clue("c1", "/facts/9", "early", "supporting", "physical")]);
        let report = audit_fair_play(&case(), &clues, &FairPlayConfig::default());
        let feedback = report.feedback_lines();
        assert!(feedback
            .iter()
            .any(|line| line.contains("clue_traceability") && line.contains("/clues/0")));
    }
}
