//! Prompt assembly for generation and revision attempts.
//!
//! Prompts are plain text with labelled sections: stage intent, opaque
//! domain configuration, digests of upstream artifacts, the output
//! contract derived from the schema, a deterministic variation tag, and —
//! on retries — the grouped error summary from the prior attempt.

use std::collections::BTreeMap;

use serde_json::Value;

use caseweaver_schema::{schema_outline, Schema};

use crate::revision::ErrorReport;
use crate::stage::StageDefinition;

/// Upper bound on the serialized size of a single upstream digest.
const DIGEST_BUDGET: usize = 4_000;

/// Compact JSON digest of an artifact payload, truncated on a char
/// boundary when it exceeds the budget.
pub fn digest(payload: &Value, budget: usize) -> String {
    let mut text = payload.to_string();
    if text.len() > budget {
        let mut cut = budget;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
        text.push_str("...(truncated)");
    }
    text
}

pub fn generation_prompt(
    stage: &StageDefinition,
    schema: &Schema,
    domain: &Value,
    upstream: &BTreeMap<String, Value>,
    variation_tag: &str,
    guidance: &[String],
    prior_errors: Option<&ErrorReport>,
) -> String {
    let mut sections = vec![
        format!("Stage: {}", stage.name),
        stage.intent.clone(),
    ];
    if !domain.is_null() {
        sections.push(format!("Project parameters:\n{}", digest(domain, DIGEST_BUDGET)));
    }
    for (name, payload) in upstream {
        sections.push(format!("Upstream {name}:\n{}", digest(payload, DIGEST_BUDGET)));
    }
    if !guidance.is_empty() {
        sections.push(format!("Additional requirements:\n- {}", guidance.join("\n- ")));
    }
    if let Some(report) = prior_errors {
        sections.push(format!(
            "Your previous attempt failed validation. Fix all of the following:\n{}",
            report.render()
        ));
    }
    sections.push(format!(
        "Respond with a single JSON object. Fields:\n{}",
        schema_outline(schema)
    ));
    sections.push(format!("Variation tag: {variation_tag}"));
    sections.join("\n\n")
}

pub fn revision_prompt(
    stage: &StageDefinition,
    schema: &Schema,
    candidate: Option<&Value>,
    report: &ErrorReport,
) -> String {
    let mut sections = vec![
        format!("Stage: {} (revision)", stage.name),
        stage.intent.clone(),
    ];
    match candidate {
        Some(value) => {
            sections.push(format!(
                "This artifact failed validation:\n{}",
                digest(value, DIGEST_BUDGET * 2)
            ));
            sections.push(format!(
                "Patch only the problems listed below. Keep every field that is \
not mentioned exactly as it is.\n{}",
                report.render()
            ));
        }
        None => {
            // Escalation from a parse failure: there is nothing to patch.
            sections.push(
                "The previous attempts produced no parseable artifact. Produce a \
complete, valid artifact from scratch."
                    .into(),
            );
        }
    }
    sections.push(format!(
        "Respond with a single JSON object. Fields:\n{}",
        schema_outline(schema)
    ));
    sections.join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use caseweaver_schema::{FieldKind, Schema};
    use caseweaver_types::{ErrorKind, ValidationError};
    use serde_json::json;

    fn stage() -> StageDefinition {
        StageDefinition::generate(
            "case_generation",
            &[],
            "case.v1",
            "Assemble the full case.",
        )
    }

    fn schema() -> Schema {
        Schema::new("case.v1").field("title", true, FieldKind::Text)
    }

    #[test]
    fn generation_prompt_carries_all_sections() {
        let mut upstream = BTreeMap::new();
        upstream.insert("cast_design".to_string(), json!({"cast_size": 4}));
        let prompt = generation_prompt(
            &stage(),
            &schema(),
            &json!({"tone": "gothic"}),
            &upstream,
            "00c0ffee00c0ffee",
            &["keep red herrings to two".to_string()],
            None,
        );
        assert!(prompt.starts_with("Stage: case_generation"));
        assert!(prompt.contains("Assemble the full case."));
        assert!(prompt.contains(r#"{"tone":"gothic"}"#));
        assert!(prompt.contains("Upstream cast_design"));
        assert!(prompt.contains("keep red herrings to two"));
        assert!(prompt.contains("- title: string (required)"));
        assert!(prompt.contains("Variation tag: 00c0ffee00c0ffee"));
        assert!(!prompt.contains("previous attempt"));
    }

    #[test]
    fn retry_prompt_includes_error_summary() {
        let errors = vec![ValidationError::new(
            "/title",
            ErrorKind::MissingRequired,
            "required field 'title' is missing",
        )];
        let report = ErrorReport::build(&errors, 5);
        let prompt = generation_prompt(
            &stage(),
            &schema(),
            &Value::Null,
            &BTreeMap::new(),
            "tag",
            &[],
            Some(&report),
        );
        assert!(prompt.contains("previous attempt failed validation"));
        assert!(prompt.contains("/title"));
    }

    #[test]
    fn revision_prompt_instructs_patching() {
        let errors = vec![ValidationError::new(
            "/title",
            ErrorKind::MissingRequired,
            "missing",
        )];
        let report = ErrorReport::build(&errors, 5);
        let prompt = revision_prompt(&stage(), &schema(), Some(&json!({"victim": "Kerr"})), &report);
        assert!(prompt.contains("(revision)"));
        assert!(prompt.contains(r#"{"victim":"Kerr"}"#));
        assert!(prompt.contains("Patch only the problems"));
    }

    #[test]
    fn revision_prompt_without_candidate_asks_for_fresh_artifact() {
        let report = ErrorReport::build(&[], 5);
        let prompt = revision_prompt(&stage(), &schema(), None, &report);
        assert!(prompt.contains("no parseable artifact"));
    }

    #[test]
    fn digest_truncates_on_char_boundary() {
        let payload = json!({"text": "é".repeat(100)});
        let digested = digest(&payload, 20);
        assert!(digested.ends_with("...(truncated)"));
        assert!(digested.len() <= 20 + "...(truncated)".len());
    }
}
