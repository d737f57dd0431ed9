//! Error reporting for retry and revision prompts.
//!
//! A raw validation failure can carry dozens of errors; dumping them all
//! into a prompt buries the signal. [`ErrorReport`] groups errors by
//! category and path section, samples a bounded number per category, and
//! always preserves the true totals.

use std::collections::BTreeMap;

use caseweaver_types::{ErrorKind, ValidationError};

/// A compact, bounded-length summary of a validation error set.
#[derive(Debug, Clone)]
pub struct ErrorReport {
    pub total: usize,
    pub sections: Vec<String>,
    pub categories: Vec<CategorySummary>,
}

#[derive(Debug, Clone)]
pub struct CategorySummary {
    pub kind: ErrorKind,
    pub total: usize,
    /// At most the configured cap of sampled errors.
    pub samples: Vec<String>,
}

fn kind_label(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::MissingRequired => "missing required",
        ErrorKind::TypeMismatch => "type mismatch",
        ErrorKind::EnumViolation => "enum violation",
        ErrorKind::CrossFieldMismatch => "cross-field mismatch",
        ErrorKind::CountMismatch => "count mismatch",
    }
}

/// Top-level path section an error belongs to (`/clues/3/placement` ->
/// `clues`).
fn section_of(path: &str) -> String {
    path.trim_start_matches('/')
        .split('/')
        .next()
        .unwrap_or("")
        .to_string()
}

impl ErrorReport {
    /// Build a report sampling at most `cap` errors per category.
    pub fn build(errors: &[ValidationError], cap: usize) -> Self {
        let mut sections: Vec<String> = Vec::new();
        let mut by_kind: BTreeMap<&'static str, (ErrorKind, usize, Vec<String>)> = BTreeMap::new();

        for error in errors {
            let section = section_of(&error.path);
            if !section.is_empty() && !sections.contains(&section) {
                sections.push(section);
            }
            let entry = by_kind
                .entry(kind_label(error.kind))
                .or_insert((error.kind, 0, Vec::new()));
            entry.1 += 1;
            if entry.2.len() < cap {
                entry.2.push(format!("{}: {}", error.path, error.message));
            }
        }

        let categories = by_kind
            .into_values()
            .map(|(kind, total, samples)| CategorySummary {
                kind,
                total,
                samples,
            })
            .collect();

        Self {
            total: errors.len(),
            sections,
            categories,
        }
    }

    /// Render the report for inclusion in a prompt.
    pub fn render(&self) -> String {
        if self.total == 0 {
            return "no validation errors".into();
        }
        let mut lines = vec![format!(
            "{} validation error(s) across section(s): {}",
            self.total,
            self.sections.join(", ")
        )];
        for category in &self.categories {
            let mut line = format!("- {} ({}):", kind_label(category.kind), category.total);
            for sample in &category.samples {
                line.push_str("\n    ");
                line.push_str(sample);
            }
            let hidden = category.total - category.samples.len();
            if hidden > 0 {
                line.push_str(&format!("\n    ... and {hidden} more"));
            }
            lines.push(line);
        }
        lines.join("\n")
    }
}

/// Human-readable fixes between two error sets, for revision provenance.
///
/// The first entry is always the count summary; the rest name resolved
/// paths, capped so provenance stays readable.
pub fn describe_fixes(
    before: &[ValidationError],
    after: &[ValidationError],
    cap: usize,
) -> Vec<String> {
    let mut fixes = vec![format!(
        "reduced errors from {} to {}",
        before.len(),
        after.len()
    )];
    let remaining: Vec<&str> = after.iter().map(|e| e.path.as_str()).collect();
    for error in before {
        if fixes.len() > cap {
            fixes.push(format!(
                "... and {} more",
                before
                    .iter()
                    .filter(|e| !remaining.contains(&e.path.as_str()))
                    .count()
                    .saturating_sub(cap)
            ));
            break;
        }
        if !remaining.contains(&error.path.as_str()) {
            fixes.push(format!("resolved {}", error.path));
        }
    }
    fixes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn err(path: &str, kind: ErrorKind) -> ValidationError {
        ValidationError::new(path, kind, "msg")
    }

    #[test]
    fn report_groups_by_category_and_preserves_totals() {
        let errors = vec![
            err("/clues/0/id", ErrorKind::MissingRequired),
            err("/clues/1/id", ErrorKind::MissingRequired),
            err("/clues/2/id", ErrorKind::MissingRequired),
            err("/clues/3/placement", ErrorKind::EnumViolation),
            err("/title", ErrorKind::TypeMismatch),
        ];
        let report = ErrorReport::build(&errors, 2);
        assert_eq!(report.total, 5);
        assert_eq!(report.sections, vec!["clues", "title"]);

        let missing = report
            .categories
            .iter()
            .find(|c| c.kind == ErrorKind::MissingRequired)
            .unwrap();
        assert_eq!(missing.total, 3);
        assert_eq!(missing.samples.len(), 2);
    }

    #[test]
    fn render_is_bounded_and_reports_hidden_count() {
        let errors: Vec<ValidationError> = (0..20)
            .map(|i| err(&format!("/clues/{i}/id"), ErrorKind::MissingRequired))
            .collect();
        let report = ErrorReport::build(&errors, 3);
        let rendered = report.render();
        assert!(rendered.contains("20 validation error(s)"));
        assert!(rendered.contains("... and 17 more"));
        // 3 samples + summary lines only.
        assert!(rendered.lines().count() < 8);
    }

    #[test]
    fn empty_error_set_renders_trivially() {
        let report = ErrorReport::build(&[], 5);
        assert_eq!(report.total, 0);
        assert_eq!(report.render(), "no validation errors");
    }

    #[test]
    fn describe_fixes_names_resolved_paths() {
        let before = vec![
            err("/title", ErrorKind::MissingRequired),
            err("/victim", ErrorKind::MissingRequired),
            err("/clues/0/placement", ErrorKind::EnumViolation),
        ];
        let after = vec![err("/clues/0/placement", ErrorKind::EnumViolation)];
        let fixes = describe_fixes(&before, &after, 8);
        assert_eq!(fixes[0], "reduced errors from 3 to 1");
        assert!(fixes.contains(&"resolved /title".to_string()));
        assert!(fixes.contains(&"resolved /victim".to_string()));
        assert!(!fixes.iter().any(|f| f.contains("/clues/0/placement")));
    }

    #[test]
    fn describe_fixes_with_full_repair() {
        let before = vec![err("/title", ErrorKind::MissingRequired)];
        let fixes = describe_fixes(&before, &[], 8);
        assert_eq!(fixes[0], "reduced errors from 1 to 0");
        assert_eq!(fixes[1], "resolved /title");
    }
}
