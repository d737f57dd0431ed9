//! Pure, deterministic schema validation.

use serde_json::Value;

use caseweaver_types::{ErrorKind, ValidationError, ValidationResult};

use crate::schema::{split_segments, CrossRule, FieldKind, FieldRule, Schema};

/// Validate a candidate against a schema.
///
/// Every error carries a slash-separated field path so callers can group
/// errors by section.
pub fn validate(schema: &Schema, candidate: &Value) -> ValidationResult {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    if !candidate.is_object() {
        errors.push(ValidationError::new(
            "/",
            ErrorKind::TypeMismatch,
            "candidate must be a JSON object",
        ));
        return ValidationResult::from_errors(errors, warnings);
    }

    for rule in &schema.fields {
        let segments = split_segments(&rule.path);
        let mut hits = Vec::new();
        resolve(candidate, &segments, "", &mut hits);
        for (path, value) in hits {
            match value {
                None => {
                    if rule.required {
                        errors.push(ValidationError::new(
                            path,
                            ErrorKind::MissingRequired,
                            format!("required field '{}' is missing", rule.path),
                        ));
                    }
                }
                Some(v) => {
                    if let Some(err) = check_kind(rule, &path, v) {
                        errors.push(err);
                    }
                }
            }
        }
    }

    for rule in &schema.cross {
        apply_cross_rule(rule, candidate, &mut errors);
    }

    collect_unrecognized_warnings(schema, candidate, &mut warnings);

    ValidationResult::from_errors(errors, warnings)
}

/// Resolve a rule path against a candidate, expanding `[]` wildcards into one
/// hit per array item. A `None` value marks an absent leaf. Item-level rules
/// under an absent or non-array container produce no hits; the container's
/// own rule reports that case.
fn resolve<'a>(
    value: &'a Value,
    segments: &[&str],
    prefix: &str,
    out: &mut Vec<(String, Option<&'a Value>)>,
) {
    let Some((seg, rest)) = segments.split_first() else {
        out.push((prefix.to_string(), Some(value)));
        return;
    };
    if let Some(name) = seg.strip_suffix("[]") {
        let Some(items) = value.get(name).and_then(Value::as_array) else {
            return;
        };
        for (i, item) in items.iter().enumerate() {
            resolve(item, rest, &format!("{prefix}/{name}/{i}"), out);
        }
    } else {
        match value.get(*seg) {
            Some(child) => resolve(child, rest, &format!("{prefix}/{seg}"), out),
            None => {
                let remainder: Vec<&str> = std::iter::once(*seg).chain(rest.iter().copied()).collect();
                out.push((format!("{prefix}/{}", remainder.join("/")), None));
            }
        }
    }
}

fn check_kind(rule: &FieldRule, path: &str, value: &Value) -> Option<ValidationError> {
    match &rule.kind {
        FieldKind::Text => match value.as_str() {
            None => Some(type_mismatch(path, "string", value)),
            Some(s) if s.trim().is_empty() && rule.required => Some(ValidationError::new(
                path,
                ErrorKind::MissingRequired,
                "required field is empty",
            )),
            Some(_) => None,
        },
        FieldKind::Integer => {
            if value.is_i64() || value.is_u64() {
                None
            } else {
                Some(type_mismatch(path, "integer", value))
            }
        }
        FieldKind::Number => {
            if value.is_number() {
                None
            } else {
                Some(type_mismatch(path, "number", value))
            }
        }
        FieldKind::Boolean => {
            if value.is_boolean() {
                None
            } else {
                Some(type_mismatch(path, "boolean", value))
            }
        }
        FieldKind::Object => {
            if value.is_object() {
                None
            } else {
                Some(type_mismatch(path, "object", value))
            }
        }
        FieldKind::Array { non_empty } => match value.as_array() {
            None => Some(type_mismatch(path, "array", value)),
            Some(items) if *non_empty && items.is_empty() => Some(ValidationError::new(
                path,
                ErrorKind::CountMismatch,
                "array must not be empty",
            )),
            Some(_) => None,
        },
        FieldKind::Choice { allowed, .. } => match value.as_str() {
            None => Some(type_mismatch(path, "string", value)),
            Some(s) if !allowed.iter().any(|a| a == s) => Some(ValidationError::new(
                path,
                ErrorKind::EnumViolation,
                format!("'{s}' is not one of: {}", allowed.join(", ")),
            )),
            Some(_) => None,
        },
    }
}

fn type_mismatch(path: &str, expected: &str, value: &Value) -> ValidationError {
    ValidationError::new(
        path,
        ErrorKind::TypeMismatch,
        format!("expected {expected}, got {}", json_type_name(value)),
    )
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn apply_cross_rule(rule: &CrossRule, candidate: &Value, errors: &mut Vec<ValidationError>) {
    match rule {
        CrossRule::CountMatches {
            count_path,
            array_path,
        } => {
            let declared = lookup(candidate, count_path).and_then(Value::as_u64);
            let actual = lookup(candidate, array_path).and_then(Value::as_array);
            if let (Some(declared), Some(items)) = (declared, actual) {
                if declared as usize != items.len() {
                    errors.push(ValidationError::new(
                        format!("/{array_path}"),
                        ErrorKind::CountMismatch,
                        format!(
                            "declared {count_path} = {declared}, actual length {}",
                            items.len()
                        ),
                    ));
                }
            }
        }
        CrossRule::ForbidPair {
            array_path,
            field_a,
            value_a,
            field_b,
            value_b,
        } => {
            let Some(items) = lookup(candidate, array_path).and_then(Value::as_array) else {
                return;
            };
            for (i, item) in items.iter().enumerate() {
                let a = item.get(field_a).and_then(Value::as_str);
                let b = item.get(field_b).and_then(Value::as_str);
                if a == Some(value_a.as_str()) && b == Some(value_b.as_str()) {
                    errors.push(ValidationError::new(
                        format!("/{array_path}/{i}/{field_b}"),
                        ErrorKind::CrossFieldMismatch,
                        format!(
                            "{field_a} = {value_a} must not combine with {field_b} = {value_b}"
                        ),
                    ));
                }
            }
        }
    }
}

/// Look up a plain (wildcard-free) slash path.
fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    split_segments(path)
        .into_iter()
        .try_fold(value, |acc, seg| acc.get(seg))
}

fn collect_unrecognized_warnings(schema: &Schema, candidate: &Value, warnings: &mut Vec<String>) {
    let Some(map) = candidate.as_object() else {
        return;
    };
    let mut known: Vec<&str> = Vec::new();
    for rule in &schema.fields {
        if let Some(first) = split_segments(&rule.path).first() {
            known.push(first.trim_end_matches("[]"));
        }
    }
    for rule in &schema.cross {
        if let CrossRule::CountMatches { count_path, .. } = rule {
            if let Some(first) = split_segments(count_path).first() {
                known.push(first);
            }
        }
    }
    for key in map.keys() {
        if !known.contains(&key.as_str()) {
            warnings.push(format!("unrecognized field '/{key}'"));
        }
    }
}
