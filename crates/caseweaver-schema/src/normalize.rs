//! Artifact normalizer: coerce a raw candidate into canonical shape before
//! validation, without overwriting anything that already validates.
//!
//! The normalizer is idempotent: `normalize(normalize(x)) == normalize(x)`.

use std::collections::HashMap;

use serde_json::{json, Value};

use crate::schema::{split_segments, CrossRule, FieldKind, Schema};

/// Externally imposed array-length targets, keyed by array path.
///
/// When present, an external target takes precedence over a count field the
/// candidate declares itself (the caller knows the truth, e.g. the scene
/// range of a prose batch).
pub type DeclaredTargets = HashMap<String, usize>;

/// What to do when a count-constrained array is short on the final
/// generation attempt. Deliberately a run-level policy rather than a silent
/// built-in behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaceholderPolicy {
    /// Pad with tagged placeholder entries, but only on the final attempt.
    #[default]
    PadOnFinalAttempt,
    /// Never pad; let validation fail and the retry controller escalate.
    Escalate,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NormalizeOptions {
    pub final_attempt: bool,
    pub policy: PlaceholderPolicy,
}

/// Normalize a raw candidate against a schema.
///
/// Returns the canonical candidate plus a human-readable list of defaults
/// that were applied. Non-object candidates pass through untouched; the
/// validator reports them.
pub fn normalize(
    schema: &Schema,
    raw: Value,
    targets: &DeclaredTargets,
    options: NormalizeOptions,
) -> (Value, Vec<String>) {
    let mut applied = Vec::new();
    if !raw.is_object() {
        return (raw, applied);
    }
    let mut candidate = raw;

    fill_optional_containers(schema, &mut candidate, &mut applied);
    reconcile_counted_arrays(schema, &mut candidate, targets, options, &mut applied);
    complete_placeholders(schema, &mut candidate, &mut applied);
    fill_enum_defaults(schema, &mut candidate, &mut applied);

    (candidate, applied)
}

fn fill_optional_containers(schema: &Schema, candidate: &mut Value, applied: &mut Vec<String>) {
    for rule in &schema.fields {
        let empty: fn() -> Value = match &rule.kind {
            FieldKind::Array { .. } if !rule.required => || json!([]),
            FieldKind::Object if !rule.required => || json!({}),
            _ => continue,
        };
        let segments = split_segments(&rule.path);
        let mut filled = Vec::new();
        fill_absent(candidate, &segments, "", &empty, &mut filled);
        for path in filled {
            applied.push(format!("inserted empty container at {path}"));
        }
    }
}

fn reconcile_counted_arrays(
    schema: &Schema,
    candidate: &mut Value,
    targets: &DeclaredTargets,
    options: NormalizeOptions,
    applied: &mut Vec<String>,
) {
    for rule in &schema.cross {
        let CrossRule::CountMatches {
            count_path,
            array_path,
        } = rule
        else {
            continue;
        };
        let external = targets.get(array_path.as_str()).copied();
        let declared = external.or_else(|| {
            get_path(candidate, count_path)
                .and_then(Value::as_u64)
                .map(|v| v as usize)
        });
        let Some(target) = declared else { continue };
        {
            let Some(items) = get_path_mut(candidate, array_path).and_then(Value::as_array_mut)
            else {
                continue;
            };
            if items.len() > target {
                items.truncate(target);
                applied.push(format!("truncated /{array_path} to {target} entries"));
            } else if items.len() < target
                && options.final_attempt
                && options.policy == PlaceholderPolicy::PadOnFinalAttempt
            {
                let missing = target - items.len();
                while items.len() < target {
                    items.push(json!({ "placeholder": true }));
                }
                applied.push(format!(
                    "padded /{array_path} with {missing} placeholder entries"
                ));
            }
        }
        // An external target is authoritative; bring the declared count field
        // in line once the array itself matches it.
        let len_now = get_path(candidate, array_path)
            .and_then(Value::as_array)
            .map(|a| a.len());
        if external.is_some() && len_now == Some(target) {
            match get_path_mut(candidate, count_path) {
                Some(count) if count.as_u64() != Some(target as u64) => {
                    *count = json!(target);
                    applied.push(format!("reconciled {count_path} to {target}"));
                }
                Some(_) => {}
                None => {
                    if set_at_path(candidate, count_path, json!(target)) {
                        applied.push(format!("set {count_path} to {target}"));
                    }
                }
            }
        }
    }
}

/// Placeholder entries must satisfy the item rules of their array, otherwise
/// padding on the final attempt could never rescue a short array.
fn complete_placeholders(schema: &Schema, candidate: &mut Value, applied: &mut Vec<String>) {
    for cross in &schema.cross {
        let CrossRule::CountMatches { array_path, .. } = cross else {
            continue;
        };
        let item_prefix = format!("{array_path}[]/");
        let item_rules: Vec<_> = schema
            .fields
            .iter()
            .filter(|r| r.path.starts_with(&item_prefix))
            .collect();
        if item_rules.is_empty() {
            continue;
        }
        let Some(items) = get_path_mut(candidate, array_path).and_then(Value::as_array_mut) else {
            continue;
        };
        let mut completed = 0usize;
        for item in items.iter_mut() {
            if item.get("placeholder").and_then(Value::as_bool) != Some(true) {
                continue;
            }
            let mut touched = false;
            for rule in &item_rules {
                let rest = &rule.path[item_prefix.len()..];
                let segments = split_segments(rest);
                if segments.iter().any(|s| s.ends_with("[]")) {
                    continue;
                }
                let mut filled = Vec::new();
                let default = kind_default(&rule.kind);
                fill_absent(item, &segments, "", &|| default.clone(), &mut filled);
                touched |= !filled.is_empty();
            }
            if touched {
                completed += 1;
            }
        }
        if completed > 0 {
            applied.push(format!(
                "completed {completed} placeholder entries in /{array_path}"
            ));
        }
    }
}

fn fill_enum_defaults(schema: &Schema, candidate: &mut Value, applied: &mut Vec<String>) {
    for rule in &schema.fields {
        let FieldKind::Choice { fallback, .. } = &rule.kind else {
            continue;
        };
        let segments = split_segments(&rule.path);
        let mut filled = Vec::new();
        fill_absent(
            candidate,
            &segments,
            "",
            &|| Value::String(fallback.clone()),
            &mut filled,
        );
        for path in filled {
            applied.push(format!("defaulted {path} to '{fallback}'"));
        }
    }
}

fn kind_default(kind: &FieldKind) -> Value {
    match kind {
        FieldKind::Text => json!("placeholder"),
        FieldKind::Integer => json!(0),
        FieldKind::Number => json!(0.0),
        FieldKind::Boolean => json!(false),
        FieldKind::Object => json!({}),
        FieldKind::Array { .. } => json!([]),
        FieldKind::Choice { fallback, .. } => Value::String(fallback.clone()),
    }
}

/// Insert `make()` at every instance of the path whose leaf is absent but
/// whose parent exists. Existing values are never replaced.
fn fill_absent(
    value: &mut Value,
    segments: &[&str],
    prefix: &str,
    make: &dyn Fn() -> Value,
    filled: &mut Vec<String>,
) {
    let Some((seg, rest)) = segments.split_first() else {
        return;
    };
    if let Some(name) = seg.strip_suffix("[]") {
        if rest.is_empty() {
            return;
        }
        let Some(items) = value.get_mut(name).and_then(Value::as_array_mut) else {
            return;
        };
        for (i, item) in items.iter_mut().enumerate() {
            fill_absent(item, rest, &format!("{prefix}/{name}/{i}"), make, filled);
        }
    } else if rest.is_empty() {
        let Some(map) = value.as_object_mut() else {
            return;
        };
        if !map.contains_key(*seg) {
            map.insert(seg.to_string(), make());
            filled.push(format!("{prefix}/{seg}"));
        }
    } else if let Some(child) = value.get_mut(*seg) {
        fill_absent(child, rest, &format!("{prefix}/{seg}"), make, filled);
    }
}

fn get_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    split_segments(path)
        .into_iter()
        .try_fold(value, |acc, seg| acc.get(seg))
}

fn get_path_mut<'a>(value: &'a mut Value, path: &str) -> Option<&'a mut Value> {
    split_segments(path)
        .into_iter()
        .try_fold(value, |acc, seg| acc.get_mut(seg))
}

fn set_at_path(value: &mut Value, path: &str, new: Value) -> bool {
    let segments = split_segments(path);
    let Some((last, parents)) = segments.split_last() else {
        return false;
    };
    let mut current = value;
    for seg in parents {
        let Some(map) = current.as_object_mut() else {
            return false;
        };
        current = map.entry(seg.to_string()).or_insert_with(|| json!({}));
    }
    let Some(map) = current.as_object_mut() else {
        return false;
    };
    map.insert(last.to_string(), new);
    true
}
