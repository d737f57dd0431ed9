//! Schema model: field rules over slash paths plus cross-field constraints.
//!
//! Paths are slash-separated; a segment ending in `[]` iterates the items of
//! the named array, e.g. `clues[]/placement` addresses the `placement` leaf
//! of every entry in the top-level `clues` array.

/// A declarative schema for one artifact type.
#[derive(Debug, Clone)]
pub struct Schema {
    pub id: String,
    pub fields: Vec<FieldRule>,
    pub cross: Vec<CrossRule>,
}

/// A rule for a single field path.
#[derive(Debug, Clone)]
pub struct FieldRule {
    pub path: String,
    pub required: bool,
    pub kind: FieldKind,
}

/// The expected shape of a field.
#[derive(Debug, Clone)]
pub enum FieldKind {
    Text,
    Integer,
    Number,
    Boolean,
    Object,
    Array { non_empty: bool },
    /// Enumerated string leaf. `fallback` is the safe default the normalizer
    /// substitutes when the leaf is absent.
    Choice {
        allowed: Vec<String>,
        fallback: String,
    },
}

/// A constraint spanning more than one field.
#[derive(Debug, Clone)]
pub enum CrossRule {
    /// The integer at `count_path` must equal the length of the array at
    /// `array_path`.
    CountMatches {
        count_path: String,
        array_path: String,
    },
    /// No item of the array may combine `field_a = value_a` with
    /// `field_b = value_b`.
    ForbidPair {
        array_path: String,
        field_a: String,
        value_a: String,
        field_b: String,
        value_b: String,
    },
}

impl Schema {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fields: Vec::new(),
            cross: Vec::new(),
        }
    }

    pub fn field(mut self, path: impl Into<String>, required: bool, kind: FieldKind) -> Self {
        self.fields.push(FieldRule {
            path: path.into(),
            required,
            kind,
        });
        self
    }

    pub fn cross(mut self, rule: CrossRule) -> Self {
        self.cross.push(rule);
        self
    }
}

/// Build a `Choice` kind from string slices.
pub fn choice(allowed: &[&str], fallback: &str) -> FieldKind {
    FieldKind::Choice {
        allowed: allowed.iter().map(|s| s.to_string()).collect(),
        fallback: fallback.to_string(),
    }
}

/// Human-readable outline of a schema, used in generation prompts.
pub fn schema_outline(schema: &Schema) -> String {
    let mut lines = Vec::with_capacity(schema.fields.len());
    for rule in &schema.fields {
        let kind = match &rule.kind {
            FieldKind::Text => "string".to_string(),
            FieldKind::Integer => "integer".to_string(),
            FieldKind::Number => "number".to_string(),
            FieldKind::Boolean => "boolean".to_string(),
            FieldKind::Object => "object".to_string(),
            FieldKind::Array { non_empty: true } => "non-empty array".to_string(),
            FieldKind::Array { non_empty: false } => "array".to_string(),
            FieldKind::Choice { allowed, .. } => format!("one of {}", allowed.join(" | ")),
        };
        let requirement = if rule.required { "required" } else { "optional" };
        lines.push(format!("- {}: {} ({})", rule.path, kind, requirement));
    }
    for rule in &schema.cross {
        match rule {
            CrossRule::CountMatches {
                count_path,
                array_path,
            } => lines.push(format!("- {count_path} must equal the length of {array_path}")),
            CrossRule::ForbidPair {
                array_path,
                field_a,
                value_a,
                field_b,
                value_b,
            } => lines.push(format!(
                "- no {array_path} entry may have {field_a} = {value_a} together with {field_b} = {value_b}"
            )),
        }
    }
    lines.join("\n")
}

/// Split a rule path into its segments.
pub(crate) fn split_segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}
