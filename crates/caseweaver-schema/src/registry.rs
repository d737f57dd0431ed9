//! Built-in schema registry, one schema per stage artifact type.

use std::collections::HashMap;

use crate::schema::{choice, CrossRule, FieldKind, Schema};

pub const SETTING_SCHEMA: &str = "setting.v1";
pub const CAST_SCHEMA: &str = "cast.v1";
pub const PROFILES_SCHEMA: &str = "profiles.v1";
pub const BACKGROUND_SCHEMA: &str = "background.v1";
pub const MECHANISM_SCHEMA: &str = "mechanism.v1";
pub const CASE_SCHEMA: &str = "case.v1";
pub const CLUES_SCHEMA: &str = "clues.v1";
pub const OUTLINE_SCHEMA: &str = "outline.v1";
pub const PROSE_BATCH_SCHEMA: &str = "prose_batch.v1";

pub const CLUE_CATEGORIES: &[&str] = &[
    "physical",
    "testimonial",
    "documentary",
    "behavioral",
    "red_herring",
];
pub const PLACEMENTS: &[&str] = &["early", "mid", "late"];
pub const CRITICALITIES: &[&str] = &["essential", "supporting", "optional"];

/// Resolves schemas by id.
pub struct SchemaRegistry {
    schemas: HashMap<String, Schema>,
}

impl SchemaRegistry {
    /// Registry pre-loaded with every built-in artifact schema.
    pub fn builtin() -> Self {
        let mut registry = Self {
            schemas: HashMap::new(),
        };
        for schema in builtin_schemas() {
            registry.register(schema);
        }
        registry
    }

    pub fn register(&mut self, schema: Schema) {
        self.schemas.insert(schema.id.clone(), schema);
    }

    pub fn get(&self, id: &str) -> Option<&Schema> {
        self.schemas.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.schemas.contains_key(id)
    }

    /// All registered schema ids, sorted.
    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.schemas.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }
}

fn builtin_schemas() -> Vec<Schema> {
    vec![
        Schema::new(SETTING_SCHEMA)
            .field("era", true, FieldKind::Text)
            .field("locale", true, FieldKind::Text)
            .field(
                "tone",
                false,
                choice(&["somber", "playful", "hardboiled", "gothic"], "somber"),
            )
            .field("locations", true, FieldKind::Array { non_empty: true })
            .field("locations[]/name", true, FieldKind::Text)
            .field("locations[]/detail", false, FieldKind::Text),
        Schema::new(CAST_SCHEMA)
            .field("cast_size", true, FieldKind::Integer)
            .field("cast", true, FieldKind::Array { non_empty: true })
            .field("cast[]/name", true, FieldKind::Text)
            .field(
                "cast[]/role",
                true,
                choice(&["victim", "suspect", "detective", "witness"], "witness"),
            )
            .field("cast[]/motive", false, FieldKind::Text)
            .cross(CrossRule::CountMatches {
                count_path: "cast_size".into(),
                array_path: "cast".into(),
            }),
        Schema::new(PROFILES_SCHEMA)
            .field("profiles", true, FieldKind::Array { non_empty: true })
            .field("profiles[]/name", true, FieldKind::Text)
            .field("profiles[]/voice", false, FieldKind::Text)
            .field("profiles[]/secrets", false, FieldKind::Array { non_empty: false }),
        Schema::new(BACKGROUND_SCHEMA)
            .field("period_detail", true, FieldKind::Text)
            .field("social_context", true, FieldKind::Text)
            .field("constraints", false, FieldKind::Array { non_empty: false }),
        Schema::new(MECHANISM_SCHEMA)
            .field("method", true, FieldKind::Text)
            .field("opportunity_window", true, FieldKind::Text)
            .field("concealment", false, FieldKind::Text)
            .field(
                "required_knowledge",
                false,
                FieldKind::Array { non_empty: false },
            ),
        Schema::new(CASE_SCHEMA)
            .field("title", true, FieldKind::Text)
            .field("victim", true, FieldKind::Text)
            .field("setting_summary", true, FieldKind::Text)
            .field("facts", true, FieldKind::Array { non_empty: true })
            .field("facts[]/id", true, FieldKind::Text)
            .field("facts[]/description", true, FieldKind::Text)
            .field("suspects", true, FieldKind::Array { non_empty: true })
            .field("suspects[]/id", true, FieldKind::Text)
            .field("suspects[]/name", true, FieldKind::Text)
            .field("suspects[]/motive", false, FieldKind::Text)
            .field("solution", true, FieldKind::Object)
            .field("solution/culprit_id", true, FieldKind::Text)
            .field(
                "solution/inference_chain",
                true,
                FieldKind::Array { non_empty: true },
            )
            .field("solution/inference_chain[]/claim", true, FieldKind::Text)
            .field(
                "solution/inference_chain[]/fact_ids",
                true,
                FieldKind::Array { non_empty: true },
            )
            .field("solution/discriminating_test", true, FieldKind::Object)
            .field(
                "solution/discriminating_test/description",
                true,
                FieldKind::Text,
            )
            .field(
                "solution/discriminating_test/placement",
                false,
                choice(PLACEMENTS, "late"),
            ),
        Schema::new(CLUES_SCHEMA)
            .field("clue_count", true, FieldKind::Integer)
            .field("clues", true, FieldKind::Array { non_empty: true })
            .field("clues[]/id", true, FieldKind::Text)
            .field("clues[]/description", true, FieldKind::Text)
            .field("clues[]/category", true, choice(CLUE_CATEGORIES, "physical"))
            .field("clues[]/source_reference", true, FieldKind::Text)
            .field("clues[]/placement", true, choice(PLACEMENTS, "mid"))
            .field(
                "clues[]/criticality",
                true,
                choice(CRITICALITIES, "supporting"),
            )
            .cross(CrossRule::CountMatches {
                count_path: "clue_count".into(),
                array_path: "clues".into(),
            })
            .cross(CrossRule::ForbidPair {
                array_path: "clues".into(),
                field_a: "criticality".into(),
                value_a: "essential".into(),
                field_b: "placement".into(),
                value_b: "late".into(),
            }),
        Schema::new(OUTLINE_SCHEMA)
            .field("scene_count", true, FieldKind::Integer)
            .field("scenes", true, FieldKind::Array { non_empty: true })
            .field("scenes[]/index", true, FieldKind::Integer)
            .field("scenes[]/title", true, FieldKind::Text)
            .field("scenes[]/summary", true, FieldKind::Text)
            .cross(CrossRule::CountMatches {
                count_path: "scene_count".into(),
                array_path: "scenes".into(),
            }),
        Schema::new(PROSE_BATCH_SCHEMA)
            .field("chapter_count", true, FieldKind::Integer)
            .field("chapters", true, FieldKind::Array { non_empty: true })
            .field("chapters[]/scene_index", true, FieldKind::Integer)
            .field("chapters[]/title", true, FieldKind::Text)
            .field("chapters[]/text", true, FieldKind::Text)
            .cross(CrossRule::CountMatches {
                count_path: "chapter_count".into(),
                array_path: "chapters".into(),
            }),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validate::validate;
    use serde_json::json;

    #[test]
    fn builtin_registry_contains_all_stage_schemas() {
        let registry = SchemaRegistry::builtin();
        for id in [
            SETTING_SCHEMA,
            CAST_SCHEMA,
            PROFILES_SCHEMA,
            BACKGROUND_SCHEMA,
            MECHANISM_SCHEMA,
            CASE_SCHEMA,
            CLUES_SCHEMA,
            OUTLINE_SCHEMA,
            PROSE_BATCH_SCHEMA,
        ] {
            assert!(registry.contains(id), "missing schema {id}");
        }
        assert_eq!(registry.ids().len(), 9);
    }

    #[test]
    fn unknown_schema_id_is_none() {
        let registry = SchemaRegistry::builtin();
        assert!(registry.get("case.v999").is_none());
    }

    #[test]
    fn case_schema_accepts_complete_case() {
        let registry = SchemaRegistry::builtin();
        let schema = registry.get(CASE_SCHEMA).expect("case schema");
        let case = json!({
            "title": "The Glasshouse Affair",
            "victim": "Edmund Kerr",
            "setting_summary": "A conservatory estate in a wet autumn",
            "facts": [
                {"id": "f1", "description": "A bloodstained glove under the fern bench"},
            ],
            "suspects": [
                {"id": "s1", "name": "Amos Vane", "motive": "debt"},
            ],
            "solution": {
                "culprit_id": "s1",
                "inference_chain": [
                    {"claim": "Only Vane entered the glasshouse", "fact_ids": ["f1"]},
                ],
                "discriminating_test": {
                    "description": "Compare glove stitching to Vane's tailor records",
                    "placement": "late",
                },
            },
        });
        let result = validate(schema, &case);
        assert!(result.valid, "errors: {:?}", result.errors);
    }

    #[test]
    fn cast_schema_enforces_declared_size() {
        let registry = SchemaRegistry::builtin();
        let schema = registry.get(CAST_SCHEMA).expect("cast schema");
        let cast = json!({
            "cast_size": 3,
            "cast": [{"name": "Amos Vane", "role": "suspect"}],
        });
        let result = validate(schema, &cast);
        assert!(!result.valid);
        assert!(result
            .errors
            .iter()
            .any(|e| e.kind == caseweaver_types::ErrorKind::CountMismatch));
    }

    #[test]
    fn clue_schema_rejects_essential_late() {
        let registry = SchemaRegistry::builtin();
        let schema = registry.get(CLUES_SCHEMA).expect("clues schema");
        let clues = json!({
            "clue_count": 1,
            "clues": [{
                "id": "c1",
                "description": "A torn letter",
                "category": "documentary",
                "source_reference": "/facts/0",
                "placement": "late",
                "criticality": "essential",
            }],
        });
        let result = validate(schema, &clues);
        assert!(!result.valid);
        assert!(result
            .errors
            .iter()
            .any(|e| e.kind == caseweaver_types::ErrorKind::CrossFieldMismatch));
    }
}
