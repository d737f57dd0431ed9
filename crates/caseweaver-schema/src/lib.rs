//! Declarative artifact schemas, the validator, and the normalizer.
//!
//! A [`Schema`] is a flat list of field rules over slash-separated paths plus
//! cross-field constraints. [`validate`] is pure and deterministic;
//! [`normalize`] canonicalizes a raw candidate without ever overwriting a
//! field that already validates.

pub mod normalize;
pub mod registry;
pub mod schema;
pub mod validate;

pub use normalize::{normalize, DeclaredTargets, NormalizeOptions, PlaceholderPolicy};
pub use registry::{
    SchemaRegistry, BACKGROUND_SCHEMA, CASE_SCHEMA, CAST_SCHEMA, CLUES_SCHEMA, CLUE_CATEGORIES,
    MECHANISM_SCHEMA, OUTLINE_SCHEMA, PROFILES_SCHEMA, PROSE_BATCH_SCHEMA, SETTING_SCHEMA,
};
pub use schema::{choice, schema_outline, CrossRule, FieldKind, FieldRule, Schema};
pub use validate::validate;
