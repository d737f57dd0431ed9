//! Ordered clue-category rule table.
//!
//! Category inference from free-text descriptions is an explicit, ordered
//! `pattern -> category` table rather than scattered string checks; the first
//! matching rule wins. Inference only fills categories that are absent or
//! outside the allowed set; a valid category is never replaced.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use caseweaver_schema::CLUE_CATEGORIES;

pub struct CategoryRule {
    pub category: &'static str,
    pattern: Regex,
}

impl CategoryRule {
    fn new(category: &'static str, pattern: &str) -> Self {
        Self {
            category,
            pattern: Regex::new(pattern).expect("category rule pattern"),
        }
    }

    pub fn matches(&self, text: &str) -> bool {
        self.pattern.is_match(text)
    }
}

/// The rule table, most specific first.
pub fn rules() -> &'static [CategoryRule] {
    static RULES: OnceLock<Vec<CategoryRule>> = OnceLock::new();
    RULES.get_or_init(|| {
        vec![
            CategoryRule::new(
                "red_herring",
                r"(?i)\b(red herring|planted|decoy|false trail|misleading|meant to mislead)\b",
            ),
            CategoryRule::new(
                "documentary",
                r"(?i)\b(letter|ledger|diary|document|note|receipt|telegram|will|manifest|register|record book)\b",
            ),
            CategoryRule::new(
                "physical",
                r"(?i)\b(fingerprint|footprint|fiber|fibre|stain|blood|weapon|mud|ash|residue|scratch|torn|button|glove|thread)\b",
            ),
            CategoryRule::new(
                "testimonial",
                r"(?i)\b(saw|heard|overheard|testif\w*|witness\w*|claim\w*|statement|alibi|recalls?|swears?)\b",
            ),
            CategoryRule::new(
                "behavioral",
                r"(?i)\b(nervous|avoid\w*|flinch\w*|lied|lying|hesitat\w*|habit|refus\w*|demeanor|evasive)\b",
            ),
        ]
    })
}

/// First matching category for a description, if any.
pub fn infer_category(description: &str) -> Option<&'static str> {
    rules()
        .iter()
        .find(|rule| rule.matches(description))
        .map(|rule| rule.category)
}

/// Fill in missing or invalid clue categories from descriptions.
///
/// Returns the number of categories set. Clues with no usable description
/// are left for the normalizer's enum fallback.
pub fn annotate_categories(candidate: &mut Value) -> usize {
    let Some(clues) = candidate.get_mut("clues").and_then(Value::as_array_mut) else {
        return 0;
    };
    let mut set = 0;
    for clue in clues.iter_mut() {
        let current = clue.get("category").and_then(Value::as_str);
        if current.is_some_and(|c| CLUE_CATEGORIES.contains(&c)) {
            continue;
        }
        let Some(description) = clue.get("description").and_then(Value::as_str) else {
            continue;
        };
        if let Some(category) = infer_category(description) {
            if let Some(map) = clue.as_object_mut() {
                map.insert("category".into(), Value::String(category.into()));
                set += 1;
            }
        }
    }
    set
}
