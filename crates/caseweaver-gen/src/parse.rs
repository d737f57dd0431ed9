//! Candidate parsing ladder.
//!
//! Raw backend output is resolved into an explicit sum type before any
//! schema-aware code inspects it. Three parse routes are tried in order:
//! direct JSON, bracket-delimited substring extraction, then a line-salvage
//! pass over `key: value` lines where malformed lines are commented out
//! rather than aborting the whole parse.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

/// A raw candidate, resolved.
#[derive(Debug, Clone, PartialEq)]
pub enum Parsed {
    Record {
        value: Value,
        route: ParseRoute,
        /// Lines the line-salvage pass had to comment out.
        commented_lines: Vec<String>,
    },
    Failure {
        reason: String,
    },
}

/// Which rung of the ladder produced the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseRoute {
    Direct,
    BracketSlice,
    LineSalvage,
}

/// Parse raw generation output into a structured record.
pub fn parse_candidate(text: &str) -> Parsed {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Parsed::Failure {
            reason: "empty output".into(),
        };
    }

    // Rung 1: the whole output is a JSON object.
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        if value.is_object() {
            return Parsed::Record {
                value,
                route: ParseRoute::Direct,
                commented_lines: Vec::new(),
            };
        }
    }

    // Rung 2: an object is embedded in prose or a code fence.
    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if end > start {
            if let Ok(value) = serde_json::from_str::<Value>(&trimmed[start..=end]) {
                if value.is_object() {
                    return Parsed::Record {
                        value,
                        route: ParseRoute::BracketSlice,
                        commented_lines: Vec::new(),
                    };
                }
            }
        }
    }

    // Rung 3: salvage `key: value` lines, commenting out anything malformed.
    let mut map = serde_json::Map::new();
    let mut commented_lines = Vec::new();
    for line in trimmed.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match line_regex().captures(line) {
            Some(caps) => {
                let key = caps[1].to_string();
                let raw_value = caps[2].trim().trim_end_matches(',').trim();
                let value = serde_json::from_str::<Value>(raw_value)
                    .unwrap_or_else(|_| Value::String(raw_value.trim_matches('"').to_string()));
                map.insert(key, value);
            }
            None => commented_lines.push(format!("// {line}")),
        }
    }
    if !map.is_empty() {
        return Parsed::Record {
            value: Value::Object(map),
            route: ParseRoute::LineSalvage,
            commented_lines,
        };
    }

    Parsed::Failure {
        reason: "no structured content found".into(),
    }
}

fn line_regex() -> &'static Regex {
    static LINE: OnceLock<Regex> = OnceLock::new();
    LINE.get_or_init(|| {
        Regex::new(r#"^\s*"?([A-Za-z_][A-Za-z0-9_]*)"?\s*[:=]\s*(.+?)\s*$"#)
            .expect("line salvage regex")
    })
}
