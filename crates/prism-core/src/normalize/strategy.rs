//! Parse strategies, tried in order by the normalizer.
//!
//! Each strategy is a pure `fn(&str) -> Result<Value, String>` that yields a
//! JSON object or a reason it could not.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::Section;

/// Name of a parse strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyName {
    Direct,
    PatternExtraction,
    DefensiveCleaning,
}

impl StrategyName {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyName::Direct => "direct",
            StrategyName::PatternExtraction => "pattern_extraction",
            StrategyName::DefensiveCleaning => "defensive_cleaning",
        }
    }
}

pub type StrategyFn = fn(&str) -> Result<Value, String>;

/// The default cascade.
pub const DEFAULT_STRATEGIES: [(StrategyName, StrategyFn); 3] = [
    (StrategyName::Direct, direct),
    (StrategyName::PatternExtraction, pattern_extraction),
    (StrategyName::DefensiveCleaning, defensive_cleaning),
];

fn parse_object(text: &str) -> Result<Value, String> {
    match serde_json::from_str::<Value>(text) {
        Ok(value @ Value::Object(_)) => Ok(value),
        Ok(other) => Err(format!("top-level value is {}, not an object", type_name(&other))),
        Err(e) => Err(e.to_string()),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Strict parse of the trimmed text.
pub fn direct(raw: &str) -> Result<Value, String> {
    parse_object(raw.trim())
}

/// Largest fenced or brace-balanced block that parses to an object.
///
/// Blocks carrying a recognised section key win over bigger ones that do
/// not, so an echoed input object cannot hide the answer after it.
pub fn pattern_extraction(raw: &str) -> Result<Value, String> {
    let mut candidates: Vec<&str> = fenced_blocks(raw);
    candidates.extend(balanced_objects(raw));
    if candidates.is_empty() {
        return Err("no fenced or brace-delimited block found".to_string());
    }

    candidates.sort_by_key(|c| std::cmp::Reverse(c.len()));
    let mut last_error = String::new();
    let mut fallback = None;
    for candidate in candidates {
        match parse_object(candidate.trim()) {
            Ok(value) if has_section(&value) => return Ok(value),
            Ok(value) => {
                fallback.get_or_insert(value);
            }
            Err(e) => last_error = e,
        }
    }
    fallback.ok_or_else(|| format!("no candidate block parsed: {last_error}"))
}

fn has_section(value: &Value) -> bool {
    value.as_object().is_some_and(|obj| {
        Section::ALL
            .iter()
            .any(|s| s.aliases().iter().any(|key| obj.contains_key(*key)))
    })
}

/// Strip noise, cut to the outermost braces, drop trailing commas, parse.
pub fn defensive_cleaning(raw: &str) -> Result<Value, String> {
    let cleaned: String = raw
        .chars()
        .filter(|c| *c != '\u{feff}')
        .filter(|c| !c.is_control() || matches!(c, '\n' | '\r' | '\t'))
        .map(|c| match c {
            '\u{201c}' | '\u{201d}' | '\u{201e}' => '"',
            '\u{2018}' | '\u{2019}' => '\'',
            other => other,
        })
        .collect();

    let start = cleaned
        .find('{')
        .ok_or_else(|| "no opening brace".to_string())?;
    let end = cleaned
        .rfind('}')
        .filter(|end| *end > start)
        .ok_or_else(|| "no closing brace after the opening brace".to_string())?;

    parse_object(&strip_trailing_commas(&cleaned[start..=end]))
}

/// Contents of ``` fences, with an optional language tag removed.
fn fenced_blocks(raw: &str) -> Vec<&str> {
    raw.split("```")
        .enumerate()
        .filter(|(i, _)| i % 2 == 1)
        .map(|(_, block)| {
            let trimmed = block.trim_start();
            let tag_len = trimmed
                .find(|c: char| !c.is_ascii_alphanumeric())
                .unwrap_or(trimmed.len());
            if tag_len > 0 && !trimmed.starts_with('{') {
                &trimmed[tag_len..]
            } else {
                trimmed
            }
        })
        .filter(|block| block.contains('{'))
        .collect()
}

/// Every outermost `{...}` span whose braces balance, ignoring braces
/// inside JSON strings. An unbalanced opener is skipped so nested blocks
/// after it are still found.
fn balanced_objects(raw: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;
    while let Some(offset) = raw[start..].find('{') {
        let open = start + offset;
        match matching_close(&raw[open..]) {
            Some(len) => {
                out.push(&raw[open..open + len]);
                start = open + len;
            }
            None => start = open + 1,
        }
    }
    out
}

/// Byte length of the object starting at `s[0] == '{'`, closing brace included.
fn matching_close(s: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in s.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }
    None
}

/// Remove commas directly followed (modulo whitespace) by `}` or `]`,
/// outside of strings.
fn strip_trailing_commas(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escaped = false;
    for (i, &c) in chars.iter().enumerate() {
        if in_string {
            out.push(c);
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        if c == '"' {
            in_string = true;
        }
        if c == ',' {
            let next = chars[i + 1..].iter().find(|n| !n.is_whitespace());
            if matches!(next, Some('}') | Some(']')) {
                continue;
            }
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direct_parses_object_only() {
        assert!(direct("  {\"summary\": {}}  ").is_ok());
        let err = direct("[1, 2]").unwrap_err();
        assert!(err.contains("an array"));
        assert!(direct("Sure! {\"a\": 1}").is_err());
    }

    #[test]
    fn test_pattern_extraction_reads_json_fence() {
        let raw = "Sure! Here's the JSON: ```json {\"summary\":{\"overallScore\":150}} ```";
        let value = pattern_extraction(raw).unwrap();
        assert_eq!(value["summary"]["overallScore"], 150);
    }

    #[test]
    fn test_pattern_extraction_prefers_largest_block() {
        let raw = r#"note {"a": 1} and then {"summary": {"overallScore": 80, "keyIssues": []}} done"#;
        let value = pattern_extraction(raw).unwrap();
        assert!(value.get("summary").is_some());
    }

    #[test]
    fn test_pattern_extraction_skips_echoed_input() {
        let raw = r#"Input was {"image": {"ref": "img-1", "width": 1280, "height": 720, "tags": ["home", "hero"]}} and my answer: {"summary": {"overallScore": 80}}"#;
        let value = pattern_extraction(raw).unwrap();
        assert_eq!(value["summary"]["overallScore"], 80);

        let value = pattern_extraction(r#"only {"image": {"ref": "x"}} here"#).unwrap();
        assert!(value.get("image").is_some());
    }

    #[test]
    fn test_pattern_extraction_ignores_braces_in_strings() {
        let raw = r#"result: {"summary": {"keyIssues": ["use } carefully"]}} trailing }"#;
        let value = pattern_extraction(raw).unwrap();
        assert_eq!(value["summary"]["keyIssues"][0], "use } carefully");
    }

    #[test]
    fn test_pattern_extraction_finds_nested_after_broken_outer() {
        let raw = r#"{ broken {"suggestions": []} "#;
        let value = pattern_extraction(raw).unwrap();
        assert!(value.get("suggestions").is_some());
    }

    #[test]
    fn test_defensive_cleaning_fixes_common_damage() {
        let raw = "\u{feff}Result:\n{\u{201c}summary\u{201d}: {\u{201c}overallScore\u{201d}: 70,},}\nThanks";
        let value = defensive_cleaning(raw).unwrap();
        assert_eq!(value["summary"]["overallScore"], 70);
    }

    #[test]
    fn test_trailing_commas_inside_strings_survive() {
        let cleaned = strip_trailing_commas(r#"{"a": "x,}", "b": [1,2,],}"#);
        assert_eq!(cleaned, r#"{"a": "x,}", "b": [1,2]}"#);
    }

    #[test]
    fn test_defensive_cleaning_without_braces_fails() {
        assert!(defensive_cleaning("no json here").is_err());
    }
}
