//! Tolerant JSON extraction from LLM output.
//!
//! LLMs wrap JSON in fenced code blocks, sprinkle `//` and `/* */` comments
//! through it, and occasionally emit trailing commas. This module
//! centralizes the repair-then-parse pipeline so every oracle-facing
//! component (extractor, decider, graph-op planner, judge) shares one
//! tolerant reader instead of rolling its own regex.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

static FENCE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)```(?:json)?\s*(.*?)\s*```").expect("static regex is valid")
});
static LINE_COMMENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?m)//[^\n"]*$"#).expect("static regex is valid"));
static BLOCK_COMMENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)/\*.*?\*/").expect("static regex is valid"));
static TRAILING_COMMA_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r",(\s*[}\]])").expect("static regex is valid"));

/// Extract the first fenced ```json``` block if present, else return the
/// input unchanged.
fn extract_fenced(input: &str) -> String {
    if let Some(caps) = FENCE_RE.captures(input) {
        if let Some(m) = caps.get(1) {
            return m.as_str().to_string();
        }
    }
    input.to_string()
}

/// Strip `//` and `/* */` comments. The line-comment regex intentionally
/// does not fire inside a trailing quoted string, which keeps it out of the
/// common case of a URL appearing as a JSON string value.
fn strip_comments(input: &str) -> String {
    let no_block = BLOCK_COMMENT_RE.replace_all(input, "");
    LINE_COMMENT_RE.replace_all(&no_block, "").to_string()
}

fn strip_trailing_commas(input: &str) -> String {
    TRAILING_COMMA_RE.replace_all(input, "$1").to_string()
}

/// Parse LLM output as JSON, tolerating fenced blocks, comments, and
/// trailing commas. Returns `None` rather than propagating a parse error —
/// callers fall through to their documented default decision.
pub fn tolerant_parse(raw: &str) -> Option<Value> {
    let fenced = extract_fenced(raw.trim());
    let decommented = strip_comments(&fenced);
    let repaired = strip_trailing_commas(&decommented);

    serde_json::from_str(&repaired)
        .or_else(|_| serde_json::from_str(decommented.trim()))
        .or_else(|_| serde_json::from_str(raw.trim()))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_json() {
        let v = tolerant_parse(r#"{"a": 1}"#).unwrap();
        assert_eq!(v["a"], 1);
    }

    #[test]
    fn parses_fenced_block() {
        let raw = "here you go:\n```json\n{\"a\": 2}\n```\nthanks";
        let v = tolerant_parse(raw).unwrap();
        assert_eq!(v["a"], 2);
    }

    #[test]
    fn strips_line_and_block_comments() {
        let raw = r#"{
            // a comment
            "a": 3, /* inline */
            "b": "https://example.com/not-a-comment"
        }"#;
        let v = tolerant_parse(raw).unwrap();
        assert_eq!(v["a"], 3);
        assert_eq!(v["b"], "https://example.com/not-a-comment");
    }

    #[test]
    fn strips_trailing_commas() {
        let raw = r#"{"a": 1, "b": [1, 2, 3,],}"#;
        let v = tolerant_parse(raw).unwrap();
        assert_eq!(v["a"], 1);
        assert_eq!(v["b"][2], 3);
    }

    #[test]
    fn returns_none_on_garbage() {
        assert!(tolerant_parse("not json at all").is_none());
    }
}
