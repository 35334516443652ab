use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;
use thiserror::Error;

use super::outputs::RoleOutput;
use crate::state::schema::Role;

static FENCED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```(?:json|JSON)?[ \t]*\r?\n?(.*?)```").expect("valid regex"));

/// Output that could not be read as the role's schema. Keeps the raw text for diagnosis.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("failed to parse {role} output: {message}")]
pub struct ParseFailure {
    pub role: Role,
    pub message: String,
    pub raw: String,
}

/// Find the first JSON object in model output.
///
/// Tries, in order: the whole text, each fenced code block, then each
/// balanced `{...}` span.
pub fn extract_json(raw: &str) -> Option<Value> {
    let trimmed = raw.trim();
    if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(trimmed) {
        return Some(value);
    }

    for caps in FENCED_RE.captures_iter(raw) {
        if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(caps[1].trim()) {
            return Some(value);
        }
    }

    let mut search_from = 0;
    while let Some(offset) = raw[search_from..].find('{') {
        let start = search_from + offset;
        if let Some(end) = balanced_end(&raw[start..]) {
            if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(&raw[start..start + end]) {
                return Some(value);
            }
        }
        search_from = start + 1;
    }
    None
}

/// Byte length of the brace-balanced span starting at `s[0] == '{'`.
fn balanced_end(s: &str) -> Option<usize> {
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

/// Parse raw model output into the typed output for `role`.
pub fn parse_output(role: Role, raw: &str) -> Result<RoleOutput, ParseFailure> {
    let failure = |message: String| ParseFailure {
        role,
        message,
        raw: raw.to_string(),
    };
    let value = extract_json(raw).ok_or_else(|| failure("no JSON object found".to_string()))?;
    RoleOutput::from_value(role, value).map_err(|e| failure(e.to_string()))
}
