use crate::errors::LabError;
use serde_json::Value;
use std::collections::BTreeMap;

/// Parameter name to value. Sorted so that serializing the same mapping
/// always produces the same bytes.
pub type Arguments = BTreeMap<String, Value>;

/// A set of parameter overrides applied on top of [`Arguments`].
pub type Overrides = BTreeMap<String, Value>;

pub fn render_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

/// Parses a command-line value: JSON when it parses, bare string otherwise.
pub fn parse_value(raw: &str) -> Value {
    let trimmed = raw.trim();
    serde_json::from_str(trimmed).unwrap_or_else(|_| Value::String(trimmed.to_string()))
}

pub fn merge_arguments(base: &Arguments, overrides: &Overrides) -> Arguments {
    let mut merged = base.clone();
    for (key, value) in overrides {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

pub fn canonical_arguments_json(args: &Arguments) -> Result<String, LabError> {
    serde_json::to_string(args).map_err(|e| LabError::Serialization(e.to_string()))
}

/// Parses `a=1,b=[1,2],c=text` into overrides.
pub fn parse_assignments(text: &str) -> Result<Overrides, LabError> {
    let mut overrides = Overrides::new();
    for part in split_top_level(text) {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let Some((name, raw)) = part.split_once('=') else {
            return Err(LabError::MalformedLineage(format!(
                "expected param=value, got `{part}`"
            )));
        };
        let name = name.trim();
        if name.is_empty() {
            return Err(LabError::MalformedLineage(format!(
                "missing parameter name in `{part}`"
            )));
        }
        if overrides.insert(name.to_string(), parse_value(raw)).is_some() {
            return Err(LabError::MalformedLineage(format!(
                "parameter `{name}` assigned twice"
            )));
        }
    }
    Ok(overrides)
}

/// Splits on commas that are not nested inside brackets, braces or quotes.
pub fn split_top_level(text: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut in_quotes = false;
    let mut escaped = false;
    let mut start = 0usize;
    for (idx, ch) in text.char_indices() {
        if in_quotes {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_quotes = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_quotes = true,
            '[' | '{' | '(' => depth += 1,
            ']' | '}' | ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                parts.push(&text[start..idx]);
                start = idx + 1;
            }
            _ => {}
        }
    }
    parts.push(&text[start..]);
    parts
}
