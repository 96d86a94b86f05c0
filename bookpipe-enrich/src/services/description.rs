//! Description field normalisation
//!
//! Open Library returns `description` in several shapes:
//! - a plain string
//! - a typed text object `{"type": "/type/text", "value": "..."}`
//! - occasionally a list of strings
//!
//! All of them collapse to one trimmed string; absent or null is `""`.

use serde_json::Value;

/// Normalise a raw `description` value to plain text
pub fn normalize_description(raw: Option<&Value>) -> String {
    let text = match raw {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Object(map)) => match map.get("value") {
            Some(Value::String(s)) => s.clone(),
            Some(other) => normalize_description(Some(other)),
            None => String::new(),
        },
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| normalize_description(Some(item)))
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("\n"),
        Some(other) => other.to_string(),
    };
    text.trim().to_string()
}

/// Extract and normalise the description from a work payload
pub fn description_from_payload(payload: &Value) -> String {
    normalize_description(payload.get("description"))
}
