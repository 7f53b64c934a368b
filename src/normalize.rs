//! Provider response normalization.

use serde_json::Value;

use crate::types::Usage;
use crate::{RelayError, Result};

/// Extract the generated text from a non-streaming provider body.
///
/// Accepted shapes, in order:
///
/// - chat completion: `{"choices":[{"message":{"content":"..."}}]}`
/// - single-field completion: `{"response":"..."}`
/// - wrapped single-field: `{"result":{"response":"..."}}`
///
/// A missing or null field is an [`RelayError::InvalidResponse`]. An empty
/// string is a valid (empty) completion.
pub fn normalize(body: &Value) -> Result<String> {
    body.pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .or_else(|| body.get("response").and_then(Value::as_str))
        .or_else(|| body.pointer("/result/response").and_then(Value::as_str))
        .map(str::to_owned)
        .ok_or_else(|| {
            RelayError::InvalidResponse(format!(
                "unrecognized response shape (top-level keys: {})",
                describe_keys(body)
            ))
        })
}

/// Token usage, when the provider reports it (top level or under `result`).
pub fn extract_usage(body: &Value) -> Option<Usage> {
    let usage = body
        .get("usage")
        .or_else(|| body.pointer("/result/usage"))?;
    serde_json::from_value(usage.clone()).ok()
}

fn describe_keys(body: &Value) -> String {
    match body.as_object() {
        Some(map) if !map.is_empty() => map.keys().map(String::as_str).collect::<Vec<_>>().join(", "),
        Some(_) => "none".to_string(),
        None => format!("not an object: {}", type_name(body)),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
