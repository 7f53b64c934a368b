//! Text delta extraction from event payloads.

use serde_json::Value;
use tracing::debug;

/// Pull the text fragment out of one `data:` payload.
///
/// Understands the relay's own `{"delta": ".."}`, the catalog-model
/// `{"response": ".."}` and the chat-completion chunk
/// `{"choices":[{"delta":{"content":".."}}]}`. Returns `None` for anything
/// else, including invalid JSON; such frames are skipped, not fatal.
pub fn extract_delta(payload: &str) -> Option<String> {
    let value: Value = match serde_json::from_str(payload) {
        Ok(value) => value,
        Err(e) => {
            debug!(error = %e, "skipping malformed stream frame");
            return None;
        }
    };

    let text = value
        .get("delta")
        .and_then(Value::as_str)
        .or_else(|| value.get("response").and_then(Value::as_str))
        .or_else(|| value.pointer("/choices/0/delta/content").and_then(Value::as_str));

    if text.is_none() {
        debug!("stream frame carries no text delta");
    }
    text.map(str::to_owned)
}
