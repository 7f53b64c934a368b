//! Inbound request validation.
//!
//! Two wire shapes reach the relay:
//!
//! 1. Direct: `{ messages: [{role, content}], stream?, model? }`
//! 2. Operation: `{ operationName, variables: { data: { messages: [{ textMessage:
//!    {role, content} }], threadId? } } }`, sent by assistant frontends that
//!    speak a GraphQL-style protocol.
//!
//! [`validate`] first classifies the payload into an [`InboundRequest`]
//! variant, then normalizes either shape into a [`ChatRequest`]. Size and
//! depth limits are enforced before any message is inspected.
//!
//! Operation payloads the relay does not understand are not errors under
//! [`OperationPolicy::Lenient`]: they resolve to [`Validated::Empty`], which
//! the pipeline answers with an empty success. Frontends probe with
//! operations the relay has no business handling and expect a 200 back.
//! [`OperationPolicy::Strict`] turns those cases into validation errors.

use serde::Deserialize;
use serde_json::Value;

use crate::types::{ChatRequest, GenerationParams, Message, Role};
use crate::{RelayError, Result};

/// The one operation name that carries a chat request.
pub const CHAT_OPERATION: &str = "generateCopilotResponse";

/// Size and shape limits applied to every inbound request.
///
/// ```rust
/// # use chatrelay::validation::ValidationLimits;
/// let limits = ValidationLimits::new()
///     .max_messages(50)
///     .max_content_bytes(8 * 1024);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ValidationLimits {
    /// Maximum messages per request. Default: 100.
    pub max_messages: usize,
    /// Maximum UTF-8 bytes per message content. Default: 32 KiB.
    pub max_content_bytes: usize,
    /// Maximum serialized request size in bytes. Default: 1 MiB.
    pub max_request_bytes: usize,
    /// Maximum JSON nesting depth (top-level object = 1). Default: 16.
    pub max_depth: usize,
}

impl Default for ValidationLimits {
    fn default() -> Self {
        Self {
            max_messages: 100,
            max_content_bytes: 32 * 1024,
            max_request_bytes: 1024 * 1024,
            max_depth: 16,
        }
    }
}

impl ValidationLimits {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_messages(mut self, n: usize) -> Self {
        self.max_messages = n;
        self
    }

    pub fn max_content_bytes(mut self, n: usize) -> Self {
        self.max_content_bytes = n;
        self
    }

    pub fn max_request_bytes(mut self, n: usize) -> Self {
        self.max_request_bytes = n;
        self
    }

    pub fn max_depth(mut self, n: usize) -> Self {
        self.max_depth = n;
        self
    }
}

/// How to treat operation payloads that do not carry a usable chat request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationPolicy {
    /// Answer with an empty success (frontend compatibility).
    #[default]
    Lenient,
    /// Reject with a validation error.
    Strict,
}

/// Outcome of validation.
#[derive(Debug, Clone, PartialEq)]
pub enum Validated {
    /// A chat request ready for the pipeline.
    Chat(ChatRequest),
    /// An operation the relay acknowledges without doing anything.
    Empty { operation: String },
}

/// Inbound payload, classified by shape before any field is interpreted.
#[derive(Debug)]
pub enum InboundRequest {
    Direct(DirectChatRequest),
    Operation(OperationRequest),
}

/// Direct message-list shape.
#[derive(Debug, Deserialize)]
pub struct DirectChatRequest {
    pub messages: Vec<RawMessage>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

/// Nested operation shape. `variables` stays untyped until the operation
/// name is known to be one the relay handles.
#[derive(Debug)]
pub struct OperationRequest {
    pub operation_name: String,
    pub variables: Option<Value>,
}

/// A message before role and size checks.
#[derive(Debug, Deserialize)]
pub struct RawMessage {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Deserialize)]
struct OperationVariables {
    data: OperationData,
}

#[derive(Deserialize)]
struct OperationData {
    messages: Vec<OperationMessage>,
    #[serde(default, rename = "threadId")]
    thread_id: Option<String>,
}

#[derive(Deserialize)]
struct OperationMessage {
    #[serde(default, rename = "textMessage")]
    text_message: Option<RawMessage>,
}

impl InboundRequest {
    /// Classify a JSON payload into one of the two inbound shapes.
    pub fn parse(raw: &Value) -> Result<Self> {
        let Some(object) = raw.as_object() else {
            return Err(RelayError::Validation(
                "request body must be a JSON object".to_string(),
            ));
        };

        if let Some(name) = object.get("operationName") {
            return Ok(InboundRequest::Operation(OperationRequest {
                operation_name: name.as_str().unwrap_or_default().to_string(),
                variables: object.get("variables").cloned(),
            }));
        }

        if !object.contains_key("messages") {
            return Err(RelayError::Validation(
                "request must contain 'messages' or 'operationName'".to_string(),
            ));
        }

        DirectChatRequest::deserialize(raw)
            .map(InboundRequest::Direct)
            .map_err(|e| RelayError::Validation(format!("malformed request: {e}")))
    }
}

/// Validate raw request bytes.
///
/// The byte-size limit is checked before parsing, so oversized bodies are
/// never deserialized.
pub fn validate_slice(
    body: &[u8],
    limits: &ValidationLimits,
    policy: OperationPolicy,
) -> Result<Validated> {
    check_request_size(body.len(), limits)?;
    let raw: Value = serde_json::from_slice(body)
        .map_err(|e| RelayError::Validation(format!("request body is not valid JSON: {e}")))?;
    validate_parsed(&raw, limits, policy)
}

/// Validate an already-parsed JSON payload.
pub fn validate(raw: &Value, limits: &ValidationLimits, policy: OperationPolicy) -> Result<Validated> {
    let size = serde_json::to_vec(raw)?.len();
    check_request_size(size, limits)?;
    validate_parsed(raw, limits, policy)
}

fn validate_parsed(
    raw: &Value,
    limits: &ValidationLimits,
    policy: OperationPolicy,
) -> Result<Validated> {
    if exceeds_depth(raw, limits.max_depth) {
        return Err(RelayError::Validation(format!(
            "request nesting exceeds maximum depth of {}",
            limits.max_depth
        )));
    }

    match InboundRequest::parse(raw)? {
        InboundRequest::Direct(direct) => {
            let messages = check_messages(direct.messages, limits)?;
            let params = GenerationParams {
                temperature: direct.temperature,
                top_p: direct.top_p,
                max_tokens: direct.max_tokens,
            };
            Ok(Validated::Chat(ChatRequest {
                messages,
                model: direct.model.filter(|m| !m.is_empty()),
                stream: direct.stream,
                thread_id: None,
                params,
            }))
        }
        InboundRequest::Operation(op) => validate_operation(op, limits, policy),
    }
}

fn validate_operation(
    op: OperationRequest,
    limits: &ValidationLimits,
    policy: OperationPolicy,
) -> Result<Validated> {
    let unusable = |reason: String| match policy {
        OperationPolicy::Lenient => {
            tracing::debug!(operation = %op.operation_name, %reason, "answering operation with empty response");
            Ok(Validated::Empty {
                operation: op.operation_name.clone(),
            })
        }
        OperationPolicy::Strict => Err(RelayError::Validation(reason)),
    };

    if op.operation_name != CHAT_OPERATION {
        return unusable(format!("unsupported operation '{}'", op.operation_name));
    }

    let Some(variables) = op.variables.clone() else {
        return unusable("operation is missing 'variables'".to_string());
    };
    let data = match serde_json::from_value::<OperationVariables>(variables) {
        Ok(vars) => vars.data,
        Err(e) => return unusable(format!("malformed operation variables: {e}")),
    };

    let raw: Vec<RawMessage> = data
        .messages
        .into_iter()
        .filter_map(|m| m.text_message)
        .collect();
    if raw.is_empty() {
        return unusable("operation carries no text messages".to_string());
    }

    let messages = check_messages(raw, limits)?;
    Ok(Validated::Chat(ChatRequest {
        messages,
        model: None,
        stream: false,
        thread_id: data.thread_id.filter(|t| !t.is_empty()),
        params: GenerationParams::default(),
    }))
}

fn check_request_size(size: usize, limits: &ValidationLimits) -> Result<()> {
    if size > limits.max_request_bytes {
        return Err(RelayError::Validation(format!(
            "request is {size} bytes (max {})",
            limits.max_request_bytes
        )));
    }
    Ok(())
}

fn check_messages(raw: Vec<RawMessage>, limits: &ValidationLimits) -> Result<Vec<Message>> {
    if raw.is_empty() {
        return Err(RelayError::Validation(
            "messages must not be empty".to_string(),
        ));
    }
    if raw.len() > limits.max_messages {
        return Err(RelayError::Validation(format!(
            "too many messages: {} (max {})",
            raw.len(),
            limits.max_messages
        )));
    }

    raw.into_iter()
        .enumerate()
        .map(|(i, m)| {
            let role_name = m
                .role
                .ok_or_else(|| RelayError::Validation(format!("message {i}: missing role")))?;
            let role = Role::parse(&role_name).ok_or_else(|| {
                RelayError::Validation(format!("message {i}: role '{role_name}' is not allowed"))
            })?;
            let content = m
                .content
                .ok_or_else(|| RelayError::Validation(format!("message {i}: missing content")))?;
            if content.len() > limits.max_content_bytes {
                return Err(RelayError::Validation(format!(
                    "message {i}: content is {} bytes (max {})",
                    content.len(),
                    limits.max_content_bytes
                )));
            }
            Ok(Message { role, content })
        })
        .collect()
}

/// Whether `value` nests deeper than `max`. Objects and arrays each add one
/// level; scalars add none.
fn exceeds_depth(value: &Value, max: usize) -> bool {
    fn depth_over(value: &Value, level: usize, max: usize) -> bool {
        match value {
            Value::Object(map) => {
                level + 1 > max || map.values().any(|v| depth_over(v, level + 1, max))
            }
            Value::Array(items) => {
                level + 1 > max || items.iter().any(|v| depth_over(v, level + 1, max))
            }
            _ => false,
        }
    }
    depth_over(value, 0, max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn depth_counts_containers_only() {
        let v = json!({"a": {"b": [1, 2]}});
        assert!(!exceeds_depth(&v, 3));
        assert!(exceeds_depth(&v, 2));
        assert!(!exceeds_depth(&json!("scalar"), 0));
    }

    #[test]
    fn operation_name_wins_over_messages() {
        let raw = json!({"operationName": "other", "messages": []});
        assert!(matches!(
            InboundRequest::parse(&raw).unwrap(),
            InboundRequest::Operation(_)
        ));
    }

    #[test]
    fn non_object_body_rejected() {
        let err = InboundRequest::parse(&json!([1, 2])).unwrap_err();
        assert!(matches!(err, RelayError::Validation(_)));
    }

    #[test]
    fn empty_model_override_is_ignored() {
        let raw = json!({"messages": [{"role": "user", "content": "hi"}], "model": ""});
        let Validated::Chat(req) =
            validate(&raw, &ValidationLimits::default(), OperationPolicy::Lenient).unwrap()
        else {
            panic!("expected chat request");
        };
        assert!(req.model.is_none());
    }
}
