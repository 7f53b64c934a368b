//! Workers AI client.
//!
//! Two endpoint shapes, chosen by model family:
//!
//! - `@cf/...` and `@hf/...` catalog models: `POST {base}/run/{model}` with
//!   `{ messages, stream?, ... }`. Responses look like
//!   `{ "result": { "response": "..." } }`.
//! - everything else: OpenAI-compatible `POST {base}/v1/chat/completions`
//!   with `{ model, messages, stream?, ... }`.
//!
//! See: <https://developers.cloudflare.com/workers-ai/>

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use serde_json::Value;

use super::traits::{ByteStream, InferenceProvider};
use crate::types::{GenerationParams, Message};
use crate::{RelayError, Result};

/// Default API root; the account id is appended by [`WorkersAiClient::for_account`].
const DEFAULT_API_ROOT: &str = "https://api.cloudflare.com/client/v4";

/// Upstream error bodies are truncated to this many bytes in error messages.
const MAX_ERROR_BODY: usize = 512;

/// Which request shape a model uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    /// `/v1/chat/completions`, model in the body.
    ChatCompletions,
    /// `/run/{model}`, model in the path.
    Run,
}

impl EndpointKind {
    pub fn for_model(model: &str) -> Self {
        if model.starts_with("@cf/") || model.starts_with("@hf/") {
            EndpointKind::Run
        } else {
            EndpointKind::ChatCompletions
        }
    }
}

/// Client for the Workers AI REST API.
#[derive(Clone)]
pub struct WorkersAiClient {
    api_key: String,
    http: Client,
    base_url: String,
}

impl std::fmt::Debug for WorkersAiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkersAiClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

#[derive(Serialize)]
struct ChatCompletionsBody<'a> {
    model: &'a str,
    messages: &'a [Message],
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
    #[serde(flatten)]
    params: &'a GenerationParams,
}

#[derive(Serialize)]
struct RunBody<'a> {
    messages: &'a [Message],
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
    #[serde(flatten)]
    params: &'a GenerationParams,
}

impl WorkersAiClient {
    /// Client for an account's Workers AI endpoint.
    pub fn for_account(account_id: &str, api_key: impl Into<String>) -> Result<Self> {
        Self::with_base_url(
            api_key,
            format!("{DEFAULT_API_ROOT}/accounts/{account_id}/ai"),
        )
    }

    /// Client with a custom base URL (gateways, wiremock).
    pub fn with_base_url(api_key: impl Into<String>, base_url: impl Into<String>) -> Result<Self> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .user_agent(crate::version::user_agent())
            .build()
            .map_err(|e| RelayError::Configuration(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            api_key: api_key.into(),
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post(
        &self,
        model: &str,
        messages: &[Message],
        params: &GenerationParams,
        stream: bool,
    ) -> Result<reqwest::Response> {
        let stream = stream.then_some(true);
        let request = match EndpointKind::for_model(model) {
            EndpointKind::Run => self
                .http
                .post(format!("{}/run/{}", self.base_url, model))
                .json(&RunBody {
                    messages,
                    stream,
                    params,
                }),
            EndpointKind::ChatCompletions => self
                .http
                .post(format!("{}/v1/chat/completions", self.base_url))
                .json(&ChatCompletionsBody {
                    model,
                    messages,
                    stream,
                    params,
                }),
        };

        let response = request
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| RelayError::Http(e.to_string()))?;

        if response.status().is_success() {
            Ok(response)
        } else {
            Err(Self::error_from_response(response, model).await)
        }
    }

    async fn error_from_response(response: reqwest::Response, model: &str) -> RelayError {
        let status = response.status();
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok())
            .map(Duration::from_secs);

        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => RelayError::AuthenticationFailed,
            StatusCode::NOT_FOUND => RelayError::ModelNotFound(model.to_string()),
            StatusCode::TOO_MANY_REQUESTS => RelayError::RateLimited { retry_after },
            _ => {
                let mut body = response.text().await.unwrap_or_default();
                if body.len() > MAX_ERROR_BODY {
                    let mut cut = MAX_ERROR_BODY;
                    while !body.is_char_boundary(cut) {
                        cut -= 1;
                    }
                    body.truncate(cut);
                }
                RelayError::Api {
                    status: status.as_u16(),
                    message: if body.is_empty() {
                        format!("Workers AI error: {status}")
                    } else {
                        body
                    },
                }
            }
        }
    }
}

#[async_trait]
impl InferenceProvider for WorkersAiClient {
    fn name(&self) -> &str {
        "workers-ai"
    }

    async fn complete(
        &self,
        model: &str,
        messages: &[Message],
        params: &GenerationParams,
    ) -> Result<Value> {
        let response = self.post(model, messages, params, false).await?;
        response
            .json()
            .await
            .map_err(|e| RelayError::InvalidResponse(e.to_string()))
    }

    async fn complete_stream(
        &self,
        model: &str,
        messages: &[Message],
        params: &GenerationParams,
    ) -> Result<ByteStream> {
        let response = self.post(model, messages, params, true).await?;
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| RelayError::Stream(e.to_string())));
        Ok(Box::pin(body))
    }
}
