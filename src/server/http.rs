//! HTTP surface of relayd.
//!
//! | Route | Purpose |
//! |---|---|
//! | `POST /api/chat` | either inbound shape; JSON envelope or SSE |
//! | `GET /health` | dispatch counters, breaker state, cache size |
//! | `POST /cache/clear?durable=bool` | empty the cache tiers |

use std::convert::Infallible;
use std::sync::Arc;

use axum::Router;
use axum::body::{Body, Bytes};
use axum::extract::{DefaultBodyLimit, Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use futures_util::{Stream, StreamExt, stream};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

use crate::RelayError;
use crate::gateway::{ChatPipeline, RelayOutput, RelayStream};
use crate::providers::{CircuitSnapshot, DispatchStats};
use crate::stream::DeltaStream;
use crate::types::ResponseEnvelope;

/// Response header naming the tier that served a response, or `miss`.
pub const CACHE_HEADER: &str = "x-relay-cache";
/// Response header naming the model that produced the text.
pub const MODEL_HEADER: &str = "x-relay-model";
/// Response header mirroring the envelope's `streaming` flag.
pub const STREAMING_HEADER: &str = "x-relay-streaming";

#[derive(Clone)]
struct AppState {
    pipeline: Arc<ChatPipeline>,
}

/// Build the router over a shared pipeline.
pub fn router(pipeline: Arc<ChatPipeline>) -> Router {
    Router::new()
        .route("/api/chat", post(chat))
        .route("/health", get(health))
        .route("/cache/clear", post(clear_cache))
        // the pipeline enforces its own request size limit
        .layer(DefaultBodyLimit::disable())
        .with_state(AppState { pipeline })
}

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    kind: &'static str,
    message: String,
}

impl From<&RelayError> for ErrorBody {
    fn from(e: &RelayError) -> Self {
        Self {
            error: ErrorDetail {
                kind: e.kind().as_str(),
                message: e.to_string(),
            },
        }
    }
}

/// A pipeline error rendered as `{"error":{"kind","message"}}`.
struct ApiError(RelayError);

impl From<RelayError> for ApiError {
    fn from(e: RelayError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut response = (status, Json(ErrorBody::from(&self.0))).into_response();
        if let Some(wait) = self.0.retry_after() {
            let secs = wait.as_secs().max(1);
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

async fn chat(State(state): State<AppState>, body: Bytes) -> Result<Response, ApiError> {
    match state.pipeline.handle_slice(&body).await? {
        RelayOutput::Complete(envelope) => {
            let mut response = Json(&envelope).into_response();
            envelope_headers(response.headers_mut(), &envelope);
            Ok(response)
        }
        RelayOutput::Stream(stream) => Ok(sse_response(stream)),
    }
}

/// Cache tier, model and streaming flag of `envelope` as headers.
fn envelope_headers(headers: &mut HeaderMap, envelope: &ResponseEnvelope) {
    let tier = envelope.cache_tier.map_or("miss", |t| t.as_str());
    headers.insert(CACHE_HEADER, HeaderValue::from_static(tier));
    if let Some(value) = envelope
        .model
        .as_deref()
        .and_then(|m| HeaderValue::from_str(m).ok())
    {
        headers.insert(MODEL_HEADER, value);
    }
    let streaming = if envelope.streaming { "true" } else { "false" };
    headers.insert(STREAMING_HEADER, HeaderValue::from_static(streaming));
}

fn sse_response(stream: RelayStream) -> Response {
    let envelope = stream.envelope();
    let mut response = Response::new(Body::from_stream(sse_frames(stream.deltas)));
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    envelope_headers(headers, &envelope);
    response
}

/// `data: {"delta":..}` per delta, then `data: [DONE]`. A failure, including
/// an upstream that closed before its own `[DONE]`, ends the stream with an
/// `event: error` frame instead.
fn sse_frames(deltas: DeltaStream) -> impl Stream<Item = Result<Bytes, Infallible>> + Send {
    stream::unfold(Some(deltas), |state| async move {
        let mut deltas = state?;
        match deltas.next().await {
            Some(Ok(delta)) => {
                let frame = format!("data: {}\n\n", json!({ "delta": delta }));
                Some((Bytes::from(frame), Some(deltas)))
            }
            Some(Err(e)) => {
                warn!(error = %e, "stream failed mid-response");
                let body = serde_json::to_string(&ErrorBody::from(&e)).unwrap_or_default();
                Some((Bytes::from(format!("event: error\ndata: {body}\n\n")), None))
            }
            None => Some((Bytes::from_static(b"data: [DONE]\n\n"), None)),
        }
    })
    .map(Ok)
}

#[derive(Serialize)]
struct Health {
    status: &'static str,
    version: &'static str,
    provider: String,
    default_model: String,
    dispatch: DispatchStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    circuit: Option<CircuitSnapshot>,
    cache_entries: u64,
    durable_cache: bool,
}

async fn health(State(state): State<AppState>) -> Json<Health> {
    let pipeline = &state.pipeline;
    Json(Health {
        status: "ok",
        version: crate::PKG_VERSION,
        provider: pipeline.provider_name().to_string(),
        default_model: pipeline.default_model().to_string(),
        dispatch: pipeline.stats(),
        circuit: pipeline.circuit(),
        cache_entries: pipeline.cache().local().entry_count(),
        durable_cache: pipeline.cache().has_durable(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ClearQuery {
    #[serde(default)]
    durable: bool,
}

async fn clear_cache(
    State(state): State<AppState>,
    Query(query): Query<ClearQuery>,
) -> Json<serde_json::Value> {
    state.pipeline.clear_cache(query.durable).await;
    Json(json!({ "cleared": true, "durable": query.durable }))
}
