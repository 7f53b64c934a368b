//! Response envelope returned to callers

use serde::{Deserialize, Serialize};

/// Which cache tier served a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheTier {
    Local,
    Durable,
}

impl CacheTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheTier::Local => "local",
            CacheTier::Durable => "durable",
        }
    }
}

/// Normalized response, the same shape for every provider wire format.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEnvelope {
    pub text: String,
    pub cached: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_tier: Option<CacheTier>,
    pub streaming: bool,
    /// Model identity that actually produced the text.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl ResponseEnvelope {
    /// Freshly dispatched response.
    pub fn fresh(text: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            model: Some(model.into()),
            ..Default::default()
        }
    }

    /// Response relayed from a live upstream stream.
    pub fn streamed(text: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            streaming: true,
            model: Some(model.into()),
            ..Default::default()
        }
    }

    /// Response served from a cache tier.
    pub fn from_cache(text: impl Into<String>, model: Option<String>, tier: CacheTier) -> Self {
        Self {
            text: text.into(),
            cached: true,
            cache_tier: Some(tier),
            streaming: false,
            model,
        }
    }

    /// Empty success returned for unrecognized operation payloads.
    pub fn empty() -> Self {
        Self::default()
    }
}

/// Token usage statistics, when the provider reports them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
}
