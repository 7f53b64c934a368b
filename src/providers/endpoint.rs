//! Base URL selection.
//!
//! A deployment may list several equivalent API base URLs (regional
//! gateways, a direct endpoint). At startup the relay probes all of them
//! concurrently and keeps the first one that answers. The whole probe is
//! bounded by `probe_timeout`; if nothing answers in time, the default URL
//! is used. Any HTTP response counts as reachable, including 401 and 404:
//! the probe measures the network path, not the credentials.

use std::time::Duration;

use futures_util::future::{BoxFuture, select_ok};
use reqwest::Client;
use tracing::{debug, info, warn};

/// Candidate base URLs plus the fallback.
#[derive(Debug, Clone)]
pub struct EndpointProbe {
    default_url: String,
    candidates: Vec<String>,
    probe_timeout: Duration,
}

impl EndpointProbe {
    pub fn new(default_url: impl Into<String>) -> Self {
        Self {
            default_url: default_url.into(),
            candidates: Vec::new(),
            probe_timeout: Duration::from_millis(1500),
        }
    }

    pub fn candidates<I, S>(mut self, urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.candidates = urls.into_iter().map(Into::into).collect();
        self
    }

    /// Upper bound on the whole probe. Default: 1.5s.
    pub fn probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Pick the fastest reachable candidate, or the default URL.
    pub async fn select(&self) -> String {
        if self.candidates.is_empty() {
            return self.default_url.clone();
        }

        let http = match Client::builder()
            .timeout(self.probe_timeout)
            .user_agent(crate::version::user_agent())
            .build()
        {
            Ok(http) => http,
            Err(e) => {
                warn!(error = %e, "could not build probe client, using default endpoint");
                return self.default_url.clone();
            }
        };

        let probes: Vec<BoxFuture<'_, Result<String, reqwest::Error>>> = self
            .candidates
            .iter()
            .map(|url| {
                let http = http.clone();
                let probe: BoxFuture<'_, _> = Box::pin(async move {
                    http.head(url).send().await?;
                    Ok(url.clone())
                });
                probe
            })
            .collect();

        match tokio::time::timeout(self.probe_timeout, select_ok(probes)).await {
            Ok(Ok((url, _))) => {
                info!(endpoint = %url, "selected endpoint");
                url
            }
            Ok(Err(e)) => {
                warn!(error = %e, default = %self.default_url, "no endpoint reachable, using default");
                self.default_url.clone()
            }
            Err(_) => {
                debug!(
                    timeout_ms = self.probe_timeout.as_millis() as u64,
                    "endpoint probe timed out, using default"
                );
                self.default_url.clone()
            }
        }
    }
}
