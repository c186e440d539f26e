use anyhow::{Context, Result};
use parking_lot::Mutex;
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::sleep;

use crate::config::{HttpMethod, TargetConfig};

/// One request as the virtual user loop hands it to the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestSpec {
    /// Operation name, useful for tagging on the transport side
    pub operation: String,
    pub method: HttpMethod,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    pub body: String,
}

/// Trait for request/response adapters against the service under test.
///
/// `Err` means the exchange itself failed (connect error, timeout); the
/// caller turns it into a failed outcome.
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;

    fn execute<'a>(
        &'a self,
        request: &'a RequestSpec,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<TransportResponse>> + Send + 'a>>;
}

/// Mock transport for testing: fixed latency, optional injected failures.
pub struct MockTransport {
    latency: Duration,
    error_rate: f64,
    body: String,
    rng: Mutex<StdRng>,
}

impl MockTransport {
    pub fn new(latency: Duration) -> Self {
        Self {
            latency,
            error_rate: 0.0,
            body: r#"{"results":[],"success":true}"#.to_string(),
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Answer with status 500 for roughly `error_rate` of the requests.
    pub fn with_error_rate(mut self, error_rate: f64) -> Self {
        self.error_rate = error_rate.clamp(0.0, 1.0);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }
}

impl Transport for MockTransport {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn execute<'a>(
        &'a self,
        _request: &'a RequestSpec,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<TransportResponse>> + Send + 'a>> {
        Box::pin(async move {
            let fail = self.rng.lock().gen::<f64>() < self.error_rate;
            sleep(self.latency).await;

            if fail {
                Ok(TransportResponse {
                    status: 500,
                    body: r#"{"error":"injected failure"}"#.to_string(),
                })
            } else {
                Ok(TransportResponse {
                    status: 200,
                    body: self.body.clone(),
                })
            }
        })
    }
}

/// HTTP/JSON transport over a shared `reqwest` client.
pub struct HttpJsonTransport {
    client: reqwest::Client,
    base_urls: Vec<String>,
    current_url_idx: AtomicUsize,
}

impl HttpJsonTransport {
    pub fn new(target: &TargetConfig) -> Result<Self> {
        if target.base_urls.is_empty() {
            anyhow::bail!("at least one base url is required");
        }

        let mut builder = reqwest::Client::builder()
            .timeout(Duration::from_millis(target.timeout_ms))
            .tcp_keepalive(Duration::from_secs(30));
        if let Some(agent) = &target.user_agent {
            builder = builder.user_agent(agent.clone());
        }
        let client = builder.build().context("failed to build HTTP client")?;

        Ok(Self {
            client,
            base_urls: target
                .base_urls
                .iter()
                .map(|u| u.trim_end_matches('/').to_string())
                .collect(),
            current_url_idx: AtomicUsize::new(0),
        })
    }

    fn next_url(&self) -> &str {
        let idx = self.current_url_idx.fetch_add(1, Ordering::Relaxed);
        &self.base_urls[idx % self.base_urls.len()]
    }
}

impl Transport for HttpJsonTransport {
    fn name(&self) -> &'static str {
        "http"
    }

    fn execute<'a>(
        &'a self,
        request: &'a RequestSpec,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<TransportResponse>> + Send + 'a>> {
        Box::pin(async move {
            let url = format!("{}{}", self.next_url(), request.path);
            let method = match request.method {
                HttpMethod::Get => reqwest::Method::GET,
                HttpMethod::Post => reqwest::Method::POST,
                HttpMethod::Put => reqwest::Method::PUT,
                HttpMethod::Patch => reqwest::Method::PATCH,
                HttpMethod::Delete => reqwest::Method::DELETE,
            };

            let mut builder = self.client.request(method, &url);
            if let Some(body) = &request.body {
                builder = builder.json(body);
            }

            let response = builder
                .send()
                .await
                .with_context(|| format!("{} {url} failed", request.operation))?;
            let status = response.status().as_u16();
            let body = response
                .text()
                .await
                .with_context(|| format!("reading body of {url}"))?;

            Ok(TransportResponse { status, body })
        })
    }
}
