use std::pin::Pin;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::config::TargetConfig;

/// Liveness probe against the service under test, run before and after a load test.
pub trait HealthCheck: Send + Sync {
    /// Where the probe points, for logs and error messages
    fn target(&self) -> String;

    fn probe(&self) -> Pin<Box<dyn std::future::Future<Output = bool> + Send + '_>>;
}

/// `GET <base_url><health_path>` on every base url; healthy only if all answer 200.
pub struct HttpHealthCheck {
    client: reqwest::Client,
    urls: Vec<String>,
}

impl HttpHealthCheck {
    pub fn new(target: &TargetConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(target.timeout_ms.max(1)))
            .build()?;
        let urls = target
            .base_urls
            .iter()
            .map(|base| format!("{}{}", base.trim_end_matches('/'), target.health_path))
            .collect();
        Ok(Self { client, urls })
    }

    pub fn urls(&self) -> &[String] {
        &self.urls
    }
}

impl HealthCheck for HttpHealthCheck {
    fn target(&self) -> String {
        self.urls.join(", ")
    }

    fn probe(&self) -> Pin<Box<dyn std::future::Future<Output = bool> + Send + '_>> {
        Box::pin(async move {
            let mut healthy = !self.urls.is_empty();
            for url in &self.urls {
                let start = Instant::now();
                match self.client.get(url).send().await {
                    Ok(r) if r.status().as_u16() == 200 => {
                        info!(%url, latency_ms = start.elapsed().as_millis() as u64, "health check ok");
                    }
                    Ok(r) => {
                        warn!(%url, status = r.status().as_u16(), "health check returned non-200");
                        healthy = false;
                    }
                    Err(e) => {
                        warn!(%url, error = %e, "health check request failed");
                        healthy = false;
                    }
                }
            }
            healthy
        })
    }
}

/// Health check with a fixed answer, for tests and `--skip-health` style runs.
pub struct StaticHealth(pub bool);

impl HealthCheck for StaticHealth {
    fn target(&self) -> String {
        "static".to_string()
    }

    fn probe(&self) -> Pin<Box<dyn std::future::Future<Output = bool> + Send + '_>> {
        let healthy = self.0;
        Box::pin(async move { healthy })
    }
}
