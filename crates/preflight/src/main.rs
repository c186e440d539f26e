use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use swarm_core::{Config, HealthCheck, HttpHealthCheck};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "preflight")]
#[command(about = "Check that a load test target is reachable and healthy")]
struct Args {
    /// Path to configuration file
    #[arg(long, default_value = "config/codebase.toml")]
    config: PathBuf,

    /// Extra paths probed on every base url; reported but never fatal
    #[arg(long = "also")]
    best_effort: Vec<String>,
}

/// Probes slower than this are flagged.
const SLOW_PROBE_WARN_MS: u64 = 1_000;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = Config::from_file(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;

    info!("Validating target base urls...");
    if config.target.base_urls.is_empty() {
        anyhow::bail!("target.base_urls is empty");
    }
    let mut base_urls = Vec::new();
    for u in &config.target.base_urls {
        let url = validate_base_url(u)
            .with_context(|| format!("Invalid target.base_urls entry: {u}"))?;
        base_urls.push(url);
    }

    println!();
    println!(
        "=== Preflight '{}' ({} endpoints) ===",
        config.scenario.name,
        base_urls.len()
    );

    let health = HttpHealthCheck::new(&config.target).context("Failed to build health check")?;
    for url in health.urls() {
        println!("Health: GET {url}");
    }
    let healthy = health.probe().await;

    if !args.best_effort.is_empty() {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.target.timeout_ms.max(1)))
            .build()
            .context("Failed to build HTTP client")?;
        for base in &base_urls {
            for path in &args.best_effort {
                probe_best_effort(&client, base, path).await?;
            }
        }
    }

    if !healthy {
        anyhow::bail!("Preflight failed: {} is not healthy", health.target());
    }

    println!();
    println!("Preflight OK.");
    Ok(())
}

/// Base urls are scheme + host (+ port) only; operation paths are appended.
fn validate_base_url(raw: &str) -> Result<url::Url> {
    let url = url::Url::parse(raw).with_context(|| format!("Invalid URL: {raw}"))?;

    if url.scheme() != "http" && url.scheme() != "https" {
        anyhow::bail!("Base URL must be http:// or https:// (got {raw})");
    }
    if !url.username().is_empty() || url.password().is_some() {
        anyhow::bail!("Base URL must not include credentials (got {raw})");
    }
    url.host_str().context("Base URL must include a hostname")?;

    if url.path() != "/" {
        anyhow::bail!(
            "Base URL must not include a path (got path={}, url={raw})",
            url.path()
        );
    }
    if url.query().is_some() || url.fragment().is_some() {
        anyhow::bail!("Base URL must not include query/fragment (got {raw})");
    }

    Ok(url)
}

async fn probe_best_effort(client: &reqwest::Client, base: &url::Url, path: &str) -> Result<()> {
    let url = base.join(path.trim_start_matches('/'))?;
    let start = Instant::now();
    let resp = client.get(url).send().await;
    let latency_ms = start.elapsed().as_millis() as u64;

    match resp {
        Ok(r) => {
            let status = r.status().as_u16();
            println!("GET {:<16} -> {} ({}ms)", path, status, latency_ms);
            if latency_ms > SLOW_PROBE_WARN_MS {
                warn!(
                    "{} is slow: {}ms (threshold {}ms)",
                    path, latency_ms, SLOW_PROBE_WARN_MS
                );
            }
            if status != 200 {
                warn!("{} returned non-200 (best-effort): {}", path, status);
            }
        }
        Err(e) => {
            println!("GET {:<16} -> ERROR ({}ms)", path, latency_ms);
            warn!("{} request failed (best-effort): {}", path, e);
        }
    }

    Ok(())
}
