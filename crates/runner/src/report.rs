use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use swarm_core::{MetricSummary, Reporter, RunSummary};
use tracing::info;

/// Human readable summary on stdout.
pub struct ConsoleReporter;

impl Reporter for ConsoleReporter {
    fn report(&self, summary: &RunSummary) -> Result<()> {
        println!("{}", render(summary));
        Ok(())
    }
}

fn fmt_ms(value: Option<f64>) -> String {
    value
        .map(|v| format!("{v:.2}ms"))
        .unwrap_or_else(|| "n/a".to_string())
}

pub fn render(summary: &RunSummary) -> String {
    let mut out = String::new();
    out.push_str(&format!("\n=== {} Summary ===\n", summary.test_name));
    out.push_str(&format!("Transport: {}\n", summary.transport));
    out.push_str(&format!("Started: {}\n", summary.timestamp));
    out.push_str(&format!("Duration: {:.1}s\n", summary.duration_seconds));
    out.push_str(&format!(
        "VUs: peak {} ({} spawned)\n",
        summary.vus_max, summary.vus_spawned
    ));
    out.push_str(&format!("Iterations: {}\n", summary.iterations));
    out.push_str(&format!(
        "Requests: {} ({:.2}/s)\n",
        summary.requests_total, summary.requests_per_second
    ));
    out.push_str(&format!("Error rate: {:.2}%\n", summary.error_rate_percent));
    if let Some(checks) = summary.checks_passed_percent {
        out.push_str(&format!("Checks passed: {checks:.2}%\n"));
    }
    out.push_str(&format!(
        "Latency avg={} p50={} p95={} p99={} max={}\n",
        fmt_ms(summary.latency.avg),
        fmt_ms(summary.latency.med),
        fmt_ms(summary.latency.p95),
        fmt_ms(summary.latency.p99),
        fmt_ms(summary.latency.max),
    ));

    out.push_str("\nMetrics:\n");
    for (name, metric) in &summary.metrics {
        match metric {
            MetricSummary::Rate { total, trues, rate } => {
                out.push_str(&format!(
                    "  {name}: {:.2}% ({trues}/{total})\n",
                    rate * 100.0
                ));
            }
            MetricSummary::Trend(stats) => {
                out.push_str(&format!(
                    "  {name}: count={} avg={} p95={} max={}\n",
                    stats.count,
                    fmt_ms(stats.avg),
                    fmt_ms(stats.p95),
                    fmt_ms(stats.max)
                ));
            }
        }
    }

    out.push_str("\nThresholds:\n");
    for threshold in &summary.thresholds {
        let mark = if threshold.passed { "PASS" } else { "FAIL" };
        let observed = threshold
            .observed
            .map(|v| format!("{v:.4}"))
            .unwrap_or_else(|| "no data".to_string());
        out.push_str(&format!(
            "  [{mark}] {} (observed {observed})\n",
            threshold.name
        ));
    }

    out.push_str(&format!(
        "\nResult: {}\n",
        if summary.thresholds_passed {
            "PASSED"
        } else {
            "FAILED"
        }
    ));
    if !summary.post_run_healthy {
        out.push_str("Warning: target reported unhealthy after the run\n");
    }
    out
}

/// Writes `<out_dir>/<scenario>_<timestamp>.json`.
pub struct JsonFileReporter {
    out_dir: PathBuf,
}

impl JsonFileReporter {
    pub fn new(out_dir: impl Into<PathBuf>) -> Self {
        Self {
            out_dir: out_dir.into(),
        }
    }

    pub fn path_for(&self, summary: &RunSummary) -> PathBuf {
        let stamp = chrono::DateTime::parse_from_rfc3339(&summary.timestamp)
            .map(|t| t.format("%Y%m%d_%H%M%S").to_string())
            .unwrap_or_else(|_| chrono::Utc::now().format("%Y%m%d_%H%M%S").to_string());
        let name = sanitize(&summary.test_name);
        self.out_dir.join(format!("{name}_{stamp}.json"))
    }

    pub fn out_dir(&self) -> &Path {
        &self.out_dir
    }
}

impl Reporter for JsonFileReporter {
    fn report(&self, summary: &RunSummary) -> Result<()> {
        std::fs::create_dir_all(&self.out_dir)
            .with_context(|| format!("Failed to create {:?}", self.out_dir))?;
        let path = self.path_for(summary);
        let json = serde_json::to_string_pretty(summary)?;
        std::fs::write(&path, json).with_context(|| format!("Failed to write {:?}", path))?;
        info!("Results written to {}", path.display());
        Ok(())
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
