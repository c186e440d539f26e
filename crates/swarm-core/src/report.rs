use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::metrics::{MetricSnapshot, TrendStats, CHECKS, HTTP_REQ_DURATION, HTTP_REQ_FAILED};
use crate::run::RunOutcome;
use crate::threshold::ThresholdResult;

/// Sink for the end-of-run summary (console, file, ...).
pub trait Reporter {
    fn report(&self, summary: &RunSummary) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MetricSummary {
    Rate { total: u64, trues: u64, rate: f64 },
    Trend(TrendStats),
}

impl From<&MetricSnapshot> for MetricSummary {
    fn from(snapshot: &MetricSnapshot) -> Self {
        match snapshot {
            MetricSnapshot::Rate(rate) => MetricSummary::Rate {
                total: rate.total,
                trues: rate.trues,
                rate: rate.rate(),
            },
            MetricSnapshot::Trend(trend) => MetricSummary::Trend(trend.stats()),
        }
    }
}

/// Read-only end-of-run report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub test_name: String,
    pub transport: String,
    /// RFC 3339 start of the run
    pub timestamp: String,
    pub duration_seconds: f64,
    pub vus_max: u64,
    pub vus_spawned: u64,
    pub iterations: u64,
    pub requests_total: u64,
    pub requests_per_second: f64,
    pub error_rate_percent: f64,
    pub checks_passed_percent: Option<f64>,
    pub latency: TrendStats,
    pub metrics: BTreeMap<String, MetricSummary>,
    pub thresholds: Vec<ThresholdResult>,
    pub thresholds_passed: bool,
    pub post_run_healthy: bool,
}

impl RunSummary {
    pub fn from_outcome(outcome: &RunOutcome) -> Self {
        let snapshot = &outcome.snapshot;
        let duration_seconds = outcome.stats.elapsed.as_secs_f64();

        let latency = snapshot
            .trend(HTTP_REQ_DURATION)
            .map(|t| t.stats())
            .unwrap_or_default();
        let failed = snapshot.rate(HTTP_REQ_FAILED).copied().unwrap_or_default();
        let requests_total = failed.total;
        let requests_per_second = if duration_seconds > 0.0 {
            requests_total as f64 / duration_seconds
        } else {
            0.0
        };
        let checks_passed_percent = snapshot
            .rate(CHECKS)
            .filter(|c| c.total > 0)
            .map(|c| c.rate() * 100.0);

        Self {
            test_name: outcome.scenario.clone(),
            transport: outcome.transport.to_string(),
            timestamp: outcome.started_at.to_rfc3339(),
            duration_seconds,
            vus_max: outcome.stats.peak_vus,
            vus_spawned: outcome.stats.vus_spawned,
            iterations: outcome.stats.iterations,
            requests_total,
            requests_per_second,
            error_rate_percent: failed.rate() * 100.0,
            checks_passed_percent,
            latency,
            metrics: snapshot
                .metrics
                .iter()
                .map(|(name, metric)| (name.clone(), MetricSummary::from(metric)))
                .collect(),
            thresholds: outcome.verdict.thresholds.clone(),
            thresholds_passed: outcome.verdict.passed,
            post_run_healthy: outcome.post_run_healthy,
        }
    }
}
