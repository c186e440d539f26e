use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::warn;

use crate::error::ConfigError;

/// Latency of every executed operation, in milliseconds.
pub const HTTP_REQ_DURATION: &str = "http_req_duration";
/// `true` for every failed operation.
pub const HTTP_REQ_FAILED: &str = "http_req_failed";
/// One observation per evaluated response check, `true` when it passed.
pub const CHECKS: &str = "checks";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Rate,
    Trend,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Rate => "rate",
            MetricKind::Trend => "trend",
        }
    }
}

/// Fraction of boolean observations that are `true`.
#[derive(Debug, Default)]
pub struct RateRecorder {
    total: AtomicU64,
    trues: AtomicU64,
}

impl RateRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, observation: bool) {
        // trues first so a concurrent reader never sees trues > total
        if observation {
            self.trues.fetch_add(1, Ordering::Relaxed);
        }
        self.total.fetch_add(1, Ordering::AcqRel);
    }

    pub fn snapshot(&self) -> RateSnapshot {
        let total = self.total.load(Ordering::Acquire);
        let trues = self.trues.load(Ordering::Relaxed).min(total);
        RateSnapshot { total, trues }
    }
}

/// Distribution of numeric observations. Values are kept in full so that
/// percentiles are exact.
#[derive(Debug, Default)]
pub struct TrendRecorder {
    values: Mutex<Vec<f64>>,
    rejected: AtomicU64,
}

impl TrendRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `value`. NaN and infinities carry no latency information and
    /// are rejected; they are counted in [`TrendRecorder::rejected`].
    pub fn add(&self, value: f64) {
        if !value.is_finite() {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            warn!(value, "rejected non-finite trend observation");
            return;
        }
        self.values.lock().push(value);
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> TrendSnapshot {
        let values = self.values.lock().clone();
        TrendSnapshot::from_values(values)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateSnapshot {
    pub total: u64,
    pub trues: u64,
}

impl RateSnapshot {
    /// `trues / total`, or 0 when nothing was observed.
    pub fn rate(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.trues as f64 / self.total as f64
    }
}

/// Sorted copy of a trend's observations taken at read time.
#[derive(Debug, Clone, PartialEq)]
pub struct TrendSnapshot {
    sorted: Vec<f64>,
    sum: f64,
}

impl TrendSnapshot {
    /// Non-finite values are excluded; recorders never hold any.
    pub fn from_values(mut values: Vec<f64>) -> Self {
        values.retain(|v| v.is_finite());
        values.sort_by(|a, b| a.total_cmp(b));
        let sum = values.iter().sum();
        Self {
            sorted: values,
            sum,
        }
    }

    pub fn count(&self) -> u64 {
        self.sorted.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.sorted.is_empty()
    }

    pub fn min(&self) -> Option<f64> {
        self.sorted.first().copied()
    }

    pub fn max(&self) -> Option<f64> {
        self.sorted.last().copied()
    }

    pub fn mean(&self) -> Option<f64> {
        if self.sorted.is_empty() {
            return None;
        }
        // clamp: summation error must not push the mean outside [min, max]
        let mean = self.sum / self.sorted.len() as f64;
        Some(mean.clamp(self.sorted[0], self.sorted[self.sorted.len() - 1]))
    }

    pub fn median(&self) -> Option<f64> {
        self.percentile(50.0)
    }

    /// Exact percentile, linearly interpolated between the two closest ranks.
    pub fn percentile(&self, p: f64) -> Option<f64> {
        if self.sorted.is_empty() {
            return None;
        }
        let p = p.clamp(0.0, 100.0);
        let rank = p / 100.0 * (self.sorted.len() - 1) as f64;
        let lower = rank.floor() as usize;
        let upper = rank.ceil() as usize;
        let low = self.sorted[lower];
        let high = self.sorted[upper];
        Some(low + (high - low) * (rank - lower as f64))
    }

    pub fn stats(&self) -> TrendStats {
        TrendStats {
            count: self.count(),
            min: self.min(),
            max: self.max(),
            avg: self.mean(),
            med: self.median(),
            p90: self.percentile(90.0),
            p95: self.percentile(95.0),
            p99: self.percentile(99.0),
        }
    }
}

/// Serializable trend summary for reports.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrendStats {
    pub count: u64,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub avg: Option<f64>,
    pub med: Option<f64>,
    pub p90: Option<f64>,
    pub p95: Option<f64>,
    pub p99: Option<f64>,
}

#[derive(Debug, Clone)]
pub enum Recorder {
    Rate(Arc<RateRecorder>),
    Trend(Arc<TrendRecorder>),
}

impl Recorder {
    pub fn kind(&self) -> MetricKind {
        match self {
            Recorder::Rate(_) => MetricKind::Rate,
            Recorder::Trend(_) => MetricKind::Trend,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MetricSnapshot {
    Rate(RateSnapshot),
    Trend(TrendSnapshot),
}

impl MetricSnapshot {
    pub fn kind(&self) -> MetricKind {
        match self {
            MetricSnapshot::Rate(_) => MetricKind::Rate,
            MetricSnapshot::Trend(_) => MetricKind::Trend,
        }
    }

    /// Number of observations behind this metric.
    pub fn count(&self) -> u64 {
        match self {
            MetricSnapshot::Rate(rate) => rate.total,
            MetricSnapshot::Trend(trend) => trend.count(),
        }
    }
}

/// Immutable view of every metric at one point in time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsSnapshot {
    pub metrics: BTreeMap<String, MetricSnapshot>,
}

impl MetricsSnapshot {
    pub fn get(&self, name: &str) -> Option<&MetricSnapshot> {
        self.metrics.get(name)
    }

    pub fn rate(&self, name: &str) -> Option<&RateSnapshot> {
        match self.metrics.get(name)? {
            MetricSnapshot::Rate(rate) => Some(rate),
            MetricSnapshot::Trend(_) => None,
        }
    }

    pub fn trend(&self, name: &str) -> Option<&TrendSnapshot> {
        match self.metrics.get(name)? {
            MetricSnapshot::Trend(trend) => Some(trend),
            MetricSnapshot::Rate(_) => None,
        }
    }
}

/// Owner of every named recorder in a run.
///
/// Recorders are registered while the run is being set up; the registry is
/// then shared read-only behind an `Arc` and writes go through the recorder
/// handles.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    recorders: BTreeMap<String, Recorder>,
}

impl MetricsRegistry {
    /// Registry pre-populated with the built-in request metrics.
    pub fn new() -> Self {
        let mut registry = Self::default();
        registry.recorders.insert(
            HTTP_REQ_DURATION.to_string(),
            Recorder::Trend(Arc::new(TrendRecorder::new())),
        );
        registry.recorders.insert(
            HTTP_REQ_FAILED.to_string(),
            Recorder::Rate(Arc::new(RateRecorder::new())),
        );
        registry.recorders.insert(
            CHECKS.to_string(),
            Recorder::Rate(Arc::new(RateRecorder::new())),
        );
        registry
    }

    /// Get or create a rate recorder. Sharing one name between operations is
    /// allowed, reusing it for a trend is not.
    pub fn rate(&mut self, name: &str) -> Result<Arc<RateRecorder>, ConfigError> {
        match self
            .recorders
            .entry(name.to_string())
            .or_insert_with(|| Recorder::Rate(Arc::new(RateRecorder::new())))
        {
            Recorder::Rate(rate) => Ok(Arc::clone(rate)),
            Recorder::Trend(_) => Err(ConfigError::MetricKindConflict(name.to_string())),
        }
    }

    pub fn trend(&mut self, name: &str) -> Result<Arc<TrendRecorder>, ConfigError> {
        match self
            .recorders
            .entry(name.to_string())
            .or_insert_with(|| Recorder::Trend(Arc::new(TrendRecorder::new())))
        {
            Recorder::Trend(trend) => Ok(Arc::clone(trend)),
            Recorder::Rate(_) => Err(ConfigError::MetricKindConflict(name.to_string())),
        }
    }

    pub fn kind_of(&self, name: &str) -> Option<MetricKind> {
        self.recorders.get(name).map(Recorder::kind)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.recorders.keys().map(String::as_str)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let metrics = self
            .recorders
            .iter()
            .map(|(name, recorder)| {
                let snapshot = match recorder {
                    Recorder::Rate(rate) => MetricSnapshot::Rate(rate.snapshot()),
                    Recorder::Trend(trend) => MetricSnapshot::Trend(trend.snapshot()),
                };
                (name.clone(), snapshot)
            })
            .collect();
        MetricsSnapshot { metrics }
    }
}
