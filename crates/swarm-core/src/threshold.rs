//! Threshold expressions and the end-of-run verdict.
//!
//! An expression has the form `AGG OP VALUE`, for example `p(95)<2000`,
//! `rate<0.01` or `count>0`. Supported aggregations:
//!
//! | aggregation | rate metric | trend metric |
//! |-------------|-------------|--------------|
//! | `rate`      | yes         | no           |
//! | `count`     | yes         | yes          |
//! | `avg`, `min`, `max`, `med`, `p(N)` | no | yes |
//!
//! A threshold on a metric with no observations fails; the result carries
//! `observed: None` so reports can print "no data" instead of a number.
//! Every declared threshold gates the verdict.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::ConfigError;
use crate::metrics::{MetricKind, MetricSnapshot, MetricsRegistry, MetricsSnapshot};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Aggregation {
    Rate,
    Count,
    Avg,
    Min,
    Max,
    Med,
    Percentile(f64),
}

impl Aggregation {
    fn supports(&self, kind: MetricKind) -> bool {
        match self {
            Aggregation::Count => true,
            Aggregation::Rate => kind == MetricKind::Rate,
            _ => kind == MetricKind::Trend,
        }
    }
}

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Aggregation::Rate => write!(f, "rate"),
            Aggregation::Count => write!(f, "count"),
            Aggregation::Avg => write!(f, "avg"),
            Aggregation::Min => write!(f, "min"),
            Aggregation::Max => write!(f, "max"),
            Aggregation::Med => write!(f, "med"),
            Aggregation::Percentile(p) => write!(f, "p({p})"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl Comparison {
    fn holds(&self, observed: f64, required: f64) -> bool {
        match self {
            Comparison::Lt => observed < required,
            Comparison::Le => observed <= required,
            Comparison::Gt => observed > required,
            Comparison::Ge => observed >= required,
            Comparison::Eq => observed == required,
            Comparison::Ne => observed != required,
        }
    }
}

impl fmt::Display for Comparison {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Comparison::Lt => "<",
            Comparison::Le => "<=",
            Comparison::Gt => ">",
            Comparison::Ge => ">=",
            Comparison::Eq => "==",
            Comparison::Ne => "!=",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThresholdExpr {
    pub aggregation: Aggregation,
    pub comparison: Comparison,
    pub value: f64,
}

impl ThresholdExpr {
    /// Aggregate value of `metric` this expression compares, `None` without data.
    pub fn observe(&self, metric: &MetricSnapshot) -> Option<f64> {
        if metric.count() == 0 {
            return None;
        }
        match (metric, self.aggregation) {
            (_, Aggregation::Count) => Some(metric.count() as f64),
            (MetricSnapshot::Rate(rate), Aggregation::Rate) => Some(rate.rate()),
            (MetricSnapshot::Trend(trend), Aggregation::Avg) => trend.mean(),
            (MetricSnapshot::Trend(trend), Aggregation::Min) => trend.min(),
            (MetricSnapshot::Trend(trend), Aggregation::Max) => trend.max(),
            (MetricSnapshot::Trend(trend), Aggregation::Med) => trend.median(),
            (MetricSnapshot::Trend(trend), Aggregation::Percentile(p)) => trend.percentile(p),
            _ => None,
        }
    }
}

impl fmt::Display for ThresholdExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.aggregation, self.comparison, self.value)
    }
}

/// Parse `AGG OP VALUE`; whitespace around the parts is ignored.
pub fn parse_threshold_expr(raw: &str) -> Result<ThresholdExpr, String> {
    let op_start = raw
        .find(['<', '>', '=', '!'])
        .ok_or_else(|| "missing comparison operator".to_string())?;
    let (lhs, rest) = raw.split_at(op_start);

    let (comparison, rhs) = [
        ("<=", Comparison::Le),
        (">=", Comparison::Ge),
        ("==", Comparison::Eq),
        ("!=", Comparison::Ne),
        ("<", Comparison::Lt),
        (">", Comparison::Gt),
    ]
    .into_iter()
    .find_map(|(token, cmp)| rest.strip_prefix(token).map(|rhs| (cmp, rhs)))
    .ok_or_else(|| format!("unknown operator in '{rest}'"))?;

    let value: f64 = rhs
        .trim()
        .parse()
        .map_err(|_| format!("'{}' is not a number", rhs.trim()))?;
    if !value.is_finite() {
        return Err(format!("'{}' is not a finite number", rhs.trim()));
    }

    Ok(ThresholdExpr {
        aggregation: parse_aggregation(lhs.trim())?,
        comparison,
        value,
    })
}

fn parse_aggregation(raw: &str) -> Result<Aggregation, String> {
    match raw {
        "rate" => Ok(Aggregation::Rate),
        "count" => Ok(Aggregation::Count),
        "avg" => Ok(Aggregation::Avg),
        "min" => Ok(Aggregation::Min),
        "max" => Ok(Aggregation::Max),
        "med" => Ok(Aggregation::Med),
        _ => {
            let inner = raw
                .strip_prefix("p(")
                .and_then(|s| s.strip_suffix(')'))
                .ok_or_else(|| format!("unknown aggregation '{raw}'"))?;
            let p: f64 = inner
                .trim()
                .parse()
                .map_err(|_| format!("bad percentile '{inner}'"))?;
            if !(0.0..=100.0).contains(&p) {
                return Err(format!("percentile {p} outside 0..=100"));
            }
            Ok(Aggregation::Percentile(p))
        }
    }
}

/// A parsed threshold bound to a metric name.
#[derive(Debug, Clone, PartialEq)]
pub struct Threshold {
    pub metric: String,
    pub expression: String,
    pub expr: ThresholdExpr,
}

impl Threshold {
    pub fn parse(metric: &str, expression: &str) -> Result<Self, ConfigError> {
        let expr = parse_threshold_expr(expression).map_err(|reason| {
            ConfigError::InvalidThreshold {
                metric: metric.to_string(),
                expression: expression.to_string(),
                reason,
            }
        })?;
        Ok(Self {
            metric: metric.to_string(),
            expression: expression.trim().to_string(),
            expr,
        })
    }

    pub fn name(&self) -> String {
        format!("{}: {}", self.metric, self.expression)
    }

    /// Reject thresholds on unregistered metrics or with an aggregation the
    /// metric kind cannot produce.
    pub fn validate(&self, registry: &MetricsRegistry) -> Result<(), ConfigError> {
        let kind = registry
            .kind_of(&self.metric)
            .ok_or_else(|| ConfigError::UnknownMetric(self.metric.clone()))?;
        if !self.expr.aggregation.supports(kind) {
            return Err(ConfigError::AggregationMismatch {
                metric: self.metric.clone(),
                aggregation: self.expr.aggregation.to_string(),
                kind: kind.as_str(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdResult {
    pub name: String,
    pub metric: String,
    pub expression: String,
    /// `None` when the metric had no observations
    pub observed: Option<f64>,
    pub passed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub passed: bool,
    pub thresholds: Vec<ThresholdResult>,
}

impl Verdict {
    /// `{threshold name -> passed}`
    pub fn breakdown(&self) -> BTreeMap<String, bool> {
        self.thresholds
            .iter()
            .map(|t| (t.name.clone(), t.passed))
            .collect()
    }

    pub fn failures(&self) -> impl Iterator<Item = &ThresholdResult> {
        self.thresholds.iter().filter(|t| !t.passed)
    }
}

/// Evaluate every threshold once against the final snapshot.
pub fn evaluate(snapshot: &MetricsSnapshot, thresholds: &[Threshold]) -> Verdict {
    let results: Vec<ThresholdResult> = thresholds
        .iter()
        .map(|threshold| {
            let observed = snapshot
                .get(&threshold.metric)
                .and_then(|metric| threshold.expr.observe(metric));
            let passed = observed
                .map(|value| threshold.expr.comparison.holds(value, threshold.expr.value))
                .unwrap_or(false);
            ThresholdResult {
                name: threshold.name(),
                metric: threshold.metric.clone(),
                expression: threshold.expression.clone(),
                observed,
                passed,
            }
        })
        .collect();

    Verdict {
        passed: results.iter().all(|r| r.passed),
        thresholds: results,
    }
}
