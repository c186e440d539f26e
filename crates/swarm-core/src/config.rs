use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::ConfigError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub scenario: ScenarioConfig,
    pub ramp: RampConfig,
    pub target: TargetConfig,
    #[serde(default)]
    pub think_time: ThinkTimeConfig,
    #[serde(default)]
    pub operations: Vec<OperationConfig>,
    /// Runs when a draw lands in the residual weight (weights summing below 1.0)
    #[serde(default)]
    pub default_operation: Option<OperationConfig>,
    /// Metric name -> one or more expressions such as `p(95)<2000` or `rate<0.01`
    #[serde(default)]
    pub thresholds: BTreeMap<String, ThresholdExprs>,
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    /// Flatten the threshold table into `(metric, expression)` pairs in a stable order.
    pub fn threshold_pairs(&self) -> Vec<(String, String)> {
        self.thresholds
            .iter()
            .flat_map(|(metric, exprs)| {
                exprs
                    .as_slice()
                    .iter()
                    .map(move |expr| (metric.clone(), expr.clone()))
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioConfig {
    /// Human readable name, used in logs and report file names
    pub name: String,
    /// Seed for reproducible operation selection, payload choice and think times
    #[serde(default)]
    pub seed: Option<u64>,
    /// Optional hard cap on the run length in milliseconds
    #[serde(default)]
    pub max_duration_ms: Option<u64>,
    /// Scheduler tick in milliseconds
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
}

fn default_tick_ms() -> u64 {
    100
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    /// Time to ramp from the previous target to this one, in milliseconds
    pub duration_ms: u64,
    /// Concurrent virtual users at the end of the stage
    pub target: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RampConfig {
    /// Virtual users at t=0
    #[serde(default)]
    pub start_vus: u64,
    #[serde(default)]
    pub stages: Vec<StageConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Base URLs of the service under test (requests round-robin across them)
    pub base_urls: Vec<String>,
    /// Request timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Path probed before and after the run
    #[serde(default = "default_health_path")]
    pub health_path: String,
    #[serde(default)]
    pub user_agent: Option<String>,
}

fn default_timeout_ms() -> u64 {
    60_000
}

fn default_health_path() -> String {
    "/health".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThinkTimeConfig {
    pub base_ms: u64,
    pub spread_ms: u64,
}

impl Default for ThinkTimeConfig {
    fn default() -> Self {
        Self {
            base_ms: 1_000,
            spread_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationConfig {
    pub name: String,
    /// Probability mass in (0, 1]; ignored for the default operation
    #[serde(default)]
    pub weight: Option<f64>,
    #[serde(default = "default_method")]
    pub method: HttpMethod,
    pub path: String,
    /// Request bodies; one is picked uniformly at random per request
    #[serde(default)]
    pub payloads: Vec<serde_json::Value>,
    /// Status that counts as success
    #[serde(default = "default_expect_status")]
    pub expect_status: u16,
    #[serde(default)]
    pub checks: Vec<CheckConfig>,
    /// Trend metric fed with this operation's latency, defaults to `<name>_duration`
    #[serde(default)]
    pub trend_metric: Option<String>,
    /// Rate metric fed with this operation's failures, defaults to `<name>_errors`
    #[serde(default)]
    pub error_metric: Option<String>,
}

impl OperationConfig {
    pub fn trend_metric_name(&self) -> String {
        self.trend_metric
            .clone()
            .unwrap_or_else(|| format!("{}_duration", self.name))
    }

    pub fn error_metric_name(&self) -> String {
        self.error_metric
            .clone()
            .unwrap_or_else(|| format!("{}_errors", self.name))
    }
}

fn default_method() -> HttpMethod {
    HttpMethod::Post
}

fn default_expect_status() -> u16 {
    200
}

/// Assertions evaluated against every response of an operation.
///
/// Check results feed the `checks` rate metric; they never decide whether the
/// operation itself succeeded.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CheckConfig {
    Status {
        name: String,
        equals: u16,
    },
    StatusBelow {
        name: String,
        below: u16,
    },
    /// Body parses as JSON and has one of the listed top-level fields
    /// (or is an array, when `allow_array` is set)
    JsonField {
        name: String,
        any_of: Vec<String>,
        #[serde(default)]
        allow_array: bool,
    },
    MaxDuration {
        name: String,
        max_ms: u64,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ThresholdExprs {
    One(String),
    Many(Vec<String>),
}

impl ThresholdExprs {
    pub fn as_slice(&self) -> &[String] {
        match self {
            ThresholdExprs::One(expr) => std::slice::from_ref(expr),
            ThresholdExprs::Many(exprs) => exprs,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const WORKFLOW: &str = r#"
[scenario]
name = "workflow"
seed = 7

[ramp]
stages = [
    { duration_ms = 120000, target = 10 },
    { duration_ms = 300000, target = 50 },
]

[target]
base_urls = ["http://localhost:8010"]
timeout_ms = 5000

[think_time]
base_ms = 1000
spread_ms = 2000

[[operations]]
name = "project_switch"
weight = 0.4
path = "/switch_project"
payloads = [{ project_id = "p1" }, { project_id = "p2" }]
error_metric = "workflow_errors"

[[operations.checks]]
kind = "status"
name = "project switch status is 200"
equals = 200

[[operations.checks]]
kind = "json_field"
name = "project switch has success"
any_of = ["success", "project_id"]

[[operations]]
name = "entity_query"
weight = 0.4
path = "/query_entities"
error_metric = "workflow_errors"

[[operations]]
name = "work_item_query"
weight = 0.2
method = "GET"
path = "/query_work_items"
error_metric = "workflow_errors"

[thresholds]
http_req_failed = "rate<0.01"
project_switch_duration = ["p(95)<100", "max<1000"]
"#;

    #[test]
    fn test_config_serde() {
        let config = Config::from_toml(WORKFLOW).unwrap();

        assert_eq!(config.scenario.name, "workflow");
        assert_eq!(config.scenario.seed, Some(7));
        assert_eq!(config.scenario.tick_ms, 100);
        assert_eq!(config.ramp.start_vus, 0);
        assert_eq!(config.ramp.stages.len(), 2);
        assert_eq!(config.ramp.stages[1].target, 50);
        assert_eq!(config.target.health_path, "/health");
        assert_eq!(config.operations.len(), 3);
        assert_eq!(config.operations[0].method, HttpMethod::Post);
        assert_eq!(config.operations[2].method, HttpMethod::Get);
        assert_eq!(config.operations[0].payloads.len(), 2);
        assert_eq!(config.operations[0].checks.len(), 2);
        assert_eq!(config.operations[1].expect_status, 200);
        assert!(config.default_operation.is_none());
    }

    #[test]
    fn test_metric_names_default_from_operation_name() {
        let config = Config::from_toml(WORKFLOW).unwrap();

        assert_eq!(
            config.operations[1].trend_metric_name(),
            "entity_query_duration"
        );
        assert_eq!(config.operations[1].error_metric_name(), "workflow_errors");
    }

    #[test]
    fn test_threshold_pairs_flatten_in_order() {
        let config = Config::from_toml(WORKFLOW).unwrap();

        assert_eq!(
            config.threshold_pairs(),
            vec![
                ("http_req_failed".to_string(), "rate<0.01".to_string()),
                ("project_switch_duration".to_string(), "p(95)<100".to_string()),
                ("project_switch_duration".to_string(), "max<1000".to_string()),
            ]
        );
    }

    #[test]
    fn test_think_time_defaults() {
        let stripped = WORKFLOW.replace("[think_time]\nbase_ms = 1000\nspread_ms = 2000\n", "");
        let config = Config::from_toml(&stripped).unwrap();

        assert_eq!(config.think_time.base_ms, 1_000);
        assert_eq!(config.think_time.spread_ms, 2_000);
    }

    #[test]
    fn test_parse_error_is_reported() {
        let err = Config::from_toml("[scenario]\nname = 3").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
