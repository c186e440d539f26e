use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::{CheckConfig, HttpMethod, OperationConfig};
use crate::transport::{RequestSpec, TransportResponse};

/// A named unit of work a virtual user can pick.
#[derive(Debug, Clone)]
pub struct Operation {
    pub name: String,
    pub method: HttpMethod,
    pub path: String,
    payloads: Vec<serde_json::Value>,
    pub expect_status: u16,
    pub checks: Vec<CheckConfig>,
    pub trend_metric: String,
    pub error_metric: String,
}

impl Operation {
    pub fn from_config(config: &OperationConfig) -> Self {
        Self {
            name: config.name.clone(),
            method: config.method,
            path: config.path.clone(),
            payloads: config.payloads.clone(),
            expect_status: config.expect_status,
            checks: config.checks.clone(),
            trend_metric: config.trend_metric_name(),
            error_metric: config.error_metric_name(),
        }
    }

    /// Build the next request, picking one of the configured payloads at random.
    pub fn request<R: Rng + ?Sized>(&self, rng: &mut R) -> RequestSpec {
        let body = match self.payloads.len() {
            0 => None,
            1 => Some(self.payloads[0].clone()),
            n => Some(self.payloads[rng.gen_range(0..n)].clone()),
        };
        RequestSpec {
            operation: self.name.clone(),
            method: self.method,
            path: self.path.clone(),
            body,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeMeta {
    pub status: Option<u16>,
    pub error: Option<String>,
    pub checks: Vec<CheckResult>,
}

/// Result of executing one operation.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub success: bool,
    pub latency: Duration,
    pub meta: OutcomeMeta,
}

impl Outcome {
    pub fn latency_ms(&self) -> f64 {
        self.latency.as_micros() as f64 / 1_000.0
    }
}

/// Turn a transport result into an outcome. Success means the exchange
/// completed with the operation's expected status; checks are reported
/// alongside but do not change it.
pub fn classify(
    operation: &Operation,
    result: &anyhow::Result<TransportResponse>,
    latency: Duration,
) -> Outcome {
    match result {
        Ok(response) => Outcome {
            success: response.status == operation.expect_status,
            latency,
            meta: OutcomeMeta {
                status: Some(response.status),
                error: None,
                checks: evaluate_checks(&operation.checks, Some(response), latency),
            },
        },
        Err(e) => Outcome {
            success: false,
            latency,
            meta: OutcomeMeta {
                status: None,
                error: Some(format!("{e:#}")),
                checks: evaluate_checks(&operation.checks, None, latency),
            },
        },
    }
}

/// Evaluate checks against a response; without a response every check fails.
pub fn evaluate_checks(
    checks: &[CheckConfig],
    response: Option<&TransportResponse>,
    latency: Duration,
) -> Vec<CheckResult> {
    let mut json: Option<Option<serde_json::Value>> = None;

    checks
        .iter()
        .map(|check| {
            let (name, passed) = match (check, response) {
                (CheckConfig::Status { name, .. }, None)
                | (CheckConfig::StatusBelow { name, .. }, None)
                | (CheckConfig::JsonField { name, .. }, None)
                | (CheckConfig::MaxDuration { name, .. }, None) => (name, false),
                (CheckConfig::Status { name, equals }, Some(r)) => (name, r.status == *equals),
                (CheckConfig::StatusBelow { name, below }, Some(r)) => (name, r.status < *below),
                (CheckConfig::MaxDuration { name, max_ms }, Some(_)) => {
                    (name, latency < Duration::from_millis(*max_ms))
                }
                (
                    CheckConfig::JsonField {
                        name,
                        any_of,
                        allow_array,
                    },
                    Some(r),
                ) => {
                    let body = json.get_or_insert_with(|| serde_json::from_str(&r.body).ok());
                    let passed = match body {
                        Some(serde_json::Value::Array(_)) => *allow_array,
                        Some(serde_json::Value::Object(map)) => {
                            any_of.iter().any(|field| map.contains_key(field))
                        }
                        _ => false,
                    };
                    (name, passed)
                }
            };
            CheckResult {
                name: name.clone(),
                passed,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    fn search_op() -> Operation {
        Operation {
            name: "search".to_string(),
            method: HttpMethod::Post,
            path: "/search".to_string(),
            payloads: vec![
                serde_json::json!({ "query": "connection pool" }),
                serde_json::json!({ "query": "semantic search" }),
            ],
            expect_status: 200,
            checks: vec![
                CheckConfig::Status {
                    name: "status is 200".to_string(),
                    equals: 200,
                },
                CheckConfig::JsonField {
                    name: "response has results".to_string(),
                    any_of: vec!["results".to_string()],
                    allow_array: false,
                },
                CheckConfig::MaxDuration {
                    name: "response time acceptable".to_string(),
                    max_ms: 2_000,
                },
                CheckConfig::StatusBelow {
                    name: "no server errors".to_string(),
                    below: 500,
                },
            ],
            trend_metric: "search_duration".to_string(),
            error_metric: "search_errors".to_string(),
        }
    }

    fn response(status: u16, body: &str) -> anyhow::Result<TransportResponse> {
        Ok(TransportResponse {
            status,
            body: body.to_string(),
        })
    }

    #[test]
    fn test_request_picks_configured_payloads() {
        let op = search_op();
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..20 {
            let req = op.request(&mut rng);
            assert_eq!(req.path, "/search");
            assert!(op.payloads.contains(req.body.as_ref().unwrap()));
        }
    }

    #[test]
    fn test_success_with_all_checks_passing() {
        let outcome = classify(
            &search_op(),
            &response(200, r#"{"results":[]}"#),
            Duration::from_millis(40),
        );
        assert!(outcome.success);
        assert_eq!(outcome.meta.status, Some(200));
        assert!(outcome.meta.checks.iter().all(|c| c.passed));
        assert_eq!(outcome.latency_ms(), 40.0);
    }

    #[test]
    fn test_unexpected_status_fails() {
        let outcome = classify(
            &search_op(),
            &response(503, "unavailable"),
            Duration::from_millis(5),
        );
        assert!(!outcome.success);
        let passed: Vec<bool> = outcome.meta.checks.iter().map(|c| c.passed).collect();
        assert_eq!(passed, vec![false, false, true, false]);
    }

    #[test]
    fn test_checks_do_not_decide_success() {
        let outcome = classify(
            &search_op(),
            &response(200, "not json"),
            Duration::from_millis(2_500),
        );
        assert!(outcome.success);
        assert!(!outcome.meta.checks[1].passed);
        assert!(!outcome.meta.checks[2].passed);
    }

    #[test]
    fn test_transport_error_is_failed_outcome() {
        let result: anyhow::Result<TransportResponse> = Err(anyhow::anyhow!("timed out"));
        let outcome = classify(&search_op(), &result, Duration::from_secs(60));
        assert!(!outcome.success);
        assert_eq!(outcome.meta.status, None);
        assert_eq!(outcome.meta.error.as_deref(), Some("timed out"));
        assert!(outcome.meta.checks.iter().all(|c| !c.passed));
    }

    #[test]
    fn test_json_field_accepts_array_when_allowed() {
        let checks = vec![CheckConfig::JsonField {
            name: "entity query returns results".to_string(),
            any_of: vec!["entities".to_string()],
            allow_array: true,
        }];
        let array = TransportResponse {
            status: 200,
            body: "[1,2]".to_string(),
        };
        let object = TransportResponse {
            status: 200,
            body: r#"{"entities":[]}"#.to_string(),
        };
        let other = TransportResponse {
            status: 200,
            body: r#"{"items":[]}"#.to_string(),
        };
        let d = Duration::ZERO;
        assert!(evaluate_checks(&checks, Some(&array), d)[0].passed);
        assert!(evaluate_checks(&checks, Some(&object), d)[0].passed);
        assert!(!evaluate_checks(&checks, Some(&other), d)[0].passed);
    }
}
