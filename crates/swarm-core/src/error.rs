use std::path::PathBuf;

/// Problems found while loading or validating a load test definition.
///
/// Every variant is fatal and is raised before any virtual user is spawned.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("ramp must contain at least one stage")]
    NoStages,

    #[error("ramp stages add up to zero duration")]
    ZeroDuration,

    #[error("at least one weighted operation is required")]
    NoOperations,

    #[error("operation '{name}' has weight {weight}, expected a value in (0, 1]")]
    InvalidWeight { name: String, weight: f64 },

    #[error("operation weights sum to {sum}, which exceeds 1.0")]
    WeightSum { sum: f64 },

    #[error("operation '{0}' is defined more than once")]
    DuplicateOperation(String),

    #[error("operation '{0}' needs a weight")]
    MissingWeight(String),

    #[error("target must list at least one base url")]
    NoTargets,

    #[error("invalid threshold '{expression}' on metric '{metric}': {reason}")]
    InvalidThreshold {
        metric: String,
        expression: String,
        reason: String,
    },

    #[error("threshold references unknown metric '{0}'")]
    UnknownMetric(String),

    #[error("metric '{0}' is registered twice with different kinds")]
    MetricKindConflict(String),

    #[error("aggregation '{aggregation}' is not available on {kind} metric '{metric}'")]
    AggregationMismatch {
        metric: String,
        aggregation: String,
        kind: &'static str,
    },
}

/// Errors that stop a run from starting.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("preflight health check failed against {target}")]
    Preflight { target: String },
}
