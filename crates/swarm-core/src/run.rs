use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{ConfigError, RunError};
use crate::health::HealthCheck;
use crate::metrics::{MetricsRegistry, MetricsSnapshot};
use crate::ramp::RampPlan;
use crate::scheduler::{SchedulerStats, StageScheduler};
use crate::threshold::{evaluate, Threshold, Verdict};
use crate::transport::Transport;
use crate::vu::VuContext;

/// A fully validated load test, ready to run once.
pub struct LoadTest {
    config: Config,
    scheduler: StageScheduler,
    registry: MetricsRegistry,
    ctx: Arc<VuContext>,
    thresholds: Vec<Threshold>,
    health: Arc<dyn HealthCheck>,
}

/// Everything a reporter needs once the run is over.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub scenario: String,
    pub transport: &'static str,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub stats: SchedulerStats,
    pub snapshot: MetricsSnapshot,
    pub verdict: Verdict,
    pub post_run_healthy: bool,
}

impl LoadTest {
    /// Validate `config` and wire the run together. Nothing is spawned and no
    /// request is sent until [`LoadTest::run`].
    pub fn new(
        config: Config,
        transport: Arc<dyn Transport>,
        health: Arc<dyn HealthCheck>,
    ) -> Result<Self, ConfigError> {
        if config.target.base_urls.is_empty() {
            return Err(ConfigError::NoTargets);
        }

        let plan = RampPlan::from_config(&config.ramp)?;
        let scheduler = StageScheduler::from_config(plan, &config.scenario);

        let mut registry = MetricsRegistry::new();
        let ctx = VuContext::new(&config, &mut registry, transport)?;

        let thresholds = config
            .threshold_pairs()
            .iter()
            .map(|(metric, expression)| {
                let threshold = Threshold::parse(metric, expression)?;
                threshold.validate(&registry)?;
                Ok(threshold)
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;

        Ok(Self {
            config,
            scheduler,
            registry,
            ctx: Arc::new(ctx),
            thresholds,
            health,
        })
    }

    /// Log progress every `every` while the ramp runs.
    pub fn with_progress_every(mut self, every: Duration) -> Self {
        self.scheduler = self.scheduler.with_progress_every(every);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn plan(&self) -> &RampPlan {
        self.scheduler.plan()
    }

    pub fn thresholds(&self) -> &[Threshold] {
        &self.thresholds
    }

    pub async fn run(self) -> Result<RunOutcome, RunError> {
        let scenario = self.config.scenario.name.clone();
        let transport = self.ctx.transport_name();

        info!(
            "Preflight health check for '{}' against {}",
            scenario,
            self.health.target()
        );
        if !self.health.probe().await {
            return Err(RunError::Preflight {
                target: self.health.target(),
            });
        }

        info!(
            %scenario,
            transport,
            seed = ?self.config.scenario.seed,
            duration_ms = self.scheduler.run_duration().as_millis() as u64,
            "starting load test"
        );
        let started_at = Utc::now();
        let stats = self.scheduler.run(Arc::clone(&self.ctx)).await;
        let finished_at = Utc::now();

        let snapshot = self.registry.snapshot();
        let verdict = evaluate(&snapshot, &self.thresholds);
        for failure in verdict.failures() {
            warn!(
                threshold = %failure.name,
                observed = ?failure.observed,
                "threshold crossed"
            );
        }

        let post_run_healthy = self.health.probe().await;
        if !post_run_healthy {
            warn!(
                "Target {} is degraded after the run",
                self.health.target()
            );
        }

        info!(
            %scenario,
            iterations = stats.iterations,
            peak_vus = stats.peak_vus,
            passed = verdict.passed,
            "load test finished"
        );

        Ok(RunOutcome {
            scenario,
            transport,
            started_at,
            finished_at,
            stats,
            snapshot,
            verdict,
            post_run_healthy,
        })
    }
}
