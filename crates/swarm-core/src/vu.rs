use futures::FutureExt;
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, warn};

use crate::config::{Config, ThinkTimeConfig};
use crate::error::ConfigError;
use crate::metrics::{
    MetricsRegistry, RateRecorder, TrendRecorder, CHECKS, HTTP_REQ_DURATION, HTTP_REQ_FAILED,
};
use crate::operation::{classify, Operation, Outcome};
use crate::selector::WorkloadSelector;
use crate::transport::Transport;

/// Randomized pause between two iterations: `base + U[0,1) * spread`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThinkTime {
    pub base: Duration,
    pub spread: Duration,
}

impl ThinkTime {
    pub fn new(base: Duration, spread: Duration) -> Self {
        Self { base, spread }
    }

    pub fn from_config(config: &ThinkTimeConfig) -> Self {
        Self::new(
            Duration::from_millis(config.base_ms),
            Duration::from_millis(config.spread_ms),
        )
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        self.base + self.spread.mul_f64(rng.gen::<f64>())
    }
}

/// Operation with its recorders resolved up front so the hot path never
/// looks metrics up by name.
#[derive(Debug)]
pub struct BoundOperation {
    pub operation: Operation,
    trend: Arc<TrendRecorder>,
    errors: Arc<RateRecorder>,
}

impl BoundOperation {
    fn bind(operation: Operation, registry: &mut MetricsRegistry) -> Result<Self, ConfigError> {
        let trend = registry.trend(&operation.trend_metric)?;
        let errors = registry.rate(&operation.error_metric)?;
        Ok(Self {
            operation,
            trend,
            errors,
        })
    }
}

/// Everything virtual users share: the workload, the transport and the recorders.
pub struct VuContext {
    selector: WorkloadSelector<Arc<BoundOperation>>,
    transport: Arc<dyn Transport>,
    think_time: ThinkTime,
    seed: Option<u64>,
    http_req_duration: Arc<TrendRecorder>,
    http_req_failed: Arc<RateRecorder>,
    checks: Arc<RateRecorder>,
    iterations: AtomicU64,
    live: AtomicU64,
}

impl VuContext {
    /// Validate the operations in `config` and register their recorders.
    pub fn new(
        config: &Config,
        registry: &mut MetricsRegistry,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, ConfigError> {
        let mut seen = std::collections::BTreeSet::new();
        let mut weighted = Vec::with_capacity(config.operations.len());

        for op_config in &config.operations {
            if !seen.insert(op_config.name.clone()) {
                return Err(ConfigError::DuplicateOperation(op_config.name.clone()));
            }
            let weight = op_config
                .weight
                .ok_or_else(|| ConfigError::MissingWeight(op_config.name.clone()))?;
            let bound = BoundOperation::bind(Operation::from_config(op_config), registry)?;
            weighted.push((op_config.name.clone(), weight, Arc::new(bound)));
        }

        let default = match &config.default_operation {
            Some(op_config) => {
                if !seen.insert(op_config.name.clone()) {
                    return Err(ConfigError::DuplicateOperation(op_config.name.clone()));
                }
                Some(Arc::new(BoundOperation::bind(
                    Operation::from_config(op_config),
                    registry,
                )?))
            }
            None => None,
        };

        Ok(Self {
            selector: WorkloadSelector::new(weighted, default)?,
            transport,
            think_time: ThinkTime::from_config(&config.think_time),
            seed: config.scenario.seed,
            http_req_duration: registry.trend(HTTP_REQ_DURATION)?,
            http_req_failed: registry.rate(HTTP_REQ_FAILED)?,
            checks: registry.rate(CHECKS)?,
            iterations: AtomicU64::new(0),
            live: AtomicU64::new(0),
        })
    }

    pub fn transport_name(&self) -> &'static str {
        self.transport.name()
    }

    pub fn think_time(&self) -> ThinkTime {
        self.think_time
    }

    /// Iterations completed by all virtual users so far.
    pub fn iterations(&self) -> u64 {
        self.iterations.load(Ordering::Relaxed)
    }

    /// Virtual users currently inside their loop.
    pub fn live_vus(&self) -> u64 {
        self.live.load(Ordering::Relaxed)
    }

    fn rng_for(&self, vu_id: u64) -> StdRng {
        match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(vu_id)),
            None => StdRng::from_entropy(),
        }
    }

    fn record(&self, bound: &BoundOperation, outcome: &Outcome) {
        let latency_ms = outcome.latency_ms();
        self.http_req_duration.add(latency_ms);
        bound.trend.add(latency_ms);
        self.http_req_failed.add(!outcome.success);
        bound.errors.add(!outcome.success);
        for check in &outcome.meta.checks {
            self.checks.add(check.passed);
        }
    }

    /// Execute one operation and record its outcome.
    pub async fn execute(&self, bound: &BoundOperation, rng: &mut StdRng) -> Outcome {
        let request = bound.operation.request(rng);
        let start = Instant::now();
        // a panicking transport fails this request, not the virtual user
        let result = AssertUnwindSafe(async { self.transport.execute(&request).await })
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                let reason = panic_message(panic.as_ref());
                error!(operation = %bound.operation.name, %reason, "transport panicked");
                Err(anyhow::anyhow!("transport panicked: {reason}"))
            });
        let latency = start.elapsed();

        let outcome = classify(&bound.operation, &result, latency);
        if let Some(error) = &outcome.meta.error {
            warn!(operation = %bound.operation.name, %error, "request failed");
        } else if !outcome.success {
            debug!(
                operation = %bound.operation.name,
                status = ?outcome.meta.status,
                "unexpected status"
            );
        }
        self.record(bound, &outcome);
        outcome
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Decrements the live gauge however the virtual user exits.
struct LiveGuard<'a>(&'a AtomicU64);

impl<'a> LiveGuard<'a> {
    fn enter(gauge: &'a AtomicU64) -> Self {
        gauge.fetch_add(1, Ordering::Relaxed);
        Self(gauge)
    }
}

impl Drop for LiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Per-user tallies returned when a virtual user exits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VuReport {
    pub id: u64,
    pub iterations: u64,
    pub failures: u64,
}

/// Run one virtual user until `stop` turns true (or its sender goes away).
///
/// The stop flag is honoured between iterations and during think time, never
/// while a request is in flight.
pub async fn run_virtual_user(
    id: u64,
    ctx: Arc<VuContext>,
    mut stop: watch::Receiver<bool>,
) -> VuReport {
    let _live = LiveGuard::enter(&ctx.live);
    let mut rng = ctx.rng_for(id);
    let mut report = VuReport {
        id,
        ..Default::default()
    };
    debug!(vu = id, "virtual user started");

    loop {
        if *stop.borrow() {
            break;
        }

        let draw: f64 = rng.gen();
        if let Some(bound) = ctx.selector.pick(draw) {
            let bound = Arc::clone(bound);
            let outcome = ctx.execute(&bound, &mut rng).await;
            if !outcome.success {
                report.failures += 1;
            }
        }
        report.iterations += 1;
        ctx.iterations.fetch_add(1, Ordering::Relaxed);

        let pause = ctx.think_time.sample(&mut rng);
        let stopped = tokio::select! {
            _ = sleep(pause) => false,
            // Ok(true) or a dropped sender both mean stop
            _ = stop.wait_for(|s| *s) => true,
        };
        if stopped {
            break;
        }
    }

    debug!(vu = id, iterations = report.iterations, "virtual user stopped");
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::WORKFLOW;
    use crate::transport::MockTransport;

    fn context(toml: &str, transport: MockTransport) -> (Arc<VuContext>, MetricsRegistry) {
        let config = Config::from_toml(toml).unwrap();
        let mut registry = MetricsRegistry::new();
        let ctx = VuContext::new(&config, &mut registry, Arc::new(transport)).unwrap();
        (Arc::new(ctx), registry)
    }

    #[test]
    fn test_think_time_range() {
        let think = ThinkTime::new(Duration::from_secs(1), Duration::from_secs(2));
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..1_000 {
            let pause = think.sample(&mut rng);
            assert!(pause >= Duration::from_secs(1) && pause < Duration::from_secs(3));
        }
    }

    #[test]
    fn test_context_registers_operation_metrics() {
        let (_ctx, registry) = context(WORKFLOW, MockTransport::new(Duration::ZERO));
        let names: Vec<&str> = registry.names().collect();
        assert!(names.contains(&"project_switch_duration"));
        assert!(names.contains(&"entity_query_duration"));
        assert!(names.contains(&"workflow_errors"));
        assert!(!names.contains(&"project_switch_errors"));
    }

    #[test]
    fn test_duplicate_operation_rejected() {
        let toml = WORKFLOW.replace("name = \"entity_query\"", "name = \"project_switch\"");
        let config = Config::from_toml(&toml).unwrap();
        let mut registry = MetricsRegistry::new();
        let err = VuContext::new(
            &config,
            &mut registry,
            Arc::new(MockTransport::new(Duration::ZERO)),
        )
        .err()
        .unwrap();
        assert!(matches!(err, ConfigError::DuplicateOperation(_)));
    }

    #[test]
    fn test_missing_weight_rejected() {
        let toml = WORKFLOW.replace("weight = 0.2\n", "");
        let config = Config::from_toml(&toml).unwrap();
        let mut registry = MetricsRegistry::new();
        let err = VuContext::new(
            &config,
            &mut registry,
            Arc::new(MockTransport::new(Duration::ZERO)),
        )
        .err()
        .unwrap();
        assert!(matches!(err, ConfigError::MissingWeight(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_vu_records_and_stops_gracefully() {
        let (ctx, registry) = context(
            WORKFLOW,
            MockTransport::new(Duration::from_millis(50)).with_seed(1),
        );
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(run_virtual_user(0, Arc::clone(&ctx), stop_rx));

        tokio::time::sleep(Duration::from_secs(30)).await;
        stop_tx.send(true).unwrap();
        let report = handle.await.unwrap();

        // one iteration is 50ms of request plus 1-3s of think time
        assert!(report.iterations >= 10 && report.iterations <= 30, "{report:?}");
        assert_eq!(report.failures, 0);

        let snapshot = registry.snapshot();
        let durations = snapshot.trend(HTTP_REQ_DURATION).unwrap();
        assert_eq!(durations.count(), report.iterations);
        assert!(durations.min().unwrap() >= 50.0 && durations.max().unwrap() < 52.0);
        assert_eq!(snapshot.rate(HTTP_REQ_FAILED).unwrap().total, report.iterations);
        assert_eq!(ctx.iterations(), report.iterations);
    }

    #[tokio::test(start_paused = true)]
    async fn test_vu_survives_failures() {
        let (ctx, registry) = context(
            WORKFLOW,
            MockTransport::new(Duration::from_millis(5)).with_error_rate(1.0),
        );
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(run_virtual_user(3, ctx, stop_rx));

        tokio::time::sleep(Duration::from_secs(20)).await;
        drop(stop_tx);
        let report = handle.await.unwrap();

        assert!(report.iterations > 1);
        assert_eq!(report.failures, report.iterations);
        assert_eq!(registry.snapshot().rate(HTTP_REQ_FAILED).unwrap().rate(), 1.0);
    }

    /// Panics while building the first request future, then answers 200.
    struct FlakyTransport(AtomicU64);

    impl Transport for FlakyTransport {
        fn name(&self) -> &'static str {
            "flaky"
        }

        fn execute<'a>(
            &'a self,
            _request: &'a crate::transport::RequestSpec,
        ) -> std::pin::Pin<
            Box<
                dyn std::future::Future<Output = anyhow::Result<crate::transport::TransportResponse>>
                    + Send
                    + 'a,
            >,
        > {
            if self.0.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("connection pool poisoned");
            }
            Box::pin(async {
                Ok(crate::transport::TransportResponse {
                    status: 200,
                    body: "{}".to_string(),
                })
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_panic_fails_request_not_vu() {
        let config = Config::from_toml(WORKFLOW).unwrap();
        let mut registry = MetricsRegistry::new();
        let ctx = Arc::new(
            VuContext::new(
                &config,
                &mut registry,
                Arc::new(FlakyTransport(AtomicU64::new(0))),
            )
            .unwrap(),
        );
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(run_virtual_user(0, Arc::clone(&ctx), stop_rx));

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(ctx.live_vus(), 1);
        stop_tx.send(true).unwrap();
        let report = handle.await.unwrap();

        assert!(report.iterations > 1);
        assert_eq!(ctx.live_vus(), 0);
        let failed = registry.snapshot().rate(HTTP_REQ_FAILED).copied().unwrap();
        assert_eq!(failed.trues, 1);
        assert!(failed.total > 1);
        assert_eq!(report.failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_residual_draw_is_noop_iteration() {
        let toml = WORKFLOW
            .replace("weight = 0.4", "weight = 0.01")
            .replace("weight = 0.2", "weight = 0.01");
        let (ctx, registry) = context(&toml, MockTransport::new(Duration::from_millis(5)));
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(run_virtual_user(0, ctx, stop_rx));

        tokio::time::sleep(Duration::from_secs(60)).await;
        stop_tx.send(true).unwrap();
        let report = handle.await.unwrap();

        let executed = registry.snapshot().trend(HTTP_REQ_DURATION).unwrap().count();
        assert!(report.iterations > executed);
    }
}
