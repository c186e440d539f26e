use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::config::ScenarioConfig;
use crate::ramp::RampPlan;
use crate::vu::{run_virtual_user, VuContext, VuReport};

/// What one scheduler tick has to do to bring the population to its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rebalance {
    Spawn(u64),
    Retire(u64),
    Hold,
}

pub fn rebalance(active: u64, desired: u64) -> Rebalance {
    if desired > active {
        Rebalance::Spawn(desired - active)
    } else if desired < active {
        Rebalance::Retire(active - desired)
    } else {
        Rebalance::Hold
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub elapsed: Duration,
    pub vus_spawned: u64,
    pub peak_vus: u64,
    pub iterations: u64,
    /// Virtual users whose task panicked instead of returning
    pub panicked: u64,
}

struct ActiveVu {
    id: u64,
    stop: watch::Sender<bool>,
    handle: JoinHandle<VuReport>,
}

/// Move users whose task already ended (it can only have panicked) out of
/// `active` so the next rebalance replaces them. Keeps spawn order.
fn prune_finished(active: &mut Vec<ActiveVu>, draining: &mut Vec<JoinHandle<VuReport>>) -> usize {
    let mut pruned = 0;
    let mut i = 0;
    while i < active.len() {
        if active[i].handle.is_finished() {
            let vu = active.remove(i);
            warn!(vu = vu.id, "virtual user exited early, replacing it");
            draining.push(vu.handle);
            pruned += 1;
        } else {
            i += 1;
        }
    }
    pruned
}

/// Drives the virtual-user population along a [`RampPlan`].
#[derive(Debug, Clone)]
pub struct StageScheduler {
    plan: RampPlan,
    tick: Duration,
    max_duration: Option<Duration>,
    progress_every: Option<Duration>,
}

impl StageScheduler {
    pub fn new(plan: RampPlan) -> Self {
        Self {
            plan,
            tick: Duration::from_millis(100),
            max_duration: None,
            progress_every: None,
        }
    }

    pub fn from_config(plan: RampPlan, scenario: &ScenarioConfig) -> Self {
        let mut scheduler = Self::new(plan).with_tick(Duration::from_millis(scenario.tick_ms));
        if let Some(cap) = scenario.max_duration_ms {
            scheduler = scheduler.with_max_duration(Duration::from_millis(cap));
        }
        scheduler
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick.max(Duration::from_millis(1));
        self
    }

    pub fn with_max_duration(mut self, cap: Duration) -> Self {
        self.max_duration = Some(cap);
        self
    }

    pub fn with_progress_every(mut self, every: Duration) -> Self {
        self.progress_every = Some(every).filter(|d| !d.is_zero());
        self
    }

    pub fn plan(&self) -> &RampPlan {
        &self.plan
    }

    /// Wall-clock length of the run: the plan, cut short by the cap if any.
    pub fn run_duration(&self) -> Duration {
        let total = self.plan.total_duration();
        match self.max_duration {
            Some(cap) => total.min(cap),
            None => total,
        }
    }

    /// Run the plan to completion. Returns only after every spawned virtual
    /// user has been joined.
    pub async fn run(&self, ctx: Arc<VuContext>) -> SchedulerStats {
        let start = Instant::now();
        let deadline = self.run_duration();

        let mut active: Vec<ActiveVu> = Vec::new();
        let mut draining: Vec<JoinHandle<VuReport>> = Vec::new();
        let mut stats = SchedulerStats::default();
        let mut last_progress = start;

        info!(
            "Starting ramp: {} stages, peak {} VUs, {}ms",
            self.plan.stages().len(),
            self.plan.peak_target(),
            deadline.as_millis()
        );

        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            interval.tick().await;
            let elapsed = start.elapsed();
            if elapsed >= deadline {
                break;
            }

            prune_finished(&mut active, &mut draining);
            let desired = self.plan.desired_vus(elapsed);
            match rebalance(active.len() as u64, desired) {
                Rebalance::Spawn(n) => {
                    for _ in 0..n {
                        let id = stats.vus_spawned;
                        let (stop, stop_rx) = watch::channel(false);
                        let handle = tokio::spawn(run_virtual_user(id, Arc::clone(&ctx), stop_rx));
                        active.push(ActiveVu { id, stop, handle });
                        stats.vus_spawned += 1;
                    }
                }
                Rebalance::Retire(n) => {
                    for _ in 0..n {
                        // newest first
                        if let Some(vu) = active.pop() {
                            let _ = vu.stop.send(true);
                            draining.push(vu.handle);
                        }
                    }
                }
                Rebalance::Hold => {}
            }
            stats.peak_vus = stats.peak_vus.max(active.len() as u64);

            if let Some(every) = self.progress_every {
                if last_progress.elapsed() >= every {
                    info!(
                        elapsed_s = elapsed.as_secs(),
                        active = active.len(),
                        live = ctx.live_vus(),
                        desired,
                        iterations = ctx.iterations(),
                        "progress"
                    );
                    last_progress = Instant::now();
                }
            }
        }

        info!(
            "Ramp finished, stopping {} active VUs ({} draining)",
            active.len(),
            draining.len()
        );
        for vu in active {
            if vu.stop.send(true).is_err() {
                warn!(vu = vu.id, "virtual user exited before stop");
            }
            draining.push(vu.handle);
        }

        for result in join_all(draining).await {
            match result {
                Ok(_) => {}
                Err(e) if e.is_panic() => {
                    error!(error = %e, "virtual user panicked");
                    stats.panicked += 1;
                }
                Err(e) => warn!(error = %e, "virtual user task cancelled"),
            }
        }

        stats.iterations = ctx.iterations();
        stats.elapsed = start.elapsed();
        stats
    }
}
