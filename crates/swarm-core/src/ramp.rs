use std::time::Duration;

use crate::config::RampConfig;
use crate::error::ConfigError;

/// One segment of the concurrency curve: ramp linearly from the previous
/// target to `target` over `duration`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stage {
    pub duration: Duration,
    pub target: u64,
}

impl Stage {
    pub fn new(duration: Duration, target: u64) -> Self {
        Self { duration, target }
    }
}

/// Piecewise-linear virtual-user curve built from an ordered list of stages.
///
/// The curve starts at `start_vus`, reaches each stage's target exactly at the
/// stage's end boundary and is zero once every stage has elapsed. A stage with
/// a zero duration is an instantaneous jump to its target.
#[derive(Debug, Clone)]
pub struct RampPlan {
    start_vus: u64,
    stages: Vec<Stage>,
}

impl RampPlan {
    pub fn new(start_vus: u64, stages: Vec<Stage>) -> Result<Self, ConfigError> {
        if stages.is_empty() {
            return Err(ConfigError::NoStages);
        }
        if stages.iter().all(|s| s.duration.is_zero()) {
            return Err(ConfigError::ZeroDuration);
        }
        Ok(Self { start_vus, stages })
    }

    pub fn from_config(config: &RampConfig) -> Result<Self, ConfigError> {
        let stages = config
            .stages
            .iter()
            .map(|s| Stage::new(Duration::from_millis(s.duration_ms), s.target))
            .collect();
        Self::new(config.start_vus, stages)
    }

    /// Iterate stages strictly in order.
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn start_vus(&self) -> u64 {
        self.start_vus
    }

    pub fn total_duration(&self) -> Duration {
        self.stages.iter().map(|s| s.duration).sum()
    }

    /// Highest target the curve ever asks for.
    pub fn peak_target(&self) -> u64 {
        self.stages
            .iter()
            .map(|s| s.target)
            .chain(std::iter::once(self.start_vus))
            .max()
            .unwrap_or(0)
    }

    /// Interpolated target at `elapsed` since the start of the run.
    pub fn target_at(&self, elapsed: Duration) -> f64 {
        let mut from = self.start_vus as f64;
        let mut stage_start = Duration::ZERO;

        for stage in &self.stages {
            let stage_end = stage_start + stage.duration;
            let to = stage.target as f64;
            if elapsed < stage_end {
                return interpolate(from, to, elapsed - stage_start, stage.duration);
            }
            from = to;
            stage_start = stage_end;
        }

        if elapsed == stage_start {
            // exactly on the final boundary the last target still holds
            return from;
        }
        0.0
    }

    /// Number of virtual users that should be active at `elapsed`.
    pub fn desired_vus(&self, elapsed: Duration) -> u64 {
        if elapsed >= self.total_duration() {
            return 0;
        }
        self.target_at(elapsed).round() as u64
    }
}

fn interpolate(from: f64, to: f64, into_stage: Duration, stage_duration: Duration) -> f64 {
    if stage_duration.is_zero() {
        return to;
    }
    let t = (into_stage.as_secs_f64() / stage_duration.as_secs_f64()).min(1.0);
    from + (to - from) * t
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    fn mcp_profile() -> RampPlan {
        RampPlan::new(
            0,
            vec![
                Stage::new(secs(120), 10),
                Stage::new(secs(300), 50),
                Stage::new(secs(600), 50),
                Stage::new(secs(120), 0),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_empty_stages_rejected() {
        assert!(matches!(RampPlan::new(0, vec![]), Err(ConfigError::NoStages)));
    }

    #[test]
    fn test_zero_length_plan_rejected() {
        let err = RampPlan::new(0, vec![Stage::new(secs(0), 5)]).err().unwrap();
        assert!(matches!(err, ConfigError::ZeroDuration));
        let err = RampPlan::new(0, vec![Stage::new(secs(0), 5), Stage::new(secs(0), 0)])
            .err()
            .unwrap();
        assert!(matches!(err, ConfigError::ZeroDuration));
    }

    #[test]
    fn test_total_duration() {
        assert_eq!(mcp_profile().total_duration(), secs(1140));
        assert_eq!(mcp_profile().peak_target(), 50);
    }

    #[test]
    fn test_targets_hit_exactly_at_boundaries() {
        let plan = mcp_profile();
        assert_eq!(plan.target_at(secs(0)), 0.0);
        assert_eq!(plan.target_at(secs(120)), 10.0);
        assert_eq!(plan.target_at(secs(420)), 50.0);
        assert_eq!(plan.target_at(secs(1020)), 50.0);
        assert_eq!(plan.target_at(secs(1140)), 0.0);
    }

    #[test]
    fn test_linear_interpolation_inside_stage() {
        let plan = mcp_profile();
        assert_eq!(plan.target_at(secs(60)), 5.0);
        assert_eq!(plan.target_at(secs(270)), 30.0);
        assert_eq!(plan.target_at(secs(1080)), 25.0);
    }

    #[test]
    fn test_curve_is_continuous() {
        let plan = mcp_profile();
        let step = Duration::from_millis(100);
        let mut t = Duration::ZERO;
        let mut prev = plan.target_at(t);
        while t < plan.total_duration() {
            t += step;
            let cur = plan.target_at(t);
            // steepest slope is 50 VUs over 120s, about 0.042 per 100ms
            assert!((cur - prev).abs() <= 0.05, "jump at {t:?}: {prev} -> {cur}");
            prev = cur;
        }
    }

    #[test]
    fn test_zero_duration_stage_jumps() {
        let plan = RampPlan::new(0, vec![Stage::new(secs(0), 20), Stage::new(secs(10), 20)])
            .unwrap();
        assert_eq!(plan.target_at(secs(0)), 20.0);
        assert_eq!(plan.desired_vus(secs(5)), 20);
    }

    #[test]
    fn test_start_vus_is_initial_value() {
        let plan = RampPlan::new(4, vec![Stage::new(secs(10), 14)]).unwrap();
        assert_eq!(plan.target_at(secs(0)), 4.0);
        assert_eq!(plan.target_at(secs(5)), 9.0);
    }

    #[test]
    fn test_desired_vus_zero_after_last_stage() {
        let plan = RampPlan::new(0, vec![Stage::new(secs(60), 1)]).unwrap();
        assert_eq!(plan.desired_vus(secs(1)), 0);
        assert_eq!(plan.desired_vus(secs(45)), 1);
        assert_eq!(plan.desired_vus(secs(60)), 0);
        assert_eq!(plan.desired_vus(secs(3600)), 0);
    }
}
