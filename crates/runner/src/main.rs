mod report;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use swarm_core::{
    Config, HealthCheck, HttpHealthCheck, HttpJsonTransport, LoadTest, MockTransport, RampPlan,
    Reporter, RunError, RunSummary, StaticHealth, Transport,
};
use tracing::{error, info};

use crate::report::{ConsoleReporter, JsonFileReporter};

/// Exit code for a run whose thresholds were crossed.
const EXIT_THRESHOLDS_FAILED: u8 = 99;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    Mock,
    Http,
}

#[derive(Parser, Debug)]
#[command(name = "runner")]
#[command(about = "Staged virtual-user load test runner")]
struct Args {
    /// Path to configuration file
    #[arg(long, default_value = "config/codebase.toml")]
    config: PathBuf,

    /// Transport: mock or http
    #[arg(long, value_enum, default_value = "http")]
    mode: Mode,

    /// Seed for reproducible runs (overrides config)
    #[arg(long, env = "SWARM_SEED")]
    seed: Option<u64>,

    /// Log progress every N milliseconds (0 disables)
    #[arg(long, default_value = "10000")]
    print_every_ms: u64,

    /// Directory for JSON result files
    #[arg(long, default_value = "results")]
    out_dir: PathBuf,

    /// Only print the stage schedule without running
    #[arg(long)]
    plan_only: bool,

    /// Skip the health probes before and after the run
    #[arg(long)]
    skip_health: bool,

    /// Simulated latency of the mock transport
    #[arg(long, default_value = "20")]
    mock_latency_ms: u64,

    /// Fraction of mock requests answered with status 500
    #[arg(long, default_value = "0.0")]
    mock_error_rate: f64,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    match run(args).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(EXIT_THRESHOLDS_FAILED),
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

/// Returns whether every threshold passed.
async fn run(args: Args) -> Result<bool> {
    let mut config = Config::from_file(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;
    if let Some(seed) = args.seed {
        config.scenario.seed = Some(seed);
    }

    if args.plan_only {
        let plan = RampPlan::from_config(&config.ramp)?;
        print_stage_schedule(&plan);
        return Ok(true);
    }

    info!(
        "Starting '{}' in {:?} mode against {}",
        config.scenario.name,
        args.mode,
        config.target.base_urls.join(", ")
    );
    match config.scenario.seed {
        Some(seed) => info!("Seed: {}", seed),
        None => info!("Seed: random"),
    }

    let transport: Arc<dyn Transport> = match args.mode {
        Mode::Mock => {
            let mut mock = MockTransport::new(Duration::from_millis(args.mock_latency_ms))
                .with_error_rate(args.mock_error_rate);
            if let Some(seed) = config.scenario.seed {
                mock = mock.with_seed(seed);
            }
            Arc::new(mock)
        }
        Mode::Http => Arc::new(
            HttpJsonTransport::new(&config.target).context("Failed to create HTTP transport")?,
        ),
    };

    let health: Arc<dyn HealthCheck> = if args.skip_health || args.mode == Mode::Mock {
        Arc::new(StaticHealth(true))
    } else {
        Arc::new(HttpHealthCheck::new(&config.target).context("Failed to create health check")?)
    };

    let test = LoadTest::new(config, transport, health)?
        .with_progress_every(Duration::from_millis(args.print_every_ms));
    print_stage_schedule(test.plan());

    let outcome = match test.run().await {
        Ok(outcome) => outcome,
        Err(RunError::Preflight { target }) => {
            anyhow::bail!("Target {target} is not healthy, refusing to start the load test")
        }
        Err(e) => return Err(e.into()),
    };

    let summary = RunSummary::from_outcome(&outcome);
    let reporters: Vec<Box<dyn Reporter>> = vec![
        Box::new(ConsoleReporter),
        Box::new(JsonFileReporter::new(&args.out_dir)),
    ];
    for reporter in &reporters {
        reporter.report(&summary)?;
    }

    Ok(summary.thresholds_passed)
}

fn print_stage_schedule(plan: &RampPlan) {
    println!("\n=== Stage Schedule ===");
    println!("Total duration: {}ms", plan.total_duration().as_millis());
    println!("Start VUs: {}", plan.start_vus());
    println!();

    for (idx, stage) in plan.stages().iter().enumerate() {
        println!(
            "Stage {}: ramp to {} VUs over {}ms",
            idx,
            stage.target,
            stage.duration.as_millis()
        );
    }
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_defaults() {
        let args = Args::parse_from(["runner"]);
        assert_eq!(args.mode, Mode::Http);
        assert_eq!(args.out_dir, PathBuf::from("results"));
        assert!(!args.plan_only);
    }

    #[test]
    fn test_args_mock_overrides() {
        let args = Args::parse_from([
            "runner",
            "--config",
            "config/workflow.toml",
            "--mode",
            "mock",
            "--seed",
            "7",
            "--mock-error-rate",
            "0.15",
        ]);
        assert_eq!(args.mode, Mode::Mock);
        assert_eq!(args.seed, Some(7));
        assert_eq!(args.mock_error_rate, 0.15);
    }

    #[tokio::test]
    async fn test_plan_only_does_not_run() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plan.toml");
        std::fs::write(
            &path,
            r#"
[scenario]
name = "plan"

[ramp]
stages = [{ duration_ms = 1000, target = 2 }]

[target]
base_urls = ["http://127.0.0.1:9"]

[[operations]]
name = "search"
weight = 1.0
path = "/search"
"#,
        )
        .unwrap();

        let args = Args::parse_from([
            "runner",
            "--config",
            path.to_str().unwrap(),
            "--plan-only",
        ]);
        assert!(run(args).await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_config_is_error() {
        let args = Args::parse_from(["runner", "--config", "does/not/exist.toml"]);
        assert!(run(args).await.is_err());
    }
}
