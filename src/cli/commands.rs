//! CLI command definitions for workline.
//!
//! `demo` pushes a synthetic workload through a pipeline and reports pool
//! statistics; `config` prints the effective configuration.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use clap::Parser;
use serde::Serialize;
use tracing::{info, warn};

use crate::pipeline::{PipelineConfig, PipelineController};
use crate::scheduler::{PoolStats, Priority, TaskContext, WorkFailure};

/// Steps each demo task reports progress over.
const DEMO_STEPS: u32 = 4;

/// Bounded concurrent job pipeline.
#[derive(Parser)]
#[command(name = "workline")]
#[command(about = "Run work through a bounded, prioritized worker pipeline")]
#[command(version)]
#[command(
    long_about = "workline admits work under a permit limit, buffers it in a bounded queue, schedules it by priority and runs it on a worker pool with retries and graceful shutdown.\n\nExample usage:\n  workline demo --tasks 200 --fail-every 7 --workers 8 --metrics"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run a synthetic workload and print pool statistics as JSON.
    Demo(DemoArgs),

    /// Print the effective configuration as YAML.
    Config(ConfigArgs),
}

/// Arguments for `workline demo`.
#[derive(Parser, Debug)]
pub struct DemoArgs {
    /// Number of tasks to submit.
    #[arg(short = 'n', long, default_value = "100")]
    pub tasks: usize,

    /// Every K-th task fails transiently on its first attempt (0 disables).
    #[arg(long, default_value = "0")]
    pub fail_every: usize,

    /// Simulated work per task in milliseconds.
    #[arg(long, default_value = "20")]
    pub work_ms: u64,

    /// YAML configuration file.
    #[arg(short = 'c', long, env = "WORKLINE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Override the number of workers.
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Override the number of admission permits.
    #[arg(short = 'p', long)]
    pub permits: Option<usize>,

    /// Override the buffer capacity.
    #[arg(long)]
    pub capacity: Option<usize>,

    /// Also print the Prometheus metrics export.
    #[arg(long)]
    pub metrics: bool,
}

/// Arguments for `workline config`.
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    /// YAML configuration file.
    #[arg(short = 'c', long, env = "WORKLINE_CONFIG")]
    pub config: Option<PathBuf>,
}

/// Summary printed by `workline demo`.
#[derive(Debug, Serialize)]
struct DemoReport {
    tasks: usize,
    succeeded: usize,
    failed: usize,
    elapsed_ms: u128,
    stats: PoolStats,
}

/// Parse CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Demo(args) => run_demo_command(args).await,
        Commands::Config(args) => run_config_command(args),
    }
}

fn demo_config(args: &DemoArgs) -> anyhow::Result<PipelineConfig> {
    let mut config = PipelineConfig::load(args.config.as_deref())?;
    if let Some(workers) = args.workers {
        config = config.with_worker_count(workers);
    }
    if let Some(permits) = args.permits {
        config = config.with_permit_count(permits);
    }
    if let Some(capacity) = args.capacity {
        config = config.with_buffer_capacity(capacity);
    }
    Ok(config)
}

fn demo_priority(index: usize) -> Priority {
    match index % 3 {
        0 => Priority::High,
        1 => Priority::Normal,
        _ => Priority::Low,
    }
}

async fn demo_task(
    ctx: TaskContext,
    index: usize,
    work: Duration,
    flaky: bool,
) -> Result<usize, WorkFailure> {
    let step = work / DEMO_STEPS;
    for n in 1..=DEMO_STEPS {
        ctx.checkpoint()?;
        tokio::time::sleep(step).await;
        ctx.report_step(n, DEMO_STEPS);
    }
    if flaky && ctx.attempt() == 1 {
        return Err(WorkFailure::transient(format!("task {} flaked", index)));
    }
    Ok(index)
}

async fn run_demo_command(args: DemoArgs) -> anyhow::Result<()> {
    let config = demo_config(&args)?;
    let controller = PipelineController::start(config)?;
    let started = Instant::now();

    info!(tasks = args.tasks, fail_every = args.fail_every, "Submitting demo workload");

    let work = Duration::from_millis(args.work_ms);
    let mut handles = Vec::with_capacity(args.tasks);
    for index in 0..args.tasks {
        let flaky = args.fail_every > 0 && (index + 1) % args.fail_every == 0;
        let handle = controller
            .submit(
                move |ctx: TaskContext| demo_task(ctx, index, work, flaky),
                demo_priority(index),
                None,
            )
            .await?;
        handles.push(handle);
    }

    let mut succeeded = 0;
    let mut failed = 0;
    for handle in &handles {
        match handle.wait().await {
            Ok(_) => succeeded += 1,
            Err(e) => {
                failed += 1;
                warn!(task_id = %handle.id(), error = %e, "Demo task did not succeed");
            }
        }
    }

    let discarded = controller.shutdown_timeout().await;
    if !discarded.is_empty() {
        warn!(discarded = discarded.len(), "Demo shutdown discarded queued tasks");
    }

    let report = DemoReport {
        tasks: args.tasks,
        succeeded,
        failed,
        elapsed_ms: started.elapsed().as_millis(),
        stats: controller.stats(),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);

    if args.metrics {
        println!("{}", controller.export_metrics());
    }
    Ok(())
}

fn run_config_command(args: ConfigArgs) -> anyhow::Result<()> {
    let config = PipelineConfig::load(args.config.as_deref())?;
    config.validate()?;
    print!("{}", config.to_yaml()?);
    Ok(())
}
