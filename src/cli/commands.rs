//! CLI command definitions for crawl-forge.
//!
//! Each subcommand opens the durable queue under the data directory and
//! drives one part of the engine: the long-running worker pool, queue
//! inspection, or a one-shot rate-limited batch.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use tracing::{info, warn};

use crate::batch::{BatchJobResults, BatchJobStatus, BatchRunner, ResultsQuery};
use crate::config::EngineConfig;
use crate::control::ControlSurface;
use crate::metrics::init_metrics;
use crate::monitor::{ResourceMonitor, ResourceTelemetry, SysinfoTelemetry};
use crate::processor::FetchProcessor;
use crate::scheduler::{AdaptiveWorkerPool, DurableQueue};

/// Default seconds between status log lines in `run`.
const DEFAULT_STATUS_INTERVAL_SECS: u64 = 30;

/// Durable, self-tuning URL crawl engine.
#[derive(Parser)]
#[command(name = "crawl-forge")]
#[command(about = "Crawl URLs from a durable queue with adaptive concurrency")]
#[command(version)]
#[command(
    long_about = "crawl-forge drains a file-backed URL queue with a worker pool that tunes its \
own concurrency from job durations and host load.\n\nExample usage:\n  \
crawl-forge add urls.txt\n  crawl-forge run --exit-when-drained"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// Data directory for queue files, checkpoints, history and pages.
    #[arg(short = 'd', long, global = true)]
    pub data_dir: Option<PathBuf>,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Start the worker pool and process the queue.
    Run(RunArgs),

    /// Add URLs from a file to the queue.
    Add(AddArgs),

    /// Print queue statistics as JSON.
    Stats,

    /// Print the failure registry as JSON.
    Failures,

    /// Fetch a URL file through the rate-limited batch runner.
    Batch(BatchArgs),
}

#[derive(Parser, Debug)]
pub struct RunArgs {
    /// File of URLs (one per line) to enqueue before starting.
    #[arg(short = 'u', long)]
    pub urls_file: Option<PathBuf>,

    /// Starting worker concurrency.
    #[arg(long)]
    pub initial_concurrency: Option<usize>,

    /// Upper bound on worker concurrency.
    #[arg(long)]
    pub max_concurrency: Option<usize>,

    /// Do not start the resource monitor.
    #[arg(long)]
    pub no_monitor: bool,

    /// Seconds between status log lines.
    #[arg(long, default_value_t = DEFAULT_STATUS_INTERVAL_SECS)]
    pub status_interval: u64,

    /// Stop once nothing is queued or in progress.
    #[arg(long)]
    pub exit_when_drained: bool,

    /// Directory for fetched pages (default: <data-dir>/pages).
    #[arg(short = 'o', long)]
    pub output: Option<PathBuf>,

    /// Write the Prometheus exposition to this file on exit.
    #[arg(long)]
    pub metrics_out: Option<PathBuf>,
}

#[derive(Parser, Debug)]
pub struct AddArgs {
    /// File of URLs, one per line.
    pub file: PathBuf,
}

#[derive(Parser, Debug)]
pub struct BatchArgs {
    /// File of URLs, one per line.
    pub file: PathBuf,

    /// Requests allowed per minute.
    #[arg(long, env = "CRAWL_REQUESTS_PER_MINUTE")]
    pub requests_per_minute: Option<u32>,

    /// Items per chunk.
    #[arg(long, env = "CRAWL_BATCH_SIZE")]
    pub batch_size: Option<usize>,

    /// Items in flight at once.
    #[arg(long, env = "CRAWL_MAX_CONCURRENT_REQUESTS")]
    pub max_concurrent_requests: Option<usize>,

    /// Directory for fetched pages (default: <data-dir>/pages).
    #[arg(short = 'o', long)]
    pub output: Option<PathBuf>,

    /// Maximum results to print.
    #[arg(long, default_value_t = crate::batch::DEFAULT_RESULTS_LIMIT)]
    pub limit: usize,

    /// Leave failed items out of the printed results.
    #[arg(long)]
    pub hide_failed: bool,
}

/// Parse CLI arguments without running any command.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
///
/// For control over logging initialization, use `parse_cli()` and `run_with_cli()`.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(cli.data_dir.as_deref())?;
    match cli.command {
        Commands::Run(args) => run_run_command(config, args).await,
        Commands::Add(args) => run_add_command(config, args).await,
        Commands::Stats => run_stats_command(config).await,
        Commands::Failures => run_failures_command(config).await,
        Commands::Batch(args) => run_batch_command(config, args).await,
    }
}

/// Loads `CRAWL_*` configuration and applies the global `--data-dir` flag.
fn load_config(data_dir: Option<&Path>) -> anyhow::Result<EngineConfig> {
    let mut config = EngineConfig::from_env().context("Invalid CRAWL_* configuration")?;
    if let Some(dir) = data_dir {
        config.data_dir = dir.to_path_buf();
    }
    Ok(config)
}

async fn open_queue(config: &EngineConfig) -> anyhow::Result<Arc<DurableQueue>> {
    let queue = DurableQueue::open_in_dir(config.queue_dir(), config.queue.clone())
        .await
        .with_context(|| format!("Failed to open queue in {}", config.data_dir.display()))?;
    Ok(Arc::new(queue))
}

/// Reads a URL list: one URL per line, blank lines skipped.
async fn read_urls_file(path: &Path) -> anyhow::Result<Vec<String>> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read URL file {}", path.display()))?;
    Ok(parse_url_lines(&content))
}

fn parse_url_lines(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(value).context("Failed to serialize JSON output")?;
    println!("{}", json);
    Ok(())
}

// ============================================================================
// run
// ============================================================================

async fn run_run_command(mut config: EngineConfig, args: RunArgs) -> anyhow::Result<()> {
    if let Some(initial) = args.initial_concurrency {
        config.pool.initial_concurrency = initial;
    }
    if let Some(max) = args.max_concurrency {
        config.pool.max_concurrency = max;
    }
    config.validate()?;

    if let Err(e) = init_metrics() {
        warn!(error = %e, "Failed to initialize metrics");
    }

    let queue = open_queue(&config).await?;
    if let Some(ref file) = args.urls_file {
        let urls = read_urls_file(file).await?;
        let added = queue.add(urls).await;
        info!(added = added, file = %file.display(), "Loaded URLs");
    }

    let output_dir = args.output.clone().unwrap_or_else(|| config.output_dir());
    let processor = Arc::new(FetchProcessor::new(&output_dir));

    let telemetry: Arc<dyn ResourceTelemetry> = Arc::new(SysinfoTelemetry::new(&config.data_dir));
    let pool = Arc::new(AdaptiveWorkerPool::new(
        config.pool.clone(),
        Arc::clone(&telemetry),
        config.checkpoint_dir(),
    )?);
    pool.start(Arc::clone(&queue), processor).await?;

    let mut control = ControlSurface::new(Arc::clone(&pool), Arc::clone(&queue));
    let monitor = if args.no_monitor {
        None
    } else {
        let monitor = Arc::new(ResourceMonitor::new(
            config.monitor.clone(),
            telemetry,
            Arc::clone(&pool),
            Arc::clone(&queue),
            config.history_dir(),
        )?);
        monitor.start().await?;
        control = control.with_monitor(Arc::clone(&monitor));
        Some(monitor)
    };

    info!(
        data_dir = %config.data_dir.display(),
        output_dir = %output_dir.display(),
        initial_concurrency = config.pool.initial_concurrency,
        max_concurrency = config.pool.max_concurrency,
        monitor = monitor.is_some(),
        "Crawl engine started"
    );

    let mut status_tick =
        tokio::time::interval(Duration::from_secs(args.status_interval.max(1)));
    let mut drain_tick = tokio::time::interval(Duration::from_secs(1));
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = &mut shutdown => {
                if let Err(e) = result {
                    warn!(error = %e, "Failed to listen for Ctrl-C");
                }
                info!("Interrupt received, shutting down");
                break;
            }
            _ = status_tick.tick() => {
                let status = control.status().await;
                info!(
                    processed = status.processor.urls_processed,
                    succeeded = status.processor.urls_succeeded,
                    failed = status.processor.urls_failed,
                    concurrency = status.processor.current_concurrency,
                    paused = status.processor.paused,
                    queued = status.queue.queued,
                    completed = status.queue.completed,
                    eta_seconds = status.processor.eta_seconds.unwrap_or(0.0),
                    success_rate = status.processor.success_rate(),
                    "Status"
                );
            }
            _ = drain_tick.tick(), if args.exit_when_drained => {
                let stats = queue.stats().await;
                if stats.in_progress == 0
                    && pool.active_tasks() == 0
                    && queue.dispatchable().await == 0
                {
                    info!(completed = stats.completed, "Queue drained, shutting down");
                    break;
                }
            }
        }
    }

    if let Some(monitor) = &monitor {
        monitor.stop().await;
    }
    pool.stop().await?;

    if let Some(path) = &args.metrics_out {
        tokio::fs::write(path, control.metrics())
            .await
            .with_context(|| format!("Failed to write metrics to {}", path.display()))?;
    }

    print_json(&control.status().await)
}

// ============================================================================
// add / stats / failures
// ============================================================================

async fn run_add_command(config: EngineConfig, args: AddArgs) -> anyhow::Result<()> {
    let urls = read_urls_file(&args.file).await?;
    let queue = open_queue(&config).await?;
    let added = queue.add(urls).await;
    println!("{}", added);
    Ok(())
}

async fn run_stats_command(config: EngineConfig) -> anyhow::Result<()> {
    let queue = open_queue(&config).await?;
    print_json(&queue.stats().await)
}

async fn run_failures_command(config: EngineConfig) -> anyhow::Result<()> {
    let queue = open_queue(&config).await?;
    print_json(&queue.failures().await)
}

// ============================================================================
// batch
// ============================================================================

#[derive(Serialize)]
struct BatchOutput {
    status: BatchJobStatus,
    results: BatchJobResults,
}

async fn run_batch_command(mut config: EngineConfig, args: BatchArgs) -> anyhow::Result<()> {
    if let Some(rpm) = args.requests_per_minute {
        config.rate_limit.requests_per_minute = rpm;
    }
    if let Some(size) = args.batch_size {
        config.rate_limit.batch_size = size;
    }
    if let Some(max) = args.max_concurrent_requests {
        config.rate_limit.max_concurrent_requests = max;
    }

    if let Err(e) = init_metrics() {
        warn!(error = %e, "Failed to initialize metrics");
    }

    let urls = read_urls_file(&args.file).await?;
    let output_dir = args.output.clone().unwrap_or_else(|| config.output_dir());
    let processor = FetchProcessor::new(output_dir);
    let runner = BatchRunner::new(config.rate_limit.clone())?;

    info!(items = urls.len(), "Starting batch");
    let job_id = runner
        .process_batch(urls, |url: String| {
            let processor = processor.clone();
            async move { processor.fetch(&url).await }
        })
        .await?;

    let status = runner.get_job_status(&job_id).await?;
    let results = runner
        .get_job_results(
            &job_id,
            ResultsQuery {
                include_failed: !args.hide_failed,
                limit: args.limit,
                offset: 0,
            },
        )
        .await?;

    print_json(&BatchOutput { status, results })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parses() {
        // Verify CLI definition is valid
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_command_defaults() {
        let cli = Cli::try_parse_from(["crawl-forge", "run"]).expect("should parse");
        assert_eq!(cli.log_level, "info");
        assert!(cli.data_dir.is_none());

        match cli.command {
            Commands::Run(args) => {
                assert!(args.urls_file.is_none());
                assert!(args.initial_concurrency.is_none());
                assert!(!args.no_monitor);
                assert!(!args.exit_when_drained);
                assert_eq!(args.status_interval, DEFAULT_STATUS_INTERVAL_SECS);
            }
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_run_command_with_options() {
        let cli = Cli::try_parse_from([
            "crawl-forge",
            "--data-dir",
            "/tmp/crawl",
            "run",
            "-u",
            "urls.txt",
            "--max-concurrency",
            "20",
            "--no-monitor",
            "--exit-when-drained",
            "-l",
            "debug",
        ])
        .expect("should parse");

        assert_eq!(cli.data_dir, Some(PathBuf::from("/tmp/crawl")));
        assert_eq!(cli.log_level, "debug");
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.urls_file, Some(PathBuf::from("urls.txt")));
                assert_eq!(args.max_concurrency, Some(20));
                assert!(args.no_monitor);
                assert!(args.exit_when_drained);
            }
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_add_requires_file() {
        assert!(Cli::try_parse_from(["crawl-forge", "add"]).is_err());
        let cli = Cli::try_parse_from(["crawl-forge", "add", "urls.txt"]).expect("should parse");
        assert!(matches!(cli.command, Commands::Add(_)));
    }

    #[test]
    fn test_batch_command_options() {
        let cli = Cli::try_parse_from([
            "crawl-forge",
            "batch",
            "urls.txt",
            "--requests-per-minute",
            "30",
            "--limit",
            "5",
            "--hide-failed",
        ])
        .expect("should parse");

        match cli.command {
            Commands::Batch(args) => {
                assert_eq!(args.file, PathBuf::from("urls.txt"));
                assert_eq!(args.requests_per_minute, Some(30));
                assert_eq!(args.limit, 5);
                assert!(args.hide_failed);
            }
            _ => panic!("Expected Batch command"),
        }
    }

    #[test]
    fn test_parse_url_lines_skips_blanks() {
        let urls = parse_url_lines("https://a.example\n\n  https://b.example  \n\t\n");
        assert_eq!(urls, vec!["https://a.example", "https://b.example"]);
    }

    #[tokio::test]
    async fn test_add_then_stats_round_trip_through_data_dir() {
        let dir = tempfile::TempDir::new().unwrap();
        let file = dir.path().join("urls.txt");
        tokio::fs::write(&file, "https://a.example\nhttps://b.example\nhttps://a.example\n")
            .await
            .unwrap();

        let config = EngineConfig::default().with_data_dir(dir.path());
        run_add_command(config.clone(), AddArgs { file }).await.unwrap();

        let queue = open_queue(&config).await.unwrap();
        let stats = queue.stats().await;
        assert_eq!(stats.queued, 2);
        assert_eq!(stats.completed, 0);
    }
}
