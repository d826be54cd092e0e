//! CLI command definitions for group-queue.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use serde_json::Value;
use tracing::{info, warn};

use crate::config::{ConsumerRegistry, EngineConfig};
use crate::dispatch::{JobEnvelope, RedisJobDispatcher};
use crate::grouping::{GroupSummary, Grouping};
use crate::ingest::{Intercepted, Interceptor, Submission};
use crate::metrics::{export_metrics, init_metrics};
use crate::store::RedisGroupStore;
use crate::sweeper::{FlushSweeper, RevivalSweeper, Supervisor, SweepReport};

/// Redis-backed message grouping with size and time triggered flushes.
#[derive(Parser, Debug)]
#[command(name = "group-queue")]
#[command(about = "Accumulate job submissions into groups and release them in batches")]
#[command(version)]
#[command(
    long_about = "group-queue accumulates messages into named groups held in Redis and releases them\nto the host job queue when a group grows past its threshold or its interval elapses.\n\nExample usage:\n  group-queue --consumers consumers.yaml run\n  group-queue list --json"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// Redis URL. Overrides GROUPING_REDIS_URL / REDIS_URL.
    #[arg(long, global = true)]
    pub redis_url: Option<String>,

    /// Key namespace. Overrides GROUPING_NAMESPACE.
    #[arg(long, global = true)]
    pub namespace: Option<String>,

    /// YAML file with per-consumer settings.
    #[arg(short, long, global = true, env = "GROUPING_CONSUMERS")]
    pub consumers: Option<PathBuf>,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand, Debug)]
pub enum Commands {
    /// Run the flush and revival sweepers until interrupted.
    Run(RunArgs),

    /// List groups with their size, pending dispatches and flush times.
    #[command(alias = "ls")]
    List(ListArgs),

    /// Delete a group and its queued messages.
    Delete(DeleteArgs),

    /// Run one flush sweep.
    Flush(FlushArgs),

    /// Run one revival sweep.
    Revive,

    /// Submit one job through the interceptor.
    Push(PushArgs),
}

#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Print Prometheus metrics on shutdown.
    #[arg(long)]
    pub metrics: bool,
}

#[derive(Parser, Debug)]
pub struct ListArgs {
    /// Output JSON instead of a table.
    #[arg(short = 'j', long)]
    pub json: bool,
}

#[derive(Parser, Debug)]
pub struct DeleteArgs {
    /// Group name (`consumer:queue`).
    pub group: String,
}

#[derive(Parser, Debug)]
pub struct FlushArgs {
    /// Flush every group regardless of size or interval.
    #[arg(long)]
    pub force: bool,
}

#[derive(Parser, Debug)]
pub struct PushArgs {
    /// Consumer the job is for.
    pub consumer: String,

    /// Queue the job is for.
    #[arg(short, long, default_value = "default")]
    pub queue: String,

    /// Job arguments as a JSON array.
    pub args: String,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let (config, consumers) = load_configuration(&cli)?;

    match cli.command {
        Commands::Run(args) => run_supervisor(config, consumers, args).await,
        Commands::List(args) => {
            let grouping = Grouping::connect(config, consumers).await?;
            run_list_command(&grouping, args).await
        }
        Commands::Delete(args) => {
            let grouping = Grouping::connect(config, consumers).await?;
            grouping.delete(&args.group).await?;
            println!("Deleted {}", args.group);
            Ok(())
        }
        Commands::Flush(args) => {
            let grouping = Grouping::connect(config, consumers).await?;
            let sweeper = FlushSweeper::new(grouping);
            let report = if args.force {
                sweeper.force_flush().await?
            } else {
                sweeper.sweep().await?
            };
            print_report("flush", &report);
            Ok(())
        }
        Commands::Revive => {
            let grouping = Grouping::connect(config, consumers).await?;
            let report = RevivalSweeper::new(grouping).sweep().await?;
            print_report("revival", &report);
            Ok(())
        }
        Commands::Push(args) => run_push_command(config, consumers, args).await,
    }
}

/// Builds the engine configuration from the environment and CLI overrides,
/// and loads the consumer file if one was given.
fn load_configuration(cli: &Cli) -> anyhow::Result<(EngineConfig, ConsumerRegistry)> {
    let mut config = EngineConfig::from_env().context("Invalid GROUPING_* environment")?;
    if let Some(url) = &cli.redis_url {
        config = config.with_redis_url(url);
    }
    if let Some(namespace) = &cli.namespace {
        config = config.with_namespace(namespace);
    }
    config.validate()?;

    let consumers = match &cli.consumers {
        Some(path) => ConsumerRegistry::from_file(path)
            .with_context(|| format!("Failed to load consumer file {}", path.display()))?,
        None => {
            warn!("No consumer file given, every consumer uses default settings");
            ConsumerRegistry::new()
        }
    };

    Ok((config, consumers))
}

async fn run_supervisor(
    config: EngineConfig,
    consumers: ConsumerRegistry,
    args: RunArgs,
) -> anyhow::Result<()> {
    if args.metrics {
        init_metrics().context("Failed to initialize metrics")?;
    }

    let grouping = Grouping::connect(config, consumers).await?;
    let mut supervisor = Supervisor::new(grouping);
    supervisor.start()?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Received interrupt, shutting down");

    supervisor.shutdown().await?;

    let stats = supervisor.stats();
    info!(
        flush_sweeps = stats.flush_sweeps,
        revival_sweeps = stats.revival_sweeps,
        dispatched = stats.messages_dispatched,
        revived = stats.messages_revived,
        failures = stats.failures,
        "Supervisor stopped"
    );

    if args.metrics {
        print!("{}", export_metrics());
    }
    Ok(())
}

async fn run_list_command(grouping: &Grouping, args: ListArgs) -> anyhow::Result<()> {
    let summaries = grouping.overview().await?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&summaries)?);
    } else {
        print!("{}", format_overview(&summaries));
    }
    Ok(())
}

async fn run_push_command(
    config: EngineConfig,
    consumers: ConsumerRegistry,
    args: PushArgs,
) -> anyhow::Result<()> {
    let job_args = parse_job_args(&args.args)?;

    let client = redis::Client::open(config.redis_url.as_str())?;
    let connection = redis::aio::ConnectionManager::new(client)
        .await
        .context("Failed to connect to Redis")?;
    let store = Arc::new(RedisGroupStore::from_connection(
        connection.clone(),
        &config.namespace,
    ));
    let dispatcher = Arc::new(RedisJobDispatcher::from_connection(connection));
    let grouping = Grouping::new(config, consumers, store, dispatcher.clone());

    let submission = Submission::new(args.consumer, args.queue, job_args);
    match Interceptor::new(grouping).intercept(submission).await? {
        Intercepted::Grouped { added } => {
            println!("Grouped ({} message(s) added)", added);
        }
        Intercepted::Dispatch(submission) => {
            let envelope =
                JobEnvelope::new(submission.consumer, submission.queue, submission.args);
            dispatcher.enqueue(&envelope).await?;
            println!("Enqueued directly as job {}", envelope.jid);
        }
    }
    Ok(())
}

fn parse_job_args(raw: &str) -> anyhow::Result<Vec<Value>> {
    match serde_json::from_str::<Value>(raw).context("Job arguments are not valid JSON")? {
        Value::Array(items) => Ok(items),
        other => Err(anyhow::anyhow!(
            "Job arguments must be a JSON array, got {}",
            other
        )),
    }
}

fn format_overview(summaries: &[GroupSummary]) -> String {
    if summaries.is_empty() {
        return "No groups\n".to_string();
    }

    let mut out = format!(
        "{:<40} {:>8} {:>8} {:<25} {:<25}\n",
        "GROUP", "SIZE", "PENDING", "LAST FLUSH", "NEXT FLUSH"
    );
    for summary in summaries {
        let last = summary
            .last_flush
            .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
            .unwrap_or_else(|| "-".to_string());
        let next = summary
            .next_flush
            .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
            .unwrap_or_else(|| "-".to_string());
        out.push_str(&format!(
            "{:<40} {:>8} {:>8} {:<25} {:<25}\n",
            summary.name, summary.size, summary.pending, last, next
        ));
    }
    out
}

fn print_report(sweep: &str, report: &SweepReport) {
    println!(
        "{} sweep: {} group(s), {} succeeded, {} message(s)",
        sweep, report.attempted, report.succeeded, report.messages
    );
    for (group, error) in &report.failures {
        println!("  failed {}: {}", group, error);
    }
}
