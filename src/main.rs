//! storescout CLI - Resumable store-location acquisition.

use anyhow::{Context, Result, bail};
use chrono::Utc;
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use storescout::batch::{ProgressUpdate, RunProgress, RunResult};
use storescout::{
    BatchError, BatchRunner, CheckpointStore, Config, HttpClient, JsonlSink, RetryPolicy,
    RunOptions, SourceId, build_feed,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "storescout")]
#[command(version)]
#[command(about = "Resumable store-location acquisition from retail websites")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file
    #[arg(short, long, global = true, default_value = "config.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a fresh run for a source
    Run {
        /// Source to acquire (rewe, denns, file)
        source: SourceId,

        /// Items per batch (overrides config)
        #[arg(short, long)]
        batch_size: Option<usize>,

        /// Stop after this many unique stores
        #[arg(short, long)]
        limit: Option<usize>,

        /// Attempts per batch (overrides config)
        #[arg(long)]
        max_retries: Option<u32>,

        /// Output JSONL file (overrides config)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Resume a failed or interrupted run (latest run if no id is given)
    Resume {
        run_id: Option<String>,

        /// Output JSONL file (overrides config)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// List runs, newest first
    Runs {
        /// Only runs of this source
        #[arg(short, long)]
        source: Option<String>,

        /// Maximum number of runs shown
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Show one run in detail
    Show { run_id: String },

    /// Delete old completed runs, keeping the most recent per source
    Cleanup {
        /// Completed runs kept per source (overrides config)
        #[arg(short, long)]
        keep: Option<usize>,
    },

    /// Validate configuration file
    Validate,

    /// Show example configuration
    Example,
}

fn setup_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set subscriber");
}

fn print_example_config() {
    let example = r#"# storescout configuration file

[checkpoint]
path = "data/checkpoints.db"
keep_recent = 10

[batch]
size = 50
max_retries = 3
retry_base_delay_ms = 1000
retry_max_delay_ms = 60000

[http]
timeout_secs = 30
# user_agent = "storescout/0.1"
request_interval_ms = 500
max_retries = 3

[output]
path = "data/stores.jsonl"

[sources.rewe]
base_url = "https://www.rewe.de"
# One page per search term; defaults to the 16 German states
search_terms = ["Berlin", "Hamburg", "Bayern"]
verify = true
verification_query = "SOTO"
brand = "soto"

[sources.denns]
url = "https://www.biomarkt.de/page-data/marktindex/page-data.json"
country = "DE"

[sources.file]
# Values may reference environment variables
path = "${HOME}/stores.input.jsonl"
"#;
    println!("{example}");
}

/// Load the config file, falling back to defaults when it does not exist.
fn load_config(path: &Path) -> Result<Config> {
    let config = if path.exists() {
        Config::from_file(path).with_context(|| format!("Failed to load config from {path:?}"))?
    } else {
        warn!(path = %path.display(), "Config file not found, using defaults");
        Config::default()
    };
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn open_runner(config: &Config) -> Result<BatchRunner> {
    let store = CheckpointStore::open(&config.checkpoint.path).with_context(|| {
        format!(
            "Failed to open checkpoint store at {:?}",
            config.checkpoint.path
        )
    })?;
    let retry = RetryPolicy::new(
        config.batch.max_retries,
        config.batch.base_delay(),
        config.batch.max_delay(),
    );
    Ok(BatchRunner::new(store, retry))
}

/// Cancel `token` on Ctrl-C; the run stops at the next batch boundary.
fn cancel_on_interrupt(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after the current batch");
            token.cancel();
        }
    });
}

fn progress_bar() -> ProgressBar {
    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} ({percent}%) {msg}")
            .unwrap()
            .progress_chars("##-"),
    );
    pb
}

fn update_bar(pb: &ProgressBar, update: &ProgressUpdate) {
    let handled = update.processed + update.failed;
    pb.set_length(update.total.unwrap_or(handled).max(handled));
    pb.set_position(handled);
    pb.set_message(format!(
        "batch {} | {} failed",
        update.batch_index, update.failed
    ));
}

fn report(
    result: std::result::Result<RunResult, BatchError>,
    pb: &ProgressBar,
    sink: &JsonlSink,
    http: &HttpClient,
) -> ExitCode {
    match result {
        Ok(result) => {
            pb.finish_and_clear();
            println!("\n=== Run Complete ===");
            println!("Run:         {}", result.run_id);
            println!("Processed:   {}", result.processed);
            println!("Failed:      {}", result.failed);
            println!("Duplicates:  {}", result.duplicates);
            println!("Written:     {}", sink.written());
            let stats = http.pacer().stats();
            println!("Requests:    {}", stats.total_requests);
            println!("Rate limits: {}", stats.total_429s);
            println!("Output:      {:?}", sink.path());
            ExitCode::SUCCESS
        }
        Err(err) => {
            pb.abandon();
            eprintln!("\nRun failed: {err}");
            if let Some(run_id) = err.run_id() {
                eprintln!("Run id:      {run_id}");
                if !matches!(err, BatchError::AlreadyCompleted(_)) {
                    eprintln!("Resume with: storescout resume {run_id}");
                }
            }
            ExitCode::FAILURE
        }
    }
}

fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    format!("{}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
}

fn print_runs(store: &CheckpointStore, source: Option<&str>, limit: usize) -> Result<()> {
    let runs = store.list_runs(source)?;
    if runs.is_empty() {
        println!("No runs found");
        return Ok(());
    }

    let now = Utc::now();
    println!(
        "{:<40} {:<10} {:>9} {:>7} {:>9} {:>8} {:>9}",
        "RUN", "STATUS", "PROCESSED", "FAILED", "TOTAL", "PERCENT", "ETA"
    );
    for run in runs.iter().take(limit) {
        let progress = RunProgress::from_run(run, now);
        println!(
            "{:<40} {:<10} {:>9} {:>7} {:>9} {:>8} {:>9}",
            run.run_id,
            run.status.as_str(),
            run.items_processed,
            run.items_failed,
            run.total_items.map_or("-".to_string(), |t| t.to_string()),
            progress
                .percentage
                .map_or("-".to_string(), |p| format!("{p:.1}%")),
            progress.eta.map_or("-".to_string(), format_duration),
        );
    }
    Ok(())
}

fn print_run(store: &CheckpointStore, run_id: &str) -> Result<()> {
    let run = store.get_run(run_id)?;
    let progress = RunProgress::from_run(&run, Utc::now());

    println!("Run:         {}", run.run_id);
    println!("Source:      {}", run.source_id);
    println!("Status:      {}", run.status);
    println!("Started:     {}", run.started_at.to_rfc3339());
    if let Some(at) = run.last_checkpoint_at {
        println!("Checkpoint:  {}", at.to_rfc3339());
    }
    if let Some(at) = run.completed_at {
        println!("Completed:   {}", at.to_rfc3339());
    }
    println!("Batch size:  {}", run.batch_size);
    println!("Last batch:  {}", run.current_batch_index);
    println!("Processed:   {}", run.items_processed);
    println!("Failed:      {}", run.items_failed);
    if let Some(total) = run.total_items {
        println!("Total:       {total}");
    }
    if let Some(p) = progress.percentage {
        println!("Progress:    {p:.2}%");
    }
    if let Some(rate) = progress.rate {
        println!("Rate:        {rate:.2} items/s");
    }
    if let Some(eta) = progress.eta {
        println!("ETA:         {}", format_duration(eta));
    }
    if let Some(message) = &run.error_message {
        println!("Error:       {message}");
    }
    if let Some(state) = &run.custom_state {
        println!("State:\n{}", serde_json::to_string_pretty(state)?);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match cli.command {
        Commands::Example => {
            print_example_config();
        }

        Commands::Validate => {
            let config = Config::from_file(&cli.config)
                .with_context(|| format!("Failed to load config from {:?}", cli.config))?;
            config.validate().context("Invalid configuration")?;

            info!("Configuration is valid");
            info!(
                "  Batches: {} items, {} attempts",
                config.batch.size, config.batch.max_retries
            );
            info!("  Checkpoints: {:?}", config.checkpoint.path);
            info!("  Output: {:?}", config.output.path);
            info!(
                "  REWE: {} search terms, verification {}",
                config.sources.rewe.search_terms.len(),
                if config.sources.rewe.verify { "on" } else { "off" }
            );
        }

        Commands::Run {
            source,
            batch_size,
            limit,
            max_retries,
            output,
        } => {
            let config = load_config(&cli.config)?;
            let mut runner = open_runner(&config)?;
            cancel_on_interrupt(runner.cancellation_token());

            let http = Arc::new(HttpClient::new(&config.http)?);
            let feed = build_feed(source, &config, Arc::clone(&http))?;
            let output = output.unwrap_or_else(|| config.output.path.clone());
            let mut sink = JsonlSink::open(&output)?;

            let mut options = RunOptions::new(batch_size.unwrap_or(config.batch.size));
            if let Some(limit) = limit {
                options = options.item_limit(limit);
            }
            if let Some(max_retries) = max_retries {
                options = options.max_retries(max_retries);
            }

            let pb = progress_bar();
            let mut on_progress = |update: &ProgressUpdate| update_bar(&pb, update);
            let result = runner
                .process(
                    feed,
                    source.as_str(),
                    options,
                    &mut sink,
                    Some(&mut on_progress),
                )
                .await;
            return Ok(report(result, &pb, &sink, &http));
        }

        Commands::Resume { run_id, output } => {
            let config = load_config(&cli.config)?;
            let mut runner = open_runner(&config)?;
            cancel_on_interrupt(runner.cancellation_token());

            let run = match run_id {
                Some(id) => runner.store().get_run(&id)?,
                None => match runner.store().latest_run(None)? {
                    Some(run) => run,
                    None => bail!("No runs to resume"),
                },
            };
            let source: SourceId = run
                .source_id
                .parse()
                .map_err(|e: String| anyhow::anyhow!(e))?;

            let http = Arc::new(HttpClient::new(&config.http)?);
            let feed = build_feed(source, &config, Arc::clone(&http))?;
            let output = output.unwrap_or_else(|| config.output.path.clone());
            let mut sink = JsonlSink::open(&output)?;

            info!(run_id = %run.run_id, status = %run.status, "Resuming");
            let pb = progress_bar();
            let mut on_progress = |update: &ProgressUpdate| update_bar(&pb, update);
            let result = runner
                .resume(feed, &mut sink, Some(&mut on_progress), Some(&run.run_id))
                .await;
            return Ok(report(result, &pb, &sink, &http));
        }

        Commands::Runs { source, limit } => {
            let config = load_config(&cli.config)?;
            let store = CheckpointStore::open(&config.checkpoint.path)?;
            print_runs(&store, source.as_deref(), limit)?;
        }

        Commands::Show { run_id } => {
            let config = load_config(&cli.config)?;
            let store = CheckpointStore::open(&config.checkpoint.path)?;
            print_run(&store, &run_id)?;
        }

        Commands::Cleanup { keep } => {
            let config = load_config(&cli.config)?;
            let store = CheckpointStore::open(&config.checkpoint.path)?;
            let keep = keep.unwrap_or(config.checkpoint.keep_recent);
            let removed = store.cleanup_old_runs(keep)?;
            println!("Removed {removed} completed runs (kept {keep} per source)");
        }
    }

    Ok(ExitCode::SUCCESS)
}
