//! bookpipe-enrich - Main entry point
//!
//! Subcommands:
//! - `run`: resumable description enrichment of an Item Record table
//! - `join`: rebuild the Joined Dataset from an existing checkpoint (no network)
//! - `gate`: silver quality gate over Item Records or a Joined Dataset
//!
//! Exit codes: 0 complete, 2 degraded, 3 hard abort, 130 interrupted,
//! 1 usage/configuration/input error.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use bookpipe_common::config::{init_logging, ConfigSource};
use bookpipe_common::{quality, table, ItemRecord};
use bookpipe_enrich::config::{self, EnrichSettings, EnrichToml, FetchSection, Overrides, RunSection};
use bookpipe_enrich::workflow::{join_from_checkpoint, EnrichmentDriver};
use bookpipe_enrich::EnrichError;

const EXIT_USAGE: u8 = 1;
const EXIT_ABORT: u8 = 3;

/// Command-line arguments for bookpipe-enrich
#[derive(Parser, Debug)]
#[command(name = "bookpipe-enrich")]
#[command(about = "Resumable description enrichment stage for bookpipe")]
#[command(version)]
struct Cli {
    /// Config file (default: $BOOKPIPE_CONFIG, then <config_dir>/bookpipe/enrich.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level override (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "BOOKPIPE_LOG_LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fetch descriptions for every pending item and write the Joined Dataset
    Run(RunArgs),
    /// Rebuild the Joined Dataset from a checkpoint without network calls
    Join(JoinArgs),
    /// Run the quality gate over Item Records or a Joined Dataset
    Gate(GateArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Item Record Parquet file
    #[arg(long, env = "BOOKPIPE_INPUT")]
    input: PathBuf,

    /// Checkpoint JSON-lines file
    #[arg(long, env = "BOOKPIPE_CHECKPOINT")]
    checkpoint: PathBuf,

    /// Joined Dataset Parquet file to write
    #[arg(long, env = "BOOKPIPE_OUTPUT")]
    output: PathBuf,

    /// Total HTTP attempts per key
    #[arg(long, env = "BOOKPIPE_MAX_ATTEMPTS")]
    max_attempts: Option<u32>,

    /// Backoff after the first failed attempt
    #[arg(long, env = "BOOKPIPE_BACKOFF_BASE_MS")]
    backoff_base_ms: Option<u64>,

    /// Upper bound for any single backoff
    #[arg(long, env = "BOOKPIPE_BACKOFF_CAP_MS")]
    backoff_cap_ms: Option<u64>,

    /// Request rate limit, retries included
    #[arg(long, env = "BOOKPIPE_REQUESTS_PER_SECOND")]
    requests_per_second: Option<f64>,

    /// Per-request timeout
    #[arg(long, env = "BOOKPIPE_REQUEST_TIMEOUT_SECS")]
    request_timeout_secs: Option<u64>,

    /// Abort without output when the error share exceeds this
    #[arg(long, env = "BOOKPIPE_FAILURE_RATE_THRESHOLD")]
    failure_rate_threshold: Option<f64>,

    /// Results required before the failure rate is checked mid-run
    #[arg(long, env = "BOOKPIPE_FAILURE_CHECK_MIN_SAMPLES")]
    failure_check_min_samples: Option<usize>,

    /// Only consider the first N items
    #[arg(long, env = "BOOKPIPE_LIMIT")]
    limit: Option<usize>,

    /// Description API base URL
    #[arg(long, env = "BOOKPIPE_BASE_URL")]
    base_url: Option<String>,

    /// Write the run summary as JSON
    #[arg(long)]
    summary_json: Option<PathBuf>,

    /// Re-fetch keys whose checkpoint entry is `error`
    #[arg(long)]
    retry_errors: bool,
}

impl RunArgs {
    fn overrides(&self) -> Overrides {
        Overrides {
            fetch: FetchSection {
                base_url: self.base_url.clone(),
                max_attempts: self.max_attempts,
                backoff_base_ms: self.backoff_base_ms,
                backoff_cap_ms: self.backoff_cap_ms,
                requests_per_second: self.requests_per_second,
                request_timeout_secs: self.request_timeout_secs,
            },
            run: RunSection {
                failure_rate_threshold: self.failure_rate_threshold,
                failure_check_min_samples: self.failure_check_min_samples,
                progress_interval: None,
                retry_errors_on_resume: self.retry_errors.then_some(true),
                limit: self.limit,
            },
        }
    }
}

#[derive(Args, Debug)]
struct JoinArgs {
    #[arg(long, env = "BOOKPIPE_INPUT")]
    input: PathBuf,

    #[arg(long, env = "BOOKPIPE_CHECKPOINT")]
    checkpoint: PathBuf,

    #[arg(long, env = "BOOKPIPE_OUTPUT")]
    output: PathBuf,
}

#[derive(Args, Debug)]
#[command(group = clap::ArgGroup::new("table").required(true).args(["input", "joined"]))]
struct GateArgs {
    /// Candidate Item Record Parquet file
    #[arg(long)]
    input: Option<PathBuf>,

    /// Joined Dataset Parquet file
    #[arg(long)]
    joined: Option<PathBuf>,

    /// Minimum rows that must pass
    #[arg(long)]
    min_rows: Option<usize>,

    /// Descriptions shorter than this count as short (joined mode)
    #[arg(long)]
    min_description_len: Option<usize>,

    /// Fail when the missing-description share exceeds this (joined mode)
    #[arg(long)]
    max_pct_missing: Option<f64>,

    /// Write gate metrics as JSON
    #[arg(long)]
    metrics_json: Option<PathBuf>,

    /// Write the rows passing the hard rules here when the gate passes
    #[arg(long, requires = "input")]
    validated_output: Option<PathBuf>,
}

/// Input table could not be read
#[derive(Debug, thiserror::Error)]
#[error("cannot read input table {path}: {source}")]
struct InputError {
    path: PathBuf,
    #[source]
    source: bookpipe_common::Error,
}

#[tokio::main]
async fn main() -> ExitCode {
    // clap's own usage exit status (2) collides with "degraded"
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::from(EXIT_USAGE)
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    let (file_config, source) = match config::load(cli.config.as_deref()) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::from(EXIT_USAGE);
        }
    };

    let mut logging = file_config.logging.clone();
    if let Some(level) = &cli.log_level {
        logging.level = level.clone();
    }
    if let Err(e) = init_logging(&logging, "bookpipe_enrich") {
        eprintln!("Error: {}", e);
        return ExitCode::from(EXIT_USAGE);
    }

    match &source {
        ConfigSource::File(path) => info!("Configuration loaded from {}", path.display()),
        ConfigSource::Defaults => warn!("No config file found, using compiled defaults"),
    }

    match dispatch(cli.command, &file_config).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::from(exit_code_for(&e))
        }
    }
}

async fn dispatch(command: Command, file_config: &EnrichToml) -> Result<u8> {
    match command {
        Command::Run(args) => run_enrichment(args, file_config).await,
        Command::Join(args) => run_join(args),
        Command::Gate(args) => run_gate(args, file_config),
    }
}

async fn run_enrichment(args: RunArgs, file_config: &EnrichToml) -> Result<u8> {
    let settings = EnrichSettings::resolve(file_config, &args.overrides())?;
    let items = read_input(&args.input)?;

    info!(
        base_url = %settings.base_url,
        max_attempts = settings.max_attempts,
        requests_per_second = settings.requests_per_second,
        failure_rate_threshold = settings.driver.failure_rate_threshold,
        "Enrichment settings resolved"
    );

    let client = settings.build_client()?;
    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_signal(cancel.clone()));

    let driver = EnrichmentDriver::new(client, settings.driver.clone(), cancel);
    let summary = driver
        .run(&items, &args.checkpoint, &args.output)
        .await
        .context("Enrichment run failed")?;

    println!("{}", summary.display_string());
    if let Some(path) = &args.summary_json {
        summary.write_json(path)?;
        info!("Run summary written to {}", path.display());
    }

    Ok(summary.exit_code())
}

fn run_join(args: JoinArgs) -> Result<u8> {
    let items = read_input(&args.input)?;
    let report = join_from_checkpoint(&items, &args.checkpoint, &args.output)
        .context("Join from checkpoint failed")?;

    println!(
        "{} rows written to {}: {}, {} never attempted",
        report.rows,
        args.output.display(),
        report.counts.display_string(),
        report.unattempted
    );
    Ok(0)
}

fn run_gate(args: GateArgs, file_config: &EnrichToml) -> Result<u8> {
    let passed = if let Some(joined_path) = &args.joined {
        let mut gate = file_config.gate.text.clone();
        if let Some(min_rows) = args.min_rows {
            gate.min_rows = min_rows;
        }
        if let Some(len) = args.min_description_len {
            gate.min_description_len = len;
        }
        if args.max_pct_missing.is_some() {
            gate.max_pct_missing = args.max_pct_missing;
        }

        let rows = table::read_joined(joined_path).map_err(|source| InputError {
            path: joined_path.clone(),
            source,
        })?;
        let report = quality::check_descriptions(&rows, &gate);
        info!(
            rows = report.metrics.rows,
            pct_missing = report.metrics.pct_missing_description,
            pct_short = report.metrics.pct_short_description,
            "Text gate metrics"
        );
        write_metrics(args.metrics_json.as_deref(), &report)?;
        report_failures(&report.failures)
    } else if let Some(input_path) = &args.input {
        let mut gate = file_config.gate.items.clone();
        if let Some(min_rows) = args.min_rows {
            gate.min_rows = min_rows;
        }

        let rows = table::read_item_rows(input_path).map_err(|source| InputError {
            path: input_path.clone(),
            source,
        })?;
        let report = quality::check_items(&rows, &gate);
        info!(
            rows_input = report.metrics.rows_input,
            rows_after_hard_rules = report.metrics.rows_after_hard_rules,
            duplicate_key_groups = report.metrics.duplicate_key_groups,
            invalid_year_count = report.metrics.invalid_year_count,
            "Item gate metrics"
        );
        write_metrics(args.metrics_json.as_deref(), &report)?;
        let passed = report_failures(&report.failures);

        if let (true, Some(path)) = (passed, &args.validated_output) {
            let validated = quality::apply_hard_rules(&rows);
            table::write_items(path, &validated).map_err(|source| EnrichError::Table {
                path: path.clone(),
                source,
            })?;
            info!(rows = validated.len(), "Validated items written to {}", path.display());
        }
        passed
    } else {
        anyhow::bail!("either --input or --joined is required");
    };

    println!("Quality gate {}", if passed { "PASSED" } else { "FAILED" });
    Ok(if passed { 0 } else { EXIT_ABORT })
}

fn report_failures(failures: &[quality::GateFailure]) -> bool {
    for failure in failures {
        error!("Quality gate failure: {}", failure);
    }
    failures.is_empty()
}

fn write_metrics<T: serde::Serialize>(path: Option<&Path>, report: &T) -> Result<()> {
    if let Some(path) = path {
        quality::write_report(path, report)
            .with_context(|| format!("write metrics to {}", path.display()))?;
        info!("Gate metrics written to {}", path.display());
    }
    Ok(())
}

fn read_input(path: &Path) -> Result<Vec<ItemRecord>> {
    let items = table::read_items(path).map_err(|source| InputError {
        path: path.to_path_buf(),
        source,
    })?;
    info!(items = items.len(), "Loaded item records from {}", path.display());
    Ok(items)
}

/// Map a failure to the process exit status
///
/// Storage and integrity faults are hard aborts; everything else (bad
/// arguments, bad config, unreadable input) is a usage error.
fn exit_code_for(err: &anyhow::Error) -> u8 {
    if err.downcast_ref::<InputError>().is_some() {
        return EXIT_USAGE;
    }
    match err.downcast_ref::<EnrichError>() {
        Some(
            EnrichError::CheckpointWrite { .. }
            | EnrichError::Checkpoint(_)
            | EnrichError::Locked(_)
            | EnrichError::RowCountMismatch { .. }
            | EnrichError::Table { .. }
            | EnrichError::Summary { .. },
        ) => EXIT_ABORT,
        Some(EnrichError::Config(_) | EnrichError::HttpClient(_)) | None => EXIT_USAGE,
    }
}

/// Operator interrupt handler
///
/// The first Ctrl+C or SIGTERM cancels `cancel`; the driver finishes the
/// in-flight key and finalizes. A second Ctrl+C exits immediately, which is
/// safe because every checkpoint line is synced before the next key starts.
async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, finishing in-flight key before stopping");
        },
        _ = terminate => {
            info!("Received terminate signal, finishing in-flight key before stopping");
        },
    }
    cancel.cancel();

    if signal::ctrl_c().await.is_ok() {
        warn!("Second interrupt, exiting without finalizing");
        std::process::exit(130);
    }
}
