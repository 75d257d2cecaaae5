//! time-warp-test entry point.
//!
//! Runs one sampling worker per CPU (or as many as requested) against a
//! shared table of the last value seen on each time source, and reports
//! every backward step.

mod signals;

use anyhow::{Context, Result};
use clap::error::ErrorKind;
use clap::Parser;
use std::io::Write;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing::{info, warn};
use warp_common::config::{DetectorConfig, WorkerMode};
use warp_common::source::TimeSource;
use warp_runtime::session::Session;

use crate::signals::ShutdownSignal;

/// Exit status for unusable arguments.
const USAGE_EXIT: i32 = 255;

/// time-warp-test command-line arguments.
#[derive(Parser, Debug)]
#[command(
    name = "time-warp-test",
    about = "Check TSC, gettimeofday and CLOCK_MONOTONIC for time warps across CPUs",
    version,
    long_about = None
)]
struct Args {
    /// Number of parallel test tasks (default: one per online CPU).
    #[arg(value_name = "THREADS")]
    tasks: Option<NonZeroUsize>,

    /// Path to a detector configuration file (TOML).
    #[arg(long, short = 'c', value_name = "FILE")]
    config: Option<PathBuf>,

    /// Run workers as threads of one process instead of forked processes.
    #[arg(long)]
    threads: bool,

    /// Pin worker i to CPU i modulo the CPU count.
    #[arg(long)]
    pin: bool,

    /// Stop after this much wall time (e.g. "30s", "5m").
    #[arg(long, value_name = "DURATION", value_parser = humantime::parse_duration)]
    duration: Option<Duration>,

    /// Stop after this many reporter iterations (0 = infinite).
    #[arg(long, value_name = "N")]
    max_iterations: Option<u64>,

    /// Do not sample the time stamp counter.
    #[arg(long)]
    no_tsc: bool,

    /// Do not sample gettimeofday.
    #[arg(long)]
    no_tod: bool,

    /// Do not sample CLOCK_MONOTONIC.
    #[arg(long)]
    no_clock: bool,

    /// Exit with status 1 if any warp was detected.
    #[arg(long)]
    fail_on_warp: bool,

    /// Print a JSON summary when the run ends.
    #[arg(long)]
    json: bool,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, short = 'l', default_value = "warn")]
    log_level: String,
}

fn main() -> Result<ExitCode> {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => e.exit(),
        Err(e) => {
            // Best effort; the exit status carries the failure
            let _ = e.print();
            std::process::exit(USAGE_EXIT);
        }
    };

    init_logging(&args.log_level);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting time-warp-test");

    let mut config = load_config(&args)?;
    apply_overrides(&args, &mut config);

    info!(
        tasks = ?config.tasks,
        mode = ?config.worker_mode,
        sources = ?config.sources,
        "Configuration loaded"
    );

    let signals = ShutdownSignal::install().context("Failed to set up signal handlers")?;
    let session = Session::new(config).context("Failed to set up time-warp detection")?;

    run(&session, &signals, &args)
}

/// Print the banner, run the session and handle the summary.
fn run(session: &Session, signals: &ShutdownSignal, args: &Args) -> Result<ExitCode> {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();

    out.write_all(session.banner().as_bytes())
        .context("Failed to write banner")?;

    let summary = session
        .run(signals.flag(), &mut out)
        .context("Time-warp detection failed")?;

    // Terminate the last carriage-return status line
    writeln!(out).context("Failed to write to stdout")?;

    if let Some(signal) = signals.last_signal() {
        info!(%signal, "Stopped by signal");
    }

    if args.json {
        let json = serde_json::to_string_pretty(&summary).context("Failed to encode summary")?;
        writeln!(out, "{json}").context("Failed to write summary")?;
    }

    if args.fail_on_warp && summary.total_warps() > 0 {
        warn!(warps = summary.total_warps(), "Time warps detected");
        return Ok(ExitCode::FAILURE);
    }

    Ok(ExitCode::SUCCESS)
}

/// Initialize logging with the specified log level. Logs go to stderr.
fn init_logging(level: &str) {
    let filter = format!("time_warp_test={level},warp_runtime={level},warp_common={level}");

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&filter)),
        )
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(true)
        .init();
}

/// Load configuration from file or use defaults.
///
/// Resolution priority (first existing file wins):
/// 1. Command-line `--config` argument
/// 2. `TIME_WARP_CONFIG` environment variable
/// 3. `/etc/time-warp/config.toml` (system path)
/// 4. `config/time-warp.toml` (local development)
/// 5. Built-in defaults
fn load_config(args: &Args) -> Result<DetectorConfig> {
    if let Some(config_path) = &args.config {
        info!(?config_path, "Loading config from command-line argument");
        return DetectorConfig::from_file(config_path)
            .with_context(|| format!("Failed to load config from {config_path:?}"));
    }

    if let Ok(env_path) = std::env::var("TIME_WARP_CONFIG") {
        let config_path = PathBuf::from(&env_path);
        if config_path.exists() {
            info!(?config_path, "Loading config from TIME_WARP_CONFIG");
            return DetectorConfig::from_file(&config_path).with_context(|| {
                format!("Failed to load config from TIME_WARP_CONFIG={env_path:?}")
            });
        }
        warn!(
            path = %env_path,
            "TIME_WARP_CONFIG set but file does not exist, checking other locations"
        );
    }

    for path in ["/etc/time-warp/config.toml", "config/time-warp.toml"] {
        let config_path = PathBuf::from(path);
        if config_path.exists() {
            info!(?config_path, "Loading config file");
            return DetectorConfig::from_file(&config_path)
                .with_context(|| format!("Failed to load config from {config_path:?}"));
        }
    }

    info!("No config file found, using built-in defaults");
    Ok(DetectorConfig::default())
}

/// Command-line flags take precedence over file values.
fn apply_overrides(args: &Args, config: &mut DetectorConfig) {
    if let Some(tasks) = args.tasks {
        config.tasks = Some(tasks);
    }
    if args.threads {
        config.worker_mode = WorkerMode::Thread;
    }
    if args.pin {
        config.pin_workers = true;
    }
    if let Some(duration) = args.duration {
        config.duration = Some(duration);
    }
    if let Some(max_iterations) = args.max_iterations {
        config.max_iterations = max_iterations;
    }

    for (disabled, source) in [
        (args.no_tsc, TimeSource::Tsc),
        (args.no_tod, TimeSource::Tod),
        (args.no_clock, TimeSource::Clock),
    ] {
        if disabled {
            config.sources.set(source, false);
        }
    }
}
