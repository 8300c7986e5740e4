//! subreddit-dl command line entry point
//!
//! # Usage
//!
//! ```bash
//! subreddit-dl /etc/subreddit-dl /var/log/subreddit-dl.log
//! ```
//!
//! Exit codes: 0 on completion or termination, 1 when configuration, state or
//! log file cannot be loaded, 2 for invalid arguments, 3 when the run is
//! aborted by an unhandled error.

use clap::Parser;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Mutex;
use std::time::Duration;
use subreddit_dl::{Config, Pipeline, Termination, run_until_terminated};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Exit code for configuration, state and log file failures at startup
const EXIT_STARTUP_FAILURE: u8 = 1;
/// Exit code for a run aborted by an unhandled error
const EXIT_RUN_FAILURE: u8 = 3;

/// Save new images posted to subreddits
#[derive(Parser, Debug)]
#[command(name = "subreddit-dl")]
#[command(about = "Time-boxed grabber for new subreddit image posts")]
#[command(version)]
struct Args {
    /// Directory holding general_config.json, grabber_config.json,
    /// handler_config.json and state.json
    config_dir: PathBuf,

    /// Log file, truncated on start
    log_file: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    if let Err(e) = init_logging(&args.log_file) {
        eprintln!("Failed to open log file {}: {e}", args.log_file.display());
        return ExitCode::from(EXIT_STARTUP_FAILURE);
    }

    info!(version = env!("CARGO_PKG_VERSION"), "Starting subreddit-dl");
    let code = run(&args).await;
    info!("Exiting");
    code
}

fn init_logging(log_file: &Path) -> std::io::Result<()> {
    let file = std::fs::File::create(log_file)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
        )
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .with_file(true)
        .with_line_number(true)
        .init();

    Ok(())
}

async fn run(args: &Args) -> ExitCode {
    let config = match Config::load_dir(&args.config_dir) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            return ExitCode::from(EXIT_STARTUP_FAILURE);
        }
    };

    let termination = Termination::new();
    let signals = termination.spawn_signal_listener();

    let limit = config.general.time_limit;
    info!(
        "Scrape is limited to {} seconds ({})",
        limit.as_secs(),
        deadline(limit)
    );
    let timer = termination.spawn_time_limit(limit);

    let code = match Pipeline::new(&config, termination.clone()).await {
        Ok(mut pipeline) => match run_until_terminated(pipeline.run(), &termination).await {
            Some(Ok(_summary)) => ExitCode::SUCCESS,
            Some(Err(e)) => {
                error!(error = %error_chain(&e), "Unhandled error, aborting scrape");
                ExitCode::from(EXIT_RUN_FAILURE)
            }
            None => ExitCode::SUCCESS,
        },
        Err(e) => {
            error!(error = %error_chain(&e), "Failed to start scrape");
            ExitCode::from(EXIT_STARTUP_FAILURE)
        }
    };

    timer.abort();
    signals.abort();
    code
}

/// Local wall-clock time at which the time limit expires
fn deadline(limit: Duration) -> String {
    i64::try_from(limit.as_secs())
        .ok()
        .and_then(chrono::TimeDelta::try_seconds)
        .and_then(|delta| chrono::Local::now().checked_add_signed(delta))
        .map(|at| at.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "never".to_string())
}

/// Error message followed by every source, outermost first
fn error_chain(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
