//! # subreddit-dl
//!
//! Time-boxed batch scraper that saves new images posted to subreddits.
//!
//! ## Design Philosophy
//!
//! subreddit-dl is designed to be:
//! - **Crash-safe** - the per-subreddit watermark only moves once a post is
//!   fully handled, and never between writing an image and persisting state
//! - **Patient** - lost connections and upstream outages are waited out rather
//!   than counted against a retry budget; the run's time limit bounds them
//! - **Sequential** - one post at a time, oldest first
//! - **Extensible** - subreddit filters and image hosts can be registered in code
//!
//! ## Quick Start
//!
//! ```no_run
//! use subreddit_dl::{Config, Termination, scrape};
//! use std::path::Path;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::load_dir(Path::new("config"))?;
//!     let termination = Termination::new();
//!     let _signals = termination.spawn_signal_listener();
//!
//!     match scrape(&config, termination).await? {
//!         Some(summary) => println!("Saved {} images", summary.saved),
//!         None => println!("Terminated"),
//!     }
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Configuration types
pub mod config;
/// Internet and upstream availability probing
pub mod connectivity;
/// Image download and storage
pub mod download;
/// Error types
pub mod error;
/// Post filter chain and custom filter registry
pub mod filter;
/// Subreddit listing retrieval
pub mod listing;
/// Post handling pipeline
pub mod pipeline;
/// Image link resolution
pub mod resolver;
/// Retry loops driven by explicit attempt outcomes
pub mod retry;
/// Watermark state persistence
pub mod state;
/// Time limit, signals and deferred termination
pub mod termination;
/// Core types
pub mod types;

// Re-export commonly used types
pub use config::{Config, GeneralConfig, GrabberConfig, HandlerConfig, NetworkConfig};
pub use error::{Error, Result, StateError};
pub use filter::{FilterRegistry, PatternFilter, PostFilter, Rejection};
pub use pipeline::Pipeline;
pub use resolver::UrlResolver;
pub use retry::SkipReason;
pub use state::{StateStore, WatermarkState};
pub use termination::{Termination, TerminationBlock, run_until_terminated};
pub use types::{Post, PostOutcome, RunSummary};

/// Run one time-limited scrape with the configured filters
///
/// Starts the time-limit timer, builds a [`Pipeline`] and runs it until it
/// finishes or termination takes effect. Returns `None` when the run was cut
/// short by termination outside a critical section.
///
/// # Example
///
/// ```no_run
/// use subreddit_dl::{Config, Termination, scrape};
/// use std::path::Path;
///
/// # async fn example() -> subreddit_dl::Result<()> {
/// let config = Config::load_dir(Path::new("config"))?;
/// let summary = scrape(&config, Termination::new()).await?;
/// # Ok(())
/// # }
/// ```
///
/// # Errors
/// Returns pipeline construction errors and the first unhandled error of the run
pub async fn scrape(config: &Config, termination: Termination) -> Result<Option<RunSummary>> {
    let timer = termination.spawn_time_limit(config.general.time_limit);

    let result = run_until_terminated(
        async {
            let mut pipeline = Pipeline::new(config, termination.clone()).await?;
            pipeline.run().await
        },
        &termination,
    )
    .await;

    timer.abort();
    result.transpose()
}
