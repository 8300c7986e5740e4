//! Retry loops driven by explicit attempt outcomes
//!
//! Network-facing operations never retry on a timer of their own. Instead each
//! attempt inspects its failure, does whatever waiting the failure calls for
//! (usually via [`crate::connectivity::ConnectivityProber`]), and reports one
//! of the [`Attempt`] variants. [`run_until_settled`] keeps calling the body
//! until it settles on a result, a terminal skip, or a fatal error.
//!
//! # Example
//!
//! ```no_run
//! use subreddit_dl::retry::{Attempt, Resolution, SkipReason, run_until_settled};
//!
//! # async fn example() -> subreddit_dl::Result<()> {
//! let result = run_until_settled("example", |attempt| async move {
//!     if attempt < 2 { Attempt::Retry } else { Attempt::Done(42) }
//! })
//! .await?;
//! assert_eq!(result, Resolution::Done(42));
//! # Ok(())
//! # }
//! ```

use crate::error::Error;
use std::fmt;
use std::future::Future;

/// HTTP statuses worth waiting out when fetching listings
/// (internal server error, service unavailable, gateway timeout)
pub const RETRYABLE_LISTING_STATUSES: [u16; 3] = [500, 503, 504];

/// How a failure should be treated by a retry loop
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureKind {
    /// Connection could not be made or timed out; maybe we are offline
    Connectivity,
    /// Server answered with an unsuccessful status
    HttpStatus(u16),
    /// Response is not an image type we can save
    UnsupportedContent,
    /// Any other request-level failure (redirect loop, body decode, ...)
    Transport,
    /// Not a network condition at all; nothing a retry loop can act on
    Internal,
}

/// Classify an error for retry decisions
pub fn classify(err: &Error) -> FailureKind {
    match err {
        Error::Network(e) => {
            if e.is_timeout() || e.is_connect() {
                FailureKind::Connectivity
            } else if let Some(status) = e.status() {
                FailureKind::HttpStatus(status.as_u16())
            } else {
                FailureKind::Transport
            }
        }
        Error::Io(e) => match e.kind() {
            std::io::ErrorKind::TimedOut
            | std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::NotConnected => FailureKind::Connectivity,
            _ => FailureKind::Internal,
        },
        Error::HttpStatus { status, .. } => FailureKind::HttpStatus(*status),
        Error::UnsupportedContentType(_) => FailureKind::UnsupportedContent,
        Error::Config { .. }
        | Error::Serialization(_)
        | Error::InvalidUrl { .. }
        | Error::State(_)
        | Error::Filter { .. }
        | Error::Auth(_)
        | Error::Other(_) => FailureKind::Internal,
    }
}

/// Why a post or source was given up on without failing the run
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SkipReason {
    /// Content type has no known image extension
    UnsupportedContentType(String),
    /// Our connection works but the remote host could not be reached
    HostUnreachable,
    /// Server answered with a status that is not worth retrying
    HttpStatus(u16),
    /// Request failed in some other way that is not worth retrying
    Transport(String),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::UnsupportedContentType(ct) => write!(f, "unsupported content type {ct}"),
            SkipReason::HostUnreachable => write!(f, "site unavailable"),
            SkipReason::HttpStatus(status) => write!(f, "HTTP status {status}"),
            SkipReason::Transport(msg) => write!(f, "request failed: {msg}"),
        }
    }
}

/// Outcome of one attempt inside a retry loop
#[derive(Debug)]
pub enum Attempt<T> {
    /// Operation succeeded
    Done(T),
    /// Conditions were waited out; try again from scratch
    Retry,
    /// Give up without failing the run
    Skip(SkipReason),
    /// Give up and fail the run
    Fatal(Error),
}

/// Settled result of a retry loop
#[derive(Debug, PartialEq)]
pub enum Resolution<T> {
    /// Operation succeeded
    Done(T),
    /// Operation was abandoned for the given reason
    Skipped(SkipReason),
}

/// Call `body` until it returns anything other than [`Attempt::Retry`]
///
/// The attempt number (starting at 0) is passed to the body. There is no
/// attempt cap: loops are bounded by the run's time limit.
///
/// # Errors
///
/// Returns the error carried by [`Attempt::Fatal`].
pub async fn run_until_settled<T, F, Fut>(operation: &str, mut body: F) -> crate::Result<Resolution<T>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Attempt<T>>,
{
    let mut attempt = 0u32;

    loop {
        match body(attempt).await {
            Attempt::Done(value) => {
                if attempt > 0 {
                    tracing::info!(operation, attempts = attempt + 1, "Operation succeeded after retry");
                }
                return Ok(Resolution::Done(value));
            }
            Attempt::Retry => {
                attempt += 1;
                tracing::debug!(operation, attempt, "Retrying operation");
            }
            Attempt::Skip(reason) => {
                tracing::debug!(operation, %reason, "Operation abandoned");
                return Ok(Resolution::Skipped(reason));
            }
            Attempt::Fatal(e) => {
                tracing::error!(operation, error = %e, "Operation failed with non-recoverable error");
                return Err(e);
            }
        }
    }
}
