//! Cooperative termination with deferrable critical sections
//!
//! A [`Termination`] is shared by the time-limit timer, the signal listener
//! and the pipeline. Requesting termination is coalesced: only the first
//! request counts. While any [`TerminationBlock`] is alive the request is
//! recorded but [`Termination::terminated`] does not resolve, so the pipeline
//! is never dropped between writing an image and persisting its watermark.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Shared termination state; clones refer to the same state
#[derive(Clone, Debug)]
pub struct Termination {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    requested: AtomicBool,
    token: CancellationToken,
    blocks: watch::Sender<usize>,
}

impl Default for Termination {
    fn default() -> Self {
        Self::new()
    }
}

impl Termination {
    /// Create a termination handle with no request and no blocks
    pub fn new() -> Self {
        let (blocks, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                requested: AtomicBool::new(false),
                token: CancellationToken::new(),
                blocks,
            }),
        }
    }

    /// Request termination
    ///
    /// Returns `false` if termination was already requested, in which case
    /// nothing else happens.
    pub fn request(&self, reason: &str) -> bool {
        if self.inner.requested.swap(true, Ordering::SeqCst) {
            info!(reason, "Termination already in progress");
            return false;
        }

        info!(reason, "Termination requested");
        self.inner.token.cancel();
        true
    }

    /// Whether termination has been requested
    pub fn is_requested(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Resolves once termination has been requested, blocked or not
    pub async fn requested(&self) {
        self.inner.token.cancelled().await;
    }

    /// Resolves once termination has been requested and no block is held
    pub async fn terminated(&self) {
        self.inner.token.cancelled().await;

        let mut blocks = self.inner.blocks.subscribe();
        if *blocks.borrow() > 0 {
            debug!("Termination deferred until critical section completes");
        }
        // The sender lives in `inner`, so this only returns once the count hits zero
        let _ = blocks.wait_for(|count| *count == 0).await;
    }

    /// Defer termination until the returned guard is dropped
    pub fn block(&self) -> TerminationBlock {
        self.inner.blocks.send_modify(|count| *count += 1);
        TerminationBlock {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Number of blocks currently held
    pub fn active_blocks(&self) -> usize {
        *self.inner.blocks.borrow()
    }

    /// Request termination once `limit` has elapsed
    ///
    /// Abort the returned handle when the run finishes first.
    pub fn spawn_time_limit(&self, limit: Duration) -> JoinHandle<()> {
        let termination = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(limit).await;
            termination.request("time limit reached");
        })
    }

    /// Translate SIGTERM/SIGINT (Ctrl+C on other platforms) into termination requests
    pub fn spawn_signal_listener(&self) -> JoinHandle<()> {
        let termination = self.clone();
        tokio::spawn(listen_for_signals(termination))
    }
}

/// Keeps termination deferred while alive
#[derive(Debug)]
#[must_use = "termination is only deferred while the block is held"]
pub struct TerminationBlock {
    inner: Arc<Inner>,
}

impl Drop for TerminationBlock {
    fn drop(&mut self) {
        self.inner
            .blocks
            .send_modify(|count| *count = count.saturating_sub(1));
    }
}

/// Drive `future` to completion unless termination takes effect first
///
/// Returns `None` when the future was dropped because of termination. The
/// future is never dropped while it holds a [`TerminationBlock`].
pub async fn run_until_terminated<F, T>(future: F, termination: &Termination) -> Option<T>
where
    F: Future<Output = T>,
{
    tokio::select! {
        biased;
        output = future => Some(output),
        () = termination.terminated() => {
            info!("Terminating before completion");
            None
        }
    }
}

#[cfg(unix)]
async fn listen_for_signals(termination: Termination) {
    use tokio::signal::unix::{SignalKind, signal};

    // Registration may fail in restricted environments (containers, tests)
    let (mut sigterm, mut sigint) =
        match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
            (Err(e), _) | (_, Err(e)) => {
                warn!(error = %e, "Could not register signal handlers, using ctrl_c fallback");
                listen_for_ctrl_c(termination).await;
                return;
            }
        };

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                termination.request("received SIGTERM");
            }
            _ = sigint.recv() => {
                termination.request("received SIGINT (Ctrl+C)");
            }
        }
    }
}

#[cfg(not(unix))]
async fn listen_for_signals(termination: Termination) {
    listen_for_ctrl_c(termination).await;
}

async fn listen_for_ctrl_c(termination: Termination) {
    loop {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                termination.request("received Ctrl+C");
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for Ctrl+C signal");
                return;
            }
        }
    }
}
