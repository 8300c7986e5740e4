//! Internet reachability and upstream availability probing
//!
//! Retry loops use these probes to decide what to wait for: a dead local
//! connection is waited out with [`ConnectivityProber::wait_for_internet`],
//! an unhealthy upstream with [`ConnectivityProber::wait_for_upstream_available`].
//! Both waits are unbounded; the run's time limit is what ends them.

use crate::config::NetworkConfig;
use crate::error::{Error, Result};
use crate::retry::{FailureKind, classify};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tracing::{debug, info};

/// Probes raw connectivity and upstream service health
pub struct ConnectivityProber {
    /// HTTP client for availability probes
    http_client: reqwest::Client,

    /// Probe targets and intervals
    config: NetworkConfig,
}

impl ConnectivityProber {
    /// Create a prober
    ///
    /// # Errors
    /// Returns error if the HTTP client cannot be created
    pub fn new(config: NetworkConfig, user_agent: &str) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(config.upstream_probe_timeout)
            .user_agent(user_agent)
            .build()
            .map_err(|e| Error::Other(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            config,
        })
    }

    /// Check whether a TCP connection to the probe address can be opened
    ///
    /// Never fails: any connection error or timeout means "no internet".
    pub async fn has_internet(&self) -> bool {
        debug!("Checking for an internet connection");

        let addr = self.config.internet_probe_addr.as_str();
        match timeout(self.config.internet_probe_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(_stream)) => {
                debug!("Internet connection available");
                true
            }
            Ok(Err(e)) => {
                debug!(addr, error = %e, "Internet connection not available");
                false
            }
            Err(_) => {
                debug!(addr, "Internet connection not available: probe timed out");
                false
            }
        }
    }

    /// Check whether the upstream service homepage answers successfully
    ///
    /// Returns `true` for statuses below 400 and `false` for 5xx.
    ///
    /// # Errors
    /// - [`Error::Network`] if the request itself fails (connection, timeout);
    ///   the caller decides what to wait for
    /// - [`Error::HttpStatus`] for 4xx responses, which waiting will not fix
    pub async fn is_upstream_available(&self) -> Result<bool> {
        debug!(url = %self.config.upstream_url, "Checking upstream availability");

        let response = self.http_client.get(&self.config.upstream_url).send().await?;
        let status = response.status().as_u16();

        if status < 400 {
            debug!(status, "Upstream available");
            Ok(true)
        } else if (500..600).contains(&status) {
            debug!(status, "Upstream unavailable");
            Ok(false)
        } else {
            Err(Error::HttpStatus {
                status,
                url: self.config.upstream_url.clone(),
            })
        }
    }

    /// Block until [`has_internet`](Self::has_internet) succeeds, polling at a fixed interval
    pub async fn wait_for_internet(&self) {
        info!("Waiting for an internet connection");

        while !self.has_internet().await {
            debug!(
                interval_secs = self.config.internet_poll_interval.as_secs_f64(),
                "Sleeping before next connectivity check"
            );
            sleep(self.config.internet_poll_interval).await;
        }
    }

    /// Block until the upstream service reports itself available
    ///
    /// If the probe request itself cannot be made, raw connectivity is checked
    /// and waited for first; polling then resumes.
    ///
    /// # Errors
    /// Returns [`Error::HttpStatus`] when upstream answers with a 4xx status,
    /// and any error the probe raises that is not a connectivity failure.
    pub async fn wait_for_upstream_available(&self) -> Result<()> {
        info!("Waiting for upstream to be available");

        loop {
            match self.is_upstream_available().await {
                Ok(true) => return Ok(()),
                Ok(false) => {}
                Err(e) if classify(&e) == FailureKind::Connectivity => {
                    debug!(error = %e, "Upstream availability request failed");
                    if !self.has_internet().await {
                        self.wait_for_internet().await;
                        continue;
                    }
                }
                Err(e) => return Err(e),
            }

            debug!(
                interval_secs = self.config.upstream_poll_interval.as_secs_f64(),
                "Sleeping before next availability check"
            );
            sleep(self.config.upstream_poll_interval).await;
        }
    }
}
