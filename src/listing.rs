//! Subreddit listing retrieval
//!
//! Fetches the newest posts of every configured subreddit, following the
//! listing cursor page by page. Retryable failures (lost connection, 500/503/504)
//! are waited out and the whole listing is requested again from scratch; any
//! other HTTP error abandons the subreddit for this run.
//!
//! Upstream does not promise any particular order, so every returned list is
//! sorted oldest first. The time filter relies on that order.

use crate::config::{GrabberConfig, MAX_PAGE_SIZE};
use crate::connectivity::ConnectivityProber;
use crate::error::{Error, Result};
use crate::retry::{
    Attempt, FailureKind, RETRYABLE_LISTING_STATUSES, Resolution, SkipReason, classify,
    run_until_settled,
};
use crate::types::{Listing, Post, SourceListing, sort_by_creation};
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Refresh OAuth tokens this long before they expire
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// Response of the application-only token endpoint
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    refresh_at: Instant,
}

/// Retrieves new-post listings for the configured subreddits
pub struct ListingFetcher {
    /// HTTP client for listing and token requests
    http_client: reqwest::Client,

    /// Subreddits, limits and credentials
    config: GrabberConfig,

    /// Decides what to wait for after a failed request
    prober: Arc<ConnectivityProber>,

    /// Application-only OAuth token, when credentials are configured
    token: Mutex<Option<CachedToken>>,
}

impl ListingFetcher {
    /// Create a fetcher
    ///
    /// # Errors
    /// Returns error if the HTTP client cannot be created
    pub fn new(config: GrabberConfig, prober: Arc<ConnectivityProber>) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .user_agent(&config.user_agent)
            .build()
            .map_err(|e| Error::Other(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            config,
            prober,
            token: Mutex::new(None),
        })
    }

    /// Fetch listings for every configured subreddit, in configuration order
    ///
    /// Abandoned subreddits yield an empty post list.
    ///
    /// # Errors
    /// Returns errors that no amount of waiting can fix (e.g. the availability
    /// probe answering 4xx, or a malformed token response)
    pub async fn grab_all(&self) -> Result<Vec<SourceListing>> {
        let mut listings = Vec::with_capacity(self.config.subreddits.len());

        for (i, source) in self.config.subreddits.iter().enumerate() {
            if i > 0 {
                sleep(self.config.rate_limit_delay).await;
            }

            let posts = self.grab(source).await?;
            info!(source = %source, posts = posts.len(), "Grabbed posts");
            listings.push(SourceListing {
                source: source.clone(),
                posts,
            });
        }

        Ok(listings)
    }

    /// Fetch the newest posts of one subreddit, sorted oldest first
    ///
    /// # Errors
    /// See [`grab_all`](Self::grab_all)
    pub async fn grab(&self, source: &str) -> Result<Vec<Post>> {
        info!(source, limit = self.config.post_limit, "Grabbing new posts");

        let resolution = run_until_settled("listing", |_| async move {
            match self.fetch_posts(source).await {
                Ok(posts) => Attempt::Done(posts),
                Err(e) => self.recover(source, e).await,
            }
        })
        .await?;

        match resolution {
            Resolution::Done(mut posts) => {
                sort_by_creation(&mut posts);
                Ok(posts)
            }
            Resolution::Skipped(reason) => {
                warn!(source, %reason, "Abandoning subreddit for this run");
                Ok(Vec::new())
            }
        }
    }

    /// Decide what a failed listing attempt means
    async fn recover(&self, source: &str, err: Error) -> Attempt<Vec<Post>> {
        warn!(source, error = %err, "Listing request failed");

        match classify(&err) {
            FailureKind::Connectivity => {
                if self.prober.has_internet().await {
                    self.wait_for_upstream().await
                } else {
                    self.prober.wait_for_internet().await;
                    Attempt::Retry
                }
            }
            FailureKind::HttpStatus(status) => {
                if status == 401 {
                    self.token.lock().await.take();
                }
                if RETRYABLE_LISTING_STATUSES.contains(&status) {
                    self.wait_for_upstream().await
                } else {
                    Attempt::Skip(SkipReason::HttpStatus(status))
                }
            }
            FailureKind::Transport => Attempt::Skip(SkipReason::Transport(err.to_string())),
            FailureKind::UnsupportedContent | FailureKind::Internal => Attempt::Fatal(err),
        }
    }

    async fn wait_for_upstream(&self) -> Attempt<Vec<Post>> {
        match self.prober.wait_for_upstream_available().await {
            Ok(()) => Attempt::Retry,
            Err(e) => Attempt::Fatal(e),
        }
    }

    /// One complete attempt: every page up to the post limit
    async fn fetch_posts(&self, source: &str) -> Result<Vec<Post>> {
        let limit = self.config.post_limit;
        let mut posts: Vec<Post> = Vec::new();
        let mut after: Option<String> = None;
        let mut page = 0u32;

        while posts.len() < limit {
            if page > 0 {
                sleep(self.config.rate_limit_delay).await;
            }

            let page_size = (limit - posts.len()).min(MAX_PAGE_SIZE);
            let listing = self.fetch_page(source, page_size, after.as_deref()).await?;
            page += 1;

            let received = listing.data.children.len();
            let before = posts.len();
            posts.extend(
                listing
                    .data
                    .children
                    .into_iter()
                    .filter(|thing| thing.kind == "t3")
                    .map(|thing| thing.data),
            );
            debug!(source, page, received, total = posts.len(), "Fetched listing page");

            // A page without posts ends the listing even if it carries a cursor.
            after = listing.data.after;
            if posts.len() == before || after.is_none() {
                break;
            }
        }

        posts.truncate(limit);
        Ok(posts)
    }

    async fn fetch_page(&self, source: &str, limit: usize, after: Option<&str>) -> Result<Listing> {
        let url = format!(
            "{}/r/{}/new.json",
            self.config.listing_base(),
            urlencoding::encode(source)
        );

        let mut query = vec![("limit", limit.to_string()), ("raw_json", "1".to_string())];
        if let Some(after) = after {
            query.push(("after", after.to_string()));
        }

        let mut request = self.http_client.get(&url).query(&query);
        if self.config.credentials().is_some() {
            request = request.bearer_auth(self.access_token().await?);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::HttpStatus {
                status: status.as_u16(),
                url,
            });
        }

        Ok(response.json::<Listing>().await?)
    }

    /// Cached application-only token, fetching a new one when needed
    async fn access_token(&self) -> Result<String> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref()
            && Instant::now() < token.refresh_at
        {
            return Ok(token.token.clone());
        }

        let (client_id, client_secret) = self
            .config
            .credentials()
            .ok_or_else(|| Error::Auth("no client credentials configured".to_string()))?;

        let url = format!(
            "{}/api/v1/access_token",
            self.config.auth_base.trim_end_matches('/')
        );
        debug!(url = %url, "Requesting access token");

        let response = self
            .http_client
            .post(&url)
            .basic_auth(client_id, Some(client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::HttpStatus {
                status: status.as_u16(),
                url,
            });
        }

        let body: TokenResponse = response.json().await?;
        let token = match (body.access_token, body.error) {
            (Some(token), _) if !token.is_empty() => token,
            (_, Some(error)) => return Err(Error::Auth(format!("token request rejected: {error}"))),
            _ => return Err(Error::Auth("token response has no access_token".to_string())),
        };

        let lifetime = Duration::from_secs(body.expires_in.unwrap_or(3600));
        info!(expires_in_secs = lifetime.as_secs(), "Obtained access token");

        *cached = Some(CachedToken {
            token: token.clone(),
            refresh_at: Instant::now() + lifetime.saturating_sub(TOKEN_EXPIRY_MARGIN),
        });
        Ok(token)
    }
}
