//! Post handling pipeline
//!
//! One run grabs the new posts of every subreddit and handles them one at a
//! time, oldest first:
//!
//! 1. Time filter - posts at or before the subreddit's watermark, or without a
//!    creation time, are not eligible and leave the watermark alone
//! 2. Global and subreddit filters - a rejection still advances the watermark
//! 3. Resolve and download - a terminal download skip still advances the watermark
//! 4. Save the image, then persist the watermark, with termination deferred
//!    across both writes
//!
//! Any error that is not a handled skip aborts the run without advancing the
//! watermark for the failing post.

use crate::config::Config;
use crate::connectivity::ConnectivityProber;
use crate::download::{ImageDownloader, save_image};
use crate::error::Result;
use crate::filter::{FilterChain, FilterRegistry, Rejection, time_filter};
use crate::listing::ListingFetcher;
use crate::resolver::UrlResolver;
use crate::retry::Resolution;
use crate::state::StateStore;
use crate::termination::{Termination, TerminationBlock};
use crate::types::{Post, PostOutcome, RunSummary};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Orchestrates listing, filtering, downloading and watermark persistence
pub struct Pipeline {
    /// Listing retrieval for all subreddits
    fetcher: ListingFetcher,
    /// Global and per-subreddit filters
    filters: FilterChain,
    /// Image download with retry policy
    downloader: ImageDownloader,
    /// Watermark state, exclusively owned by the pipeline
    state: StateStore,
    /// Where images are written
    output_directory: PathBuf,
    /// Checked between posts and used to defer termination while saving
    termination: Termination,
}

impl Pipeline {
    /// Build a pipeline with the configured pattern filters and the default resolver
    ///
    /// # Errors
    /// Returns error if a filter does not compile, the output directory cannot
    /// be created, or the state file cannot be loaded
    pub async fn new(config: &Config, termination: Termination) -> Result<Self> {
        let registry = FilterRegistry::from_config(&config.handler.filters)?;
        Self::with_extensions(config, registry, UrlResolver::default(), termination).await
    }

    /// Build a pipeline with caller-supplied filters and resolver
    ///
    /// # Errors
    /// See [`Pipeline::new`]; additionally fails if a subreddit references a
    /// filter missing from `registry`
    pub async fn with_extensions(
        config: &Config,
        registry: FilterRegistry,
        resolver: UrlResolver,
        termination: Termination,
    ) -> Result<Self> {
        let output_directory = config.handler.output_directory.clone();
        tokio::fs::create_dir_all(&output_directory).await?;

        let network = &config.general.network;
        let prober = Arc::new(ConnectivityProber::new(
            network.clone(),
            &config.grabber.user_agent,
        )?);

        let fetcher = ListingFetcher::new(config.grabber.clone(), Arc::clone(&prober))?;
        let filters = FilterChain::new(
            Arc::new(resolver),
            &registry,
            &config.handler.post_filters,
        )?;
        let downloader = ImageDownloader::new(
            prober,
            network.download_timeout,
            &config.grabber.user_agent,
        )?;
        let state = StateStore::load(config.state_path.clone()).await?;

        Ok(Self {
            fetcher,
            filters,
            downloader,
            state,
            output_directory,
            termination,
        })
    }

    /// Current watermark state
    pub fn state(&self) -> &StateStore {
        &self.state
    }

    /// Grab and handle every new post
    ///
    /// Stops early, without error, when termination is requested between posts.
    ///
    /// # Errors
    /// Returns the first error that is not a handled skip. The watermark of the
    /// post being handled is left unchanged.
    pub async fn run(&mut self) -> Result<RunSummary> {
        info!("Starting scrape");

        let listings = self.fetcher.grab_all().await?;
        let mut summary = RunSummary {
            sources: listings.len(),
            ..Default::default()
        };

        'sources: for listing in &listings {
            info!(source = %listing.source, posts = listing.posts.len(), "Handling posts");

            for post in &listing.posts {
                if self.termination.is_requested() {
                    info!("Termination requested, stopping before next post");
                    summary.terminated = true;
                    break 'sources;
                }

                let outcome = self.handle_post(post, &listing.source).await?;
                summary.record(&outcome);
            }
        }

        info!(
            sources = summary.sources,
            seen = summary.posts_seen,
            saved = summary.saved,
            filtered = summary.filtered,
            skipped = summary.skipped,
            not_eligible = summary.not_eligible,
            terminated = summary.terminated,
            "Scrape finished"
        );
        Ok(summary)
    }

    /// Handle a single post from `source`
    ///
    /// # Errors
    /// Returns filter, resolver, download or state errors; the watermark is
    /// only advanced when this returns `Ok` with an outcome other than
    /// [`PostOutcome::NotEligible`]
    pub async fn handle_post(&mut self, post: &Post, source: &str) -> Result<PostOutcome> {
        let created = match time_filter(post, self.state.latest(source)) {
            Ok(created) => created,
            Err(rejection) => {
                debug!(source, post = post.display_id(), %rejection, "Post not eligible");
                return Ok(PostOutcome::NotEligible(rejection));
            }
        };

        debug!(source, post = post.display_id(), created, "Handling post");

        let (outcome, block) = match self.process_eligible(post, source).await {
            Ok(result) => result,
            Err(e) => {
                warn!(
                    source,
                    post = post.display_id(),
                    error = %e,
                    "Post handling failed, watermark not advanced"
                );
                return Err(e);
            }
        };

        self.state.record(source, created).await?;
        drop(block);

        Ok(outcome)
    }

    /// Filters, resolution, download and save for an eligible post
    ///
    /// When an image was written the returned block is still held; it must be
    /// released only after the watermark is persisted.
    async fn process_eligible(
        &self,
        post: &Post,
        source: &str,
    ) -> Result<(PostOutcome, Option<TerminationBlock>)> {
        if let Err(rejection) = self.filters.global(post) {
            debug!(source, post = post.display_id(), %rejection, "Post filtered");
            return Ok((PostOutcome::Filtered(rejection), None));
        }

        if let Err(rejection) = self.filters.source(post, source).await? {
            debug!(source, post = post.display_id(), %rejection, "Post filtered");
            return Ok((PostOutcome::Filtered(rejection), None));
        }

        let Some(url) = post.url.as_deref() else {
            return Ok((PostOutcome::Filtered(Rejection::NoUrl), None));
        };
        let image_url = self.filters.resolver().resolve(url)?;

        match self.downloader.download(&image_url).await? {
            Resolution::Skipped(reason) => {
                warn!(source, post = post.display_id(), %reason, "Skipping post");
                Ok((PostOutcome::Skipped(reason), None))
            }
            Resolution::Done(image) => {
                let block = self.termination.block();
                let path = save_image(&self.output_directory, &image).await?;
                info!(source, post = post.display_id(), path = %path.display(), "Saved image");
                Ok((PostOutcome::Saved(path), Some(block)))
            }
        }
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;
