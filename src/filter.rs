//! Post filter chain
//!
//! Filters run strictly in order and stop at the first rejection:
//!
//! 1. [`time_filter`]: was the post created after the source's watermark?
//! 2. [`global_filter`]: not pinned, has a link, link host is supported
//! 3. the subreddit's registered [`PostFilter`], if one is configured
//!
//! Only the time filter decides whether the watermark may move; the others
//! merely decide whether the post's image gets downloaded.

use crate::config::PatternFilterConfig;
use crate::error::{Error, Result};
use crate::resolver::UrlResolver;
use crate::types::Post;
use async_trait::async_trait;
use regex::Regex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Why a filter rejected a post
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Rejection {
    /// Post has no creation time
    NoCreationTime,
    /// Post was handled by a previous run
    AlreadyHandled,
    /// Post is pinned
    Stickied,
    /// Post has no outbound link
    NoUrl,
    /// Link host has no resolver
    UnsupportedUrl,
    /// The subreddit's custom filter said no
    SourceFilter(String),
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::NoCreationTime => write!(f, "post has no creation time"),
            Rejection::AlreadyHandled => write!(f, "post handled by previous scrape"),
            Rejection::Stickied => write!(f, "post is a sticky"),
            Rejection::NoUrl => write!(f, "post has no link"),
            Rejection::UnsupportedUrl => write!(f, "post link not supported"),
            Rejection::SourceFilter(name) => write!(f, "rejected by filter {name}"),
        }
    }
}

/// Subreddit-specific post predicate
///
/// Implementations are registered by name in a [`FilterRegistry`] and attached
/// to subreddits through the `post_filters` configuration. Returning an error
/// aborts the run without advancing the watermark for the post.
#[async_trait]
pub trait PostFilter: Send + Sync {
    /// Returns `true` if the post should be handled
    async fn evaluate(&self, post: &Post, source: &str) -> Result<bool>;
}

/// Time filter: returns the post's creation time if it is newer than `latest_handled`
///
/// # Errors
/// - [`Rejection::NoCreationTime`] if the post has no creation time
/// - [`Rejection::AlreadyHandled`] if it is not strictly newer than the watermark
pub fn time_filter(post: &Post, latest_handled: Option<f64>) -> std::result::Result<f64, Rejection> {
    let created = post.created_utc.ok_or(Rejection::NoCreationTime)?;
    match latest_handled {
        Some(latest) if created <= latest => Err(Rejection::AlreadyHandled),
        _ => Ok(created),
    }
}

/// Global filter applied to every subreddit
pub fn global_filter(post: &Post, resolver: &UrlResolver) -> std::result::Result<(), Rejection> {
    if post.is_stickied() {
        return Err(Rejection::Stickied);
    }
    let url = post.url.as_deref().ok_or(Rejection::NoUrl)?;
    if !resolver.is_supported(url) {
        return Err(Rejection::UnsupportedUrl);
    }
    Ok(())
}

/// Title pattern filter built from a [`PatternFilterConfig`]
///
/// Include patterns are OR-matched (at least one must match when any are
/// given); any exclude match rejects.
#[derive(Debug, Clone)]
pub struct PatternFilter {
    include: Vec<Regex>,
    exclude: Vec<Regex>,
    allow_nsfw: bool,
    min_score: Option<i64>,
}

impl PatternFilter {
    /// Compile a filter from configuration
    ///
    /// # Errors
    /// Returns [`Error::Config`] naming the first pattern that does not compile
    pub fn from_config(name: &str, config: &PatternFilterConfig) -> Result<Self> {
        let compile = |kind: &str, patterns: &[String]| -> Result<Vec<Regex>> {
            patterns
                .iter()
                .enumerate()
                .map(|(i, p)| {
                    Regex::new(p)
                        .map_err(|e| Error::config(format!("/filters/{name}/{kind}/{i}"), e.to_string()))
                })
                .collect()
        };

        Ok(Self {
            include: compile("include", &config.include)?,
            exclude: compile("exclude", &config.exclude)?,
            allow_nsfw: config.allow_nsfw,
            min_score: config.min_score,
        })
    }

    fn matches(&self, post: &Post) -> bool {
        if !self.allow_nsfw && post.over_18.unwrap_or(false) {
            debug!(post = post.display_id(), "Post is NSFW");
            return false;
        }

        if let Some(min) = self.min_score
            && post.score.unwrap_or(0) < min
        {
            debug!(post = post.display_id(), min_score = min, "Post score too low");
            return false;
        }

        let title = post.title.as_deref().unwrap_or("");

        if !self.include.is_empty() && !self.include.iter().any(|re| re.is_match(title)) {
            debug!(post = post.display_id(), "No include patterns matched");
            return false;
        }

        if let Some(re) = self.exclude.iter().find(|re| re.is_match(title)) {
            debug!(post = post.display_id(), pattern = re.as_str(), "Matched exclude pattern");
            return false;
        }

        true
    }
}

#[async_trait]
impl PostFilter for PatternFilter {
    async fn evaluate(&self, post: &Post, _source: &str) -> Result<bool> {
        Ok(self.matches(post))
    }
}

/// Named post filters available to subreddits
#[derive(Clone, Default)]
pub struct FilterRegistry {
    filters: HashMap<String, Arc<dyn PostFilter>>,
}

impl FilterRegistry {
    /// Registry containing a [`PatternFilter`] for every configured filter definition
    ///
    /// # Errors
    /// Returns [`Error::Config`] if a pattern does not compile
    pub fn from_config(filters: &HashMap<String, PatternFilterConfig>) -> Result<Self> {
        let mut registry = Self::default();
        for (name, config) in filters {
            registry.register(name, PatternFilter::from_config(name, config)?);
        }
        Ok(registry)
    }

    /// Add or replace a filter under `name`
    pub fn register(&mut self, name: &str, filter: impl PostFilter + 'static) {
        self.filters.insert(name.to_string(), Arc::new(filter));
    }

    /// Look up a filter by name
    pub fn get(&self, name: &str) -> Option<Arc<dyn PostFilter>> {
        self.filters.get(name).cloned()
    }

    /// Whether a filter is registered under `name`
    pub fn contains(&self, name: &str) -> bool {
        self.filters.contains_key(name)
    }
}

/// Global and subreddit filters bound to a resolver and subreddit assignments
#[derive(Clone)]
pub struct FilterChain {
    resolver: Arc<UrlResolver>,
    source_filters: HashMap<String, (String, Arc<dyn PostFilter>)>,
}

impl FilterChain {
    /// Bind subreddits to registered filters
    ///
    /// # Errors
    /// Returns [`Error::Config`] if a subreddit references an unregistered filter
    pub fn new(
        resolver: Arc<UrlResolver>,
        registry: &FilterRegistry,
        assignments: &HashMap<String, String>,
    ) -> Result<Self> {
        let mut source_filters = HashMap::new();
        for (source, name) in assignments {
            let filter = registry.get(name).ok_or_else(|| {
                Error::config(
                    format!("/post_filters/{source}"),
                    format!("filter \"{name}\" is not registered"),
                )
            })?;
            source_filters.insert(source.clone(), (name.clone(), filter));
        }

        Ok(Self {
            resolver,
            source_filters,
        })
    }

    /// The resolver used by the global filter
    pub fn resolver(&self) -> &UrlResolver {
        &self.resolver
    }

    /// Apply the global filter
    pub fn global(&self, post: &Post) -> std::result::Result<(), Rejection> {
        global_filter(post, &self.resolver)
    }

    /// Apply the subreddit's custom filter; subreddits without one always pass
    ///
    /// # Errors
    /// Propagates the custom filter's error
    pub async fn source(&self, post: &Post, source: &str) -> Result<std::result::Result<(), Rejection>> {
        let Some((name, filter)) = self.source_filters.get(source) else {
            return Ok(Ok(()));
        };

        debug!(source, filter = %name, "Running custom filter");
        if filter.evaluate(post, source).await? {
            Ok(Ok(()))
        } else {
            Ok(Err(Rejection::SourceFilter(name.clone())))
        }
    }
}
