//! Image link resolution
//!
//! Maps a post's outbound link to a direct image URL using a per-host handler
//! table. Supported hosts:
//!
//! - `i.redd.it` (link is directly to the image file)
//! - `i.imgur.com` (link is directly to the image file)

use crate::error::{Error, Result};
use std::collections::HashMap;
use url::Url;

/// Computes the direct image URL for a link on one host
pub type HostHandler = fn(&Url) -> Result<String>;

/// Link already points at the image file
fn direct_link(url: &Url) -> Result<String> {
    Ok(url.to_string())
}

/// Resolves post links on supported image hosts to direct image URLs
#[derive(Clone)]
pub struct UrlResolver {
    handlers: HashMap<String, HostHandler>,
}

impl Default for UrlResolver {
    fn default() -> Self {
        let mut resolver = Self::empty();
        resolver.register("i.redd.it", direct_link);
        resolver.register("i.imgur.com", direct_link);
        resolver
    }
}

impl UrlResolver {
    /// Resolver that supports no hosts
    pub fn empty() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Add or replace the handler for `host`
    pub fn register(&mut self, host: &str, handler: HostHandler) {
        self.handlers.insert(host.to_ascii_lowercase(), handler);
    }

    /// Resolve `url` to a direct image URL
    ///
    /// # Errors
    /// Returns [`Error::InvalidUrl`] if the URL cannot be parsed, has no host,
    /// or its host is not supported. Handlers may add their own errors.
    pub fn resolve(&self, url: &str) -> Result<String> {
        let parsed = Url::parse(url).map_err(|e| Error::InvalidUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

        let host = parsed.host_str().ok_or_else(|| Error::InvalidUrl {
            url: url.to_string(),
            reason: "URL does not have a host".to_string(),
        })?;

        let handler = self
            .handlers
            .get(&host.to_ascii_lowercase())
            .ok_or_else(|| Error::InvalidUrl {
                url: url.to_string(),
                reason: format!("host {host} not supported"),
            })?;

        handler(&parsed)
    }

    /// Whether `url` is valid and points at a supported host; never fails
    pub fn is_supported(&self, url: &str) -> bool {
        Url::parse(url)
            .ok()
            .and_then(|parsed| parsed.host_str().map(str::to_ascii_lowercase))
            .is_some_and(|host| self.handlers.contains_key(&host))
    }
}
