//! Configuration types for subreddit-dl
//!
//! A configuration directory holds three JSON files plus the watermark state:
//!
//! - `general_config.json`: run time limit and network tuning
//! - `grabber_config.json`: which subreddits to poll and how
//! - `handler_config.json`: output directory and post filters
//! - `state.json`: watermark state (see [`crate::state`])

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    time::Duration,
};

/// General config file name inside the config directory
pub const GENERAL_CONFIG_FILE: &str = "general_config.json";
/// Grabber config file name inside the config directory
pub const GRABBER_CONFIG_FILE: &str = "grabber_config.json";
/// Handler config file name inside the config directory
pub const HANDLER_CONFIG_FILE: &str = "handler_config.json";
/// Watermark state file name inside the config directory
pub const STATE_FILE: &str = "state.json";

/// Upstream listings never return more than this many posts per page
pub const MAX_PAGE_SIZE: usize = 100;

/// Complete configuration for one run
#[derive(Clone, Debug)]
pub struct Config {
    /// Time limit and network tuning
    pub general: GeneralConfig,

    /// Listing retrieval settings
    pub grabber: GrabberConfig,

    /// Post handling settings
    pub handler: HandlerConfig,

    /// Location of the watermark state file
    pub state_path: PathBuf,
}

/// Contents of `general_config.json`
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GeneralConfig {
    /// Maximum wall-clock run time in seconds before termination is requested
    #[serde(with = "duration_serde")]
    pub time_limit: Duration,

    /// Connectivity probing and timeouts
    #[serde(default)]
    pub network: NetworkConfig,
}

/// Connectivity probe targets, poll intervals and request timeouts
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetworkConfig {
    /// Highly available host:port used to test raw reachability (default: "8.8.8.8:53")
    #[serde(default = "default_internet_probe_addr")]
    pub internet_probe_addr: String,

    /// Connect timeout for the reachability probe (default: 4 seconds)
    #[serde(default = "default_probe_timeout", with = "duration_serde")]
    pub internet_probe_timeout: Duration,

    /// Delay between reachability probes while offline (default: 60 seconds)
    #[serde(default = "default_internet_poll_interval", with = "duration_serde")]
    pub internet_poll_interval: Duration,

    /// Upstream homepage fetched to test service availability (default: "https://www.reddit.com")
    #[serde(default = "default_upstream_url")]
    pub upstream_url: String,

    /// Request timeout for the availability probe (default: 4 seconds)
    #[serde(default = "default_probe_timeout", with = "duration_serde")]
    pub upstream_probe_timeout: Duration,

    /// Delay between availability probes while upstream is down (default: 600 seconds)
    #[serde(default = "default_upstream_poll_interval", with = "duration_serde")]
    pub upstream_poll_interval: Duration,

    /// Request timeout for image downloads (default: 4 seconds)
    #[serde(default = "default_download_timeout", with = "duration_serde")]
    pub download_timeout: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            internet_probe_addr: default_internet_probe_addr(),
            internet_probe_timeout: default_probe_timeout(),
            internet_poll_interval: default_internet_poll_interval(),
            upstream_url: default_upstream_url(),
            upstream_probe_timeout: default_probe_timeout(),
            upstream_poll_interval: default_upstream_poll_interval(),
            download_timeout: default_download_timeout(),
        }
    }
}

/// Contents of `grabber_config.json`
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GrabberConfig {
    /// Subreddits to poll, in processing order
    pub subreddits: Vec<String>,

    /// Maximum number of new posts requested per subreddit (default: 100)
    #[serde(default = "default_post_limit")]
    pub post_limit: usize,

    /// User-Agent sent with every upstream request
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// OAuth application id (application-only auth; requires `client_secret`)
    #[serde(default)]
    pub client_id: Option<String>,

    /// OAuth application secret (requires `client_id`)
    #[serde(default)]
    pub client_secret: Option<String>,

    /// Listing API base URL (default depends on whether credentials are set)
    #[serde(default)]
    pub api_base: Option<String>,

    /// OAuth token endpoint base URL (default: "https://www.reddit.com")
    #[serde(default = "default_auth_base")]
    pub auth_base: String,

    /// Pause between listing pages and between subreddits (default: 2 seconds)
    #[serde(default = "default_rate_limit_delay", with = "duration_serde")]
    pub rate_limit_delay: Duration,

    /// Timeout of each listing and token request (default: 30 seconds)
    #[serde(default = "default_request_timeout", with = "duration_serde")]
    pub request_timeout: Duration,
}

impl GrabberConfig {
    /// Application credentials, when both halves are configured
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (&self.client_id, &self.client_secret) {
            (Some(id), Some(secret)) => Some((id.as_str(), secret.as_str())),
            _ => None,
        }
    }

    /// Listing API base URL without a trailing slash
    pub fn listing_base(&self) -> String {
        let base = match &self.api_base {
            Some(base) => base.as_str(),
            None if self.credentials().is_some() => "https://oauth.reddit.com",
            None => "https://www.reddit.com",
        };
        base.trim_end_matches('/').to_string()
    }
}

impl Default for GrabberConfig {
    fn default() -> Self {
        Self {
            subreddits: Vec::new(),
            post_limit: default_post_limit(),
            user_agent: default_user_agent(),
            client_id: None,
            client_secret: None,
            api_base: None,
            auth_base: default_auth_base(),
            rate_limit_delay: default_rate_limit_delay(),
            request_timeout: default_request_timeout(),
        }
    }
}

/// Contents of `handler_config.json`
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HandlerConfig {
    /// Directory images are written into
    pub output_directory: PathBuf,

    /// Subreddit name -> registered post filter name
    #[serde(default)]
    pub post_filters: HashMap<String, String>,

    /// Filter name -> declarative pattern filter
    #[serde(default)]
    pub filters: HashMap<String, PatternFilterConfig>,
}

/// Declarative post filter matched against post titles
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PatternFilterConfig {
    /// Title patterns to include (regex, at least one must match when non-empty)
    #[serde(default)]
    pub include: Vec<String>,

    /// Title patterns to exclude (regex, any match rejects)
    #[serde(default)]
    pub exclude: Vec<String>,

    /// Accept posts flagged NSFW (default: true)
    #[serde(default = "default_true")]
    pub allow_nsfw: bool,

    /// Reject posts scoring below this value
    #[serde(default)]
    pub min_score: Option<i64>,
}

impl Default for PatternFilterConfig {
    fn default() -> Self {
        Self {
            include: Vec::new(),
            exclude: Vec::new(),
            allow_nsfw: true,
            min_score: None,
        }
    }
}

impl Config {
    /// Load and validate every config file in `dir`
    ///
    /// Each file is parsed strictly (unknown properties are rejected) and the
    /// combined configuration is then checked with [`Config::validate`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when a file is missing, malformed, or fails
    /// validation. For validation failures the message lists every violation.
    pub fn load_dir(dir: &Path) -> Result<Self> {
        tracing::info!(dir = %dir.display(), "Loading configuration from files");

        let config = Self {
            general: load_json(&dir.join(GENERAL_CONFIG_FILE))?,
            grabber: load_json(&dir.join(GRABBER_CONFIG_FILE))?,
            handler: load_json(&dir.join(HANDLER_CONFIG_FILE))?,
            state_path: dir.join(STATE_FILE),
        };

        let errors = config.validate();
        if !errors.is_empty() {
            for e in &errors {
                tracing::error!("{e}");
            }
            return Err(Error::Config {
                message: errors.join("; "),
                key: None,
            });
        }

        Ok(config)
    }

    /// Check semantic constraints that the file structure alone cannot express
    ///
    /// Returns one message per violation (empty when valid), formatted as
    /// `at property /<path>: <message>`.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        let mut push = |path: &str, message: &str| {
            errors.push(format!("JSON not valid: at property {path}: {message}"));
        };

        if self.general.time_limit.is_zero() {
            push("/time_limit", "must be greater than 0");
        }
        if self.general.network.internet_probe_addr.trim().is_empty() {
            push("/network/internet_probe_addr", "must not be empty");
        }
        if url::Url::parse(&self.general.network.upstream_url).is_err() {
            push("/network/upstream_url", "must be an absolute URL");
        }

        if self.grabber.subreddits.is_empty() {
            push("/subreddits", "must contain at least one subreddit");
        }
        for (i, name) in self.grabber.subreddits.iter().enumerate() {
            if name.trim().is_empty() || name.contains('/') {
                push(&format!("/subreddits/{i}"), "is not a valid subreddit name");
            }
        }
        if self.grabber.post_limit == 0 {
            push("/post_limit", "must be at least 1");
        }
        if self.grabber.user_agent.trim().is_empty() {
            push("/user_agent", "must not be empty");
        }
        if self.grabber.client_id.is_some() != self.grabber.client_secret.is_some() {
            push(
                "/client_id",
                "client_id and client_secret must be set together",
            );
        }

        if self.handler.output_directory.as_os_str().is_empty() {
            push("/output_directory", "must not be empty");
        }
        for (source, filter) in &self.handler.post_filters {
            if filter.trim().is_empty() {
                push(&format!("/post_filters/{source}"), "must name a filter");
            }
        }
        for (name, filter) in &self.handler.filters {
            for (kind, patterns) in [("include", &filter.include), ("exclude", &filter.exclude)] {
                for (i, pattern) in patterns.iter().enumerate() {
                    if let Err(e) = regex::Regex::new(pattern) {
                        push(&format!("/filters/{name}/{kind}/{i}"), &e.to_string());
                    }
                }
            }
        }

        errors
    }
}

/// Reads and parses a JSON file into `T`
fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let key = path.display().to_string();
    let content = std::fs::read_to_string(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::config(key.clone(), "configuration file not found")
        } else {
            Error::config(key.clone(), format!("failed to read: {e}"))
        }
    })?;

    serde_json::from_str(&content)
        .map_err(|e| Error::config(key, format!("JSON decode failed: {e}")))
}

fn default_true() -> bool {
    true
}

fn default_internet_probe_addr() -> String {
    "8.8.8.8:53".to_string()
}

fn default_probe_timeout() -> Duration {
    Duration::from_secs(4)
}

fn default_internet_poll_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_upstream_url() -> String {
    "https://www.reddit.com".to_string()
}

fn default_upstream_poll_interval() -> Duration {
    Duration::from_secs(600)
}

fn default_download_timeout() -> Duration {
    Duration::from_secs(4)
}

fn default_post_limit() -> usize {
    100
}

fn default_user_agent() -> String {
    concat!("subreddit-dl/", env!("CARGO_PKG_VERSION")).to_string()
}

fn default_auth_base() -> String {
    "https://www.reddit.com".to_string()
}

fn default_rate_limit_delay() -> Duration {
    Duration::from_secs(2)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

// Duration serialization helper (whole seconds)
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
