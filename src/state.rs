//! Watermark state persistence
//!
//! The state file records, per subreddit, the creation time of the newest post
//! that has been handled. Every update rewrites the whole file atomically
//! (temporary file, fsync, rename, directory fsync) so a crash mid-write
//! leaves either the old or the new contents on disk, never a torn file.

use crate::error::{Result, StateError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Per-subreddit watermarks as stored on disk
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WatermarkState {
    /// Subreddit name -> creation time of the newest handled post
    #[serde(rename = "latestHandledTimes", alias = "latest_handled_times", default)]
    pub latest_handled_times: BTreeMap<String, f64>,
}

impl WatermarkState {
    /// Check stored values; returns one message per problem
    pub fn validate(&self) -> Vec<String> {
        self.latest_handled_times
            .iter()
            .filter(|(_, t)| !t.is_finite() || **t < 0.0)
            .map(|(source, t)| {
                format!("at property /latestHandledTimes/{source}: {t} is not a valid timestamp")
            })
            .collect()
    }

    /// Watermark for `source`, if any post from it was handled
    pub fn get(&self, source: &str) -> Option<f64> {
        self.latest_handled_times.get(source).copied()
    }

    /// Move the watermark for `source` forward to `created`
    ///
    /// Returns `false` and leaves the value untouched when `created` is older
    /// than the current watermark.
    pub fn advance(&mut self, source: &str, created: f64) -> bool {
        match self.latest_handled_times.get(source) {
            Some(current) if created < *current => false,
            _ => {
                self.latest_handled_times.insert(source.to_string(), created);
                true
            }
        }
    }
}

/// Owns the watermark state and its file
#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    state: WatermarkState,
}

impl StateStore {
    /// Load state from `path`; a missing file yields empty state
    ///
    /// # Errors
    /// - [`StateError::Corrupt`] if the file is not valid state JSON
    /// - [`StateError::Invalid`] if it holds unusable timestamps
    /// - [`crate::Error::Io`] if the file exists but cannot be read
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        let state = match tokio::fs::read_to_string(&path).await {
            Ok(content) => {
                let state: WatermarkState =
                    serde_json::from_str(&content).map_err(|source| StateError::Corrupt {
                        path: path.clone(),
                        source,
                    })?;

                let errors = state.validate();
                if !errors.is_empty() {
                    return Err(StateError::Invalid { path, errors }.into());
                }

                info!(
                    path = %path.display(),
                    sources = state.latest_handled_times.len(),
                    "Loaded watermark state"
                );
                state
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "No state file, starting with empty state");
                WatermarkState::default()
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Self { path, state })
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current in-memory state
    pub fn state(&self) -> &WatermarkState {
        &self.state
    }

    /// Watermark for `source`
    pub fn latest(&self, source: &str) -> Option<f64> {
        self.state.get(source)
    }

    /// Advance the watermark for `source` and persist the whole state
    ///
    /// The file is rewritten even when the watermark did not move, so a
    /// successful return always means disk and memory agree.
    ///
    /// # Errors
    /// Returns I/O or serialization errors from the write
    pub async fn record(&mut self, source: &str, created: f64) -> Result<()> {
        if self.state.advance(source, created) {
            debug!(source, created, "Advanced watermark");
        } else {
            warn!(
                source,
                created,
                current = self.state.get(source),
                "Refusing to move watermark backwards"
            );
        }

        self.persist().await
    }

    async fn persist(&self) -> Result<()> {
        let mut buf = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"\t");
        let mut serializer = serde_json::Serializer::with_formatter(&mut buf, formatter);
        self.state.serialize(&mut serializer)?;
        buf.push(b'\n');

        let mut tmp_name = self.path.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp_path = PathBuf::from(tmp_name);

        let mut file = tokio::fs::File::create(&tmp_path).await?;
        file.write_all(&buf).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&tmp_path, &self.path).await?;

        // Directory handles can only be synced on Unix
        #[cfg(unix)]
        {
            let dir = match self.path.parent() {
                Some(dir) if !dir.as_os_str().is_empty() => dir,
                _ => Path::new("."),
            };
            tokio::fs::File::open(dir).await?.sync_all().await?;
        }

        debug!(path = %self.path.display(), "Persisted watermark state");
        Ok(())
    }
}
