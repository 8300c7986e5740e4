//! Image download and storage
//!
//! [`ImageDownloader::download`] wraps a single GET in the post-level retry
//! policy: only a lost local connection is waited out and retried; every other
//! failure is a terminal skip for the post. [`save_image`] writes the bytes
//! under a fresh random name and never overwrites an existing file.

use crate::connectivity::ConnectivityProber;
use crate::error::{Error, Result};
use crate::retry::{Attempt, FailureKind, Resolution, SkipReason, classify, run_until_settled};
use rand::Rng;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Content type -> file extension for savable images
const IMAGE_EXTENSIONS: &[(&str, &str)] = &[("image/jpeg", ".jpg"), ("image/png", ".png")];

/// Downloaded image bytes and the extension matching their content type
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Image {
    /// Raw image bytes
    pub data: Vec<u8>,

    /// File extension including the leading dot (e.g. ".jpg")
    pub extension: &'static str,
}

/// Map a `Content-Type` header value to a file extension
///
/// Parameters such as `; charset=...` are ignored and the comparison is
/// case-insensitive.
pub fn extension_for(content_type: &str) -> Option<&'static str> {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();

    IMAGE_EXTENSIONS
        .iter()
        .find(|(mime, _)| *mime == essence)
        .map(|(_, ext)| *ext)
}

/// Fetches images with content-type validation and connectivity-aware retry
pub struct ImageDownloader {
    /// HTTP client for image requests
    http_client: reqwest::Client,

    /// Used to tell "we are offline" apart from "the image host is down"
    prober: Arc<ConnectivityProber>,
}

impl ImageDownloader {
    /// Create a downloader whose requests time out after `timeout`
    ///
    /// # Errors
    /// Returns error if the HTTP client cannot be created
    pub fn new(prober: Arc<ConnectivityProber>, timeout: Duration, user_agent: &str) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()
            .map_err(|e| Error::Other(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            prober,
        })
    }

    /// Make a single download attempt
    ///
    /// # Errors
    /// - [`Error::Network`] if the request fails or the body cannot be read
    /// - [`Error::HttpStatus`] for non-2xx responses
    /// - [`Error::UnsupportedContentType`] if the content type is not a known image type
    pub async fn fetch(&self, url: &str) -> Result<Image> {
        debug!(url, "Requesting image");

        let response = self.http_client.get(url).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        let extension = extension_for(&content_type).ok_or_else(|| {
            Error::UnsupportedContentType(if content_type.is_empty() {
                "<missing>".to_string()
            } else {
                content_type.clone()
            })
        })?;

        let data = response.bytes().await?.to_vec();
        debug!(url, bytes = data.len(), content_type = %content_type, "Image downloaded");

        Ok(Image { data, extension })
    }

    /// Download an image, retrying only while the local connection is down
    ///
    /// | failure | action |
    /// |---|---|
    /// | unsupported content type | skip |
    /// | timeout / connection error, internet reachable | skip (site unavailable) |
    /// | timeout / connection error, internet unreachable | wait for internet, retry |
    /// | HTTP error status | skip |
    /// | other request failure | skip |
    ///
    /// # Errors
    /// Any failure that is not a request-level condition (e.g. an I/O error)
    /// is returned as-is.
    pub async fn download(&self, url: &str) -> Result<Resolution<Image>> {
        run_until_settled("image download", |_| async move {
            let err = match self.fetch(url).await {
                Ok(image) => return Attempt::Done(image),
                Err(e) => e,
            };

            warn!(url, error = %err, "Image download failed");

            match classify(&err) {
                FailureKind::UnsupportedContent => {
                    let content_type = match err {
                        Error::UnsupportedContentType(ct) => ct,
                        other => other.to_string(),
                    };
                    Attempt::Skip(SkipReason::UnsupportedContentType(content_type))
                }
                FailureKind::Connectivity => {
                    if self.prober.has_internet().await {
                        warn!(url, "Site unavailable");
                        Attempt::Skip(SkipReason::HostUnreachable)
                    } else {
                        self.prober.wait_for_internet().await;
                        Attempt::Retry
                    }
                }
                FailureKind::HttpStatus(status) => Attempt::Skip(SkipReason::HttpStatus(status)),
                FailureKind::Transport => Attempt::Skip(SkipReason::Transport(err.to_string())),
                FailureKind::Internal => Attempt::Fatal(err),
            }
        })
        .await
    }
}

/// Random 128-bit identifier as 32 lowercase hex digits
fn random_file_id() -> String {
    format!("{:032x}", rand::thread_rng().r#gen::<u128>())
}

/// Write `image` to `dir/<random id><extension>`, never overwriting
///
/// # Errors
/// Returns any I/O error other than a name collision
pub async fn save_image(dir: &Path, image: &Image) -> Result<PathBuf> {
    save_image_with(dir, image, random_file_id).await
}

/// Like [`save_image`] with a caller-supplied file id generator
///
/// On a name collision the generator is asked for a new id and the write is
/// retried.
///
/// # Errors
/// Returns any I/O error other than a name collision
pub async fn save_image_with<F>(dir: &Path, image: &Image, mut next_id: F) -> Result<PathBuf>
where
    F: FnMut() -> String,
{
    loop {
        let path = dir.join(format!("{}{}", next_id(), image.extension));
        debug!(path = %path.display(), "Writing image");

        let mut file = match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                warn!(path = %path.display(), "Image file open failed: file already exists");
                info!("Retrying with new filename");
                continue;
            }
            Err(e) => return Err(Error::Io(e)),
        };

        file.write_all(&image.data).await?;
        file.sync_all().await?;

        return Ok(path);
    }
}
