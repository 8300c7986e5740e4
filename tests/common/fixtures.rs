//! Config directory, listing and image fixtures backed by a mock upstream

use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tokio::net::TcpListener;
use url::Url;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Bytes served as a JPEG image
pub const JPEG_BYTES: &[u8] = &[0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, 0x4A, 0x46];

/// A config directory whose upstream, image host and probe target are all local
pub struct TestEnv {
    /// Holds config files, state and the output directory
    pub dir: TempDir,
    /// Serves listings, images and the availability probe
    pub server: MockServer,
    // Keeps the internet probe address accepting connections
    _probe: TcpListener,
}

impl TestEnv {
    /// Start a mock upstream and write config files for `subreddits`
    pub async fn new(subreddits: &[&str], time_limit_secs: u64) -> Self {
        Self::with_handler(subreddits, time_limit_secs, json!({})).await
    }

    /// Like [`TestEnv::new`] with extra `handler_config.json` properties
    pub async fn with_handler(subreddits: &[&str], time_limit_secs: u64, handler: Value) -> Self {
        let dir = tempfile::tempdir().expect("create temp dir");
        let server = MockServer::start().await;
        let probe = TcpListener::bind("127.0.0.1:0").await.expect("bind probe");

        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let general = json!({
            "time_limit": time_limit_secs,
            "network": {
                "internet_probe_addr": probe.local_addr().expect("probe addr").to_string(),
                "internet_poll_interval": 1,
                "upstream_url": format!("{}/", server.uri()),
                "upstream_poll_interval": 1,
                "download_timeout": 2
            }
        });
        let grabber = json!({
            "subreddits": subreddits,
            "post_limit": 100,
            "user_agent": "subreddit-dl-tests",
            "api_base": server.uri(),
            "rate_limit_delay": 0
        });

        let mut handler_config = json!({ "output_directory": dir.path().join("images") });
        if let (Some(target), Some(extra)) = (handler_config.as_object_mut(), handler.as_object()) {
            target.extend(extra.clone());
        }

        write_json(&dir.path().join("general_config.json"), &general);
        write_json(&dir.path().join("grabber_config.json"), &grabber);
        write_json(&dir.path().join("handler_config.json"), &handler_config);

        Self {
            dir,
            server,
            _probe: probe,
        }
    }

    /// The config directory
    pub fn config_dir(&self) -> &Path {
        self.dir.path()
    }

    /// Where the state file lives
    pub fn state_path(&self) -> PathBuf {
        self.dir.path().join("state.json")
    }

    /// Where images are written
    pub fn images_dir(&self) -> PathBuf {
        self.dir.path().join("images")
    }

    /// Overwrite the state file
    pub fn write_state(&self, content: &str) {
        std::fs::write(self.state_path(), content).expect("write state");
    }

    /// URL of an image served by the mock upstream
    pub fn image_url(&self, name: &str) -> String {
        format!("{}/img/{name}.jpg", self.server.uri())
    }

    /// Post JSON created at `created` linking to the mock image `p<created>`
    pub fn post(&self, created: u64, title: &str) -> Value {
        json!({
            "id": format!("p{created}"),
            "created_utc": created as f64,
            "url": self.image_url(&format!("p{created}")),
            "stickied": false,
            "title": title
        })
    }

    /// Serve `posts` as the single page of `subreddit`'s new listing
    pub async fn serve_listing(&self, subreddit: &str, posts: Vec<Value>) {
        let children: Vec<Value> = posts
            .into_iter()
            .map(|data| json!({ "kind": "t3", "data": data }))
            .collect();

        Mock::given(method("GET"))
            .and(path(format!("/r/{subreddit}/new.json")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "kind": "Listing",
                "data": { "after": null, "children": children }
            })))
            .mount(&self.server)
            .await;
    }

    /// Serve a JPEG for post `p<created>`, expecting `hits` requests
    pub async fn serve_image(&self, created: u64, hits: u64) {
        Mock::given(method("GET"))
            .and(path(format!("/img/p{created}.jpg")))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Content-Type", "image/jpeg")
                    .set_body_bytes(JPEG_BYTES),
            )
            .expect(hits)
            .mount(&self.server)
            .await;
    }
}

/// Resolver handler for the mock image host
pub fn direct_link(url: &Url) -> subreddit_dl::Result<String> {
    Ok(url.to_string())
}

/// Default resolver plus the mock image host
pub fn local_resolver() -> subreddit_dl::UrlResolver {
    let mut resolver = subreddit_dl::UrlResolver::default();
    resolver.register("127.0.0.1", direct_link);
    resolver
}

fn write_json(path: &Path, value: &Value) {
    let content = serde_json::to_string_pretty(value).expect("serialize fixture");
    std::fs::write(path, content).expect("write fixture");
}
