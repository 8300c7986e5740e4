use super::*;
use crate::config::{GeneralConfig, GrabberConfig, HandlerConfig, NetworkConfig};
use crate::error::Error;
use crate::filter::PostFilter;
use crate::retry::SkipReason;
use crate::termination::run_until_terminated;
use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;
use url::Url;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const SOURCE: &str = "testsrc";
const JPEG_BYTES: &[u8] = &[0xFF, 0xD8, 0xFF, 0xE0];

struct Fixture {
    dir: TempDir,
    server: MockServer,
    // Keeps the internet probe address accepting connections
    _probe: TcpListener,
    config: Config,
}

impl Fixture {
    async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let server = MockServer::start().await;
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();

        let config = Config {
            general: GeneralConfig {
                time_limit: Duration::from_secs(60),
                network: NetworkConfig {
                    internet_probe_addr: probe.local_addr().unwrap().to_string(),
                    internet_probe_timeout: Duration::from_millis(500),
                    internet_poll_interval: Duration::from_millis(10),
                    upstream_url: format!("{}/", server.uri()),
                    upstream_probe_timeout: Duration::from_secs(2),
                    upstream_poll_interval: Duration::from_millis(10),
                    download_timeout: Duration::from_secs(2),
                },
            },
            grabber: GrabberConfig {
                subreddits: vec![SOURCE.to_string()],
                user_agent: "test".to_string(),
                api_base: Some(server.uri()),
                rate_limit_delay: Duration::ZERO,
                ..Default::default()
            },
            handler: HandlerConfig {
                output_directory: dir.path().join("images"),
                post_filters: HashMap::new(),
                filters: HashMap::new(),
            },
            state_path: dir.path().join("state.json"),
        };

        Self {
            dir,
            server,
            _probe: probe,
            config,
        }
    }

    fn image_url(&self, name: &str) -> String {
        format!("{}/img/{name}.jpg", self.server.uri())
    }

    fn post(&self, created: f64) -> Value {
        json!({
            "id": format!("p{created}"),
            "created_utc": created,
            "url": self.image_url(&created.to_string()),
            "stickied": false,
            "title": "Picture"
        })
    }

    async fn serve_listing(&self, posts: Vec<Value>) {
        let children: Vec<Value> = posts
            .into_iter()
            .map(|data| json!({ "kind": "t3", "data": data }))
            .collect();

        Mock::given(method("GET"))
            .and(path(format!("/r/{SOURCE}/new.json")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "kind": "Listing",
                "data": { "after": null, "children": children }
            })))
            .mount(&self.server)
            .await;
    }

    async fn serve_image(&self, name: &str, content_type: &str, expected_hits: u64) {
        Mock::given(method("GET"))
            .and(path(format!("/img/{name}.jpg")))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Content-Type", content_type)
                    .set_body_bytes(JPEG_BYTES),
            )
            .expect(expected_hits)
            .mount(&self.server)
            .await;
    }

    fn write_state(&self, content: &str) {
        std::fs::write(&self.config.state_path, content).unwrap();
    }

    async fn pipeline(&self) -> Pipeline {
        self.pipeline_with(FilterRegistry::default()).await
    }

    async fn pipeline_with(&self, registry: FilterRegistry) -> Pipeline {
        Pipeline::with_extensions(&self.config, registry, local_resolver(), Termination::new())
            .await
            .unwrap()
    }

    fn saved_files(&self) -> usize {
        std::fs::read_dir(self.dir.path().join("images"))
            .unwrap()
            .count()
    }

    async fn persisted_watermark(&self) -> Option<f64> {
        StateStore::load(self.config.state_path.clone())
            .await
            .unwrap()
            .latest(SOURCE)
    }
}

/// Default resolver plus the mock server's host
fn local_resolver() -> UrlResolver {
    fn direct(url: &Url) -> Result<String> {
        Ok(url.to_string())
    }

    let mut resolver = UrlResolver::default();
    resolver.register("127.0.0.1", direct);
    resolver
}

struct FailingFilter;

#[async_trait]
impl PostFilter for FailingFilter {
    async fn evaluate(&self, _post: &Post, _source: &str) -> Result<bool> {
        Err(Error::Filter {
            name: "boom".to_string(),
            reason: "filter crashed".to_string(),
        })
    }
}

struct RejectAll;

#[async_trait]
impl PostFilter for RejectAll {
    async fn evaluate(&self, _post: &Post, _source: &str) -> Result<bool> {
        Ok(false)
    }
}

#[tokio::test]
async fn only_posts_newer_than_watermark_are_handled() {
    let fx = Fixture::new().await;
    fx.write_state(r#"{ "latestHandledTimes": { "testsrc": 1000 } }"#);
    fx.serve_listing(vec![fx.post(1200.0), fx.post(900.0), fx.post(1100.0), fx.post(1000.0)])
        .await;
    fx.serve_image("900", "image/jpeg", 0).await;
    fx.serve_image("1000", "image/jpeg", 0).await;
    fx.serve_image("1100", "image/jpeg", 1).await;
    fx.serve_image("1200", "image/jpeg", 1).await;

    let summary = fx.pipeline().await.run().await.unwrap();

    assert_eq!(summary.sources, 1);
    assert_eq!(summary.posts_seen, 4);
    assert_eq!(summary.not_eligible, 2);
    assert_eq!(summary.saved, 2);
    assert!(!summary.terminated);
    assert_eq!(fx.saved_files(), 2);
    assert_eq!(fx.persisted_watermark().await, Some(1200.0));
}

#[tokio::test]
async fn rerun_with_unchanged_listing_handles_nothing() {
    let fx = Fixture::new().await;
    fx.serve_listing(vec![fx.post(10.0), fx.post(20.0)]).await;
    fx.serve_image("10", "image/jpeg", 1).await;
    fx.serve_image("20", "image/jpeg", 1).await;

    let first = fx.pipeline().await.run().await.unwrap();
    assert_eq!(first.saved, 2);
    let watermark = fx.persisted_watermark().await;
    assert_eq!(watermark, Some(20.0));

    let second = fx.pipeline().await.run().await.unwrap();
    assert_eq!(second.saved, 0);
    assert_eq!(second.not_eligible, 2);
    assert_eq!(fx.saved_files(), 2);
    assert_eq!(fx.persisted_watermark().await, watermark);
}

#[tokio::test]
async fn sticky_post_never_reaches_downloader() {
    let fx = Fixture::new().await;
    let mut sticky = fx.post(1100.0);
    sticky["stickied"] = json!(true);
    fx.serve_listing(vec![sticky]).await;
    fx.serve_image("1100", "image/jpeg", 0).await;

    let summary = fx.pipeline().await.run().await.unwrap();

    assert_eq!(summary.filtered, 1);
    assert_eq!(fx.saved_files(), 0);
    assert_eq!(fx.persisted_watermark().await, Some(1100.0));
}

#[tokio::test]
async fn unsupported_content_type_is_skipped_and_advances_watermark() {
    let fx = Fixture::new().await;
    fx.serve_listing(vec![fx.post(1100.0)]).await;
    fx.serve_image("1100", "text/html", 1).await;

    let mut pipeline = fx.pipeline().await;
    let post: Post = serde_json::from_value(fx.post(1100.0)).unwrap();
    let outcome = pipeline.handle_post(&post, SOURCE).await.unwrap();

    assert_eq!(
        outcome,
        PostOutcome::Skipped(SkipReason::UnsupportedContentType("text/html".to_string()))
    );
    assert_eq!(fx.saved_files(), 0);
    assert_eq!(pipeline.state().latest(SOURCE), Some(1100.0));
    assert_eq!(fx.persisted_watermark().await, Some(1100.0));
}

#[tokio::test]
async fn source_filter_rejection_advances_watermark() {
    let mut fx = Fixture::new().await;
    fx.config
        .handler
        .post_filters
        .insert(SOURCE.to_string(), "nothing".to_string());
    fx.serve_image("5", "image/jpeg", 0).await;

    let mut registry = FilterRegistry::default();
    registry.register("nothing", RejectAll);
    let mut pipeline = fx.pipeline_with(registry).await;

    let post: Post = serde_json::from_value(fx.post(5.0)).unwrap();
    let outcome = pipeline.handle_post(&post, SOURCE).await.unwrap();

    assert_eq!(
        outcome,
        PostOutcome::Filtered(Rejection::SourceFilter("nothing".to_string()))
    );
    assert_eq!(fx.persisted_watermark().await, Some(5.0));
}

#[tokio::test]
async fn failing_filter_aborts_run_without_advancing_watermark() {
    let mut fx = Fixture::new().await;
    fx.config
        .handler
        .post_filters
        .insert(SOURCE.to_string(), "boom".to_string());
    fx.write_state(r#"{ "latestHandledTimes": { "testsrc": 1000 } }"#);
    fx.serve_listing(vec![fx.post(1100.0), fx.post(1200.0)]).await;
    fx.serve_image("1100", "image/jpeg", 0).await;
    fx.serve_image("1200", "image/jpeg", 0).await;

    let mut registry = FilterRegistry::default();
    registry.register("boom", FailingFilter);

    let err = fx.pipeline_with(registry).await.run().await.unwrap_err();

    assert!(matches!(err, Error::Filter { .. }), "got {err:?}");
    assert_eq!(fx.persisted_watermark().await, Some(1000.0));
    assert_eq!(fx.saved_files(), 0);
}

#[tokio::test]
async fn undated_post_leaves_state_untouched() {
    let fx = Fixture::new().await;
    let mut pipeline = fx.pipeline().await;

    let post = Post {
        id: Some("undated".to_string()),
        url: Some(fx.image_url("undated")),
        ..Default::default()
    };
    let outcome = pipeline.handle_post(&post, SOURCE).await.unwrap();

    assert_eq!(outcome, PostOutcome::NotEligible(Rejection::NoCreationTime));
    assert!(!fx.config.state_path.exists());
}

#[tokio::test]
async fn unknown_filter_name_fails_construction() {
    let mut fx = Fixture::new().await;
    fx.config
        .handler
        .post_filters
        .insert(SOURCE.to_string(), "missing".to_string());

    let result = Pipeline::with_extensions(
        &fx.config,
        FilterRegistry::default(),
        local_resolver(),
        Termination::new(),
    )
    .await;

    assert!(matches!(result, Err(Error::Config { .. })));
}

#[tokio::test]
async fn termination_stops_between_posts() {
    let fx = Fixture::new().await;
    fx.serve_listing(vec![fx.post(1.0), fx.post(2.0)]).await;
    fx.serve_image("1", "image/jpeg", 0).await;
    fx.serve_image("2", "image/jpeg", 0).await;

    let termination = Termination::new();
    let mut pipeline = Pipeline::with_extensions(
        &fx.config,
        FilterRegistry::default(),
        local_resolver(),
        termination.clone(),
    )
    .await
    .unwrap();

    termination.request("test");
    let summary = pipeline.run().await.unwrap();

    assert!(summary.terminated);
    assert_eq!(summary.posts_seen, 0);
    assert_eq!(fx.persisted_watermark().await, None);
}

#[tokio::test]
async fn saved_image_and_watermark_are_written_together() {
    let fx = Fixture::new().await;
    fx.serve_image("3", "image/jpeg", 1).await;

    let termination = Termination::new();
    let mut pipeline = Pipeline::with_extensions(
        &fx.config,
        FilterRegistry::default(),
        local_resolver(),
        termination.clone(),
    )
    .await
    .unwrap();

    let post: Post = serde_json::from_value(fx.post(3.0)).unwrap();
    let outcome = pipeline.handle_post(&post, SOURCE).await.unwrap();

    let PostOutcome::Saved(path) = outcome else {
        panic!("expected saved image, got {outcome:?}");
    };
    assert_eq!(std::fs::read(path).unwrap(), JPEG_BYTES);
    assert_eq!(fx.persisted_watermark().await, Some(3.0));
    assert_eq!(termination.active_blocks(), 0);
}

async fn terminable_pipeline(fx: &Fixture, termination: &Termination) -> Pipeline {
    Pipeline::with_extensions(
        &fx.config,
        FilterRegistry::default(),
        local_resolver(),
        termination.clone(),
    )
    .await
    .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn termination_during_save_still_persists_watermark() {
    let fx = Fixture::new().await;
    Mock::given(method("GET"))
        .and(path("/img/3.jpg"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Content-Type", "image/jpeg")
                .set_body_bytes(vec![0xFF; 4 * 1024 * 1024]),
        )
        .expect(1)
        .mount(&fx.server)
        .await;

    let termination = Termination::new();
    let mut pipeline = terminable_pipeline(&fx, &termination).await;

    // Request termination the moment the image file shows up on disk
    let images = fx.dir.path().join("images");
    let watcher = tokio::spawn({
        let termination = termination.clone();
        async move {
            loop {
                let written = std::fs::read_dir(&images)
                    .map(|mut entries| entries.next().is_some())
                    .unwrap_or(false);
                if written {
                    termination.request("image on disk");
                    return;
                }
                tokio::task::yield_now().await;
            }
        }
    });

    let post: Post = serde_json::from_value(fx.post(3.0)).unwrap();
    let result = run_until_terminated(pipeline.handle_post(&post, SOURCE), &termination).await;
    tokio::time::timeout(Duration::from_secs(5), watcher)
        .await
        .unwrap()
        .unwrap();

    assert!(termination.is_requested());
    if let Some(outcome) = result {
        assert!(matches!(outcome.unwrap(), PostOutcome::Saved(_)));
    }
    assert_eq!(fx.saved_files(), 1);
    assert_eq!(fx.persisted_watermark().await, Some(3.0));
    assert_eq!(termination.active_blocks(), 0);
}

#[tokio::test]
async fn termination_during_download_leaves_no_trace() {
    let fx = Fixture::new().await;
    Mock::given(method("GET"))
        .and(path("/img/4.jpg"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Content-Type", "image/jpeg")
                .set_body_bytes(JPEG_BYTES)
                .set_delay(Duration::from_millis(1500)),
        )
        .mount(&fx.server)
        .await;

    let termination = Termination::new();
    let mut pipeline = terminable_pipeline(&fx, &termination).await;
    let timer = tokio::spawn({
        let termination = termination.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            termination.request("time limit");
        }
    });

    let post: Post = serde_json::from_value(fx.post(4.0)).unwrap();
    let started = std::time::Instant::now();
    let result = run_until_terminated(pipeline.handle_post(&post, SOURCE), &termination).await;
    timer.await.unwrap();

    assert!(result.is_none());
    assert!(started.elapsed() < Duration::from_millis(1500));
    assert_eq!(fx.saved_files(), 0);
    assert_eq!(fx.persisted_watermark().await, None);
}
