//! Shared fixtures for integration tests: a range-serving mock responder and
//! a session context over a temp directory.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use streamdl_core::download::{
    CheckpointStore, DownloadConfig, FsSink, HttpClient, MemoryCheckpointStore, NoopProgressSink,
    RetryPolicy, SessionContext,
};
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

/// Serves `body` honouring single `Range: bytes=a-b` / `bytes=a-` requests.
pub struct RangeResponder {
    body: Vec<u8>,
    delay: Duration,
}

impl RangeResponder {
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            body,
            delay: Duration::ZERO,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

impl Respond for RangeResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let len = self.body.len() as u64;
        let range = request
            .headers
            .get("range")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| parse_range(value, len));

        let template = match range {
            Some((first, _)) if first >= len => ResponseTemplate::new(416)
                .insert_header("content-range", format!("bytes */{len}").as_str()),
            Some((first, last)) => {
                let last = last.min(len - 1);
                let slice = self.body[first as usize..=last as usize].to_vec();
                ResponseTemplate::new(206)
                    .insert_header(
                        "content-range",
                        format!("bytes {first}-{last}/{len}").as_str(),
                    )
                    .set_body_bytes(slice)
            }
            None => ResponseTemplate::new(200).set_body_bytes(self.body.clone()),
        };
        template.set_delay(self.delay)
    }
}

fn parse_range(value: &str, len: u64) -> Option<(u64, u64)> {
    let bounds = value.trim().strip_prefix("bytes=")?;
    let (first, last) = bounds.split_once('-')?;
    let first = first.trim().parse::<u64>().ok()?;
    let last = if last.trim().is_empty() {
        len.saturating_sub(1)
    } else {
        last.trim().parse::<u64>().ok()?
    };
    Some((first, last))
}

/// Deterministic, non-repeating-looking test payload.
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

/// Mounts a ranged file at `route`. HEAD is refused so the probe verifies
/// range support with a ranged GET.
pub async fn mount_ranged_file(server: &MockServer, route: &str, body: Vec<u8>) {
    Mock::given(method("HEAD"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(405))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(RangeResponder::new(body))
        .mount(server)
        .await;
}

/// Small chunks and quick retries so tests exercise several workers.
pub fn test_config() -> DownloadConfig {
    let mut config = DownloadConfig::default().with_chunk_size(2_000);
    config.connections = 4;
    config.retry = RetryPolicy::fixed(2, Duration::from_millis(10));
    config.segment_retry = RetryPolicy::fixed(2, Duration::from_millis(10));
    config.progress_interval = Duration::from_millis(50);
    config.watchdog_interval = Duration::from_millis(200);
    config
}

/// Session collaborators writing under a fresh temp directory.
pub struct Fixture {
    pub dir: TempDir,
    pub checkpoints: Arc<MemoryCheckpointStore>,
    pub ctx: SessionContext,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("failed to create temp dir");
        let checkpoints = Arc::new(MemoryCheckpointStore::new());
        let ctx = SessionContext {
            http: Arc::new(HttpClient::new().expect("http client")),
            sink: Arc::new(FsSink::new(dir.path())),
            checkpoints: Arc::clone(&checkpoints) as Arc<dyn CheckpointStore>,
            progress: Arc::new(NoopProgressSink),
        };
        Self {
            dir,
            checkpoints,
            ctx,
        }
    }

    pub fn read(&self, name: &str) -> Option<Vec<u8>> {
        std::fs::read(self.dir.path().join(name)).ok()
    }
}
