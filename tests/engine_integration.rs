//! Integration tests for the download manager: mirror fallback, the global
//! concurrency cap and checkpoint persistence.

mod support;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, HeaderMap, HeaderValue};
use streamdl_core::Database;
use streamdl_core::download::{
    ByteRange, CheckpointStore, DownloadConfig, DownloadError, DownloadJob, DownloadManager,
    DownloadRequest, DownloadState, DownloadStatus, HttpClient, HttpResponse, HttpTransport,
    MemoryCheckpointStore, MemorySink, NoopProgressSink, ProgressSink, ProgressUpdate,
    SqliteCheckpointStore,
};
use support::{mount_ranged_file, payload, test_config};
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// In-memory transport that records how many requests overlap.
struct CountingTransport {
    body: Bytes,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl CountingTransport {
    fn new(len: usize) -> Self {
        Self {
            body: Bytes::from(payload(len)),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    async fn occupy(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(40)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl HttpTransport for CountingTransport {
    async fn get(
        &self,
        _url: &str,
        _headers: &BTreeMap<String, String>,
        _referer: Option<&str>,
        range: Option<ByteRange>,
    ) -> Result<HttpResponse, DownloadError> {
        self.occupy().await;
        let len = self.body.len() as u64;
        let mut headers = HeaderMap::new();
        match range {
            Some(range) => {
                let last = range.last.unwrap_or(len - 1).min(len - 1);
                headers.insert(
                    CONTENT_RANGE,
                    HeaderValue::from_str(&format!("bytes {}-{last}/{len}", range.first)).unwrap(),
                );
                let slice = self.body.slice(range.first as usize..=last as usize);
                Ok(HttpResponse::from_parts(206, headers, vec![slice]))
            }
            None => Ok(HttpResponse::from_parts(200, headers, vec![self.body.clone()])),
        }
    }

    async fn head(
        &self,
        _url: &str,
        _headers: &BTreeMap<String, String>,
        _referer: Option<&str>,
    ) -> Result<HttpResponse, DownloadError> {
        self.occupy().await;
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_LENGTH, HeaderValue::from(self.body.len() as u64));
        headers.insert(ACCEPT_RANGES, HeaderValue::from_static("bytes"));
        Ok(HttpResponse::from_parts(200, headers, Vec::new()))
    }
}

/// Progress sink that keeps every update.
#[derive(Default)]
struct RecordingProgress(Mutex<Vec<ProgressUpdate>>);

impl RecordingProgress {
    fn terminal_states(&self) -> Vec<DownloadState> {
        self.0
            .lock()
            .unwrap()
            .iter()
            .map(|u| u.state)
            .filter(|s| s.is_terminal())
            .collect()
    }
}

impl ProgressSink for RecordingProgress {
    fn on_progress(&self, update: &ProgressUpdate) {
        self.0.lock().unwrap().push(update.clone());
    }
}

fn memory_manager(
    config: DownloadConfig,
    http: Arc<dyn HttpTransport>,
    sink: Arc<MemorySink>,
) -> DownloadManager {
    DownloadManager::new(
        config,
        http,
        sink,
        Arc::new(MemoryCheckpointStore::new()),
        Arc::new(NoopProgressSink),
    )
    .expect("valid manager config")
}

#[tokio::test]
async fn test_global_cap_serializes_downloads() {
    let transport = Arc::new(CountingTransport::new(6_000));
    let sink = Arc::new(MemorySink::new());
    let mut config = test_config();
    config.connections = 1;
    config.max_concurrent_downloads = 1;
    let manager = memory_manager(
        config,
        Arc::clone(&transport) as Arc<dyn HttpTransport>,
        Arc::clone(&sink),
    );

    let handles: Vec<_> = ["one", "two", "three"]
        .into_iter()
        .map(|id| {
            let job = DownloadJob::new(
                id,
                vec![DownloadRequest::new(format!("https://cdn.example/{id}.bin"))],
                format!("{id}.bin"),
            );
            manager.start(job).unwrap()
        })
        .collect();

    for handle in &handles {
        assert_eq!(handle.wait().await, DownloadStatus::Success);
    }
    assert_eq!(transport.peak.load(Ordering::SeqCst), 1);
    assert_eq!(manager.stats().completed(), 3);
    assert_eq!(manager.active_count(), 0);
    let expected = payload(6_000);
    for id in ["one", "two", "three"] {
        let written = sink.contents(Path::new(&format!("{id}.bin"))).await.unwrap();
        assert_eq!(written, expected, "{id}");
    }
}

#[tokio::test]
async fn test_global_cap_allows_parallel_downloads() {
    let transport = Arc::new(CountingTransport::new(6_000));
    let mut config = test_config();
    config.connections = 1;
    config.max_concurrent_downloads = 2;
    let manager = memory_manager(
        config,
        Arc::clone(&transport) as Arc<dyn HttpTransport>,
        Arc::new(MemorySink::new()),
    );

    let a = manager
        .start(DownloadJob::new(
            "a",
            vec![DownloadRequest::new("https://cdn.example/a.bin")],
            "a.bin",
        ))
        .unwrap();
    let b = manager
        .start(DownloadJob::new(
            "b",
            vec![DownloadRequest::new("https://cdn.example/b.bin")],
            "b.bin",
        ))
        .unwrap();

    assert_eq!(a.wait().await, DownloadStatus::Success);
    assert_eq!(b.wait().await, DownloadStatus::Success);
    assert_eq!(transport.peak.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_failed_mirror_falls_back_to_next() {
    let server = MockServer::start().await;
    // Broken mirror: probed twice (first attempt, then the resume retry).
    Mock::given(method("HEAD"))
        .and(path("/broken.bin"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/broken.bin"))
        .respond_with(ResponseTemplate::new(404))
        .expect(2)
        .mount(&server)
        .await;
    let content = payload(7_000);
    mount_ranged_file(&server, "/good.bin", content.clone()).await;

    let sink = Arc::new(MemorySink::new());
    let manager = memory_manager(
        test_config(),
        Arc::new(HttpClient::new().unwrap()),
        Arc::clone(&sink),
    );
    let job = DownloadJob::new(
        "fallback",
        vec![
            DownloadRequest::new(format!("{}/broken.bin", server.uri())),
            DownloadRequest::new(format!("{}/good.bin", server.uri())),
        ],
        "out.bin",
    );
    let handle = manager.start(job).unwrap();

    assert_eq!(handle.wait().await, DownloadStatus::Success);
    assert_eq!(sink.contents(Path::new("out.bin")).await.unwrap(), content);
}

#[tokio::test]
async fn test_undersized_mirror_is_skipped_without_retry() {
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .respond_with(ResponseTemplate::new(405))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/preview.mp4"))
        .respond_with(
            ResponseTemplate::new(206)
                .insert_header("content-range", "bytes 0-1023/1500")
                .set_body_bytes(vec![0u8; 1024]),
        )
        .expect(1)
        .mount(&server)
        .await;
    let content = payload(12_000);
    mount_ranged_file(&server, "/full.mp4", content.clone()).await;

    let sink = Arc::new(MemorySink::new());
    let manager = memory_manager(
        test_config(),
        Arc::new(HttpClient::new().unwrap()),
        Arc::clone(&sink),
    );
    let job = DownloadJob::new(
        "movie",
        vec![
            DownloadRequest::new(format!("{}/preview.mp4", server.uri())),
            DownloadRequest::new(format!("{}/full.mp4", server.uri())),
        ],
        "movie.mp4",
    )
    .with_minimum_size(10_000);
    let handle = manager.start(job).unwrap();

    assert_eq!(handle.wait().await, DownloadStatus::Success);
    assert_eq!(sink.contents(Path::new("movie.mp4")).await.unwrap(), content);
}

#[tokio::test]
async fn test_every_mirror_failing_reports_failure() {
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let manager = memory_manager(
        test_config(),
        Arc::new(HttpClient::new().unwrap()),
        Arc::new(MemorySink::new()),
    );
    let job = DownloadJob::new(
        "doomed",
        vec![
            DownloadRequest::new(format!("{}/a.bin", server.uri())),
            DownloadRequest::new(format!("{}/b.bin", server.uri())),
        ],
        "doomed.bin",
    );
    let handle = manager.start(job).unwrap();

    assert_eq!(handle.wait().await, DownloadStatus::Failed);
    assert_eq!(manager.stats().failed(), 1);
}

#[tokio::test]
async fn test_failed_download_checkpoint_survives_restart_in_sqlite() {
    let server = MockServer::start().await;
    let content = payload(10_000);
    Mock::given(method("HEAD"))
        .respond_with(ResponseTemplate::new(405))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/series.mkv"))
        .and(wiremock::matchers::header("range", "bytes=6000-7999"))
        .respond_with(ResponseTemplate::new(404).set_delay(Duration::from_millis(300)))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/series.mkv"))
        .respond_with(support::RangeResponder::new(content.clone()))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("checkpoints.db");
    let output_dir = dir.path().join("out");
    let job = || {
        DownloadJob::new(
            "series",
            vec![DownloadRequest::new(format!("{}/series.mkv", server.uri()))],
            "series.mkv",
        )
    };

    {
        let store = Arc::new(SqliteCheckpointStore::new(Database::new(&db_path).await.unwrap()));
        let manager = DownloadManager::new(
            test_config(),
            Arc::new(HttpClient::new().unwrap()),
            Arc::new(streamdl_core::FsSink::new(&output_dir)),
            Arc::clone(&store) as Arc<dyn CheckpointStore>,
            Arc::new(NoopProgressSink),
        )
        .unwrap();
        let status = manager.start(job()).unwrap().wait().await;
        assert_eq!(status, DownloadStatus::Failed);

        let checkpoint = store.get("series").await.unwrap().unwrap();
        assert_eq!(checkpoint.bytes_written, 6_000);
        assert_eq!(checkpoint.mirror_index, 0);
    }

    // A new process: fresh database handle, same file.
    let store = Arc::new(SqliteCheckpointStore::new(Database::new(&db_path).await.unwrap()));
    let manager = DownloadManager::new(
        test_config(),
        Arc::new(HttpClient::new().unwrap()),
        Arc::new(streamdl_core::FsSink::new(&output_dir)),
        Arc::clone(&store) as Arc<dyn CheckpointStore>,
        Arc::new(NoopProgressSink),
    )
    .unwrap();
    let status = manager.start(job().with_resume(true)).unwrap().wait().await;

    assert_eq!(status, DownloadStatus::Success);
    assert_eq!(std::fs::read(output_dir.join("series.mkv")).unwrap(), content);
    assert!(store.get("series").await.unwrap().is_none());
}

#[tokio::test]
async fn test_failure_before_transfer_reports_terminal_progress() {
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    let progress = Arc::new(RecordingProgress::default());
    let manager = DownloadManager::new(
        test_config(),
        Arc::new(HttpClient::new().unwrap()),
        Arc::new(MemorySink::new()),
        Arc::new(MemoryCheckpointStore::new()),
        Arc::clone(&progress) as Arc<dyn ProgressSink>,
    )
    .unwrap();
    let job = DownloadJob::new(
        "missing",
        vec![
            DownloadRequest::new(format!("{}/a.bin", server.uri())),
            DownloadRequest::new(format!("{}/b.bin", server.uri())),
        ],
        "missing.bin",
    );

    let status = manager.start(job).unwrap().wait().await;

    assert_eq!(status, DownloadStatus::Failed);
    assert_eq!(progress.terminal_states(), vec![DownloadState::Failed]);
    let updates = progress.0.lock().unwrap();
    assert_eq!(updates.last().unwrap().id, "missing");
}

#[tokio::test]
async fn test_stop_while_queued_reports_terminal_progress() {
    let transport = Arc::new(CountingTransport::new(6_000));
    let progress = Arc::new(RecordingProgress::default());
    let mut config = test_config();
    config.max_concurrent_downloads = 1;
    let manager = DownloadManager::new(
        config,
        transport,
        Arc::new(MemorySink::new()),
        Arc::new(MemoryCheckpointStore::new()),
        Arc::clone(&progress) as Arc<dyn ProgressSink>,
    )
    .unwrap();

    let running = manager
        .start(DownloadJob::new(
            "running",
            vec![DownloadRequest::new("https://cdn.example/running.bin")],
            "running.bin",
        ))
        .unwrap();
    let queued = manager
        .start(DownloadJob::new(
            "queued",
            vec![DownloadRequest::new("https://cdn.example/queued.bin")],
            "queued.bin",
        ))
        .unwrap();
    assert!(queued.stop());

    assert_eq!(queued.wait().await, DownloadStatus::Stopped);
    assert_eq!(running.wait().await, DownloadStatus::Success);
    let updates = progress.0.lock().unwrap();
    let queued_terminal: Vec<DownloadState> = updates
        .iter()
        .filter(|u| u.id == "queued" && u.state.is_terminal())
        .map(|u| u.state)
        .collect();
    assert_eq!(queued_terminal, vec![DownloadState::Stopped]);
    let running_terminal: Vec<DownloadState> = updates
        .iter()
        .filter(|u| u.id == "running" && u.state.is_terminal())
        .map(|u| u.state)
        .collect();
    assert_eq!(running_terminal, vec![DownloadState::Done]);
}
