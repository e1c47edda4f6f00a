//! Download manager: global concurrency cap, control handles and mirror fallback.
//!
//! Each started job runs in its own Tokio task. The task waits for a permit
//! from a semaphore sized by [`DownloadConfig::max_concurrent_downloads`],
//! then walks the job's mirrors until one of them succeeds, the user stops
//! the download, or the status says no other mirror will help.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use streamdl_core::download::{
//!     DownloadConfig, DownloadJob, DownloadManager, DownloadRequest, FsSink, HttpClient,
//!     MemoryCheckpointStore, TracingProgressSink,
//! };
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = DownloadManager::new(
//!     DownloadConfig::default(),
//!     Arc::new(HttpClient::new()?),
//!     Arc::new(FsSink::new("./downloads")),
//!     Arc::new(MemoryCheckpointStore::new()),
//!     Arc::new(TracingProgressSink),
//! )?;
//! let job = DownloadJob::new(
//!     "episode-1",
//!     vec![DownloadRequest::new("https://cdn.example/episode-1.mp4")],
//!     "episode-1.mp4",
//! );
//! let handle = manager.start(job)?;
//! println!("finished: {}", handle.wait().await);
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{Semaphore, watch};
use tracing::{debug, info, instrument, warn};

use super::checkpoint::{CheckpointStore, ResumeCheckpoint};
use super::error::DownloadError;
use super::http::HttpTransport;
use super::metadata::SessionMetadata;
use super::progress::{ProgressReporter, ProgressSink, ProgressUpdate};
use super::session::{DownloadConfig, DownloadSession, MAX_CONCURRENT_DOWNLOADS, SessionContext};
use super::sink::Sink;
use super::state::{ControlHandle, DownloadState, SessionGate};
use super::status::DownloadStatus;
use super::target::DownloadRequest;

/// Error type for download manager operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Invalid concurrency value provided.
    #[error(
        "invalid concurrency value {value}: must be between 1 and {MAX_CONCURRENT_DOWNLOADS}"
    )]
    InvalidConcurrency {
        /// The invalid value that was provided.
        value: usize,
    },

    /// Another configuration value is out of range.
    #[error(transparent)]
    InvalidConfig(#[from] DownloadError),

    /// A job was started without any mirror.
    #[error("download {id} has no mirrors")]
    NoMirrors {
        /// The job id.
        id: String,
    },
}

/// A logical download: one output, one or more interchangeable mirrors.
#[derive(Debug, Clone)]
pub struct DownloadJob {
    /// Stable id used for control and checkpoints.
    pub id: String,
    /// Mirrors in preference order.
    pub mirrors: Vec<DownloadRequest>,
    /// Output path relative to the sink.
    pub output: PathBuf,
    /// Continue from a previous attempt's partial output.
    pub resume: bool,
    /// Overrides the configured minimum size.
    pub minimum_size: Option<u64>,
}

impl DownloadJob {
    /// Creates a fresh job.
    pub fn new(
        id: impl Into<String>,
        mirrors: Vec<DownloadRequest>,
        output: impl Into<PathBuf>,
    ) -> Self {
        Self {
            id: id.into(),
            mirrors,
            output: output.into(),
            resume: false,
            minimum_size: None,
        }
    }

    /// Resumes from the stored checkpoint.
    #[must_use]
    pub fn with_resume(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }

    /// Sets the minimum accepted size.
    #[must_use]
    pub fn with_minimum_size(mut self, minimum_size: u64) -> Self {
        self.minimum_size = Some(minimum_size);
        self
    }

    fn session(&self, mirror_index: usize, request: &DownloadRequest, resume: bool) -> DownloadSession {
        let session = DownloadSession::new(self.id.clone(), request.clone(), self.output.clone())
            .with_resume(resume)
            .with_mirror_index(mirror_index);
        match self.minimum_size {
            Some(minimum) => session.with_minimum_size(minimum),
            None => session,
        }
    }
}

/// Outcome counters across every job of a manager.
#[derive(Debug, Default)]
pub struct ManagerStats {
    completed: AtomicUsize,
    failed: AtomicUsize,
    stopped: AtomicUsize,
}

impl ManagerStats {
    /// Creates zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Jobs that finished successfully.
    #[must_use]
    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    /// Jobs that ran out of mirrors or hit a fatal error.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.failed.load(Ordering::SeqCst)
    }

    /// Jobs stopped by the user.
    #[must_use]
    pub fn stopped(&self) -> usize {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Jobs that reached any final outcome.
    #[must_use]
    pub fn total(&self) -> usize {
        self.completed() + self.failed() + self.stopped()
    }

    fn record(&self, status: DownloadStatus) {
        let counter = match status {
            DownloadStatus::Success => &self.completed,
            DownloadStatus::Stopped => &self.stopped,
            DownloadStatus::Failed | DownloadStatus::InvalidInput | DownloadStatus::BadConfig => {
                &self.failed
            }
        };
        counter.fetch_add(1, Ordering::SeqCst);
    }
}

/// Control and observation of one running job.
#[derive(Debug, Clone)]
pub struct DownloadHandle {
    id: String,
    gate: SessionGate,
    control: ControlHandle,
    outcome: watch::Receiver<Option<DownloadStatus>>,
}

impl DownloadHandle {
    /// Job id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Pauses the download; in-flight reads finish but nothing is written.
    pub fn pause(&self) -> bool {
        self.control.pause()
    }

    /// Resumes a paused download.
    pub fn resume(&self) -> bool {
        self.control.resume()
    }

    /// Stops the download and deletes its partial output.
    pub fn stop(&self) -> bool {
        self.control.stop()
    }

    /// Live state.
    #[must_use]
    pub fn state(&self) -> DownloadState {
        self.gate.state()
    }

    /// Receiver for live state changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<DownloadState> {
        self.gate.subscribe()
    }

    /// Final status once the job has finished.
    #[must_use]
    pub fn outcome(&self) -> Option<DownloadStatus> {
        *self.outcome.borrow()
    }

    /// Waits for the job to finish.
    ///
    /// A job whose task died without reporting counts as failed.
    pub async fn wait(&self) -> DownloadStatus {
        let mut rx = self.outcome.clone();
        match rx.wait_for(Option::is_some).await {
            Ok(status) => (*status).unwrap_or(DownloadStatus::Failed),
            Err(_) => self.outcome().unwrap_or(DownloadStatus::Failed),
        }
    }
}

/// Runs jobs under a global concurrency cap.
///
/// # Concurrency Model
///
/// - Each job runs in its own Tokio task
/// - A semaphore permit is held for the whole mirror loop of a job
/// - Permits are released automatically when the task ends (RAII)
/// - Starting an id that is already active resumes it instead
pub struct DownloadManager {
    config: Arc<DownloadConfig>,
    ctx: SessionContext,
    semaphore: Arc<Semaphore>,
    active: Arc<Mutex<HashMap<String, DownloadHandle>>>,
    stats: Arc<ManagerStats>,
}

impl std::fmt::Debug for DownloadManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadManager")
            .field("config", &self.config)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl DownloadManager {
    /// Creates a manager.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidConcurrency`] when
    /// `max_concurrent_downloads` is outside 1..=100 and
    /// [`EngineError::InvalidConfig`] for any other invalid value.
    #[instrument(level = "debug", skip_all, fields(max_concurrent = config.max_concurrent_downloads))]
    pub fn new(
        config: DownloadConfig,
        http: Arc<dyn HttpTransport>,
        sink: Arc<dyn Sink>,
        checkpoints: Arc<dyn CheckpointStore>,
        progress: Arc<dyn ProgressSink>,
    ) -> Result<Self, EngineError> {
        if !(1..=MAX_CONCURRENT_DOWNLOADS).contains(&config.max_concurrent_downloads) {
            return Err(EngineError::InvalidConcurrency {
                value: config.max_concurrent_downloads,
            });
        }
        config.validate()?;

        debug!(
            connections = config.connections,
            chunk_size = config.chunk_size,
            max_retries = config.retry.max_attempts(),
            "creating download manager"
        );

        Ok(Self {
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_downloads)),
            config: Arc::new(config),
            ctx: SessionContext {
                http,
                sink,
                checkpoints,
                progress,
            },
            active: Arc::new(Mutex::new(HashMap::new())),
            stats: Arc::new(ManagerStats::new()),
        })
    }

    /// Configuration shared by every job.
    #[must_use]
    pub fn config(&self) -> &DownloadConfig {
        &self.config
    }

    /// Outcome counters.
    #[must_use]
    pub fn stats(&self) -> &ManagerStats {
        &self.stats
    }

    /// Handle of an active job.
    #[must_use]
    pub fn handle(&self, id: &str) -> Option<DownloadHandle> {
        lock_active(&self.active).get(id).cloned()
    }

    /// Number of jobs that are queued or running.
    #[must_use]
    pub fn active_count(&self) -> usize {
        lock_active(&self.active).len()
    }

    /// Starts `job`, or resumes it when its id is already active.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NoMirrors`] for a job without mirrors.
    #[instrument(skip(self, job), fields(id = %job.id, mirrors = job.mirrors.len()))]
    pub fn start(&self, job: DownloadJob) -> Result<DownloadHandle, EngineError> {
        if job.mirrors.is_empty() {
            return Err(EngineError::NoMirrors { id: job.id });
        }

        let mut active = lock_active(&self.active);
        if let Some(existing) = active.get(&job.id) {
            debug!("download already active, resuming it");
            existing.resume();
            return Ok(existing.clone());
        }

        let gate = SessionGate::new();
        let (control, _pump) = ControlHandle::spawn(gate.clone());
        let (outcome_tx, outcome_rx) = watch::channel(None);
        let handle = DownloadHandle {
            id: job.id.clone(),
            gate: gate.clone(),
            control,
            outcome: outcome_rx,
        };
        active.insert(job.id.clone(), handle.clone());
        drop(active);

        let semaphore = Arc::clone(&self.semaphore);
        let config = Arc::clone(&self.config);
        let progress = Arc::new(JobProgress::new(Arc::clone(&self.ctx.progress)));
        let ctx = SessionContext {
            progress: Arc::clone(&progress) as Arc<dyn ProgressSink>,
            ..self.ctx.clone()
        };
        let active = Arc::clone(&self.active);
        let stats = Arc::clone(&self.stats);

        tokio::spawn(async move {
            let id = job.id.clone();
            let job_config = Arc::clone(&config);
            let task = tokio::spawn(async move {
                let permit = tokio::select! {
                    permit = semaphore.acquire_owned() => permit.ok(),
                    _ = gate.terminated() => None,
                };
                let Some(_permit) = permit else {
                    info!(id = %job.id, "download stopped before it started");
                    return DownloadStatus::Stopped;
                };
                run_mirrors(&job, &ctx, &job_config, &gate).await
            });

            // A panicking job counts as failed.
            let status = match task.await {
                Ok(status) => status,
                Err(e) => {
                    warn!(%id, error = %e, "download task panicked");
                    DownloadStatus::Failed
                }
            };
            progress.finish(&id, &config, status);
            stats.record(status);
            lock_active(&active).remove(&id);
            outcome_tx.send_replace(Some(status));
        });

        Ok(handle)
    }
}

/// Progress sink of one job.
///
/// Sessions report their own terminal states when an attempt ends, but a
/// failed attempt may be followed by another mirror. Terminal updates are held
/// back here and the job's outcome is delivered once by [`Self::finish`], even
/// when no attempt got far enough to start reporting.
struct JobProgress {
    sink: Arc<dyn ProgressSink>,
    last: Mutex<Option<ProgressUpdate>>,
}

impl JobProgress {
    fn new(sink: Arc<dyn ProgressSink>) -> Self {
        Self {
            sink,
            last: Mutex::new(None),
        }
    }

    fn finish(&self, id: &str, config: &DownloadConfig, status: DownloadStatus) {
        let state = terminal_state(status);
        let last = self
            .last
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        match last {
            Some(last) => self.sink.on_progress(&ProgressUpdate {
                state,
                bytes_per_second: 0,
                ..last
            }),
            None => {
                ProgressReporter::new(
                    id,
                    Arc::new(SessionMetadata::new()),
                    Arc::clone(&self.sink),
                    config.progress_interval,
                    false,
                )
                .report_state(state);
            }
        }
    }
}

impl ProgressSink for JobProgress {
    fn on_progress(&self, update: &ProgressUpdate) {
        *self
            .last
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(update.clone());
        if !update.state.is_terminal() {
            self.sink.on_progress(update);
        }
    }
}

fn terminal_state(status: DownloadStatus) -> DownloadState {
    match status {
        DownloadStatus::Success => DownloadState::Done,
        DownloadStatus::Stopped => DownloadState::Stopped,
        DownloadStatus::Failed | DownloadStatus::InvalidInput | DownloadStatus::BadConfig => {
            DownloadState::Failed
        }
    }
}

fn lock_active(
    active: &Mutex<HashMap<String, DownloadHandle>>,
) -> std::sync::MutexGuard<'_, HashMap<String, DownloadHandle>> {
    active
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Tries each mirror in turn until one succeeds or no other mirror can help.
#[instrument(skip_all, fields(id = %job.id))]
async fn run_mirrors(
    job: &DownloadJob,
    ctx: &SessionContext,
    config: &DownloadConfig,
    gate: &SessionGate,
) -> DownloadStatus {
    let resume_mirror = if job.resume {
        match ctx.checkpoints.get(&job.id).await {
            Ok(checkpoint) => checkpoint
                .map(|c| c.mirror_index)
                .filter(|index| *index < job.mirrors.len()),
            Err(error) => {
                warn!(%error, "could not read resume checkpoint");
                None
            }
        }
    } else {
        None
    };
    let first = resume_mirror.unwrap_or(0);

    let mut status = DownloadStatus::Failed;
    for (index, request) in job.mirrors.iter().enumerate().skip(first) {
        if !gate.rearm() {
            return DownloadStatus::Stopped;
        }
        persist_mirror_index(job, ctx, index).await;

        let resume = resume_mirror == Some(index);
        info!(mirror = index, url = %request.url, resume, "trying mirror");
        status = run_session(&job.session(index, request, resume), ctx, config, gate).await;

        if status.retry_same() {
            if !gate.rearm() {
                return DownloadStatus::Stopped;
            }
            info!(mirror = index, "retrying mirror from partial output");
            status = run_session(&job.session(index, request, true), ctx, config, gate).await;
        }

        match status {
            DownloadStatus::Success | DownloadStatus::Stopped => return status,
            _ if !status.try_next() => break,
            _ => debug!(mirror = index, %status, "moving to next mirror"),
        }
    }

    warn!(%status, "download failed on every mirror");
    gate.fail();
    status
}

async fn run_session(
    session: &DownloadSession,
    ctx: &SessionContext,
    config: &DownloadConfig,
    gate: &SessionGate,
) -> DownloadStatus {
    match session.run(ctx, config, gate).await {
        Ok(status) => status,
        Err(error) => {
            warn!(%error, "output write failed, giving up");
            gate.fail();
            DownloadStatus::BadConfig
        }
    }
}

/// Records which mirror the checkpoint belongs to, discarding progress made
/// against another mirror.
async fn persist_mirror_index(job: &DownloadJob, ctx: &SessionContext, index: usize) {
    let current = ctx.checkpoints.get(&job.id).await.ok().flatten();
    if current.is_some_and(|c| c.mirror_index == index) {
        return;
    }
    let checkpoint = ResumeCheckpoint {
        mirror_index: index,
        ..ResumeCheckpoint::default()
    };
    if let Err(error) = ctx.checkpoints.put(&job.id, &checkpoint).await {
        warn!(%error, "could not store mirror index");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::download::checkpoint::MemoryCheckpointStore;
    use crate::download::http::HttpClient;
    use crate::download::progress::NoopProgressSink;
    use crate::download::sink::MemorySink;

    fn manager(config: DownloadConfig) -> Result<DownloadManager, EngineError> {
        DownloadManager::new(
            config,
            Arc::new(HttpClient::new().unwrap()),
            Arc::new(MemorySink::new()),
            Arc::new(MemoryCheckpointStore::new()),
            Arc::new(NoopProgressSink),
        )
    }

    #[test]
    fn test_manager_new_valid_concurrency() {
        for value in [1, 3, 100] {
            let config = DownloadConfig {
                max_concurrent_downloads: value,
                ..DownloadConfig::default()
            };
            assert!(manager(config).is_ok(), "{value}");
        }
    }

    #[test]
    fn test_manager_new_invalid_concurrency() {
        for value in [0, 101] {
            let config = DownloadConfig {
                max_concurrent_downloads: value,
                ..DownloadConfig::default()
            };
            assert!(matches!(
                manager(config),
                Err(EngineError::InvalidConcurrency { value: v }) if v == value
            ));
        }
    }

    #[test]
    fn test_manager_new_rejects_invalid_config() {
        let config = DownloadConfig::default().with_chunk_size(10);
        assert!(matches!(manager(config), Err(EngineError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_start_without_mirrors_is_error() {
        let manager = manager(DownloadConfig::default()).unwrap();
        let result = manager.start(DownloadJob::new("empty", Vec::new(), "out.bin"));
        assert!(matches!(result, Err(EngineError::NoMirrors { .. })));
        assert_eq!(manager.active_count(), 0);
    }

    #[test]
    fn test_stats_record() {
        let stats = ManagerStats::new();
        stats.record(DownloadStatus::Success);
        stats.record(DownloadStatus::Success);
        stats.record(DownloadStatus::InvalidInput);
        stats.record(DownloadStatus::Stopped);
        assert_eq!(stats.completed(), 2);
        assert_eq!(stats.failed(), 1);
        assert_eq!(stats.stopped(), 1);
        assert_eq!(stats.total(), 4);
    }

    #[derive(Default)]
    struct Recording(Mutex<Vec<ProgressUpdate>>);

    impl ProgressSink for Recording {
        fn on_progress(&self, update: &ProgressUpdate) {
            self.0.lock().unwrap().push(update.clone());
        }
    }

    fn update(state: DownloadState, bytes_written: u64) -> ProgressUpdate {
        ProgressUpdate {
            id: "job".to_string(),
            state,
            bytes_downloaded: bytes_written,
            bytes_written,
            total_bytes: Some(10_000),
            bytes_per_second: 512,
            segments_written: None,
            segment_total: None,
        }
    }

    #[test]
    fn test_job_progress_holds_back_attempt_terminal_states() {
        let recording = Arc::new(Recording::default());
        let progress = JobProgress::new(Arc::clone(&recording) as Arc<dyn ProgressSink>);

        progress.on_progress(&update(DownloadState::Downloading, 4_000));
        progress.on_progress(&update(DownloadState::Failed, 4_000));
        progress.on_progress(&update(DownloadState::Downloading, 10_000));
        progress.on_progress(&update(DownloadState::Done, 10_000));
        progress.finish("job", &DownloadConfig::default(), DownloadStatus::Success);

        let states: Vec<DownloadState> =
            recording.0.lock().unwrap().iter().map(|u| u.state).collect();
        assert_eq!(states, vec![
            DownloadState::Downloading,
            DownloadState::Downloading,
            DownloadState::Done,
        ]);
        let last = recording.0.lock().unwrap().last().cloned().unwrap();
        assert_eq!(last.bytes_written, 10_000);
    }

    #[test]
    fn test_job_progress_reports_outcome_without_prior_updates() {
        let recording = Arc::new(Recording::default());
        let progress = JobProgress::new(Arc::clone(&recording) as Arc<dyn ProgressSink>);

        progress.finish("job", &DownloadConfig::default(), DownloadStatus::InvalidInput);

        let updates = recording.0.lock().unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].id, "job");
        assert_eq!(updates[0].state, DownloadState::Failed);
        assert_eq!(updates[0].bytes_written, 0);
    }

    #[test]
    fn test_engine_error_display() {
        let msg = EngineError::InvalidConcurrency { value: 0 }.to_string();
        assert!(msg.contains("invalid concurrency"));
        assert!(msg.contains("100"));
    }
}
