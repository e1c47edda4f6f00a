//! Download session controller.
//!
//! A session is one attempt at one mirror: probe or resolve the source, plan
//! the work, run the worker pool into the reassembly writer, then settle the
//! outcome. Progressive files and HLS playlists share the skeleton and differ
//! in how work items are fetched and how resume points are recorded.
//!
//! # Outcome mapping
//!
//! | End state                       | Output file | Checkpoint | Status         |
//! |---------------------------------|-------------|------------|----------------|
//! | all work written, size ok       | kept        | removed    | `Success`      |
//! | stopped (command or file gone)  | deleted     | removed    | `Stopped`      |
//! | retries exhausted               | kept        | stored     | `Failed`       |
//! | under the minimum size          | deleted     | removed    | `InvalidInput` |
//! | output location unusable        | untouched   | untouched  | `BadConfig`    |
//!
//! Sink write failures are returned as errors instead of a status.

mod hls;
mod progressive;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, instrument, warn};

use super::checkpoint::{CheckpointStore, ResumeCheckpoint};
use super::constants::{
    DEFAULT_BUFFER_SIZE, DEFAULT_CHUNK_SIZE, DEFAULT_CONNECTIONS,
    DEFAULT_MAX_CONCURRENT_DOWNLOADS, MIN_CHUNK_SIZE, PROGRESS_INTERVAL, WATCHDOG_INTERVAL,
};
use super::error::DownloadError;
use super::hls::VariantPreference;
use super::http::HttpTransport;
use super::metadata::SessionMetadata;
use super::progress::{ProgressReporter, ProgressSink};
use super::retry::RetryPolicy;
use super::sink::Sink;
use super::state::{DownloadState, SessionGate};
use super::status::DownloadStatus;
use super::target::{DownloadRequest, LinkKind};

/// Upper bound for [`DownloadConfig::max_concurrent_downloads`].
pub const MAX_CONCURRENT_DOWNLOADS: usize = 100;

/// Tunables shared by every session of a manager.
#[derive(Debug, Clone)]
pub struct DownloadConfig {
    /// Parallel connections per download.
    pub connections: usize,
    /// Planned chunk size in bytes; must exceed 1000.
    pub chunk_size: u64,
    /// Largest payload handed to the writer at once.
    pub buffer_size: usize,
    /// Files below this size are fetched as one chunk.
    pub small_file_threshold: u64,
    /// Retry policy for byte-range chunks.
    pub retry: RetryPolicy,
    /// Retry policy for playlists, keys and segments.
    pub segment_retry: RetryPolicy,
    /// Minimum gap between periodic progress updates.
    pub progress_interval: Duration,
    /// How often the output file is checked for deletion.
    pub watchdog_interval: Duration,
    /// Completed downloads smaller than this are rejected.
    pub minimum_size: u64,
    /// Downloads running at the same time across a manager.
    pub max_concurrent_downloads: usize,
    /// HLS variant selection.
    pub variant: VariantPreference,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            connections: DEFAULT_CONNECTIONS,
            chunk_size: DEFAULT_CHUNK_SIZE,
            buffer_size: DEFAULT_BUFFER_SIZE,
            small_file_threshold: DEFAULT_CHUNK_SIZE * 2,
            retry: RetryPolicy::default(),
            segment_retry: RetryPolicy::segment_default(),
            progress_interval: PROGRESS_INTERVAL,
            watchdog_interval: WATCHDOG_INTERVAL,
            minimum_size: 0,
            max_concurrent_downloads: DEFAULT_MAX_CONCURRENT_DOWNLOADS,
            variant: VariantPreference::default(),
        }
    }
}

impl DownloadConfig {
    /// Sets the chunk size and keeps the small-file threshold at twice that.
    #[must_use]
    pub fn with_chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size = chunk_size;
        self.small_file_threshold = chunk_size.saturating_mul(2);
        self
    }

    /// Checks every value against its accepted range.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::InvalidConfig`] naming the first bad field.
    pub fn validate(&self) -> Result<(), DownloadError> {
        if self.connections == 0 {
            return Err(DownloadError::invalid_config("connections", "must be at least 1"));
        }
        if self.chunk_size <= MIN_CHUNK_SIZE {
            return Err(DownloadError::invalid_config(
                "chunk_size",
                format!("must exceed {MIN_CHUNK_SIZE} bytes"),
            ));
        }
        if self.buffer_size == 0 {
            return Err(DownloadError::invalid_config("buffer_size", "must be positive"));
        }
        if self.progress_interval.is_zero() {
            return Err(DownloadError::invalid_config("progress_interval", "must be positive"));
        }
        if self.watchdog_interval.is_zero() {
            return Err(DownloadError::invalid_config("watchdog_interval", "must be positive"));
        }
        if !(1..=MAX_CONCURRENT_DOWNLOADS).contains(&self.max_concurrent_downloads) {
            return Err(DownloadError::invalid_config(
                "max_concurrent_downloads",
                format!("must be between 1 and {MAX_CONCURRENT_DOWNLOADS}"),
            ));
        }
        Ok(())
    }
}

/// Collaborators a session talks to.
#[derive(Clone)]
pub struct SessionContext {
    /// Network access.
    pub http: Arc<dyn HttpTransport>,
    /// Output storage.
    pub sink: Arc<dyn Sink>,
    /// Resume checkpoint storage.
    pub checkpoints: Arc<dyn CheckpointStore>,
    /// Progress notifications.
    pub progress: Arc<dyn ProgressSink>,
}

impl std::fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionContext").finish_non_exhaustive()
    }
}

/// One attempt at downloading one mirror into one output path.
#[derive(Debug, Clone)]
pub struct DownloadSession {
    id: String,
    request: DownloadRequest,
    output: PathBuf,
    resume: bool,
    mirror_index: usize,
    minimum_size: Option<u64>,
}

impl DownloadSession {
    /// Creates a fresh (non-resuming) session writing to `output` in the sink.
    pub fn new(id: impl Into<String>, request: DownloadRequest, output: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            request,
            output: output.into(),
            resume: false,
            mirror_index: 0,
            minimum_size: None,
        }
    }

    /// Continues from the partial output and stored checkpoint.
    #[must_use]
    pub fn with_resume(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }

    /// Records which mirror this session downloads.
    #[must_use]
    pub fn with_mirror_index(mut self, mirror_index: usize) -> Self {
        self.mirror_index = mirror_index;
        self
    }

    /// Overrides [`DownloadConfig::minimum_size`] for this download.
    #[must_use]
    pub fn with_minimum_size(mut self, minimum_size: u64) -> Self {
        self.minimum_size = Some(minimum_size);
        self
    }

    /// Download id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Output path relative to the sink.
    #[must_use]
    pub fn output(&self) -> &Path {
        &self.output
    }

    /// Runs the session to a terminal outcome.
    ///
    /// `gate` carries the live state; pause, resume and stop commands applied
    /// to it take effect immediately.
    ///
    /// # Errors
    ///
    /// Only sink write failures are returned as errors; every other outcome
    /// is a [`DownloadStatus`].
    #[instrument(skip_all, fields(id = %self.id, url = %self.request.url, kind = %self.request.kind))]
    pub async fn run(
        &self,
        ctx: &SessionContext,
        config: &DownloadConfig,
        gate: &SessionGate,
    ) -> Result<DownloadStatus, DownloadError> {
        if config.connections == 0 {
            warn!("connection count must be at least 1");
            return Ok(DownloadStatus::InvalidInput);
        }
        if let Err(error) = config.validate() {
            warn!(%error, "refusing to start with invalid configuration");
            return Ok(DownloadStatus::BadConfig);
        }
        if gate.state() == DownloadState::Stopped {
            return Ok(DownloadStatus::Stopped);
        }

        match self.request.kind {
            LinkKind::Progressive => progressive::run(self, ctx, config, gate).await,
            LinkKind::Hls => hls::run(self, ctx, config, gate).await,
            kind => {
                warn!(%kind, "link kind cannot be downloaded");
                gate.fail();
                Ok(DownloadStatus::InvalidInput)
            }
        }
    }

    fn minimum_size(&self, config: &DownloadConfig) -> u64 {
        self.minimum_size.unwrap_or(config.minimum_size)
    }

    async fn load_checkpoint(&self, ctx: &SessionContext) -> Option<ResumeCheckpoint> {
        match ctx.checkpoints.get(&self.id).await {
            Ok(checkpoint) => checkpoint.filter(|c| c.mirror_index == self.mirror_index),
            Err(error) => {
                warn!(%error, "could not read resume checkpoint");
                None
            }
        }
    }

    async fn store_checkpoint(&self, ctx: &SessionContext, checkpoint: &ResumeCheckpoint) {
        if let Err(error) = ctx.checkpoints.put(&self.id, checkpoint).await {
            warn!(%error, "could not store resume checkpoint");
        }
    }

    async fn clear_checkpoint(&self, ctx: &SessionContext) {
        if let Err(error) = ctx.checkpoints.remove(&self.id).await {
            warn!(%error, "could not remove resume checkpoint");
        }
    }

    async fn delete_output(&self, ctx: &SessionContext) {
        if let Err(error) = ctx.sink.delete(&self.output).await {
            warn!(%error, "could not delete partial output");
        }
    }

    /// Deletes the output and reports `InvalidInput` for an undersized source.
    async fn reject_undersized(
        &self,
        ctx: &SessionContext,
        gate: &SessionGate,
        size: u64,
        minimum: u64,
    ) -> DownloadStatus {
        warn!(size, minimum, "download is smaller than the minimum size");
        gate.fail();
        self.delete_output(ctx).await;
        self.clear_checkpoint(ctx).await;
        DownloadStatus::InvalidInput
    }

    /// Settles a finished pool run into a status.
    ///
    /// `checkpoint` is stored when the run failed.
    async fn settle(
        &self,
        ctx: &SessionContext,
        config: &DownloadConfig,
        gate: &SessionGate,
        metadata: &SessionMetadata,
        checkpoint: ResumeCheckpoint,
    ) -> DownloadStatus {
        match gate.state() {
            DownloadState::Stopped => {
                info!(bytes_written = metadata.bytes_written(), "download stopped");
                self.delete_output(ctx).await;
                self.clear_checkpoint(ctx).await;
                DownloadStatus::Stopped
            }
            DownloadState::Failed => {
                info!(
                    bytes_written = checkpoint.bytes_written,
                    "download failed, keeping partial output"
                );
                self.store_checkpoint(ctx, &checkpoint).await;
                DownloadStatus::Failed
            }
            _ => {
                let written = metadata.bytes_written();
                let minimum = self.minimum_size(config);
                if written < minimum {
                    return self.reject_undersized(ctx, gate, written, minimum).await;
                }
                gate.finish();
                self.clear_checkpoint(ctx).await;
                info!(bytes_written = written, "download complete");
                DownloadStatus::Success
            }
        }
    }
}

/// Starts progress reporting for one attempt.
fn start_reporter(
    session: &DownloadSession,
    ctx: &SessionContext,
    config: &DownloadConfig,
    gate: &SessionGate,
    metadata: &Arc<SessionMetadata>,
    hls: bool,
) -> tokio::task::JoinHandle<()> {
    Arc::new(ProgressReporter::new(
        session.id.clone(),
        Arc::clone(metadata),
        Arc::clone(&ctx.progress),
        config.progress_interval,
        hls,
    ))
    .spawn(gate.clone())
}

/// Waits for helper tasks once the gate is terminal.
async fn join_helpers(handles: impl IntoIterator<Item = tokio::task::JoinHandle<()>>) {
    for handle in handles {
        if let Err(error) = handle.await {
            warn!(%error, "session helper task panicked");
        }
    }
}
