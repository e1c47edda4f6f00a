//! Progress notifications.
//!
//! A [`ProgressReporter`] samples [`SessionMetadata`] and forwards
//! [`ProgressUpdate`]s to a [`ProgressSink`]. Periodic samples are throttled;
//! state transitions are always delivered and the terminal state exactly once.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::constants::{SPEED_WINDOW_MAX, SPEED_WINDOW_MIN};
use super::metadata::SessionMetadata;
use super::state::{DownloadState, SessionGate};

/// One progress sample.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressUpdate {
    /// Download id.
    pub id: String,
    /// Live state at sample time.
    pub state: DownloadState,
    /// Bytes received.
    pub bytes_downloaded: u64,
    /// Bytes flushed to the output.
    pub bytes_written: u64,
    /// Declared or estimated total.
    pub total_bytes: Option<u64>,
    /// Receive rate since the previous sample.
    pub bytes_per_second: u64,
    /// HLS segments written.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub segments_written: Option<usize>,
    /// HLS segment count.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub segment_total: Option<usize>,
}

/// Receives progress updates (UI, logs, notification shade).
pub trait ProgressSink: Send + Sync {
    /// Called for every delivered update.
    fn on_progress(&self, update: &ProgressUpdate);
}

/// Sink that discards updates.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopProgressSink;

impl ProgressSink for NoopProgressSink {
    fn on_progress(&self, _update: &ProgressUpdate) {}
}

/// Sink that logs updates through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingProgressSink;

impl ProgressSink for TracingProgressSink {
    fn on_progress(&self, update: &ProgressUpdate) {
        info!(
            id = %update.id,
            state = %update.state,
            bytes_written = update.bytes_written,
            total = ?update.total_bytes,
            bytes_per_second = update.bytes_per_second,
            "download progress"
        );
    }
}

const NEVER_SAMPLED: u64 = u64::MAX;

/// `Δdownloaded × 1000 / clamp(Δms, 100, 10000)`.
#[must_use]
pub fn bytes_per_second(delta_bytes: u64, elapsed: Duration) -> u64 {
    let window = elapsed.clamp(SPEED_WINDOW_MIN, SPEED_WINDOW_MAX);
    let millis = u64::try_from(window.as_millis()).unwrap_or(u64::MAX);
    delta_bytes.saturating_mul(1000) / millis.max(1)
}

/// Rate-limited progress publisher for one session attempt.
pub struct ProgressReporter {
    id: String,
    metadata: Arc<SessionMetadata>,
    sink: Arc<dyn ProgressSink>,
    interval: Duration,
    hls: bool,
    origin: Instant,
    last_sample_ms: AtomicU64,
    last_downloaded: AtomicU64,
    terminal_sent: AtomicBool,
}

impl std::fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("id", &self.id)
            .field("interval", &self.interval)
            .field("hls", &self.hls)
            .finish_non_exhaustive()
    }
}

impl ProgressReporter {
    /// Creates a reporter; `hls` adds segment counts to updates.
    pub fn new(
        id: impl Into<String>,
        metadata: Arc<SessionMetadata>,
        sink: Arc<dyn ProgressSink>,
        interval: Duration,
        hls: bool,
    ) -> Self {
        Self {
            id: id.into(),
            last_downloaded: AtomicU64::new(metadata.bytes_downloaded()),
            metadata,
            sink,
            interval,
            hls,
            origin: Instant::now(),
            last_sample_ms: AtomicU64::new(NEVER_SAMPLED),
            terminal_sent: AtomicBool::new(false),
        }
    }

    fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    fn snapshot(&self, state: DownloadState) -> ProgressUpdate {
        let now_ms = self.elapsed_ms();
        let previous_ms = match self.last_sample_ms.swap(now_ms, Ordering::Relaxed) {
            NEVER_SAMPLED => 0,
            previous => previous,
        };
        let downloaded = self.metadata.bytes_downloaded();
        let previous = self.last_downloaded.swap(downloaded, Ordering::Relaxed);
        let speed = bytes_per_second(
            downloaded.saturating_sub(previous),
            Duration::from_millis(now_ms.saturating_sub(previous_ms)),
        );

        ProgressUpdate {
            id: self.id.clone(),
            state,
            bytes_downloaded: downloaded,
            bytes_written: self.metadata.bytes_written(),
            total_bytes: self.metadata.approx_total_bytes(),
            bytes_per_second: speed,
            segments_written: self.hls.then(|| self.metadata.segments_written()),
            segment_total: if self.hls {
                self.metadata.segment_total()
            } else {
                None
            },
        }
    }

    /// Periodic sample; dropped when the last one is younger than the interval.
    pub fn tick(&self, state: DownloadState) -> bool {
        if state.is_terminal() {
            return self.report_state(state);
        }
        let now_ms = self.elapsed_ms();
        let last = self.last_sample_ms.load(Ordering::Relaxed);
        let interval_ms = u64::try_from(self.interval.as_millis()).unwrap_or(u64::MAX);
        if last != NEVER_SAMPLED && now_ms.saturating_sub(last) < interval_ms {
            return false;
        }
        self.sink.on_progress(&self.snapshot(state));
        true
    }

    /// State transition; always delivered, terminal states at most once.
    pub fn report_state(&self, state: DownloadState) -> bool {
        if state.is_terminal() && self.terminal_sent.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.sink.on_progress(&self.snapshot(state));
        true
    }

    /// Spawns a task ticking every interval and forwarding state changes.
    ///
    /// The task reports the terminal state and exits.
    pub fn spawn(self: Arc<Self>, gate: SessionGate) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut rx = gate.subscribe();
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let state = gate.state();
                        self.tick(state);
                        if state.is_terminal() {
                            break;
                        }
                    }
                    changed = rx.changed() => {
                        let state = gate.state();
                        if changed.is_err() {
                            self.report_state(state);
                            break;
                        }
                        self.report_state(state);
                        if state.is_terminal() {
                            break;
                        }
                    }
                }
            }
            debug!(id = %self.id, "progress reporter finished");
        })
    }
}
