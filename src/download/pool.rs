//! Parallel worker pool.
//!
//! A fixed number of Tokio tasks claim work items (chunk or segment indices)
//! from a shared counter and run a fetch for each. Fetches feed the
//! [`ReassemblyWriter`](super::reassembly::ReassemblyWriter) directly, so the
//! pool itself never buffers payloads.
//!
//! # Concurrency Model
//!
//! - Each worker runs in its own Tokio task
//! - Workers wait while the session is paused and exit once it is terminal
//! - Fetches race the terminal-state signal, so a stop aborts in-flight reads
//! - With a [`ClaimWindow`], a claimed item waits until it is fewer than
//!   `concurrency` items past the first one the writer has not finished
//! - The first sink error is kept and returned after every worker has joined

use std::future::Future;
use std::ops::Range;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Buf;
use futures_util::StreamExt;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use super::error::DownloadError;
use super::http::HttpTransport;
use super::metadata::SessionMetadata;
use super::plan::{ChunkPlan, ChunkRange};
use super::reassembly::{ByteOffset, FetchResult, ReassemblyKey, ReassemblyWriter, WriteOutcome};
use super::retry::{RetryDecision, RetryPolicy, classify_error};
use super::sink::Sink;
use super::state::{DownloadState, SessionGate};
use super::target::DownloadTarget;

/// How a pool run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolOutcome {
    /// Every work item was fetched.
    Completed,
    /// The session was stopped.
    Stopped,
    /// A fetch exhausted its retries or a worker panicked.
    Failed,
}

/// Limits how far workers may run ahead of the writer.
#[async_trait]
pub trait ClaimWindow: Send + Sync {
    /// Resolves once `index` is fewer than `size` items past the first item
    /// the writer has not finished.
    async fn admit(&self, index: usize, size: usize);
}

/// [`ClaimWindow`] driven by a [`ReassemblyWriter`]'s progress.
pub struct WriterWindow<K> {
    progress: watch::Receiver<K>,
    index_of: Box<dyn Fn(K) -> usize + Send + Sync>,
}

impl<K: ReassemblyKey> WriterWindow<K> {
    /// `index_of` maps the writer's next key to the work item containing it.
    pub fn new(
        progress: watch::Receiver<K>,
        index_of: impl Fn(K) -> usize + Send + Sync + 'static,
    ) -> Self {
        Self {
            progress,
            index_of: Box::new(index_of),
        }
    }
}

#[async_trait]
impl<K: ReassemblyKey> ClaimWindow for WriterWindow<K> {
    async fn admit(&self, index: usize, size: usize) {
        let mut progress = self.progress.clone();
        // A closed channel means the writer is gone and the session is ending.
        let _ = progress
            .wait_for(|key| index < (self.index_of)(*key).saturating_add(size))
            .await;
    }
}

/// Runs work items across a fixed number of workers.
#[derive(Clone)]
pub struct WorkerPool {
    concurrency: usize,
    gate: SessionGate,
    window: Option<Arc<dyn ClaimWindow>>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("concurrency", &self.concurrency)
            .field("gate", &self.gate)
            .field("windowed", &self.window.is_some())
            .finish()
    }
}

impl WorkerPool {
    /// Creates a pool of `concurrency` workers (at least one).
    #[must_use]
    pub fn new(concurrency: usize, gate: SessionGate) -> Self {
        Self {
            concurrency: concurrency.max(1),
            gate,
            window: None,
        }
    }

    /// Holds claims back while the writer lags behind.
    #[must_use]
    pub fn with_window(mut self, window: Arc<dyn ClaimWindow>) -> Self {
        self.window = Some(window);
        self
    }

    /// Runs `fetch` for every index in `items`.
    ///
    /// # Errors
    ///
    /// Returns the first sink error raised by any fetch. Other failures end
    /// the run with [`PoolOutcome::Failed`].
    #[instrument(skip(self, fetch), fields(concurrency = self.concurrency))]
    pub async fn run<F, Fut>(
        &self,
        items: Range<usize>,
        fetch: F,
    ) -> Result<PoolOutcome, DownloadError>
    where
        F: Fn(usize) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), DownloadError>> + Send + 'static,
    {
        let workers = self.concurrency.min(items.len());
        debug!(workers, first = items.start, end = items.end, "starting workers");

        let fetch = Arc::new(fetch);
        let next_item = Arc::new(Mutex::new(items.start));
        let sink_error: Arc<Mutex<Option<DownloadError>>> = Arc::new(Mutex::new(None));
        let mut handles = Vec::with_capacity(workers);

        for worker in 0..workers {
            let fetch = Arc::clone(&fetch);
            let next_item = Arc::clone(&next_item);
            let sink_error = Arc::clone(&sink_error);
            let gate = self.gate.clone();
            let window = self.window.clone();
            let window_size = self.concurrency;
            let end = items.end;

            handles.push(tokio::spawn(async move {
                loop {
                    if gate.wait_while_paused().await.is_terminal() {
                        break;
                    }

                    let index = {
                        let mut next = next_item.lock().await;
                        if *next >= end {
                            break;
                        }
                        let claimed = *next;
                        *next += 1;
                        claimed
                    };
                    debug!(worker, index, "claimed work item");

                    if let Some(window) = &window {
                        tokio::select! {
                            () = window.admit(index, window_size) => {}
                            state = gate.terminated() => {
                                debug!(worker, index, %state, "claim abandoned");
                                break;
                            }
                        }
                    }

                    let work = (*fetch)(index);
                    let result = tokio::select! {
                        result = work => result,
                        state = gate.terminated() => {
                            debug!(worker, index, %state, "fetch cancelled");
                            break;
                        }
                    };

                    if let Err(error) = result {
                        if error.is_sink_error() {
                            warn!(worker, index, %error, "output write failed");
                            sink_error.lock().await.get_or_insert(error);
                        } else {
                            warn!(worker, index, %error, "work item failed after retries");
                        }
                        gate.fail();
                        break;
                    }
                }
            }));
        }

        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "worker panicked");
                self.gate.fail();
            }
        }

        if let Some(error) = sink_error.lock().await.take() {
            return Err(error);
        }

        Ok(match self.gate.state() {
            DownloadState::Stopped => PoolOutcome::Stopped,
            DownloadState::Failed => PoolOutcome::Failed,
            _ => PoolOutcome::Completed,
        })
    }
}

/// Fetches one planned byte range and streams it into the reassembly writer.
#[derive(Debug, Clone)]
pub struct ChunkFetcher {
    http: Arc<dyn HttpTransport>,
    target: Arc<DownloadTarget>,
    plan: Arc<ChunkPlan>,
    writer: Arc<ReassemblyWriter<ByteOffset>>,
    metadata: Arc<SessionMetadata>,
    retry: RetryPolicy,
    buffer_size: usize,
}

impl ChunkFetcher {
    /// Creates a fetcher for the chunks of `plan`.
    #[must_use]
    pub fn new(
        http: Arc<dyn HttpTransport>,
        target: Arc<DownloadTarget>,
        plan: Arc<ChunkPlan>,
        writer: Arc<ReassemblyWriter<ByteOffset>>,
        metadata: Arc<SessionMetadata>,
        retry: RetryPolicy,
        buffer_size: usize,
    ) -> Self {
        Self {
            http,
            target,
            plan,
            writer,
            metadata,
            retry,
            buffer_size: buffer_size.max(1),
        }
    }

    /// Fetches chunk `index`, retrying from the last received byte.
    ///
    /// # Errors
    ///
    /// Returns the last error once the retry budget is spent, or a sink error
    /// immediately.
    pub async fn fetch(&self, index: usize) -> Result<(), DownloadError> {
        let Some(chunk) = self.plan.chunk(index) else {
            return Ok(());
        };
        let expected_end = chunk.end.or(self.target.total_length);
        let mut offset = chunk.start;
        let mut attempt = 1;

        loop {
            let error = match self.fetch_from(chunk, expected_end, &mut offset).await {
                Ok(()) => return Ok(()),
                Err(error) if error.is_sink_error() => return Err(error),
                Err(error) => error,
            };

            match self.retry.should_retry(classify_error(&error), attempt) {
                RetryDecision::Retry {
                    delay,
                    attempt: next,
                } => {
                    warn!(
                        index,
                        offset,
                        attempt = next,
                        error = %error,
                        "retrying chunk"
                    );
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    attempt = next;
                }
                RetryDecision::DoNotRetry { reason } => {
                    debug!(index, %reason, "giving up on chunk");
                    return Err(error);
                }
            }
        }
    }

    async fn fetch_from(
        &self,
        chunk: ChunkRange,
        expected_end: Option<u64>,
        offset: &mut u64,
    ) -> Result<(), DownloadError> {
        let target = &self.target;
        let range = target
            .supports_ranges
            .then(|| chunk.request_range(*offset));
        let response = self
            .http
            .get(&target.url, &target.headers, target.referer.as_deref(), range)
            .await?;

        if range.is_some() && *offset > 0 && response.status != 206 {
            return Err(DownloadError::RangeIgnored {
                url: target.url.clone(),
                start: *offset,
            });
        }

        // Without ranges every retry restarts at byte 0; skip what is already delivered.
        let mut skip = if range.is_none() { *offset } else { 0 };
        let mut body = response.body;

        while let Some(piece) = body.next().await {
            let mut piece = piece?;
            if skip > 0 {
                let dropped = usize::try_from(skip).map_or(piece.len(), |s| s.min(piece.len()));
                piece.advance(dropped);
                skip -= dropped as u64;
            }
            if let Some(end) = chunk.end {
                let room = end.saturating_sub(*offset);
                if (piece.len() as u64) > room {
                    piece.truncate(usize::try_from(room).unwrap_or(0));
                }
            }

            while !piece.is_empty() {
                let part = piece.split_to(piece.len().min(self.buffer_size));
                let len = part.len() as u64;
                self.metadata.add_downloaded(len);
                let outcome = self
                    .writer
                    .on_result(FetchResult::new(ByteOffset(*offset), part))
                    .await?;
                if outcome == WriteOutcome::Aborted {
                    return Ok(());
                }
                *offset += len;
            }

            if chunk.end.is_some_and(|end| *offset >= end) {
                break;
            }
        }

        match expected_end {
            Some(expected) if *offset < expected => Err(DownloadError::IncompleteChunk {
                url: target.url.clone(),
                received: *offset,
                expected,
            }),
            _ => Ok(()),
        }
    }
}

/// Polls for the output file every `interval` and stops the session once it is gone.
pub fn spawn_watchdog(
    sink: Arc<dyn Sink>,
    path: PathBuf,
    gate: SessionGate,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = tokio::time::sleep(interval) => {
                    if !sink.exists(&path).await {
                        info!(path = %path.display(), "output file removed, stopping download");
                        gate.stop();
                        break;
                    }
                }
                _ = gate.terminated() => break,
            }
        }
    })
}
