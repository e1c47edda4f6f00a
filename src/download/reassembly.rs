//! Ordered reassembly writer.
//!
//! Workers finish out of order; the writer puts their payloads back in key
//! order. A result whose key matches `next_key` is written at once, anything
//! else waits in a pending map until the gap before it is filled. All state
//! lives behind one async mutex, so the sink only ever sees sequential writes.
//!
//! A pending entry is a run of adjacent payloads: a result that continues an
//! existing run is appended to it, so a chunk streamed in many reads occupies
//! one entry. Together with the pool's claim window this keeps the map at most
//! as large as the worker count.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{Mutex, watch};
use tracing::{trace, warn};

use super::error::DownloadError;
use super::metadata::SessionMetadata;
use super::sink::SinkWriter;
use super::state::SessionGate;

/// Ordering key of a [`FetchResult`].
pub trait ReassemblyKey: Ord + Copy + Debug + Send + Sync + 'static {
    /// Key that follows a payload of `len` bytes written at `self`.
    #[must_use]
    fn advance(self, len: usize) -> Self;

    /// Whether each key is a whole HLS segment.
    fn is_segment() -> bool {
        false
    }
}

/// Byte offset key for progressive downloads; advances by payload length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ByteOffset(pub u64);

impl ReassemblyKey for ByteOffset {
    fn advance(self, len: usize) -> Self {
        Self(self.0 + len as u64)
    }
}

/// Segment index key for HLS downloads; advances by one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SegmentIndex(pub usize);

impl ReassemblyKey for SegmentIndex {
    fn advance(self, _len: usize) -> Self {
        Self(self.0 + 1)
    }

    fn is_segment() -> bool {
        true
    }
}

/// A payload tagged with its position in the output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResult<K> {
    /// Position in the output.
    pub key: K,
    /// Bytes to write.
    pub payload: Bytes,
}

impl<K> FetchResult<K> {
    /// Creates a result.
    pub fn new(key: K, payload: Bytes) -> Self {
        Self { key, payload }
    }
}

/// What happened to a submitted result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Written, possibly along with buffered successors.
    Written,
    /// Held until the gap before it is filled.
    Buffered,
    /// Dropped because the session stopped or failed.
    Aborted,
    /// Empty payload or a key already written.
    Ignored,
}

/// Notified after every flush, while the writer lock is still held.
#[async_trait]
pub trait FlushObserver<K>: Send + Sync {
    /// `next_key` is the first key not yet written.
    async fn on_flush(&self, next_key: K, bytes_written: u64);
}

/// Adjacent buffered payloads; `end` is the key right after the last one.
struct PendingRun<K> {
    parts: Vec<Bytes>,
    end: K,
}

struct ReassemblyState<K> {
    next_key: K,
    pending: BTreeMap<K, PendingRun<K>>,
    writer: Box<dyn SinkWriter>,
}

/// Buffers `payload` at `key`, extending the run that ends at `key` if any
/// and absorbing the run that starts where it ends.
fn buffer_run<K: ReassemblyKey>(
    pending: &mut BTreeMap<K, PendingRun<K>>,
    key: K,
    payload: Bytes,
) {
    let end = key.advance(payload.len());
    let previous = pending
        .range(..key)
        .next_back()
        .filter(|(_, run)| run.end == key)
        .map(|(run_key, _)| *run_key);

    let run_key = match previous {
        Some(run_key) => {
            if let Some(run) = pending.get_mut(&run_key) {
                run.parts.push(payload);
                run.end = end;
            }
            run_key
        }
        None => {
            pending.insert(key, PendingRun {
                parts: vec![payload],
                end,
            });
            key
        }
    };

    if let Some(following) = pending.remove(&end) {
        if let Some(run) = pending.get_mut(&run_key) {
            run.parts.extend(following.parts);
            run.end = following.end;
        }
    }
}

/// Writes results to a sink in strict key order.
pub struct ReassemblyWriter<K: ReassemblyKey> {
    state: Mutex<ReassemblyState<K>>,
    progress: watch::Sender<K>,
    gate: SessionGate,
    metadata: Arc<SessionMetadata>,
    observer: Option<Arc<dyn FlushObserver<K>>>,
}

impl<K: ReassemblyKey> Debug for ReassemblyWriter<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReassemblyWriter")
            .field("gate", &self.gate)
            .finish_non_exhaustive()
    }
}

impl<K: ReassemblyKey> ReassemblyWriter<K> {
    /// Creates a writer expecting `first_key` next.
    pub fn new(
        first_key: K,
        writer: Box<dyn SinkWriter>,
        gate: SessionGate,
        metadata: Arc<SessionMetadata>,
    ) -> Self {
        let (progress, _) = watch::channel(first_key);
        Self {
            state: Mutex::new(ReassemblyState {
                next_key: first_key,
                pending: BTreeMap::new(),
                writer,
            }),
            progress,
            gate,
            metadata,
            observer: None,
        }
    }

    /// Registers the flush observer.
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn FlushObserver<K>>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Accepts one result from any worker.
    ///
    /// Waits while the session is paused, holding the writer lock so later
    /// results queue behind it.
    ///
    /// # Errors
    ///
    /// Returns the sink error when a write or flush fails.
    pub async fn on_result(&self, result: FetchResult<K>) -> Result<WriteOutcome, DownloadError> {
        if result.payload.is_empty() {
            return Ok(WriteOutcome::Ignored);
        }

        let mut state = self.state.lock().await;
        if self.gate.wait_while_paused().await.is_terminal() {
            trace!(key = ?result.key, "session over, dropping result");
            return Ok(WriteOutcome::Aborted);
        }

        let outcome = if result.key == state.next_key {
            self.write_one(&mut state, result.payload).await?;
            WriteOutcome::Written
        } else if result.key < state.next_key {
            warn!(key = ?result.key, next = ?state.next_key, "result for already written key");
            return Ok(WriteOutcome::Ignored);
        } else {
            trace!(key = ?result.key, next = ?state.next_key, "buffering early result");
            buffer_run(&mut state.pending, result.key, result.payload);
            WriteOutcome::Buffered
        };

        if outcome == WriteOutcome::Written {
            while let Some(run) = {
                let next = state.next_key;
                state.pending.remove(&next)
            } {
                for payload in run.parts {
                    self.write_one(&mut state, payload).await?;
                }
            }
            state.writer.flush().await?;

            if let Some(observer) = &self.observer {
                observer
                    .on_flush(state.next_key, self.metadata.bytes_written())
                    .await;
            }
        }

        Ok(outcome)
    }

    async fn write_one(
        &self,
        state: &mut ReassemblyState<K>,
        payload: Bytes,
    ) -> Result<(), DownloadError> {
        state.writer.write_all(&payload).await?;
        state.next_key = state.next_key.advance(payload.len());
        self.metadata.add_written(payload.len() as u64);
        if K::is_segment() {
            self.metadata.add_segment_written();
        }
        self.gate.mark_downloading();
        self.progress.send_replace(state.next_key);
        Ok(())
    }

    /// Receiver that sees `next_key` after every write.
    #[must_use]
    pub fn progress(&self) -> watch::Receiver<K> {
        self.progress.subscribe()
    }

    /// First key not yet written.
    pub async fn next_key(&self) -> K {
        self.state.lock().await.next_key
    }

    /// Number of pending runs.
    pub async fn pending_len(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    /// Flushes the sink and returns how many results are still buffered.
    ///
    /// # Errors
    ///
    /// Returns the sink error when the flush fails.
    pub async fn finish(&self) -> Result<usize, DownloadError> {
        let mut state = self.state.lock().await;
        state.writer.flush().await?;
        Ok(state.pending.len())
    }
}
