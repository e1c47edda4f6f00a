//! Byte and segment accounting shared by workers, the writer and progress reporting.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

const UNKNOWN: u64 = u64::MAX;
const UNKNOWN_SEGMENTS: usize = usize::MAX;

/// Counters for one session attempt.
///
/// `bytes_downloaded` counts payload on receipt; `bytes_written` counts what
/// reached the sink and never exceeds it.
#[derive(Debug)]
pub struct SessionMetadata {
    bytes_downloaded: AtomicU64,
    bytes_written: AtomicU64,
    total_bytes: AtomicU64,
    segments_downloaded: AtomicUsize,
    segments_written: AtomicUsize,
    segment_total: AtomicUsize,
}

impl Default for SessionMetadata {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionMetadata {
    /// Creates zeroed counters with unknown totals.
    #[must_use]
    pub fn new() -> Self {
        Self {
            bytes_downloaded: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            total_bytes: AtomicU64::new(UNKNOWN),
            segments_downloaded: AtomicUsize::new(0),
            segments_written: AtomicUsize::new(0),
            segment_total: AtomicUsize::new(UNKNOWN_SEGMENTS),
        }
    }

    /// Seeds counters with bytes already on disk from a previous attempt.
    pub fn seed_resumed(&self, bytes: u64) {
        self.bytes_downloaded.store(bytes, Ordering::Relaxed);
        self.bytes_written.store(bytes, Ordering::Relaxed);
    }

    /// Seeds segment counters when an HLS download resumes at `index`.
    pub fn seed_resumed_segments(&self, index: usize) {
        self.segments_downloaded.store(index, Ordering::Relaxed);
        self.segments_written.store(index, Ordering::Relaxed);
    }

    /// Records payload received from the network.
    pub fn add_downloaded(&self, bytes: u64) {
        self.bytes_downloaded.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Records payload flushed to the sink.
    pub fn add_written(&self, bytes: u64) {
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Records a completely fetched segment.
    pub fn add_segment_downloaded(&self) {
        self.segments_downloaded.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a segment flushed to the sink.
    pub fn add_segment_written(&self) {
        self.segments_written.fetch_add(1, Ordering::Relaxed);
    }

    /// Sets the total byte length.
    pub fn set_total_bytes(&self, total: Option<u64>) {
        self.total_bytes
            .store(total.unwrap_or(UNKNOWN), Ordering::Relaxed);
    }

    /// Sets the number of HLS segments.
    pub fn set_segment_total(&self, total: usize) {
        self.segment_total.store(total, Ordering::Relaxed);
    }

    /// Bytes received so far.
    #[must_use]
    pub fn bytes_downloaded(&self) -> u64 {
        self.bytes_downloaded.load(Ordering::Relaxed)
    }

    /// Bytes flushed to the sink so far.
    #[must_use]
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    /// Declared total, when known.
    #[must_use]
    pub fn total_bytes(&self) -> Option<u64> {
        match self.total_bytes.load(Ordering::Relaxed) {
            UNKNOWN => None,
            total => Some(total),
        }
    }

    /// Segments fetched so far.
    #[must_use]
    pub fn segments_downloaded(&self) -> usize {
        self.segments_downloaded.load(Ordering::Relaxed)
    }

    /// Segments flushed so far.
    #[must_use]
    pub fn segments_written(&self) -> usize {
        self.segments_written.load(Ordering::Relaxed)
    }

    /// Number of HLS segments, when known.
    #[must_use]
    pub fn segment_total(&self) -> Option<usize> {
        match self.segment_total.load(Ordering::Relaxed) {
            UNKNOWN_SEGMENTS => None,
            total => Some(total),
        }
    }

    /// Best estimate of the final size.
    ///
    /// The declared total when known; for HLS the average segment size times
    /// the segment count once at least one segment has arrived.
    #[must_use]
    pub fn approx_total_bytes(&self) -> Option<u64> {
        if let Some(total) = self.total_bytes() {
            return Some(total);
        }
        let segment_total = self.segment_total()?;
        let downloaded = self.segments_downloaded();
        if downloaded == 0 {
            return None;
        }
        let bytes = u128::from(self.bytes_downloaded());
        let estimate = bytes * segment_total as u128 / downloaded as u128;
        u64::try_from(estimate).ok()
    }
}
