//! Constants for the download module (timeouts, chunking, polling cadence).

use std::time::Duration;

/// Default HTTP connect timeout (30 seconds).
pub const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default HTTP read timeout between body reads (5 minutes).
pub const READ_TIMEOUT_SECS: u64 = 300;

/// One mebibyte.
pub const MIB: u64 = 1 << 20;

/// Default number of parallel connections per download.
pub const DEFAULT_CONNECTIONS: usize = 3;

/// Default number of downloads allowed to run at the same time.
pub const DEFAULT_MAX_CONCURRENT_DOWNLOADS: usize = 3;

/// Default bytes requested per ranged connection (10 MiB).
pub const DEFAULT_CHUNK_SIZE: u64 = 10 * MIB;

/// Chunk sizes at or below this are rejected; a connection per kilobyte is wasteful.
pub const MIN_CHUNK_SIZE: u64 = 1000;

/// Maximum payload delivered to the reassembly writer per read (8 KiB).
pub const DEFAULT_BUFFER_SIZE: usize = 8 * 1024;

/// Last byte requested by the range-support verification GET.
pub const PROBE_RANGE_LAST_BYTE: u64 = 1023;

/// Smallest last byte requested by the range-support verification GET.
pub const PROBE_RANGE_MIN_LAST_BYTE: u64 = 3;

/// Minimum size of a valid video download (10 MiB).
pub const VIDEO_MINIMUM_SIZE: u64 = 10 * MIB;

/// Minimum size of a valid subtitle download.
pub const SUBTITLE_MINIMUM_SIZE: u64 = 100;

/// Interval between output-file existence checks.
pub const WATCHDOG_INTERVAL: Duration = Duration::from_secs(5);

/// Minimum interval between throttled progress notifications.
pub const PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

/// Lower clamp for the elapsed window used in bytes-per-second estimates.
pub const SPEED_WINDOW_MIN: Duration = Duration::from_millis(100);

/// Upper clamp for the elapsed window used in bytes-per-second estimates.
pub const SPEED_WINDOW_MAX: Duration = Duration::from_secs(10);

/// Attempts per HLS segment before the session fails.
pub const SEGMENT_ATTEMPTS: u32 = 3;

/// Fixed delay between HLS segment attempts.
pub const SEGMENT_RETRY_DELAY: Duration = Duration::from_secs(3);

/// Maximum master → media playlist nesting followed by the resolver.
pub const MAX_PLAYLIST_DEPTH: u8 = 3;
