//! Error types for the download module.
//!
//! This module defines structured errors for all download operations,
//! providing context-rich error messages for debugging and user feedback.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while probing, fetching, or persisting a download.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Network-level error (DNS resolution, connection refused, TLS errors, etc.)
    #[error("network error downloading {url}: {source}")]
    Network {
        /// The URL that failed to download.
        url: String,
        /// The underlying network error.
        #[source]
        source: reqwest::Error,
    },

    /// Request timed out before completion.
    #[error("timeout downloading {url}")]
    Timeout {
        /// The URL that timed out.
        url: String,
    },

    /// HTTP error response (4xx client errors, 5xx server errors).
    #[error("HTTP {status} downloading {url}")]
    HttpStatus {
        /// The URL that returned an error status.
        url: String,
        /// The HTTP status code.
        status: u16,
    },

    /// File system error on the output sink (create, write, delete).
    #[error("IO error writing to {path}: {source}")]
    Io {
        /// The file path where the error occurred.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The output sink cannot be constructed (missing or unusable root directory).
    #[error("output location {path} is unavailable: {reason}")]
    SinkUnavailable {
        /// The directory or file that could not be prepared.
        path: PathBuf,
        /// Why the location is unusable.
        reason: String,
    },

    /// The provided URL is malformed or invalid.
    #[error("invalid URL: {url}")]
    InvalidUrl {
        /// The invalid URL string.
        url: String,
    },

    /// The link type cannot be downloaded by this engine (DASH, magnet, torrent).
    #[error("unsupported link type {kind} for {url}")]
    UnsupportedLink {
        /// The rejected URL.
        url: String,
        /// Human-readable link kind.
        kind: String,
    },

    /// The playlist could not be fetched into a usable segment list.
    #[error("playlist error for {url}: {reason}")]
    Playlist {
        /// The playlist URL.
        url: String,
        /// What was wrong with it.
        reason: String,
    },

    /// A segment could not be decrypted.
    #[error("decryption failed for {url}: {reason}")]
    Decryption {
        /// The segment or key URL.
        url: String,
        /// Cipher failure description.
        reason: String,
    },

    /// The server answered a ranged request with the full body.
    #[error("server ignored range request for {url} starting at byte {start}")]
    RangeIgnored {
        /// The requested URL.
        url: String,
        /// First byte that was requested.
        start: u64,
    },

    /// The response body ended before the requested chunk was complete.
    #[error("response for {url} ended at byte {received} before chunk end {expected}")]
    IncompleteChunk {
        /// The requested URL.
        url: String,
        /// First byte that was not received.
        received: u64,
        /// Exclusive end of the chunk.
        expected: u64,
    },

    /// A segment or response body contained no data.
    #[error("empty response body from {url}")]
    EmptyBody {
        /// The requested URL.
        url: String,
    },

    /// Resume checkpoint persistence failed.
    #[error("checkpoint store error for download {id}: {message}")]
    Checkpoint {
        /// Download id the checkpoint belongs to.
        id: String,
        /// Underlying store error text.
        message: String,
    },

    /// A configuration value is outside its accepted range.
    #[error("invalid download configuration `{field}`: {reason}")]
    InvalidConfig {
        /// Offending field.
        field: &'static str,
        /// Accepted range or constraint.
        reason: String,
    },
}

impl DownloadError {
    /// Creates a network error from a reqwest error.
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Network {
            url: url.into(),
            source,
        }
    }

    /// Creates an HTTP status error.
    pub fn http_status(url: impl Into<String>, status: u16) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
        }
    }

    /// Creates a timeout error.
    pub fn timeout(url: impl Into<String>) -> Self {
        Self::Timeout { url: url.into() }
    }

    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates a sink-unavailable error.
    pub fn sink_unavailable(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::SinkUnavailable {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Creates an invalid URL error.
    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }

    /// Creates an unsupported link error.
    pub fn unsupported_link(url: impl Into<String>, kind: impl Into<String>) -> Self {
        Self::UnsupportedLink {
            url: url.into(),
            kind: kind.into(),
        }
    }

    /// Creates a playlist error.
    pub fn playlist(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Playlist {
            url: url.into(),
            reason: reason.into(),
        }
    }

    /// Creates a decryption error.
    pub fn decryption(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Decryption {
            url: url.into(),
            reason: reason.into(),
        }
    }

    /// Creates a checkpoint store error.
    pub fn checkpoint(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Checkpoint {
            id: id.into(),
            message: message.into(),
        }
    }

    /// Creates an invalid configuration error.
    pub fn invalid_config(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field,
            reason: reason.into(),
        }
    }

    /// Returns true when the error originates from the output sink.
    ///
    /// Sink failures are environment problems (disk full, permissions) and are
    /// returned to the caller instead of being folded into a session status.
    #[must_use]
    pub fn is_sink_error(&self) -> bool {
        matches!(self, Self::Io { .. })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_download_error_timeout_display() {
        let error = DownloadError::timeout("https://example.com/video.mp4");
        assert!(error.to_string().contains("timeout"));
        assert!(error.to_string().contains("https://example.com/video.mp4"));
    }

    #[test]
    fn test_download_error_http_status_display() {
        let error = DownloadError::http_status("https://example.com/video.mp4", 404);
        let msg = error.to_string();
        assert!(msg.contains("404"), "Expected '404' in: {msg}");
        assert!(
            msg.contains("https://example.com/video.mp4"),
            "Expected URL in: {msg}"
        );
    }

    #[test]
    fn test_download_error_io_is_sink_error() {
        let io_error = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "access denied");
        let error = DownloadError::io(PathBuf::from("/tmp/out.mp4"), io_error);
        assert!(error.to_string().contains("/tmp/out.mp4"));
        assert!(error.is_sink_error());
        assert!(!DownloadError::timeout("https://example.com").is_sink_error());
    }

    #[test]
    fn test_download_error_range_ignored_display() {
        let error = DownloadError::RangeIgnored {
            url: "https://example.com/a.mp4".to_string(),
            start: 4096,
        };
        let msg = error.to_string();
        assert!(msg.contains("ignored range"), "unexpected message: {msg}");
        assert!(msg.contains("4096"));
    }

    #[test]
    fn test_download_error_unsupported_link_display() {
        let error = DownloadError::unsupported_link("magnet:?xt=urn:btih:abc", "magnet");
        let msg = error.to_string();
        assert!(msg.contains("unsupported link type magnet"), "unexpected: {msg}");
    }

    #[test]
    fn test_download_error_invalid_config_display() {
        let error = DownloadError::invalid_config("connections", "must be at least 1");
        assert_eq!(
            error.to_string(),
            "invalid download configuration `connections`: must be at least 1"
        );
    }
}
