//! Download request and target descriptions.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use url::Url;

use super::probe::ProbeResult;

/// How a link is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkKind {
    /// A single file fetched with (optionally ranged) GET requests.
    Progressive,
    /// An HLS playlist (`.m3u8`).
    Hls,
    /// A DASH manifest (`.mpd`); not downloadable by this engine.
    Dash,
    /// A magnet URI; not downloadable by this engine.
    Magnet,
    /// A torrent file; not downloadable by this engine.
    Torrent,
}

impl LinkKind {
    /// Infers the link kind from the URL scheme and path extension.
    #[must_use]
    pub fn infer(url: &str) -> Self {
        if url.trim_start().to_ascii_lowercase().starts_with("magnet:") {
            return Self::Magnet;
        }
        let path = Url::parse(url)
            .map(|parsed| parsed.path().to_ascii_lowercase())
            .unwrap_or_else(|_| url.to_ascii_lowercase());
        if path.ends_with(".m3u8") {
            Self::Hls
        } else if path.ends_with(".mpd") {
            Self::Dash
        } else if path.ends_with(".torrent") {
            Self::Torrent
        } else {
            Self::Progressive
        }
    }

    /// Whether this engine can fetch links of this kind.
    #[must_use]
    pub fn is_supported(self) -> bool {
        matches!(self, Self::Progressive | Self::Hls)
    }
}

impl fmt::Display for LinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Progressive => "progressive",
            Self::Hls => "hls",
            Self::Dash => "dash",
            Self::Magnet => "magnet",
            Self::Torrent => "torrent",
        };
        f.write_str(name)
    }
}

/// Caller-owned description of one mirror before probing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadRequest {
    /// Absolute URL of the file or playlist.
    pub url: String,
    /// Optional `Referer` header value.
    pub referer: Option<String>,
    /// Extra request headers.
    pub headers: BTreeMap<String, String>,
    /// Link kind; inferred from the URL unless set explicitly.
    pub kind: LinkKind,
}

impl DownloadRequest {
    /// Creates a request, inferring the link kind from `url`.
    pub fn new(url: impl Into<String>) -> Self {
        let url = url.into();
        let kind = LinkKind::infer(&url);
        Self {
            url,
            referer: None,
            headers: BTreeMap::new(),
            kind,
        }
    }

    /// Sets the referer.
    #[must_use]
    pub fn with_referer(mut self, referer: impl Into<String>) -> Self {
        self.referer = Some(referer.into());
        self
    }

    /// Adds a request header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Overrides the inferred link kind.
    #[must_use]
    pub fn with_kind(mut self, kind: LinkKind) -> Self {
        self.kind = kind;
        self
    }
}

/// Immutable description of what one attempt fetches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadTarget {
    /// Absolute URL.
    pub url: String,
    /// Optional `Referer` header value.
    pub referer: Option<String>,
    /// Extra request headers.
    pub headers: BTreeMap<String, String>,
    /// Total length in bytes, when the server declared it.
    pub total_length: Option<u64>,
    /// Whether the server honours byte ranges.
    pub supports_ranges: bool,
}

impl DownloadTarget {
    /// Combines a request with what the prober learned about it.
    #[must_use]
    pub fn from_probe(request: &DownloadRequest, probe: ProbeResult) -> Self {
        Self {
            url: request.url.clone(),
            referer: request.referer.clone(),
            headers: request.headers.clone(),
            total_length: probe.total_length,
            supports_ranges: probe.supports_ranges,
        }
    }
}
