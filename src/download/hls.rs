//! HLS segment resolver.
//!
//! Turns a master or media playlist URL into an ordered list of segments and
//! fetches each segment as plain (decrypted) bytes.
//!
//! # Variant selection
//!
//! Master playlists are followed at most three levels deep. Trick-play
//! (I-frame) variants are dropped; when audio is required, variants that
//! reference a separate audio group are dropped too. The remaining variants
//! are ranked by `width * height * 1000 + bandwidth`.

mod crypto;

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use m3u8_rs::{KeyMethod, MasterPlaylist, MediaPlaylist, Playlist, VariantStream};
use tracing::{debug, info, instrument, warn};
use url::Url;

pub use crypto::SegmentKey;

use super::constants::MAX_PLAYLIST_DEPTH;
use super::error::DownloadError;
use super::http::HttpTransport;
use super::retry::{RetryDecision, RetryPolicy, classify_error};
use super::target::{DownloadRequest, LinkKind};

/// One media segment, in playlist order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HlsSegment {
    /// Position in the output.
    pub index: usize,
    /// Absolute segment URL.
    pub url: String,
    /// Media sequence number.
    pub sequence: u64,
    /// Decryption parameters for encrypted segments.
    pub key: Option<SegmentKey>,
}

/// A resolved media playlist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HlsMedia {
    /// URL of the media playlist the segments came from.
    pub playlist_url: String,
    /// Segments in playback order.
    pub segments: Vec<HlsSegment>,
}

impl HlsMedia {
    /// Number of segments.
    #[must_use]
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// True when there are no segments.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}

/// Variant selection preferences.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VariantPreference {
    /// Pick the highest ranked variant (otherwise the lowest).
    pub select_best: bool,
    /// Only accept variants with muxed audio.
    pub require_audio: bool,
}

impl Default for VariantPreference {
    fn default() -> Self {
        Self {
            select_best: true,
            require_audio: true,
        }
    }
}

/// Resolves playlists and fetches segments over an [`HttpTransport`].
#[derive(Clone)]
pub struct HlsResolver {
    http: Arc<dyn HttpTransport>,
    preference: VariantPreference,
    retry: RetryPolicy,
}

impl std::fmt::Debug for HlsResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HlsResolver")
            .field("preference", &self.preference)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl HlsResolver {
    /// Creates a resolver with the default segment retry policy.
    #[must_use]
    pub fn new(http: Arc<dyn HttpTransport>) -> Self {
        Self {
            http,
            preference: VariantPreference::default(),
            retry: RetryPolicy::segment_default(),
        }
    }

    /// Overrides variant selection.
    #[must_use]
    pub fn with_preference(mut self, preference: VariantPreference) -> Self {
        self.preference = preference;
        self
    }

    /// Overrides the retry policy for playlists, keys and segments.
    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Resolves `request` to its media segments.
    ///
    /// # Errors
    ///
    /// - [`DownloadError::UnsupportedLink`] for DASH, magnet and torrent links
    ///   (before any request is made)
    /// - [`DownloadError::Playlist`] for unparsable or empty playlists and
    ///   unsupported encryption methods
    /// - network errors once the retry budget is spent
    #[instrument(skip(self, request), fields(url = %request.url))]
    pub async fn resolve(&self, request: &DownloadRequest) -> Result<HlsMedia, DownloadError> {
        if matches!(
            request.kind,
            LinkKind::Dash | LinkKind::Magnet | LinkKind::Torrent
        ) {
            return Err(DownloadError::unsupported_link(
                &request.url,
                request.kind.to_string(),
            ));
        }

        let mut url = request.url.clone();
        for depth in 0..MAX_PLAYLIST_DEPTH {
            let body = self.fetch_bytes(request, &url).await?;
            match m3u8_rs::parse_playlist_res(&body) {
                Ok(Playlist::MasterPlaylist(master)) => {
                    let variant = select_variant(&master, self.preference).ok_or_else(|| {
                        DownloadError::playlist(&url, "master playlist has no usable variants")
                    })?;
                    let next = join_url(&url, &variant.uri)?;
                    debug!(depth, variant = %next, bandwidth = variant.bandwidth, "selected variant");
                    url = next;
                }
                Ok(Playlist::MediaPlaylist(media)) => {
                    return self.build_media(request, &url, &media).await;
                }
                Err(e) => {
                    return Err(DownloadError::playlist(&url, format!("unparsable playlist: {e}")));
                }
            }
        }

        Err(DownloadError::playlist(
            &request.url,
            format!("master playlists nested deeper than {MAX_PLAYLIST_DEPTH}"),
        ))
    }

    async fn build_media(
        &self,
        request: &DownloadRequest,
        playlist_url: &str,
        playlist: &MediaPlaylist,
    ) -> Result<HlsMedia, DownloadError> {
        if playlist.segments.is_empty() {
            return Err(DownloadError::playlist(playlist_url, "playlist has no segments"));
        }

        let mut keys: HashMap<String, [u8; 16]> = HashMap::new();
        let mut current: Option<(String, Option<String>)> = None;
        let mut segments = Vec::with_capacity(playlist.segments.len());

        for (index, segment) in playlist.segments.iter().enumerate() {
            if let Some(key) = &segment.key {
                current = match &key.method {
                    KeyMethod::None => None,
                    KeyMethod::AES128 => {
                        let uri = key.uri.as_deref().ok_or_else(|| {
                            DownloadError::playlist(playlist_url, "AES-128 key without URI")
                        })?;
                        Some((join_url(playlist_url, uri)?, key.iv.clone()))
                    }
                    other => {
                        return Err(DownloadError::playlist(
                            playlist_url,
                            format!("unsupported encryption method {other:?}"),
                        ));
                    }
                };
            }

            let sequence = playlist.media_sequence + index as u64;
            let key = match &current {
                None => None,
                Some((key_url, iv)) => {
                    let key = match keys.get(key_url) {
                        Some(key) => *key,
                        None => {
                            let key = self.fetch_key(request, key_url).await?;
                            keys.insert(key_url.clone(), key);
                            key
                        }
                    };
                    let iv = match iv {
                        Some(iv) => crypto::parse_iv(iv)
                            .map_err(|reason| DownloadError::playlist(playlist_url, reason))?,
                        None => crypto::sequence_iv(sequence),
                    };
                    Some(SegmentKey { key, iv })
                }
            };

            segments.push(HlsSegment {
                index,
                url: join_url(playlist_url, &segment.uri)?,
                sequence,
                key,
            });
        }

        info!(
            segments = segments.len(),
            encrypted = !keys.is_empty(),
            "resolved media playlist"
        );
        Ok(HlsMedia {
            playlist_url: playlist_url.to_string(),
            segments,
        })
    }

    async fn fetch_key(
        &self,
        request: &DownloadRequest,
        key_url: &str,
    ) -> Result<[u8; 16], DownloadError> {
        let body = self.fetch_bytes(request, key_url).await?;
        <[u8; 16]>::try_from(body.as_ref()).map_err(|_| {
            DownloadError::decryption(
                key_url,
                format!("expected a 16-byte key, got {} bytes", body.len()),
            )
        })
    }

    /// Fetches one segment and decrypts it when needed.
    ///
    /// An empty body counts as a failed attempt.
    ///
    /// # Errors
    ///
    /// Returns the last error once the retry budget is spent.
    #[instrument(level = "debug", skip(self, request, segment), fields(index = segment.index))]
    pub async fn fetch_segment(
        &self,
        request: &DownloadRequest,
        segment: &HlsSegment,
    ) -> Result<Bytes, DownloadError> {
        let body = self.fetch_bytes(request, &segment.url).await?;
        match &segment.key {
            None => Ok(body),
            Some(key) => {
                let key = *key;
                let url = segment.url.clone();
                tokio::task::spawn_blocking(move || crypto::decrypt_segment(&url, &body, &key))
                    .await
                    .map_err(|e| DownloadError::decryption(&segment.url, e.to_string()))?
            }
        }
    }

    async fn fetch_bytes(&self, request: &DownloadRequest, url: &str) -> Result<Bytes, DownloadError> {
        let mut attempt = 1;
        loop {
            let error = match self.fetch_once(request, url).await {
                Ok(body) => return Ok(body),
                Err(error) => error,
            };
            match self.retry.should_retry(classify_error(&error), attempt) {
                RetryDecision::Retry {
                    delay,
                    attempt: next,
                } => {
                    warn!(url, attempt = next, error = %error, "retrying HLS request");
                    tokio::time::sleep(delay).await;
                    attempt = next;
                }
                RetryDecision::DoNotRetry { .. } => return Err(error),
            }
        }
    }

    async fn fetch_once(&self, request: &DownloadRequest, url: &str) -> Result<Bytes, DownloadError> {
        let response = self
            .http
            .get(url, &request.headers, request.referer.as_deref(), None)
            .await?;
        let body = response.collect_body().await?;
        if body.is_empty() {
            return Err(DownloadError::EmptyBody {
                url: url.to_string(),
            });
        }
        Ok(body)
    }
}

/// Picks a variant according to `preference`.
#[must_use]
pub fn select_variant(
    master: &MasterPlaylist,
    preference: VariantPreference,
) -> Option<&VariantStream> {
    let candidates = master
        .variants
        .iter()
        .filter(|v| !v.is_i_frame)
        .filter(|v| !preference.require_audio || v.audio.is_none());

    if preference.select_best {
        candidates.max_by_key(|v| variant_score(v))
    } else {
        candidates.min_by_key(|v| variant_score(v))
    }
}

fn variant_score(variant: &VariantStream) -> u64 {
    let pixels = variant
        .resolution
        .as_ref()
        .map_or(0, |r| r.width.saturating_mul(r.height));
    let bandwidth = variant.average_bandwidth.unwrap_or(variant.bandwidth);
    pixels.saturating_mul(1000).saturating_add(bandwidth)
}

fn join_url(base: &str, reference: &str) -> Result<String, DownloadError> {
    let base = Url::parse(base).map_err(|_| DownloadError::invalid_url(base))?;
    base.join(reference)
        .map(String::from)
        .map_err(|_| DownloadError::invalid_url(reference))
}
