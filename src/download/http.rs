//! HTTP transport used by the prober, the chunk workers and the HLS resolver.
//!
//! [`HttpTransport`] is the seam the rest of the download module talks to;
//! [`HttpClient`] implements it with `reqwest` and streams response bodies as
//! [`Bytes`] so callers can split them without copying.

use std::collections::BTreeMap;
use std::fmt;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt, stream};
use reqwest::Client;
use reqwest::header::{
    ACCEPT_ENCODING, CONTENT_LENGTH, CONTENT_RANGE, HeaderMap, HeaderValue, RANGE, REFERER,
};
use tracing::{debug, instrument};

use super::constants::{CONNECT_TIMEOUT_SECS, READ_TIMEOUT_SECS};
use super::error::DownloadError;
use crate::user_agent;

/// Response body as a stream of reference-counted byte buffers.
pub type BodyStream = Pin<Box<dyn Stream<Item = Result<Bytes, DownloadError>> + Send>>;

/// Inclusive byte range sent in a `Range` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    /// First byte requested.
    pub first: u64,
    /// Last byte requested (inclusive); `None` reads until EOF.
    pub last: Option<u64>,
}

impl ByteRange {
    /// Range from `first` to the end of the resource.
    #[must_use]
    pub fn from(first: u64) -> Self {
        Self { first, last: None }
    }

    /// Range covering `first..=last`.
    #[must_use]
    pub fn inclusive(first: u64, last: u64) -> Self {
        Self {
            first,
            last: Some(last),
        }
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.last {
            Some(last) => write!(f, "bytes={}-{last}", self.first),
            None => write!(f, "bytes={}-", self.first),
        }
    }
}

/// A successful (2xx) HTTP response with a streaming body.
pub struct HttpResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response headers.
    pub headers: HeaderMap,
    /// Body stream; empty for HEAD responses.
    pub body: BodyStream,
}

impl fmt::Debug for HttpResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

impl HttpResponse {
    /// Builds a response whose body is a fixed list of buffers.
    #[must_use]
    pub fn from_parts(status: u16, headers: HeaderMap, chunks: Vec<Bytes>) -> Self {
        Self {
            status,
            headers,
            body: Box::pin(stream::iter(chunks.into_iter().map(Ok))),
        }
    }

    /// Returns a header as a string, if present and valid UTF-8.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Parses `Content-Length`; zero and unparsable values are treated as unknown.
    #[must_use]
    pub fn content_length(&self) -> Option<u64> {
        self.header(CONTENT_LENGTH.as_str())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .filter(|len| *len > 0)
    }

    /// Parses the total from `Content-Range: bytes a-b/total`.
    ///
    /// Returns `None` for `*` totals or non-byte units.
    #[must_use]
    pub fn content_range_total(&self) -> Option<u64> {
        self.header(CONTENT_RANGE.as_str())
            .and_then(parse_content_range_total)
    }

    /// Reads the whole body into one buffer.
    ///
    /// # Errors
    ///
    /// Returns the first error produced by the body stream.
    pub async fn collect_body(mut self) -> Result<Bytes, DownloadError> {
        let mut buf = Vec::new();
        while let Some(chunk) = self.body.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(Bytes::from(buf))
    }
}

/// Parses the total length out of a `Content-Range` header value.
#[must_use]
pub fn parse_content_range_total(value: &str) -> Option<u64> {
    let rest = value.trim().strip_prefix("bytes")?.trim_start();
    let (_, total) = rest.split_once('/')?;
    let total = total.trim();
    if total == "*" {
        return None;
    }
    total.parse::<u64>().ok().filter(|len| *len > 0)
}

/// Minimal HTTP surface needed by the downloader.
///
/// Implementations return `Err(DownloadError::HttpStatus)` for non-2xx answers.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Issues a GET, optionally restricted to a byte range.
    async fn get(
        &self,
        url: &str,
        headers: &BTreeMap<String, String>,
        referer: Option<&str>,
        range: Option<ByteRange>,
    ) -> Result<HttpResponse, DownloadError>;

    /// Issues a HEAD request.
    async fn head(
        &self,
        url: &str,
        headers: &BTreeMap<String, String>,
        referer: Option<&str>,
    ) -> Result<HttpResponse, DownloadError>;
}

impl fmt::Debug for dyn HttpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("dyn HttpTransport")
    }
}

/// `reqwest`-backed [`HttpTransport`].
///
/// Create once and share; the inner client pools connections.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
}

impl HttpClient {
    /// Creates a client with default timeouts (30 s connect, 5 min between reads).
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::InvalidConfig`] if the TLS backend fails to initialize.
    pub fn new() -> Result<Self, DownloadError> {
        Self::with_timeouts(CONNECT_TIMEOUT_SECS, READ_TIMEOUT_SECS)
    }

    /// Creates a client with explicit timeout values.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::InvalidConfig`] if the client cannot be built.
    pub fn with_timeouts(
        connect_timeout_secs: u64,
        read_timeout_secs: u64,
    ) -> Result<Self, DownloadError> {
        let mut default_headers = HeaderMap::new();
        // Ranges must address the stored representation, not a compressed one.
        default_headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("identity"));

        let client = Client::builder()
            .connect_timeout(Duration::from_secs(connect_timeout_secs))
            .read_timeout(Duration::from_secs(read_timeout_secs))
            .default_headers(default_headers)
            .user_agent(user_agent::default_download_user_agent())
            .build()
            .map_err(|e| DownloadError::invalid_config("http_client", e.to_string()))?;
        Ok(Self { client })
    }

    /// Returns a reference to the inner reqwest client.
    #[must_use]
    pub fn inner(&self) -> &Client {
        &self.client
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
        url: &str,
        headers: &BTreeMap<String, String>,
        referer: Option<&str>,
    ) -> Result<reqwest::Response, DownloadError> {
        let mut request = request;
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(referer) = referer {
            request = request.header(REFERER, referer);
        }

        let response = request.send().await.map_err(|e| map_reqwest_error(url, e))?;
        let status = response.status();
        if !status.is_success() {
            debug!(status = status.as_u16(), "non-success response");
            return Err(DownloadError::http_status(url, status.as_u16()));
        }
        Ok(response)
    }
}

#[async_trait]
impl HttpTransport for HttpClient {
    #[instrument(level = "debug", skip(self, headers), fields(range = ?range))]
    async fn get(
        &self,
        url: &str,
        headers: &BTreeMap<String, String>,
        referer: Option<&str>,
        range: Option<ByteRange>,
    ) -> Result<HttpResponse, DownloadError> {
        let mut request = self.client.get(url);
        if let Some(range) = range {
            request = request.header(RANGE, range.to_string());
        }
        let response = self.send(request, url, headers, referer).await?;

        let status = response.status().as_u16();
        let response_headers = response.headers().clone();
        let owned_url = url.to_string();
        let body = response
            .bytes_stream()
            .map(move |chunk| chunk.map_err(|e| map_reqwest_error(&owned_url, e)));

        Ok(HttpResponse {
            status,
            headers: response_headers,
            body: Box::pin(body),
        })
    }

    #[instrument(level = "debug", skip(self, headers))]
    async fn head(
        &self,
        url: &str,
        headers: &BTreeMap<String, String>,
        referer: Option<&str>,
    ) -> Result<HttpResponse, DownloadError> {
        let request = self.client.head(url);
        let response = self.send(request, url, headers, referer).await?;
        Ok(HttpResponse::from_parts(
            response.status().as_u16(),
            response.headers().clone(),
            Vec::new(),
        ))
    }
}

fn map_reqwest_error(url: &str, error: reqwest::Error) -> DownloadError {
    if error.is_timeout() {
        DownloadError::timeout(url)
    } else if error.is_builder() {
        DownloadError::invalid_url(url)
    } else {
        DownloadError::network(url, error)
    }
}
