//! Range prober: learns the total length and byte-range support of a URL.

use reqwest::header::ACCEPT_RANGES;
use tracing::{debug, instrument, warn};

use super::constants::{PROBE_RANGE_LAST_BYTE, PROBE_RANGE_MIN_LAST_BYTE};
use super::error::DownloadError;
use super::http::{ByteRange, HttpTransport};
use super::target::DownloadRequest;

/// What the server told us about a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProbeResult {
    /// Total length in bytes when known.
    pub total_length: Option<u64>,
    /// Whether ranged requests are honoured.
    pub supports_ranges: bool,
}

/// Probes `request` with a HEAD and, when needed, a small ranged GET.
///
/// `Accept-Ranges: bytes` or `none` on the HEAD answer settles range support
/// without a second request. Otherwise a GET for `bytes=0-N` is sent and a
/// `206` answer proves support. The GET body is never read.
///
/// # Errors
///
/// Returns the verification GET's error when both requests fail.
#[instrument(skip(http, request), fields(url = %request.url))]
pub async fn probe(
    http: &dyn HttpTransport,
    request: &DownloadRequest,
) -> Result<ProbeResult, DownloadError> {
    let referer = request.referer.as_deref();
    let head = http.head(&request.url, &request.headers, referer).await;

    let mut total_length = None;
    let mut declared_ranges = None;
    let head_ok = match &head {
        Ok(response) => {
            total_length = response.content_length();
            declared_ranges = response
                .header(ACCEPT_RANGES.as_str())
                .and_then(parse_accept_ranges);
            true
        }
        Err(error) => {
            debug!(%error, "HEAD failed, falling back to ranged GET");
            false
        }
    };
    drop(head);

    if let Some(supports_ranges) = declared_ranges {
        debug!(?total_length, supports_ranges, "range support declared by HEAD");
        return Ok(ProbeResult {
            total_length,
            supports_ranges,
        });
    }

    let range = ByteRange::inclusive(0, verification_last_byte(total_length));
    match http
        .get(&request.url, &request.headers, referer, Some(range))
        .await
    {
        Ok(response) => {
            let supports_ranges = response.status == 206;
            if total_length.is_none() {
                total_length = if supports_ranges {
                    response.content_range_total()
                } else {
                    response.content_length()
                };
            }
            debug!(?total_length, supports_ranges, status = response.status, "probed");
            Ok(ProbeResult {
                total_length,
                supports_ranges,
            })
        }
        Err(error) if head_ok => {
            warn!(%error, "range verification failed; assuming no range support");
            Ok(ProbeResult {
                total_length,
                supports_ranges: false,
            })
        }
        Err(error) => Err(error),
    }
}

/// Interprets an `Accept-Ranges` value: `Some(true)` for `bytes`, `Some(false)`
/// for `none`, `None` when unrecognised.
fn parse_accept_ranges(value: &str) -> Option<bool> {
    let value = value.trim();
    if value.eq_ignore_ascii_case("bytes") {
        Some(true)
    } else if value.eq_ignore_ascii_case("none") {
        Some(false)
    } else {
        None
    }
}

/// `min(max(len - 1, 3), 1023)` for a known length, else 1023.
fn verification_last_byte(total_length: Option<u64>) -> u64 {
    match total_length {
        Some(len) => len
            .saturating_sub(1)
            .max(PROBE_RANGE_MIN_LAST_BYTE)
            .min(PROBE_RANGE_LAST_BYTE),
        None => PROBE_RANGE_LAST_BYTE,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::download::http::HttpClient;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_parse_accept_ranges() {
        assert_eq!(parse_accept_ranges("bytes"), Some(true));
        assert_eq!(parse_accept_ranges(" Bytes "), Some(true));
        assert_eq!(parse_accept_ranges("NONE"), Some(false));
        assert_eq!(parse_accept_ranges("items"), None);
    }

    #[test]
    fn test_verification_last_byte() {
        assert_eq!(verification_last_byte(None), 1023);
        assert_eq!(verification_last_byte(Some(1)), 3);
        assert_eq!(verification_last_byte(Some(100)), 99);
        assert_eq!(verification_last_byte(Some(10_000_000)), 1023);
    }

    #[tokio::test]
    async fn test_probe_head_declares_bytes() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/a.mp4"))
            .respond_with(ResponseTemplate::new(200).insert_header("accept-ranges", "bytes"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;

        let http = HttpClient::new().unwrap();
        let request = DownloadRequest::new(format!("{}/a.mp4", server.uri()));
        let result = probe(&http, &request).await.unwrap();
        assert!(result.supports_ranges);
    }

    #[tokio::test]
    async fn test_probe_falls_back_to_ranged_get_on_head_failure() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(405))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/a.mp4"))
            .and(header("range", "bytes=0-1023"))
            .respond_with(
                ResponseTemplate::new(206)
                    .insert_header("content-range", "bytes 0-1023/7777")
                    .set_body_bytes(vec![0u8; 1024]),
            )
            .mount(&server)
            .await;

        let http = HttpClient::new().unwrap();
        let request = DownloadRequest::new(format!("{}/a.mp4", server.uri()));
        let result = probe(&http, &request).await.unwrap();
        assert!(result.supports_ranges);
        assert_eq!(result.total_length, Some(7777));
    }

    #[tokio::test]
    async fn test_probe_full_body_means_no_ranges() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![1u8; 2048]))
            .mount(&server)
            .await;

        let http = HttpClient::new().unwrap();
        let request = DownloadRequest::new(format!("{}/a.mp4", server.uri()));
        let result = probe(&http, &request).await.unwrap();
        assert!(!result.supports_ranges);
    }

    #[tokio::test]
    async fn test_probe_both_requests_fail() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let http = HttpClient::new().unwrap();
        let request = DownloadRequest::new(format!("{}/gone.mp4", server.uri()));
        let result = probe(&http, &request).await;
        assert!(matches!(
            result,
            Err(DownloadError::HttpStatus { status: 404, .. })
        ));
    }
}
