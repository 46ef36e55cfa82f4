//! HTTPS transport backed by `reqwest`'s blocking client.
//!
//! TLS is provided by rustls, which ships no RC4, DES, 3DES, IDEA, PSK,
//! MD5, export-grade or SEED cipher suites. Certificate verification is
//! always on and plain HTTP is refused.

use std::error::Error;
use std::io::{self, Read};
use std::time::Duration;

use reqwest::blocking::{Client, Response};
use reqwest::header::{ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, RANGE};
use reqwest::StatusCode;

use super::transport::{status_error, Body, ByteRange, RemoteInfo, Transport};
use crate::error::TransportError;

/// User agent sent with every request.
const USER_AGENT: &str = concat!("binstrap/", env!("CARGO_PKG_VERSION"));

/// Production transport.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    timeout: Duration,
}

impl HttpTransport {
    /// Build a client that times out individual requests after `timeout`.
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let client = Client::builder()
            .use_rustls_tls()
            .https_only(true)
            .min_tls_version(reqwest::tls::Version::TLS_1_2)
            .tls_built_in_root_certs(true)
            .connect_timeout(timeout)
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| TransportError::fatal("<client>", e.to_string()))?;

        Ok(Self { client, timeout })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl Transport for HttpTransport {
    fn probe(&self, url: &str) -> Result<RemoteInfo, TransportError> {
        let response = self
            .client
            .head(url)
            .send()
            .map_err(|e| classify_error(url, &e))?;

        if !response.status().is_success() {
            return Err(status_error(url, response.status().as_u16()));
        }

        let content_length = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok())
            .ok_or_else(|| TransportError::fatal(url, "server did not report content-length"))?;

        let accepts_ranges = response
            .headers()
            .get(ACCEPT_RANGES)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.eq_ignore_ascii_case("bytes"))
            .unwrap_or(false);

        Ok(RemoteInfo {
            content_length,
            accepts_ranges,
        })
    }

    fn get(&self, url: &str, range: Option<ByteRange>) -> Result<Body, TransportError> {
        let mut request = self.client.get(url);
        if let Some(range) = range {
            request = request.header(RANGE, range.header_value());
        }

        let mut response = request.send().map_err(|e| classify_error(url, &e))?;

        let status = response.status();
        if status != StatusCode::OK && status != StatusCode::PARTIAL_CONTENT {
            return Err(status_error(url, status.as_u16()));
        }

        if let Some(range) = range.filter(|_| status == StatusCode::PARTIAL_CONTENT) {
            let header = response.headers().get(CONTENT_RANGE).and_then(|v| v.to_str().ok());
            check_content_range(url, header, range)?;
        }

        // A 200 to a ranged request carries the whole entity.
        if let Some(range) = range.filter(|r| r.start > 0 && status == StatusCode::OK) {
            tracing::debug!(url, %range, "Server ignored range, skipping prefix");
            skip_prefix(&mut response, range.start)
                .map_err(|e| TransportError::transient(url, e.to_string()))?;
        }

        Ok(Box::new(response))
    }
}

fn skip_prefix(response: &mut Response, bytes: u64) -> io::Result<()> {
    let skipped = io::copy(&mut response.by_ref().take(bytes), &mut io::sink())?;
    if skipped < bytes {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "body ended before requested range",
        ));
    }
    Ok(())
}

/// Reject a 206 whose `Content-Range` does not cover exactly `requested`.
fn check_content_range(
    url: &str,
    header: Option<&str>,
    requested: ByteRange,
) -> Result<(), TransportError> {
    let header = header
        .ok_or_else(|| TransportError::fatal(url, "partial response without content-range"))?;
    let (start, end) = parse_content_range(header).ok_or_else(|| {
        TransportError::fatal(url, format!("malformed content-range {header:?}"))
    })?;

    let end_matches = requested.end.map_or(true, |want| want == end);
    if start != requested.start || !end_matches {
        return Err(TransportError::fatal(
            url,
            format!("requested {requested}, server sent content-range {header:?}"),
        ));
    }
    Ok(())
}

/// Parse `bytes <start>-<end>/<total or *>` into its inclusive bounds.
fn parse_content_range(value: &str) -> Option<(u64, u64)> {
    let spec = value.trim().strip_prefix("bytes ")?;
    let (bounds, _total) = spec.split_once('/')?;
    let (start, end) = bounds.split_once('-')?;
    let start = start.trim().parse::<u64>().ok()?;
    let end = end.trim().parse::<u64>().ok()?;
    (start <= end).then_some((start, end))
}

/// Map a `reqwest` failure onto retry semantics.
///
/// Certificate and handshake failures are fatal even though reqwest
/// reports them as connect errors.
fn classify_error(url: &str, error: &reqwest::Error) -> TransportError {
    let reason = render_chain(error);

    if is_tls_failure(error) {
        return TransportError::fatal(url, reason);
    }
    if let Some(status) = error.status() {
        return status_error(url, status.as_u16());
    }
    if error.is_timeout() || error.is_connect() || error.is_request() || error.is_body() {
        return TransportError::transient(url, reason);
    }
    TransportError::fatal(url, reason)
}

/// Whether a `rustls::Error` sits anywhere in the source chain.
///
/// The TLS stream reports failures as an `io::Error` wrapping the rustls
/// error, and `io::Error::source` skips the wrapped value, so those are
/// unwrapped by hand.
fn is_tls_failure(error: &(dyn Error + 'static)) -> bool {
    let mut current = Some(error);
    while let Some(err) = current {
        if err.is::<rustls::Error>() {
            return true;
        }
        let wrapped = err
            .downcast_ref::<io::Error>()
            .and_then(|io_err| io_err.get_ref());
        if wrapped.is_some_and(|inner| inner.is::<rustls::Error>()) {
            return true;
        }
        current = err.source();
    }
    false
}

/// Join an error and its sources so the root cause survives logging.
fn render_chain(error: &reqwest::Error) -> String {
    let mut parts = vec![error.to_string()];
    let mut source = error.source();
    while let Some(err) = source {
        parts.push(err.to_string());
        source = err.source();
    }
    parts.join(": ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_transport_new() {
        let transport = HttpTransport::new(Duration::from_secs(60)).unwrap();
        assert_eq!(transport.timeout(), Duration::from_secs(60));
    }

    #[test]
    fn test_plain_http_is_refused() {
        let transport = HttpTransport::new(Duration::from_secs(1)).unwrap();
        let err = transport.get("http://127.0.0.1:9/archive.zip", None).err().unwrap();
        assert!(!err.is_transient());
    }

    #[derive(Debug)]
    struct Wrapped(Box<dyn Error + Send + Sync>);

    impl std::fmt::Display for Wrapped {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str("error sending request")
        }
    }

    impl Error for Wrapped {
        fn source(&self) -> Option<&(dyn Error + 'static)> {
            Some(self.0.as_ref())
        }
    }

    #[test]
    fn test_rustls_error_in_chain_is_tls_failure() {
        let tls = rustls::Error::InvalidCertificate(rustls::CertificateError::UnknownIssuer);
        assert!(is_tls_failure(&Wrapped(Box::new(tls.clone()))));

        let io_err = io::Error::new(io::ErrorKind::InvalidData, tls);
        assert!(is_tls_failure(&Wrapped(Box::new(io_err))));
    }

    #[test]
    fn test_tls_words_in_message_are_not_tls_failure() {
        let io_err = io::Error::new(io::ErrorKind::ConnectionReset, "tls handshake certificate");
        assert!(!is_tls_failure(&Wrapped(Box::new(io_err))));
    }

    #[test]
    fn test_refused_connection_is_transient() {
        let transport = HttpTransport::new(Duration::from_secs(2)).unwrap();
        // Nothing listens on the discard port.
        let err = transport.get("https://127.0.0.1:9/archive.zip", None).err().unwrap();
        assert!(err.is_transient(), "{err}");
    }

    #[test]
    fn test_content_range_must_match_request() {
        let closed = ByteRange::new(100, 199);
        assert!(check_content_range("u", Some("bytes 100-199/1000"), closed).is_ok());
        assert!(check_content_range("u", Some("bytes 100-199/*"), closed).is_ok());
        assert!(check_content_range("u", Some("bytes 0-199/1000"), closed).is_err());
        assert!(check_content_range("u", Some("bytes 100-150/1000"), closed).is_err());
        assert!(check_content_range("u", None, closed).is_err());

        let open = ByteRange::from(500);
        assert!(check_content_range("u", Some("bytes 500-999/1000"), open).is_ok());
        assert!(check_content_range("u", Some("bytes 400-999/1000"), open).is_err());
    }

    #[test]
    fn test_parse_content_range() {
        assert_eq!(parse_content_range("bytes 0-1023/4096"), Some((0, 1023)));
        assert_eq!(parse_content_range("bytes 5-5/*"), Some((5, 5)));
        assert_eq!(parse_content_range("bytes 9-3/10"), None);
        assert_eq!(parse_content_range("items 0-1/2"), None);
        assert_eq!(parse_content_range("bytes */1000"), None);
    }

    #[test]
    fn test_user_agent_has_version() {
        assert!(USER_AGENT.starts_with("binstrap/"));
    }
}
