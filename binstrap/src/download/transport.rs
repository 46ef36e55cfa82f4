//! The network seam used by the downloader.

use std::fmt;
use std::io::Read;

use crate::error::TransportError;

/// An inclusive byte range, open-ended when `end` is `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: Option<u64>,
}

impl ByteRange {
    /// Closed range `start..=end`.
    pub fn new(start: u64, end: u64) -> Self {
        Self {
            start,
            end: Some(end),
        }
    }

    /// Everything from `start` onwards.
    pub fn from(start: u64) -> Self {
        Self { start, end: None }
    }

    /// Value for the HTTP `Range` header.
    pub fn header_value(&self) -> String {
        match self.end {
            Some(end) => format!("bytes={}-{}", self.start, end),
            None => format!("bytes={}-", self.start),
        }
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.header_value())
    }
}

/// What a HEAD request tells us about the remote archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteInfo {
    pub content_length: u64,
    pub accepts_ranges: bool,
}

/// Body of a successful GET.
pub type Body = Box<dyn Read + Send>;

/// Fetches remote bytes.
///
/// Implementations must be usable from many worker threads at once.
pub trait Transport: Send + Sync {
    /// Query size and range support without fetching the body.
    fn probe(&self, url: &str) -> Result<RemoteInfo, TransportError>;

    /// Fetch `url`, optionally restricted to `range`.
    ///
    /// When a range is given the returned body starts at `range.start`
    /// regardless of whether the server answered 200 or 206.
    fn get(&self, url: &str, range: Option<ByteRange>) -> Result<Body, TransportError>;
}

/// Classify an HTTP status that is neither 200 nor 206.
pub fn status_error(url: &str, status: u16) -> TransportError {
    let reason = format!("server returned HTTP {}", status);
    match status {
        408 | 429 | 500..=599 => TransportError::transient(url, reason),
        _ => TransportError::fatal(url, reason),
    }
}
