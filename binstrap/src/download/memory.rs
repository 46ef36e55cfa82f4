//! In-memory transport.
//!
//! Serves byte blobs registered under URLs and can inject failures on
//! upcoming requests. Useful for offline mirrors and for exercising the
//! downloader's retry and resume paths.

use std::collections::{HashMap, VecDeque};
use std::io::{self, Read};
use std::sync::Arc;

use parking_lot::Mutex;

use super::transport::{status_error, Body, ByteRange, RemoteInfo, Transport};
use crate::error::TransportError;

/// A failure to apply to the next GET.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Answer with this HTTP status.
    Status(u16),
    /// Serve this many bytes, then fail the read as a reset connection.
    DropAfter(usize),
    /// Fail as a certificate error.
    Tls,
}

/// One recorded GET request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRequest {
    pub url: String,
    pub range: Option<ByteRange>,
}

#[derive(Debug, Default)]
struct Inner {
    blobs: HashMap<String, Arc<Vec<u8>>>,
    faults: VecDeque<Fault>,
    requests: Vec<RecordedRequest>,
}

/// Transport serving registered blobs from memory.
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    inner: Arc<Mutex<Inner>>,
    accepts_ranges: bool,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    /// A transport that honors range requests.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            accepts_ranges: true,
        }
    }

    /// A transport that advertises no range support.
    pub fn without_ranges() -> Self {
        Self {
            accepts_ranges: false,
            ..Self::new()
        }
    }

    /// Serve `data` at `url`.
    pub fn insert(&self, url: impl Into<String>, data: Vec<u8>) {
        self.inner.lock().blobs.insert(url.into(), Arc::new(data));
    }

    /// Queue a fault for an upcoming GET. Faults apply in FIFO order.
    pub fn push_fault(&self, fault: Fault) {
        self.inner.lock().faults.push_back(fault);
    }

    /// All GET requests seen so far.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.inner.lock().requests.clone()
    }

    /// Total bytes requested by closed ranges and whole-body GETs.
    pub fn requested_bytes(&self, url: &str) -> u64 {
        let inner = self.inner.lock();
        let size = inner.blobs.get(url).map(|b| b.len() as u64).unwrap_or(0);
        inner
            .requests
            .iter()
            .filter(|r| r.url == url)
            .map(|r| match r.range {
                Some(ByteRange {
                    start,
                    end: Some(end),
                }) => (end.min(size.saturating_sub(1)) + 1).saturating_sub(start),
                Some(ByteRange { start, end: None }) => size.saturating_sub(start),
                None => size,
            })
            .sum()
    }

    fn blob(&self, url: &str) -> Result<Arc<Vec<u8>>, TransportError> {
        self.inner
            .lock()
            .blobs
            .get(url)
            .cloned()
            .ok_or_else(|| status_error(url, 404))
    }
}

impl Transport for MemoryTransport {
    fn probe(&self, url: &str) -> Result<RemoteInfo, TransportError> {
        let blob = self.blob(url)?;
        Ok(RemoteInfo {
            content_length: blob.len() as u64,
            accepts_ranges: self.accepts_ranges,
        })
    }

    fn get(&self, url: &str, range: Option<ByteRange>) -> Result<Body, TransportError> {
        let fault = {
            let mut inner = self.inner.lock();
            inner.requests.push(RecordedRequest {
                url: url.to_string(),
                range,
            });
            inner.faults.pop_front()
        };

        let blob = self.blob(url)?;
        let len = blob.len() as u64;
        let (start, end) = match range {
            Some(r) if self.accepts_ranges => {
                let end = r.end.unwrap_or(len.saturating_sub(1)).min(len.saturating_sub(1));
                if r.start >= len {
                    return Err(status_error(url, 416));
                }
                (r.start, end + 1)
            }
            _ => (0, len),
        };

        let limit = match fault {
            Some(Fault::Status(code)) => return Err(status_error(url, code)),
            Some(Fault::Tls) => {
                return Err(TransportError::fatal(url, "invalid peer certificate: UnknownIssuer"))
            }
            Some(Fault::DropAfter(n)) => Some(n),
            None => None,
        };

        Ok(Box::new(BlobReader {
            blob,
            position: start as usize,
            end: end as usize,
            fail_after: limit,
        }))
    }
}

struct BlobReader {
    blob: Arc<Vec<u8>>,
    position: usize,
    end: usize,
    fail_after: Option<usize>,
}

impl Read for BlobReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut available = self.end - self.position;
        if let Some(remaining) = self.fail_after {
            if remaining == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::ConnectionReset,
                    "connection reset by peer",
                ));
            }
            available = available.min(remaining);
        }

        let n = available.min(buf.len());
        buf[..n].copy_from_slice(&self.blob[self.position..self.position + n]);
        self.position += n;
        if let Some(remaining) = self.fail_after.as_mut() {
            *remaining -= n;
        }
        Ok(n)
    }
}
