//! Bootstrap configuration.
//!
//! Two kinds of configuration live here:
//! - [`BootstrapConfig`]: the persisted `bootstrap_config.json` describing
//!   which archive to fetch
//! - [`DownloadConfig`]: tuning knobs for the chunked downloader

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{BootstrapError, BootstrapResult};

/// File name of the bootstrap configuration at the destination root.
pub const CONFIG_FILE_NAME: &str = "bootstrap_config.json";

/// Length of a SHA-512 digest in hex characters.
pub const SHA512_HEX_LEN: usize = 128;

/// Default size of one chunk file (100 MiB).
pub const DEFAULT_CHUNK_SIZE: u64 = 100 * 1024 * 1024;

/// Default size of one ranged request within a chunk (1 MiB).
pub const DEFAULT_SEGMENT_SIZE: u64 = 1024 * 1024;

/// Default number of download worker threads.
pub const DEFAULT_THREAD_COUNT: usize = 20;

/// Default number of retries per chunk.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Default HTTP timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Default pause before retrying a failed chunk.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Describes the archive that populates the destination root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapConfig {
    /// HTTPS location of the archive.
    pub url: String,

    /// Expected SHA-512 of the archive bytes, hex encoded.
    #[serde(rename = "checksum")]
    pub expected_checksum: String,

    /// Total uncompressed size of the archive contents in bytes.
    #[serde(rename = "size")]
    pub expected_uncompressed_size: u64,
}

impl BootstrapConfig {
    /// Path of the configuration file under `root`.
    pub fn path_in(root: &Path) -> PathBuf {
        root.join(CONFIG_FILE_NAME)
    }

    /// Load and validate the configuration stored under `root`.
    pub fn load(root: &Path) -> BootstrapResult<Self> {
        let path = Self::path_in(root);
        let invalid = |reason: String| BootstrapError::ConfigInvalid {
            path: path.clone(),
            reason,
        };

        let contents = fs::read_to_string(&path).map_err(|e| invalid(e.to_string()))?;
        let config: Self = serde_json::from_str(&contents).map_err(|e| invalid(e.to_string()))?;
        config.validate().map_err(invalid)?;
        Ok(config)
    }

    /// Check the invariants of a configuration record.
    pub fn validate(&self) -> Result<(), String> {
        if !self.url.starts_with("https://") {
            return Err(format!("url must use https: {}", self.url));
        }
        if self.archive_file_name().is_none() {
            return Err(format!("url has no file name: {}", self.url));
        }
        if self.expected_uncompressed_size == 0 {
            return Err("size must be a positive integer".to_string());
        }
        if !is_sha512_hex(&self.expected_checksum) {
            return Err(format!(
                "checksum must be {} hex digits (SHA-512)",
                SHA512_HEX_LEN
            ));
        }
        Ok(())
    }

    /// Final path segment of the URL, used to name chunk files.
    pub fn archive_file_name(&self) -> Option<&str> {
        let without_query = self.url.split(['?', '#']).next().unwrap_or("");
        let path = without_query
            .strip_prefix("https://")
            .and_then(|rest| rest.split_once('/'))
            .map(|(_, path)| path)?;
        path.rsplit('/').next().filter(|name| !name.is_empty())
    }
}

/// Whether `s` is a SHA-512 hex digest.
pub fn is_sha512_hex(s: &str) -> bool {
    s.len() == SHA512_HEX_LEN && s.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Tuning knobs for the chunked downloader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadConfig {
    /// Size of the worker pool.
    pub thread_count: usize,

    /// Retries per chunk after the first attempt.
    pub max_retries: u32,

    /// Per-request HTTP timeout.
    pub timeout: Duration,

    /// Maximum size of one chunk file.
    pub chunk_size: u64,

    /// Maximum size of one ranged request.
    pub segment_size: u64,

    /// Download with a single sequential GET even when ranges are supported.
    pub force_simple: bool,

    /// Base pause before a retry; grows linearly with the attempt number.
    pub retry_delay: Duration,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            thread_count: DEFAULT_THREAD_COUNT,
            max_retries: DEFAULT_MAX_RETRIES,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            chunk_size: DEFAULT_CHUNK_SIZE,
            segment_size: DEFAULT_SEGMENT_SIZE,
            force_simple: false,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }
}

impl DownloadConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the worker pool size (minimum 1).
    pub fn with_thread_count(mut self, count: usize) -> Self {
        self.thread_count = count.max(1);
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the chunk size (minimum 1 byte).
    pub fn with_chunk_size(mut self, size: u64) -> Self {
        self.chunk_size = size.max(1);
        self
    }

    /// Set the segment size (minimum 1 byte).
    pub fn with_segment_size(mut self, size: u64) -> Self {
        self.segment_size = size.max(1);
        self
    }

    pub fn with_force_simple(mut self, simple: bool) -> Self {
        self.force_simple = simple;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }
}
