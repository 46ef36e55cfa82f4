//! Error types for the bootstrap downloader.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result type for bootstrap operations.
pub type BootstrapResult<T> = Result<T, BootstrapError>;

/// Transport-level failures, split by whether a retry can help.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// Timeout, dropped connection, 5xx or 429. Worth retrying.
    #[error("transient transport error for {url}: {reason}")]
    Transient { url: String, reason: String },

    /// TLS failure, 4xx, malformed response. Retrying will not help.
    #[error("transport error for {url}: {reason}")]
    Fatal { url: String, reason: String },
}

impl TransportError {
    pub fn transient(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Transient {
            url: url.into(),
            reason: reason.into(),
        }
    }

    pub fn fatal(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Fatal {
            url: url.into(),
            reason: reason.into(),
        }
    }

    /// Whether the failed operation may be retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

/// Errors that can occur while bootstrapping a destination tree.
#[derive(Debug, Error)]
pub enum BootstrapError {
    /// Missing or malformed `bootstrap_config.json`.
    #[error("invalid bootstrap configuration {}: {reason}", path.display())]
    ConfigInvalid { path: PathBuf, reason: String },

    /// Missing or malformed manifest file.
    #[error("invalid manifest {}: {reason}", path.display())]
    Manifest { path: PathBuf, reason: String },

    /// Not enough free space on a volume.
    #[error(
        "not enough free space on {}: {required} bytes required, {available} bytes available",
        path.display()
    )]
    DiskFull {
        path: PathBuf,
        required: u64,
        available: u64,
    },

    /// Network transport failure.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// One or more chunks did not finish downloading.
    #[error("download of {url} incomplete ({received} of {expected} bytes): {reason}")]
    DownloadIncomplete {
        url: String,
        received: u64,
        expected: u64,
        reason: String,
    },

    /// Downloaded bytes do not hash to the configured checksum.
    #[error("checksum mismatch for {url}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        url: String,
        expected: String,
        actual: String,
    },

    /// Archive could not be read or an entry could not be written.
    #[error("failed to extract {}: {reason}", path.display())]
    Extraction { path: PathBuf, reason: String },

    /// Copy or delete into the destination tree failed.
    #[error(
        "failed to update {}: {source} (close any application using this file and re-run)",
        path.display()
    )]
    ReconcileIo { path: PathBuf, source: io::Error },

    /// Generic filesystem failure outside the reconcile pass.
    #[error("I/O error on {}: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },

    /// The user interrupted the run.
    #[error("cancelled by user")]
    Cancelled,
}

impl BootstrapError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether a re-run will pick up the partial state left on disk.
    ///
    /// Configuration and disk space problems need user action first; a
    /// corrupt download is discarded and restarts from scratch.
    pub fn resumable(&self) -> bool {
        match self {
            Self::ConfigInvalid { .. }
            | Self::Manifest { .. }
            | Self::DiskFull { .. }
            | Self::ChecksumMismatch { .. } => false,
            Self::Transport(_)
            | Self::DownloadIncomplete { .. }
            | Self::Extraction { .. }
            | Self::ReconcileIo { .. }
            | Self::Io { .. }
            | Self::Cancelled => true,
        }
    }
}
