//! Binstrap - resumable bootstrap of binary distributions
//!
//! This library downloads a large archive as parallel, resumable chunk
//! files, verifies it against a SHA-512 checksum, unpacks it and
//! reconciles the result into a destination tree using file manifests
//! so that locally modified files are never overwritten silently.
//!
//! # Modules
//!
//! - [`bootstrap`]: the end-to-end run
//! - [`download`]: chunked downloader and transports
//! - [`multipart`]: chunk files read as one stream
//! - [`extract`]: zip extraction
//! - [`reconcile`]: manifest-driven update of the destination tree
//! - [`progress`]: threaded progress reporting

pub mod bootstrap;
pub mod checksum;
pub mod config;
pub mod disk;
pub mod download;
pub mod error;
pub mod extract;
pub mod manifest;
pub mod multipart;
pub mod progress;
pub mod reconcile;

pub use bootstrap::{Bootstrap, BootstrapOptions, BootstrapSummary};
pub use config::{BootstrapConfig, DownloadConfig};
pub use error::{BootstrapError, BootstrapResult, TransportError};

/// Crate version, reported by `--version` and the HTTP user agent.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
