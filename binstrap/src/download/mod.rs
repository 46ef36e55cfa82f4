//! Chunked HTTP downloader for the bootstrap archive.
//!
//! This module provides:
//! - The network seam and its HTTPS implementation (`transport`, `http`)
//! - An in-memory transport for offline use and fault injection (`memory`)
//! - Chunk planning and resume discovery (`plan`)
//! - Per-chunk fetch and retry logic (`worker`)
//! - The top-level chunked downloader (`downloader`)
//!
//! # Architecture
//!
//! ```text
//! ChunkedDownloader
//!         │
//!         ├── Transport (trait)
//!         │       ├── HttpTransport
//!         │       └── MemoryTransport
//!         │
//!         ├── plan_chunks ──► DownloadJob per chunk
//!         │
//!         ├── JobQueue ──► worker pool (thread_count threads)
//!         │
//!         └── ProgressMeter (shared by all workers)
//! ```

mod downloader;
mod http;
mod memory;
mod plan;
mod transport;
mod worker;

pub use downloader::{ChunkedDownloader, DownloadMode, DownloadOutcome};
pub use http::HttpTransport;
pub use memory::{Fault, MemoryTransport, RecordedRequest};
pub use plan::{chunk_path, existing_chunks, plan_chunks, remove_chunks, ChunkFile, DownloadJob};
pub use transport::{status_error, Body, ByteRange, RemoteInfo, Transport};
