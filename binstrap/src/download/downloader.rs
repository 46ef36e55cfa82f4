//! Chunked, resumable, parallel download of a single archive.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use tracing::{error, info, warn};

use super::plan::{existing_chunks, plan_chunks, ChunkFile, DownloadJob};
use super::transport::{RemoteInfo, Transport};
use super::worker::{fetch_with_retry, file_len, run_worker, FetchMode, JobFailure, JobQueue, WorkerContext};
use crate::config::DownloadConfig;
use crate::disk;
use crate::error::{BootstrapError, BootstrapResult};
use crate::progress::ProgressMeter;

/// How the archive was fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadMode {
    /// Ranged requests from a worker pool.
    Parallel,
    /// One sequential GET into a single chunk file.
    Simple,
}

/// Result of a completed download.
#[derive(Debug, Clone)]
pub struct DownloadOutcome {
    /// Chunk files in archive order.
    pub chunks: Vec<PathBuf>,
    /// Size of the remote archive.
    pub content_length: u64,
    /// Bytes already on disk from earlier runs.
    pub resumed_bytes: u64,
    pub mode: DownloadMode,
}

/// Downloads one remote archive as a set of chunk files.
pub struct ChunkedDownloader {
    transport: Arc<dyn Transport>,
    config: DownloadConfig,
    cancel: Arc<AtomicBool>,
}

impl std::fmt::Debug for ChunkedDownloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkedDownloader")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ChunkedDownloader {
    pub fn new(transport: Arc<dyn Transport>, config: DownloadConfig) -> Self {
        Self {
            transport,
            config,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Share a cancellation flag; setting it stops all workers between reads.
    pub fn with_cancel(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    /// Query the remote archive via HEAD.
    pub fn probe(&self, url: &str) -> BootstrapResult<RemoteInfo> {
        Ok(self.transport.probe(url)?)
    }

    /// Download `url` into chunk files named after `dest`.
    ///
    /// Chunk files left by an earlier run are picked up where they stopped.
    /// `expected_uncompressed_size` only feeds the free-space preflight.
    pub fn download(
        &self,
        url: &str,
        dest: &Path,
        expected_uncompressed_size: u64,
        meter: &ProgressMeter,
    ) -> BootstrapResult<DownloadOutcome> {
        let info = self.probe(url)?;
        let mode = if self.config.force_simple || !info.accepts_ranges {
            DownloadMode::Simple
        } else {
            DownloadMode::Parallel
        };
        info!(
            url,
            content_length = info.content_length,
            accepts_ranges = info.accepts_ranges,
            ?mode,
            "Remote archive"
        );

        let chunks = match mode {
            DownloadMode::Parallel => plan_chunks(dest, info.content_length, self.config.chunk_size),
            DownloadMode::Simple => plan_chunks(dest, info.content_length, info.content_length),
        };

        let resumed_bytes = self.resume_accounting(dest, &chunks)?;

        let dest_dir = dest.parent().unwrap_or(Path::new("."));
        let required = (info.content_length - resumed_bytes).saturating_add(expected_uncompressed_size);
        disk::ensure_free_space(dest_dir, required)?;

        meter.add_target(info.content_length);
        meter.record_progress(resumed_bytes);
        if resumed_bytes > 0 {
            info!(resumed_bytes, "Resuming previous download");
        }

        let jobs: Vec<DownloadJob> = chunks.iter().map(|c| DownloadJob::for_chunk(c, url)).collect();
        let failures = Mutex::new(Vec::new());
        let ctx = WorkerContext {
            transport: self.transport.as_ref(),
            meter,
            cancel: &self.cancel,
            max_retries: self.config.max_retries,
            retry_delay: self.config.retry_delay,
        };

        {
            let _progress = meter.scoped("Downloading");
            match mode {
                DownloadMode::Simple => {
                    let fetch = FetchMode::Stream {
                        resume: info.accepts_ranges,
                    };
                    for job in &jobs {
                        if let Err(error) = fetch_with_retry(&ctx, job, fetch) {
                            failures.lock().push(JobFailure {
                                index: job.index,
                                error,
                            });
                        }
                    }
                }
                DownloadMode::Parallel => {
                    let fetch = FetchMode::Segmented {
                        segment_size: self.config.segment_size,
                    };
                    self.run_pool(&ctx, JobQueue::new(jobs), fetch, &failures);
                }
            }
        }

        if self.cancel.load(Ordering::SeqCst) {
            warn!("Download cancelled, partial chunks kept for resume");
            return Err(BootstrapError::Cancelled);
        }

        let received = on_disk_bytes(&chunks)?;
        let mut failures = failures.into_inner();
        failures.sort_by_key(|f| f.index);
        if let Some(first) = failures.into_iter().next() {
            return Err(BootstrapError::DownloadIncomplete {
                url: url.to_string(),
                received,
                expected: info.content_length,
                reason: format!("chunk {}: {}", first.index, first.error),
            });
        }
        if received != info.content_length || meter.progress() < meter.target() {
            error!(received, expected = info.content_length, "Chunk files incomplete");
            return Err(BootstrapError::DownloadIncomplete {
                url: url.to_string(),
                received,
                expected: info.content_length,
                reason: "not every chunk finished".to_string(),
            });
        }

        info!(chunks = chunks.len(), bytes = received, "Download complete");
        Ok(DownloadOutcome {
            chunks: chunks.into_iter().map(|c| c.path).collect(),
            content_length: info.content_length,
            resumed_bytes,
            mode,
        })
    }

    /// Bytes already present for each planned chunk, capped at its size.
    fn resume_accounting(&self, dest: &Path, chunks: &[ChunkFile]) -> BootstrapResult<u64> {
        let existing: HashMap<usize, u64> = existing_chunks(dest)
            .map_err(|e| BootstrapError::io(dest, e))?
            .into_iter()
            .collect();

        Ok(chunks
            .iter()
            .map(|c| existing.get(&c.index).copied().unwrap_or(0).min(c.len()))
            .sum())
    }

    fn run_pool(
        &self,
        ctx: &WorkerContext<'_>,
        queue: JobQueue,
        fetch: FetchMode,
        failures: &Mutex<Vec<JobFailure>>,
    ) {
        let workers = self.config.thread_count.min(queue.len()).max(1);
        let queue = &queue;

        thread::scope(|scope| {
            for i in 0..workers {
                let spawned = thread::Builder::new()
                    .name(format!("download-{}", i))
                    .spawn_scoped(scope, move || run_worker(ctx, queue, fetch, failures));
                if let Err(e) = spawned {
                    warn!(worker = i, error = %e, "Could not start download worker");
                }
            }
        });
    }
}

fn on_disk_bytes(chunks: &[ChunkFile]) -> BootstrapResult<u64> {
    chunks
        .iter()
        .map(|c| file_len(&c.path).map(|len| len.min(c.len())))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::memory::{Fault, MemoryTransport};
    use crate::download::plan::chunk_path;
    use crate::download::transport::{Body, ByteRange};
    use crate::error::TransportError;
    use std::fs;
    use std::time::Duration;
    use tempfile::TempDir;

    const URL: &str = "https://mirror.example/archive.zip";

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 256) as u8).collect()
    }

    fn config() -> DownloadConfig {
        DownloadConfig::new()
            .with_thread_count(4)
            .with_chunk_size(1000)
            .with_segment_size(256)
            .with_max_retries(3)
            .with_retry_delay(Duration::ZERO)
    }

    fn concat(paths: &[PathBuf]) -> Vec<u8> {
        paths.iter().flat_map(|p| fs::read(p).unwrap()).collect()
    }

    #[test]
    fn test_parallel_download_tiles_archive() {
        let temp = TempDir::new().unwrap();
        let data = payload(3500);
        let transport = MemoryTransport::new();
        transport.insert(URL, data.clone());

        let downloader = ChunkedDownloader::new(Arc::new(transport), config());
        let meter = ProgressMeter::hidden();
        let outcome = downloader
            .download(URL, &temp.path().join("archive.zip"), 10, &meter)
            .unwrap();

        assert_eq!(outcome.mode, DownloadMode::Parallel);
        assert_eq!(outcome.chunks.len(), 4);
        assert!(outcome.chunks[3].ends_with("archive.zip.0003"));
        assert_eq!(concat(&outcome.chunks), data);
        assert_eq!(meter.progress(), meter.target());
    }

    #[test]
    fn test_simple_mode_without_ranges() {
        let temp = TempDir::new().unwrap();
        let data = payload(2500);
        let transport = MemoryTransport::without_ranges();
        transport.insert(URL, data.clone());

        let downloader = ChunkedDownloader::new(Arc::new(transport), config());
        let outcome = downloader
            .download(URL, &temp.path().join("archive.zip"), 10, &ProgressMeter::hidden())
            .unwrap();

        assert_eq!(outcome.mode, DownloadMode::Simple);
        assert_eq!(outcome.chunks.len(), 1);
        assert_eq!(concat(&outcome.chunks), data);
    }

    #[test]
    fn test_forced_simple_mode() {
        let temp = TempDir::new().unwrap();
        let transport = MemoryTransport::new();
        transport.insert(URL, payload(2500));

        let downloader =
            ChunkedDownloader::new(Arc::new(transport.clone()), config().with_force_simple(true));
        let outcome = downloader
            .download(URL, &temp.path().join("archive.zip"), 10, &ProgressMeter::hidden())
            .unwrap();

        assert_eq!(outcome.mode, DownloadMode::Simple);
        assert_eq!(transport.requests().len(), 1);
    }

    #[test]
    fn test_resume_skips_completed_chunks() {
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("archive.zip");
        let data = payload(3000);
        fs::write(chunk_path(&dest, 0), &data[..1000]).unwrap();
        fs::write(chunk_path(&dest, 1), &data[1000..1500]).unwrap();

        let transport = MemoryTransport::new();
        transport.insert(URL, data.clone());
        let downloader = ChunkedDownloader::new(Arc::new(transport.clone()), config());
        let meter = ProgressMeter::hidden();
        let outcome = downloader.download(URL, &dest, 10, &meter).unwrap();

        assert_eq!(outcome.resumed_bytes, 1500);
        assert_eq!(concat(&outcome.chunks), data);
        assert_eq!(transport.requested_bytes(URL), 1500);
        assert!(transport
            .requests()
            .iter()
            .all(|r| r.range.map(|range| range.start >= 1500).unwrap_or(false)));
        assert_eq!(meter.progress(), 3000);
    }

    #[test]
    fn test_transient_failures_recover() {
        let temp = TempDir::new().unwrap();
        let data = payload(2000);
        let transport = MemoryTransport::new();
        transport.insert(URL, data.clone());
        transport.push_fault(Fault::Status(502));
        transport.push_fault(Fault::DropAfter(100));

        let downloader = ChunkedDownloader::new(Arc::new(transport), config());
        let outcome = downloader
            .download(URL, &temp.path().join("archive.zip"), 10, &ProgressMeter::hidden())
            .unwrap();
        assert_eq!(concat(&outcome.chunks), data);
    }

    #[test]
    fn test_fatal_failure_reports_incomplete() {
        let temp = TempDir::new().unwrap();
        let transport = MemoryTransport::new();
        transport.insert(URL, payload(500));
        transport.push_fault(Fault::Status(403));

        let downloader = ChunkedDownloader::new(Arc::new(transport), config());
        let err = downloader
            .download(URL, &temp.path().join("archive.zip"), 10, &ProgressMeter::hidden())
            .unwrap_err();

        match err {
            BootstrapError::DownloadIncomplete { reason, expected, .. } => {
                assert!(reason.contains("403"));
                assert_eq!(expected, 500);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_probe_failure_is_fatal() {
        let temp = TempDir::new().unwrap();
        let downloader = ChunkedDownloader::new(Arc::new(MemoryTransport::new()), config());
        let err = downloader
            .download(URL, &temp.path().join("archive.zip"), 10, &ProgressMeter::hidden())
            .unwrap_err();
        assert!(matches!(err, BootstrapError::Transport(_)));
    }

    #[test]
    fn test_cancelled_before_start() {
        let temp = TempDir::new().unwrap();
        let transport = MemoryTransport::new();
        transport.insert(URL, payload(5000));
        let cancel = Arc::new(AtomicBool::new(true));

        let downloader = ChunkedDownloader::new(Arc::new(transport), config()).with_cancel(cancel);
        let err = downloader
            .download(URL, &temp.path().join("archive.zip"), 10, &ProgressMeter::hidden())
            .unwrap_err();
        assert!(matches!(err, BootstrapError::Cancelled));
    }

    /// Serves `inner` but raises `cancel` once `after` bytes have been read.
    struct CancelAfter {
        inner: MemoryTransport,
        cancel: Arc<AtomicBool>,
        after: Arc<Mutex<u64>>,
    }

    impl Transport for CancelAfter {
        fn probe(&self, url: &str) -> Result<RemoteInfo, TransportError> {
            self.inner.probe(url)
        }

        fn get(&self, url: &str, range: Option<ByteRange>) -> Result<Body, TransportError> {
            Ok(Box::new(CancellingBody {
                inner: self.inner.get(url, range)?,
                cancel: Arc::clone(&self.cancel),
                remaining: Arc::clone(&self.after),
            }))
        }
    }

    struct CancellingBody {
        inner: Body,
        cancel: Arc<AtomicBool>,
        remaining: Arc<Mutex<u64>>,
    }

    impl std::io::Read for CancellingBody {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let mut remaining = self.remaining.lock();
            if *remaining == 0 {
                return self.inner.read(buf);
            }
            let want = buf.len().min(*remaining as usize);
            let n = self.inner.read(&mut buf[..want])?;
            *remaining -= n as u64;
            if *remaining == 0 {
                self.cancel.store(true, Ordering::SeqCst);
            }
            Ok(n)
        }
    }

    #[test]
    fn test_cancel_mid_stream_then_resume() {
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("archive.zip");
        let data = payload(40_000);
        let transport = MemoryTransport::new();
        transport.insert(URL, data.clone());

        let cancel = Arc::new(AtomicBool::new(false));
        let cancelling = CancelAfter {
            inner: transport.clone(),
            cancel: Arc::clone(&cancel),
            after: Arc::new(Mutex::new(17_000)),
        };
        let first = ChunkedDownloader::new(Arc::new(cancelling), config().with_force_simple(true))
            .with_cancel(cancel);
        let err = first.download(URL, &dest, 10, &ProgressMeter::hidden()).unwrap_err();
        assert!(matches!(err, BootstrapError::Cancelled));
        assert_eq!(fs::metadata(chunk_path(&dest, 0)).unwrap().len(), 17_000);

        let second = ChunkedDownloader::new(Arc::new(transport.clone()), config().with_force_simple(true));
        let meter = ProgressMeter::hidden();
        let outcome = second.download(URL, &dest, 10, &meter).unwrap();

        assert_eq!(outcome.resumed_bytes, 17_000);
        assert_eq!(concat(&outcome.chunks), data);
        assert_eq!(transport.requests()[1].range, Some(ByteRange::from(17_000)));
        assert_eq!(meter.progress(), 40_000);
    }

    #[test]
    fn test_disk_full_preflight() {
        let temp = TempDir::new().unwrap();
        let transport = MemoryTransport::new();
        transport.insert(URL, payload(10));

        let downloader = ChunkedDownloader::new(Arc::new(transport.clone()), config());
        let err = downloader
            .download(URL, &temp.path().join("archive.zip"), u64::MAX, &ProgressMeter::hidden())
            .unwrap_err();
        assert!(matches!(err, BootstrapError::DiskFull { .. }));
        assert!(transport.requests().is_empty());
    }
}
