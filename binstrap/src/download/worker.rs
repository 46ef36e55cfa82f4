//! Per-job download logic run by each worker thread.
//!
//! A job owns exactly one chunk file and only ever appends to it, so the
//! file size is the resume cursor. Retries restart the job, which re-stats
//! the file and continues from wherever the failed attempt stopped.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, error, warn};

use super::plan::DownloadJob;
use super::transport::{Body, ByteRange, Transport};
use crate::error::{BootstrapError, BootstrapResult, TransportError};
use crate::progress::ProgressMeter;

/// Size of one read from a response body (64KB).
const BLOCK_SIZE: usize = 64 * 1024;

/// Granularity of cancellation checks while waiting to retry.
const CANCEL_POLL: Duration = Duration::from_millis(50);

/// How a job's bytes are requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FetchMode {
    /// Sequential closed ranges of at most `segment_size` bytes.
    Segmented { segment_size: u64 },
    /// One GET for the whole job; `resume` continues partial files with an
    /// open-ended range, otherwise partial files are discarded.
    Stream { resume: bool },
}

/// Everything a worker shares with its siblings.
pub(crate) struct WorkerContext<'a> {
    pub transport: &'a dyn Transport,
    pub meter: &'a ProgressMeter,
    pub cancel: &'a AtomicBool,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl WorkerContext<'_> {
    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }
}

/// Jobs waiting for a worker. Filled once, drained by many threads.
pub(crate) struct JobQueue {
    jobs: Mutex<VecDeque<DownloadJob>>,
}

impl JobQueue {
    pub fn new(jobs: Vec<DownloadJob>) -> Self {
        Self {
            jobs: Mutex::new(jobs.into()),
        }
    }

    pub fn pop(&self) -> Option<DownloadJob> {
        self.jobs.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().len()
    }
}

/// A job that gave up, with the error that ended it.
#[derive(Debug)]
pub(crate) struct JobFailure {
    pub index: usize,
    pub error: BootstrapError,
}

/// Drain `queue` until it is empty or the run is cancelled.
pub(crate) fn run_worker(
    ctx: &WorkerContext<'_>,
    queue: &JobQueue,
    mode: FetchMode,
    failures: &Mutex<Vec<JobFailure>>,
) {
    while !ctx.cancelled() {
        let Some(job) = queue.pop() else {
            break;
        };

        if let Err(error) = fetch_with_retry(ctx, &job, mode) {
            if !matches!(error, BootstrapError::Cancelled) {
                error!(chunk = job.index, error = %error, "Chunk download failed");
            }
            failures.lock().push(JobFailure {
                index: job.index,
                error,
            });
        }
    }
}

/// Fetch one job, retrying the whole chunk on transient errors.
pub(crate) fn fetch_with_retry(
    ctx: &WorkerContext<'_>,
    job: &DownloadJob,
    mode: FetchMode,
) -> BootstrapResult<()> {
    let mut attempt = 0u32;
    loop {
        match fetch_job(ctx, job, mode) {
            Ok(()) => return Ok(()),
            Err(BootstrapError::Transport(e)) if e.is_transient() && attempt < ctx.max_retries => {
                attempt += 1;
                warn!(
                    chunk = job.index,
                    attempt,
                    max_retries = ctx.max_retries,
                    error = %e,
                    "Retrying chunk"
                );
                wait_unless_cancelled(ctx, ctx.retry_delay * attempt);
                if ctx.cancelled() {
                    return Err(BootstrapError::Cancelled);
                }
            }
            Err(e) => return Err(e),
        }
    }
}

fn fetch_job(ctx: &WorkerContext<'_>, job: &DownloadJob, mode: FetchMode) -> BootstrapResult<()> {
    let path = job.dest_path.as_path();
    let len = job.len();
    let mut existing = file_len(path)?;

    if existing > len {
        // Only ever appended to, so the first `len` bytes are still good.
        warn!(chunk = job.index, existing, expected = len, "Chunk larger than planned, trimming");
        let file = OpenOptions::new()
            .write(true)
            .open(path)
            .map_err(|e| BootstrapError::io(path, e))?;
        file.set_len(len).map_err(|e| BootstrapError::io(path, e))?;
        existing = len;
    }

    if job.is_complete(existing) {
        debug!(chunk = job.index, "Chunk already complete");
        return Ok(());
    }

    match mode {
        FetchMode::Segmented { segment_size } => {
            let mut file = open_append(path)?;
            let span = segment_size.max(1);
            let mut offset = job.start + existing;
            while offset <= job.end {
                let seg_end = offset.saturating_add(span - 1).min(job.end);
                let range = ByteRange::new(offset, seg_end);
                let body = ctx.transport.get(&job.url, Some(range))?;
                copy_body(ctx, &job.url, body, &mut file, path, seg_end - offset + 1)?;
                offset = seg_end + 1;
            }
        }
        FetchMode::Stream { resume } => {
            let range = if existing > 0 && resume {
                Some(ByteRange::from(job.start + existing))
            } else {
                if existing > 0 {
                    debug!(chunk = job.index, existing, "Server cannot resume, restarting");
                    File::create(path).map_err(|e| BootstrapError::io(path, e))?;
                    ctx.meter.rewind(existing);
                    existing = 0;
                }
                None
            };
            let mut file = open_append(path)?;
            let body = ctx.transport.get(&job.url, range)?;
            copy_body(ctx, &job.url, body, &mut file, path, len - existing)?;
        }
    }

    debug!(chunk = job.index, bytes = len, "Chunk complete");
    Ok(())
}

/// Append exactly `expected` bytes from `body` to `file`.
fn copy_body(
    ctx: &WorkerContext<'_>,
    url: &str,
    mut body: Body,
    file: &mut File,
    path: &Path,
    expected: u64,
) -> BootstrapResult<()> {
    let mut buffer = vec![0u8; BLOCK_SIZE];
    let mut remaining = expected;

    while remaining > 0 {
        if ctx.cancelled() {
            return Err(BootstrapError::Cancelled);
        }

        let want = remaining.min(BLOCK_SIZE as u64) as usize;
        let n = match body.read(&mut buffer[..want]) {
            Ok(0) => {
                return Err(TransportError::transient(
                    url,
                    format!(
                        "connection closed with {} of {} bytes outstanding",
                        remaining, expected
                    ),
                )
                .into())
            }
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(TransportError::transient(url, e.to_string()).into()),
        };

        file.write_all(&buffer[..n])
            .and_then(|_| file.flush())
            .map_err(|e| BootstrapError::io(path, e))?;
        ctx.meter.record_progress(n as u64);
        remaining -= n as u64;
    }

    Ok(())
}

fn open_append(path: &Path) -> BootstrapResult<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| BootstrapError::io(path, e))
}

/// Size of `path`, zero if it does not exist.
pub(crate) fn file_len(path: &Path) -> BootstrapResult<u64> {
    match path.metadata() {
        Ok(metadata) => Ok(metadata.len()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(BootstrapError::io(path, e)),
    }
}

fn wait_unless_cancelled(ctx: &WorkerContext<'_>, delay: Duration) {
    let deadline = Instant::now() + delay;
    while !ctx.cancelled() {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        thread::sleep(CANCEL_POLL.min(deadline - now));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::memory::{Fault, MemoryTransport};
    use crate::download::plan::{plan_chunks, DownloadJob};
    use std::fs;
    use tempfile::TempDir;

    const URL: &str = "https://mirror.example/archive.zip";

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    struct Fixture {
        _temp: TempDir,
        transport: MemoryTransport,
        meter: ProgressMeter,
        cancel: AtomicBool,
        data: Vec<u8>,
        jobs: Vec<DownloadJob>,
    }

    impl Fixture {
        fn new(len: usize, chunk_size: u64) -> Self {
            let temp = TempDir::new().unwrap();
            let data = payload(len);
            let transport = MemoryTransport::new();
            transport.insert(URL, data.clone());
            let dest = temp.path().join("archive.zip");
            let jobs = plan_chunks(&dest, len as u64, chunk_size)
                .iter()
                .map(|c| DownloadJob::for_chunk(c, URL))
                .collect();
            Self {
                _temp: temp,
                transport,
                meter: ProgressMeter::hidden(),
                cancel: AtomicBool::new(false),
                data,
                jobs,
            }
        }

        fn ctx(&self, max_retries: u32) -> WorkerContext<'_> {
            WorkerContext {
                transport: &self.transport,
                meter: &self.meter,
                cancel: &self.cancel,
                max_retries,
                retry_delay: Duration::ZERO,
            }
        }

        fn chunk_bytes(&self, job: &DownloadJob) -> &[u8] {
            &self.data[job.start as usize..=job.end as usize]
        }
    }

    #[test]
    fn test_segmented_fetch_writes_chunk() {
        let fx = Fixture::new(1000, 1000);
        let job = &fx.jobs[0];

        fetch_with_retry(&fx.ctx(0), job, FetchMode::Segmented { segment_size: 300 }).unwrap();

        assert_eq!(fs::read(&job.dest_path).unwrap(), fx.chunk_bytes(job));
        assert_eq!(fx.meter.progress(), 1000);
        // 300 + 300 + 300 + 100
        assert_eq!(fx.transport.requests().len(), 4);
    }

    #[test]
    fn test_resumes_from_existing_size() {
        let fx = Fixture::new(1000, 500);
        let job = &fx.jobs[1];
        fs::write(&job.dest_path, &fx.chunk_bytes(job)[..200]).unwrap();

        fetch_with_retry(&fx.ctx(0), job, FetchMode::Segmented { segment_size: 1000 }).unwrap();

        assert_eq!(fs::read(&job.dest_path).unwrap(), fx.chunk_bytes(job));
        let requests = fx.transport.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].range, Some(ByteRange::new(700, 999)));
        assert_eq!(fx.meter.progress(), 300);
    }

    #[test]
    fn test_complete_chunk_is_skipped() {
        let fx = Fixture::new(100, 100);
        let job = &fx.jobs[0];
        fs::write(&job.dest_path, fx.chunk_bytes(job)).unwrap();

        fetch_with_retry(&fx.ctx(0), job, FetchMode::Segmented { segment_size: 10 }).unwrap();
        assert!(fx.transport.requests().is_empty());
    }

    #[test]
    fn test_oversized_chunk_is_trimmed() {
        let fx = Fixture::new(100, 50);
        let job = &fx.jobs[0];
        let mut bytes = fx.chunk_bytes(job).to_vec();
        bytes.extend_from_slice(b"garbage");
        fs::write(&job.dest_path, bytes).unwrap();

        fetch_with_retry(&fx.ctx(0), job, FetchMode::Segmented { segment_size: 10 }).unwrap();
        assert_eq!(fs::read(&job.dest_path).unwrap(), fx.chunk_bytes(job));
    }

    #[test]
    fn test_dropped_connection_is_retried_and_resumed() {
        let fx = Fixture::new(1000, 1000);
        let job = &fx.jobs[0];
        fx.transport.push_fault(Fault::DropAfter(250));

        fetch_with_retry(&fx.ctx(2), job, FetchMode::Segmented { segment_size: 1000 }).unwrap();

        assert_eq!(fs::read(&job.dest_path).unwrap(), fx.chunk_bytes(job));
        assert_eq!(fx.meter.progress(), 1000);
        let requests = fx.transport.requests();
        assert_eq!(requests[1].range, Some(ByteRange::new(250, 999)));
    }

    #[test]
    fn test_retries_exhausted_keeps_root_cause() {
        let fx = Fixture::new(100, 100);
        for _ in 0..3 {
            fx.transport.push_fault(Fault::Status(503));
        }

        let err = fetch_with_retry(&fx.ctx(2), &fx.jobs[0], FetchMode::Segmented { segment_size: 100 })
            .unwrap_err();
        assert!(err.to_string().contains("503"));
        assert_eq!(fx.transport.requests().len(), 3);
    }

    #[test]
    fn test_fatal_error_is_not_retried() {
        let fx = Fixture::new(100, 100);
        fx.transport.push_fault(Fault::Tls);

        let err = fetch_with_retry(&fx.ctx(5), &fx.jobs[0], FetchMode::Segmented { segment_size: 100 })
            .unwrap_err();
        assert!(matches!(err, BootstrapError::Transport(TransportError::Fatal { .. })));
        assert_eq!(fx.transport.requests().len(), 1);
    }

    #[test]
    fn test_cancel_stops_between_blocks() {
        let fx = Fixture::new(100, 100);
        fx.cancel.store(true, Ordering::SeqCst);

        let err = fetch_with_retry(&fx.ctx(0), &fx.jobs[0], FetchMode::Segmented { segment_size: 100 })
            .unwrap_err();
        assert!(matches!(err, BootstrapError::Cancelled));
    }

    #[test]
    fn test_zero_segment_size_fetches_single_bytes() {
        let fx = Fixture::new(5, 5);
        let job = &fx.jobs[0];

        fetch_with_retry(&fx.ctx(0), job, FetchMode::Segmented { segment_size: 0 }).unwrap();

        assert_eq!(fs::read(&job.dest_path).unwrap(), fx.chunk_bytes(job));
        assert_eq!(fx.transport.requests().len(), 5);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_full_disk_mid_chunk_is_fatal() {
        let fx = Fixture::new(100, 100);
        let body = fx.transport.get(URL, None).unwrap();
        let full = Path::new("/dev/full");
        let mut file = OpenOptions::new().write(true).open(full).unwrap();

        let err = copy_body(&fx.ctx(3), URL, body, &mut file, full, 100).unwrap_err();

        match err {
            BootstrapError::Io { path, source } => {
                assert_eq!(path, full);
                assert_eq!(source.raw_os_error(), Some(28)); // ENOSPC
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(fx.meter.progress(), 0);
    }

    #[test]
    fn test_unwritable_chunk_is_not_retried() {
        let fx = Fixture::new(100, 100);
        let job = &fx.jobs[0];
        fs::create_dir(&job.dest_path).unwrap();

        let err = fetch_with_retry(&fx.ctx(5), job, FetchMode::Segmented { segment_size: 50 })
            .unwrap_err();

        assert!(matches!(err, BootstrapError::Io { .. }));
        assert!(fx.transport.requests().is_empty());
    }

    #[test]
    fn test_stream_without_resume_restarts_partial_file() {
        let fx = Fixture::new(300, 300);
        let job = &fx.jobs[0];
        fs::write(&job.dest_path, b"stale").unwrap();
        fx.meter.record_progress(5);

        fetch_with_retry(&fx.ctx(0), job, FetchMode::Stream { resume: false }).unwrap();

        assert_eq!(fs::read(&job.dest_path).unwrap(), fx.data);
        assert_eq!(fx.meter.progress(), 300);
        assert_eq!(fx.transport.requests()[0].range, None);
    }

    #[test]
    fn test_stream_with_resume_requests_open_range() {
        let fx = Fixture::new(300, 300);
        let job = &fx.jobs[0];
        fs::write(&job.dest_path, &fx.data[..100]).unwrap();

        fetch_with_retry(&fx.ctx(0), job, FetchMode::Stream { resume: true }).unwrap();

        assert_eq!(fs::read(&job.dest_path).unwrap(), fx.data);
        assert_eq!(fx.transport.requests()[0].range, Some(ByteRange::from(100)));
    }

    #[test]
    fn test_worker_drains_queue_and_records_failures() {
        let fx = Fixture::new(300, 100);
        let missing = DownloadJob {
            index: 7,
            url: "https://mirror.example/missing".to_string(),
            dest_path: fx.jobs[0].dest_path.with_extension("missing"),
            ..fx.jobs[0].clone()
        };
        let mut jobs = fx.jobs.clone();
        jobs.push(missing);
        let queue = JobQueue::new(jobs);
        let failures = Mutex::new(Vec::new());

        run_worker(
            &fx.ctx(0),
            &queue,
            FetchMode::Segmented { segment_size: 64 },
            &failures,
        );

        assert_eq!(queue.len(), 0);
        let failures = failures.into_inner();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].index, 7);
    }
}
