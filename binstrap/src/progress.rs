//! Thread-safe progress meter with a background terminal reporter.
//!
//! Workers call [`ProgressMeter::record_progress`] from any thread; a
//! reporter thread wakes every 250 ms and rewrites a single status line.
//!
//! ```text
//! Downloading:  42.0%  420.0 MiB / 1000.0 MiB  12.3 MiB/s  ETA 00:47
//! ```

use std::collections::VecDeque;
use std::io::{self, Write};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Interval between reporter updates.
pub const REPORT_INTERVAL: Duration = Duration::from_millis(250);

/// Maximum number of rate samples kept (about ten seconds of history).
pub const MAX_SAMPLES: usize = 40;

/// Rates below this many bytes per second are treated as stalled.
const MIN_RATE: f64 = 1e-3;

/// Counters shared between workers and the reporter.
#[derive(Debug, Clone, Default)]
pub struct ProgressState {
    pub target: u64,
    pub progress: u64,
    samples: VecDeque<(u64, Instant)>,
}

impl ProgressState {
    /// Push a rate sample, discarding the oldest beyond [`MAX_SAMPLES`].
    pub fn sample(&mut self, now: Instant) {
        self.samples.push_back((self.progress, now));
        while self.samples.len() > MAX_SAMPLES {
            self.samples.pop_front();
        }
    }

    /// Bytes per second across the sample window.
    pub fn rate(&self) -> f64 {
        match (self.samples.front(), self.samples.back()) {
            (Some(&(first, t0)), Some(&(last, t1))) => {
                let elapsed = t1.duration_since(t0).as_secs_f64();
                if elapsed <= 0.0 {
                    0.0
                } else {
                    last.saturating_sub(first) as f64 / elapsed
                }
            }
            _ => 0.0,
        }
    }

    /// Estimated time to completion, `None` while stalled.
    pub fn eta(&self) -> Option<Duration> {
        let rate = self.rate();
        if rate < MIN_RATE {
            return None;
        }
        let remaining = self.target.saturating_sub(self.progress) as f64;
        Some(Duration::from_secs_f64(remaining / rate))
    }

    /// Percent complete, clamped to 100.
    pub fn percent(&self) -> f64 {
        if self.target == 0 {
            return 100.0;
        }
        (self.progress as f64 / self.target as f64 * 100.0).min(100.0)
    }

    /// Render the status line for `label`.
    pub fn render(&self, label: &str) -> String {
        let eta = self
            .eta()
            .map(format_eta)
            .unwrap_or_else(|| "--:--".to_string());
        format!(
            "{}: {:5.1}%  {} / {}  {}/s  ETA {}",
            label,
            self.percent(),
            format_bytes(self.progress),
            format_bytes(self.target),
            format_bytes(self.rate() as u64),
            eta
        )
    }
}

/// Where progress lines are written.
#[derive(Clone, Default)]
pub enum ProgressOutput {
    /// Standard error.
    #[default]
    Stderr,
    /// Discard everything.
    Hidden,
    /// Shared in-memory buffer, used to inspect output.
    Buffer(Arc<Mutex<Vec<u8>>>),
}

impl std::fmt::Debug for ProgressOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stderr => write!(f, "Stderr"),
            Self::Hidden => write!(f, "Hidden"),
            Self::Buffer(_) => write!(f, "Buffer"),
        }
    }
}

struct BufferWriter(Arc<Mutex<Vec<u8>>>);

impl Write for BufferWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl ProgressOutput {
    fn writer(&self) -> Box<dyn Write + Send> {
        match self {
            Self::Stderr => Box::new(io::stderr()),
            Self::Hidden => Box::new(io::sink()),
            Self::Buffer(buf) => Box::new(BufferWriter(Arc::clone(buf))),
        }
    }
}

/// Writes carriage-return terminated lines that fully overwrite the
/// previous one.
struct LineEmitter {
    sink: Box<dyn Write + Send>,
    last_len: usize,
}

impl LineEmitter {
    fn emit(&mut self, line: &str, terminator: char) {
        let pad = self.last_len.saturating_sub(line.chars().count());
        self.last_len = line.chars().count();
        // Terminal write errors are not worth failing a download over.
        let _ = write!(self.sink, "{}{}{}", line, " ".repeat(pad), terminator);
        let _ = self.sink.flush();
    }
}

struct Reporter {
    stop_tx: Sender<()>,
    handle: JoinHandle<LineEmitter>,
}

struct Shared {
    state: Mutex<ProgressState>,
    label: Mutex<String>,
    output: ProgressOutput,
    reporter: Mutex<Option<Reporter>>,
}

impl Shared {
    fn current_line(&self) -> String {
        let mut state = self.state.lock();
        state.sample(Instant::now());
        state.render(&self.label.lock())
    }
}

/// Cloneable handle to a progress accumulator.
#[derive(Clone)]
pub struct ProgressMeter {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for ProgressMeter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("ProgressMeter")
            .field("target", &state.target)
            .field("progress", &state.progress)
            .finish()
    }
}

impl ProgressMeter {
    pub fn new(output: ProgressOutput) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(ProgressState::default()),
                label: Mutex::new(String::new()),
                output,
                reporter: Mutex::new(None),
            }),
        }
    }

    /// A meter that never prints.
    pub fn hidden() -> Self {
        Self::new(ProgressOutput::Hidden)
    }

    pub fn add_target(&self, bytes: u64) {
        self.shared.state.lock().target += bytes;
    }

    pub fn record_progress(&self, bytes: u64) {
        self.shared.state.lock().progress += bytes;
    }

    /// Take back bytes that were recorded but later discarded.
    pub fn rewind(&self, bytes: u64) {
        let mut state = self.shared.state.lock();
        state.progress = state.progress.saturating_sub(bytes);
    }

    pub fn target(&self) -> u64 {
        self.shared.state.lock().target
    }

    pub fn progress(&self) -> u64 {
        self.shared.state.lock().progress
    }

    /// Point-in-time copy of the counters.
    pub fn snapshot(&self) -> ProgressState {
        self.shared.state.lock().clone()
    }

    /// Start the reporter thread. Calling this while running only updates
    /// the label.
    pub fn start(&self, label: &str) {
        *self.shared.label.lock() = label.to_string();

        let mut reporter = self.shared.reporter.lock();
        if reporter.is_some() {
            return;
        }

        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        // Weak so that dropping every handle also ends the thread.
        let weak = Arc::downgrade(&self.shared);
        let mut emitter = LineEmitter {
            sink: self.shared.output.writer(),
            last_len: 0,
        };

        let spawned = thread::Builder::new()
            .name("progress-reporter".to_string())
            .spawn(move || {
                loop {
                    let Some(shared) = weak.upgrade() else {
                        break;
                    };
                    let line = shared.current_line();
                    drop(shared);
                    emitter.emit(&line, '\r');

                    match stop_rx.recv_timeout(REPORT_INTERVAL) {
                        Err(RecvTimeoutError::Timeout) => continue,
                        _ => break,
                    }
                }
                emitter
            });

        match spawned {
            Ok(handle) => *reporter = Some(Reporter { stop_tx, handle }),
            Err(e) => tracing::debug!(error = %e, "Progress reporter not started"),
        }
    }

    /// Stop the reporter, emitting one final line.
    pub fn stop(&self) {
        let Some(reporter) = self.shared.reporter.lock().take() else {
            return;
        };
        let _ = reporter.stop_tx.send(());

        if let Ok(mut emitter) = reporter.handle.join() {
            emitter.emit(&self.shared.current_line(), '\n');
        }
    }

    /// Start reporting and return a guard that stops on drop.
    pub fn scoped(&self, label: &str) -> ProgressGuard {
        self.start(label);
        ProgressGuard {
            meter: self.clone(),
        }
    }
}

/// Stops the owning meter when dropped.
#[must_use = "the reporter stops as soon as the guard is dropped"]
pub struct ProgressGuard {
    meter: ProgressMeter,
}

impl Drop for ProgressGuard {
    fn drop(&mut self) {
        self.meter.stop();
    }
}

/// Format a byte count using binary units.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

fn format_eta(eta: Duration) -> String {
    let secs = eta.as_secs();
    if secs >= 3600 {
        format!("{}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
    } else {
        format!("{:02}:{:02}", secs / 60, secs % 60)
    }
}
