//! Log setup: stderr for the user plus a plain log file in the root.

use std::io;
use std::path::Path;

use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// File name of the log written to the destination root.
pub const LOG_FILE_NAME: &str = "binstrap.log";

/// Install the global subscriber.
///
/// Stderr shows warnings, or informational messages with `verbose`;
/// `RUST_LOG` overrides either. The log file always records at info level.
/// The returned guard flushes the file on drop and must be held until exit.
pub fn init(root: &Path, verbose: bool) -> Option<WorkerGuard> {
    let default_level = if verbose { LevelFilter::INFO } else { LevelFilter::WARN };
    let stderr_filter = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy();

    let stderr_layer = fmt::layer()
        .with_writer(io::stderr)
        .with_target(false)
        .with_filter(stderr_filter);

    // The root is validated later; never create it just to hold the log.
    let appender = if root.is_dir() {
        RollingFileAppender::builder()
            .rotation(Rotation::NEVER)
            .filename_prefix(LOG_FILE_NAME)
            .build(root)
            .map_err(|e| e.to_string())
    } else {
        Err("destination root does not exist".to_string())
    };

    let (file_layer, guard, file_error) = match appender {
        Ok(appender) => {
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_ansi(false)
                .with_writer(writer)
                .with_thread_names(true)
                .with_filter(LevelFilter::INFO);
            (Some(layer), Some(guard), None)
        }
        Err(e) => (None, None, Some(e)),
    };

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .init();

    if let Some(e) = file_error {
        tracing::warn!(root = %root.display(), error = %e, "Log file disabled");
    }
    guard
}
