//! Command-line arguments.

use std::path::PathBuf;

use binstrap::config::{DownloadConfig, DEFAULT_MAX_RETRIES, DEFAULT_THREAD_COUNT, DEFAULT_TIMEOUT_SECS};
use binstrap::reconcile::UserPolicy;
use clap::Parser;

/// Fetch, verify and install the prebuilt binaries for a working tree.
#[derive(Debug, Clone, Parser)]
#[command(name = "binstrap", version, about)]
pub struct Args {
    /// Destination root (default: directory of this executable)
    #[arg(long = "rootDir", value_name = "PATH")]
    pub root_dir: Option<PathBuf>,

    /// Keep the working directory after a successful run
    #[arg(short = 'k', long = "keep")]
    pub keep: bool,

    /// Delete the working directory before starting
    #[arg(short = 'c', long = "clean")]
    pub clean: bool,

    /// Log informational messages
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,

    /// Do not ask for confirmation before starting
    #[arg(short = 's', long = "skipWarning")]
    pub skip_warning: bool,

    /// Overwrite every locally modified file without asking
    #[arg(short = 'y', long = "yes", conflicts_with = "no")]
    pub yes: bool,

    /// Keep every locally modified file without asking
    #[arg(short = 'n', long = "no")]
    pub no: bool,

    /// Fetch the default manifest from this URL instead
    #[arg(long = "overrideDefaultHashfileURL", value_name = "URL")]
    pub default_manifest_url: Option<String>,

    /// Number of download threads
    #[arg(long, value_name = "N", default_value_t = DEFAULT_THREAD_COUNT)]
    pub threads: usize,

    /// Retries per chunk before giving up
    #[arg(long, value_name = "N", default_value_t = DEFAULT_MAX_RETRIES)]
    pub retries: u32,

    /// HTTP timeout in seconds
    #[arg(long, value_name = "SECS", default_value_t = DEFAULT_TIMEOUT_SECS)]
    pub timeout: u64,

    /// Download with a single sequential request
    #[arg(long)]
    pub simple: bool,
}

impl Args {
    pub fn user_policy(&self) -> UserPolicy {
        if self.yes {
            UserPolicy::AssumeMove
        } else if self.no {
            UserPolicy::AssumeSkip
        } else {
            UserPolicy::Ask
        }
    }

    pub fn download_config(&self) -> DownloadConfig {
        DownloadConfig::new()
            .with_thread_count(self.threads)
            .with_max_retries(self.retries)
            .with_timeout(std::time::Duration::from_secs(self.timeout))
            .with_force_simple(self.simple)
    }
}
