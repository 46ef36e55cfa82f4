//! End-to-end bootstrap of a destination root.
//!
//! One [`Bootstrap`] value owns every path and setting for a run:
//!
//! ```text
//! working dir ──► default manifest ──► config ──► space preflight
//!      │
//!      ▼
//! download (working/d) ──► SHA-512 via MultiPartFile ──► extract (working/u)
//!      │
//!      ▼
//! reconcile into root ──► remove working dir
//! ```
//!
//! Every step leaves enough on disk for the next run to resume.

use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use sha2::{Digest, Sha512};
use tracing::{info, warn};

use crate::checksum::{digests_equal, hash_reader};
use crate::config::{BootstrapConfig, DownloadConfig};
use crate::disk;
use crate::download::{remove_chunks, ChunkedDownloader, Transport};
use crate::error::{BootstrapError, BootstrapResult, TransportError};
use crate::extract::ZipExtractor;
use crate::manifest::{FileManifest, MANIFEST_FILE_NAME};
use crate::multipart::MultiPartFile;
use crate::progress::{ProgressMeter, ProgressOutput};
use crate::reconcile::{ConflictPrompt, ReconcileReport, Reconciler, UserPolicy};

/// Where the manifest is fetched from when the root has none.
pub const DEFAULT_MANIFEST_URL: &str = "https://downloads.binstrap.dev/latest/filehashes.json";

/// Name of the working directory under the destination root.
pub const WORKING_DIR_NAME: &str = "_temp";

/// Subdirectory of the working directory holding chunk files.
pub const DOWNLOAD_DIR_NAME: &str = "d";

/// Subdirectory of the working directory holding the unpacked archive.
pub const UNPACK_DIR_NAME: &str = "u";

/// Longest path the working directory layout may produce.
pub const PATH_BUDGET: usize = 260;

/// Room kept within [`PATH_BUDGET`] for archive and entry names.
const PATH_RESERVE: usize = 120;

/// Settings for a bootstrap run.
#[derive(Debug, Clone)]
pub struct BootstrapOptions {
    pub root_dir: PathBuf,
    pub keep_temp: bool,
    pub clean_temp: bool,
    pub user_policy: UserPolicy,
    pub default_manifest_url: String,
    pub download: DownloadConfig,
    pub progress: ProgressOutput,
}

impl BootstrapOptions {
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
            keep_temp: false,
            clean_temp: false,
            user_policy: UserPolicy::Ask,
            default_manifest_url: DEFAULT_MANIFEST_URL.to_string(),
            download: DownloadConfig::default(),
            progress: ProgressOutput::default(),
        }
    }

    /// Keep the working directory after a successful run.
    pub fn with_keep_temp(mut self, keep: bool) -> Self {
        self.keep_temp = keep;
        self
    }

    /// Delete the working directory before starting.
    pub fn with_clean_temp(mut self, clean: bool) -> Self {
        self.clean_temp = clean;
        self
    }

    pub fn with_user_policy(mut self, policy: UserPolicy) -> Self {
        self.user_policy = policy;
        self
    }

    pub fn with_default_manifest_url(mut self, url: impl Into<String>) -> Self {
        self.default_manifest_url = url.into();
        self
    }

    pub fn with_download_config(mut self, config: DownloadConfig) -> Self {
        self.download = config;
        self
    }

    pub fn with_progress(mut self, output: ProgressOutput) -> Self {
        self.progress = output;
        self
    }
}

/// What a successful run did.
#[derive(Debug, Clone)]
pub struct BootstrapSummary {
    /// Chunk files the archive was assembled from.
    pub chunks: Vec<PathBuf>,
    /// Bytes fetched during this run, excluding resumed bytes.
    pub bytes_downloaded: u64,
    pub report: ReconcileReport,
    /// Whether the working directory was removed.
    pub cleaned_up: bool,
    pub working_dir: PathBuf,
}

/// A single bootstrap run.
pub struct Bootstrap {
    options: BootstrapOptions,
    transport: Arc<dyn Transport>,
    prompt: Box<dyn ConflictPrompt>,
    cancel: Arc<AtomicBool>,
    working_dir: PathBuf,
}

impl std::fmt::Debug for Bootstrap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bootstrap")
            .field("options", &self.options)
            .field("working_dir", &self.working_dir)
            .finish_non_exhaustive()
    }
}

impl Bootstrap {
    pub fn new(
        options: BootstrapOptions,
        transport: Arc<dyn Transport>,
        prompt: Box<dyn ConflictPrompt>,
        cancel: Arc<AtomicBool>,
    ) -> Self {
        let working_dir = working_dir_for(&options.root_dir, std::env::temp_dir().as_path());
        Self {
            options,
            transport,
            prompt,
            cancel,
            working_dir,
        }
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub fn download_dir(&self) -> PathBuf {
        self.working_dir.join(DOWNLOAD_DIR_NAME)
    }

    pub fn unpack_dir(&self) -> PathBuf {
        self.working_dir.join(UNPACK_DIR_NAME)
    }

    /// Run every step in order.
    pub fn run(&mut self) -> BootstrapResult<BootstrapSummary> {
        let root = self.options.root_dir.clone();
        if !root.is_dir() {
            return Err(BootstrapError::io(
                &root,
                io::Error::new(io::ErrorKind::NotFound, "destination root is not a directory"),
            ));
        }
        info!(root = %root.display(), working = %self.working_dir.display(), "Starting bootstrap");

        self.prepare_working_dir()?;
        self.check_cancel()?;

        // Local checks first; nothing is fetched for a bad config or a full disk.
        let config = BootstrapConfig::load(&root)?;
        disk::ensure_free_space(&root, config.expected_uncompressed_size)?;

        self.ensure_root_manifest()?;
        let old_manifest = FileManifest::load(&FileManifest::path_in(&root))?;
        self.check_cancel()?;

        let archive_name = config
            .archive_file_name()
            .ok_or_else(|| BootstrapError::ConfigInvalid {
                path: BootstrapConfig::path_in(&root),
                reason: format!("url has no file name: {}", config.url),
            })?;
        let archive_path = self.download_dir().join(archive_name);

        let downloader = ChunkedDownloader::new(Arc::clone(&self.transport), self.options.download.clone())
            .with_cancel(Arc::clone(&self.cancel));
        let outcome = downloader.download(
            &config.url,
            &archive_path,
            config.expected_uncompressed_size,
            &self.meter(),
        )?;
        self.check_cancel()?;

        self.verify_checksum(&config, &archive_path, &outcome.chunks)?;
        self.check_cancel()?;

        let unpack_dir = self.unpack_dir();
        if unpack_dir.exists() {
            fs::remove_dir_all(&unpack_dir).map_err(|e| BootstrapError::io(&unpack_dir, e))?;
        }
        let archive = MultiPartFile::open(&outcome.chunks).map_err(|e| BootstrapError::io(&archive_path, e))?;
        let extract_meter = self.meter();
        let summary = ZipExtractor::new(&extract_meter, &self.cancel).extract(archive, &archive_path, &unpack_dir)?;
        info!(
            files = summary.files,
            directories = summary.directories,
            bytes = summary.uncompressed_bytes,
            "Archive unpacked"
        );
        self.check_cancel()?;

        let new_manifest = FileManifest::load(&unpack_dir.join(MANIFEST_FILE_NAME))?;
        let reconcile_meter = self.meter();
        let report = Reconciler::new(&unpack_dir, &root, &reconcile_meter, &self.cancel)
            .with_policy(self.options.user_policy)
            .with_uncompressed_size(config.expected_uncompressed_size)
            .run(&old_manifest, &new_manifest, self.prompt.as_mut())?;

        let cleaned_up = !self.options.keep_temp && self.remove_working_dir();

        Ok(BootstrapSummary {
            chunks: outcome.chunks,
            bytes_downloaded: outcome.content_length - outcome.resumed_bytes,
            report,
            cleaned_up,
            working_dir: self.working_dir.clone(),
        })
    }

    fn meter(&self) -> ProgressMeter {
        ProgressMeter::new(self.options.progress.clone())
    }

    fn prepare_working_dir(&self) -> BootstrapResult<()> {
        if self.options.clean_temp && self.working_dir.exists() {
            info!(path = %self.working_dir.display(), "Removing working directory");
            fs::remove_dir_all(&self.working_dir).map_err(|e| BootstrapError::io(&self.working_dir, e))?;
        }
        for dir in [self.download_dir(), self.unpack_dir()] {
            fs::create_dir_all(&dir).map_err(|e| BootstrapError::io(&dir, e))?;
        }
        Ok(())
    }

    /// Fetch the default manifest when the root has none.
    fn ensure_root_manifest(&self) -> BootstrapResult<()> {
        let root_manifest = FileManifest::path_in(&self.options.root_dir);
        if root_manifest.exists() {
            return Ok(());
        }

        let url = &self.options.default_manifest_url;
        info!(url = %url, "No manifest at destination, fetching default");

        let mut body = self.transport.get(url, None)?;
        let mut bytes = Vec::new();
        body.read_to_end(&mut bytes)
            .map_err(|e| TransportError::transient(url.as_str(), e.to_string()))?;

        let fetched = self.working_dir.join(MANIFEST_FILE_NAME);
        fs::write(&fetched, &bytes).map_err(|e| BootstrapError::io(&fetched, e))?;
        FileManifest::load(&fetched)?;
        fs::copy(&fetched, &root_manifest).map_err(|e| BootstrapError::io(&root_manifest, e))?;
        Ok(())
    }

    fn verify_checksum(&self, config: &BootstrapConfig, archive_path: &Path, chunks: &[PathBuf]) -> BootstrapResult<()> {
        let mut archive = MultiPartFile::open(chunks).map_err(|e| BootstrapError::io(archive_path, e))?;
        let meter = self.meter();
        meter.add_target(archive.len());

        let actual = {
            let _progress = meter.scoped("Verifying");
            hash_reader(&mut archive, |n| meter.record_progress(n))
                .map_err(|e| BootstrapError::io(archive_path, e))?
        };

        if digests_equal(&actual, &config.expected_checksum) {
            info!(path = %archive_path.display(), "Checksum verified");
            return Ok(());
        }

        drop(archive);
        if self.options.keep_temp {
            warn!(path = %archive_path.display(), "Corrupt download kept");
        } else {
            match remove_chunks(archive_path) {
                Ok(removed) => info!(removed, "Removed corrupt chunk files"),
                Err(e) => warn!(error = %e, "Could not remove corrupt chunk files"),
            }
        }

        Err(BootstrapError::ChecksumMismatch {
            url: config.url.clone(),
            expected: config.expected_checksum.to_ascii_lowercase(),
            actual,
        })
    }

    fn remove_working_dir(&self) -> bool {
        match fs::remove_dir_all(&self.working_dir) {
            Ok(()) => {
                info!(path = %self.working_dir.display(), "Removed working directory");
                true
            }
            Err(e) => {
                warn!(path = %self.working_dir.display(), error = %e, "Could not remove working directory");
                false
            }
        }
    }

    fn check_cancel(&self) -> BootstrapResult<()> {
        if self.cancel.load(Ordering::SeqCst) {
            Err(BootstrapError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Working directory for `root`: `<root>/_temp`, or a directory under
/// `temp_dir` named after a hash of the root when `<root>/_temp` leaves
/// too little room within [`PATH_BUDGET`].
pub fn working_dir_for(root: &Path, temp_dir: &Path) -> PathBuf {
    let preferred = root.join(WORKING_DIR_NAME);
    if preferred.as_os_str().len() + PATH_RESERVE <= PATH_BUDGET {
        return preferred;
    }

    let digest = Sha512::digest(root.as_os_str().as_encoded_bytes());
    let tag: String = digest.iter().take(8).map(|b| format!("{b:02x}")).collect();
    temp_dir.join(format!("binstrap-{tag}"))
}
