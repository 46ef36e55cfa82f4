//! Bringing the destination tree in line with a freshly unpacked archive.
//!
//! Reconciliation runs in three passes on the calling thread:
//!
//! ```text
//! classify  old ∪ new manifest paths vs. disk   (read only)
//!    │
//! prompt    ChangedConflict -> Move | Skip     (ConflictPrompt / policy)
//!    │
//! apply     copy / skip / delete, then save the new manifest
//! ```
//!
//! A destination file is only overwritten when it still matches the old
//! manifest, already matches the new one, or the user approved it.

mod apply;
mod classify;
mod prompt;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{info, warn};

pub use classify::{Classification, ClassifiedPath};
pub use prompt::{Answer, ConflictPrompt, ConflictResolver, NoPrompt, Resolution, ScriptedPrompt, UserPolicy};

use crate::error::{BootstrapError, BootstrapResult};
use crate::manifest::FileManifest;
use crate::progress::ProgressMeter;

/// What happened to one manifest path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileAction {
    pub key: String,
    pub classification: Classification,
    /// Set for `ChangedConflict` paths only.
    pub resolution: Option<Resolution>,
}

/// Result of a reconcile run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub actions: Vec<ReconcileAction>,
    pub files_copied: usize,
    pub files_skipped: usize,
    pub files_deleted: usize,
    pub bytes_identical: u64,
    pub bytes_copied: u64,
    pub bytes_skipped: u64,
    /// Unpacked files not listed in the new manifest, such as the manifest.
    pub bytes_unlisted: u64,
}

impl ReconcileReport {
    /// Number of paths with the given classification.
    pub fn count(&self, classification: Classification) -> usize {
        self.actions
            .iter()
            .filter(|a| a.classification == classification)
            .count()
    }

    /// Every byte of the unpacked tree accounted for by this run.
    pub fn bytes_accounted(&self) -> u64 {
        self.bytes_identical + self.bytes_copied + self.bytes_skipped + self.bytes_unlisted
    }

    /// Action recorded for `key`.
    pub fn action(&self, key: &str) -> Option<&ReconcileAction> {
        self.actions.iter().find(|a| a.key == key)
    }
}

/// Applies an unpacked archive to the destination root.
pub struct Reconciler<'a> {
    unpack_root: PathBuf,
    dest_root: PathBuf,
    policy: UserPolicy,
    uncompressed_size: u64,
    meter: &'a ProgressMeter,
    cancel: &'a AtomicBool,
}

impl<'a> Reconciler<'a> {
    pub fn new(
        unpack_root: impl Into<PathBuf>,
        dest_root: impl Into<PathBuf>,
        meter: &'a ProgressMeter,
        cancel: &'a AtomicBool,
    ) -> Self {
        Self {
            unpack_root: unpack_root.into(),
            dest_root: dest_root.into(),
            policy: UserPolicy::Ask,
            uncompressed_size: 0,
            meter,
            cancel,
        }
    }

    pub fn with_policy(mut self, policy: UserPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Declared size of the unpacked tree, used as the meter target.
    pub fn with_uncompressed_size(mut self, bytes: u64) -> Self {
        self.uncompressed_size = bytes;
        self
    }

    /// Reconcile `new` against `old` and the destination tree, then write
    /// `new` as the destination manifest.
    ///
    /// Copies and deletes already made stay in place when a later one
    /// fails; running again finishes the job.
    pub fn run<P: ConflictPrompt + ?Sized>(
        &self,
        old: &FileManifest,
        new: &FileManifest,
        prompt: &mut P,
    ) -> BootstrapResult<ReconcileReport> {
        self.meter.add_target(self.uncompressed_size);

        let classified = classify::classify(old, new, &self.unpack_root, &self.dest_root)?;
        let mut report = ReconcileReport::default();

        for path in &classified {
            if path.classification == Classification::Identical {
                let bytes = apply::source_len(path);
                report.bytes_identical += bytes;
                self.meter.record_progress(bytes);
            }
        }
        report.bytes_unlisted = apply::unlisted_bytes(&self.unpack_root, new)?;
        self.meter.record_progress(report.bytes_unlisted);

        let resolutions = self.resolve_conflicts(&classified, prompt);
        self.check_cancel()?;

        // Prompts are done; the progress line no longer competes with them.
        let _progress = self.meter.scoped("Installing");

        for (path, resolution) in classified.iter().zip(resolutions) {
            self.check_cancel()?;
            self.apply(path, resolution, old, &mut report)?;
            report.actions.push(ReconcileAction {
                key: path.key.clone(),
                classification: path.classification,
                resolution,
            });
        }

        self.settle_meter(&report);

        new.save(&FileManifest::path_in(&self.dest_root))
            .map_err(|e| match e {
                BootstrapError::Io { path, source } => BootstrapError::ReconcileIo { path, source },
                other => other,
            })?;

        info!(
            copied = report.files_copied,
            skipped = report.files_skipped,
            deleted = report.files_deleted,
            identical = report.count(Classification::Identical),
            kept = report.count(Classification::Kept),
            "Destination updated"
        );
        Ok(report)
    }

    /// Decide every conflict before anything is changed on disk.
    fn resolve_conflicts<P: ConflictPrompt + ?Sized>(
        &self,
        classified: &[ClassifiedPath],
        prompt: &mut P,
    ) -> Vec<Option<Resolution>> {
        let mut resolver = ConflictResolver::new(self.policy, prompt);
        classified
            .iter()
            .map(|path| {
                (path.classification == Classification::ChangedConflict)
                    .then(|| resolver.resolve(&path.dest))
            })
            .collect()
    }

    fn apply(
        &self,
        path: &ClassifiedPath,
        resolution: Option<Resolution>,
        old: &FileManifest,
        report: &mut ReconcileReport,
    ) -> BootstrapResult<()> {
        match (path.classification, resolution) {
            (Classification::Added, _)
            | (Classification::ChangedSafe, _)
            | (Classification::ChangedConflict, Some(Resolution::Move)) => {
                report.bytes_copied += apply::install(path, self.meter)?;
                report.files_copied += 1;
            }
            (Classification::ChangedConflict, _) => {
                let bytes = apply::source_len(path);
                self.meter.record_progress(bytes);
                report.bytes_skipped += bytes;
                report.files_skipped += 1;
                info!(key = %path.key, "Kept locally modified file");
            }
            (Classification::Deleted, _) => {
                let old_hash = old.get(&path.key).unwrap_or_default();
                if apply::remove_if_unmodified(path, old_hash)? {
                    report.files_deleted += 1;
                }
            }
            (Classification::Identical, _) | (Classification::Kept, _) => {}
        }
        Ok(())
    }

    /// Bring the meter to exactly its target, warning when the installed
    /// bytes do not add up to the declared size.
    fn settle_meter(&self, report: &ReconcileReport) {
        let target = self.meter.target();
        let progress = self.meter.progress();
        let accounted = report.bytes_accounted();
        if accounted != self.uncompressed_size {
            warn!(
                declared = self.uncompressed_size,
                accounted,
                "Unpacked size differs from declared size"
            );
        }

        if progress < target {
            self.meter.record_progress(target - progress);
        } else if progress > target {
            self.meter.rewind(progress - target);
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
