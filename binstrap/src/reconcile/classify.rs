//! Three-way comparison of the old manifest, the new manifest and the
//! destination tree. Nothing on disk is modified here.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use crate::checksum::{digests_equal, hash_file_if_exists};
use crate::error::{BootstrapError, BootstrapResult};
use crate::manifest::{resolve_key, FileManifest};

/// How one manifest path relates to the destination tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Classification {
    /// Unchanged between manifests; the destination copy is left alone.
    Identical,
    /// New path, or listed in both manifests but missing on disk.
    Added,
    /// Removed from the new manifest and unmodified on disk.
    Deleted,
    /// Changed between manifests; the disk copy is still the old one,
    /// or already the new one.
    ChangedSafe,
    /// Changed between manifests and modified locally.
    ChangedConflict,
    /// Removed from the new manifest but modified locally or already gone.
    Kept,
}

/// A manifest path with its classification and resolved locations.
#[derive(Debug, Clone)]
pub struct ClassifiedPath {
    pub key: String,
    pub classification: Classification,
    /// Location under the unpack root.
    pub source: PathBuf,
    /// Location under the destination root.
    pub dest: PathBuf,
}

/// Classify every path in `old ∪ new`, in key order.
pub(crate) fn classify(
    old: &FileManifest,
    new: &FileManifest,
    unpack_root: &Path,
    dest_root: &Path,
) -> BootstrapResult<Vec<ClassifiedPath>> {
    let keys: BTreeSet<&str> = old.keys().chain(new.keys()).collect();
    let mut classified = Vec::with_capacity(keys.len());

    for key in keys {
        let dest = resolve(dest_root, key)?;
        let source = resolve(unpack_root, key)?;

        let classification = match (old.get(key), new.get(key)) {
            (Some(old_hash), Some(new_hash)) => classify_common(&dest, old_hash, new_hash)?,
            (None, Some(_)) => Classification::Added,
            (Some(old_hash), None) => classify_removed(&dest, old_hash)?,
            (None, None) => continue,
        };

        classified.push(ClassifiedPath {
            key: key.to_string(),
            classification,
            source,
            dest,
        });
    }

    Ok(classified)
}

fn classify_common(dest: &Path, old_hash: &str, new_hash: &str) -> BootstrapResult<Classification> {
    let exists = dest.try_exists().map_err(|e| reconcile_io(dest, e))?;
    if !exists {
        return Ok(Classification::Added);
    }
    if digests_equal(old_hash, new_hash) {
        return Ok(Classification::Identical);
    }

    let classification = match hash_file_if_exists(dest).map_err(|e| reconcile_io(dest, e))? {
        None => Classification::Added,
        Some(disk) if digests_equal(&disk, old_hash) || digests_equal(&disk, new_hash) => {
            Classification::ChangedSafe
        }
        Some(_) => Classification::ChangedConflict,
    };
    Ok(classification)
}

fn classify_removed(dest: &Path, old_hash: &str) -> BootstrapResult<Classification> {
    let classification = match hash_file_if_exists(dest).map_err(|e| reconcile_io(dest, e))? {
        Some(disk) if digests_equal(&disk, old_hash) => Classification::Deleted,
        _ => Classification::Kept,
    };
    Ok(classification)
}

fn resolve(root: &Path, key: &str) -> BootstrapResult<PathBuf> {
    resolve_key(root, key).ok_or_else(|| BootstrapError::Manifest {
        path: FileManifest::path_in(root),
        reason: format!("entry {key:?} escapes {}", root.display()),
    })
}

pub(crate) fn reconcile_io(path: &Path, source: std::io::Error) -> BootstrapError {
    BootstrapError::ReconcileIo {
        path: path.to_path_buf(),
        source,
    }
}
