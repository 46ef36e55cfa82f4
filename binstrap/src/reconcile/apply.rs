//! Apply pass: copy, skip and delete against the destination tree.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use super::classify::{reconcile_io, ClassifiedPath};
use crate::checksum::{digests_equal, hash_file_if_exists};
use crate::error::BootstrapResult;
use crate::manifest::FileManifest;
use crate::progress::ProgressMeter;

/// Buffer size for copying files into place (64KB).
const BUFFER_SIZE: usize = 64 * 1024;

/// Suffix of the sibling file a copy is staged in before the rename.
const STAGING_SUFFIX: &str = ".binstrap-new";

/// Copy `path.source` over `path.dest`, creating parent directories.
///
/// The new contents are staged next to the destination and renamed into
/// place, so an interrupted copy never leaves a half-written file under
/// the destination name.
pub(crate) fn install(path: &ClassifiedPath, meter: &ProgressMeter) -> BootstrapResult<u64> {
    if let Some(parent) = path.dest.parent() {
        fs::create_dir_all(parent).map_err(|e| reconcile_io(parent, e))?;
    }

    let staging = staging_path(&path.dest);
    let copied = match copy_metered(&path.source, &staging, meter) {
        Ok(copied) => copied,
        Err(e) => {
            let _ = fs::remove_file(&staging);
            return Err(e);
        }
    };

    if let Err(e) = fs::rename(&staging, &path.dest) {
        let _ = fs::remove_file(&staging);
        return Err(reconcile_io(&path.dest, e));
    }

    debug!(key = %path.key, bytes = copied, "Installed file");
    Ok(copied)
}

/// Delete `path.dest` if it still hashes to `old_hash`.
///
/// Returns whether the file was removed.
pub(crate) fn remove_if_unmodified(path: &ClassifiedPath, old_hash: &str) -> BootstrapResult<bool> {
    let current = hash_file_if_exists(&path.dest).map_err(|e| reconcile_io(&path.dest, e))?;
    match current {
        Some(hash) if digests_equal(&hash, old_hash) => {
            fs::remove_file(&path.dest).map_err(|e| reconcile_io(&path.dest, e))?;
            info!(key = %path.key, "Removed file no longer shipped");
            Ok(true)
        }
        _ => Ok(false),
    }
}

/// Size of the unpacked copy of a path, zero when the archive lacks it.
pub(crate) fn source_len(path: &ClassifiedPath) -> u64 {
    fs::metadata(&path.source).map(|m| m.len()).unwrap_or(0)
}

/// Total size of files under `unpack_root` that `manifest` does not list.
pub(crate) fn unlisted_bytes(unpack_root: &Path, manifest: &FileManifest) -> BootstrapResult<u64> {
    let mut total = 0;
    let mut pending = vec![unpack_root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let entries = fs::read_dir(&dir).map_err(|e| reconcile_io(&dir, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| reconcile_io(&dir, e))?;
            let path = entry.path();
            let file_type = entry.file_type().map_err(|e| reconcile_io(&path, e))?;
            if file_type.is_dir() {
                pending.push(path);
                continue;
            }
            if !manifest.contains(&manifest_key(unpack_root, &path)) {
                total += entry.metadata().map_err(|e| reconcile_io(&path, e))?.len();
            }
        }
    }
    Ok(total)
}

fn manifest_key(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn copy_metered(source: &Path, dest: &Path, meter: &ProgressMeter) -> BootstrapResult<u64> {
    let mut reader = File::open(source).map_err(|e| reconcile_io(source, e))?;
    let mut writer = File::create(dest).map_err(|e| reconcile_io(dest, e))?;
    let mut buffer = vec![0u8; BUFFER_SIZE];
    let mut copied = 0u64;

    loop {
        let n = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(reconcile_io(source, e)),
        };
        writer
            .write_all(&buffer[..n])
            .map_err(|e| reconcile_io(dest, e))?;
        copied += n as u64;
        meter.record_progress(n as u64);
    }

    writer.sync_all().map_err(|e| reconcile_io(dest, e))?;
    Ok(copied)
}

fn staging_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_os_string();
    name.push(STAGING_SUFFIX);
    PathBuf::from(name)
}
