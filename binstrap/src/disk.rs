//! Free-space checks run before any bytes are fetched.

use std::io;
use std::path::Path;

use crate::error::{BootstrapError, BootstrapResult};

/// Free bytes on the volume holding `path`.
///
/// `path` need not exist yet; the nearest existing ancestor is queried.
pub fn available_space(path: &Path) -> io::Result<u64> {
    let mut probe = path;
    loop {
        if probe.exists() {
            return fs2::available_space(probe);
        }
        match probe.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => probe = parent,
            _ => return fs2::available_space(Path::new(".")),
        }
    }
}

/// Fail with [`BootstrapError::DiskFull`] unless `required` bytes are free.
pub fn ensure_free_space(path: &Path, required: u64) -> BootstrapResult<()> {
    let available = available_space(path).map_err(|e| BootstrapError::io(path, e))?;
    tracing::debug!(path = %path.display(), required, available, "Free space check");

    if available < required {
        return Err(BootstrapError::DiskFull {
            path: path.to_path_buf(),
            required,
            available,
        });
    }
    Ok(())
}
