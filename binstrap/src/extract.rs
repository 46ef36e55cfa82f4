//! Zip extraction from any seekable reader.
//!
//! The downloaded archive is never reassembled on disk; extraction reads it
//! through [`crate::multipart::MultiPartFile`]. Entries whose names would
//! land outside the unpack directory are rejected.

use std::fs::{self, File};
use std::io::{self, Read, Seek, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, info, warn};
use zip::ZipArchive;

use crate::error::{BootstrapError, BootstrapResult};
use crate::progress::ProgressMeter;

/// Buffer size for copying entry contents (64KB).
const BUFFER_SIZE: usize = 64 * 1024;

/// What an extraction produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractSummary {
    pub files: usize,
    pub directories: usize,
    pub uncompressed_bytes: u64,
}

/// Extracts a zip archive into a directory.
pub struct ZipExtractor<'a> {
    meter: &'a ProgressMeter,
    cancel: &'a AtomicBool,
}

impl<'a> ZipExtractor<'a> {
    pub fn new(meter: &'a ProgressMeter, cancel: &'a AtomicBool) -> Self {
        Self { meter, cancel }
    }

    /// Extract everything from `reader` into `dest_dir`.
    ///
    /// `label` names the archive in error messages. On failure the
    /// destination directory is removed.
    pub fn extract<R: Read + Seek>(
        &self,
        reader: R,
        label: &Path,
        dest_dir: &Path,
    ) -> BootstrapResult<ExtractSummary> {
        match self.extract_inner(reader, label, dest_dir) {
            Ok(summary) => Ok(summary),
            Err(e) => {
                if !matches!(e, BootstrapError::Cancelled) {
                    if let Err(cleanup) = fs::remove_dir_all(dest_dir) {
                        warn!(path = %dest_dir.display(), error = %cleanup, "Could not clean unpack directory");
                    }
                }
                Err(e)
            }
        }
    }

    fn extract_inner<R: Read + Seek>(
        &self,
        reader: R,
        label: &Path,
        dest_dir: &Path,
    ) -> BootstrapResult<ExtractSummary> {
        let failed = |reason: String| BootstrapError::Extraction {
            path: label.to_path_buf(),
            reason,
        };

        fs::create_dir_all(dest_dir).map_err(|e| BootstrapError::io(dest_dir, e))?;
        let mut archive = ZipArchive::new(reader).map_err(|e| failed(e.to_string()))?;

        let mut total = 0u64;
        for i in 0..archive.len() {
            total += archive
                .by_index_raw(i)
                .map_err(|e| failed(e.to_string()))?
                .size();
        }
        self.meter.add_target(total);
        info!(entries = archive.len(), bytes = total, "Extracting archive");

        let _progress = self.meter.scoped("Extracting");
        let mut summary = ExtractSummary::default();
        let mut buffer = vec![0u8; BUFFER_SIZE];

        for i in 0..archive.len() {
            if self.cancel.load(Ordering::SeqCst) {
                return Err(BootstrapError::Cancelled);
            }

            let mut entry = archive.by_index(i).map_err(|e| failed(e.to_string()))?;
            let Some(relative) = entry.enclosed_name().map(|p| p.to_path_buf()) else {
                return Err(failed(format!("entry escapes unpack directory: {}", entry.name())));
            };
            let out_path = dest_dir.join(&relative);

            if entry.is_dir() {
                fs::create_dir_all(&out_path).map_err(|e| BootstrapError::io(&out_path, e))?;
                summary.directories += 1;
                continue;
            }

            if let Some(parent) = out_path.parent() {
                fs::create_dir_all(parent).map_err(|e| BootstrapError::io(parent, e))?;
            }
            let written = self
                .copy_entry(&mut entry, &out_path, &mut buffer)
                .map_err(|e| {
                    if self.cancel.load(Ordering::SeqCst) {
                        BootstrapError::Cancelled
                    } else {
                        failed(format!("{}: {}", relative.display(), e))
                    }
                })?;

            debug!(entry = %relative.display(), bytes = written, "Extracted");
            summary.files += 1;
            summary.uncompressed_bytes += written;
        }

        Ok(summary)
    }

    fn copy_entry<R: Read>(&self, entry: &mut R, out_path: &Path, buffer: &mut [u8]) -> io::Result<u64> {
        let mut out = File::create(out_path)?;
        let mut written = 0u64;
        loop {
            if self.cancel.load(Ordering::SeqCst) {
                return Err(io::Error::new(io::ErrorKind::Interrupted, "cancelled"));
            }
            let n = match entry.read(buffer) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            out.write_all(&buffer[..n])?;
            self.meter.record_progress(n as u64);
            written += n as u64;
        }
        out.flush()?;
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tempfile::TempDir;
    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    fn build_zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        for (name, data) in entries {
            if name.ends_with('/') {
                writer.add_directory(*name, SimpleFileOptions::default()).unwrap();
            } else {
                writer.start_file(*name, SimpleFileOptions::default()).unwrap();
                writer.write_all(data).unwrap();
            }
        }
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn test_extracts_files_and_meters_bytes() {
        let temp = TempDir::new().unwrap();
        let archive = build_zip(&[("bin/", b""), ("bin/a.dll", b"aaaa"), ("readme.txt", b"hello")]);
        let meter = ProgressMeter::hidden();
        let cancel = AtomicBool::new(false);

        let summary = ZipExtractor::new(&meter, &cancel)
            .extract(Cursor::new(archive), Path::new("archive.zip"), temp.path())
            .unwrap();

        assert_eq!(summary.files, 2);
        assert_eq!(summary.directories, 1);
        assert_eq!(summary.uncompressed_bytes, 9);
        assert_eq!(fs::read(temp.path().join("bin/a.dll")).unwrap(), b"aaaa");
        assert_eq!(meter.progress(), 9);
        assert_eq!(meter.target(), 9);
    }

    #[test]
    fn test_rejects_escaping_entries() {
        let temp = TempDir::new().unwrap();
        let unpack = temp.path().join("u");
        let archive = build_zip(&[("../evil.txt", b"x")]);
        let meter = ProgressMeter::hidden();
        let cancel = AtomicBool::new(false);

        let err = ZipExtractor::new(&meter, &cancel)
            .extract(Cursor::new(archive), Path::new("archive.zip"), &unpack)
            .unwrap_err();

        assert!(matches!(err, BootstrapError::Extraction { .. }));
        assert!(!temp.path().join("evil.txt").exists());
        assert!(!unpack.exists());
    }

    #[test]
    fn test_garbage_is_extraction_error() {
        let temp = TempDir::new().unwrap();
        let meter = ProgressMeter::hidden();
        let cancel = AtomicBool::new(false);

        let err = ZipExtractor::new(&meter, &cancel)
            .extract(Cursor::new(b"not a zip".to_vec()), Path::new("a.zip"), temp.path())
            .unwrap_err();
        assert!(matches!(err, BootstrapError::Extraction { .. }));
    }
}
