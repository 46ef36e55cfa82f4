//! Chunk planning and on-disk chunk discovery.
//!
//! An archive of `content_length` bytes is split into contiguous chunks of
//! at most `chunk_size` bytes, each stored as `<dest>.NNNN`. Because names
//! derive only from the index, a later run finds the same files again.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// One contiguous byte range of the archive and the file holding it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkFile {
    /// Zero-based position in the archive.
    pub index: usize,
    /// First byte offset, inclusive.
    pub start: u64,
    /// Last byte offset, inclusive.
    pub end: u64,
    pub path: PathBuf,
}

impl ChunkFile {
    /// Number of bytes the chunk holds when complete.
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }
}

/// Unit of work handed to a download worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadJob {
    pub index: usize,
    pub start: u64,
    pub end: u64,
    pub dest_path: PathBuf,
    pub url: String,
}

impl DownloadJob {
    pub fn for_chunk(chunk: &ChunkFile, url: &str) -> Self {
        Self {
            index: chunk.index,
            start: chunk.start,
            end: chunk.end,
            dest_path: chunk.path.clone(),
            url: url.to_string(),
        }
    }

    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Whether `existing` bytes on disk already complete this job.
    pub fn is_complete(&self, existing: u64) -> bool {
        existing == self.len()
    }
}

/// Path of chunk `index` for an archive downloaded to `dest`.
pub fn chunk_path(dest: &Path, index: usize) -> PathBuf {
    let mut name = dest.file_name().unwrap_or_default().to_os_string();
    name.push(format!(".{:04}", index));
    dest.with_file_name(name)
}

/// Partition `[0, content_length)` into chunks of at most `chunk_size`.
pub fn plan_chunks(dest: &Path, content_length: u64, chunk_size: u64) -> Vec<ChunkFile> {
    let chunk_size = chunk_size.max(1);
    let count = content_length.div_ceil(chunk_size);

    (0..count)
        .map(|i| {
            let start = i * chunk_size;
            let end = (start + chunk_size).min(content_length) - 1;
            let index = i as usize;
            ChunkFile {
                index,
                start,
                end,
                path: chunk_path(dest, index),
            }
        })
        .collect()
}

/// Find chunk files left by an earlier run, as `(index, size)` sorted by index.
pub fn existing_chunks(dest: &Path) -> io::Result<Vec<(usize, u64)>> {
    let Some(dir) = dest.parent() else {
        return Ok(Vec::new());
    };
    let Some(base) = dest.file_name().and_then(|n| n.to_str()) else {
        return Ok(Vec::new());
    };
    let prefix = format!("{}.", base);

    let dir = if dir.as_os_str().is_empty() {
        Path::new(".")
    } else {
        dir
    };

    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut found = Vec::new();
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let Some(index) = name
            .to_str()
            .and_then(|n| n.strip_prefix(&prefix))
            .filter(|suffix| suffix.len() >= 4 && suffix.bytes().all(|b| b.is_ascii_digit()))
            .and_then(|suffix| suffix.parse::<usize>().ok())
        else {
            continue;
        };
        let metadata = entry.metadata()?;
        if metadata.is_file() {
            found.push((index, metadata.len()));
        }
    }

    found.sort_unstable();
    Ok(found)
}

/// Remove every chunk file belonging to `dest`.
pub fn remove_chunks(dest: &Path) -> io::Result<usize> {
    let chunks = existing_chunks(dest)?;
    for (index, _) in &chunks {
        fs::remove_file(chunk_path(dest, *index))?;
    }
    Ok(chunks.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const MB: u64 = 1024 * 1024;

    #[test]
    fn test_chunk_path_is_zero_padded() {
        let dest = Path::new("/work/d/archive.zip");
        assert_eq!(chunk_path(dest, 0), PathBuf::from("/work/d/archive.zip.0000"));
        assert_eq!(chunk_path(dest, 12), PathBuf::from("/work/d/archive.zip.0012"));
    }

    #[test]
    fn test_plan_250mb_has_three_chunks() {
        let dest = Path::new("archive.zip");
        let chunks = plan_chunks(dest, 250 * MB, 100 * MB);

        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].start, 0);
        assert_eq!(chunks[0].end, 100 * MB - 1);
        assert_eq!(chunks[2].start, 200 * MB);
        assert_eq!(chunks[2].end, 250 * MB - 1);
        assert_eq!(chunks[2].len(), 50 * MB);
    }

    #[test]
    fn test_plan_exact_multiple() {
        let chunks = plan_chunks(Path::new("a"), 200, 100);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1].end, 199);
    }

    #[test]
    fn test_plan_empty_archive() {
        assert!(plan_chunks(Path::new("a"), 0, 100).is_empty());
    }

    #[test]
    fn test_job_completion() {
        let chunk = &plan_chunks(Path::new("a"), 150, 100)[1];
        let job = DownloadJob::for_chunk(chunk, "https://x/a");
        assert_eq!(job.len(), 50);
        assert!(!job.is_complete(49));
        assert!(job.is_complete(50));
    }

    #[test]
    fn test_existing_chunks_discovers_and_sorts() {
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("archive.zip");
        fs::write(chunk_path(&dest, 1), b"abc").unwrap();
        fs::write(chunk_path(&dest, 0), b"abcdef").unwrap();
        fs::write(temp.path().join("archive.zip.tmp"), b"x").unwrap();
        fs::write(temp.path().join("archive.zip.01"), b"x").unwrap();
        fs::write(temp.path().join("other.zip.0000"), b"x").unwrap();

        let found = existing_chunks(&dest).unwrap();
        assert_eq!(found, vec![(0, 6), (1, 3)]);
    }

    #[test]
    fn test_existing_chunks_missing_dir() {
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("nope").join("archive.zip");
        assert!(existing_chunks(&dest).unwrap().is_empty());
    }

    #[test]
    fn test_remove_chunks() {
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("archive.zip");
        fs::write(chunk_path(&dest, 0), b"a").unwrap();
        fs::write(chunk_path(&dest, 1), b"b").unwrap();

        assert_eq!(remove_chunks(&dest).unwrap(), 2);
        assert!(existing_chunks(&dest).unwrap().is_empty());
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn test_plan_tiles_content_exactly(
                content_length in 0u64..10_000_000,
                chunk_size in 1u64..3_000_000
            ) {
                let chunks = plan_chunks(Path::new("a.zip"), content_length, chunk_size);

                let mut next = 0u64;
                for (i, chunk) in chunks.iter().enumerate() {
                    prop_assert_eq!(chunk.index, i);
                    prop_assert_eq!(chunk.start, next);
                    prop_assert!(chunk.end >= chunk.start);
                    prop_assert!(chunk.len() <= chunk_size);
                    next = chunk.end + 1;
                }
                prop_assert_eq!(next, content_length);
            }
        }
    }
}
