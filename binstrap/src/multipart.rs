//! A sequence of chunk files presented as one contiguous byte stream.
//!
//! [`MultiPartFile`] implements [`Read`] and [`Seek`] so the checksum
//! routine and the zip reader can consume a downloaded archive without
//! first concatenating it on disk. Only the chunk under the cursor has an
//! open handle.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// Read-only, single-threaded view over ordered chunk files.
#[derive(Debug)]
pub struct MultiPartFile {
    parts: Vec<PathBuf>,
    /// Cumulative start offset of each part, plus the total length at the end.
    offsets: Vec<u64>,
    position: u64,
    current: Option<(usize, File)>,
}

impl MultiPartFile {
    /// Open a view over `parts`, recording the size of each.
    ///
    /// Fails if any part is missing.
    pub fn open<P: AsRef<Path>>(parts: &[P]) -> io::Result<Self> {
        let mut offsets = Vec::with_capacity(parts.len() + 1);
        let mut total = 0u64;
        for part in parts {
            offsets.push(total);
            total += part.as_ref().metadata()?.len();
        }
        offsets.push(total);

        Ok(Self {
            parts: parts.iter().map(|p| p.as_ref().to_path_buf()).collect(),
            offsets,
            position: 0,
            current: None,
        })
    }

    /// Total logical length in bytes.
    pub fn len(&self) -> u64 {
        self.offsets.last().copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current logical position (tell).
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Number of underlying parts.
    pub fn part_count(&self) -> usize {
        self.parts.len()
    }

    /// Index of the part holding `offset`, or `None` at or past EOF.
    fn part_for(&self, offset: u64) -> Option<usize> {
        if offset >= self.len() {
            return None;
        }
        // First index whose start is greater than offset, minus one. Empty
        // parts share a start with their successor and are skipped over.
        let idx = self.offsets.partition_point(|&start| start <= offset);
        Some(idx - 1)
    }

    /// Make sure the handle for `index` is open and positioned at the cursor.
    fn activate(&mut self, index: usize) -> io::Result<&mut File> {
        let within = self.position - self.offsets[index];
        let reopen = !matches!(self.current, Some((i, _)) if i == index);
        if reopen {
            // Drop the old handle before opening the new one.
            self.current = None;
            let mut file = File::open(&self.parts[index])?;
            file.seek(SeekFrom::Start(within))?;
            self.current = Some((index, file));
        }

        match self.current.as_mut() {
            Some((_, file)) => {
                if !reopen {
                    file.seek(SeekFrom::Start(within))?;
                }
                Ok(file)
            }
            None => Err(io::Error::new(io::ErrorKind::Other, "no active part")),
        }
    }
}

impl Read for MultiPartFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut filled = 0;

        while filled < buf.len() {
            let Some(index) = self.part_for(self.position) else {
                break;
            };
            let part_end = self.offsets[index + 1];
            let want = ((part_end - self.position) as usize).min(buf.len() - filled);

            let file = self.activate(index)?;
            let n = file.read(&mut buf[filled..filled + want])?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!(
                        "{} is shorter than its recorded size",
                        self.parts[index].display()
                    ),
                ));
            }

            filled += n;
            self.position += n as u64;
        }

        Ok(filled)
    }
}

impl Seek for MultiPartFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::End(delta) => self.len().checked_add_signed(delta),
            SeekFrom::Current(delta) => self.position.checked_add_signed(delta),
        };

        let Some(target) = target else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek to a negative or overflowing position",
            ));
        };

        self.position = target;
        Ok(target)
    }
}
