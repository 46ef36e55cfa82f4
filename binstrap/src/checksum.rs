//! SHA-512 checksum calculation.
//!
//! The same digest is used for the archive as a whole (computed through the
//! multi-part view) and for individual files listed in manifests.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use sha2::{Digest, Sha512};

/// Buffer size for reading during checksum calculation (64KB).
const BUFFER_SIZE: usize = 64 * 1024;

/// Hash everything readable from `reader`, returning lowercase hex.
///
/// `on_bytes` is invoked with the size of every block consumed.
pub fn hash_reader<R: Read>(reader: &mut R, mut on_bytes: impl FnMut(u64)) -> io::Result<String> {
    let mut hasher = Sha512::new();
    let mut buffer = vec![0u8; BUFFER_SIZE];

    loop {
        let bytes_read = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buffer[..bytes_read]);
        on_bytes(bytes_read as u64);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Hash a single file on disk.
pub fn hash_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    hash_reader(&mut file, |_| {})
}

/// Hash a file, returning `None` when it does not exist.
pub fn hash_file_if_exists(path: &Path) -> io::Result<Option<String>> {
    match hash_file(path) {
        Ok(hash) => Ok(Some(hash)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Case-insensitive comparison of two hex digests.
pub fn digests_equal(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}
