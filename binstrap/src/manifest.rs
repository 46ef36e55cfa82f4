//! File manifests: destination-relative paths mapped to content hashes.
//!
//! Keys are always stored with POSIX separators. Manifests written by
//! Windows tooling sometimes contain backslashes, so keys are normalized
//! when loaded and again when inserted.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{BootstrapError, BootstrapResult};

/// File name of the manifest at the destination root and archive root.
pub const MANIFEST_FILE_NAME: &str = "filehashes.json";

/// Mapping of destination-relative POSIX paths to hex content hashes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileManifest {
    entries: BTreeMap<String, String>,
}

impl FileManifest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Path of the manifest file under `root`.
    pub fn path_in(root: &Path) -> PathBuf {
        root.join(MANIFEST_FILE_NAME)
    }

    /// Load a manifest file, normalizing and validating every key.
    pub fn load(path: &Path) -> BootstrapResult<Self> {
        let invalid = |reason: String| BootstrapError::Manifest {
            path: path.to_path_buf(),
            reason,
        };

        let contents = fs::read_to_string(path).map_err(|e| invalid(e.to_string()))?;
        Self::from_json(&contents).map_err(invalid)
    }

    /// Parse manifest JSON.
    pub fn from_json(json: &str) -> Result<Self, String> {
        let raw: BTreeMap<String, String> =
            serde_json::from_str(json).map_err(|e| e.to_string())?;

        let mut manifest = Self::new();
        for (key, hash) in raw {
            manifest.insert(&key, hash)?;
        }
        Ok(manifest)
    }

    /// Insert an entry, normalizing `key` to a safe relative POSIX path.
    pub fn insert(&mut self, key: &str, hash: impl Into<String>) -> Result<(), String> {
        let key = normalize_key(key)?;
        self.entries.insert(key, hash.into());
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate entries in path order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Write the manifest to `path`, replacing any existing file atomically.
    pub fn save(&self, path: &Path) -> BootstrapResult<()> {
        let json = serde_json::to_string_pretty(self).map_err(|e| BootstrapError::Manifest {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let temp_path = path.with_extension("json.tmp");
        fs::write(&temp_path, json).map_err(|e| BootstrapError::io(&temp_path, e))?;
        fs::rename(&temp_path, path).map_err(|e| BootstrapError::io(path, e))?;
        Ok(())
    }
}

/// Normalize a manifest key to a relative POSIX path that cannot escape
/// the root it is joined to.
pub fn normalize_key(key: &str) -> Result<String, String> {
    let posix = key.replace('\\', "/");
    if posix.starts_with('/') || posix.as_bytes().get(1) == Some(&b':') {
        return Err(format!("absolute path in manifest: {}", key));
    }

    let mut parts = Vec::new();
    for part in posix.split('/') {
        match part {
            "" | "." => continue,
            ".." => return Err(format!("path escapes root: {}", key)),
            other => parts.push(other),
        }
    }

    if parts.is_empty() {
        return Err(format!("empty path in manifest: {:?}", key));
    }
    Ok(parts.join("/"))
}

/// Join a normalized manifest key onto `root`.
///
/// Returns `None` if the result would leave `root`.
pub fn resolve_key(root: &Path, key: &str) -> Option<PathBuf> {
    let relative = Path::new(key);
    let safe = relative
        .components()
        .all(|c| matches!(c, Component::Normal(_)));
    safe.then(|| root.join(relative))
}
