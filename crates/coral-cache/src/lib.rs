// SPDX-License-Identifier: MIT OR Apache-2.0
//! coral-cache
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! The per-user cache directory and its two JSON indexes.
//!
//! Keys are content-addressed (bundle hash, image plan hash), so
//! cross-process races cannot corrupt meaning: a late writer can only
//! re-record the value the key already determines. Writes are atomic
//! temp-file-then-rename; reads tolerate absence.

use coral_core::{BundleRef, ImageRef};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// File name of the bundle index inside the cache directory.
pub const BUNDLE_INDEX: &str = "bundles.json";
/// File name of the image index inside the cache directory.
pub const IMAGE_INDEX: &str = "images.json";
/// Scratch file the most recent bundle is written to.
pub const BUNDLE_SCRATCH: &str = "bundle.tar.gz";

/// Errors from cache directory access.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// The user's home directory could not be determined.
    #[error("could not determine the user home directory")]
    NoHome,

    /// Filesystem access failed.
    #[error("cache I/O failure on {path}: {source}")]
    Io {
        /// Path involved in the failure.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// An index file exists but is not valid JSON.
    #[error("corrupt cache index {path}: {source}")]
    Corrupt {
        /// Index path.
        path: PathBuf,
        /// Parser error.
        #[source]
        source: serde_json::Error,
    },
}

fn io_err(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> CacheError {
    let path = path.into();
    move |source| CacheError::Io { path, source }
}

/// A recorded bundle upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleEntry {
    /// Remote URI of the uploaded bundle.
    pub uri: String,
}

/// A recorded image resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageEntry {
    /// Registry URI of the image.
    pub uri: String,
    /// Content digest of the image.
    pub digest: String,
    /// Backend-specific hints.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl From<&ImageRef> for ImageEntry {
    fn from(r: &ImageRef) -> Self {
        Self {
            uri: r.uri.clone(),
            digest: r.digest.clone(),
            metadata: r.metadata.clone(),
        }
    }
}

impl ImageEntry {
    /// Rehydrate an [`ImageRef`] from this entry.
    #[must_use]
    pub fn to_ref(&self) -> ImageRef {
        ImageRef {
            uri: self.uri.clone(),
            digest: self.digest.clone(),
            metadata: self.metadata.clone(),
        }
    }
}

impl BundleEntry {
    /// Rehydrate a [`BundleRef`] for the given hash.
    #[must_use]
    pub fn to_ref(&self, hash: &str) -> BundleRef {
        BundleRef {
            uri: self.uri.clone(),
            hash: hash.to_string(),
        }
    }
}

/// Handle on the per-user cache directory.
#[derive(Debug, Clone)]
pub struct CacheDir {
    root: PathBuf,
}

impl CacheDir {
    /// Open a cache rooted at an explicit directory (tests, overrides).
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The default per-user location: `~/.coral/cache`.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::NoHome`] when the home directory is unknown.
    pub fn default_location() -> Result<Self, CacheError> {
        let home = dirs::home_dir().ok_or(CacheError::NoHome)?;
        Ok(Self {
            root: home.join(".coral").join("cache"),
        })
    }

    /// Root path of the cache directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the bundle scratch file.
    #[must_use]
    pub fn bundle_scratch(&self) -> PathBuf {
        self.root.join(BUNDLE_SCRATCH)
    }

    /// Ensure the cache directory exists.
    ///
    /// # Errors
    ///
    /// Propagates directory-creation failures.
    pub fn ensure(&self) -> Result<(), CacheError> {
        fs::create_dir_all(&self.root).map_err(io_err(&self.root))
    }

    /// Load the bundle index; absent files read as empty.
    ///
    /// # Errors
    ///
    /// Propagates I/O failures and corrupt-index parse errors.
    pub fn load_bundles(&self) -> Result<BTreeMap<String, BundleEntry>, CacheError> {
        load_index(&self.root.join(BUNDLE_INDEX))
    }

    /// Load the image index; absent files read as empty.
    ///
    /// # Errors
    ///
    /// Propagates I/O failures and corrupt-index parse errors.
    pub fn load_images(&self) -> Result<BTreeMap<String, ImageEntry>, CacheError> {
        load_index(&self.root.join(IMAGE_INDEX))
    }

    /// Atomically replace the bundle index.
    ///
    /// # Errors
    ///
    /// Propagates I/O failures.
    pub fn save_bundles(
        &self,
        index: &BTreeMap<String, BundleEntry>,
    ) -> Result<(), CacheError> {
        save_index(&self.root.join(BUNDLE_INDEX), index)
    }

    /// Atomically replace the image index.
    ///
    /// # Errors
    ///
    /// Propagates I/O failures.
    pub fn save_images(&self, index: &BTreeMap<String, ImageEntry>) -> Result<(), CacheError> {
        save_index(&self.root.join(IMAGE_INDEX), index)
    }
}

fn load_index<T: DeserializeOwned>(path: &Path) -> Result<BTreeMap<String, T>, CacheError> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(e) => return Err(io_err(path)(e)),
    };
    serde_json::from_str(&text).map_err(|source| CacheError::Corrupt {
        path: path.to_path_buf(),
        source,
    })
}

fn save_index<T: Serialize>(path: &Path, index: &BTreeMap<String, T>) -> Result<(), CacheError> {
    let parent = path.parent().unwrap_or(Path::new("."));
    fs::create_dir_all(parent).map_err(io_err(parent))?;

    let json = serde_json::to_string_pretty(index).expect("index maps always serialize");
    let mut tmp = tempfile::NamedTempFile::new_in(parent).map_err(io_err(parent))?;
    tmp.write_all(json.as_bytes()).map_err(io_err(path))?;
    tmp.persist(path)
        .map_err(|e| io_err(path)(e.error))?;
    debug!(index = %path.display(), entries = index.len(), "index saved");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn absent_indexes_read_as_empty() {
        let dir = TempDir::new().unwrap();
        let cache = CacheDir::at(dir.path().join("cache"));
        assert!(cache.load_bundles().unwrap().is_empty());
        assert!(cache.load_images().unwrap().is_empty());
    }

    #[test]
    fn bundle_index_round_trips() {
        let dir = TempDir::new().unwrap();
        let cache = CacheDir::at(dir.path());

        let mut index = BTreeMap::new();
        index.insert(
            "abc123".to_string(),
            BundleEntry {
                uri: "store://bundles/abc123.tar.gz".to_string(),
            },
        );
        cache.save_bundles(&index).unwrap();

        let loaded = cache.load_bundles().unwrap();
        assert_eq!(loaded, index);
        assert_eq!(
            loaded["abc123"].to_ref("abc123").uri,
            "store://bundles/abc123.tar.gz"
        );
    }

    #[test]
    fn image_index_round_trips_with_metadata() {
        let dir = TempDir::new().unwrap();
        let cache = CacheDir::at(dir.path());

        let mut metadata = BTreeMap::new();
        metadata.insert("custom_template_id".to_string(), "tmpl-123".to_string());
        let mut index = BTreeMap::new();
        index.insert(
            "hash".to_string(),
            ImageEntry {
                uri: "registry/app:hash".to_string(),
                digest: "sha256:feed".to_string(),
                metadata,
            },
        );
        cache.save_images(&index).unwrap();

        let loaded = cache.load_images().unwrap();
        let image = loaded["hash"].to_ref();
        assert_eq!(image.uri, "registry/app:hash");
        assert_eq!(
            image.metadata.get("custom_template_id").map(String::as_str),
            Some("tmpl-123")
        );
    }

    #[test]
    fn save_replaces_previous_content() {
        let dir = TempDir::new().unwrap();
        let cache = CacheDir::at(dir.path());

        let mut index = BTreeMap::new();
        index.insert("a".to_string(), BundleEntry { uri: "u1".into() });
        cache.save_bundles(&index).unwrap();

        index.clear();
        index.insert("b".to_string(), BundleEntry { uri: "u2".into() });
        cache.save_bundles(&index).unwrap();

        let loaded = cache.load_bundles().unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(loaded.contains_key("b"));
    }

    #[test]
    fn corrupt_index_is_reported() {
        let dir = TempDir::new().unwrap();
        let cache = CacheDir::at(dir.path());
        std::fs::write(dir.path().join(BUNDLE_INDEX), "{not json").unwrap();
        assert!(matches!(
            cache.load_bundles(),
            Err(CacheError::Corrupt { .. })
        ));
    }
}
