// SPDX-License-Identifier: MIT OR Apache-2.0
//! coral-bundle
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! Deterministic, content-addressed archives of source trees.
//!
//! A bundle is a gzip-compressed tar of one or more roots, every header
//! normalized, entries sorted, with a JSON manifest as the final entry.
//! The SHA-256 over (archive bytes ‖ manifest bytes) is the cache key:
//! the same tree always produces byte-identical archives.

mod ignore;

pub use ignore::{DEFAULT_IGNORES, IgnoreRules, load_ignore_patterns};

use coral_core::{canonical_json, sha256_hex};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

/// Name of the manifest entry embedded as the final archive member.
pub const MANIFEST_NAME: &str = "coral_manifest.json";

/// Errors from bundle creation.
#[derive(Debug, thiserror::Error)]
pub enum PackagingError {
    /// The caller supplied no roots to bundle.
    #[error("no source roots to bundle")]
    EmptyRoots,

    /// An ignore pattern failed to compile.
    #[error("invalid ignore pattern: {0}")]
    InvalidPattern(#[from] globset::Error),

    /// Filesystem access failed.
    #[error("I/O failure on {path}: {source}")]
    Io {
        /// Path involved in the failure.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The manifest could not be serialized.
    #[error("failed to encode manifest: {0}")]
    Manifest(#[from] coral_core::SpecError),
}

fn io_err(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> PackagingError {
    let path = path.into();
    move |source| PackagingError::Io { path, source }
}

/// Manifest describing a bundle, embedded as its final entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleManifest {
    /// Tool version that produced the bundle.
    pub version: String,
    /// Worker runtime compatibility version.
    pub runtime_version: String,
    /// Absolute root paths that were bundled.
    pub roots: Vec<String>,
    /// Effective ignore patterns: defaults, extras, and per-root files.
    pub ignore: Vec<String>,
}

/// A finished bundle: archive location, cache key, manifest.
#[derive(Debug, Clone)]
pub struct BundleResult {
    /// Path of the written `.tar.gz`.
    pub path: PathBuf,
    /// SHA-256 over (archive bytes ‖ manifest bytes).
    pub hash: String,
    /// The manifest embedded in the archive.
    pub manifest: BundleManifest,
}

struct FileEntry {
    archive_name: String,
    source_path: PathBuf,
}

/// Create a deterministic bundle of `roots` at `output_path`.
///
/// Per root, the effective ignore set is the built-in denylist plus
/// `extra_ignores` plus any `.gitignore`/`.coralignore` found in the root.
/// Symbolic links are not followed.
///
/// # Errors
///
/// Returns [`PackagingError::EmptyRoots`] for an empty root list; I/O and
/// pattern-compilation failures propagate.
pub fn create_bundle(
    roots: &[PathBuf],
    output_path: &Path,
    version: &str,
    extra_ignores: &[String],
) -> Result<BundleResult, PackagingError> {
    if roots.is_empty() {
        return Err(PackagingError::EmptyRoots);
    }

    let roots: Vec<PathBuf> = roots
        .iter()
        .map(|r| r.canonicalize().map_err(io_err(r.clone())))
        .collect::<Result<_, _>>()?;

    let mut entries = Vec::new();
    let mut manifest_ignore: Vec<String> = DEFAULT_IGNORES
        .iter()
        .map(|s| (*s).to_string())
        .chain(extra_ignores.iter().cloned())
        .collect();

    for root in &roots {
        let file_patterns = load_ignore_patterns(root)?;
        let rules = IgnoreRules::compile(
            DEFAULT_IGNORES
                .iter()
                .map(|s| (*s).to_string())
                .chain(extra_ignores.iter().cloned())
                .chain(file_patterns.iter().cloned()),
        )?;
        manifest_ignore.extend(file_patterns);
        collect_entries(root, &rules, &mut entries)?;
    }

    entries.sort_by(|a, b| a.archive_name.cmp(&b.archive_name));
    debug!(files = entries.len(), "bundling source roots");

    let manifest = BundleManifest {
        version: version.to_string(),
        runtime_version: env!("CARGO_PKG_RUST_VERSION").to_string(),
        roots: roots.iter().map(|r| r.display().to_string()).collect(),
        ignore: manifest_ignore,
    };
    let manifest_json = canonical_json(&manifest)?;

    write_archive(output_path, &entries, manifest_json.as_bytes())?;

    let archive_bytes = fs::read(output_path).map_err(io_err(output_path))?;
    let mut hashed = archive_bytes;
    hashed.extend_from_slice(manifest_json.as_bytes());
    let hash = sha256_hex(&hashed);

    Ok(BundleResult {
        path: output_path.to_path_buf(),
        hash,
        manifest,
    })
}

fn collect_entries(
    root: &Path,
    rules: &IgnoreRules,
    entries: &mut Vec<FileEntry>,
) -> Result<(), PackagingError> {
    let basename = root
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| root.display().to_string());

    if root.is_file() {
        if !rules.is_ignored(Path::new(&basename)) {
            entries.push(FileEntry {
                archive_name: basename,
                source_path: root.to_path_buf(),
            });
        }
        return Ok(());
    }

    let walker = WalkDir::new(root).follow_links(false).into_iter();
    let walker = walker.filter_entry(|e| {
        // Never prune the root itself; everything else is judged by its
        // path relative to the root.
        if e.depth() == 0 {
            return true;
        }
        let rel = e.path().strip_prefix(root).unwrap_or(e.path());
        !(e.file_type().is_dir() && rules.is_ignored(rel))
    });

    for entry in walker {
        let entry = entry.map_err(|e| PackagingError::Io {
            path: e.path().map(Path::to_path_buf).unwrap_or_default(),
            source: e
                .into_io_error()
                .unwrap_or_else(|| std::io::Error::other("walk failed")),
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry.path().strip_prefix(root).unwrap_or(entry.path());
        if rules.is_ignored(rel) {
            continue;
        }
        entries.push(FileEntry {
            archive_name: format!("{basename}/{}", rel_to_slash(rel)),
            source_path: entry.path().to_path_buf(),
        });
    }
    Ok(())
}

fn rel_to_slash(rel: &Path) -> String {
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn write_archive(
    output_path: &Path,
    entries: &[FileEntry],
    manifest_json: &[u8],
) -> Result<(), PackagingError> {
    let file = fs::File::create(output_path).map_err(io_err(output_path))?;
    let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
    let mut tar = tar::Builder::new(encoder);

    for entry in entries {
        let data = fs::read(&entry.source_path).map_err(io_err(&entry.source_path))?;
        append_normalized(&mut tar, &entry.archive_name, &data)
            .map_err(io_err(&entry.source_path))?;
    }
    append_normalized(&mut tar, MANIFEST_NAME, manifest_json).map_err(io_err(output_path))?;

    let encoder = tar.into_inner().map_err(io_err(output_path))?;
    let mut file = encoder.finish().map_err(io_err(output_path))?;
    file.flush().map_err(io_err(output_path))?;
    Ok(())
}

fn append_normalized<W: Write>(
    tar: &mut tar::Builder<W>,
    name: &str,
    data: &[u8],
) -> Result<(), std::io::Error> {
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    header.set_username("root")?;
    header.set_groupname("root")?;
    tar.append_data(&mut header, name, data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_roots_fail() {
        let err = create_bundle(&[], Path::new("/tmp/out.tar.gz"), "0.0.0", &[]).unwrap_err();
        assert!(matches!(err, PackagingError::EmptyRoots));
    }

    #[test]
    fn rel_paths_use_forward_slashes() {
        let rel = Path::new("a").join("b").join("c.rs");
        assert_eq!(rel_to_slash(&rel), "a/b/c.rs");
    }
}
