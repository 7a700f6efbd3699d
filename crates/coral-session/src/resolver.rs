// SPDX-License-Identifier: MIT OR Apache-2.0
//! Local source resolution: mapping a module name to a filesystem root.
//!
//! A name resolves against an ordered list of search paths. A directory
//! match is a package and becomes the root itself; a file match is a
//! single-file module whose parent becomes the root.

use coral_error::CoralError;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Environment variable adding search paths (platform path-separated).
pub const SOURCE_PATH_ENV: &str = "CORAL_PATH";

/// Resolves [`LocalSource`](coral_core::LocalSource) names to roots.
#[derive(Debug, Clone)]
pub struct SourceResolver {
    search_paths: Vec<PathBuf>,
}

impl SourceResolver {
    /// A resolver over an explicit search path list.
    #[must_use]
    pub fn new(search_paths: Vec<PathBuf>) -> Self {
        Self { search_paths }
    }

    /// The ambient resolver: current directory plus `$CORAL_PATH`.
    #[must_use]
    pub fn from_env() -> Self {
        let mut search_paths = Vec::new();
        if let Ok(cwd) = std::env::current_dir() {
            search_paths.push(cwd);
        }
        if let Some(extra) = std::env::var_os(SOURCE_PATH_ENV) {
            search_paths.extend(std::env::split_paths(&extra));
        }
        Self { search_paths }
    }

    /// Resolve a module name to its source root.
    ///
    /// # Errors
    ///
    /// Returns a resolver-kind [`CoralError`] when no search path holds
    /// the module.
    pub fn resolve(&self, name: &str) -> Result<PathBuf, CoralError> {
        for base in &self.search_paths {
            if let Some(root) = resolve_in(base, name) {
                let root = root.canonicalize().map_err(|e| {
                    CoralError::resolver(format!(
                        "could not canonicalize source root for '{name}'"
                    ))
                    .with_source(e)
                })?;
                debug!(module = name, root = %root.display(), "local source resolved");
                return Ok(root);
            }
        }
        Err(CoralError::resolver(format!(
            "could not resolve local source module '{name}'"
        ))
        .context(
            "searched",
            self.search_paths
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(","),
        ))
    }
}

fn resolve_in(base: &Path, name: &str) -> Option<PathBuf> {
    let candidate = base.join(name);
    if candidate.is_dir() {
        return Some(candidate);
    }
    if candidate.is_file() {
        return candidate.parent().map(Path::to_path_buf);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn package_resolves_to_its_directory() {
        let dir = TempDir::new().unwrap();
        let pkg = dir.path().join("mypkg");
        std::fs::create_dir_all(&pkg).unwrap();

        let resolver = SourceResolver::new(vec![dir.path().to_path_buf()]);
        let root = resolver.resolve("mypkg").unwrap();
        assert_eq!(root, pkg.canonicalize().unwrap());
    }

    #[test]
    fn single_file_resolves_to_its_parent() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("task.py"), "x = 1\n").unwrap();

        let resolver = SourceResolver::new(vec![dir.path().to_path_buf()]);
        let root = resolver.resolve("task.py").unwrap();
        assert_eq!(root, dir.path().canonicalize().unwrap());
    }

    #[test]
    fn search_order_wins() {
        let first = TempDir::new().unwrap();
        let second = TempDir::new().unwrap();
        std::fs::create_dir_all(first.path().join("dup")).unwrap();
        std::fs::create_dir_all(second.path().join("dup")).unwrap();

        let resolver = SourceResolver::new(vec![
            first.path().to_path_buf(),
            second.path().to_path_buf(),
        ]);
        let root = resolver.resolve("dup").unwrap();
        assert_eq!(root, first.path().join("dup").canonicalize().unwrap());
    }

    #[test]
    fn missing_module_is_a_resolver_error() {
        let dir = TempDir::new().unwrap();
        let resolver = SourceResolver::new(vec![dir.path().to_path_buf()]);
        let err = resolver.resolve("ghost").unwrap_err();
        assert_eq!(err.kind(), coral_error::ErrorKind::Resolver);
        assert!(err.message.contains("'ghost'"));
    }
}
