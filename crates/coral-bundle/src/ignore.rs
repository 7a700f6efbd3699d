// SPDX-License-Identifier: MIT OR Apache-2.0
//! Ignore-rule loading and matching for bundle roots.
//!
//! Patterns are shell-style globs evaluated against paths relative to the
//! root. A bare pattern (no `/`) matches at any depth, mirroring what
//! `.gitignore` users expect; a pattern containing `/` is root-relative.

use globset::{Glob, GlobSet, GlobSetBuilder};
use std::fs;
use std::path::Path;

/// Built-in denylist applied to every root.
pub const DEFAULT_IGNORES: &[&str] = &[
    ".git",
    ".venv",
    "__pycache__",
    "*.pyc",
    "*.pyo",
    ".pytest_cache",
    "build",
    "dist",
    "target",
    ".idea",
    ".vscode",
];

/// Ignore files consulted in each root, in load order.
const IGNORE_FILES: &[&str] = &[".gitignore", ".coralignore"];

/// Read the ignore patterns declared by files inside `root`.
///
/// Blank lines and `#` comments are discarded; trailing `/` markers are
/// stripped so directory patterns also prune.
///
/// # Errors
///
/// Propagates read failures for ignore files that exist but are unreadable.
pub fn load_ignore_patterns(root: &Path) -> Result<Vec<String>, super::PackagingError> {
    let mut patterns = Vec::new();
    for name in IGNORE_FILES {
        let path = root.join(name);
        if !path.is_file() {
            continue;
        }
        let text = fs::read_to_string(&path).map_err(|source| super::PackagingError::Io {
            path: path.clone(),
            source,
        })?;
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            patterns.push(line.trim_end_matches('/').to_string());
        }
    }
    Ok(patterns)
}

/// Compiled ignore rules for one root.
#[derive(Debug, Clone)]
pub struct IgnoreRules {
    set: GlobSet,
}

impl IgnoreRules {
    /// Compile a pattern list into a matcher.
    ///
    /// # Errors
    ///
    /// Returns the underlying `globset` error for invalid patterns.
    pub fn compile<I>(patterns: I) -> Result<Self, globset::Error>
    where
        I: IntoIterator<Item = String>,
    {
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            builder.add(Glob::new(&pattern)?);
            if !pattern.contains('/') && !pattern.starts_with("**") {
                // Bare names match at any depth, like gitignore.
                builder.add(Glob::new(&format!("**/{pattern}"))?);
            }
        }
        Ok(Self {
            set: builder.build()?,
        })
    }

    /// Whether the root-relative `path` matches any ignore pattern.
    #[must_use]
    pub fn is_ignored(&self, path: &Path) -> bool {
        self.set.is_match(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules(patterns: &[&str]) -> IgnoreRules {
        IgnoreRules::compile(patterns.iter().map(|s| (*s).to_string())).expect("compile")
    }

    #[test]
    fn bare_names_match_at_any_depth() {
        let r = rules(&["__pycache__"]);
        assert!(r.is_ignored(Path::new("__pycache__")));
        assert!(r.is_ignored(Path::new("pkg/sub/__pycache__")));
        assert!(!r.is_ignored(Path::new("pycache")));
    }

    #[test]
    fn extension_globs_match_nested_files() {
        let r = rules(&["*.pyc"]);
        assert!(r.is_ignored(Path::new("a.pyc")));
        assert!(r.is_ignored(Path::new("pkg/deep/b.pyc")));
        assert!(!r.is_ignored(Path::new("a.py")));
    }

    #[test]
    fn slash_patterns_are_root_relative() {
        let r = rules(&["docs/generated"]);
        assert!(r.is_ignored(Path::new("docs/generated")));
        assert!(!r.is_ignored(Path::new("x/docs/generated")));
    }

    #[test]
    fn defaults_cover_scm_and_build_dirs() {
        let r = IgnoreRules::compile(DEFAULT_IGNORES.iter().map(|s| (*s).to_string()))
            .expect("compile defaults");
        for path in [".git", ".venv", "target", "pkg/build", "x/dist"] {
            assert!(r.is_ignored(Path::new(path)), "{path} should be ignored");
        }
        assert!(!r.is_ignored(Path::new("src/lib.rs")));
    }

    #[test]
    fn ignore_file_parsing_skips_comments() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(".coralignore"),
            "# comment\n\nignore.me\nscratch/\n",
        )
        .unwrap();
        let patterns = load_ignore_patterns(dir.path()).unwrap();
        assert_eq!(patterns, vec!["ignore.me".to_string(), "scratch".to_string()]);
    }
}
