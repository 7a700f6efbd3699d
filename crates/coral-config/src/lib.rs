// SPDX-License-Identifier: MIT OR Apache-2.0
//! coral-config
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! Profile resolution from `~/.coral/config.toml`.
//!
//! The file holds `[profile.<name>]` tables with a `provider` key and a
//! nested `[profile.<name>.<provider>]` table of driver-specific keys.
//! The rest of the system only ever sees the resolved [`Profile`].

use std::path::{Path, PathBuf};
use toml::Table;
use tracing::debug;

/// Environment variable selecting the profile when none is given.
pub const PROFILE_ENV: &str = "CORAL_PROFILE";

/// Profile used when neither an explicit name nor the env var is set.
pub const DEFAULT_PROFILE: &str = "default";

/// Errors from configuration loading and profile resolution.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The user's home directory could not be determined.
    #[error("could not determine the user home directory")]
    NoHome,

    /// The config file exists but could not be read.
    #[error("failed to read config {path}: {source}")]
    Io {
        /// Config file path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The config file is not valid TOML.
    #[error("failed to parse config {path}: {source}")]
    Parse {
        /// Config file path.
        path: PathBuf,
        /// Parser error.
        #[source]
        source: toml::de::Error,
    },

    /// The requested profile does not exist.
    #[error("profile '{profile}' not found in {path}")]
    ProfileNotFound {
        /// Name that was requested.
        profile: String,
        /// Path that was searched.
        path: PathBuf,
    },

    /// The profile exists but names no provider.
    #[error("profile '{profile}' is missing a provider")]
    MissingProvider {
        /// Name of the incomplete profile.
        profile: String,
    },
}

/// A resolved configuration profile.
#[derive(Debug, Clone, PartialEq)]
pub struct Profile {
    /// Profile name.
    pub name: String,
    /// Backend provider the profile selects.
    pub provider: String,
    /// Provider-specific keys from `[profile.<name>.<provider>]`.
    pub data: Table,
}

impl Profile {
    /// Look up a string-valued key in the provider data.
    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(|v| v.as_str())
    }

    /// Look up an integer-valued key in the provider data.
    #[must_use]
    pub fn get_int(&self, key: &str) -> Option<i64> {
        self.data.get(key).and_then(toml::Value::as_integer)
    }
}

/// Default config file location: `~/.coral/config.toml`.
///
/// # Errors
///
/// Returns [`ConfigError::NoHome`] when the home directory is unknown.
pub fn config_path() -> Result<PathBuf, ConfigError> {
    let home = dirs::home_dir().ok_or(ConfigError::NoHome)?;
    Ok(home.join(".coral").join("config.toml"))
}

/// Load the raw configuration table; an absent file reads as empty.
///
/// # Errors
///
/// Propagates read and parse failures.
pub fn load_config(path: &Path) -> Result<Table, ConfigError> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Table::new()),
        Err(source) => {
            return Err(ConfigError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    text.parse::<Table>().map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Resolve a profile from the default config location.
///
/// The profile name is the explicit argument when given, otherwise
/// `$CORAL_PROFILE`, otherwise `"default"`.
///
/// # Errors
///
/// Returns [`ConfigError::ProfileNotFound`] (naming the profile and the
/// path) or [`ConfigError::MissingProvider`].
pub fn get_profile(name: Option<&str>) -> Result<Profile, ConfigError> {
    let path = config_path()?;
    get_profile_from(&path, name)
}

/// Resolve a profile from an explicit config path.
///
/// # Errors
///
/// Same contract as [`get_profile`].
pub fn get_profile_from(path: &Path, name: Option<&str>) -> Result<Profile, ConfigError> {
    let config = load_config(path)?;
    let profile_name = name
        .map(str::to_string)
        .or_else(|| std::env::var(PROFILE_ENV).ok())
        .unwrap_or_else(|| DEFAULT_PROFILE.to_string());

    let profile = config
        .get("profile")
        .and_then(|p| p.as_table())
        .and_then(|p| p.get(&profile_name))
        .and_then(|p| p.as_table())
        .ok_or_else(|| ConfigError::ProfileNotFound {
            profile: profile_name.clone(),
            path: path.to_path_buf(),
        })?;

    let provider = profile
        .get("provider")
        .and_then(|v| v.as_str())
        .ok_or_else(|| ConfigError::MissingProvider {
            profile: profile_name.clone(),
        })?
        .to_string();

    let data = profile
        .get(&provider)
        .and_then(|v| v.as_table())
        .cloned()
        .unwrap_or_default();

    debug!(profile = %profile_name, provider = %provider, "profile resolved");
    Ok(Profile {
        name: profile_name,
        provider,
        data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const SAMPLE: &str = r#"
[profile.default]
provider = "batch"

[profile.default.batch]
project = "my-project"
region = "us-central1"
artifact_repo = "coral"
bucket = "coral-artifacts"

[profile.gpu]
provider = "pod"

[profile.gpu.pod]
api_key = "key"
gpu_type = "A100"
gpu_count = 2
"#;

    fn write_config(dir: &TempDir) -> PathBuf {
        let path = dir.path().join("config.toml");
        fs::write(&path, SAMPLE).unwrap();
        path
    }

    #[test]
    fn resolves_named_profile() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir);
        let profile = get_profile_from(&path, Some("gpu")).unwrap();
        assert_eq!(profile.name, "gpu");
        assert_eq!(profile.provider, "pod");
        assert_eq!(profile.get_str("gpu_type"), Some("A100"));
        assert_eq!(profile.get_int("gpu_count"), Some(2));
    }

    #[test]
    fn falls_back_to_default_profile() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir);
        let profile = get_profile_from(&path, None).unwrap();
        assert_eq!(profile.name, "default");
        assert_eq!(profile.provider, "batch");
        assert_eq!(profile.get_str("project"), Some("my-project"));
    }

    #[test]
    fn missing_profile_names_profile_and_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        let err = get_profile_from(&path, Some("default")).unwrap_err();
        let text = err.to_string();
        assert!(text.contains("'default'"), "{text}");
        assert!(text.contains("config.toml"), "{text}");
    }

    #[test]
    fn profile_without_provider_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[profile.broken]\nnote = \"no provider\"\n").unwrap();
        let err = get_profile_from(&path, Some("broken")).unwrap_err();
        assert!(matches!(err, ConfigError::MissingProvider { profile } if profile == "broken"));
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[profile.default\nbroken").unwrap();
        assert!(matches!(
            get_profile_from(&path, None),
            Err(ConfigError::Parse { .. })
        ));
    }
}
