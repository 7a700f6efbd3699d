// SPDX-License-Identifier: MIT OR Apache-2.0
//! coral-core
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! The stable contract for coral.
//!
//! Value types for image recipes, resource demands, function registrations,
//! and the opaque references a backend hands back. If you only take one
//! dependency, take this one.

/// Canonical image plan construction and hashing.
pub mod plan;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Metadata key marking a sentinel image ref produced when the image build
/// was skipped (no-build mode).
pub const METADATA_IMAGE_BUILD_DISABLED: &str = "image_build_disabled";

/// Metadata key carrying a backend-side launch template id for an image.
pub const METADATA_CUSTOM_TEMPLATE_ID: &str = "custom_template_id";

/// Errors from contract-level operations (parsing, hashing).
#[derive(Debug, thiserror::Error)]
pub enum SpecError {
    /// JSON serialization failed while canonicalizing a plan.
    #[error("failed to serialize JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// A memory size string could not be parsed.
    #[error("invalid memory size: {value}")]
    InvalidMemory {
        /// The offending value.
        value: String,
    },
}

/// Whether a local source ships with each call or is baked into the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum SourceMode {
    /// Included in the runtime bundle; ships with every call.
    #[default]
    Sync,
    /// Baked into the container image at build time.
    Copy,
}

/// A named local source tree referenced by an [`ImageSpec`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct LocalSource {
    /// Module or package name to resolve on the local filesystem.
    pub name: String,
    /// How the source reaches the worker.
    pub mode: SourceMode,
    /// Extra ignore globs applied when bundling this source.
    #[serde(default)]
    pub ignore: Vec<String>,
}

impl LocalSource {
    /// A sync-mode source with no extra ignores.
    pub fn sync(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mode: SourceMode::Sync,
            ignore: Vec::new(),
        }
    }

    /// A copy-mode source with no extra ignores.
    pub fn copy(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mode: SourceMode::Copy,
            ignore: Vec::new(),
        }
    }

    /// Attach ignore globs to this source.
    #[must_use]
    pub fn with_ignore(mut self, patterns: Vec<String>) -> Self {
        self.ignore = patterns;
        self
    }
}

/// Immutable recipe from which a container image is produced.
///
/// Two specs with equal [`plan::plan_hash`] values are interchangeable for
/// caching purposes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ImageSpec {
    /// Opaque identifier of the container base image.
    pub base_image: String,
    /// Interpreter/runtime version as `major.minor`.
    pub runtime_version: String,
    /// OS-level packages, in install order. Order is semantic.
    pub system_packages: Vec<String>,
    /// Runtime-ecosystem packages, in install order. Order is semantic.
    pub runtime_packages: Vec<String>,
    /// Environment defaults baked into the image. Order never affects hashing.
    pub env: BTreeMap<String, String>,
    /// Absolute working directory inside the container.
    pub workdir: String,
    /// Local source trees attached to the image.
    pub local_sources: Vec<LocalSource>,
}

impl ImageSpec {
    /// Default working directory inside the container.
    pub const DEFAULT_WORKDIR: &'static str = "/opt/coral";

    /// Create a spec from a base image, deriving the runtime version from a
    /// `name:version-…` tag when present.
    pub fn new(base_image: impl Into<String>) -> Self {
        let base_image = base_image.into();
        let runtime_version = base_image
            .split_once(':')
            .map(|(_, tag)| tag.split('-').next().unwrap_or(tag))
            .unwrap_or("3.11")
            .to_string();
        Self {
            base_image,
            runtime_version,
            system_packages: Vec::new(),
            runtime_packages: Vec::new(),
            env: BTreeMap::new(),
            workdir: Self::DEFAULT_WORKDIR.to_string(),
            local_sources: Vec::new(),
        }
    }

    /// Append OS-level packages.
    #[must_use]
    pub fn system_packages<I, S>(mut self, packages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.system_packages
            .extend(packages.into_iter().map(Into::into));
        self
    }

    /// Append runtime-ecosystem packages.
    #[must_use]
    pub fn runtime_packages<I, S>(mut self, packages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.runtime_packages
            .extend(packages.into_iter().map(Into::into));
        self
    }

    /// Set an environment default.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Set the working directory.
    #[must_use]
    pub fn workdir(mut self, path: impl Into<String>) -> Self {
        self.workdir = path.into();
        self
    }

    /// Attach a local source.
    #[must_use]
    pub fn local_source(mut self, source: LocalSource) -> Self {
        self.local_sources.push(source);
        self
    }
}

/// Resource demands for a single call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ResourceSpec {
    /// CPU cores.
    pub cpu: u32,
    /// Memory size string: `"NGi"`, `"NMi"`, or plain bytes.
    pub memory: String,
    /// Optional GPU demand as `"TYPE"` or `"TYPE:COUNT"`.
    pub gpu: Option<String>,
    /// Hard wall-clock limit for the call.
    pub timeout_seconds: u64,
    /// Retries honored by the executor; the session never retries.
    pub retries: u32,
}

impl Default for ResourceSpec {
    fn default() -> Self {
        Self {
            cpu: 1,
            memory: "2Gi".to_string(),
            gpu: None,
            timeout_seconds: 3600,
            retries: 0,
        }
    }
}

impl ResourceSpec {
    /// Parse the memory string into mebibytes.
    ///
    /// # Errors
    ///
    /// Returns [`SpecError::InvalidMemory`] when the value is not a number
    /// with an optional `Gi`/`Mi` suffix.
    pub fn memory_mib(&self) -> Result<u64, SpecError> {
        let value = self.memory.trim().to_ascii_lowercase();
        let invalid = || SpecError::InvalidMemory {
            value: self.memory.clone(),
        };
        if let Some(n) = value.strip_suffix("gi") {
            let n: f64 = n.parse().map_err(|_| invalid())?;
            return Ok((n * 1024.0) as u64);
        }
        if let Some(n) = value.strip_suffix("mi") {
            let n: f64 = n.parse().map_err(|_| invalid())?;
            return Ok(n as u64);
        }
        let bytes: u64 = value.parse().map_err(|_| invalid())?;
        Ok(bytes / (1024 * 1024))
    }
}

/// Registration of a user callable on an app. Immutable after registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct FunctionSpec {
    /// Short name the function is registered under.
    pub name: String,
    /// Module path of the callable.
    pub module: String,
    /// Dotted qualified name within the module.
    pub qualname: String,
    /// Source file the callable was defined in.
    pub source_file: String,
    /// Resource demands for each call.
    pub resources: ResourceSpec,
    /// Per-function image override; falls back to the app image.
    pub image: Option<ImageSpec>,
    /// When `false` and the backend supports host-side bootstrap, no image
    /// is built for this function.
    pub build_image: bool,
}

impl FunctionSpec {
    /// Create a registration with default resources and `build_image = true`.
    pub fn new(
        name: impl Into<String>,
        module: impl Into<String>,
        qualname: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            module: module.into(),
            qualname: qualname.into(),
            source_file: String::new(),
            resources: ResourceSpec::default(),
            image: None,
            build_image: true,
        }
    }

    /// Set the source file path.
    #[must_use]
    pub fn source_file(mut self, path: impl Into<String>) -> Self {
        self.source_file = path.into();
        self
    }

    /// Set the resource demands.
    #[must_use]
    pub fn resources(mut self, resources: ResourceSpec) -> Self {
        self.resources = resources;
        self
    }

    /// Set a per-function image override.
    #[must_use]
    pub fn image(mut self, image: ImageSpec) -> Self {
        self.image = Some(image);
        self
    }

    /// Disable image builds for this function (host-side bootstrap).
    #[must_use]
    pub fn no_build(mut self) -> Self {
        self.build_image = false;
        self
    }
}

/// Declarative description of an app: name, image, source policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct AppSpec {
    /// App name, used in labels and backend resources.
    pub name: String,
    /// Default image for every function without an override.
    pub image: ImageSpec,
    /// When `true`, each function's source-file parent joins the bundle.
    pub include_source: bool,
}

/// Content-addressed reference to an uploaded bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct BundleRef {
    /// Location the worker can fetch the bundle from.
    pub uri: String,
    /// SHA-256 bundle hash; the cache key.
    pub hash: String,
}

/// Reference to a resolved container image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ImageRef {
    /// Registry URI of the image. Empty for the no-build sentinel.
    pub uri: String,
    /// Content digest reported by the registry. Empty for the sentinel.
    pub digest: String,
    /// Backend-specific hints (template ids, build flags).
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl ImageRef {
    /// The sentinel ref used when the image build is skipped.
    #[must_use]
    pub fn build_disabled() -> Self {
        let mut metadata = BTreeMap::new();
        metadata.insert(METADATA_IMAGE_BUILD_DISABLED.to_string(), "1".to_string());
        Self {
            uri: String::new(),
            digest: String::new(),
            metadata,
        }
    }

    /// Whether this ref is the no-build sentinel.
    #[must_use]
    pub fn is_build_disabled(&self) -> bool {
        self.metadata
            .get(METADATA_IMAGE_BUILD_DISABLED)
            .is_some_and(|v| v == "1")
    }
}

/// Backend-opaque token identifying a submitted call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct RunHandle {
    /// Session-scoped run identifier.
    pub run_id: String,
    /// Call identifier the handle belongs to.
    pub call_id: String,
    /// Backend-side resource name (job id, pod id, …).
    pub provider_ref: String,
}

/// Terminal outcome of one call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct RunResult {
    /// Call identifier this result belongs to.
    pub call_id: String,
    /// `true` iff the backend reported the terminal state `SUCCEEDED`.
    pub success: bool,
    /// Serialized return value on success; UTF-8 traceback on failure.
    #[serde(with = "serde_bytes_b64")]
    #[schemars(with = "String")]
    pub output: Vec<u8>,
}

mod serde_bytes_b64 {
    //! Result payloads can be arbitrary bytes; JSON carries them as base64.
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        STANDARD
            .decode(s.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// Fresh 32-hex identifier for runs and calls.
#[must_use]
pub fn new_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Produce a deterministic JSON string for hashing.
///
/// Keys are sorted because `serde_json::Value` objects iterate in sorted
/// order; numbers serialize consistently.
///
/// # Errors
///
/// Returns [`SpecError::Json`] if the value cannot be serialized.
pub fn canonical_json<T: Serialize>(value: &T) -> Result<String, SpecError> {
    let v = serde_json::to_value(value)?;
    Ok(serde_json::to_string(&v)?)
}

/// Compute the hex-encoded SHA-256 digest of `bytes`.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_version_derived_from_tag() {
        let spec = ImageSpec::new("python:3.12-slim");
        assert_eq!(spec.runtime_version, "3.12");

        let bare = ImageSpec::new("ubuntu");
        assert_eq!(bare.runtime_version, "3.11");
    }

    #[test]
    fn memory_parsing() {
        let mut r = ResourceSpec::default();
        assert_eq!(r.memory_mib().unwrap(), 2048);
        r.memory = "512Mi".into();
        assert_eq!(r.memory_mib().unwrap(), 512);
        r.memory = "1073741824".into();
        assert_eq!(r.memory_mib().unwrap(), 1024);
        r.memory = "lots".into();
        assert!(matches!(
            r.memory_mib(),
            Err(SpecError::InvalidMemory { .. })
        ));
    }

    #[test]
    fn sentinel_image_ref_round_trips() {
        let sentinel = ImageRef::build_disabled();
        assert!(sentinel.is_build_disabled());
        assert!(sentinel.uri.is_empty());

        let json = serde_json::to_string(&sentinel).unwrap();
        let back: ImageRef = serde_json::from_str(&json).unwrap();
        assert_eq!(back, sentinel);
    }

    #[test]
    fn run_result_bytes_round_trip() {
        let result = RunResult {
            call_id: new_id(),
            success: true,
            output: vec![0, 159, 146, 150],
        };
        let json = serde_json::to_string(&result).unwrap();
        let back: RunResult = serde_json::from_str(&json).unwrap();
        assert_eq!(back, result);
    }

    #[test]
    fn ids_are_32_hex() {
        let id = new_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
