// SPDX-License-Identifier: MIT OR Apache-2.0
//! Runtime-setup payload for no-build execution.
//!
//! When no image is built, the host must re-create the image's state at
//! runtime. This payload carries exactly what the worker needs for that:
//! packages, environment defaults, and the working directory.

use crate::ProtocolError;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use coral_core::{ImageSpec, plan};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Everything the worker applies before invoking the target when the
/// image was not pre-built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
pub struct RuntimeSetup {
    /// OS-level packages, in install order.
    pub system_packages: Vec<String>,
    /// Runtime-ecosystem packages, in install order.
    pub runtime_packages: Vec<String>,
    /// Worker-library requirements the host must provide.
    pub runtime_requirements: Vec<String>,
    /// Environment defaults, applied only where not already set.
    pub env: BTreeMap<String, String>,
    /// Working directory to create and change into.
    pub workdir: String,
}

impl RuntimeSetup {
    /// Derive the setup payload from an image spec.
    #[must_use]
    pub fn from_image(image: &ImageSpec) -> Self {
        Self {
            system_packages: image.system_packages.clone(),
            runtime_packages: image.runtime_packages.clone(),
            runtime_requirements: plan::RUNTIME_REQUIREMENTS
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
            env: image.env.clone(),
            workdir: image.workdir.clone(),
        }
    }

    /// Encode as base64 of sorted-key JSON, as carried in
    /// `RUNTIME_SETUP_B64`.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidJson`] if serialization fails.
    pub fn to_b64(&self) -> Result<String, ProtocolError> {
        let value = serde_json::to_value(self).map_err(|source| ProtocolError::InvalidJson {
            what: "RuntimeSetup".to_string(),
            source,
        })?;
        let json = serde_json::to_string(&value).map_err(|source| ProtocolError::InvalidJson {
            what: "RuntimeSetup".to_string(),
            source,
        })?;
        Ok(B64.encode(json.as_bytes()))
    }

    /// Decode from a `RUNTIME_SETUP_B64` value.
    ///
    /// # Errors
    ///
    /// Returns a [`ProtocolError`] on invalid base64 or JSON.
    pub fn from_b64(payload: &str) -> Result<Self, ProtocolError> {
        let raw = B64
            .decode(payload.as_bytes())
            .map_err(|source| ProtocolError::InvalidBase64 {
                what: "RUNTIME_SETUP_B64".to_string(),
                source,
            })?;
        serde_json::from_slice(&raw).map_err(|source| ProtocolError::InvalidJson {
            what: "RUNTIME_SETUP_B64".to_string(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coral_core::LocalSource;

    #[test]
    fn derived_from_image_spec() {
        let image = ImageSpec::new("python:3.11-slim")
            .system_packages(["git"])
            .runtime_packages(["numpy"])
            .env("MODE", "fast")
            .workdir("/srv/app")
            .local_source(LocalSource::sync("mypkg"));
        let setup = RuntimeSetup::from_image(&image);
        assert_eq!(setup.system_packages, vec!["git"]);
        assert_eq!(setup.runtime_packages, vec!["numpy"]);
        assert_eq!(setup.workdir, "/srv/app");
        assert_eq!(setup.env.get("MODE").map(String::as_str), Some("fast"));
        assert!(!setup.runtime_requirements.is_empty());
    }

    #[test]
    fn b64_round_trip() {
        let setup = RuntimeSetup::from_image(&ImageSpec::new("python:3.11-slim"));
        let back = RuntimeSetup::from_b64(&setup.to_b64().unwrap()).unwrap();
        assert_eq!(back, setup);
    }

    #[test]
    fn rejects_garbage() {
        assert!(RuntimeSetup::from_b64("!!!not-base64!!!").is_err());
    }
}
