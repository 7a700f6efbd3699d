// SPDX-License-Identifier: MIT OR Apache-2.0
//! Canonical image plan construction and hashing.
//!
//! The plan is the cache key for image builds: a fixed-shape JSON object
//! derived from an [`ImageSpec`], serialized with sorted keys and hashed
//! with SHA-256. Two specs that hash identically are interchangeable.

use crate::{ImageSpec, SourceMode, SpecError, sha256_hex};
use serde_json::{Value, json};

/// Runtime libraries every worker needs, version-qualified so that worker
/// updates change the plan hash and force a rebuild.
pub const RUNTIME_REQUIREMENTS: &[&str] =
    &[concat!("coral-worker@", env!("CARGO_PKG_VERSION"))];

/// Build the canonical plan object for an image spec.
///
/// Field order here is fixed for readability; hashing sorts keys anyway.
#[must_use]
pub fn build_plan(spec: &ImageSpec) -> Value {
    json!({
        "base_image": spec.base_image,
        "runtime_version": spec.runtime_version,
        "system_packages": spec.system_packages,
        "runtime_packages": spec.runtime_packages,
        "env": spec.env,
        "workdir": spec.workdir,
        "local_sources": spec.local_sources.iter().map(|src| {
            json!({
                "name": src.name,
                "mode": match src.mode {
                    SourceMode::Sync => "sync",
                    SourceMode::Copy => "copy",
                },
                "ignore": src.ignore,
            })
        }).collect::<Vec<_>>(),
        "runtime_requirements": RUNTIME_REQUIREMENTS,
    })
}

/// SHA-256 hex digest of the canonical plan JSON.
///
/// Pure and stable across processes: `serde_json` objects serialize with
/// sorted keys, so permuting `env` insertion order cannot change the hash,
/// while package order is preserved and therefore semantic.
///
/// # Errors
///
/// Returns [`SpecError::Json`] if the plan cannot be serialized.
pub fn plan_hash(spec: &ImageSpec) -> Result<String, SpecError> {
    let payload = serde_json::to_string(&build_plan(spec))?;
    Ok(sha256_hex(payload.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LocalSource;
    use proptest::prelude::*;

    fn base_spec() -> ImageSpec {
        ImageSpec::new("python:3.11-slim")
            .system_packages(["git", "curl"])
            .runtime_packages(["numpy"])
            .env("A", "1")
            .env("B", "2")
            .local_source(LocalSource::sync("mypkg"))
    }

    #[test]
    fn hash_is_stable_across_clones() {
        let spec = base_spec();
        assert_eq!(
            plan_hash(&spec).unwrap(),
            plan_hash(&spec.clone()).unwrap()
        );
    }

    #[test]
    fn env_insertion_order_is_irrelevant() {
        let ab = ImageSpec::new("python:3.11-slim").env("A", "1").env("B", "2");
        let ba = ImageSpec::new("python:3.11-slim").env("B", "2").env("A", "1");
        assert_eq!(plan_hash(&ab).unwrap(), plan_hash(&ba).unwrap());
    }

    #[test]
    fn package_order_is_semantic() {
        let gc = ImageSpec::new("python:3.11-slim").system_packages(["git", "curl"]);
        let cg = ImageSpec::new("python:3.11-slim").system_packages(["curl", "git"]);
        assert_ne!(plan_hash(&gc).unwrap(), plan_hash(&cg).unwrap());
    }

    #[test]
    fn local_source_mode_changes_hash() {
        let sync = ImageSpec::new("python:3.11-slim").local_source(LocalSource::sync("m"));
        let copy = ImageSpec::new("python:3.11-slim").local_source(LocalSource::copy("m"));
        assert_ne!(plan_hash(&sync).unwrap(), plan_hash(&copy).unwrap());
    }

    #[test]
    fn runtime_requirements_participate_in_plan() {
        let plan = build_plan(&base_spec());
        let reqs = plan["runtime_requirements"].as_array().unwrap();
        assert!(reqs[0].as_str().unwrap().starts_with("coral-worker@"));
    }

    proptest! {
        #[test]
        fn hash_deterministic_for_arbitrary_packages(
            packages in proptest::collection::vec("[a-z][a-z0-9-]{0,12}", 0..8)
        ) {
            let spec = ImageSpec::new("python:3.11-slim")
                .system_packages(packages.clone());
            let again = ImageSpec::new("python:3.11-slim")
                .system_packages(packages);
            prop_assert_eq!(plan_hash(&spec).unwrap(), plan_hash(&again).unwrap());
        }
    }
}
