// SPDX-License-Identifier: MIT OR Apache-2.0
//! The environment-variable contract between session and worker.
//!
//! Variable names are the wire surface of protocol v1: a worker only ever
//! sees the environment, so these constants are as load-bearing as the
//! [`CallSpec`](crate::CallSpec) keys. Also hosts the chunked-variable
//! scheme for backends that cap per-variable sizes.

use crate::ProtocolError;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;

/// Base64 of the CallSpec JSON. Required for every run.
pub const ENV_CALLSPEC_B64: &str = "CALLSPEC_B64";
/// URI the worker downloads the bundle from.
pub const ENV_BUNDLE_URI: &str = "BUNDLE_URI";
/// Inline base64 bundle payload (small bundles only).
pub const ENV_BUNDLE_B64: &str = "BUNDLE_B64";
/// URI the worker writes the serialized result to.
pub const ENV_RESULT_URI: &str = "RESULT_URI";
/// When `"1"`, the worker also emits the result between stdout markers.
pub const ENV_RESULT_STDOUT: &str = "RESULT_STDOUT";
/// Base64 runtime-setup payload; present iff the image was not pre-built.
pub const ENV_RUNTIME_SETUP_B64: &str = "RUNTIME_SETUP_B64";
/// Set to `"1"` when the image build was skipped.
pub const ENV_IMAGE_BUILD_DISABLED: &str = "IMAGE_BUILD_DISABLED";
/// Set to `"1"` when the session runs verbose.
pub const ENV_VERBOSE: &str = "VERBOSE";
/// Set to `"1"` when the session is detached.
pub const ENV_DETACHED: &str = "DETACHED";

/// Suffix of the chunk-count variable for a chunked value.
pub const CHUNKS_SUFFIX: &str = "_CHUNKS";

/// Default destination the worker unpacks the bundle into.
pub const DEFAULT_BUNDLE_DEST: &str = "/opt/coral/src";

/// Split a value into numbered chunks when it exceeds `cap` bytes.
///
/// Returns `[(NAME, value)]` untouched when the value fits, otherwise
/// `[(NAME_CHUNKS, n), (NAME_0000, …), (NAME_0001, …), …]`. Chunks
/// concatenate in index order to reproduce the original value.
#[must_use]
pub fn split_env_chunks(name: &str, value: &str, cap: usize) -> Vec<(String, String)> {
    if value.len() <= cap {
        return vec![(name.to_string(), value.to_string())];
    }
    let chunks: Vec<&str> = value
        .as_bytes()
        .chunks(cap)
        .map(|c| std::str::from_utf8(c).expect("base64 values are ASCII"))
        .collect();
    let mut vars = Vec::with_capacity(chunks.len() + 1);
    vars.push((format!("{name}{CHUNKS_SUFFIX}"), chunks.len().to_string()));
    for (i, chunk) in chunks.iter().enumerate() {
        vars.push((format!("{name}_{i:04}"), (*chunk).to_string()));
    }
    vars
}

/// Reassemble a possibly-chunked variable from an environment lookup.
///
/// Prefers the plain variable; falls back to `NAME_CHUNKS` + `NAME_0000…`.
///
/// # Errors
///
/// Returns [`ProtocolError::MissingEnv`] when the chunk count is present
/// but a numbered chunk is absent.
pub fn join_env_chunks<F>(name: &str, lookup: F) -> Result<Option<String>, ProtocolError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(value) = lookup(name) {
        return Ok(Some(value));
    }
    let Some(count) = lookup(&format!("{name}{CHUNKS_SUFFIX}")) else {
        return Ok(None);
    };
    let count: usize = count.parse().map_err(|_| ProtocolError::MissingEnv {
        name: format!("{name}{CHUNKS_SUFFIX}"),
    })?;
    let mut value = String::new();
    for i in 0..count {
        let chunk_name = format!("{name}_{i:04}");
        let chunk = lookup(&chunk_name).ok_or(ProtocolError::MissingEnv {
            name: chunk_name,
        })?;
        value.push_str(&chunk);
    }
    Ok(Some(value))
}

/// Decode an inline bundle payload (possibly chunked) into raw bytes.
///
/// # Errors
///
/// Returns a [`ProtocolError`] on missing chunks or invalid base64.
pub fn inline_bundle<F>(lookup: F) -> Result<Option<Vec<u8>>, ProtocolError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(b64) = join_env_chunks(ENV_BUNDLE_B64, lookup)? else {
        return Ok(None);
    };
    let raw = B64
        .decode(b64.as_bytes())
        .map_err(|source| ProtocolError::InvalidBase64 {
            what: ENV_BUNDLE_B64.to_string(),
            source,
        })?;
    Ok(Some(raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn env_of(vars: &[(String, String)]) -> BTreeMap<String, String> {
        vars.iter().cloned().collect()
    }

    #[test]
    fn small_values_pass_through() {
        let vars = split_env_chunks("BUNDLE_B64", "abcd", 10);
        assert_eq!(vars, vec![("BUNDLE_B64".to_string(), "abcd".to_string())]);
    }

    #[test]
    fn large_values_split_and_rejoin() {
        let value: String = "x".repeat(2500);
        let vars = split_env_chunks("BUNDLE_B64", &value, 1000);
        assert_eq!(vars[0].0, "BUNDLE_B64_CHUNKS");
        assert_eq!(vars[0].1, "3");
        assert_eq!(vars[1].0, "BUNDLE_B64_0000");
        assert_eq!(vars.len(), 4);

        let env = env_of(&vars);
        let joined = join_env_chunks("BUNDLE_B64", |k| env.get(k).cloned())
            .unwrap()
            .unwrap();
        assert_eq!(joined, value);
    }

    #[test]
    fn missing_chunk_is_an_error() {
        let value: String = "y".repeat(1500);
        let mut vars = split_env_chunks("BUNDLE_B64", &value, 1000);
        vars.retain(|(k, _)| k != "BUNDLE_B64_0001");
        let env = env_of(&vars);
        let err = join_env_chunks("BUNDLE_B64", |k| env.get(k).cloned()).unwrap_err();
        assert!(matches!(err, ProtocolError::MissingEnv { name } if name == "BUNDLE_B64_0001"));
    }

    #[test]
    fn inline_bundle_decodes_chunked_base64() {
        use base64::Engine as _;
        let payload = b"tarball bytes".to_vec();
        let b64 = base64::engine::general_purpose::STANDARD.encode(&payload);
        let vars = split_env_chunks(ENV_BUNDLE_B64, &b64, 4);
        let env = env_of(&vars);
        let raw = inline_bundle(|k| env.get(k).cloned()).unwrap().unwrap();
        assert_eq!(raw, payload);
    }

    #[test]
    fn absent_bundle_is_none() {
        assert!(inline_bundle(|_| None).unwrap().is_none());
    }
}
