// SPDX-License-Identifier: MIT OR Apache-2.0
//! coral-protocol
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! Protocol v1: the [`CallSpec`] wire envelope, the environment-variable
//! contract between session and worker, the runtime-setup payload for
//! no-build execution, and the stdout result markers.

/// Worker environment-variable names and chunked-variable helpers.
pub mod env;
/// Runtime-setup payload applied when the image was not pre-built.
pub mod setup;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Protocol version embedded in every envelope. Receivers MUST reject
/// anything else.
pub const PROTOCOL_VERSION: &str = "1";

/// The only serialization tag supported by protocol v1: args as a JSON
/// array, kwargs as a JSON object, base64-wrapped for transport.
pub const SERIALIZATION_JSON_V1: &str = "json-v1";

/// Legacy tag from the interpreter-era wire format. Recognized so the
/// error can name it, never accepted.
pub const SERIALIZATION_LEGACY_PICKLE: &str = "cloudpickle-v1";

/// Label key for the session run id.
pub const LABEL_RUN_ID: &str = "run_id";
/// Label key for the app name.
pub const LABEL_APP: &str = "app";
/// Label key for the call id.
pub const LABEL_CALL_ID: &str = "call_id";

/// Marker prefix the worker prints before a base64 result payload.
pub const RESULT_MARKER: &str = "__CORAL_RESULT_B64__:";
/// Marker prefix the worker prints before a base64 error payload.
pub const ERROR_MARKER: &str = "__CORAL_ERROR_B64__:";

/// Errors raised while encoding or decoding protocol payloads.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// A required environment variable is absent.
    #[error("required environment variable {name} not set")]
    MissingEnv {
        /// Name of the missing variable.
        name: String,
    },

    /// A payload was not valid base64.
    #[error("invalid base64 in {what}: {source}")]
    InvalidBase64 {
        /// What was being decoded.
        what: String,
        /// Decoder error.
        #[source]
        source: base64::DecodeError,
    },

    /// A payload was not valid JSON.
    #[error("invalid JSON in {what}: {source}")]
    InvalidJson {
        /// What was being decoded.
        what: String,
        /// Parser error.
        #[source]
        source: serde_json::Error,
    },

    /// The envelope names a serialization this worker does not speak.
    #[error("unsupported serialization tag: {tag}")]
    UnsupportedSerialization {
        /// The offending tag.
        tag: String,
    },

    /// The envelope was produced by a different protocol version.
    #[error("protocol version mismatch: got {found}, expected {PROTOCOL_VERSION}")]
    VersionMismatch {
        /// The version found in the envelope.
        found: String,
    },
}

/// How the worker treats the call's stdout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum StdoutMode {
    /// Forward stdout to the backend's log sink.
    #[default]
    Stream,
    /// Discard stdout.
    Swallow,
}

/// The wire envelope for one call.
///
/// Serializes to JSON with the exact key set of protocol v1;
/// `from_json(to_json(cs)) == cs` for all well-formed values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct CallSpec {
    /// 32-hex call identifier, unique within a session.
    pub call_id: String,
    /// Module path of the target callable.
    pub module: String,
    /// Dotted qualified name within the module.
    pub qualname: String,
    /// Base64 of the serialized positional arguments.
    pub args_b64: String,
    /// Base64 of the serialized keyword arguments.
    pub kwargs_b64: String,
    /// Serialization tag; see [`SERIALIZATION_JSON_V1`].
    pub serialization: String,
    /// URI the worker writes the result payload to.
    pub result_ref: String,
    /// Stdout handling for the call.
    #[serde(default)]
    pub stdout_mode: StdoutMode,
    /// Labels attached to backend log entries.
    #[serde(default)]
    pub log_labels: BTreeMap<String, String>,
    /// Always [`PROTOCOL_VERSION`] on the wire.
    #[serde(default = "default_protocol_version")]
    pub protocol_version: String,
}

fn default_protocol_version() -> String {
    PROTOCOL_VERSION.to_string()
}

impl CallSpec {
    /// Serialize the envelope to its JSON wire form.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidJson`] if serialization fails (it
    /// cannot for well-formed values).
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|source| ProtocolError::InvalidJson {
            what: "CallSpec".to_string(),
            source,
        })
    }

    /// Parse an envelope from its JSON wire form.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidJson`] for malformed input and
    /// [`ProtocolError::VersionMismatch`] for foreign protocol versions.
    pub fn from_json(payload: &str) -> Result<Self, ProtocolError> {
        let spec: Self =
            serde_json::from_str(payload).map_err(|source| ProtocolError::InvalidJson {
                what: "CallSpec".to_string(),
                source,
            })?;
        if spec.protocol_version != PROTOCOL_VERSION {
            return Err(ProtocolError::VersionMismatch {
                found: spec.protocol_version,
            });
        }
        Ok(spec)
    }

    /// Base64 of the JSON wire form, as carried in `CALLSPEC_B64`.
    ///
    /// # Errors
    ///
    /// Propagates [`CallSpec::to_json`] failures.
    pub fn to_b64(&self) -> Result<String, ProtocolError> {
        Ok(B64.encode(self.to_json()?.as_bytes()))
    }

    /// Decode an envelope from a `CALLSPEC_B64` value.
    ///
    /// # Errors
    ///
    /// Returns a [`ProtocolError`] on bad base64, bad JSON, or a
    /// mismatched protocol version.
    pub fn from_b64(payload: &str) -> Result<Self, ProtocolError> {
        let raw = B64
            .decode(payload.as_bytes())
            .map_err(|source| ProtocolError::InvalidBase64 {
                what: "CALLSPEC_B64".to_string(),
                source,
            })?;
        let spec: Self =
            serde_json::from_slice(&raw).map_err(|source| ProtocolError::InvalidJson {
                what: "CALLSPEC_B64".to_string(),
                source,
            })?;
        if spec.protocol_version != PROTOCOL_VERSION {
            return Err(ProtocolError::VersionMismatch {
                found: spec.protocol_version,
            });
        }
        Ok(spec)
    }
}

/// Encode positional arguments with the v1 serialization.
///
/// # Errors
///
/// Returns [`ProtocolError::InvalidJson`] if the values cannot serialize.
pub fn encode_args(args: &[serde_json::Value]) -> Result<String, ProtocolError> {
    let json = serde_json::to_string(args).map_err(|source| ProtocolError::InvalidJson {
        what: "args".to_string(),
        source,
    })?;
    Ok(B64.encode(json.as_bytes()))
}

/// Encode keyword arguments with the v1 serialization.
///
/// # Errors
///
/// Returns [`ProtocolError::InvalidJson`] if the values cannot serialize.
pub fn encode_kwargs(
    kwargs: &BTreeMap<String, serde_json::Value>,
) -> Result<String, ProtocolError> {
    let json = serde_json::to_string(kwargs).map_err(|source| ProtocolError::InvalidJson {
        what: "kwargs".to_string(),
        source,
    })?;
    Ok(B64.encode(json.as_bytes()))
}

/// Decode positional arguments, checking the envelope's serialization tag.
///
/// # Errors
///
/// Returns [`ProtocolError::UnsupportedSerialization`] for foreign tags
/// (including the legacy pickle tag) and decode errors otherwise.
pub fn decode_args(
    tag: &str,
    args_b64: &str,
) -> Result<Vec<serde_json::Value>, ProtocolError> {
    check_serialization(tag)?;
    decode_b64_json(args_b64, "args")
}

/// Decode keyword arguments, checking the envelope's serialization tag.
///
/// # Errors
///
/// Same contract as [`decode_args`].
pub fn decode_kwargs(
    tag: &str,
    kwargs_b64: &str,
) -> Result<BTreeMap<String, serde_json::Value>, ProtocolError> {
    check_serialization(tag)?;
    decode_b64_json(kwargs_b64, "kwargs")
}

/// Reject every serialization tag except [`SERIALIZATION_JSON_V1`].
///
/// # Errors
///
/// Returns [`ProtocolError::UnsupportedSerialization`] on mismatch.
pub fn check_serialization(tag: &str) -> Result<(), ProtocolError> {
    if tag == SERIALIZATION_JSON_V1 {
        return Ok(());
    }
    Err(ProtocolError::UnsupportedSerialization {
        tag: tag.to_string(),
    })
}

fn decode_b64_json<T: serde::de::DeserializeOwned>(
    payload: &str,
    what: &str,
) -> Result<T, ProtocolError> {
    let raw = B64
        .decode(payload.as_bytes())
        .map_err(|source| ProtocolError::InvalidBase64 {
            what: what.to_string(),
            source,
        })?;
    serde_json::from_slice(&raw).map_err(|source| ProtocolError::InvalidJson {
        what: what.to_string(),
        source,
    })
}

/// Build the standard label map for logs and backend resources.
#[must_use]
pub fn log_labels(run_id: &str, app: &str, call_id: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(LABEL_RUN_ID.to_string(), run_id.to_string());
    labels.insert(LABEL_APP.to_string(), app.to_string());
    labels.insert(LABEL_CALL_ID.to_string(), call_id.to_string());
    labels
}

/// Format a stdout marker line for a finished call.
#[must_use]
pub fn marker_line(success: bool, payload: &[u8]) -> String {
    let prefix = if success { RESULT_MARKER } else { ERROR_MARKER };
    format!("{prefix}{}", B64.encode(payload))
}

/// Parse a stdout marker line, returning `(success, payload)` when the
/// line carries one.
#[must_use]
pub fn parse_marker_line(line: &str) -> Option<(bool, Vec<u8>)> {
    let line = line.trim();
    let (success, b64) = if let Some(rest) = line.strip_prefix(RESULT_MARKER) {
        (true, rest)
    } else if let Some(rest) = line.strip_prefix(ERROR_MARKER) {
        (false, rest)
    } else {
        return None;
    };
    B64.decode(b64.as_bytes()).ok().map(|raw| (success, raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn sample() -> CallSpec {
        CallSpec {
            call_id: "a".repeat(32),
            module: "tasks".into(),
            qualname: "process".into(),
            args_b64: encode_args(&[json!("hello coral")]).unwrap(),
            kwargs_b64: encode_kwargs(&BTreeMap::new()).unwrap(),
            serialization: SERIALIZATION_JSON_V1.into(),
            result_ref: "file:///tmp/result.bin".into(),
            stdout_mode: StdoutMode::Stream,
            log_labels: log_labels("r", "app", &"a".repeat(32)),
            protocol_version: PROTOCOL_VERSION.into(),
        }
    }

    #[test]
    fn json_round_trip_is_identity() {
        let spec = sample();
        let back = CallSpec::from_json(&spec.to_json().unwrap()).unwrap();
        assert_eq!(back, spec);
    }

    #[test]
    fn b64_round_trip_is_identity() {
        let spec = sample();
        let back = CallSpec::from_b64(&spec.to_b64().unwrap()).unwrap();
        assert_eq!(back, spec);
    }

    #[test]
    fn wire_keys_match_protocol_v1() {
        let value: serde_json::Value =
            serde_json::from_str(&sample().to_json().unwrap()).unwrap();
        let obj = value.as_object().unwrap();
        for key in [
            "call_id",
            "module",
            "qualname",
            "args_b64",
            "kwargs_b64",
            "serialization",
            "result_ref",
            "stdout_mode",
            "log_labels",
            "protocol_version",
        ] {
            assert!(obj.contains_key(key), "missing key {key}");
        }
        assert_eq!(obj.len(), 10);
    }

    #[test]
    fn decode_defaults_optional_fields() {
        let json = r#"{
            "call_id": "c", "module": "m", "qualname": "q",
            "args_b64": "", "kwargs_b64": "",
            "serialization": "json-v1", "result_ref": ""
        }"#;
        let spec = CallSpec::from_json(json).unwrap();
        assert_eq!(spec.stdout_mode, StdoutMode::Stream);
        assert!(spec.log_labels.is_empty());
        assert_eq!(spec.protocol_version, PROTOCOL_VERSION);
    }

    #[test]
    fn foreign_protocol_version_is_rejected() {
        let mut spec = sample();
        spec.protocol_version = "2".into();
        let err = CallSpec::from_json(&serde_json::to_string(&spec).unwrap()).unwrap_err();
        assert!(matches!(err, ProtocolError::VersionMismatch { found } if found == "2"));
    }

    #[test]
    fn legacy_pickle_tag_is_fatal() {
        let err = decode_args(SERIALIZATION_LEGACY_PICKLE, "").unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::UnsupportedSerialization { tag } if tag == "cloudpickle-v1"
        ));
    }

    #[test]
    fn args_encode_decode() {
        let args = vec![json!(1), json!({"k": [true, null]})];
        let b64 = encode_args(&args).unwrap();
        assert_eq!(decode_args(SERIALIZATION_JSON_V1, &b64).unwrap(), args);
    }

    #[test]
    fn marker_lines_round_trip() {
        let line = marker_line(true, b"payload");
        let (ok, raw) = parse_marker_line(&line).unwrap();
        assert!(ok);
        assert_eq!(raw, b"payload");

        let line = marker_line(false, b"Traceback");
        let (ok, raw) = parse_marker_line(&line).unwrap();
        assert!(!ok);
        assert_eq!(raw, b"Traceback");

        assert!(parse_marker_line("just a log line").is_none());
    }

    proptest! {
        #[test]
        fn round_trip_arbitrary_fields(
            module in "[a-z_.]{1,30}",
            qualname in "[A-Za-z_.<>]{1,40}",
            result_ref in "[ -~]{0,60}",
        ) {
            let mut spec = sample();
            spec.module = module;
            spec.qualname = qualname;
            spec.result_ref = result_ref;
            let back = CallSpec::from_json(&spec.to_json().unwrap()).unwrap();
            prop_assert_eq!(back, spec);
        }
    }
}
