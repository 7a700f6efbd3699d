//! Unified error taxonomy for the coral dispatcher.
//!
//! Every error surfaced to a caller of `remote()`/`wait()` is a
//! [`CoralError`]: a stable [`ErrorKind`], a human-readable message, an
//! optional cause, and arbitrary key-value context. Crates closer to the
//! edges define their own `thiserror` enums and convert into this taxonomy
//! at the session boundary.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Broad family an error belongs to. Kinds are stable across releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Missing or invalid profile entry.
    Config,
    /// Cannot locate a module or file for a function reference.
    Resolver,
    /// Empty root list or I/O failure during archiving.
    Packaging,
    /// Image build or push failure.
    Builder,
    /// Upload, download, or signing failure in the artifact store.
    Artifact,
    /// Submit rejected, unattributable terminal failure, or cancellation.
    Executor,
    /// The user callable raised; the message carries the traceback text.
    Call,
    /// Malformed CallSpec, unknown serialization tag, or version mismatch.
    Protocol,
}

impl ErrorKind {
    /// Stable string tag for this kind (e.g. `"packaging"`).
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Config => "config",
            Self::Resolver => "resolver",
            Self::Packaging => "packaging",
            Self::Builder => "builder",
            Self::Artifact => "artifact",
            Self::Executor => "executor",
            Self::Call => "call",
            Self::Protocol => "protocol",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The single error type surfaced at the session boundary.
#[derive(Debug)]
pub struct CoralError {
    /// Taxonomy kind.
    pub kind: ErrorKind,
    /// Human-readable message. For [`ErrorKind::Call`] this is the decoded
    /// traceback text from the worker.
    pub message: String,
    /// Key-value context attached along the way.
    pub context: BTreeMap<String, String>,
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for CoralError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)?;
        for (k, v) in &self.context {
            write!(f, " {k}={v}")?;
        }
        Ok(())
    }
}

impl std::error::Error for CoralError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

impl CoralError {
    /// Construct an error with the given kind and message.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            context: BTreeMap::new(),
            source: None,
        }
    }

    /// A [`ErrorKind::Config`] error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Config, message)
    }

    /// A [`ErrorKind::Resolver`] error.
    pub fn resolver(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Resolver, message)
    }

    /// A [`ErrorKind::Packaging`] error.
    pub fn packaging(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Packaging, message)
    }

    /// A [`ErrorKind::Builder`] error.
    pub fn builder(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Builder, message)
    }

    /// An [`ErrorKind::Artifact`] error.
    pub fn artifact(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Artifact, message)
    }

    /// An [`ErrorKind::Executor`] error.
    pub fn executor(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Executor, message)
    }

    /// A [`ErrorKind::Call`] error carrying the worker traceback text.
    pub fn call(traceback: impl Into<String>) -> Self {
        Self::new(ErrorKind::Call, traceback)
    }

    /// A [`ErrorKind::Protocol`] error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Protocol, message)
    }

    /// Attach a key-value context entry.
    #[must_use]
    pub fn context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Attach an underlying cause.
    #[must_use]
    pub fn with_source(
        mut self,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// The taxonomy kind of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

/// Convenience alias used across the workspace.
pub type Result<T, E = CoralError> = std::result::Result<T, E>;
