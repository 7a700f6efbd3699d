// SPDX-License-Identifier: MIT OR Apache-2.0
//! coral-backend-core
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! The capability contracts every backend must satisfy, plus the optional
//! capabilities a backend may additionally expose. The session treats all
//! backends polymorphically through these traits; variants differ only in
//! their internals.

/// GPU demand parsing shared by drivers.
pub mod gpu;
/// Deadline-bounded polling with backoff.
pub mod poll;
/// Named backend lookup.
pub mod registry;

use async_trait::async_trait;
use coral_core::{BundleRef, ImageRef, ResourceSpec, RunHandle, RunResult};
use coral_error::CoralError;
use coral_protocol::CallSpec;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub use registry::BackendRegistry;

/// Convenience result alias for backend operations.
pub type Result<T> = std::result::Result<T, CoralError>;

/// Callback invoked with human-readable status lines as a run progresses.
pub type StatusCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Normalized executor-side run state.
///
/// `SUBMITTED → RUNNING → {SUCCEEDED, FAILED, STOPPED}`; terminal states
/// are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Accepted by the backend, not yet running.
    Submitted,
    /// Executing on a worker.
    Running,
    /// Finished successfully.
    Succeeded,
    /// Finished with a failure.
    Failed,
    /// Stopped before completion (cancelled or preempted).
    Stopped,
}

impl RunState {
    /// Whether the state is absorbing.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Stopped)
    }

    /// The session only distinguishes success from everything else.
    #[must_use]
    pub fn is_success(self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

/// Resolves an [`ImageRef`] for an image spec, building only when needed.
#[async_trait]
pub trait ImageBuilder: Send + Sync {
    /// Return a ref for the image keyed by the spec's plan hash.
    ///
    /// If the image already exists in the backing registry, return a ref
    /// without rebuilding; otherwise materialize a build context with the
    /// worker library and `copy_sources`, build, push, and return.
    async fn resolve_image(
        &self,
        spec: &coral_core::ImageSpec,
        copy_sources: &[PathBuf],
    ) -> Result<ImageRef>;
}

/// Stores bundles and retrieves result payloads.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Upload a bundle archive, keyed by its content hash.
    async fn put_bundle(&self, path: &Path, hash: &str) -> Result<BundleRef>;

    /// Fetch the raw result payload from a result reference.
    async fn get_result(&self, result_ref: &str) -> Result<Vec<u8>>;

    /// The URI a worker should write the result for `call_id` to.
    fn result_uri(&self, call_id: &str) -> String;

    /// Produce a signed URL for `uri`, or `None` when signing is
    /// unavailable.
    async fn signed_url(
        &self,
        uri: &str,
        ttl: Duration,
        method: &str,
    ) -> Result<Option<String>>;
}

/// Lands a call on a worker and reports its terminal result.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Submit one call. Returns a handle identifying the backend resource.
    async fn submit(
        &self,
        call: &CallSpec,
        image: &ImageRef,
        bundle: &BundleRef,
        resources: &ResourceSpec,
        env: &BTreeMap<String, String>,
        labels: &BTreeMap<String, String>,
    ) -> Result<RunHandle>;

    /// Block until the run reaches a terminal state and return its result.
    async fn wait(&self, handle: &RunHandle) -> Result<RunResult>;

    /// Best-effort cancellation. A no-op once the run is terminal.
    async fn cancel(&self, handle: &RunHandle) -> Result<()>;
}

/// Streams worker log lines for a running call.
#[async_trait]
pub trait LogStreamer: Send + Sync {
    /// Start streaming log lines for the handle.
    ///
    /// The stream is unbounded in principle; the caller stops it by
    /// dropping the receiver.
    async fn stream(&self, handle: &RunHandle) -> Result<mpsc::Receiver<String>>;
}

/// Releases backend resources after a run.
#[async_trait]
pub trait CleanupManager: Send + Sync {
    /// Clean up the backend resource behind `handle`. Detached runs are
    /// left alone.
    async fn cleanup(&self, handle: &RunHandle, detached: bool) -> Result<()>;
}

/// Optional capability: map a registry image URI to a launchable
/// backend-side template.
#[async_trait]
pub trait CustomTemplates: Send + Sync {
    /// Ensure a launch template exists for `image` and return its id.
    async fn ensure_custom_template(&self, image: &ImageRef) -> Result<String>;
}

/// Optional capability: run calls without a pre-built image.
///
/// The worker host re-creates the image's state at runtime from the
/// runtime-setup payload; the session ships the worker library's own
/// sources inside the bundle when a root is given here.
#[derive(Debug, Clone, Default)]
pub struct HostBootstrap {
    /// Source root of the worker library to append to the bundle.
    pub worker_root: Option<PathBuf>,
    /// When `true` the result comes back in-band (stdout markers) and no
    /// result URI is allocated.
    pub inline_result: bool,
}

/// A backend: the capability set the session drives a run through.
///
/// Each accessor may hand out a distinct object; the optional
/// capabilities default to absent.
pub trait Backend: Send + Sync {
    /// Stable backend name (e.g. `"batch"`, `"pod"`, `"mock"`).
    fn name(&self) -> &str;

    /// The image builder capability.
    fn builder(&self) -> Arc<dyn ImageBuilder>;

    /// The artifact store capability.
    fn artifacts(&self) -> Arc<dyn ArtifactStore>;

    /// The executor capability.
    fn executor(&self) -> Arc<dyn Executor>;

    /// The log streamer capability.
    fn log_streamer(&self) -> Arc<dyn LogStreamer>;

    /// The cleanup capability.
    fn cleanup(&self) -> Arc<dyn CleanupManager>;

    /// Custom-template indirection, when the backend has one.
    fn custom_templates(&self) -> Option<Arc<dyn CustomTemplates>> {
        None
    }

    /// Host-side bootstrap (no-build) support, when the backend has it.
    fn host_bootstrap(&self) -> Option<HostBootstrap> {
        None
    }

    /// Install a status callback. Backends without progress reporting
    /// ignore it.
    fn set_status_callback(&self, _cb: StatusCallback) {}
}

impl std::fmt::Debug for dyn Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend").field("name", &self.name()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_are_absorbing() {
        assert!(!RunState::Submitted.is_terminal());
        assert!(!RunState::Running.is_terminal());
        assert!(RunState::Succeeded.is_terminal());
        assert!(RunState::Failed.is_terminal());
        assert!(RunState::Stopped.is_terminal());
    }

    #[test]
    fn only_succeeded_counts_as_success() {
        assert!(RunState::Succeeded.is_success());
        assert!(!RunState::Failed.is_success());
        assert!(!RunState::Stopped.is_success());
    }
}
