// SPDX-License-Identifier: MIT OR Apache-2.0
//! An in-process backend for local development and unit tests.
//!
//! Every capability is real enough to exercise the whole contract: the
//! artifact store is a directory, the executor runs the actual worker
//! protocol in-process against a sandboxed [`Worker`], and the builder
//! hands out deterministic refs keyed by the plan hash. Counters expose
//! how often each capability was hit so tests can assert cache behavior.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use async_trait::async_trait;
use coral_backend_core::{
    ArtifactStore, Backend, CleanupManager, CustomTemplates, Executor, HostBootstrap,
    ImageBuilder, LogStreamer, Result, StatusCallback,
};
use coral_core::{
    BundleRef, ImageRef, ImageSpec, ResourceSpec, RunHandle, RunResult, plan::plan_hash,
};
use coral_error::CoralError;
use coral_protocol::env::{ENV_BUNDLE_URI, ENV_CALLSPEC_B64, ENV_RESULT_URI};
use coral_protocol::{CallSpec, LABEL_RUN_ID};
use coral_worker::Worker;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::sync::mpsc;
use tracing::debug;

/// Directory-backed artifact store.
pub struct MockArtifacts {
    root: PathBuf,
    uploads: AtomicUsize,
}

impl MockArtifacts {
    fn new(root: PathBuf) -> Self {
        Self {
            root,
            uploads: AtomicUsize::new(0),
        }
    }

    /// Number of `put_bundle` calls that actually uploaded.
    #[must_use]
    pub fn upload_count(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ArtifactStore for MockArtifacts {
    async fn put_bundle(&self, path: &Path, hash: &str) -> Result<BundleRef> {
        let dest = self.root.join("bundles").join(format!("{hash}.tar.gz"));
        let parent = dest.parent().expect("bundle dir");
        std::fs::create_dir_all(parent)
            .and_then(|()| std::fs::copy(path, &dest).map(|_| ()))
            .map_err(|e| CoralError::artifact("bundle upload failed").with_source(e))?;
        self.uploads.fetch_add(1, Ordering::SeqCst);
        Ok(BundleRef {
            uri: dest.display().to_string(),
            hash: hash.to_string(),
        })
    }

    async fn get_result(&self, result_ref: &str) -> Result<Vec<u8>> {
        std::fs::read(result_ref)
            .map_err(|e| CoralError::artifact(format!("no result at {result_ref}")).with_source(e))
    }

    fn result_uri(&self, call_id: &str) -> String {
        self.root
            .join("results")
            .join(format!("{call_id}.bin"))
            .display()
            .to_string()
    }

    async fn signed_url(
        &self,
        _uri: &str,
        _ttl: std::time::Duration,
        _method: &str,
    ) -> Result<Option<String>> {
        Ok(None)
    }
}

/// Builder that never builds: refs are derived from the plan hash.
pub struct MockBuilder {
    calls: AtomicUsize,
}

impl MockBuilder {
    /// Number of `resolve_image` calls observed.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ImageBuilder for MockBuilder {
    async fn resolve_image(
        &self,
        spec: &ImageSpec,
        _copy_sources: &[PathBuf],
    ) -> Result<ImageRef> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let hash =
            plan_hash(spec).map_err(|e| CoralError::builder("plan hash failed").with_source(e))?;
        let mut metadata = BTreeMap::new();
        metadata.insert("hash".to_string(), hash.clone());
        Ok(ImageRef {
            uri: format!("mock-registry/coral:{hash}"),
            digest: format!("sha256:{}", &hash[..16]),
            metadata,
        })
    }
}

#[derive(Default)]
struct ExecutorState {
    pending: BTreeMap<String, BTreeMap<String, String>>,
    cancelled: Vec<String>,
    last_env: Option<BTreeMap<String, String>>,
}

/// Executor that lands calls on an in-process [`Worker`].
pub struct MockExecutor {
    worker: Worker,
    state: Mutex<ExecutorState>,
}

#[async_trait]
impl Executor for MockExecutor {
    async fn submit(
        &self,
        call: &CallSpec,
        _image: &ImageRef,
        bundle: &BundleRef,
        _resources: &ResourceSpec,
        env: &BTreeMap<String, String>,
        labels: &BTreeMap<String, String>,
    ) -> Result<RunHandle> {
        let mut worker_env = env.clone();
        worker_env.insert(
            ENV_CALLSPEC_B64.to_string(),
            call.to_b64()
                .map_err(|e| CoralError::executor("encode callspec").with_source(e))?,
        );
        if !bundle.uri.is_empty() {
            worker_env.insert(ENV_BUNDLE_URI.to_string(), bundle.uri.clone());
        }
        if !call.result_ref.is_empty() {
            worker_env.insert(ENV_RESULT_URI.to_string(), call.result_ref.clone());
        }

        let run_id = labels.get(LABEL_RUN_ID).cloned().unwrap_or_default();
        {
            let mut state = self.state.lock().expect("executor lock");
            state.last_env = Some(worker_env.clone());
            state.pending.insert(call.call_id.clone(), worker_env);
        }
        debug!(call_id = %call.call_id, "mock submit");
        Ok(RunHandle {
            run_id,
            call_id: call.call_id.clone(),
            provider_ref: format!("mock-job-{}", call.call_id),
        })
    }

    async fn wait(&self, handle: &RunHandle) -> Result<RunResult> {
        let (env, cancelled) = {
            let mut state = self.state.lock().expect("executor lock");
            let cancelled = state.cancelled.contains(&handle.call_id);
            (state.pending.remove(&handle.call_id), cancelled)
        };
        // Cancelled-during-wait policy for this backend: a failed result,
        // not an error.
        if cancelled {
            return Ok(RunResult {
                call_id: handle.call_id.clone(),
                success: false,
                output: b"run cancelled".to_vec(),
            });
        }
        let Some(env) = env else {
            return Err(CoralError::executor(format!(
                "unknown or already-waited handle {}",
                handle.provider_ref
            )));
        };

        let outcome = self.worker.execute(&env).await;
        let output = env
            .get(ENV_RESULT_URI)
            .and_then(|uri| std::fs::read(uri).ok())
            .unwrap_or_else(|| outcome.payload.clone());
        Ok(RunResult {
            call_id: handle.call_id.clone(),
            success: outcome.success,
            output,
        })
    }

    async fn cancel(&self, handle: &RunHandle) -> Result<()> {
        let mut state = self.state.lock().expect("executor lock");
        if state.pending.contains_key(&handle.call_id) {
            state.cancelled.push(handle.call_id.clone());
        }
        Ok(())
    }
}

/// Log streamer that replays a fixed preamble.
pub struct MockLogStreamer;

#[async_trait]
impl LogStreamer for MockLogStreamer {
    async fn stream(&self, handle: &RunHandle) -> Result<mpsc::Receiver<String>> {
        let (tx, rx) = mpsc::channel(8);
        let provider_ref = handle.provider_ref.clone();
        tokio::spawn(async move {
            let _ = tx.send(format!("mock backend starting {provider_ref}")).await;
            let _ = tx.send("mock backend finished".to_string()).await;
        });
        Ok(rx)
    }
}

/// Cleanup manager that records every invocation.
#[derive(Default)]
pub struct MockCleanup {
    calls: Mutex<Vec<(String, bool)>>,
}

impl MockCleanup {
    /// `(provider_ref, detached)` pairs seen so far.
    #[must_use]
    pub fn calls(&self) -> Vec<(String, bool)> {
        self.calls.lock().expect("cleanup lock").clone()
    }
}

#[async_trait]
impl CleanupManager for MockCleanup {
    async fn cleanup(&self, handle: &RunHandle, detached: bool) -> Result<()> {
        if detached {
            return Ok(());
        }
        self.calls
            .lock()
            .expect("cleanup lock")
            .push((handle.provider_ref.clone(), detached));
        Ok(())
    }
}

struct MockTemplates {
    template_id: String,
}

#[async_trait]
impl CustomTemplates for MockTemplates {
    async fn ensure_custom_template(&self, _image: &ImageRef) -> Result<String> {
        Ok(self.template_id.clone())
    }
}

/// The assembled mock backend.
pub struct MockBackend {
    builder: Arc<MockBuilder>,
    artifacts: Arc<MockArtifacts>,
    executor: Arc<MockExecutor>,
    log_streamer: Arc<MockLogStreamer>,
    cleanup: Arc<MockCleanup>,
    templates: Option<Arc<MockTemplates>>,
    host_bootstrap: Option<HostBootstrap>,
    status_callback: Mutex<Option<StatusCallback>>,
    _scratch: TempDir,
}

impl MockBackend {
    /// Build a mock backend around a sandboxed worker.
    ///
    /// The worker's registry decides which targets are callable; its
    /// bundle destination is pointed into the backend's scratch space.
    ///
    /// # Panics
    ///
    /// Panics when the scratch directory cannot be created.
    #[must_use]
    pub fn new(worker: Worker) -> Self {
        let scratch = TempDir::new().expect("mock backend scratch dir");
        let worker = worker.bundle_dest(scratch.path().join("src"));
        Self {
            builder: Arc::new(MockBuilder {
                calls: AtomicUsize::new(0),
            }),
            artifacts: Arc::new(MockArtifacts::new(scratch.path().to_path_buf())),
            executor: Arc::new(MockExecutor {
                worker,
                state: Mutex::new(ExecutorState::default()),
            }),
            log_streamer: Arc::new(MockLogStreamer),
            cleanup: Arc::new(MockCleanup::default()),
            templates: None,
            host_bootstrap: None,
            status_callback: Mutex::new(None),
            _scratch: scratch,
        }
    }

    /// Advertise the custom-template capability with a fixed id.
    #[must_use]
    pub fn with_custom_template(mut self, template_id: impl Into<String>) -> Self {
        self.templates = Some(Arc::new(MockTemplates {
            template_id: template_id.into(),
        }));
        self
    }

    /// Advertise host-side bootstrap (no-build) support.
    #[must_use]
    pub fn with_host_bootstrap(mut self, bootstrap: HostBootstrap) -> Self {
        self.host_bootstrap = Some(bootstrap);
        self
    }

    /// Number of builder invocations.
    #[must_use]
    pub fn builder_calls(&self) -> usize {
        self.builder.call_count()
    }

    /// Number of bundle uploads that reached the artifact store.
    #[must_use]
    pub fn bundle_uploads(&self) -> usize {
        self.artifacts.upload_count()
    }

    /// Cleanup invocations recorded so far.
    #[must_use]
    pub fn cleanup_calls(&self) -> Vec<(String, bool)> {
        self.cleanup.calls()
    }

    /// Whether a status callback has been installed.
    #[must_use]
    pub fn has_status_callback(&self) -> bool {
        self.status_callback.lock().expect("status lock").is_some()
    }

    /// The worker environment composed for the most recent submit.
    #[must_use]
    pub fn last_env(&self) -> Option<BTreeMap<String, String>> {
        self.executor
            .state
            .lock()
            .expect("executor lock")
            .last_env
            .clone()
    }
}

impl Backend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    fn builder(&self) -> Arc<dyn ImageBuilder> {
        Arc::clone(&self.builder) as Arc<dyn ImageBuilder>
    }

    fn artifacts(&self) -> Arc<dyn ArtifactStore> {
        Arc::clone(&self.artifacts) as Arc<dyn ArtifactStore>
    }

    fn executor(&self) -> Arc<dyn Executor> {
        Arc::clone(&self.executor) as Arc<dyn Executor>
    }

    fn log_streamer(&self) -> Arc<dyn LogStreamer> {
        Arc::clone(&self.log_streamer) as Arc<dyn LogStreamer>
    }

    fn cleanup(&self) -> Arc<dyn CleanupManager> {
        Arc::clone(&self.cleanup) as Arc<dyn CleanupManager>
    }

    fn custom_templates(&self) -> Option<Arc<dyn CustomTemplates>> {
        self.templates
            .as_ref()
            .map(|t| Arc::clone(t) as Arc<dyn CustomTemplates>)
    }

    fn host_bootstrap(&self) -> Option<HostBootstrap> {
        self.host_bootstrap.clone()
    }

    fn set_status_callback(&self, cb: StatusCallback) {
        *self.status_callback.lock().expect("status lock") = Some(cb);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coral_protocol::{
        PROTOCOL_VERSION, SERIALIZATION_JSON_V1, StdoutMode, encode_args, encode_kwargs,
    };
    use serde_json::json;

    fn call(module: &str, qualname: &str, args: Vec<serde_json::Value>, result_ref: String) -> CallSpec {
        CallSpec {
            call_id: coral_core::new_id(),
            module: module.into(),
            qualname: qualname.into(),
            args_b64: encode_args(&args).unwrap(),
            kwargs_b64: encode_kwargs(&BTreeMap::new()).unwrap(),
            serialization: SERIALIZATION_JSON_V1.into(),
            result_ref,
            stdout_mode: StdoutMode::Stream,
            log_labels: BTreeMap::new(),
            protocol_version: PROTOCOL_VERSION.into(),
        }
    }

    #[tokio::test]
    async fn executes_registered_target_in_process() {
        let worker = Worker::sandboxed().register("m", "double", |args, _| {
            Ok(json!(args[0].as_i64().unwrap() * 2))
        });
        let backend = MockBackend::new(worker);

        let result_ref = backend.artifacts.result_uri("call-1");
        let spec = call("m", "double", vec![json!(21)], result_ref);
        let image = ImageRef::build_disabled();
        let bundle = BundleRef {
            uri: String::new(),
            hash: "h".into(),
        };
        let handle = backend
            .executor()
            .submit(
                &spec,
                &image,
                &bundle,
                &ResourceSpec::default(),
                &BTreeMap::new(),
                &BTreeMap::new(),
            )
            .await
            .unwrap();

        let result = backend.executor().wait(&handle).await.unwrap();
        assert!(result.success);
        assert_eq!(serde_json::from_slice::<i64>(&result.output).unwrap(), 42);
    }

    #[tokio::test]
    async fn cancel_before_wait_yields_failed_result() {
        let backend = MockBackend::new(Worker::sandboxed());
        let spec = call("m", "f", vec![], String::new());
        let handle = backend
            .executor()
            .submit(
                &spec,
                &ImageRef::build_disabled(),
                &BundleRef {
                    uri: String::new(),
                    hash: "h".into(),
                },
                &ResourceSpec::default(),
                &BTreeMap::new(),
                &BTreeMap::new(),
            )
            .await
            .unwrap();

        backend.executor().cancel(&handle).await.unwrap();
        let result = backend.executor().wait(&handle).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.output, b"run cancelled");
    }

    #[tokio::test]
    async fn log_stream_ends_when_receiver_drains() {
        let backend = MockBackend::new(Worker::sandboxed());
        let handle = RunHandle {
            run_id: "r".into(),
            call_id: "c".into(),
            provider_ref: "mock-job-c".into(),
        };
        let mut rx = backend.log_streamer().stream(&handle).await.unwrap();
        let mut lines = Vec::new();
        while let Some(line) = rx.recv().await {
            lines.push(line);
        }
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("mock-job-c"));
    }

    #[tokio::test]
    async fn waiting_twice_is_an_executor_error() {
        let backend = MockBackend::new(Worker::sandboxed());
        let spec = call("m", "f", vec![], String::new());
        let handle = backend
            .executor()
            .submit(
                &spec,
                &ImageRef::build_disabled(),
                &BundleRef {
                    uri: String::new(),
                    hash: "h".into(),
                },
                &ResourceSpec::default(),
                &BTreeMap::new(),
                &BTreeMap::new(),
            )
            .await
            .unwrap();

        backend.executor().wait(&handle).await.unwrap();
        let err = backend.executor().wait(&handle).await.unwrap_err();
        assert_eq!(err.kind(), coral_error::ErrorKind::Executor);
    }
}
