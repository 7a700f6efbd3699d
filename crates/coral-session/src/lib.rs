// SPDX-License-Identifier: MIT OR Apache-2.0
//! coral-session
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! The run session: the engine that, for one submission, reconciles the
//! bundle and image caches, negotiates with the backend capabilities, and
//! waits for a structured result.
//!
//! A session binds `(backend, app)` for its scope. Control flow is
//! strictly synchronous per call; parallelism comes from spawning several
//! calls and waiting on them separately.

/// Apps, function handles, and the current-session slot.
pub mod app;
/// Local source resolution.
pub mod resolver;

pub use app::{App, FunctionHandle, LocalEntrypoint};
pub use resolver::SourceResolver;

use coral_backend_core::{Backend, HostBootstrap, StatusCallback};
use coral_bundle::create_bundle;
use coral_cache::{BundleEntry, CacheDir, ImageEntry};
use coral_core::{
    BundleRef, FunctionSpec, ImageRef, ImageSpec, METADATA_CUSTOM_TEMPLATE_ID, RunHandle,
    RunResult, SourceMode, new_id, plan::plan_hash,
};
use coral_error::CoralError;
use coral_protocol::env::{
    ENV_DETACHED, ENV_IMAGE_BUILD_DISABLED, ENV_RUNTIME_SETUP_B64, ENV_VERBOSE,
};
use coral_protocol::setup::RuntimeSetup;
use coral_protocol::{
    CallSpec, PROTOCOL_VERSION, SERIALIZATION_JSON_V1, StdoutMode, encode_args,
    encode_kwargs, log_labels,
};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Status line emitted while the bundle is prepared and uploaded.
pub const STATUS_UPLOADING: &str = "Uploading files";
/// Status line emitted once the image is resolved.
pub const STATUS_IMAGE_READY: &str = "Image ready";
/// Status line emitted just before the executor submit.
pub const STATUS_SPAWNING: &str = "Spawning container";
/// Status line emitted when the session starts waiting on a call.
pub const STATUS_RUNNING: &str = "Container running";
/// Status line emitted after cleanup.
pub const STATUS_COMPLETED: &str = "Completed";

/// Grace window added to a call's timeout before the session gives up on
/// the executor's wait.
const WAIT_GRACE: Duration = Duration::from_secs(60);

/// Options a session is opened with.
#[derive(Clone, Default)]
pub struct SessionOptions {
    /// Leave backend resources running after `wait` (no cleanup).
    pub detached: bool,
    /// User environment overlaid on the image environment.
    pub env: BTreeMap<String, String>,
    /// Verbose worker logging (`VERBOSE=1`).
    pub verbose: bool,
    /// Skip the on-disk bundle index when reconciling bundles.
    pub no_cache: bool,
    /// Receives human-readable status lines as runs progress.
    pub status_callback: Option<StatusCallback>,
    /// Override the cache directory (defaults to `~/.coral/cache`).
    pub cache_dir: Option<PathBuf>,
    /// Override the source search paths (defaults to cwd + `$CORAL_PATH`).
    pub source_paths: Option<Vec<PathBuf>>,
}

impl std::fmt::Debug for SessionOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionOptions")
            .field("detached", &self.detached)
            .field("verbose", &self.verbose)
            .field("no_cache", &self.no_cache)
            .field("has_status_callback", &self.status_callback.is_some())
            .finish()
    }
}

/// Whether the artifact store receives the bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum StorageMode {
    /// Upload through the artifact store; the ref carries a remote URI.
    Upload,
    /// Keep the archive local; the ref carries its filesystem path.
    Local,
}

/// In-session bundle cache key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct BundleKey {
    plan_hash: String,
    include_copy: bool,
    storage: StorageMode,
    extra_roots: Vec<String>,
}

struct ResolvedSources {
    sync_roots: Vec<PathBuf>,
    copy_roots: Vec<PathBuf>,
    sync_ignores: Vec<String>,
}

/// A scoped binding of app + backend + options.
///
/// Construction acquires the app's exclusive current-session slot;
/// dropping the session releases it on every exit path.
pub struct RunSession {
    backend: Arc<dyn Backend>,
    app: App,
    options: SessionOptions,
    run_id: String,
    cache: CacheDir,
    resolver: SourceResolver,
    bundles: Mutex<BTreeMap<BundleKey, BundleRef>>,
    images: Mutex<BTreeMap<String, ImageRef>>,
    timeouts: Mutex<BTreeMap<String, u64>>,
}

impl std::fmt::Debug for RunSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunSession")
            .field("run_id", &self.run_id)
            .field("app", &self.app.name())
            .field("backend", &self.backend.name())
            .finish()
    }
}

impl Drop for RunSession {
    fn drop(&mut self) {
        self.app.release_session(&self.run_id);
    }
}

impl RunSession {
    /// Open a session, wiring the app's current-session slot.
    ///
    /// # Errors
    ///
    /// Returns a config-kind [`CoralError`] when the app already has an
    /// active session or the cache directory cannot be located.
    pub fn open(
        backend: Arc<dyn Backend>,
        app: App,
        options: SessionOptions,
    ) -> Result<Self, CoralError> {
        let cache = match &options.cache_dir {
            Some(dir) => CacheDir::at(dir),
            None => CacheDir::default_location()
                .map_err(|e| CoralError::config("cache directory unavailable").with_source(e))?,
        };
        let resolver = match &options.source_paths {
            Some(paths) => SourceResolver::new(paths.clone()),
            None => SourceResolver::from_env(),
        };

        let run_id = new_id();
        app.acquire_session(&run_id)?;

        if let Some(cb) = &options.status_callback {
            backend.set_status_callback(Arc::clone(cb));
        }

        info!(run_id = %run_id, app = %app.name(), backend = backend.name(), "session opened");
        Ok(Self {
            backend,
            app,
            options,
            run_id,
            cache,
            resolver,
            bundles: Mutex::new(BTreeMap::new()),
            images: Mutex::new(BTreeMap::new()),
            timeouts: Mutex::new(BTreeMap::new()),
        })
    }

    /// The session's unique run id.
    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// The app this session is bound to.
    #[must_use]
    pub fn app(&self) -> &App {
        &self.app
    }

    /// Warm both the image and bundle caches for the app image.
    ///
    /// # Errors
    ///
    /// Propagates image and bundle reconciliation failures.
    pub async fn prepare(&self) -> Result<(), CoralError> {
        let image = self.app.image_spec();
        self.image(&image).await?;
        self.bundle(&image, false, StorageMode::Upload, &[]).await?;
        Ok(())
    }

    /// Resolve (build or reuse) the app image without bundling.
    ///
    /// # Errors
    ///
    /// Propagates builder failures.
    pub async fn prepare_image(&self) -> Result<ImageRef, CoralError> {
        self.image(&self.app.image_spec()).await
    }

    /// Submit one call and return its handle.
    ///
    /// # Errors
    ///
    /// Returns a config-kind error for detached no-build submissions
    /// (before any backend call); otherwise propagates packaging,
    /// builder, artifact, and executor failures.
    pub async fn submit(
        &self,
        function: &FunctionSpec,
        args: &[Value],
        kwargs: &BTreeMap<String, Value>,
    ) -> Result<RunHandle, CoralError> {
        let image_spec = function
            .image
            .clone()
            .unwrap_or_else(|| self.app.image_spec());

        let host_bootstrap: Option<HostBootstrap> = if function.build_image {
            None
        } else {
            self.backend.host_bootstrap()
        };
        if host_bootstrap.is_some() && self.options.detached {
            return Err(CoralError::config(
                "detached mode is not supported when image builds are disabled",
            ));
        }

        let (image_ref, bundle_ref, inline_result) = match &host_bootstrap {
            Some(hb) => {
                let extra_roots: Vec<PathBuf> = hb.worker_root.iter().cloned().collect();
                let storage = if hb.inline_result {
                    StorageMode::Local
                } else {
                    StorageMode::Upload
                };
                // No image is built here, so copy-mode sources have no
                // build context to land in; they ride in the bundle.
                let bundle = self
                    .bundle(&image_spec, true, storage, &extra_roots)
                    .await?;
                (ImageRef::build_disabled(), bundle, hb.inline_result)
            }
            None => {
                let image = self.image(&image_spec).await?;
                let bundle = self
                    .bundle(&image_spec, false, StorageMode::Upload, &[])
                    .await?;
                (image, bundle, false)
            }
        };

        let call_id = new_id();
        let result_ref = if inline_result {
            String::new()
        } else {
            self.backend.artifacts().result_uri(&call_id)
        };

        let labels = log_labels(&self.run_id, &self.app.name(), &call_id);
        let call = CallSpec {
            call_id: call_id.clone(),
            module: function.module.clone(),
            qualname: function.qualname.clone(),
            args_b64: encode_args(args).map_err(protocol_err)?,
            kwargs_b64: encode_kwargs(kwargs).map_err(protocol_err)?,
            serialization: SERIALIZATION_JSON_V1.to_string(),
            result_ref,
            stdout_mode: StdoutMode::Stream,
            log_labels: labels.clone(),
            protocol_version: PROTOCOL_VERSION.to_string(),
        };

        let mut env = image_spec.env.clone();
        env.extend(self.options.env.clone());
        if image_ref.is_build_disabled() {
            env.insert(ENV_IMAGE_BUILD_DISABLED.to_string(), "1".to_string());
            env.insert(
                ENV_RUNTIME_SETUP_B64.to_string(),
                RuntimeSetup::from_image(&image_spec)
                    .to_b64()
                    .map_err(protocol_err)?,
            );
        }
        if self.options.verbose {
            env.insert(ENV_VERBOSE.to_string(), "1".to_string());
        }
        if self.options.detached {
            env.insert(ENV_DETACHED.to_string(), "1".to_string());
        }

        self.timeouts
            .lock()
            .expect("session lock")
            .insert(call_id.clone(), function.resources.timeout_seconds);

        self.status(STATUS_SPAWNING);
        info!(call_id = %call_id, module = %function.module, qualname = %function.qualname, "submitting call");
        self.backend
            .executor()
            .submit(&call, &image_ref, &bundle_ref, &function.resources, &env, &labels)
            .await
    }

    /// Wait for a submitted call to reach a terminal state.
    ///
    /// Cleanup runs afterwards unless the session is detached; cleanup
    /// failures are logged, never surfaced over a live result.
    ///
    /// # Errors
    ///
    /// Propagates executor failures; an executor that outlives the call
    /// timeout plus a grace window yields an executor-kind error.
    pub async fn wait(&self, handle: &RunHandle) -> Result<RunResult, CoralError> {
        self.status(STATUS_RUNNING);
        let timeout_secs = self
            .timeouts
            .lock()
            .expect("session lock")
            .get(&handle.call_id)
            .copied()
            .unwrap_or(3600);
        let deadline = Duration::from_secs(timeout_secs) + WAIT_GRACE;

        let result = tokio::time::timeout(deadline, self.backend.executor().wait(handle))
            .await
            .map_err(|_| {
                CoralError::executor(format!(
                    "call {} did not reach a terminal state within {}s",
                    handle.call_id,
                    deadline.as_secs()
                ))
            })??;

        if !self.options.detached {
            if let Err(e) = self.backend.cleanup().cleanup(handle, false).await {
                warn!(call_id = %handle.call_id, error = %e, "cleanup failed (ignored)");
            }
        }
        self.status(STATUS_COMPLETED);
        Ok(result)
    }

    /// Submit, wait, and decode: the blocking call path.
    ///
    /// # Errors
    ///
    /// A failed call surfaces as a call-kind [`CoralError`] whose message
    /// is the worker's traceback text.
    pub async fn remote(
        &self,
        function: &FunctionSpec,
        args: &[Value],
        kwargs: &BTreeMap<String, Value>,
    ) -> Result<Value, CoralError> {
        let handle = self.submit(function, args, kwargs).await?;
        let result = self.wait(&handle).await?;
        if !result.success {
            return Err(CoralError::call(
                String::from_utf8_lossy(&result.output).into_owned(),
            ));
        }
        serde_json::from_slice(&result.output).map_err(|e| {
            CoralError::protocol("result payload is not valid serialized output")
                .with_source(e)
        })
    }

    fn status(&self, message: &str) {
        debug!(run_id = %self.run_id, "{message}");
        if let Some(cb) = &self.options.status_callback {
            cb(message);
        }
    }

    fn resolve_local_sources(&self, image: &ImageSpec) -> Result<ResolvedSources, CoralError> {
        let mut sources = ResolvedSources {
            sync_roots: Vec::new(),
            copy_roots: Vec::new(),
            sync_ignores: Vec::new(),
        };
        for src in &image.local_sources {
            let root = self.resolver.resolve(&src.name)?;
            match src.mode {
                SourceMode::Sync => {
                    if !sources.sync_roots.contains(&root) {
                        sources.sync_roots.push(root);
                    }
                    // Same path twice with different ignore lists: union.
                    sources.sync_ignores.extend(src.ignore.iter().cloned());
                }
                SourceMode::Copy => {
                    if !sources.copy_roots.contains(&root) {
                        sources.copy_roots.push(root);
                    }
                }
            }
        }
        Ok(sources)
    }

    fn app_source_roots(&self) -> Vec<PathBuf> {
        if !self.app.include_source() {
            return Vec::new();
        }
        let mut roots = Vec::new();
        for spec in self.app.function_specs() {
            if spec.source_file.is_empty() {
                continue;
            }
            let source = PathBuf::from(&spec.source_file);
            let Some(parent) = source.parent() else {
                continue;
            };
            let Ok(parent) = parent.canonicalize() else {
                continue;
            };
            if !roots.contains(&parent) {
                roots.push(parent);
            }
        }
        roots
    }

    async fn bundle(
        &self,
        image: &ImageSpec,
        include_copy: bool,
        storage: StorageMode,
        extra_roots: &[PathBuf],
    ) -> Result<BundleRef, CoralError> {
        let plan = plan_hash(image).map_err(builder_err)?;
        let key = BundleKey {
            plan_hash: plan,
            include_copy,
            storage,
            extra_roots: {
                let mut roots: Vec<String> =
                    extra_roots.iter().map(|p| p.display().to_string()).collect();
                roots.sort();
                roots
            },
        };
        if let Some(cached) = self.bundles.lock().expect("session lock").get(&key) {
            debug!(hash = %cached.hash, "in-session bundle reuse");
            return Ok(cached.clone());
        }

        self.status(STATUS_UPLOADING);
        let sources = self.resolve_local_sources(image)?;
        let mut roots = self.app_source_roots();
        for root in sources
            .sync_roots
            .iter()
            .chain(include_copy.then_some(&sources.copy_roots).into_iter().flatten())
            .chain(extra_roots.iter())
        {
            let resolved = root
                .canonicalize()
                .unwrap_or_else(|_| root.clone());
            if !roots.contains(&resolved) {
                roots.push(resolved);
            }
        }

        self.cache.ensure().map_err(artifact_err)?;
        let scratch = self.cache.bundle_scratch();
        let result = create_bundle(
            &roots,
            &scratch,
            env!("CARGO_PKG_VERSION"),
            &sources.sync_ignores,
        )
        .map_err(|e| CoralError::packaging(e.to_string()).with_source(e))?;
        debug!(hash = %result.hash, files_root = roots.len(), "bundle created");

        let bundle_ref = match storage {
            StorageMode::Local => BundleRef {
                uri: result.path.display().to_string(),
                hash: result.hash.clone(),
            },
            StorageMode::Upload => self.reconcile_upload(&result).await?,
        };

        self.bundles
            .lock()
            .expect("session lock")
            .insert(key, bundle_ref.clone());
        Ok(bundle_ref)
    }

    async fn reconcile_upload(
        &self,
        result: &coral_bundle::BundleResult,
    ) -> Result<BundleRef, CoralError> {
        if !self.options.no_cache {
            let index = self.cache.load_bundles().map_err(artifact_err)?;
            if let Some(entry) = index.get(&result.hash) {
                info!(hash = %result.hash, uri = %entry.uri, "bundle index hit");
                return Ok(entry.to_ref(&result.hash));
            }
        }

        let bundle_ref = self
            .backend
            .artifacts()
            .put_bundle(&result.path, &result.hash)
            .await?;
        info!(hash = %bundle_ref.hash, uri = %bundle_ref.uri, "bundle uploaded");

        let mut index = self.cache.load_bundles().map_err(artifact_err)?;
        index.insert(
            result.hash.clone(),
            BundleEntry {
                uri: bundle_ref.uri.clone(),
            },
        );
        self.cache.save_bundles(&index).map_err(artifact_err)?;
        Ok(bundle_ref)
    }

    async fn image(&self, image: &ImageSpec) -> Result<ImageRef, CoralError> {
        let hash = plan_hash(image).map_err(builder_err)?;
        if let Some(cached) = self.images.lock().expect("session lock").get(&hash) {
            debug!(hash = %hash, "in-session image reuse");
            return Ok(cached.clone());
        }

        let sources = self.resolve_local_sources(image)?;
        let mut image_ref = self
            .backend
            .builder()
            .resolve_image(image, &sources.copy_roots)
            .await?;

        if let Some(templates) = self.backend.custom_templates() {
            let template_id = templates.ensure_custom_template(&image_ref).await?;
            image_ref
                .metadata
                .insert(METADATA_CUSTOM_TEMPLATE_ID.to_string(), template_id);
        }
        self.status(STATUS_IMAGE_READY);

        let mut index = self.cache.load_images().map_err(artifact_err)?;
        index.insert(hash.clone(), ImageEntry::from(&image_ref));
        self.cache.save_images(&index).map_err(artifact_err)?;

        self.images
            .lock()
            .expect("session lock")
            .insert(hash, image_ref.clone());
        Ok(image_ref)
    }
}

impl FunctionHandle {
    /// Submit this function through `session` and block for the decoded
    /// return value.
    ///
    /// # Errors
    ///
    /// See [`RunSession::remote`].
    pub async fn remote(
        &self,
        session: &RunSession,
        args: &[Value],
        kwargs: &BTreeMap<String, Value>,
    ) -> Result<Value, CoralError> {
        session.remote(&self.spec, args, kwargs).await
    }

    /// Submit this function through `session` without waiting.
    ///
    /// # Errors
    ///
    /// See [`RunSession::submit`].
    pub async fn spawn(
        &self,
        session: &RunSession,
        args: &[Value],
        kwargs: &BTreeMap<String, Value>,
    ) -> Result<RunHandle, CoralError> {
        session.submit(&self.spec, args, kwargs).await
    }
}

fn protocol_err(e: coral_protocol::ProtocolError) -> CoralError {
    CoralError::protocol(e.to_string()).with_source(e)
}

fn builder_err(e: coral_core::SpecError) -> CoralError {
    CoralError::builder(e.to_string()).with_source(e)
}

fn artifact_err(e: coral_cache::CacheError) -> CoralError {
    CoralError::artifact(e.to_string()).with_source(e)
}
