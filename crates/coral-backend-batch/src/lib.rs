// SPDX-License-Identifier: MIT OR Apache-2.0
//! coral-backend-batch
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! Driver for a cloud batch service: images come from a remote build
//! service plus registry, bundles and results live in an object store
//! with signed URLs, and each call runs as a single-task batch job whose
//! state is polled until terminal.
//!
//! Only the surface touching the core contract is implemented here; the
//! service API is reached through the thin clients in [`client`].

/// HTTP clients for the batch service and object store.
pub mod client;

use async_trait::async_trait;
use client::{BatchClient, StorageClient};
use coral_backend_core::poll::{Backoff, poll_until};
use coral_backend_core::{
    ArtifactStore, Backend, CleanupManager, Executor, ImageBuilder, LogStreamer, RunState,
    gpu::parse_gpu,
};
use coral_config::Profile;
use coral_core::{
    BundleRef, ImageRef, ImageSpec, ResourceSpec, RunHandle, RunResult, plan,
};
use coral_error::CoralError;
use coral_protocol::env::{ENV_BUNDLE_URI, ENV_CALLSPEC_B64, ENV_RESULT_URI};
use coral_protocol::{CallSpec, LABEL_RUN_ID};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// GPU type → accelerator name on the batch service.
pub const GPU_TYPE_MAP: &[(&str, &str)] = &[
    ("A100", "nvidia-tesla-a100"),
    ("T4", "nvidia-tesla-t4"),
    ("L4", "nvidia-l4"),
];

/// `TYPE:COUNT` → machine type on the batch service.
pub const GPU_MACHINE_MAP: &[(&str, &str)] = &[
    ("A100:1", "a2-highgpu-1g"),
    ("A100:2", "a2-highgpu-2g"),
    ("A100:4", "a2-highgpu-4g"),
    ("A100:8", "a2-highgpu-8g"),
    ("T4:1", "n1-standard-8"),
    ("L4:1", "g2-standard-8"),
];

/// Extra polling headroom past the call timeout before wait gives up.
const WAIT_GRACE: Duration = Duration::from_secs(300);

/// Resolved configuration for the batch backend.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Project the jobs are created under.
    pub project: String,
    /// Region jobs run in.
    pub region: String,
    /// Repository images are pushed to.
    pub artifact_repo: String,
    /// Object-store bucket for bundles, results, and build contexts.
    pub bucket: String,
    /// Base URL of the batch API.
    pub endpoint: String,
    /// Base URL of the object store.
    pub storage_endpoint: String,
    /// Registry prefix for image URIs.
    pub registry: String,
    /// Fixed machine type override.
    pub machine_type: Option<String>,
    /// Service account jobs run as; also the signing principal.
    pub service_account: Option<String>,
    /// Bearer token for API calls.
    pub api_token: Option<String>,
    /// Local path of the worker distribution staged into build contexts.
    pub worker_dist: Option<PathBuf>,
}

impl BatchConfig {
    /// Build the configuration from a resolved profile.
    ///
    /// # Errors
    ///
    /// Returns a config-kind [`CoralError`] listing every missing key.
    pub fn from_profile(profile: &Profile) -> Result<Self, CoralError> {
        let required = [
            "project",
            "region",
            "artifact_repo",
            "bucket",
            "endpoint",
            "storage_endpoint",
        ];
        let missing: Vec<&str> = required
            .iter()
            .filter(|key| profile.get_str(key).is_none())
            .copied()
            .collect();
        if !missing.is_empty() {
            return Err(CoralError::config(format!(
                "profile '{}' is missing batch keys: {}",
                profile.name,
                missing.join(", ")
            )));
        }
        let get = |key: &str| profile.get_str(key).unwrap_or_default().to_string();
        let project = get("project");
        let region = get("region");
        let artifact_repo = get("artifact_repo");
        let registry = profile
            .get_str("registry")
            .map(str::to_string)
            .unwrap_or_else(|| format!("{region}-docker.pkg/{project}/{artifact_repo}"));
        Ok(Self {
            project,
            region,
            artifact_repo,
            bucket: get("bucket"),
            endpoint: get("endpoint"),
            storage_endpoint: get("storage_endpoint"),
            registry,
            machine_type: profile.get_str("machine_type").map(str::to_string),
            service_account: profile.get_str("service_account").map(str::to_string),
            api_token: profile.get_str("api_token").map(str::to_string),
            worker_dist: profile.get_str("worker_dist").map(PathBuf::from),
        })
    }

    fn job_parent(&self) -> String {
        format!("projects/{}/locations/{}", self.project, self.region)
    }

    fn job_name(&self, job_id: &str) -> String {
        format!("{}/jobs/{job_id}", self.job_parent())
    }
}

/// Compose the ≤63-char job id for a call.
#[must_use]
pub fn job_id(run_id: &str, call_id: &str) -> String {
    let mut id = format!("coral-{run_id}-{call_id}");
    id.truncate(63);
    id
}

/// Map a reported job state onto the normalized [`RunState`].
#[must_use]
pub fn map_state(state: &str) -> RunState {
    match state {
        "SUCCEEDED" => RunState::Succeeded,
        "FAILED" => RunState::Failed,
        "STOPPED" | "CANCELLED" | "DELETION_IN_PROGRESS" => RunState::Stopped,
        "RUNNING" => RunState::Running,
        _ => RunState::Submitted,
    }
}

/// Pick the machine type for a resource demand.
///
/// An explicit override wins; otherwise the GPU demand is normalized to
/// `TYPE:COUNT` and looked up in [`GPU_MACHINE_MAP`].
///
/// # Errors
///
/// Propagates GPU parse failures.
pub fn select_machine_type(
    resources: &ResourceSpec,
    override_type: Option<&str>,
) -> Result<Option<String>, CoralError> {
    if let Some(machine) = override_type {
        return Ok(Some(machine.to_string()));
    }
    let Some(gpu) = &resources.gpu else {
        return Ok(None);
    };
    let (name, count) = parse_gpu(gpu)?;
    let key = format!("{name}:{count}");
    Ok(GPU_MACHINE_MAP
        .iter()
        .find(|(k, _)| *k == key)
        .map(|(_, machine)| (*machine).to_string()))
}

fn accelerator(resources: &ResourceSpec) -> Result<Option<Value>, CoralError> {
    let Some(gpu) = &resources.gpu else {
        return Ok(None);
    };
    let (name, count) = parse_gpu(gpu)?;
    let accel_type = GPU_TYPE_MAP
        .iter()
        .find(|(k, _)| *k == name)
        .map_or(name.as_str(), |(_, v)| *v);
    Ok(Some(json!({ "type": accel_type, "count": count })))
}

/// Render the job creation payload for one call.
///
/// # Errors
///
/// Propagates GPU parse and memory parse failures.
pub fn job_payload(
    config: &BatchConfig,
    image: &ImageRef,
    env: &BTreeMap<String, String>,
    resources: &ResourceSpec,
    labels: &BTreeMap<String, String>,
) -> Result<Value, CoralError> {
    let memory_mib = resources
        .memory_mib()
        .map_err(|e| CoralError::executor(e.to_string()).with_source(e))?;
    let machine_type = select_machine_type(resources, config.machine_type.as_deref())?;
    let accelerator = accelerator(resources)?;

    let mut allocation = serde_json::Map::new();
    if let Some(machine) = machine_type {
        allocation.insert("machine_type".to_string(), json!(machine));
    }
    if let Some(accel) = accelerator {
        allocation.insert("accelerators".to_string(), json!([accel]));
    }
    if let Some(account) = &config.service_account {
        allocation.insert("service_account".to_string(), json!(account));
    }

    Ok(json!({
        "task_groups": [{
            "task_count": 1,
            "task_spec": {
                "container": { "image_uri": image.uri },
                "compute": {
                    "cpu_milli": u64::from(resources.cpu) * 1000,
                    "memory_mib": memory_mib,
                },
                "environment": env,
                "max_retry_count": resources.retries,
                "max_run_duration_seconds": resources.timeout_seconds,
            },
        }],
        "allocation": Value::Object(allocation),
        "labels": labels,
        "logs_policy": "CLOUD_LOGGING",
    }))
}

// ---------------------------------------------------------------------------
// Artifact store
// ---------------------------------------------------------------------------

/// Object-store artifact backend with optional signed URLs.
pub struct BatchArtifacts {
    storage: StorageClient,
    bucket: String,
    signer: Option<String>,
}

impl BatchArtifacts {
    fn bundle_uri(&self, hash: &str) -> String {
        self.storage
            .object_uri(&self.bucket, &format!("coral/bundles/{hash}.tar.gz"))
    }
}

#[async_trait]
impl ArtifactStore for BatchArtifacts {
    async fn put_bundle(
        &self,
        path: &std::path::Path,
        hash: &str,
    ) -> coral_backend_core::Result<BundleRef> {
        let uri = self.bundle_uri(hash);
        if self.storage.exists(&uri).await? {
            debug!(uri, "bundle already stored");
        } else {
            let payload = tokio::fs::read(path).await.map_err(|e| {
                CoralError::artifact("could not read bundle archive").with_source(e)
            })?;
            self.storage.put(&uri, payload).await?;
        }
        Ok(BundleRef {
            uri,
            hash: hash.to_string(),
        })
    }

    async fn get_result(&self, result_ref: &str) -> coral_backend_core::Result<Vec<u8>> {
        self.storage.get(result_ref).await
    }

    fn result_uri(&self, call_id: &str) -> String {
        self.storage
            .object_uri(&self.bucket, &format!("coral/results/{call_id}.bin"))
    }

    async fn signed_url(
        &self,
        uri: &str,
        ttl: Duration,
        method: &str,
    ) -> coral_backend_core::Result<Option<String>> {
        if self.signer.is_none() {
            return Ok(None);
        }
        self.storage.sign(uri, ttl, method).await.map(Some)
    }
}

// ---------------------------------------------------------------------------
// Image builder
// ---------------------------------------------------------------------------

/// Builder that keys images by plan hash against the remote registry and
/// falls back to a remote build when missing.
pub struct BatchBuilder {
    client: BatchClient,
    storage: StorageClient,
    config: BatchConfig,
}

impl BatchBuilder {
    fn image_uri(&self, hash: &str) -> String {
        format!("{}/coral:{hash}", self.config.registry)
    }

    async fn existing_digest(&self, hash: &str) -> Option<String> {
        self.client
            .get_image_digest(&self.config.job_parent(), &format!("coral:{hash}"))
            .await
            .ok()
            .flatten()
    }

    fn stage_context(
        &self,
        spec: &ImageSpec,
        copy_sources: &[PathBuf],
    ) -> Result<Vec<u8>, CoralError> {
        let staging = tempfile::tempdir()
            .map_err(|e| CoralError::builder("could not stage build context").with_source(e))?;
        let root = staging.path();

        if let Some(worker_dist) = &self.config.worker_dist {
            copy_tree(worker_dist, &root.join("runtime"))?;
        }
        let copy_root = root.join("copy_src");
        for source in copy_sources {
            let name = source
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "src".to_string());
            copy_tree(source, &copy_root.join(name))?;
        }
        std::fs::write(
            root.join("Containerfile"),
            render_containerfile(spec, !copy_sources.is_empty()),
        )
        .map_err(|e| CoralError::builder("could not write Containerfile").with_source(e))?;

        archive_dir(root)
    }
}

#[async_trait]
impl ImageBuilder for BatchBuilder {
    async fn resolve_image(
        &self,
        spec: &ImageSpec,
        copy_sources: &[PathBuf],
    ) -> coral_backend_core::Result<ImageRef> {
        let hash = plan::plan_hash(spec)
            .map_err(|e| CoralError::builder("plan hash failed").with_source(e))?;
        let uri = self.image_uri(&hash);

        if let Some(digest) = self.existing_digest(&hash).await {
            info!(uri, "image already in registry");
            let mut metadata = BTreeMap::new();
            metadata.insert("hash".to_string(), hash);
            return Ok(ImageRef {
                uri,
                digest,
                metadata,
            });
        }

        let context = self.stage_context(spec, copy_sources)?;
        let context_uri = self
            .storage
            .object_uri(&self.config.bucket, &format!("coral/builds/{hash}.tar.gz"));
        self.storage.put(&context_uri, context).await?;

        info!(uri, "building image");
        let build = self
            .client
            .create_job(
                &self.config.job_parent(),
                &format!("build-{}", &hash[..12]),
                &json!({
                    "build": { "context_uri": context_uri, "image_uri": uri },
                }),
            )
            .await
            .map_err(|e| CoralError::builder("image build submit failed").with_source(e))?;
        let digest = build["digest"].as_str().unwrap_or_default().to_string();

        let mut metadata = BTreeMap::new();
        metadata.insert("hash".to_string(), hash);
        Ok(ImageRef {
            uri,
            digest,
            metadata,
        })
    }
}

/// Render the container build file for an image plan.
#[must_use]
pub fn render_containerfile(spec: &ImageSpec, has_copy: bool) -> String {
    let mut lines = vec![format!("FROM {}", spec.base_image)];
    for (key, value) in &spec.env {
        lines.push(format!("ENV {key}={value}"));
    }
    lines.push(format!("WORKDIR {}", spec.workdir));
    lines.push("COPY runtime/ /opt/coral/runtime/".to_string());
    if !spec.system_packages.is_empty() {
        lines.push(format!(
            "RUN apt-get update && apt-get install -y {} && rm -rf /var/lib/apt/lists/*",
            spec.system_packages.join(" ")
        ));
    }
    if !spec.runtime_packages.is_empty() {
        lines.push(format!(
            "RUN python -m pip install --no-cache-dir {}",
            spec.runtime_packages.join(" ")
        ));
    }
    if has_copy {
        lines.push("COPY copy_src/ /opt/coral/src/".to_string());
    }
    lines.push("ENTRYPOINT [\"/opt/coral/runtime/coral-worker\"]".to_string());
    lines.join("\n") + "\n"
}

fn copy_tree(source: &std::path::Path, dest: &std::path::Path) -> Result<(), CoralError> {
    let io_err =
        |e: std::io::Error| CoralError::builder("could not stage build context").with_source(e);
    if source.is_file() {
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        std::fs::copy(source, dest).map_err(io_err)?;
        return Ok(());
    }
    for entry in walk(source).map_err(io_err)? {
        let rel = entry.strip_prefix(source).unwrap_or(&entry);
        let target = dest.join(rel);
        if entry.is_dir() {
            std::fs::create_dir_all(&target).map_err(io_err)?;
        } else {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent).map_err(io_err)?;
            }
            std::fs::copy(&entry, &target).map_err(io_err)?;
        }
    }
    Ok(())
}

fn walk(root: &std::path::Path) -> std::io::Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            paths.push(path.clone());
            if path.is_dir() {
                stack.push(path);
            }
        }
    }
    Ok(paths)
}

fn archive_dir(root: &std::path::Path) -> Result<Vec<u8>, CoralError> {
    let buffer = Vec::new();
    let encoder = flate2::write::GzEncoder::new(buffer, flate2::Compression::default());
    let mut tar = tar::Builder::new(encoder);
    tar.append_dir_all("", root)
        .map_err(|e| CoralError::builder("could not archive build context").with_source(e))?;
    let encoder = tar
        .into_inner()
        .map_err(|e| CoralError::builder("could not archive build context").with_source(e))?;
    encoder
        .finish()
        .map_err(|e| CoralError::builder("could not archive build context").with_source(e))
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

/// Executor submitting one single-task job per call.
pub struct BatchExecutor {
    client: BatchClient,
    config: BatchConfig,
    artifacts: Arc<dyn ArtifactStore>,
    timeouts: Mutex<BTreeMap<String, u64>>,
}

#[async_trait]
impl Executor for BatchExecutor {
    async fn submit(
        &self,
        call: &CallSpec,
        image: &ImageRef,
        bundle: &BundleRef,
        resources: &ResourceSpec,
        env: &BTreeMap<String, String>,
        labels: &BTreeMap<String, String>,
    ) -> coral_backend_core::Result<RunHandle> {
        let mut env = env.clone();
        env.insert(
            ENV_CALLSPEC_B64.to_string(),
            call.to_b64()
                .map_err(|e| CoralError::executor("encode callspec").with_source(e))?,
        );
        env.insert(ENV_BUNDLE_URI.to_string(), bundle.uri.clone());
        env.insert(ENV_RESULT_URI.to_string(), call.result_ref.clone());

        let payload = job_payload(&self.config, image, &env, resources, labels)?;
        let run_id = labels.get(LABEL_RUN_ID).cloned().unwrap_or_default();
        let id = job_id(&run_id, &call.call_id);
        self.client
            .create_job(&self.config.job_parent(), &id, &payload)
            .await?;

        self.timeouts
            .lock()
            .expect("executor lock")
            .insert(call.call_id.clone(), resources.timeout_seconds);

        Ok(RunHandle {
            run_id,
            call_id: call.call_id.clone(),
            provider_ref: id,
        })
    }

    async fn wait(&self, handle: &RunHandle) -> coral_backend_core::Result<RunResult> {
        let timeout = self
            .timeouts
            .lock()
            .expect("executor lock")
            .get(&handle.call_id)
            .copied()
            .unwrap_or(3600);
        let name = self.config.job_name(&handle.provider_ref);

        let state = poll_until(
            "batch job terminal state",
            Duration::from_secs(timeout) + WAIT_GRACE,
            Backoff::new(Duration::from_secs(5), Duration::from_secs(30)),
            || {
                let client = self.client.clone();
                let name = name.clone();
                async move {
                    let job = client.get_job(&name).await?;
                    let state = map_state(job["status"]["state"].as_str().unwrap_or(""));
                    Ok(state.is_terminal().then_some(state))
                }
            },
        )
        .await?;

        let output = self
            .artifacts
            .get_result(&self.artifacts.result_uri(&handle.call_id))
            .await
            .unwrap_or_else(|e| {
                warn!(call_id = %handle.call_id, error = %e, "result fetch failed");
                format!("result unavailable: {e}").into_bytes()
            });

        Ok(RunResult {
            call_id: handle.call_id.clone(),
            success: state.is_success(),
            output,
        })
    }

    async fn cancel(&self, handle: &RunHandle) -> coral_backend_core::Result<()> {
        self.client
            .delete_job(&self.config.job_name(&handle.provider_ref))
            .await
    }
}

// ---------------------------------------------------------------------------
// Log streamer and cleanup
// ---------------------------------------------------------------------------

/// Log streamer cursoring over entries labeled with the run id.
pub struct BatchLogStreamer {
    client: BatchClient,
    project: String,
}

#[async_trait]
impl LogStreamer for BatchLogStreamer {
    async fn stream(
        &self,
        handle: &RunHandle,
    ) -> coral_backend_core::Result<mpsc::Receiver<String>> {
        let (tx, rx) = mpsc::channel(64);
        let client = self.client.clone();
        let project = self.project.clone();
        let run_id = handle.run_id.clone();
        tokio::spawn(async move {
            let mut cursor = 0usize;
            loop {
                match client
                    .list_log_entries(&project, (LABEL_RUN_ID, &run_id), cursor)
                    .await
                {
                    Ok(entries) => {
                        cursor += entries.len();
                        for line in entries {
                            if tx.send(line).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        debug!(error = %e, "log poll failed");
                    }
                }
                if tx.is_closed() {
                    return;
                }
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        });
        Ok(rx)
    }
}

/// Deletes the job unless the run is detached.
pub struct BatchCleanup {
    client: BatchClient,
    config: BatchConfig,
}

#[async_trait]
impl CleanupManager for BatchCleanup {
    async fn cleanup(
        &self,
        handle: &RunHandle,
        detached: bool,
    ) -> coral_backend_core::Result<()> {
        if detached {
            return Ok(());
        }
        self.client
            .delete_job(&self.config.job_name(&handle.provider_ref))
            .await
    }
}

// ---------------------------------------------------------------------------
// Backend assembly
// ---------------------------------------------------------------------------

/// The assembled batch backend.
pub struct BatchBackend {
    config: BatchConfig,
    builder: Arc<BatchBuilder>,
    artifacts: Arc<BatchArtifacts>,
    executor: Arc<BatchExecutor>,
    log_streamer: Arc<BatchLogStreamer>,
    cleanup: Arc<BatchCleanup>,
}

impl BatchBackend {
    /// Assemble the backend from a resolved profile.
    ///
    /// # Errors
    ///
    /// Propagates configuration errors.
    pub fn from_profile(profile: &Profile) -> Result<Self, CoralError> {
        Ok(Self::new(BatchConfig::from_profile(profile)?))
    }

    /// Assemble the backend from explicit configuration.
    #[must_use]
    pub fn new(config: BatchConfig) -> Self {
        let client = BatchClient::new(&config.endpoint, config.api_token.clone());
        let storage = StorageClient::new(&config.storage_endpoint, config.api_token.clone());
        let artifacts = Arc::new(BatchArtifacts {
            storage: storage.clone(),
            bucket: config.bucket.clone(),
            signer: config.service_account.clone(),
        });
        Self {
            builder: Arc::new(BatchBuilder {
                client: client.clone(),
                storage,
                config: config.clone(),
            }),
            executor: Arc::new(BatchExecutor {
                client: client.clone(),
                config: config.clone(),
                artifacts: artifacts.clone() as Arc<dyn ArtifactStore>,
                timeouts: Mutex::new(BTreeMap::new()),
            }),
            log_streamer: Arc::new(BatchLogStreamer {
                client: client.clone(),
                project: config.project.clone(),
            }),
            cleanup: Arc::new(BatchCleanup {
                client,
                config: config.clone(),
            }),
            artifacts,
            config,
        }
    }

    /// The backend's resolved configuration.
    #[must_use]
    pub fn config(&self) -> &BatchConfig {
        &self.config
    }
}

impl Backend for BatchBackend {
    fn name(&self) -> &str {
        "batch"
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
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BatchConfig {
        BatchConfig {
            project: "proj".into(),
            region: "us-central1".into(),
            artifact_repo: "coral".into(),
            bucket: "artifacts".into(),
            endpoint: "http://batch.local/v1".into(),
            storage_endpoint: "http://storage.local".into(),
            registry: "registry/proj/coral".into(),
            machine_type: None,
            service_account: None,
            api_token: None,
            worker_dist: None,
        }
    }

    fn resources(gpu: Option<&str>) -> ResourceSpec {
        ResourceSpec {
            gpu: gpu.map(str::to_string),
            ..ResourceSpec::default()
        }
    }

    #[test]
    fn job_ids_are_bounded() {
        let id = job_id(&"r".repeat(40), &"c".repeat(40));
        assert!(id.len() <= 63);
        assert!(id.starts_with("coral-"));
    }

    #[test]
    fn state_mapping_is_normalized() {
        assert_eq!(map_state("SUCCEEDED"), RunState::Succeeded);
        assert_eq!(map_state("FAILED"), RunState::Failed);
        assert_eq!(map_state("STOPPED"), RunState::Stopped);
        assert_eq!(map_state("RUNNING"), RunState::Running);
        assert_eq!(map_state("QUEUED"), RunState::Submitted);
        assert_eq!(map_state(""), RunState::Submitted);
    }

    #[test]
    fn machine_type_resolution() {
        assert_eq!(
            select_machine_type(&resources(Some("A100:2")), None).unwrap(),
            Some("a2-highgpu-2g".to_string())
        );
        // Bare type normalizes to count 1.
        assert_eq!(
            select_machine_type(&resources(Some("T4")), None).unwrap(),
            Some("n1-standard-8".to_string())
        );
        assert_eq!(
            select_machine_type(&resources(None), Some("e2-standard-4")).unwrap(),
            Some("e2-standard-4".to_string())
        );
        assert_eq!(select_machine_type(&resources(None), None).unwrap(), None);
        assert!(select_machine_type(&resources(Some("A100:x")), None).is_err());
    }

    #[test]
    fn payload_carries_resources_and_env() {
        let mut env = BTreeMap::new();
        env.insert("CALLSPEC_B64".to_string(), "abc".to_string());
        let mut labels = BTreeMap::new();
        labels.insert("run_id".to_string(), "r1".to_string());

        let image = ImageRef {
            uri: "registry/coral:h".into(),
            digest: "sha256:d".into(),
            metadata: BTreeMap::new(),
        };
        let resources = ResourceSpec {
            cpu: 2,
            memory: "4Gi".into(),
            gpu: Some("A100:1".into()),
            timeout_seconds: 120,
            retries: 3,
        };
        let payload = job_payload(&config(), &image, &env, &resources, &labels).unwrap();

        let task = &payload["task_groups"][0];
        assert_eq!(task["task_count"], 1);
        assert_eq!(task["task_spec"]["compute"]["cpu_milli"], 2000);
        assert_eq!(task["task_spec"]["compute"]["memory_mib"], 4096);
        assert_eq!(task["task_spec"]["max_retry_count"], 3);
        assert_eq!(task["task_spec"]["max_run_duration_seconds"], 120);
        assert_eq!(task["task_spec"]["environment"]["CALLSPEC_B64"], "abc");
        assert_eq!(payload["allocation"]["machine_type"], "a2-highgpu-1g");
        assert_eq!(
            payload["allocation"]["accelerators"][0]["type"],
            "nvidia-tesla-a100"
        );
        assert_eq!(payload["labels"]["run_id"], "r1");
    }

    #[test]
    fn containerfile_renders_plan_in_order() {
        let spec = ImageSpec::new("python:3.11-slim")
            .system_packages(["git"])
            .runtime_packages(["numpy"])
            .env("MODE", "fast")
            .workdir("/srv");
        let rendered = render_containerfile(&spec, true);
        let from = rendered.find("FROM python:3.11-slim").unwrap();
        let apt = rendered.find("apt-get install -y git").unwrap();
        let pip = rendered.find("pip install --no-cache-dir numpy").unwrap();
        let copy = rendered.find("COPY copy_src/").unwrap();
        assert!(from < apt && apt < pip && pip < copy);
        assert!(rendered.contains("ENV MODE=fast"));
        assert!(rendered.ends_with("ENTRYPOINT [\"/opt/coral/runtime/coral-worker\"]\n"));
    }

    #[test]
    fn profile_parsing_reports_all_missing_keys() {
        let profile = Profile {
            name: "default".into(),
            provider: "batch".into(),
            data: toml::Table::new(),
        };
        let err = BatchConfig::from_profile(&profile).unwrap_err();
        assert_eq!(err.kind(), coral_error::ErrorKind::Config);
        for key in ["project", "region", "artifact_repo", "bucket"] {
            assert!(err.message.contains(key), "{}", err.message);
        }
    }
}
