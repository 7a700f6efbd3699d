// SPDX-License-Identifier: MIT OR Apache-2.0
//! coral-worker
#![warn(missing_docs)]
//!
//! The in-container bootstrap. Given the environment contract of protocol
//! v1, a worker materializes the bundle, applies runtime setup when the
//! image was not pre-built, invokes the registered target, and delivers
//! the result: to the result URI, to stdout between markers, or both.
//!
//! Embedding binaries build a [`Worker`], register their callables, and
//! hand control over:
//!
//! ```no_run
//! # use coral_worker::Worker;
//! # use serde_json::json;
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() {
//!     let worker = Worker::new().register("tasks", "process", |args, _kwargs| {
//!         Ok(json!({ "echo": args }))
//!     });
//!     std::process::exit(worker.run_from_os_env().await);
//! }
//! ```

/// Bundle materialization.
pub mod fetch;
/// Result payload transport.
pub mod io;
/// Function registry and target keys.
pub mod registry;
/// Runtime-setup application.
pub mod setup;

pub use registry::{Args, FunctionRegistry, Handler, Kwargs};

use coral_protocol::env::{
    DEFAULT_BUNDLE_DEST, ENV_BUNDLE_URI, ENV_CALLSPEC_B64, ENV_RESULT_STDOUT,
    ENV_RESULT_URI, ENV_RUNTIME_SETUP_B64, ENV_VERBOSE, inline_bundle,
};
use coral_protocol::setup::RuntimeSetup;
use coral_protocol::{CallSpec, decode_args, decode_kwargs, marker_line};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{debug, error, info};

/// Exit code for a successful call.
pub const EXIT_SUCCESS: i32 = 0;
/// Exit code when the user callable raised.
pub const EXIT_CALL_FAILED: i32 = 1;
/// Exit code for worker-internal errors (protocol, setup, transport).
pub const EXIT_WORKER_ERROR: i32 = 2;

/// Errors internal to the worker (everything that is not the call itself
/// failing).
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// The environment or envelope violated the protocol contract.
    #[error(transparent)]
    Protocol(#[from] coral_protocol::ProtocolError),

    /// Filesystem access failed.
    #[error("I/O failure on {path}: {source}")]
    Io {
        /// Path involved in the failure.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// A bundle download or result upload failed.
    #[error("transport failure: {0}")]
    Transport(#[from] reqwest::Error),

    /// A package installer was missing or exited non-zero.
    #[error("installer {program} failed: {detail}")]
    Installer {
        /// Installer program name.
        program: String,
        /// Failure detail.
        detail: String,
    },
}

/// What one worker run produced.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// Process exit code per the protocol: 0, 1, or 2.
    pub exit_code: i32,
    /// Whether the call itself succeeded.
    pub success: bool,
    /// Serialized return value, traceback text, or internal-error text.
    pub payload: Vec<u8>,
    /// The stdout marker line, present iff `RESULT_STDOUT=1`.
    pub marker: Option<String>,
}

/// The worker bootstrap: registry plus run policy.
#[derive(Debug, Clone)]
pub struct Worker {
    registry: FunctionRegistry,
    bundle_dest: PathBuf,
    sandboxed: bool,
}

impl Default for Worker {
    fn default() -> Self {
        Self::new()
    }
}

impl Worker {
    /// A worker with the default bundle destination.
    #[must_use]
    pub fn new() -> Self {
        Self {
            registry: FunctionRegistry::new(),
            bundle_dest: PathBuf::from(DEFAULT_BUNDLE_DEST),
            sandboxed: false,
        }
    }

    /// A worker that records runtime setup without mutating process state
    /// (no env exports, no chdir, no installs). Used by in-process
    /// executors and tests.
    #[must_use]
    pub fn sandboxed() -> Self {
        Self {
            sandboxed: true,
            ..Self::new()
        }
    }

    /// Register a callable under `module`/`qualname`.
    #[must_use]
    pub fn register<F>(mut self, module: &str, qualname: &str, handler: F) -> Self
    where
        F: Fn(Args, Kwargs) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.registry.register(module, qualname, handler);
        self
    }

    /// Override where the bundle is materialized.
    #[must_use]
    pub fn bundle_dest(mut self, dest: impl Into<PathBuf>) -> Self {
        self.bundle_dest = dest.into();
        self
    }

    /// Shared registry access (for embedding binaries that introspect).
    #[must_use]
    pub fn registry(&self) -> &FunctionRegistry {
        &self.registry
    }

    /// Run against the real process environment, print the marker line if
    /// one is due, and return the exit code.
    pub async fn run_from_os_env(&self) -> i32 {
        let env: BTreeMap<String, String> = std::env::vars().collect();
        init_tracing(env.get(ENV_VERBOSE).is_some_and(|v| v == "1"));
        let outcome = self.execute(&env).await;
        if let Some(marker) = &outcome.marker {
            println!("{marker}");
        }
        outcome.exit_code
    }

    /// Run one call against an explicit environment map.
    ///
    /// Never panics and never exits; all failure modes fold into the
    /// returned [`RunOutcome`].
    pub async fn execute(&self, env: &BTreeMap<String, String>) -> RunOutcome {
        let stdout_result = env.get(ENV_RESULT_STDOUT).is_some_and(|v| v == "1");
        match self.try_execute(env).await {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(error = %err, "worker-internal failure");
                let payload = err.to_string().into_bytes();
                RunOutcome {
                    exit_code: EXIT_WORKER_ERROR,
                    success: false,
                    marker: stdout_result.then(|| marker_line(false, &payload)),
                    payload,
                }
            }
        }
    }

    async fn try_execute(
        &self,
        env: &BTreeMap<String, String>,
    ) -> Result<RunOutcome, WorkerError> {
        let lookup = |key: &str| env.get(key).cloned();

        if let Some(setup_b64) = env.get(ENV_RUNTIME_SETUP_B64) {
            let runtime_setup = RuntimeSetup::from_b64(setup_b64)?;
            if self.sandboxed {
                debug!("sandboxed run, runtime setup decoded but not applied");
            } else {
                setup::apply_runtime_setup(&runtime_setup).await?;
            }
        }

        self.materialize_bundle(env, &lookup).await?;

        let callspec_b64 = env.get(ENV_CALLSPEC_B64).ok_or_else(|| {
            coral_protocol::ProtocolError::MissingEnv {
                name: ENV_CALLSPEC_B64.to_string(),
            }
        })?;
        let call = CallSpec::from_b64(callspec_b64)?;
        info!(call_id = %call.call_id, module = %call.module, qualname = %call.qualname, "invoking target");

        let args = decode_args(&call.serialization, &call.args_b64)?;
        let kwargs = decode_kwargs(&call.serialization, &call.kwargs_b64)?;

        let (success, payload) = self.invoke(&call, args, kwargs);

        let result_uri = env
            .get(ENV_RESULT_URI)
            .map(String::as_str)
            .filter(|uri| !uri.is_empty())
            .or_else(|| Some(call.result_ref.as_str()).filter(|uri| !uri.is_empty()));
        if let Some(uri) = result_uri {
            io::write_uri(uri, &payload).await?;
        }

        let stdout_result = env.get(ENV_RESULT_STDOUT).is_some_and(|v| v == "1");
        Ok(RunOutcome {
            exit_code: if success { EXIT_SUCCESS } else { EXIT_CALL_FAILED },
            success,
            marker: stdout_result.then(|| marker_line(success, &payload)),
            payload,
        })
    }

    async fn materialize_bundle<F>(
        &self,
        env: &BTreeMap<String, String>,
        lookup: &F,
    ) -> Result<(), WorkerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(payload) = inline_bundle(lookup)? {
            return fetch::unpack_bundle(&payload, &self.bundle_dest);
        }
        if let Some(uri) = env.get(ENV_BUNDLE_URI) {
            let payload = fetch::read_uri(uri).await?;
            return fetch::unpack_bundle(&payload, &self.bundle_dest);
        }
        debug!("no bundle shipped; relying on image contents");
        Ok(())
    }

    fn invoke(&self, call: &CallSpec, args: Args, kwargs: Kwargs) -> (bool, Vec<u8>) {
        let Some(handler) = self.registry.get(&call.module, &call.qualname) else {
            let text = format!(
                "target not registered: {}::{} (known: {})",
                call.module,
                call.qualname,
                self.registry.targets().join(", ")
            );
            return (false, text.into_bytes());
        };

        let invocation = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            handler(args, kwargs)
        }));
        match invocation {
            Ok(Ok(value)) => {
                let payload =
                    serde_json::to_vec(&value).unwrap_or_else(|e| e.to_string().into_bytes());
                (true, payload)
            }
            Ok(Err(traceback)) => (false, traceback.into_bytes()),
            Err(panic) => {
                let text = panic
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "call panicked".to_string());
                (false, format!("call panicked: {text}").into_bytes())
            }
        }
    }
}

/// Install a `tracing` subscriber for a worker process.
///
/// `VERBOSE=1` lowers the default level to `debug`; `RUST_LOG` still wins.
pub fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
