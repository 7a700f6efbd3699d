// SPDX-License-Identifier: MIT OR Apache-2.0
//! Apps: named containers of function registrations and local entrypoints.
//!
//! An app owns an exclusive "current session" slot. A [`RunSession`]
//! acquires it for its whole scope and releases it on every exit path;
//! sessions never nest on the same app.
//!
//! [`RunSession`]: crate::RunSession

use coral_core::{AppSpec, FunctionSpec, ImageSpec};
use coral_error::CoralError;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// A callable runnable on the local machine, registered by name.
pub type LocalEntrypoint = Arc<dyn Fn() -> Result<(), CoralError> + Send + Sync>;

struct AppInner {
    spec: Mutex<AppSpec>,
    functions: Mutex<BTreeMap<String, FunctionSpec>>,
    entrypoints: Mutex<BTreeMap<String, LocalEntrypoint>>,
    active_session: Mutex<Option<String>>,
}

/// A named application: default image, function registrations, local
/// entrypoints. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct App {
    inner: Arc<AppInner>,
}

impl std::fmt::Debug for App {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("App")
            .field("name", &self.name())
            .field("functions", &self.function_names())
            .finish()
    }
}

impl App {
    /// Create an app with the default image and `include_source = true`.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_spec(AppSpec {
            name: name.into(),
            image: ImageSpec::new("python:3.11-slim"),
            include_source: true,
        })
    }

    /// Create an app from an explicit spec.
    #[must_use]
    pub fn with_spec(spec: AppSpec) -> Self {
        Self {
            inner: Arc::new(AppInner {
                spec: Mutex::new(spec),
                functions: Mutex::new(BTreeMap::new()),
                entrypoints: Mutex::new(BTreeMap::new()),
                active_session: Mutex::new(None),
            }),
        }
    }

    /// Replace the app's default image.
    #[must_use]
    pub fn image(self, image: ImageSpec) -> Self {
        self.inner.spec.lock().expect("app lock").image = image;
        self
    }

    /// Disable automatic bundling of function source parents.
    #[must_use]
    pub fn without_source(self) -> Self {
        self.inner.spec.lock().expect("app lock").include_source = false;
        self
    }

    /// App name.
    #[must_use]
    pub fn name(&self) -> String {
        self.inner.spec.lock().expect("app lock").name.clone()
    }

    /// The app's default image spec.
    #[must_use]
    pub fn image_spec(&self) -> ImageSpec {
        self.inner.spec.lock().expect("app lock").image.clone()
    }

    /// Whether function source parents join the bundle.
    #[must_use]
    pub fn include_source(&self) -> bool {
        self.inner.spec.lock().expect("app lock").include_source
    }

    /// Register a function. Duplicate names replace the old registration.
    pub fn register_function(&self, spec: FunctionSpec) -> FunctionHandle {
        let name = spec.name.clone();
        self.inner
            .functions
            .lock()
            .expect("app lock")
            .insert(name.clone(), spec.clone());
        FunctionHandle {
            name,
            spec,
            app: self.clone(),
        }
    }

    /// Register a local entrypoint. Duplicate names replace.
    pub fn register_entrypoint<F>(&self, name: impl Into<String>, f: F)
    where
        F: Fn() -> Result<(), CoralError> + Send + Sync + 'static,
    {
        self.inner
            .entrypoints
            .lock()
            .expect("app lock")
            .insert(name.into(), Arc::new(f));
    }

    /// Look up a registered function by name.
    ///
    /// # Errors
    ///
    /// Returns a config-kind [`CoralError`] naming the function and app.
    pub fn get_function(&self, name: &str) -> Result<FunctionHandle, CoralError> {
        let spec = self
            .inner
            .functions
            .lock()
            .expect("app lock")
            .get(name)
            .cloned()
            .ok_or_else(|| {
                CoralError::config(format!(
                    "function '{name}' not found in app '{}'",
                    self.name()
                ))
            })?;
        Ok(FunctionHandle {
            name: name.to_string(),
            spec,
            app: self.clone(),
        })
    }

    /// Look up a registered local entrypoint by name.
    ///
    /// # Errors
    ///
    /// Returns a config-kind [`CoralError`] naming the entrypoint and app.
    pub fn get_entrypoint(&self, name: &str) -> Result<LocalEntrypoint, CoralError> {
        self.inner
            .entrypoints
            .lock()
            .expect("app lock")
            .get(name)
            .cloned()
            .ok_or_else(|| {
                CoralError::config(format!(
                    "entrypoint '{name}' not found in app '{}'",
                    self.name()
                ))
            })
    }

    /// Names of all registered functions, sorted.
    #[must_use]
    pub fn function_names(&self) -> Vec<String> {
        self.inner
            .functions
            .lock()
            .expect("app lock")
            .keys()
            .cloned()
            .collect()
    }

    /// All registered function specs.
    #[must_use]
    pub fn function_specs(&self) -> Vec<FunctionSpec> {
        self.inner
            .functions
            .lock()
            .expect("app lock")
            .values()
            .cloned()
            .collect()
    }

    /// The run id of the active session, if one is open.
    #[must_use]
    pub fn current_session(&self) -> Option<String> {
        self.inner.active_session.lock().expect("app lock").clone()
    }

    pub(crate) fn acquire_session(&self, run_id: &str) -> Result<(), CoralError> {
        let mut slot = self.inner.active_session.lock().expect("app lock");
        if let Some(active) = slot.as_deref() {
            return Err(CoralError::config(format!(
                "app '{}' already has an active session ({active}); sessions do not nest",
                self.name()
            )));
        }
        *slot = Some(run_id.to_string());
        Ok(())
    }

    pub(crate) fn release_session(&self, run_id: &str) {
        let mut slot = self.inner.active_session.lock().expect("app lock");
        if slot.as_deref() == Some(run_id) {
            *slot = None;
        }
    }
}

/// Handle to one registered function on an app.
#[derive(Clone)]
pub struct FunctionHandle {
    /// Name the function was registered under.
    pub name: String,
    /// The immutable registration.
    pub spec: FunctionSpec,
    /// The owning app.
    pub app: App,
}

impl std::fmt::Debug for FunctionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionHandle")
            .field("name", &self.name)
            .field("module", &self.spec.module)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn function(name: &str) -> FunctionSpec {
        FunctionSpec::new(name, "tasks", name)
    }

    #[test]
    fn duplicate_registration_replaces() {
        let app = App::new("demo");
        app.register_function(function("f").source_file("/a.py"));
        app.register_function(function("f").source_file("/b.py"));
        assert_eq!(app.function_names(), vec!["f".to_string()]);
        assert_eq!(app.get_function("f").unwrap().spec.source_file, "/b.py");
    }

    #[test]
    fn unknown_function_names_app_and_function() {
        let app = App::new("demo");
        let err = app.get_function("ghost").unwrap_err();
        assert!(err.message.contains("'ghost'"));
        assert!(err.message.contains("'demo'"));
    }

    #[test]
    fn session_slot_is_exclusive() {
        let app = App::new("demo");
        app.acquire_session("run-1").unwrap();
        assert_eq!(app.current_session().as_deref(), Some("run-1"));

        let err = app.acquire_session("run-2").unwrap_err();
        assert!(err.message.contains("do not nest"));

        app.release_session("run-1");
        assert!(app.current_session().is_none());
        app.acquire_session("run-2").unwrap();
    }

    #[test]
    fn release_ignores_foreign_run_ids() {
        let app = App::new("demo");
        app.acquire_session("run-1").unwrap();
        app.release_session("other");
        assert_eq!(app.current_session().as_deref(), Some("run-1"));
    }

    #[test]
    fn entrypoints_are_callable() {
        let app = App::new("demo");
        app.register_entrypoint("main", || Ok(()));
        let entry = app.get_entrypoint("main").unwrap();
        assert!(entry().is_ok());
        assert!(app.get_entrypoint("missing").is_err());
    }
}
