// SPDX-License-Identifier: MIT OR Apache-2.0
//! Named backend lookup.

use crate::Backend;
use coral_error::CoralError;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Registry mapping backend names to instances.
#[derive(Default, Clone)]
pub struct BackendRegistry {
    backends: BTreeMap<String, Arc<dyn Backend>>,
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("names", &self.names())
            .finish()
    }
}

impl BackendRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a backend under its own name. Re-registration replaces.
    pub fn register(&mut self, backend: Arc<dyn Backend>) {
        self.backends.insert(backend.name().to_string(), backend);
    }

    /// Look up a backend by name.
    ///
    /// # Errors
    ///
    /// Returns a config-kind [`CoralError`] naming the unknown backend.
    pub fn get(&self, name: &str) -> Result<Arc<dyn Backend>, CoralError> {
        self.backends.get(name).cloned().ok_or_else(|| {
            CoralError::config(format!("backend '{name}' is not registered"))
                .context("known", self.names().join(","))
        })
    }

    /// Registered backend names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.backends.keys().cloned().collect()
    }
}
