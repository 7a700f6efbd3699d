// SPDX-License-Identifier: MIT OR Apache-2.0
//! The function registry a worker dispatches calls through.
//!
//! Statically-compiled workers cannot import a module by name, so the
//! embedding binary registers every callable at startup. Lookup keys are
//! `module::qualname` with `<locals>` segments dropped from the qualified
//! name.

use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Positional arguments as decoded from the envelope.
pub type Args = Vec<Value>;
/// Keyword arguments as decoded from the envelope.
pub type Kwargs = BTreeMap<String, Value>;

/// A registered callable. Errors are traceback-style strings that become
/// the failure payload verbatim.
pub type Handler =
    Arc<dyn Fn(Args, Kwargs) -> Result<Value, String> + Send + Sync + 'static>;

/// Normalize a `(module, qualname)` pair into a registry key.
///
/// `<locals>` segments in the qualified name are skipped, so a callable
/// defined inside a function body resolves to the same key as its
/// top-level registration.
#[must_use]
pub fn target_key(module: &str, qualname: &str) -> String {
    let qual: Vec<&str> = qualname
        .split('.')
        .filter(|part| *part != "<locals>" && !part.is_empty())
        .collect();
    format!("{module}::{}", qual.join("."))
}

/// Maps call targets to handlers.
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    handlers: BTreeMap<String, Handler>,
}

impl std::fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("targets", &self.targets())
            .finish()
    }
}

impl FunctionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `module::qualname`. Re-registration replaces.
    pub fn register<F>(&mut self, module: &str, qualname: &str, handler: F)
    where
        F: Fn(Args, Kwargs) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.handlers
            .insert(target_key(module, qualname), Arc::new(handler));
    }

    /// Look up the handler for a call target.
    #[must_use]
    pub fn get(&self, module: &str, qualname: &str) -> Option<Handler> {
        self.handlers.get(&target_key(module, qualname)).cloned()
    }

    /// Registered target keys, sorted.
    #[must_use]
    pub fn targets(&self) -> Vec<String> {
        self.handlers.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn locals_segments_are_skipped() {
        assert_eq!(target_key("tasks", "process"), "tasks::process");
        assert_eq!(
            target_key("tasks", "outer.<locals>.process"),
            "tasks::outer.process"
        );
    }

    #[test]
    fn lookup_ignores_locals_in_the_envelope() {
        let mut registry = FunctionRegistry::new();
        registry.register("tasks", "outer.process", |_, _| Ok(json!(1)));
        assert!(registry.get("tasks", "outer.<locals>.process").is_some());
        assert!(registry.get("tasks", "other").is_none());
    }

    #[test]
    fn re_registration_replaces() {
        let mut registry = FunctionRegistry::new();
        registry.register("m", "f", |_, _| Ok(json!(1)));
        registry.register("m", "f", |_, _| Ok(json!(2)));
        let handler = registry.get("m", "f").unwrap();
        assert_eq!(handler(vec![], Kwargs::new()).unwrap(), json!(2));
    }
}
