//! The runner registry.
//!
//! Runner kinds form a closed set registered at engine start; no
//! dynamic code loading. Each plugin publishes its kind name, its
//! default configuration document (embedded YAML), the configuration
//! hooks, and a factory producing runner instances.

use std::sync::Arc;

use caravel_config::{EffectiveConfig, RunnerHooks};
use caravel_core::{CaravelError, CaravelResult};
use indexmap::IndexMap;
use serde_yaml::Value;

use crate::Runner;

/// One registered runner kind.
#[derive(Debug)]
pub struct RunnerPlugin {
    /// Globally unique kind name; also the description section key.
    pub kind: &'static str,
    /// Default runner configuration, as an embedded YAML document.
    pub defaults: &'static str,
    /// Configuration hooks for the merge pipeline.
    pub hooks: fn() -> Box<dyn RunnerHooks>,
    /// Runner factory: effective configuration plus an optional bound
    /// task.
    pub factory: fn(Arc<EffectiveConfig>, Option<String>) -> CaravelResult<Box<dyn Runner>>,
}

impl RunnerPlugin {
    /// Parse the embedded defaults document.
    ///
    /// # Errors
    ///
    /// Returns an `internal` error when the embedded document is not
    /// valid YAML (a packaging defect, not user input).
    pub fn default_config(&self) -> CaravelResult<Value> {
        serde_yaml::from_str(self.defaults).map_err(|e| {
            CaravelError::internal(format!(
                "embedded defaults for runner `{}` are invalid: {e}",
                self.kind
            ))
        })
    }
}

/// The set of runner kinds known to this engine build.
pub struct Registry {
    plugins: IndexMap<&'static str, RunnerPlugin>,
}

impl Registry {
    /// The built-in runner set.
    #[must_use]
    pub fn builtin() -> Self {
        let mut plugins = IndexMap::new();
        for plugin in [
            crate::container::plugin(),
            crate::ssh::plugin(),
            crate::k8s::plugin(),
            crate::gcp::plugin(),
        ] {
            plugins.insert(plugin.kind, plugin);
        }
        Self { plugins }
    }

    /// Look up a runner kind.
    ///
    /// # Errors
    ///
    /// Returns a `configuration` error naming the unknown kind and the
    /// known ones.
    pub fn get(&self, kind: &str) -> CaravelResult<&RunnerPlugin> {
        self.plugins.get(kind).ok_or_else(|| {
            CaravelError::config(format!(
                "unknown runner kind `{kind}` (known: {})",
                self.kinds().join(", ")
            ))
        })
    }

    /// All registered kind names, in registration order.
    #[must_use]
    pub fn kinds(&self) -> Vec<&'static str> {
        self.plugins.keys().copied().collect()
    }

    /// Iterate over all plugins.
    pub fn iter(&self) -> impl Iterator<Item = &RunnerPlugin> {
        self.plugins.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_kinds() {
        let registry = Registry::builtin();
        assert_eq!(registry.kinds(), vec!["container", "ssh", "k8s", "gcp"]);
    }

    #[test]
    fn test_kind_names_unique() {
        let registry = Registry::builtin();
        let mut kinds = registry.kinds();
        kinds.sort_unstable();
        kinds.dedup();
        assert_eq!(kinds.len(), registry.kinds().len());
    }

    #[test]
    fn test_embedded_defaults_parse() {
        let registry = Registry::builtin();
        for plugin in registry.iter() {
            let defaults = plugin.default_config().unwrap();
            assert!(defaults.is_mapping(), "defaults for {} not a mapping", plugin.kind);
        }
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let registry = Registry::builtin();
        let err = registry.get("singularity").unwrap_err();
        assert!(err.to_string().contains("singularity"));
        assert!(err.to_string().contains("container"));
    }
}
