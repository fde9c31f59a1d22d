//! Runner participation in the configuration merge.
//!
//! The effective-configuration builder is runner-agnostic; the selected
//! runner contributes through these hooks: folding its description
//! section into the `runner` node, translating reserved substrate
//! switches, and validating the merged `runner` section.

use caravel_core::{tree, CaravelResult};
use serde_yaml::Value;
use tracing::warn;

use crate::args::SubstrateSwitches;

/// Hooks a runner kind exposes to the configuration builder.
pub trait RunnerHooks {
    /// The runner kind name, also the description section key
    /// (`container`, `ssh`, `k8s`, `gcp`).
    fn kind(&self) -> &'static str;

    /// Runner-aware merge: fold the description's per-kind section into
    /// the `runner` node. The default implementation deep-merges
    /// `tree[kind]` over `tree.runner`.
    ///
    /// # Errors
    ///
    /// Implementations return `configuration` errors for sections they
    /// cannot interpret.
    fn merge(&self, root: &mut Value) -> CaravelResult<()> {
        if let Some(section) = tree::get_path(root, self.kind()).cloned() {
            let mut runner = tree::get_path(root, "runner")
                .cloned()
                .unwrap_or(Value::Mapping(serde_yaml::Mapping::new()));
            tree::deep_merge(&mut runner, &section);
            tree::set_path(root, "runner", runner);
        }
        Ok(())
    }

    /// Translate reserved substrate switches into runner fields. The
    /// default implementation warns when switches were given to a
    /// runner that understands none of them.
    ///
    /// # Errors
    ///
    /// Implementations return `configuration` errors for switch values
    /// they cannot express on their substrate.
    fn translate_switches(
        &self,
        switches: &SubstrateSwitches,
        _root: &mut Value,
    ) -> CaravelResult<()> {
        if !switches.is_empty() {
            warn!(
                kind = self.kind(),
                "substrate switches are not supported by this runner; ignoring"
            );
        }
        Ok(())
    }

    /// Validate the merged `runner` section.
    ///
    /// # Errors
    ///
    /// Returns a `configuration` error describing the offending field.
    fn validate(&self, root: &Value) -> CaravelResult<()>;
}

/// Hooks for commands that render configuration without a platform
/// (e.g. `describe`). Merges nothing, validates nothing.
pub struct NoRunner;

impl RunnerHooks for NoRunner {
    fn kind(&self) -> &'static str {
        "none"
    }

    fn merge(&self, _root: &mut Value) -> CaravelResult<()> {
        Ok(())
    }

    fn validate(&self, _root: &Value) -> CaravelResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Containerish;

    impl RunnerHooks for Containerish {
        fn kind(&self) -> &'static str {
            "container"
        }

        fn validate(&self, _root: &Value) -> CaravelResult<()> {
            Ok(())
        }
    }

    #[test]
    fn test_default_merge_folds_section() {
        let mut root: Value = serde_yaml::from_str(
            "container:\n  image: ubuntu:18.04\nrunner:\n  executable: docker\n",
        )
        .unwrap();
        Containerish.merge(&mut root).unwrap();
        assert_eq!(tree::get_str(&root, "runner.image"), Some("ubuntu:18.04"));
        assert_eq!(tree::get_str(&root, "runner.executable"), Some("docker"));
    }

    #[test]
    fn test_default_merge_without_section() {
        let mut root: Value = serde_yaml::from_str("name: demo\n").unwrap();
        Containerish.merge(&mut root).unwrap();
        assert!(tree::get_path(&root, "runner").is_none());
    }
}
