//! Command plumbing shared by the subcommands.
//!
//! One engine instance per invocation: the runner registry plus the
//! loaded (and seeded) system settings. Commands use it to resolve the
//! platform, build the effective configuration, and construct runners.

use std::sync::Arc;

use caravel_config::effective::{build_effective, BuildRequest, EffectiveConfig};
use caravel_config::ParsedArgs;
use caravel_platform::SystemSettings;
use caravel_runners::{Registry, Runner, RunnerPlugin};
use caravel_core::CaravelResult;

use crate::CommonOpts;

pub(crate) struct Engine {
    pub(crate) settings: SystemSettings,
    pub(crate) registry: Registry,
}

impl Engine {
    /// Load the settings file and seed it with plugin defaults.
    pub(crate) fn bootstrap() -> CaravelResult<Self> {
        let registry = Registry::builtin();
        let path = SystemSettings::default_path()?;
        let mut settings = SystemSettings::load_or_create(&path)?;

        let mut seeds = Vec::new();
        for plugin in registry.iter() {
            seeds.push((plugin.kind, plugin.default_config()?));
        }
        settings.seed(seeds)?;
        tracing::debug!(
            path = %settings.path().display(),
            platforms = settings.platform_names().len(),
            "settings loaded"
        );

        Ok(Self { settings, registry })
    }

    /// Resolve the platform and build the effective configuration.
    pub(crate) fn build_config(
        &self,
        common: &CommonOpts,
        resolve: bool,
    ) -> CaravelResult<(Arc<EffectiveConfig>, &RunnerPlugin)> {
        let (kind, defaults) = self.settings.resolve_platform(&common.platform)?;
        let plugin = self.registry.get(&kind)?;
        let args = ParsedArgs::parse(&common.extra)?;
        let hooks = (plugin.hooks)();

        let config = build_effective(&BuildRequest {
            package: &common.package,
            args: &args,
            runner_defaults: defaults,
            hooks: hooks.as_ref(),
            workspace: common.workspace.as_deref(),
            resolve,
        })?;
        Ok((Arc::new(config), plugin))
    }

    /// Construct a runner bound to one task (or none, for `configure`).
    pub(crate) fn runner(
        plugin: &RunnerPlugin,
        config: &Arc<EffectiveConfig>,
        task: Option<String>,
    ) -> CaravelResult<Box<dyn Runner>> {
        (plugin.factory)(Arc::clone(config), task)
    }
}
