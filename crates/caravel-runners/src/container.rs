//! Local container runner.
//!
//! Backed by a container CLI (`docker` by default, any compatible
//! executable via `runner.executable`). `configure` obtains the image
//! according to the build strategy; `run` binds the task's parameters
//! as volume mounts and executes one `run` invocation of the container
//! CLI.

use std::sync::Arc;

use async_trait::async_trait;
use caravel_config::args::SubstrateSwitches;
use caravel_config::{EffectiveConfig, RunnerHooks};
use caravel_core::{tree, AccessMode, CaravelError, CaravelResult};
use caravel_shell::{generate_mounts, sync_workspace, MountPlan, OnError};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use tracing::{debug, info, warn};

use crate::registry::RunnerPlugin;
use crate::Runner;

/// Registry entry for this runner kind.
#[must_use]
pub(crate) fn plugin() -> RunnerPlugin {
    RunnerPlugin {
        kind: "container",
        defaults: DEFAULTS,
        hooks: || Box::new(ContainerHooks),
        factory: |config, task| Ok(Box::new(ContainerRunner::new(&config, task)?)),
    }
}

/// Default runner configuration; `image` must come from the package.
const DEFAULTS: &str = "\
executable: docker
build_strategy: pull
run_args: --rm
build_context: build
build_file: Dockerfile
build_args: {}
env_args: {}
gpus: ''
extra_mounts: []
";

/// How `configure` obtains the image.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildStrategy {
    /// Pull the image unconditionally.
    #[default]
    Pull,
    /// Build when a build file exists, else pull when absent.
    Auto,
    /// Always build from the build file.
    Always,
}

/// The merged `runner` section for this kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    /// Image reference; required.
    pub image: String,
    /// Container CLI executable.
    pub executable: String,
    /// Extra arguments inserted right after `run`, space-separated.
    pub run_args: String,
    /// Image acquisition strategy.
    pub build_strategy: BuildStrategy,
    /// Build context directory, relative to the package root.
    pub build_context: String,
    /// Build file, relative to the package root.
    pub build_file: String,
    /// `--build-arg` key-values.
    pub build_args: IndexMap<String, String>,
    /// `-e` key-values passed to every task.
    pub env_args: IndexMap<String, String>,
    /// Device spec: `all`, a count, `device=…` lists, or empty.
    pub gpus: String,
    /// Networking option (`--network`).
    pub network: Option<String>,
    /// Security option (`--security-opt`).
    pub security: Option<String>,
    /// Memory limit (`--memory`).
    pub memory: Option<String>,
    /// CPU limit (`--cpus`).
    pub cpu: Option<String>,
    /// Additional binds, `host:container[:mode]`.
    pub extra_mounts: Vec<String>,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            image: String::new(),
            executable: "docker".to_owned(),
            run_args: "--rm".to_owned(),
            build_strategy: BuildStrategy::default(),
            build_context: "build".to_owned(),
            build_file: "Dockerfile".to_owned(),
            build_args: IndexMap::new(),
            env_args: IndexMap::new(),
            gpus: String::new(),
            network: None,
            security: None,
            memory: None,
            cpu: None,
            extra_mounts: Vec::new(),
        }
    }
}

/// Configuration hooks for the container kind.
pub struct ContainerHooks;

impl RunnerHooks for ContainerHooks {
    fn kind(&self) -> &'static str {
        "container"
    }

    fn translate_switches(
        &self,
        switches: &SubstrateSwitches,
        root: &mut Value,
    ) -> CaravelResult<()> {
        let scalar_fields = [
            ("runner.network", &switches.network),
            ("runner.security", &switches.security),
            ("runner.gpus", &switches.gpus),
            ("runner.memory", &switches.memory),
            ("runner.cpu", &switches.cpu),
        ];
        for (path, value) in scalar_fields {
            if let Some(value) = value {
                tree::set_path(root, path, Value::from(value.as_str()));
            }
        }
        if !switches.mounts.is_empty() {
            let mut existing = tree::get_path(root, "runner.extra_mounts")
                .and_then(Value::as_sequence)
                .cloned()
                .unwrap_or_default();
            existing.extend(switches.mounts.iter().map(|m| Value::from(m.as_str())));
            tree::set_path(root, "runner.extra_mounts", Value::Sequence(existing));
        }
        Ok(())
    }

    fn validate(&self, root: &Value) -> CaravelResult<()> {
        let runner = tree::get_path(root, "runner").cloned().unwrap_or(Value::Null);
        let config: ContainerConfig = serde_yaml::from_value(runner)
            .map_err(|e| CaravelError::config(format!("container runner section: {e}")))?;
        if config.image.is_empty() {
            return Err(CaravelError::config(
                "container runner requires `image` (set it in the package's `container` \
                 section or with -Pcontainer.image=...)",
            ));
        }
        if config.executable.is_empty() {
            return Err(CaravelError::config(
                "container runner requires a non-empty `executable`",
            ));
        }
        Ok(())
    }
}

/// What one `configure` invocation should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConfigureAction {
    Pull,
    Build,
    Skip,
}

/// Pick the configure action from the strategy and observed state.
fn decide_configure(
    strategy: BuildStrategy,
    build_file_exists: bool,
    image_present: bool,
) -> ConfigureAction {
    match strategy {
        BuildStrategy::Pull => ConfigureAction::Pull,
        BuildStrategy::Always => ConfigureAction::Build,
        BuildStrategy::Auto => {
            if build_file_exists {
                ConfigureAction::Build
            } else if image_present {
                ConfigureAction::Skip
            } else {
                ConfigureAction::Pull
            }
        },
    }
}

/// Translate a device spec into the substrate flag and, for a plain
/// count, the device-visibility environment variable enumerating
/// indices `0..N-1`.
fn gpu_arguments(gpus: &str) -> (Vec<String>, Vec<(String, String)>) {
    let gpus = gpus.trim();
    if gpus.is_empty() {
        return (Vec::new(), Vec::new());
    }
    let flags = vec![format!("--gpus={gpus}")];
    let env = match gpus.parse::<u32>() {
        Ok(count) if count > 0 => {
            let indices: Vec<String> = (0..count).map(|i| i.to_string()).collect();
            vec![("NVIDIA_VISIBLE_DEVICES".to_owned(), indices.join(","))]
        },
        _ => Vec::new(),
    };
    (flags, env)
}

/// Runner for the local container substrate.
pub struct ContainerRunner {
    config: Arc<EffectiveConfig>,
    container: ContainerConfig,
    task: Option<String>,
}

impl ContainerRunner {
    /// Construct from an effective configuration and an optional bound
    /// task.
    ///
    /// # Errors
    ///
    /// Returns a `configuration` error when the `runner` section does
    /// not match this kind's schema.
    pub fn new(config: &Arc<EffectiveConfig>, task: Option<String>) -> CaravelResult<Self> {
        let container: ContainerConfig = config.runner_typed()?;
        Ok(Self {
            config: Arc::clone(config),
            container,
            task,
        })
    }

    async fn image_exists(&self) -> CaravelResult<bool> {
        let command = vec![
            self.container.executable.clone(),
            "inspect".to_owned(),
            "--type=image".to_owned(),
            self.container.image.clone(),
        ];
        let (code, _) = caravel_shell::run_and_capture(&command).await?;
        Ok(code == 0)
    }

    fn pull_command(&self) -> Vec<String> {
        vec![
            self.container.executable.clone(),
            "pull".to_owned(),
            self.container.image.clone(),
        ]
    }

    fn build_command(&self) -> Vec<String> {
        let root = self.config.root();
        let mut command = vec![
            self.container.executable.clone(),
            "build".to_owned(),
            "-t".to_owned(),
            self.container.image.clone(),
            "-f".to_owned(),
            root.join(&self.container.build_file).display().to_string(),
        ];
        for (key, value) in &self.container.build_args {
            command.push("--build-arg".to_owned());
            command.push(format!("{key}={value}"));
        }
        command.push(root.join(&self.container.build_context).display().to_string());
        command
    }

    /// Assemble the `run` invocation for a prepared mount plan.
    fn run_command(&self, plan: &MountPlan, entrypoint: Option<&str>) -> Vec<String> {
        let mut command = vec![self.container.executable.clone(), "run".to_owned()];
        command.extend(self.container.run_args.split_whitespace().map(str::to_owned));

        let (gpu_flags, gpu_env) = gpu_arguments(&self.container.gpus);
        command.extend(gpu_flags);

        for (key, value) in &self.container.env_args {
            command.push("-e".to_owned());
            command.push(format!("{key}={value}"));
        }
        for (key, value) in &gpu_env {
            command.push("-e".to_owned());
            command.push(format!("{key}={value}"));
        }

        if let Some(memory) = &self.container.memory {
            command.push(format!("--memory={memory}"));
        }
        if let Some(cpu) = &self.container.cpu {
            command.push(format!("--cpus={cpu}"));
        }
        if let Some(network) = &self.container.network {
            command.push(format!("--network={network}"));
        }
        if let Some(security) = &self.container.security {
            command.push(format!("--security-opt={security}"));
        }

        for (host, dst) in &plan.mounts {
            let mut mount = format!(
                "type=bind,src={},dst={dst}",
                host.display()
            );
            if plan.modes.get(host) == Some(&AccessMode::Ro) {
                mount.push_str(",ro");
            }
            command.push("--mount".to_owned());
            command.push(mount);
        }
        for extra in &self.container.extra_mounts {
            if let Some(mount) = translate_extra_mount(extra) {
                command.push("--mount".to_owned());
                command.push(mount);
            } else {
                warn!(spec = extra, "ignoring malformed extra mount");
            }
        }

        if let Some(entrypoint) = entrypoint {
            command.push(format!("--entrypoint={entrypoint}"));
        }
        command.push(self.container.image.clone());
        command.extend(plan.args.iter().cloned());
        command
    }

    fn warn_on_hardware_mismatch(&self) {
        if let Some(hw) = &self.config.description().platform {
            if hw.accelerator_count.unwrap_or(0) > 0 && self.container.gpus.trim().is_empty() {
                warn!(
                    expected = hw.accelerator_count,
                    "package declares accelerators but no `gpus` spec is configured"
                );
            }
        }
    }
}

/// Translate a `host:container[:mode]` bind into `--mount` syntax.
fn translate_extra_mount(spec: &str) -> Option<String> {
    let mut parts = spec.splitn(3, ':');
    let host = parts.next().filter(|s| !s.is_empty())?;
    let container = parts.next().filter(|s| !s.is_empty())?;
    let mut mount = format!("type=bind,src={host},dst={container}");
    match parts.next() {
        None | Some("rw") => {},
        Some("ro") => mount.push_str(",ro"),
        Some(_) => return None,
    }
    Some(mount)
}

#[async_trait]
impl Runner for ContainerRunner {
    async fn configure(&mut self) -> CaravelResult<()> {
        let build_file = self.config.root().join(&self.container.build_file);
        let action = decide_configure(
            self.container.build_strategy,
            build_file.is_file(),
            self.image_exists().await?,
        );
        match action {
            ConfigureAction::Pull => {
                info!(image = %self.container.image, "pulling image");
                caravel_shell::run(&self.pull_command(), OnError::Raise).await?;
            },
            ConfigureAction::Build => {
                info!(image = %self.container.image, "building image");
                caravel_shell::run(&self.build_command(), OnError::Raise).await?;
            },
            ConfigureAction::Skip => {
                debug!(image = %self.container.image, "image present; nothing to do");
            },
        }
        Ok(())
    }

    async fn run(&mut self) -> CaravelResult<()> {
        let task = self
            .config
            .description()
            .select_task(self.task.as_deref())?;

        if self.container.build_strategy != BuildStrategy::Always && !self.image_exists().await? {
            self.configure().await?;
        }
        self.warn_on_hardware_mismatch();

        sync_workspace(&self.config, &task)?;
        let plan = generate_mounts(&self.config, &task)?;
        let entrypoint = self
            .config
            .description()
            .task(&task)?
            .entrypoint
            .clone();

        let command = self.run_command(&plan, entrypoint.as_deref());
        info!(task = %task, "executing task");
        caravel_shell::run(&command, OnError::Raise).await?;
        Ok(())
    }
}
