//! Remote SSH runner.
//!
//! Executes the package on a host reached over SSH by syncing the
//! package directory up, invoking the engine remotely against a
//! delegated platform, and syncing the workspace back. Every step
//! annotates the phase it failed in (`create env`, `configure env`,
//! `sync up`, `remote configure`, `remote run`, `sync back`).

use std::sync::Arc;

use async_trait::async_trait;
use caravel_config::{EffectiveConfig, RunnerHooks};
use caravel_core::{tree, CaravelError, CaravelResult};
use caravel_shell::OnError;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use tracing::info;

use crate::registry::RunnerPlugin;
use crate::Runner;

/// Registry entry for this runner kind.
#[must_use]
pub(crate) fn plugin() -> RunnerPlugin {
    RunnerPlugin {
        kind: "ssh",
        defaults: DEFAULTS,
        hooks: || Box::new(SshHooks),
        factory: |config, task| Ok(Box::new(SshRunner::new(&config, task)?)),
    }
}

const DEFAULTS: &str = "\
host: ''
platform: container
remote_root: caravel-runs
interpreter:
  type: system
authentication: {}
";

fn default_python() -> String {
    "python3".to_owned()
}

/// The interpreter the remote engine runs under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Interpreter {
    /// The host's own interpreter and PATH.
    System {
        /// Python executable used for tooling checks.
        #[serde(default = "default_python")]
        python: String,
    },
    /// A dedicated virtual environment, created on demand.
    Virtualenv {
        /// Python executable used to create the environment.
        #[serde(default = "default_python")]
        python: String,
        /// Environment directory on the remote host.
        #[serde(default = "default_venv_location")]
        location: String,
        /// Packages installed into the environment (delegated-runner
        /// tooling), space-separated.
        #[serde(default)]
        requirements: String,
    },
}

fn default_venv_location() -> String {
    "caravel-env".to_owned()
}

impl Default for Interpreter {
    fn default() -> Self {
        Self::System {
            python: default_python(),
        }
    }
}

/// SSH authentication parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Auth {
    /// Remote user; defaults to the SSH client configuration.
    pub user: Option<String>,
    /// Identity file passed with `-i`.
    pub identity_file: Option<String>,
}

/// The merged `runner` section for this kind.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    /// Remote host name or address; required.
    pub host: String,
    /// Runner kind executed on the remote host.
    pub platform: String,
    /// Base directory for synced packages on the remote host, relative
    /// to the remote home unless absolute.
    pub remote_root: String,
    /// Remote interpreter specification.
    pub interpreter: Interpreter,
    /// Authentication parameters.
    pub authentication: Auth,
}

/// Configuration hooks for the ssh kind.
pub struct SshHooks;

impl RunnerHooks for SshHooks {
    fn kind(&self) -> &'static str {
        "ssh"
    }

    fn validate(&self, root: &Value) -> CaravelResult<()> {
        let runner = tree::get_path(root, "runner").cloned().unwrap_or(Value::Null);
        let config: SshConfig = serde_yaml::from_value(runner)
            .map_err(|e| CaravelError::config(format!("ssh runner section: {e}")))?;
        if config.host.is_empty() {
            return Err(CaravelError::config("ssh runner requires `host`"));
        }
        if config.platform.is_empty() {
            return Err(CaravelError::config(
                "ssh runner requires `platform` (the runner kind to use on the remote host)",
            ));
        }
        Ok(())
    }
}

/// Runner for the remote SSH substrate.
pub struct SshRunner {
    config: Arc<EffectiveConfig>,
    ssh: SshConfig,
    task: Option<String>,
}

impl SshRunner {
    /// Construct from an effective configuration and an optional bound
    /// task.
    ///
    /// # Errors
    ///
    /// Returns a `configuration` error when the `runner` section does
    /// not match this kind's schema.
    pub fn new(config: &Arc<EffectiveConfig>, task: Option<String>) -> CaravelResult<Self> {
        let ssh: SshConfig = config.runner_typed()?;
        Ok(Self::with_config(ssh, config, task))
    }

    /// Construct with an explicit SSH configuration. Used by runners
    /// that delegate to SSH (the cloud VM runner).
    #[must_use]
    pub fn with_config(
        ssh: SshConfig,
        config: &Arc<EffectiveConfig>,
        task: Option<String>,
    ) -> Self {
        Self {
            config: Arc::clone(config),
            ssh,
            task,
        }
    }

    /// `user@host`, or bare `host` when no user is configured.
    fn target(&self) -> String {
        match &self.ssh.authentication.user {
            Some(user) => format!("{user}@{}", self.ssh.host),
            None => self.ssh.host.clone(),
        }
    }

    fn ssh_options(&self) -> Vec<String> {
        let mut options = vec![
            "-o".to_owned(),
            "StrictHostKeyChecking=accept-new".to_owned(),
        ];
        if let Some(identity) = &self.ssh.authentication.identity_file {
            options.push("-i".to_owned());
            options.push(identity.clone());
        }
        options
    }

    /// `ssh <options> <target> <remote command>`.
    fn ssh_command(&self, remote: &str) -> Vec<String> {
        let mut command = vec!["ssh".to_owned()];
        command.extend(self.ssh_options());
        command.push(self.target());
        command.push(remote.to_owned());
        command
    }

    /// `rsync -az -e 'ssh …' <src> <dst>`; trailing slashes on both
    /// sides give directory-to-directory semantics.
    fn rsync_command(&self, src: &str, dst: &str) -> Vec<String> {
        vec![
            "rsync".to_owned(),
            "-az".to_owned(),
            "-e".to_owned(),
            format!("ssh {}", self.ssh_options().join(" ")),
            src.to_owned(),
            dst.to_owned(),
        ]
    }

    /// Package directory on the remote host.
    fn remote_package_dir(&self) -> String {
        let base = self
            .config
            .root()
            .file_name()
            .map_or_else(|| "package".to_owned(), |n| n.to_string_lossy().into_owned());
        format!("{}/{base}", self.ssh.remote_root)
    }

    /// Shell prefix activating the configured interpreter.
    fn activation_prefix(&self) -> String {
        match &self.ssh.interpreter {
            Interpreter::System { .. } => String::new(),
            Interpreter::Virtualenv { location, .. } => {
                format!("source {location}/bin/activate && ")
            },
        }
    }

    async fn exec(&self, command: &[String], phase: &str) -> CaravelResult<()> {
        caravel_shell::run(command, OnError::Raise)
            .await
            .map_err(|e| e.in_phase(phase))?;
        Ok(())
    }

    async fn create_interpreter(&self) -> CaravelResult<()> {
        match &self.ssh.interpreter {
            Interpreter::System { python } => {
                let probe = self.ssh_command(&format!("{python} --version"));
                self.exec(&probe, "create env").await
            },
            Interpreter::Virtualenv {
                python, location, ..
            } => {
                let create =
                    self.ssh_command(&format!("test -d {location} || {python} -m venv {location}"));
                self.exec(&create, "create env").await
            },
        }
    }

    async fn configure_interpreter(&self) -> CaravelResult<()> {
        if let Interpreter::Virtualenv { requirements, .. } = &self.ssh.interpreter {
            if !requirements.trim().is_empty() {
                let install = self.ssh_command(&format!(
                    "{}pip install {requirements}",
                    self.activation_prefix()
                ));
                return self.exec(&install, "configure env").await;
            }
        }
        Ok(())
    }

    async fn sync_up(&self) -> CaravelResult<()> {
        let remote_dir = self.remote_package_dir();
        let mkdir = self.ssh_command(&format!("mkdir -p {remote_dir}"));
        self.exec(&mkdir, "sync up").await?;

        let src = format!("{}/", self.config.root().display());
        let dst = format!("{}:{remote_dir}/", self.target());
        let rsync = self.rsync_command(&src, &dst);
        self.exec(&rsync, "sync up").await
    }

    async fn sync_back(&self) -> CaravelResult<()> {
        let src = format!(
            "{}:{}/workspace/",
            self.target(),
            self.remote_package_dir()
        );
        let dst = format!("{}/", self.config.workspace().display());
        let rsync = self.rsync_command(&src, &dst);
        self.exec(&rsync, "sync back").await
    }

    fn require_clients() -> CaravelResult<()> {
        for client in ["ssh", "rsync"] {
            which::which(client).map_err(|_| {
                CaravelError::config(format!("`{client}` is required but was not found on PATH"))
            })?;
        }
        Ok(())
    }
}

#[async_trait]
impl Runner for SshRunner {
    async fn configure(&mut self) -> CaravelResult<()> {
        Self::require_clients()?;
        info!(host = %self.ssh.host, "configuring remote host");

        self.create_interpreter().await?;
        self.configure_interpreter().await?;
        self.sync_up().await?;

        let remote = format!(
            "{}caravel configure --package={} --platform={}",
            self.activation_prefix(),
            self.remote_package_dir(),
            self.ssh.platform
        );
        self.exec(&self.ssh_command(&remote), "remote configure")
            .await
    }

    async fn run(&mut self) -> CaravelResult<()> {
        Self::require_clients()?;
        let task = self
            .config
            .description()
            .select_task(self.task.as_deref())?;
        info!(host = %self.ssh.host, task = %task, "running task remotely");

        let remote = format!(
            "{}caravel run --package={} --platform={} --task={task}",
            self.activation_prefix(),
            self.remote_package_dir(),
            self.ssh.platform
        );
        self.exec(&self.ssh_command(&remote), "remote run").await?;
        self.sync_back().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ssh_config() -> SshConfig {
        SshConfig {
            host: "worker.example.com".to_owned(),
            platform: "container".to_owned(),
            remote_root: "caravel-runs".to_owned(),
            interpreter: Interpreter::default(),
            authentication: Auth::default(),
        }
    }

    fn runner_with(ssh: SshConfig) -> SshRunner {
        // Command assembly does not touch the tree; a minimal effective
        // config carries the package root only.
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(caravel_core::DESCRIPTION_FILE),
            "name: mnist\ntasks:\n  train: {}\n",
        )
        .unwrap();
        let config = caravel_config::effective::build_effective(
            &caravel_config::effective::BuildRequest {
                package: dir.path(),
                args: &caravel_config::ParsedArgs::default(),
                runner_defaults: Value::Null,
                hooks: &caravel_config::hooks::NoRunner,
                workspace: None,
                resolve: false,
            },
        )
        .unwrap();
        SshRunner::with_config(ssh, &Arc::new(config), None)
    }

    #[test]
    fn test_target_with_user() {
        let mut ssh = ssh_config();
        ssh.authentication.user = Some("ml".to_owned());
        let runner = runner_with(ssh);
        assert_eq!(runner.target(), "ml@worker.example.com");
    }

    #[test]
    fn test_ssh_command_with_identity() {
        let mut ssh = ssh_config();
        ssh.authentication.identity_file = Some("~/.ssh/id_worker".to_owned());
        let runner = runner_with(ssh);
        let command = runner.ssh_command("true");
        assert_eq!(
            command,
            vec![
                "ssh".to_owned(),
                "-o".to_owned(),
                "StrictHostKeyChecking=accept-new".to_owned(),
                "-i".to_owned(),
                "~/.ssh/id_worker".to_owned(),
                "worker.example.com".to_owned(),
                "true".to_owned(),
            ]
        );
    }

    #[test]
    fn test_rsync_directory_to_directory() {
        let runner = runner_with(ssh_config());
        let command = runner.rsync_command("/pkg/", "worker.example.com:caravel-runs/pkg/");
        assert_eq!(command[0], "rsync");
        assert_eq!(command[1], "-az");
        assert!(command[4].ends_with('/'));
        assert!(command[5].ends_with('/'));
    }

    #[test]
    fn test_remote_package_dir_uses_basename() {
        let runner = runner_with(ssh_config());
        let dir = runner.remote_package_dir();
        assert!(dir.starts_with("caravel-runs/"));
    }

    #[test]
    fn test_virtualenv_activation_prefix() {
        let mut ssh = ssh_config();
        ssh.interpreter = Interpreter::Virtualenv {
            python: "python3".to_owned(),
            location: "caravel-env".to_owned(),
            requirements: String::new(),
        };
        let runner = runner_with(ssh);
        assert_eq!(
            runner.activation_prefix(),
            "source caravel-env/bin/activate && "
        );
    }

    #[test]
    fn test_interpreter_deserialization() {
        let interpreter: Interpreter =
            serde_yaml::from_str("type: virtualenv\nrequirements: caravel-extras\n").unwrap();
        match interpreter {
            Interpreter::Virtualenv {
                python,
                location,
                requirements,
            } => {
                assert_eq!(python, "python3");
                assert_eq!(location, "caravel-env");
                assert_eq!(requirements, "caravel-extras");
            },
            Interpreter::System { .. } => panic!("expected virtualenv"),
        }
    }

    #[test]
    fn test_validate_requires_host() {
        let err = SshHooks
            .validate(&serde_yaml::from_str("runner:\n  platform: container\n").unwrap())
            .unwrap_err();
        assert!(err.to_string().contains("host"));
    }
}
