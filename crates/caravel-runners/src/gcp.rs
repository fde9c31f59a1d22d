//! Cloud VM runner (Google Compute Engine).
//!
//! Provisions (or revives) a compute instance through the cloud CLI,
//! teaches the local SSH client how to reach it, bootstraps container
//! and Python tooling, and then delegates both `configure` and `run` to
//! the SSH runner against the instance. Cloud state polls use fixed
//! backoff until the instance reports the expected status.
//!
//! Instances are left running after `run` unless `stop_on_done` is set.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use caravel_config::{EffectiveConfig, RunnerHooks};
use caravel_core::{tree, CaravelError, CaravelResult, ExecContext};
use caravel_shell::OnError;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use tracing::{debug, info};

use crate::registry::RunnerPlugin;
use crate::ssh::{Auth, Interpreter, SshConfig, SshRunner};
use crate::Runner;

/// Registry entry for this runner kind.
#[must_use]
pub(crate) fn plugin() -> RunnerPlugin {
    RunnerPlugin {
        kind: "gcp",
        defaults: DEFAULTS,
        hooks: || Box::new(GcpHooks),
        factory: |config, task| Ok(Box::new(GcpRunner::new(&config, task)?)),
    }
}

const DEFAULTS: &str = "\
project_id: ''
zone: us-central1-a
instance:
  name: caravel-worker
  machine_type: n1-standard-1
  disk_size_gb: 100
platform: container
remote_root: caravel-runs
stop_on_done: false
authentication: {}
";

/// Fixed poll interval for cloud state.
const POLL_INTERVAL: Duration = Duration::from_secs(5);
/// Poll attempts before giving up on a state transition.
const MAX_POLLS: u32 = 60;

/// Compute instance specification.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceSpec {
    /// Instance name; also the local SSH alias.
    pub name: String,
    /// Machine type.
    pub machine_type: String,
    /// Boot disk size in gigabytes.
    pub disk_size_gb: u32,
}

impl Default for InstanceSpec {
    fn default() -> Self {
        Self {
            name: "caravel-worker".to_owned(),
            machine_type: "n1-standard-1".to_owned(),
            disk_size_gb: 100,
        }
    }
}

/// The merged `runner` section for this kind.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GcpConfig {
    /// Cloud project; required.
    pub project_id: String,
    /// Compute zone.
    pub zone: String,
    /// Service-account key file; when set, activated before any other
    /// cloud call.
    pub credentials: Option<String>,
    /// Instance to create or revive.
    pub instance: InstanceSpec,
    /// Runner kind executed on the instance.
    pub platform: String,
    /// Base directory for synced packages on the instance.
    pub remote_root: String,
    /// SSH authentication towards the instance.
    pub authentication: Auth,
    /// Remote interpreter for the delegated engine.
    pub interpreter: Interpreter,
    /// Stop the instance after a successful run.
    pub stop_on_done: bool,
}

/// Configuration hooks for the gcp kind.
pub struct GcpHooks;

impl RunnerHooks for GcpHooks {
    fn kind(&self) -> &'static str {
        "gcp"
    }

    fn validate(&self, root: &Value) -> CaravelResult<()> {
        let runner = tree::get_path(root, "runner").cloned().unwrap_or(Value::Null);
        let config: GcpConfig = serde_yaml::from_value(runner)
            .map_err(|e| CaravelError::config(format!("gcp runner section: {e}")))?;
        if config.project_id.is_empty() {
            return Err(CaravelError::config("gcp runner requires `project_id`"));
        }
        if config.instance.name.is_empty() {
            return Err(CaravelError::config("gcp runner requires `instance.name`"));
        }
        if config.platform.is_empty() {
            return Err(CaravelError::config(
                "gcp runner requires `platform` (the runner kind to use on the instance)",
            ));
        }
        Ok(())
    }
}

/// Runner for the cloud VM substrate.
pub struct GcpRunner {
    config: Arc<EffectiveConfig>,
    gcp: GcpConfig,
    task: Option<String>,
}

impl GcpRunner {
    /// Construct from an effective configuration and an optional bound
    /// task.
    ///
    /// # Errors
    ///
    /// Returns a `configuration` error when the `runner` section does
    /// not match this kind's schema.
    pub fn new(config: &Arc<EffectiveConfig>, task: Option<String>) -> CaravelResult<Self> {
        let gcp: GcpConfig = config.runner_typed()?;
        Ok(Self {
            config: Arc::clone(config),
            gcp,
            task,
        })
    }

    fn scope_args(&self) -> Vec<String> {
        vec![
            "--project".to_owned(),
            self.gcp.project_id.clone(),
            "--zone".to_owned(),
            self.gcp.zone.clone(),
            "--format=json".to_owned(),
        ]
    }

    fn instances_command(&self, verb: &str) -> Vec<String> {
        let mut command = vec![
            "gcloud".to_owned(),
            "compute".to_owned(),
            "instances".to_owned(),
            verb.to_owned(),
            self.gcp.instance.name.clone(),
        ];
        command.extend(self.scope_args());
        command
    }

    async fn activate_credentials(&self) -> CaravelResult<()> {
        if let Some(key_file) = &self.gcp.credentials {
            let command = vec![
                "gcloud".to_owned(),
                "auth".to_owned(),
                "activate-service-account".to_owned(),
                format!("--key-file={key_file}"),
            ];
            caravel_shell::run(&command, OnError::Raise)
                .await
                .map_err(|e| e.in_phase("activate credentials"))?;
        }
        Ok(())
    }

    /// Describe the instance; `None` when the cloud reports it absent.
    async fn describe_instance(&self) -> CaravelResult<Option<serde_json::Value>> {
        let command = self.instances_command("describe");
        let (code, output) = caravel_shell::run_and_capture(&command).await?;
        if code != 0 {
            debug!(instance = %self.gcp.instance.name, "instance not found");
            return Ok(None);
        }
        let parsed = first_json_value(&output).ok_or_else(|| {
            CaravelError::Execution(
                ExecContext::new(caravel_shell::format_command(&command), code)
                    .with_output(format!("unparseable instance description: {output}")),
            )
        })?;
        Ok(Some(parsed))
    }

    async fn create_instance(&self) -> CaravelResult<()> {
        let mut command = self.instances_command("create");
        command.push("--machine-type".to_owned());
        command.push(self.gcp.instance.machine_type.clone());
        command.push(format!("--boot-disk-size={}GB", self.gcp.instance.disk_size_gb));
        info!(instance = %self.gcp.instance.name, "creating instance");
        caravel_shell::run(&command, OnError::Raise)
            .await
            .map_err(|e| e.in_phase("create instance"))?;
        Ok(())
    }

    async fn start_instance(&self) -> CaravelResult<()> {
        info!(instance = %self.gcp.instance.name, "starting instance");
        caravel_shell::run(&self.instances_command("start"), OnError::Raise)
            .await
            .map_err(|e| e.in_phase("start instance"))?;
        Ok(())
    }

    async fn stop_instance(&self) -> CaravelResult<()> {
        info!(instance = %self.gcp.instance.name, "stopping instance");
        caravel_shell::run(&self.instances_command("stop"), OnError::Raise)
            .await
            .map_err(|e| e.in_phase("stop instance"))?;
        Ok(())
    }

    /// Poll with fixed backoff until the instance reports `RUNNING`.
    async fn wait_until_running(&self) -> CaravelResult<serde_json::Value> {
        for _ in 0..MAX_POLLS {
            if let Some(description) = self.describe_instance().await? {
                let status = description["status"].as_str().unwrap_or("");
                if status == "RUNNING" {
                    return Ok(description);
                }
                debug!(status, "instance not running yet");
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        Err(CaravelError::Execution(
            ExecContext {
                command: caravel_shell::format_command(&self.instances_command("describe")),
                exit_code: None,
                captured_output: None,
                phase: Some("wait for instance".to_owned()),
            },
        ))
    }

    async fn bootstrap(&self) -> CaravelResult<()> {
        let command = vec![
            "ssh".to_owned(),
            self.gcp.instance.name.clone(),
            "sudo apt-get update -y && \
             sudo apt-get install -y docker.io rsync python3-venv python3-pip"
                .to_owned(),
        ];
        caravel_shell::run(&command, OnError::Raise)
            .await
            .map_err(|e| e.in_phase("bootstrap"))?;
        Ok(())
    }

    /// SSH runner targeting the instance through its local alias.
    fn delegate(&self) -> SshRunner {
        let ssh = SshConfig {
            host: self.gcp.instance.name.clone(),
            platform: self.gcp.platform.clone(),
            remote_root: self.gcp.remote_root.clone(),
            interpreter: self.gcp.interpreter.clone(),
            authentication: self.gcp.authentication.clone(),
        };
        SshRunner::with_config(ssh, &self.config, self.task.clone())
    }

    fn record_ssh_alias(&self, description: &serde_json::Value) -> CaravelResult<()> {
        let Some(ip) = external_ip(description) else {
            return Err(CaravelError::Execution(
                ExecContext {
                    command: caravel_shell::format_command(&self.instances_command("describe")),
                    exit_code: None,
                    captured_output: Some("instance has no external address".to_owned()),
                    phase: Some("wait for instance".to_owned()),
                },
            ));
        };

        let path = ssh_config_path()?;
        let existing = std::fs::read_to_string(&path).unwrap_or_default();
        let updated = upsert_ssh_host(
            &existing,
            &self.gcp.instance.name,
            ip,
            self.gcp.authentication.user.as_deref(),
            self.gcp.authentication.identity_file.as_deref(),
        );
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| CaravelError::io(parent.display().to_string(), e))?;
        }
        std::fs::write(&path, updated)
            .map_err(|e| CaravelError::io(path.display().to_string(), e))?;
        info!(alias = %self.gcp.instance.name, ip, "updated ssh client configuration");
        Ok(())
    }
}

/// Extract the first JSON document from captured output. The cloud CLI
/// interleaves human-readable notes with its JSON rendering.
fn first_json_value(output: &str) -> Option<serde_json::Value> {
    let start = output.find('{')?;
    let mut stream = serde_json::Deserializer::from_str(&output[start..]);
    serde_json::Value::deserialize(&mut stream).ok()
}

/// The instance's public address, when one is attached.
fn external_ip(description: &serde_json::Value) -> Option<&str> {
    description["networkInterfaces"][0]["accessConfigs"][0]["natIP"].as_str()
}

fn ssh_config_path() -> CaravelResult<PathBuf> {
    directories::BaseDirs::new()
        .map(|d| d.home_dir().join(".ssh").join("config"))
        .ok_or_else(|| CaravelError::config("cannot determine the home directory"))
}

/// Replace (or append) one `Host` block in an SSH client configuration.
fn upsert_ssh_host(
    existing: &str,
    alias: &str,
    ip: &str,
    user: Option<&str>,
    identity: Option<&str>,
) -> String {
    let mut kept: Vec<&str> = Vec::new();
    let mut skipping = false;
    for line in existing.lines() {
        let trimmed = line.trim();
        if trimmed.strip_prefix("Host ").map(str::trim) == Some(alias) {
            skipping = true;
            continue;
        }
        if skipping && trimmed.starts_with("Host ") {
            skipping = false;
        }
        if !skipping {
            kept.push(line);
        }
    }

    let mut out = kept.join("\n");
    if !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
    out.push_str(&format!("Host {alias}\n    HostName {ip}\n"));
    if let Some(user) = user {
        out.push_str(&format!("    User {user}\n"));
    }
    if let Some(identity) = identity {
        out.push_str(&format!("    IdentityFile {identity}\n"));
    }
    out.push_str("    StrictHostKeyChecking accept-new\n");
    out
}

#[async_trait]
impl Runner for GcpRunner {
    async fn configure(&mut self) -> CaravelResult<()> {
        which::which("gcloud").map_err(|_| {
            CaravelError::config("`gcloud` is required but was not found on PATH")
        })?;
        self.activate_credentials().await?;

        let running = match self.describe_instance().await? {
            None => {
                self.create_instance().await?;
                self.wait_until_running().await?
            },
            Some(description) => {
                if description["status"].as_str() == Some("RUNNING") {
                    description
                } else {
                    self.start_instance().await?;
                    self.wait_until_running().await?
                }
            },
        };

        self.record_ssh_alias(&running)?;
        self.bootstrap().await?;
        self.delegate().configure().await
    }

    async fn run(&mut self) -> CaravelResult<()> {
        let mut delegate = self.delegate();
        delegate.run().await?;
        if self.gcp.stop_on_done {
            self.stop_instance().await?;
        }
        Ok(())
    }
}
