//! Kubernetes runner.
//!
//! Renders a BatchV1 Job manifest around the task: one container, one
//! PVC-backed volume holding the workspace, no restarts. Parameter
//! defaults are interpreted relative to the workspace (the PVC) and
//! rewritten to in-container paths under the volume mount prefix. The
//! manifest is submitted through the cluster CLI; `configure` is a
//! no-op for this substrate.

use std::sync::Arc;

use async_trait::async_trait;
use caravel_config::{EffectiveConfig, RunnerHooks};
use caravel_core::{tree, CaravelError, CaravelResult, ExecContext};
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use tracing::{debug, info};

use crate::registry::RunnerPlugin;
use crate::Runner;

/// Registry entry for this runner kind.
#[must_use]
pub(crate) fn plugin() -> RunnerPlugin {
    RunnerPlugin {
        kind: "k8s",
        defaults: DEFAULTS,
        hooks: || Box::new(K8sHooks),
        factory: |config, task| Ok(Box::new(K8sRunner::new(&config, task)?)),
    }
}

const DEFAULTS: &str = "\
image: ''
pvc: ''
namespace: default
volume_mount_prefix: /mnt/workspace
";

/// Restart attempts before the Job is marked failed.
const BACKOFF_LIMIT: u32 = 2;

/// The merged `runner` section for this kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct K8sConfig {
    /// Image reference; required.
    pub image: String,
    /// Persistent-volume-claim name holding the workspace; required.
    pub pvc: String,
    /// Namespace the Job is created in.
    pub namespace: String,
    /// In-container prefix the PVC is mounted under.
    pub volume_mount_prefix: String,
}

impl Default for K8sConfig {
    fn default() -> Self {
        Self {
            image: String::new(),
            pvc: String::new(),
            namespace: "default".to_owned(),
            volume_mount_prefix: "/mnt/workspace".to_owned(),
        }
    }
}

/// Configuration hooks for the k8s kind.
pub struct K8sHooks;

impl RunnerHooks for K8sHooks {
    fn kind(&self) -> &'static str {
        "k8s"
    }

    fn validate(&self, root: &Value) -> CaravelResult<()> {
        let runner = tree::get_path(root, "runner").cloned().unwrap_or(Value::Null);
        let config: K8sConfig = serde_yaml::from_value(runner)
            .map_err(|e| CaravelError::config(format!("k8s runner section: {e}")))?;
        if config.image.is_empty() {
            return Err(CaravelError::config("k8s runner requires `image`"));
        }
        if config.pvc.is_empty() {
            return Err(CaravelError::config(
                "k8s runner requires `pvc` (the claim that holds the workspace)",
            ));
        }
        Ok(())
    }
}

// Job manifest shape, BatchV1. Only the fields this runner sets.

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct JobManifest {
    api_version: &'static str,
    kind: &'static str,
    metadata: Metadata,
    spec: JobSpec,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Metadata {
    generate_name: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct JobSpec {
    backoff_limit: u32,
    template: PodTemplate,
}

#[derive(Serialize)]
struct PodTemplate {
    spec: PodSpec,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PodSpec {
    containers: Vec<Container>,
    restart_policy: &'static str,
    volumes: Vec<VolumeSpec>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Container {
    name: String,
    image: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    command: Option<Vec<String>>,
    args: Vec<String>,
    volume_mounts: Vec<VolumeMount>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct VolumeMount {
    name: String,
    mount_path: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct VolumeSpec {
    name: String,
    persistent_volume_claim: PvcSource,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PvcSource {
    claim_name: String,
}

/// Runner for the Kubernetes substrate.
pub struct K8sRunner {
    config: Arc<EffectiveConfig>,
    k8s: K8sConfig,
    task: Option<String>,
}

impl K8sRunner {
    /// Construct from an effective configuration and an optional bound
    /// task.
    ///
    /// # Errors
    ///
    /// Returns a `configuration` error when the `runner` section does
    /// not match this kind's schema.
    pub fn new(config: &Arc<EffectiveConfig>, task: Option<String>) -> CaravelResult<Self> {
        let k8s: K8sConfig = config.runner_typed()?;
        Ok(Self {
            config: Arc::clone(config),
            k8s,
            task,
        })
    }

    /// In-container path for one parameter default. Defaults are
    /// workspace-relative; the workspace is the PVC.
    fn container_path(&self, default: &str) -> String {
        let relative = default
            .strip_prefix("${workspace}")
            .or_else(|| default.strip_prefix("$WORKSPACE"))
            .unwrap_or(default)
            .trim_start_matches('/');
        format!(
            "{}/{}/{relative}",
            self.k8s.volume_mount_prefix.trim_end_matches('/'),
            self.k8s.pvc
        )
    }

    /// Container args for a task: the task name (unless a custom
    /// entrypoint is set) followed by one `--param=path` per parameter.
    fn container_args(&self, task: &str) -> CaravelResult<Vec<String>> {
        let definition = self.config.description().task(task)?;
        let mut args = Vec::new();
        if definition.entrypoint.is_none() {
            args.push(task.to_owned());
        }
        for params in [
            &definition.parameters.inputs,
            &definition.parameters.outputs,
        ] {
            for (name, param) in params {
                let Some(default) = &param.default else {
                    return Err(CaravelError::internal(format!(
                        "parameter `{name}` reached execution without a default"
                    )));
                };
                args.push(format!("--{name}={}", self.container_path(default)));
            }
        }
        Ok(args)
    }

    fn manifest(&self, task: &str) -> CaravelResult<JobManifest> {
        let definition = self.config.description().task(task)?;
        let mount_path = format!(
            "{}/{}",
            self.k8s.volume_mount_prefix.trim_end_matches('/'),
            self.k8s.pvc
        );
        Ok(JobManifest {
            api_version: "batch/v1",
            kind: "Job",
            metadata: Metadata {
                generate_name: format!("{}-", self.config.description().name),
            },
            spec: JobSpec {
                backoff_limit: BACKOFF_LIMIT,
                template: PodTemplate {
                    spec: PodSpec {
                        containers: vec![Container {
                            name: self.config.description().name.clone(),
                            image: self.k8s.image.clone(),
                            command: definition.entrypoint.clone().map(|e| vec![e]),
                            args: self.container_args(task)?,
                            volume_mounts: vec![VolumeMount {
                                name: "workspace".to_owned(),
                                mount_path,
                            }],
                        }],
                        restart_policy: "Never",
                        volumes: vec![VolumeSpec {
                            name: "workspace".to_owned(),
                            persistent_volume_claim: PvcSource {
                                claim_name: self.k8s.pvc.clone(),
                            },
                        }],
                    },
                },
            },
        })
    }

    fn render_manifest(&self, task: &str) -> CaravelResult<String> {
        serde_yaml::to_string(&self.manifest(task)?)
            .map_err(|e| CaravelError::internal(format!("cannot render job manifest: {e}")))
    }
}

#[async_trait]
impl Runner for K8sRunner {
    async fn configure(&mut self) -> CaravelResult<()> {
        debug!("nothing to configure for the k8s substrate");
        Ok(())
    }

    async fn run(&mut self) -> CaravelResult<()> {
        which::which("kubectl").map_err(|_| {
            CaravelError::config("`kubectl` is required but was not found on PATH")
        })?;

        let task = self
            .config
            .description()
            .select_task(self.task.as_deref())?;
        let manifest = self.render_manifest(&task)?;

        let staged = tempfile::NamedTempFile::new()
            .map_err(|e| CaravelError::io("job manifest".to_owned(), e))?;
        std::fs::write(staged.path(), &manifest)
            .map_err(|e| CaravelError::io(staged.path().display().to_string(), e))?;

        let command = vec![
            "kubectl".to_owned(),
            "--namespace".to_owned(),
            self.k8s.namespace.clone(),
            "create".to_owned(),
            "-f".to_owned(),
            staged.path().display().to_string(),
        ];
        info!(task = %task, namespace = %self.k8s.namespace, "submitting job");
        let (code, output) = caravel_shell::run_and_capture(&command).await?;
        if code != 0 {
            // Carry the rendered runner section: cluster rejections are
            // usually configuration mistakes on this side.
            return Err(CaravelError::Execution(
                ExecContext::new(caravel_shell::format_command(&command), code).with_output(format!(
                    "{output}\nrunner section:\n{}",
                    self.config.runner_yaml()
                )),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use caravel_config::effective::{build_effective, BuildRequest};
    use caravel_config::ParsedArgs;
    use caravel_core::DESCRIPTION_FILE;

    fn runner(task: Option<&str>) -> K8sRunner {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(DESCRIPTION_FILE),
            "name: mnist\nk8s:\n  image: mlcommons/mnist:0.0.1\n  pvc: workspace-claim\ntasks:\n  train:\n    parameters:\n      inputs:\n        data_dir:\n          type: directory\n          default: data\n      outputs:\n        model_dir:\n          type: directory\n          default: model\n",
        )
        .unwrap();
        std::fs::create_dir_all(dir.path().join("workspace/data")).unwrap();
        let plugin = plugin();
        let config = build_effective(&BuildRequest {
            package: dir.path(),
            args: &ParsedArgs::default(),
            runner_defaults: plugin.default_config().unwrap(),
            hooks: &K8sHooks,
            workspace: None,
            resolve: false,
        })
        .unwrap();
        K8sRunner::new(&Arc::new(config), task.map(str::to_owned)).unwrap()
    }

    #[test]
    fn test_container_paths_under_pvc() {
        let runner = runner(Some("train"));
        assert_eq!(
            runner.container_path("data"),
            "/mnt/workspace/workspace-claim/data"
        );
        assert_eq!(
            runner.container_path("${workspace}/data"),
            "/mnt/workspace/workspace-claim/data"
        );
    }

    #[test]
    fn test_container_args() {
        let runner = runner(Some("train"));
        assert_eq!(
            runner.container_args("train").unwrap(),
            vec![
                "train".to_owned(),
                "--data_dir=/mnt/workspace/workspace-claim/data".to_owned(),
                "--model_dir=/mnt/workspace/workspace-claim/model".to_owned(),
            ]
        );
    }

    #[test]
    fn test_manifest_shape() {
        let runner = runner(Some("train"));
        let rendered = runner.render_manifest("train").unwrap();
        assert!(rendered.contains("apiVersion: batch/v1"));
        assert!(rendered.contains("kind: Job"));
        assert!(rendered.contains("generateName: mnist-"));
        assert!(rendered.contains("restartPolicy: Never"));
        assert!(rendered.contains("backoffLimit: 2"));
        assert!(rendered.contains("claimName: workspace-claim"));
        assert!(rendered.contains("mountPath: /mnt/workspace/workspace-claim"));
        assert!(!rendered.contains("command:"));
    }

    #[test]
    fn test_validate_requires_pvc() {
        let err = K8sHooks
            .validate(&serde_yaml::from_str("runner:\n  image: i\n").unwrap())
            .unwrap_err();
        assert!(err.to_string().contains("pvc"));
    }
}
