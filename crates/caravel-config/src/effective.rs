//! The effective-configuration builder.
//!
//! Builds the single configuration tree one command invocation runs
//! against: description ⊕ `-P` overrides ⊕ platform runner defaults,
//! runner-aware merge, parameter completion with type inference, and an
//! optional one-shot interpolation resolve. The result is immutable;
//! runners receive it by shared reference.

use std::path::{Path, PathBuf};

use caravel_core::{
    tree, CaravelError, CaravelResult, PackageDescription, ParamKind, Parameter,
};
use serde_yaml::{Mapping, Value};
use tracing::debug;

use crate::args::ParsedArgs;
use crate::hooks::RunnerHooks;
use crate::loader;

/// Inputs to one [`build_effective`] invocation.
pub struct BuildRequest<'a> {
    /// Package directory or description file.
    pub package: &'a Path,
    /// Classified free-form CLI arguments.
    pub args: &'a ParsedArgs,
    /// The selected platform's runner defaults (from system settings).
    pub runner_defaults: Value,
    /// The selected runner's merge/validate hooks.
    pub hooks: &'a dyn RunnerHooks,
    /// `--workspace` override, if any.
    pub workspace: Option<&'a Path>,
    /// Evaluate all interpolations after the merge.
    pub resolve: bool,
}

/// The merged, completed configuration for one command invocation.
///
/// Owned by the engine; runners must not mutate it after `configure`
/// returns, which the shared-reference API enforces.
#[derive(Debug, Clone)]
pub struct EffectiveConfig {
    tree: Value,
    description: PackageDescription,
    root: PathBuf,
    workspace: PathBuf,
}

impl EffectiveConfig {
    /// The full configuration tree.
    #[must_use]
    pub fn tree(&self) -> &Value {
        &self.tree
    }

    /// Typed view of the merged description.
    #[must_use]
    pub fn description(&self) -> &PackageDescription {
        &self.description
    }

    /// Absolute package root (`runtime.root`).
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute effective workspace (`runtime.workspace`).
    #[must_use]
    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    /// Whether the workspace lies inside the package root.
    #[must_use]
    pub fn workspace_is_internal(&self) -> bool {
        self.workspace.starts_with(&self.root)
    }

    /// The merged `runner` section (null when no platform participated).
    #[must_use]
    pub fn runner(&self) -> &Value {
        tree::get_path(&self.tree, "runner").unwrap_or(&Value::Null)
    }

    /// Deserialize the `runner` section into a runner's typed config.
    ///
    /// # Errors
    ///
    /// Returns a `configuration` error when the section does not match
    /// the runner's schema.
    pub fn runner_typed<T: serde::de::DeserializeOwned>(&self) -> CaravelResult<T> {
        serde_yaml::from_value(self.runner().clone())
            .map_err(|e| CaravelError::config(format!("runner section is invalid: {e}")))
    }

    /// The `runner` section rendered as YAML, for error context.
    #[must_use]
    pub fn runner_yaml(&self) -> String {
        serde_yaml::to_string(self.runner()).unwrap_or_else(|_| "<unrenderable>".to_owned())
    }

    /// The whole tree rendered as YAML (`show-config`).
    #[must_use]
    pub fn to_yaml(&self) -> String {
        serde_yaml::to_string(&self.tree).unwrap_or_else(|_| "<unrenderable>".to_owned())
    }
}

/// Replace workspace aliases (`${workspace}`, `$WORKSPACE`) in a string.
#[must_use]
pub fn expand_workspace(s: &str, workspace: &Path) -> String {
    let ws = workspace.display().to_string();
    s.replace("${workspace}", &ws).replace("$WORKSPACE", &ws)
}

/// Expand a leading `~` to the user's home directory.
#[must_use]
pub fn expand_home(s: &str) -> String {
    if s == "~" || s.starts_with("~/") {
        if let Some(base) = directories::BaseDirs::new() {
            let home = base.home_dir().display().to_string();
            return format!("{home}{}", &s[1..]);
        }
    }
    s.to_owned()
}

/// Resolve a parameter default to an absolute host path.
#[must_use]
pub fn resolve_host_path(default: &str, workspace: &Path) -> PathBuf {
    let expanded = expand_home(&expand_workspace(default, workspace));
    let path = PathBuf::from(&expanded);
    if path.is_absolute() {
        path
    } else {
        workspace.join(path)
    }
}

/// Build the effective configuration for one command invocation.
///
/// # Errors
///
/// Returns `configuration` errors for merge, validation, parameter
/// completion, or interpolation failures, and `io` errors for
/// unreadable package paths.
pub fn build_effective(req: &BuildRequest<'_>) -> CaravelResult<EffectiveConfig> {
    let (root, file) = loader::locate(req.package)?;
    let mut merged = loader::load(&file)?;

    // Description ← CLI overrides ← computed {runtime, runner} block.
    tree::deep_merge(&mut merged, &req.args.overrides);
    let computed = computed_block(&root, req.workspace, &req.runner_defaults);
    tree::deep_merge(&mut merged, &computed);

    // Runner-aware merge, then re-apply `-P` so it always wins.
    req.hooks.merge(&mut merged)?;
    tree::deep_merge(&mut merged, &req.args.overrides);

    // The workspace may itself have been overridden through `-P`.
    let workspace = effective_workspace(&merged, &root);
    tree::set_path(
        &mut merged,
        "runtime.workspace",
        Value::from(workspace.display().to_string()),
    );

    req.hooks
        .translate_switches(&req.args.switches, &mut merged)?;
    req.hooks.validate(&merged)?;

    complete_parameters(&mut merged, &workspace, req.args)?;

    if req.resolve {
        tree::map_strings(&mut merged, &|s: &str| {
            s.replace("${workspace}", "${runtime.workspace}")
                .replace("$WORKSPACE", "${runtime.workspace}")
        });
        tree::resolve(&mut merged)?;
    }

    let description = loader::typed_view(&merged)?;
    debug!(
        package = %description.name,
        root = %root.display(),
        workspace = %workspace.display(),
        "effective configuration built"
    );

    Ok(EffectiveConfig {
        tree: merged,
        description,
        root,
        workspace,
    })
}

/// The derived `{runtime, runner}` block merged over the description.
fn computed_block(root: &Path, workspace: Option<&Path>, runner_defaults: &Value) -> Value {
    let workspace = workspace.map_or_else(|| root.join("workspace"), absolutize);

    let mut block = Value::Mapping(Mapping::new());
    tree::set_path(
        &mut block,
        "runtime.root",
        Value::from(root.display().to_string()),
    );
    tree::set_path(
        &mut block,
        "runtime.workspace",
        Value::from(workspace.display().to_string()),
    );
    tree::set_path(&mut block, "runner", runner_defaults.clone());
    block
}

/// Read the post-merge workspace, absolute.
fn effective_workspace(merged: &Value, root: &Path) -> PathBuf {
    tree::get_str(merged, "runtime.workspace")
        .map_or_else(|| root.join("workspace"), |s| absolutize(Path::new(s)))
}

/// Make a path absolute against the current directory, without
/// requiring it to exist.
fn absolutize(path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    }
}

/// Ensure every parameter of every task carries explicit `default`,
/// `type`, and `opts`, applying task CLI overrides by parameter name.
fn complete_parameters(
    merged: &mut Value,
    workspace: &Path,
    args: &ParsedArgs,
) -> CaravelResult<()> {
    let mut used_overrides: Vec<&str> = Vec::new();

    let task_names: Vec<String> = match tree::get_path(merged, "tasks") {
        Some(Value::Mapping(tasks)) => tasks
            .keys()
            .filter_map(Value::as_str)
            .map(str::to_owned)
            .collect(),
        _ => Vec::new(),
    };

    for task in &task_names {
        // Names must be unique across the union of inputs and outputs.
        let inputs = param_names(merged, task, "inputs");
        for name in param_names(merged, task, "outputs") {
            if inputs.contains(&name) {
                return Err(CaravelError::config(format!(
                    "tasks.{task}: parameter `{name}` is declared as both input and output"
                )));
            }
        }

        for (io, is_output) in [("inputs", false), ("outputs", true)] {
            for name in param_names(merged, task, io) {
                let path = format!("tasks.{task}.parameters.{io}.{name}");
                let node = tree::get_path(merged, &path).cloned().unwrap_or(Value::Null);
                let mut param: Parameter = if node.is_null() {
                    Parameter {
                        kind: ParamKind::Unknown,
                        default: None,
                        opts: None,
                    }
                } else {
                    serde_yaml::from_value(node).map_err(|e| {
                        CaravelError::config(format!("{path}: malformed parameter: {e}"))
                    })?
                };

                if let Some((key, value)) = args.task_params.get_key_value(name.as_str()) {
                    param.default = Some(value.clone());
                    used_overrides.push(key.as_str());
                }

                let default = param.default.clone().filter(|d| !d.is_empty()).ok_or_else(
                    || CaravelError::config(format!("{path}: `default` is required")),
                )?;

                let host = resolve_host_path(&default, workspace);
                let kind = param.infer_kind(&host);
                if kind == ParamKind::Unknown {
                    return Err(CaravelError::config(format!(
                        "{path}: cannot infer type from `{default}`; declare `type` \
                         explicitly or end a directory default with a path separator"
                    )));
                }

                let explicit = Parameter {
                    kind,
                    default: Some(default),
                    opts: Some(param.access(is_output)),
                };
                let node = serde_yaml::to_value(&explicit).map_err(|e| {
                    CaravelError::internal(format!("{path}: cannot serialize parameter: {e}"))
                })?;
                tree::set_path(merged, &path, node);
            }
        }
    }

    if let Some(unknown) = args
        .task_params
        .keys()
        .find(|k| !used_overrides.contains(&k.as_str()))
    {
        return Err(CaravelError::config(format!(
            "`--{unknown}=...` matches no declared task parameter"
        )));
    }

    Ok(())
}

/// Parameter names of one side of a task, in declaration order.
fn param_names(merged: &Value, task: &str, io: &str) -> Vec<String> {
    match tree::get_path(merged, &format!("tasks.{task}.parameters.{io}")) {
        Some(Value::Mapping(params)) => params
            .keys()
            .filter_map(Value::as_str)
            .map(str::to_owned)
            .collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::RunnerHooks;
    use caravel_core::{AccessMode, DESCRIPTION_FILE};

    struct ContainerHooks;

    impl RunnerHooks for ContainerHooks {
        fn kind(&self) -> &'static str {
            "container"
        }

        fn validate(&self, root: &Value) -> CaravelResult<()> {
            if tree::get_str(root, "runner.image").is_none() {
                return Err(CaravelError::config("runner.image is required"));
            }
            Ok(())
        }
    }

    const DESCRIPTION: &str = r"
name: mnist
version: 0.0.1
container:
  image: mlcommons/mnist:0.0.1
tasks:
  process:
    parameters:
      inputs:
        input_dir:
          type: directory
          default: input
      outputs:
        output_dir:
          type: directory
          default: output
";

    fn defaults() -> Value {
        serde_yaml::from_str("executable: docker\nbuild_strategy: pull\n").unwrap()
    }

    fn package(yaml: &str) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(DESCRIPTION_FILE), yaml).unwrap();
        std::fs::create_dir_all(dir.path().join("workspace")).unwrap();
        dir
    }

    fn build(dir: &Path, extra: &[&str], resolve: bool) -> CaravelResult<EffectiveConfig> {
        let extra: Vec<String> = extra.iter().map(|s| (*s).to_owned()).collect();
        let args = ParsedArgs::parse(&extra)?;
        build_effective(&BuildRequest {
            package: dir,
            args: &args,
            runner_defaults: defaults(),
            hooks: &ContainerHooks,
            workspace: None,
            resolve,
        })
    }

    #[test]
    fn test_description_section_reaches_runner() {
        let dir = package(DESCRIPTION);
        let config = build(dir.path(), &[], false).unwrap();
        assert_eq!(
            tree::get_str(config.tree(), "runner.image"),
            Some("mlcommons/mnist:0.0.1")
        );
        assert_eq!(
            tree::get_str(config.tree(), "runner.executable"),
            Some("docker")
        );
    }

    #[test]
    fn test_cli_override_wins_over_description() {
        let dir = package(DESCRIPTION);
        let config = build(
            dir.path(),
            &["-Pcontainer.image=mlcommons/mnist:0.0.2"],
            false,
        )
        .unwrap();
        assert_eq!(
            tree::get_str(config.tree(), "runner.image"),
            Some("mlcommons/mnist:0.0.2")
        );
    }

    #[test]
    fn test_cli_override_wins_over_runner_default() {
        let dir = package(DESCRIPTION);
        let config = build(dir.path(), &["-Prunner.executable=podman"], false).unwrap();
        assert_eq!(
            tree::get_str(config.tree(), "runner.executable"),
            Some("podman")
        );
    }

    #[test]
    fn test_parameters_made_explicit() {
        let dir = package(DESCRIPTION);
        let config = build(dir.path(), &[], false).unwrap();
        let param = &config.description().tasks["process"].parameters.inputs["input_dir"];
        assert_eq!(param.kind, caravel_core::ParamKind::Directory);
        assert_eq!(param.opts, Some(AccessMode::Ro));
        let out = &config.description().tasks["process"].parameters.outputs["output_dir"];
        assert_eq!(out.opts, Some(AccessMode::Rw));
    }

    #[test]
    fn test_task_param_override_replaces_default() {
        let dir = package(DESCRIPTION);
        let config = build(dir.path(), &["--input_dir=/datasets/mnist"], false).unwrap();
        let param = &config.description().tasks["process"].parameters.inputs["input_dir"];
        assert_eq!(param.default.as_deref(), Some("/datasets/mnist"));
    }

    #[test]
    fn test_unknown_task_param_rejected() {
        let dir = package(DESCRIPTION);
        let err = build(dir.path(), &["--nonexistent=1"], false).unwrap_err();
        assert!(err.to_string().contains("nonexistent"));
    }

    #[test]
    fn test_output_with_uninferable_type_rejected() {
        let dir = package(
            "name: demo\ncontainer:\n  image: i\ntasks:\n  t:\n    parameters:\n      outputs:\n        out: result\n",
        );
        let err = build(dir.path(), &[], false).unwrap_err();
        assert!(err.to_string().contains("cannot infer type"));
    }

    #[test]
    fn test_trailing_separator_infers_directory() {
        let dir = package(
            "name: demo\ncontainer:\n  image: i\ntasks:\n  t:\n    parameters:\n      outputs:\n        out: result/\n",
        );
        let config = build(dir.path(), &[], false).unwrap();
        let param = &config.description().tasks["t"].parameters.outputs["out"];
        assert_eq!(param.kind, caravel_core::ParamKind::Directory);
    }

    #[test]
    fn test_duplicate_parameter_name_rejected() {
        let dir = package(
            "name: demo\ncontainer:\n  image: i\ntasks:\n  t:\n    parameters:\n      inputs:\n        data: in/\n      outputs:\n        data: out/\n",
        );
        let err = build(dir.path(), &[], false).unwrap_err();
        assert!(err.to_string().contains("both input and output"));
    }

    #[test]
    fn test_runtime_paths_set() {
        let dir = package(DESCRIPTION);
        let config = build(dir.path(), &[], false).unwrap();
        assert!(config.root().is_absolute());
        assert_eq!(config.workspace(), config.root().join("workspace"));
        assert!(config.workspace_is_internal());
    }

    #[test]
    fn test_resolve_workspace_alias() {
        let dir = package(
            "name: demo\ncontainer:\n  image: i\ntasks:\n  t:\n    parameters:\n      outputs:\n        out:\n          type: directory\n          default: '${workspace}/result'\n",
        );
        let config = build(dir.path(), &[], true).unwrap();
        let param = &config.description().tasks["t"].parameters.outputs["out"];
        let expected = format!("{}/result", config.workspace().display());
        assert_eq!(param.default.as_deref(), Some(expected.as_str()));
    }

    #[test]
    fn test_validate_hook_failure_propagates() {
        let dir = package("name: demo\ntasks:\n  ls: {}\n");
        let err = build(dir.path(), &[], false).unwrap_err();
        assert!(err.to_string().contains("runner.image"));
    }

    #[test]
    fn test_resolved_config_is_stable() {
        let dir = package(DESCRIPTION);
        let first = build(dir.path(), &[], true).unwrap();
        let second = build(dir.path(), &[], true).unwrap();
        assert_eq!(first.to_yaml(), second.to_yaml());
    }
}
