//! External-workspace materialization.
//!
//! When the user points `--workspace` outside the package, the inputs a
//! task needs are copied from the package's internal workspace into the
//! external one before the task runs. Copies happen only when the
//! destination is missing; an existing destination is never touched,
//! even when the internal copy differs.

use std::path::{Path, PathBuf};

use caravel_config::effective::EffectiveConfig;
use caravel_core::{CaravelError, CaravelResult};
use tracing::debug;

/// Materialize a task's inputs into an external workspace.
///
/// A no-op when the effective workspace is the internal one. Parameters
/// whose defaults are absolute paths unrelated to the workspace are
/// skipped: they are not workspace artifacts.
///
/// # Errors
///
/// Returns an `io` error when a copy or directory creation fails, and a
/// `configuration` error for an unknown task.
pub fn sync_workspace(config: &EffectiveConfig, task: &str) -> CaravelResult<()> {
    if config.workspace_is_internal() {
        return Ok(());
    }

    let definition = config.description().task(task)?;
    let internal = config.root().join("workspace");
    let external = config.workspace();

    for (name, param) in &definition.parameters.inputs {
        let Some(default) = &param.default else {
            continue;
        };
        let Some(relative) = workspace_relative(default) else {
            debug!(param = name, "input is not a workspace artifact; skipping");
            continue;
        };

        let src = internal.join(&relative);
        let dst = external.join(&relative);
        if !src.exists() {
            debug!(src = %src.display(), "no internal copy; skipping");
            continue;
        }
        if dst.exists() {
            debug!(dst = %dst.display(), "destination exists; never overwriting");
            continue;
        }

        if let Some(parent) = dst.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| CaravelError::io(parent.display().to_string(), e))?;
        }
        copy_recursively(&src, &dst)?;
        debug!(src = %src.display(), dst = %dst.display(), "materialized input");
    }

    Ok(())
}

/// Interpret a parameter default as a workspace-relative path, if it is
/// one. `${workspace}`-prefixed and plain relative defaults qualify.
fn workspace_relative(default: &str) -> Option<PathBuf> {
    for prefix in ["${workspace}", "$WORKSPACE"] {
        if let Some(rest) = default.strip_prefix(prefix) {
            return Some(PathBuf::from(rest.trim_start_matches('/')));
        }
    }
    let path = PathBuf::from(default);
    if path.is_absolute() {
        None
    } else {
        Some(path)
    }
}

/// Copy a file, or a directory tree, to a destination that does not
/// exist yet.
fn copy_recursively(src: &Path, dst: &Path) -> CaravelResult<()> {
    let io_err = |path: &Path, e: std::io::Error| CaravelError::io(path.display().to_string(), e);

    if src.is_file() {
        std::fs::copy(src, dst).map_err(|e| io_err(dst, e))?;
        return Ok(());
    }

    std::fs::create_dir_all(dst).map_err(|e| io_err(dst, e))?;
    for entry in std::fs::read_dir(src).map_err(|e| io_err(src, e))? {
        let entry = entry.map_err(|e| io_err(src, e))?;
        let target = dst.join(entry.file_name());
        copy_recursively(&entry.path(), &target)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use caravel_config::effective::{build_effective, BuildRequest};
    use caravel_config::hooks::NoRunner;
    use caravel_config::ParsedArgs;
    use caravel_core::DESCRIPTION_FILE;
    use serde_yaml::Value;

    fn build_config(dir: &Path, workspace: Option<&Path>, description: &str) -> EffectiveConfig {
        std::fs::write(dir.join(DESCRIPTION_FILE), description).unwrap();
        build_effective(&BuildRequest {
            package: dir,
            args: &ParsedArgs::default(),
            runner_defaults: Value::Null,
            hooks: &NoRunner,
            workspace,
            resolve: false,
        })
        .unwrap()
    }

    const DESCRIPTION: &str = "name: demo\ntasks:\n  t:\n    parameters:\n      inputs:\n        data:\n          type: directory\n          default: data\n        params:\n          type: file\n          default: parameters.yaml\n";

    #[test]
    fn test_internal_workspace_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("workspace")).unwrap();
        let config = build_config(dir.path(), None, DESCRIPTION);
        sync_workspace(&config, "t").unwrap();
    }

    #[test]
    fn test_inputs_copied_to_external_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let internal = dir.path().join("workspace");
        std::fs::create_dir_all(internal.join("data")).unwrap();
        std::fs::write(internal.join("data/train.csv"), "1,2\n").unwrap();
        std::fs::write(internal.join("parameters.yaml"), "lr: 0.01\n").unwrap();

        let external = tempfile::tempdir().unwrap();
        let config = build_config(dir.path(), Some(external.path()), DESCRIPTION);
        sync_workspace(&config, "t").unwrap();

        assert!(external.path().join("data/train.csv").is_file());
        assert!(external.path().join("parameters.yaml").is_file());
    }

    #[test]
    fn test_existing_destination_not_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let internal = dir.path().join("workspace");
        std::fs::create_dir_all(&internal).unwrap();
        std::fs::write(internal.join("parameters.yaml"), "lr: 0.01\n").unwrap();

        let external = tempfile::tempdir().unwrap();
        std::fs::write(external.path().join("parameters.yaml"), "lr: 0.99\n").unwrap();

        let config = build_config(dir.path(), Some(external.path()), DESCRIPTION);
        sync_workspace(&config, "t").unwrap();

        let kept = std::fs::read_to_string(external.path().join("parameters.yaml")).unwrap();
        assert_eq!(kept, "lr: 0.99\n");
    }

    #[test]
    fn test_absolute_defaults_skipped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("workspace")).unwrap();
        let external = tempfile::tempdir().unwrap();
        let description = "name: demo\ntasks:\n  t:\n    parameters:\n      inputs:\n        data:\n          type: directory\n          default: /datasets/shared\n";
        let config = build_config(dir.path(), Some(external.path()), description);
        sync_workspace(&config, "t").unwrap();
        assert_eq!(std::fs::read_dir(external.path()).unwrap().count(), 0);
    }
}
