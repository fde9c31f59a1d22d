//! The parameter-binding algorithm.
//!
//! Walks a task's declared inputs then outputs and turns each parameter
//! into a host bind unit, a stable in-container path, and a task
//! argument. Directory parameters bind the directory itself; file
//! parameters bind the parent directory and pass the file name through.
//! Bind units are numbered `/mnt/io<N>` in first-seen order, so the
//! result is reproducible for an unchanged configuration.

use std::path::{Path, PathBuf};

use caravel_config::effective::{resolve_host_path, EffectiveConfig};
use caravel_core::{AccessMode, CaravelError, CaravelResult, ParamKind, Parameter};
use indexmap::IndexMap;
use tracing::debug;

/// The output of [`generate_mounts`]: host→container bind mapping,
/// per-bind access modes, and the task argument list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MountPlan {
    /// Host bind unit → in-container directory.
    pub mounts: IndexMap<PathBuf, String>,
    /// Host bind unit → access mode (`rw` wins on conflict).
    pub modes: IndexMap<PathBuf, AccessMode>,
    /// Task arguments, task name first unless the task declares its own
    /// entrypoint.
    pub args: Vec<String>,
}

/// Generate mounts and task arguments for one task.
///
/// # Errors
///
/// Returns a `configuration` error for missing required inputs and for
/// parameters whose type cannot be resolved, and an `io` error when an
/// output directory cannot be created.
pub fn generate_mounts(config: &EffectiveConfig, task: &str) -> CaravelResult<MountPlan> {
    let definition = config.description().task(task)?;
    let workspace = config.workspace();

    let mut plan = MountPlan::default();
    if definition.entrypoint.is_none() {
        plan.args.push(task.to_owned());
    }

    for (params, is_output) in [
        (&definition.parameters.inputs, false),
        (&definition.parameters.outputs, true),
    ] {
        for (name, param) in params {
            bind_parameter(&mut plan, task, name, param, is_output, workspace)?;
        }
    }

    debug!(task, mounts = plan.mounts.len(), "generated mounts");
    Ok(plan)
}

/// Bind one parameter: classify, ensure the host side, allocate the
/// container path, record the access mode, and emit the argument.
fn bind_parameter(
    plan: &mut MountPlan,
    task: &str,
    name: &str,
    param: &Parameter,
    is_output: bool,
    workspace: &Path,
) -> CaravelResult<()> {
    let label = || format!("tasks.{task}.parameters.{}.{name}", io_side(is_output));

    let Some(default) = &param.default else {
        return Err(CaravelError::internal(format!(
            "{}: parameter reached execution without a default",
            label()
        )));
    };
    let host = resolve_host_path(default, workspace);

    let kind = match param.infer_kind(&host) {
        ParamKind::Unknown if is_output => {
            return Err(CaravelError::config(format!(
                "{}: output type is still unknown; declare `type` explicitly",
                label()
            )));
        },
        ParamKind::Unknown => {
            return Err(CaravelError::config(format!(
                "{}: missing required input `{}`",
                label(),
                host.display()
            )));
        },
        kind => kind,
    };

    let bind_unit = match kind {
        ParamKind::Directory => host.clone(),
        ParamKind::File | ParamKind::Unknown => host
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| {
                CaravelError::config(format!("{}: file path has no parent directory", label()))
            })?,
    };

    ensure_host_side(&bind_unit, &host, kind, is_output, &label)?;

    let container_dir = match plan.mounts.get(&bind_unit) {
        Some(existing) => existing.clone(),
        None => {
            let dst = match kind {
                ParamKind::Directory => format!(
                    "/mnt/io{}/{}",
                    plan.mounts.len(),
                    basename(&bind_unit)
                ),
                _ => format!("/mnt/io{}", plan.mounts.len()),
            };
            plan.mounts.insert(bind_unit.clone(), dst.clone());
            dst
        },
    };

    let mode = if is_output {
        AccessMode::Rw
    } else {
        param.access(false)
    };
    match plan.modes.get_mut(&bind_unit) {
        Some(existing) => {
            if mode == AccessMode::Rw && *existing == AccessMode::Ro {
                debug!(bind = %bind_unit.display(), "upgrading bind to rw");
                *existing = AccessMode::Rw;
            }
        },
        None => {
            plan.modes.insert(bind_unit, mode);
        },
    }

    let container_path = match kind {
        ParamKind::Directory => container_dir,
        _ => format!("{container_dir}/{}", basename(&host)),
    };
    plan.args.push(format!("--{name}={container_path}"));
    Ok(())
}

/// Create output directories; require input paths to exist.
fn ensure_host_side(
    bind_unit: &Path,
    host: &Path,
    kind: ParamKind,
    is_output: bool,
    label: &impl Fn() -> String,
) -> CaravelResult<()> {
    if is_output {
        return std::fs::create_dir_all(bind_unit)
            .map_err(|e| CaravelError::io(bind_unit.display().to_string(), e));
    }
    let present = match kind {
        ParamKind::Directory => host.is_dir(),
        _ => host.is_file(),
    };
    if !present {
        return Err(CaravelError::config(format!(
            "{}: missing required input `{}`",
            label(),
            host.display()
        )));
    }
    Ok(())
}

fn io_side(is_output: bool) -> &'static str {
    if is_output {
        "outputs"
    } else {
        "inputs"
    }
}

fn basename(path: &Path) -> String {
    path.file_name()
        .map_or_else(|| "root".to_owned(), |n| n.to_string_lossy().into_owned())
}
