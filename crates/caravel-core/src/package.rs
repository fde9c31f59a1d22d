//! Package description model.
//!
//! A Caravel package is a self-describing directory rooted at a YAML
//! description file (conventionally `caravel.yaml`). The description
//! declares the package identity, advisory hardware expectations,
//! optional per-runner sections, and an ordered map of tasks. Tasks and
//! parameters keep declaration order: mount numbering depends on it.

use std::path::Path;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::{CaravelError, CaravelResult};

/// Conventional name of the description file inside a package directory.
pub const DESCRIPTION_FILE: &str = "caravel.yaml";

/// Declared kind of a task parameter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamKind {
    /// The parameter is a single file; its parent directory is mounted.
    File,
    /// The parameter is a directory, mounted as-is.
    Directory,
    /// Not declared; resolved by inspecting the default value.
    #[default]
    Unknown,
}

impl std::fmt::Display for ParamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::File => f.write_str("file"),
            Self::Directory => f.write_str("directory"),
            Self::Unknown => f.write_str("unknown"),
        }
    }
}

/// Mount access mode for a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessMode {
    /// Read-only bind.
    Ro,
    /// Read-write bind.
    Rw,
}

impl std::fmt::Display for AccessMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ro => f.write_str("ro"),
            Self::Rw => f.write_str("rw"),
        }
    }
}

/// A task input or output.
///
/// Declared either as a bare default string (`input_dir: input/`) or as
/// a mapping with explicit `type`, `default`, and `opts` fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Parameter {
    /// Declared kind, `unknown` until inference runs.
    #[serde(rename = "type")]
    pub kind: ParamKind,
    /// Default host path, possibly relative to the workspace and
    /// possibly referencing `${workspace}`.
    pub default: Option<String>,
    /// Explicit access mode; inputs default to `ro`, outputs to `rw`.
    pub opts: Option<AccessMode>,
}

impl<'de> Deserialize<'de> for Parameter {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Decl {
            Bare(String),
            Full {
                #[serde(rename = "type", default)]
                kind: ParamKind,
                #[serde(default)]
                default: Option<String>,
                #[serde(default)]
                opts: Option<AccessMode>,
            },
        }

        Ok(match Decl::deserialize(deserializer)? {
            Decl::Bare(default) => Self {
                kind: ParamKind::Unknown,
                default: Some(default),
                opts: None,
            },
            Decl::Full {
                kind,
                default,
                opts,
            } => Self {
                kind,
                default,
                opts,
            },
        })
    }
}

impl Parameter {
    /// Effective access mode: the declared `opts`, else `ro` for inputs
    /// and `rw` for outputs.
    #[must_use]
    pub fn access(&self, is_output: bool) -> AccessMode {
        self.opts.unwrap_or(if is_output {
            AccessMode::Rw
        } else {
            AccessMode::Ro
        })
    }

    /// Resolve an `unknown` kind by inspecting the default value and the
    /// resolved host path.
    ///
    /// A default ending in a path separator is a directory; otherwise an
    /// existing path contributes its on-disk kind. Returns `Unknown`
    /// when neither rule applies.
    #[must_use]
    pub fn infer_kind(&self, resolved: &Path) -> ParamKind {
        if self.kind != ParamKind::Unknown {
            return self.kind;
        }
        if let Some(default) = &self.default {
            if default.ends_with('/') || default.ends_with(std::path::MAIN_SEPARATOR) {
                return ParamKind::Directory;
            }
        }
        if resolved.is_dir() {
            ParamKind::Directory
        } else if resolved.is_file() {
            ParamKind::File
        } else {
            ParamKind::Unknown
        }
    }
}

/// The inputs and outputs of a task, in declaration order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParamSet {
    /// Input parameters.
    pub inputs: IndexMap<String, Parameter>,
    /// Output parameters.
    pub outputs: IndexMap<String, Parameter>,
}

/// A named operation declared by the package.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Task {
    /// Overrides the image entrypoint for this task. When absent, the
    /// image entrypoint receives the task name as its first argument.
    pub entrypoint: Option<String>,
    /// Declared inputs and outputs.
    pub parameters: ParamSet,
}

/// Advisory hardware expectations declared by the package.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HardwareExpectations {
    /// Number of accelerators the workload expects.
    pub accelerator_count: Option<u32>,
    /// Accelerator family (free-form, e.g. a GPU product name).
    pub accelerator_type: Option<String>,
    /// Expected memory, free-form (e.g. `"16Gb"`).
    pub memory: Option<String>,
    /// Expected disk space, free-form.
    pub disk: Option<String>,
}

/// Typed view of the on-disk package declaration.
///
/// Per-runner sections are not part of this view: they stay in the raw
/// configuration tree and are interpreted by the selected runner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageDescription {
    /// Package identity.
    pub name: String,
    /// Package version.
    #[serde(default)]
    pub version: String,
    /// Advisory hardware expectations.
    #[serde(default)]
    pub platform: Option<HardwareExpectations>,
    /// Declared tasks, in declaration order.
    #[serde(default)]
    pub tasks: IndexMap<String, Task>,
}

impl PackageDescription {
    /// Look up a declared task.
    ///
    /// # Errors
    ///
    /// Returns a `configuration` error naming the unknown task.
    pub fn task(&self, name: &str) -> CaravelResult<&Task> {
        self.tasks.get(name).ok_or_else(|| {
            CaravelError::config(format!(
                "task `{name}` is not declared in the package (declared: {})",
                self.task_names().join(", ")
            ))
        })
    }

    /// Select the task to execute.
    ///
    /// A requested name must exist. With no request, a single declared
    /// task is selected implicitly; any other count fails.
    ///
    /// # Errors
    ///
    /// Returns a `configuration` error for an unknown task name or an
    /// ambiguous implicit selection.
    pub fn select_task(&self, requested: Option<&str>) -> CaravelResult<String> {
        if let Some(name) = requested {
            self.task(name)?;
            return Ok(name.to_owned());
        }
        match self.tasks.len() {
            1 => Ok(self
                .tasks
                .keys()
                .next()
                .map(String::clone)
                .unwrap_or_default()),
            0 => Err(CaravelError::config("the package declares no tasks")),
            _ => Err(CaravelError::config(format!(
                "no task selected and the package declares several; pass --task with one of: {}",
                self.task_names().join(", ")
            ))),
        }
    }

    /// Names of all declared tasks, in declaration order.
    #[must_use]
    pub fn task_names(&self) -> Vec<String> {
        self.tasks.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DESCRIPTION: &str = r"
name: mnist
version: 0.0.1
platform:
  accelerator_count: 1
tasks:
  download:
    parameters:
      outputs:
        data_dir: data/
  train:
    parameters:
      inputs:
        data_dir: data/
        parameters_file:
          type: file
          default: parameters.yaml
      outputs:
        model_dir:
          type: directory
          default: model
          opts: rw
";

    fn description() -> PackageDescription {
        serde_yaml::from_str(DESCRIPTION).unwrap()
    }

    #[test]
    fn test_description_parses() {
        let desc = description();
        assert_eq!(desc.name, "mnist");
        assert_eq!(desc.task_names(), vec!["download", "train"]);
        assert_eq!(
            desc.platform.as_ref().unwrap().accelerator_count,
            Some(1)
        );
    }

    #[test]
    fn test_bare_parameter_declaration() {
        let desc = description();
        let param = &desc.tasks["download"].parameters.outputs["data_dir"];
        assert_eq!(param.kind, ParamKind::Unknown);
        assert_eq!(param.default.as_deref(), Some("data/"));
        assert_eq!(param.access(true), AccessMode::Rw);
    }

    #[test]
    fn test_full_parameter_declaration() {
        let desc = description();
        let param = &desc.tasks["train"].parameters.inputs["parameters_file"];
        assert_eq!(param.kind, ParamKind::File);
        assert_eq!(param.access(false), AccessMode::Ro);
    }

    #[test]
    fn test_trailing_separator_infers_directory() {
        let desc = description();
        let param = &desc.tasks["download"].parameters.outputs["data_dir"];
        assert_eq!(
            param.infer_kind(Path::new("/nonexistent/data")),
            ParamKind::Directory
        );
    }

    #[test]
    fn test_existing_path_infers_kind() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("config.yaml");
        std::fs::write(&file, "x: 1\n").unwrap();

        let param = Parameter {
            kind: ParamKind::Unknown,
            default: Some("config.yaml".to_owned()),
            opts: None,
        };
        assert_eq!(param.infer_kind(&file), ParamKind::File);
        assert_eq!(param.infer_kind(dir.path()), ParamKind::Directory);
    }

    #[test]
    fn test_select_task_explicit_unknown() {
        let err = description().select_task(Some("serve")).unwrap_err();
        assert!(err.to_string().contains("serve"));
    }

    #[test]
    fn test_select_task_implicit_ambiguous() {
        let err = description().select_task(None).unwrap_err();
        assert!(err.to_string().contains("--task"));
    }

    #[test]
    fn test_select_task_single_implicit() {
        let mut desc = description();
        desc.tasks.shift_remove("download");
        assert_eq!(desc.select_task(None).unwrap(), "train");
    }
}
