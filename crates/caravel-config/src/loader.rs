//! Description file discovery and loading.
//!
//! A `--package` argument names either the package directory (holding a
//! `caravel.yaml`) or the description file itself. The description is
//! loaded once per invocation and is immutable afterwards; structural
//! validation runs at load time so later stages can assume a well-formed
//! tree.

use std::path::{Path, PathBuf};

use caravel_core::{CaravelError, CaravelResult, PackageDescription, DESCRIPTION_FILE};
use serde_yaml::Value;
use tracing::debug;

/// Maximum allowed description file size (1 MB).
const MAX_DESCRIPTION_SIZE: u64 = 1_048_576;

/// Resolve a package argument into `(package_root, description_file)`.
///
/// # Errors
///
/// Returns a `configuration` error when the path does not exist or the
/// directory has no description file.
pub fn locate(package: &Path) -> CaravelResult<(PathBuf, PathBuf)> {
    let package = package
        .canonicalize()
        .map_err(|e| CaravelError::io(package.display().to_string(), e))?;

    if package.is_dir() {
        let file = package.join(DESCRIPTION_FILE);
        if !file.is_file() {
            return Err(CaravelError::config(format!(
                "`{}` does not contain a {DESCRIPTION_FILE}",
                package.display()
            )));
        }
        return Ok((package, file));
    }

    let root = package
        .parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| CaravelError::config("description file has no parent directory"))?;
    Ok((root, package))
}

/// Read and parse a description file into a raw YAML tree.
///
/// # Errors
///
/// Returns an `io` error when the file cannot be read, a
/// `configuration` error when it is not valid YAML, not a mapping, or
/// structurally invalid.
pub fn load(file: &Path) -> CaravelResult<Value> {
    let metadata =
        std::fs::metadata(file).map_err(|e| CaravelError::io(file.display().to_string(), e))?;
    if metadata.len() > MAX_DESCRIPTION_SIZE {
        return Err(CaravelError::config(format!(
            "description file {} is {} bytes, exceeding the {MAX_DESCRIPTION_SIZE} byte limit",
            file.display(),
            metadata.len()
        )));
    }

    let content = std::fs::read_to_string(file)
        .map_err(|e| CaravelError::io(file.display().to_string(), e))?;
    let mut tree: Value = serde_yaml::from_str(&content).map_err(|e| {
        CaravelError::config(format!("{}: invalid YAML: {e}", file.display()))
    })?;

    if !tree.is_mapping() {
        return Err(CaravelError::config(format!(
            "{}: description must be a mapping",
            file.display()
        )));
    }

    normalize_tasks(&mut tree);
    validate_structure(&tree, file)?;
    debug!(path = %file.display(), "loaded package description");
    Ok(tree)
}

/// Empty task bodies and parameter sets are conventionally written as
/// bare keys (`ls:`); normalize those nulls to empty mappings so the
/// typed view deserializes uniformly.
fn normalize_tasks(tree: &mut Value) {
    let Some(tasks) = tree
        .as_mapping_mut()
        .and_then(|m| m.get_mut("tasks"))
        .and_then(Value::as_mapping_mut)
    else {
        return;
    };

    for (_, body) in tasks.iter_mut() {
        if body.is_null() {
            *body = Value::Mapping(serde_yaml::Mapping::new());
        }
        let Some(task) = body.as_mapping_mut() else {
            continue;
        };
        if let Some(params) = task.get_mut("parameters") {
            if params.is_null() {
                *params = Value::Mapping(serde_yaml::Mapping::new());
            }
            if let Some(params) = params.as_mapping_mut() {
                for side in ["inputs", "outputs"] {
                    if let Some(node) = params.get_mut(side) {
                        if node.is_null() {
                            *node = Value::Mapping(serde_yaml::Mapping::new());
                        }
                    }
                }
            }
        }
    }
}

/// Structural validation of the raw description tree.
///
/// Checks the pieces every later stage relies on: identity fields and a
/// well-formed `tasks` mapping. Everything deeper (parameter typing,
/// runner sections) is validated where it is interpreted.
fn validate_structure(tree: &Value, file: &Path) -> CaravelResult<()> {
    let describe = |field: &str, problem: &str| {
        CaravelError::config(format!("{}: `{field}` {problem}", file.display()))
    };

    match caravel_core::tree::get_path(tree, "name") {
        Some(Value::String(s)) if !s.is_empty() => {},
        Some(_) => return Err(describe("name", "must be a non-empty string")),
        None => return Err(describe("name", "is required")),
    }

    if let Some(tasks) = caravel_core::tree::get_path(tree, "tasks") {
        let Some(tasks) = tasks.as_mapping() else {
            return Err(describe("tasks", "must be a mapping"));
        };
        for (task_name, node) in tasks {
            let Some(task_name) = task_name.as_str() else {
                return Err(describe("tasks", "contains a non-string task name"));
            };
            // Deserializing the typed view surfaces malformed task bodies
            // with the offending task named.
            serde_yaml::from_value::<caravel_core::Task>(node.clone()).map_err(|e| {
                describe(&format!("tasks.{task_name}"), &format!("is malformed: {e}"))
            })?;
        }
    }

    Ok(())
}

/// Deserialize the typed description view from a (possibly merged) tree.
///
/// # Errors
///
/// Returns a `configuration` error when the tree no longer matches the
/// description shape (e.g. an override mangled a task definition).
pub fn typed_view(tree: &Value) -> CaravelResult<PackageDescription> {
    serde_yaml::from_value(tree.clone())
        .map_err(|e| CaravelError::config(format!("description is malformed: {e}")))
}
