//! Free-form command-line argument classification.
//!
//! Everything after the recognized options is split three ways:
//!
//! - `-Pa.b.c=value` contributes to the configuration override tree at
//!   the dotted path
//! - `--name=value` (or bare `name=value`) overrides a task parameter
//!   default by name
//! - Reserved substrate switches (`--network`, `--security`, `--gpus`,
//!   `--memory`, `--cpu`, `--mount`) are kept aside and translated into
//!   runner-specific fields once the platform is known

use caravel_core::{tree, CaravelError, CaravelResult};
use indexmap::IndexMap;
use serde_yaml::{Mapping, Value};

/// Reserved switches translated by the selected runner.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubstrateSwitches {
    /// Networking option (e.g. `host`).
    pub network: Option<String>,
    /// Security option (e.g. `privileged`).
    pub security: Option<String>,
    /// Accelerator device specification.
    pub gpus: Option<String>,
    /// Memory limit, free-form.
    pub memory: Option<String>,
    /// CPU limit, free-form.
    pub cpu: Option<String>,
    /// Extra binds, `host:container[:mode]`.
    pub mounts: Vec<String>,
}

impl SubstrateSwitches {
    /// Whether no switch was given.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Classified free-form arguments of one invocation.
#[derive(Debug, Clone, Default)]
pub struct ParsedArgs {
    /// `-P` override tree, mergeable over the description.
    pub overrides: Value,
    /// Task parameter overrides by parameter name.
    pub task_params: IndexMap<String, String>,
    /// Reserved substrate switches.
    pub switches: SubstrateSwitches,
}

impl ParsedArgs {
    /// Classify a list of free-form arguments.
    ///
    /// # Errors
    ///
    /// Returns a `configuration` error for arguments that fit no form
    /// (no `=`, empty key, empty `-P` path segment).
    pub fn parse(extra: &[String]) -> CaravelResult<Self> {
        let mut parsed = Self {
            overrides: Value::Mapping(Mapping::new()),
            ..Self::default()
        };

        for arg in extra {
            if let Some(spec) = arg.strip_prefix("-P") {
                let (path, value) = split_assignment(spec, arg)?;
                if path.split('.').any(str::is_empty) {
                    return Err(CaravelError::config(format!(
                        "`{arg}`: override path must be dotted non-empty segments"
                    )));
                }
                tree::set_path(&mut parsed.overrides, path, scalar_value(value));
                continue;
            }

            let stripped = arg.strip_prefix("--").unwrap_or(arg);
            let (key, value) = split_assignment(stripped, arg)?;
            match key {
                "network" => parsed.switches.network = Some(value.to_owned()),
                "security" => parsed.switches.security = Some(value.to_owned()),
                "gpus" => parsed.switches.gpus = Some(value.to_owned()),
                "memory" => parsed.switches.memory = Some(value.to_owned()),
                "cpu" => parsed.switches.cpu = Some(value.to_owned()),
                "mount" => parsed.switches.mounts.push(value.to_owned()),
                _ => {
                    parsed.task_params.insert(key.to_owned(), value.to_owned());
                },
            }
        }

        Ok(parsed)
    }
}

/// Split `key=value`, rejecting empty keys.
fn split_assignment<'a>(spec: &'a str, original: &str) -> CaravelResult<(&'a str, &'a str)> {
    let Some((key, value)) = spec.split_once('=') else {
        return Err(CaravelError::config(format!(
            "`{original}`: expected key=value"
        )));
    };
    if key.is_empty() {
        return Err(CaravelError::config(format!(
            "`{original}`: empty key in assignment"
        )));
    }
    Ok((key, value))
}

/// Interpret an override value as the narrowest matching YAML scalar.
///
/// Colons and other YAML syntax inside the value must stay literal
/// (image references contain colons), so this is a typed-literal check,
/// not a YAML parse.
fn scalar_value(raw: &str) -> Value {
    if raw == "true" {
        return Value::from(true);
    }
    if raw == "false" {
        return Value::from(false);
    }
    if let Ok(n) = raw.parse::<i64>() {
        return Value::from(n);
    }
    if let Ok(f) = raw.parse::<f64>() {
        return Value::from(f);
    }
    Value::from(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| (*s).to_owned()).collect()
    }

    #[test]
    fn test_override_tree() {
        let parsed = ParsedArgs::parse(&strings(&[
            "-Pcontainer.image=mlcommons/mnist:0.0.2",
            "-Prunner.gpus=2",
        ]))
        .unwrap();
        assert_eq!(
            tree::get_str(&parsed.overrides, "container.image"),
            Some("mlcommons/mnist:0.0.2")
        );
        assert_eq!(
            tree::get_path(&parsed.overrides, "runner.gpus").and_then(Value::as_i64),
            Some(2)
        );
    }

    #[test]
    fn test_task_params() {
        let parsed =
            ParsedArgs::parse(&strings(&["--data_dir=/datasets/mnist", "epochs=5"])).unwrap();
        assert_eq!(
            parsed.task_params.get("data_dir").map(String::as_str),
            Some("/datasets/mnist")
        );
        assert_eq!(parsed.task_params.get("epochs").map(String::as_str), Some("5"));
    }

    #[test]
    fn test_reserved_switches() {
        let parsed = ParsedArgs::parse(&strings(&[
            "--gpus=all",
            "--memory=16Gb",
            "--mount=/data:/mnt/data:ro",
            "--mount=/cache:/mnt/cache",
        ]))
        .unwrap();
        assert_eq!(parsed.switches.gpus.as_deref(), Some("all"));
        assert_eq!(parsed.switches.memory.as_deref(), Some("16Gb"));
        assert_eq!(parsed.switches.mounts.len(), 2);
        assert!(parsed.task_params.is_empty());
    }

    #[test]
    fn test_missing_assignment_rejected() {
        let err = ParsedArgs::parse(&strings(&["--flag"])).unwrap_err();
        assert!(err.to_string().contains("key=value"));
    }

    #[test]
    fn test_empty_override_segment_rejected() {
        let err = ParsedArgs::parse(&strings(&["-Pa..b=1"])).unwrap_err();
        assert!(err.to_string().contains("dotted"));
    }

    #[test]
    fn test_boolean_and_float_literals() {
        let parsed =
            ParsedArgs::parse(&strings(&["-Pa.flag=true", "-Pa.rate=0.5"])).unwrap();
        assert_eq!(
            tree::get_path(&parsed.overrides, "a.flag").and_then(Value::as_bool),
            Some(true)
        );
        assert_eq!(
            tree::get_path(&parsed.overrides, "a.rate").and_then(Value::as_f64),
            Some(0.5)
        );
    }
}
