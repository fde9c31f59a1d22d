//! Caravel Platform - System settings and the platform registry.
//!
//! A platform is a named, configured instance of a runner kind. The
//! mapping lives in a per-user YAML settings file with three top-level
//! sections: `runners` (kind → providing package), `platforms` (name →
//! runner kind plus per-platform overrides), and `storage` (reserved,
//! preserved verbatim).
//!
//! The file is created empty when absent and seeded with plugin
//! defaults after discovery. Every mutation rewrites it atomically
//! (temp file + rename), so the file never becomes syntactically
//! invalid, even under concurrent engines.

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

use std::path::{Path, PathBuf};

use caravel_core::{tree, CaravelError, CaravelResult};
use serde_yaml::{Mapping, Value};
use tracing::{debug, info};

/// Environment variable overriding the settings file location.
pub const SETTINGS_ENV: &str = "CARAVEL_SYSTEM_SETTINGS";

/// File name under the home directory when no override is set.
const SETTINGS_FILE: &str = "caravel.yaml";

/// The package name recorded for built-in runner kinds.
const BUILTIN_PACKAGE: &str = "caravel-runners";

/// The persisted system settings.
pub struct SystemSettings {
    path: PathBuf,
    doc: Value,
}

impl SystemSettings {
    /// The settings file location: `$CARAVEL_SYSTEM_SETTINGS` when set,
    /// else `$HOME/caravel.yaml`.
    ///
    /// # Errors
    ///
    /// Returns a `configuration` error when no home directory can be
    /// determined.
    pub fn default_path() -> CaravelResult<PathBuf> {
        if let Ok(path) = std::env::var(SETTINGS_ENV) {
            if !path.is_empty() {
                return Ok(PathBuf::from(path));
            }
        }
        directories::BaseDirs::new()
            .map(|d| d.home_dir().join(SETTINGS_FILE))
            .ok_or_else(|| CaravelError::config("cannot determine the home directory"))
    }

    /// Load the settings file, creating an empty one when absent.
    ///
    /// # Errors
    ///
    /// Returns an `io` error when the file cannot be read or created,
    /// and a `configuration` error when it holds invalid YAML.
    pub fn load_or_create(path: &Path) -> CaravelResult<Self> {
        let doc = match std::fs::read_to_string(path) {
            Ok(content) => serde_yaml::from_str(&content).map_err(|e| {
                CaravelError::config(format!("{}: invalid YAML: {e}", path.display()))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "settings file absent; creating");
                let settings = Self {
                    path: path.to_path_buf(),
                    doc: empty_doc(),
                };
                settings.save()?;
                return Ok(settings);
            },
            Err(e) => return Err(CaravelError::io(path.display().to_string(), e)),
        };

        let mut settings = Self {
            path: path.to_path_buf(),
            doc,
        };
        // Tolerate hand-edited files with sections removed.
        for section in ["runners", "platforms", "storage"] {
            if tree::get_path(&settings.doc, section).is_none() {
                tree::set_path(&mut settings.doc, section, Value::Mapping(Mapping::new()));
            }
        }
        Ok(settings)
    }

    /// Seed missing runner and platform entries from plugin defaults
    /// and persist when anything changed.
    ///
    /// # Errors
    ///
    /// Returns an `io` error when persisting fails.
    pub fn seed<'a>(
        &mut self,
        plugins: impl IntoIterator<Item = (&'a str, Value)>,
    ) -> CaravelResult<()> {
        let mut changed = false;
        for (kind, defaults) in plugins {
            let runner_key = format!("runners.{kind}");
            if tree::get_path(&self.doc, &runner_key).is_none() {
                tree::set_path(&mut self.doc, &runner_key, Value::from(BUILTIN_PACKAGE));
                changed = true;
            }
            let platform_key = format!("platforms.{kind}");
            if tree::get_path(&self.doc, &platform_key).is_none() {
                let mut entry = Value::Mapping(Mapping::new());
                tree::set_path(&mut entry, "runner", Value::from(kind));
                tree::deep_merge(&mut entry, &defaults);
                tree::set_path(&mut self.doc, &platform_key, entry);
                changed = true;
            }
        }
        if changed {
            info!(path = %self.path.display(), "seeded settings with plugin defaults");
            self.save()?;
        }
        Ok(())
    }

    /// Resolve a platform name into its runner kind and defaults (the
    /// platform entry without the `runner` discriminator).
    ///
    /// # Errors
    ///
    /// Returns a `configuration` error for unknown or malformed
    /// platform entries.
    pub fn resolve_platform(&self, name: &str) -> CaravelResult<(String, Value)> {
        let entry = tree::get_path(&self.doc, &format!("platforms.{name}"))
            .ok_or_else(|| {
                CaravelError::config(format!(
                    "unknown platform `{name}` (known: {})",
                    self.platform_names().join(", ")
                ))
            })?
            .clone();

        let kind = tree::get_str(&entry, "runner")
            .ok_or_else(|| {
                CaravelError::config(format!(
                    "platform `{name}` has no `runner` field in the settings file"
                ))
            })?
            .to_owned();

        let mut defaults = entry;
        if let Some(map) = defaults.as_mapping_mut() {
            map.remove("runner");
        }
        Ok((kind, defaults))
    }

    /// Register a new platform from a runner kind's defaults.
    ///
    /// # Errors
    ///
    /// Returns a `configuration` error when the name is taken or the
    /// runner kind is not registered.
    pub fn create_platform(
        &mut self,
        runner: &str,
        name: &str,
        defaults: &Value,
    ) -> CaravelResult<()> {
        if tree::get_path(&self.doc, &format!("runners.{runner}")).is_none() {
            return Err(CaravelError::config(format!(
                "unknown runner kind `{runner}`; register it before creating platforms"
            )));
        }
        if tree::get_path(&self.doc, &format!("platforms.{name}")).is_some() {
            return Err(CaravelError::config(format!(
                "platform `{name}` already exists; remove it first or pick another name"
            )));
        }
        let mut entry = Value::Mapping(Mapping::new());
        tree::set_path(&mut entry, "runner", Value::from(runner));
        tree::deep_merge(&mut entry, defaults);
        tree::set_path(&mut self.doc, &format!("platforms.{name}"), entry);
        self.save()
    }

    /// Remove a platform.
    ///
    /// # Errors
    ///
    /// Returns a `configuration` error when the platform is unknown.
    pub fn remove_platform(&mut self, name: &str) -> CaravelResult<()> {
        let removed = platforms_mut(&mut self.doc).remove(name);
        if removed.is_none() {
            return Err(CaravelError::config(format!("unknown platform `{name}`")));
        }
        self.save()
    }

    /// Rename a platform.
    ///
    /// # Errors
    ///
    /// Returns a `configuration` error when the source is unknown or
    /// the destination exists.
    pub fn rename_platform(&mut self, old: &str, new: &str) -> CaravelResult<()> {
        if tree::get_path(&self.doc, &format!("platforms.{new}")).is_some() {
            return Err(CaravelError::config(format!(
                "platform `{new}` already exists"
            )));
        }
        let entry = platforms_mut(&mut self.doc)
            .remove(old)
            .ok_or_else(|| CaravelError::config(format!("unknown platform `{old}`")))?;
        platforms_mut(&mut self.doc).insert(Value::from(new), entry);
        self.save()
    }

    /// Copy a platform under a new name.
    ///
    /// # Errors
    ///
    /// Returns a `configuration` error when the source is unknown or
    /// the destination exists.
    pub fn copy_platform(&mut self, src: &str, dst: &str) -> CaravelResult<()> {
        if tree::get_path(&self.doc, &format!("platforms.{dst}")).is_some() {
            return Err(CaravelError::config(format!(
                "platform `{dst}` already exists"
            )));
        }
        let entry = tree::get_path(&self.doc, &format!("platforms.{src}"))
            .ok_or_else(|| CaravelError::config(format!("unknown platform `{src}`")))?
            .clone();
        tree::set_path(&mut self.doc, &format!("platforms.{dst}"), entry);
        self.save()
    }

    /// Rename a runner kind, optionally cascading into dependent
    /// platforms.
    ///
    /// # Errors
    ///
    /// Refuses with a `configuration` error while dependent platforms
    /// exist and `update_platforms` is false.
    pub fn rename_runner(
        &mut self,
        old: &str,
        new: &str,
        update_platforms: bool,
    ) -> CaravelResult<()> {
        if tree::get_path(&self.doc, &format!("runners.{new}")).is_some() {
            return Err(CaravelError::config(format!("runner `{new}` already exists")));
        }
        let dependents = self.dependent_platforms(old);
        if !dependents.is_empty() && !update_platforms {
            return Err(CaravelError::config(format!(
                "runner `{old}` is used by platforms {}; pass the cascade flag to update them",
                dependents.join(", ")
            )));
        }

        let entry = runners_mut(&mut self.doc)
            .remove(old)
            .ok_or_else(|| CaravelError::config(format!("unknown runner `{old}`")))?;
        runners_mut(&mut self.doc).insert(Value::from(new), entry);
        for platform in dependents {
            tree::set_path(
                &mut self.doc,
                &format!("platforms.{platform}.runner"),
                Value::from(new),
            );
        }
        self.save()
    }

    /// Remove a runner kind, optionally cascading into dependent
    /// platforms.
    ///
    /// # Errors
    ///
    /// Refuses with a `configuration` error while dependent platforms
    /// exist and `remove_platforms` is false.
    pub fn remove_runner(&mut self, name: &str, remove_platforms: bool) -> CaravelResult<()> {
        let dependents = self.dependent_platforms(name);
        if !dependents.is_empty() && !remove_platforms {
            return Err(CaravelError::config(format!(
                "runner `{name}` is used by platforms {}; pass the cascade flag to remove them",
                dependents.join(", ")
            )));
        }

        let removed = runners_mut(&mut self.doc).remove(name);
        if removed.is_none() {
            return Err(CaravelError::config(format!("unknown runner `{name}`")));
        }
        for platform in dependents {
            platforms_mut(&mut self.doc).remove(platform.as_str());
        }
        self.save()
    }

    /// Platforms whose `runner` field names the given kind.
    #[must_use]
    pub fn dependent_platforms(&self, kind: &str) -> Vec<String> {
        match tree::get_path(&self.doc, "platforms") {
            Some(Value::Mapping(platforms)) => platforms
                .iter()
                .filter(|(_, entry)| tree::get_str(entry, "runner") == Some(kind))
                .filter_map(|(name, _)| name.as_str().map(str::to_owned))
                .collect(),
            _ => Vec::new(),
        }
    }

    /// All platform names, in file order.
    #[must_use]
    pub fn platform_names(&self) -> Vec<String> {
        match tree::get_path(&self.doc, "platforms") {
            Some(Value::Mapping(platforms)) => platforms
                .keys()
                .filter_map(Value::as_str)
                .map(str::to_owned)
                .collect(),
            _ => Vec::new(),
        }
    }

    /// The settings document.
    #[must_use]
    pub fn doc(&self) -> &Value {
        &self.doc
    }

    /// The settings file location.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persist the document atomically: write a sibling temp file,
    /// then rename over the target.
    ///
    /// # Errors
    ///
    /// Returns an `io` error when staging or renaming fails.
    pub fn save(&self) -> CaravelResult<()> {
        let rendered = serde_yaml::to_string(&self.doc)
            .map_err(|e| CaravelError::config(format!("settings are unrenderable: {e}")))?;

        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir).map_err(|e| CaravelError::io(dir.display().to_string(), e))?;
        let staged = tempfile::NamedTempFile::new_in(dir)
            .map_err(|e| CaravelError::io(dir.display().to_string(), e))?;
        std::fs::write(staged.path(), rendered)
            .map_err(|e| CaravelError::io(staged.path().display().to_string(), e))?;
        staged
            .persist(&self.path)
            .map_err(|e| CaravelError::io(self.path.display().to_string(), e.error))?;
        debug!(path = %self.path.display(), "settings persisted");
        Ok(())
    }
}

fn empty_doc() -> Value {
    let mut doc = Value::Mapping(Mapping::new());
    for section in ["runners", "platforms", "storage"] {
        tree::set_path(&mut doc, section, Value::Mapping(Mapping::new()));
    }
    doc
}

fn platforms_mut(doc: &mut Value) -> &mut Mapping {
    section_mut(doc, "platforms")
}

fn runners_mut(doc: &mut Value) -> &mut Mapping {
    section_mut(doc, "runners")
}

fn section_mut<'a>(doc: &'a mut Value, key: &str) -> &'a mut Mapping {
    let map = doc
        .as_mapping_mut()
        .expect("settings document is always a mapping");
    if !map.contains_key(key) {
        map.insert(Value::from(key), Value::Mapping(Mapping::new()));
    }
    map.get_mut(key)
        .and_then(Value::as_mapping_mut)
        .expect("section was just ensured")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh() -> (tempfile::TempDir, SystemSettings) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("caravel.yaml");
        let settings = SystemSettings::load_or_create(&path).unwrap();
        (dir, settings)
    }

    fn seeded() -> (tempfile::TempDir, SystemSettings) {
        let (dir, mut settings) = fresh();
        settings
            .seed([
                ("container", serde_yaml::from_str("executable: docker\n").unwrap()),
                ("ssh", serde_yaml::from_str("platform: container\n").unwrap()),
            ])
            .unwrap();
        (dir, settings)
    }

    #[test]
    fn test_absent_file_created_empty() {
        let (dir, settings) = fresh();
        assert!(settings.path().is_file());
        assert!(settings.platform_names().is_empty());
        drop(dir);
    }

    #[test]
    fn test_seed_registers_plugins() {
        let (_dir, settings) = seeded();
        assert_eq!(settings.platform_names(), vec!["container", "ssh"]);
        let (kind, defaults) = settings.resolve_platform("container").unwrap();
        assert_eq!(kind, "container");
        assert_eq!(tree::get_str(&defaults, "executable"), Some("docker"));
        // The discriminator is stripped from the defaults.
        assert!(tree::get_path(&defaults, "runner").is_none());
    }

    #[test]
    fn test_seed_is_idempotent() {
        let (_dir, mut settings) = seeded();
        let before = serde_yaml::to_string(settings.doc()).unwrap();
        settings
            .seed([(
                "container",
                serde_yaml::from_str("executable: podman\n").unwrap(),
            )])
            .unwrap();
        let after = serde_yaml::to_string(settings.doc()).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_reload_reflects_mutations() {
        let (_dir, mut settings) = seeded();
        settings.copy_platform("container", "podman").unwrap();

        let reloaded = SystemSettings::load_or_create(settings.path()).unwrap();
        assert!(reloaded.platform_names().contains(&"podman".to_owned()));
    }

    #[test]
    fn test_unknown_platform_rejected() {
        let (_dir, settings) = seeded();
        let err = settings.resolve_platform("slurm").unwrap_err();
        assert!(err.to_string().contains("slurm"));
        assert!(err.to_string().contains("container"));
    }

    #[test]
    fn test_create_requires_known_runner() {
        let (_dir, mut settings) = seeded();
        let err = settings
            .create_platform("slurm", "cluster", &Value::Null)
            .unwrap_err();
        assert!(err.to_string().contains("unknown runner kind"));
    }

    #[test]
    fn test_create_rejects_collision() {
        let (_dir, mut settings) = seeded();
        let err = settings
            .create_platform("container", "container", &Value::Null)
            .unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[test]
    fn test_rename_platform() {
        let (_dir, mut settings) = seeded();
        settings.rename_platform("container", "docker").unwrap();
        assert!(settings.resolve_platform("docker").is_ok());
        assert!(settings.resolve_platform("container").is_err());
    }

    #[test]
    fn test_rename_runner_refuses_without_cascade() {
        let (_dir, mut settings) = seeded();
        let err = settings.rename_runner("container", "docker", false).unwrap_err();
        assert!(err.to_string().contains("cascade"));
    }

    #[test]
    fn test_rename_runner_cascades() {
        let (_dir, mut settings) = seeded();
        settings.rename_runner("container", "docker", true).unwrap();
        let (kind, _) = settings.resolve_platform("container").unwrap();
        assert_eq!(kind, "docker");
    }

    #[test]
    fn test_remove_runner_cascades() {
        let (_dir, mut settings) = seeded();
        settings.remove_runner("container", true).unwrap();
        assert_eq!(settings.platform_names(), vec!["ssh"]);
    }

    #[test]
    fn test_saved_file_is_valid_yaml() {
        let (_dir, mut settings) = seeded();
        settings.copy_platform("container", "podman").unwrap();
        let content = std::fs::read_to_string(settings.path()).unwrap();
        let doc: Value = serde_yaml::from_str(&content).unwrap();
        assert!(tree::get_path(&doc, "platforms.podman").is_some());
    }
}
