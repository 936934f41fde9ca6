//! Access to the configuration of a simulations folder.
//!
//! Every subsystem working on a folder goes through a `Folder`: it
//! loads `.hateno/hateno.conf` once, caches the named sub-configs,
//! resolves skeleton files, creates scratch directories, and owns the
//! fixer/namer registries.

pub mod fixers;
pub mod namers;

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use anyhow::{anyhow, Result};
use serde_json::Value;

use crate::{
    ctx,
    fcollection::{FCollection, FCollectionError},
    load_config_file::try_load_json_file,
    path_util::AppendToPath,
    simulation::SettingRecord,
};

pub const MAIN_FOLDER: &str = ".hateno";
pub const CONFIG_FOLDER: &str = "config";
pub const SKELETONS_FOLDER: &str = "skeletons";
pub const SIMULATIONS_FOLDER: &str = "simulations";
pub const TMP_FOLDER: &str = "tmp";

pub const CONF_FILENAME: &str = "hateno.conf";
pub const SIMULATIONS_LIST_FILENAME: &str = "simulations.list";
pub const RUNNING_MANAGER_INDICATOR_FILENAME: &str = "manager.running";

/// A value fixer: normalizes a setting value (to prevent false
/// identity forks like `2` vs `2.0`). Extra arguments come from the
/// configuration entry `["name", args...]`.
pub type Fixer = fn(Value, &[Value]) -> Value;

/// A namer: rewrites a setting's effective name before it is rendered
/// into a command-line fragment.
pub type Namer = fn(&SettingRecord, &[Value]) -> String;

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("no configuration name given and the folder defines no `default_config`")]
    NoConfig,

    #[error("no fixer named {0:?}")]
    FixerNotFound(String),

    #[error("no namer named {0:?}")]
    NamerNotFound(String),
}

/// One setting descriptor inside a setting set.
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SettingConfig {
    pub name: String,
    pub default: Value,
    /// Per-setting rendering pattern; the folder's `setting_pattern`
    /// is used when absent.
    #[serde(default)]
    pub pattern: Option<String>,
    /// Excluded settings do not take part in the identity hash.
    #[serde(default)]
    pub exclude: bool,
}

/// A named group of settings that may occur zero, one or many times
/// in a request.
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SettingSetConfig {
    pub set: String,
    #[serde(default)]
    pub required: bool,
    pub settings: Vec<SettingConfig>,
}

/// One declared output (file or folder), with the checks to run on it.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct OutputEntry {
    pub name: String,
    #[serde(default)]
    pub checks: Vec<String>,
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct OutputConfig {
    #[serde(default)]
    pub files: Vec<OutputEntry>,
    #[serde(default)]
    pub folders: Vec<OutputEntry>,
    /// Global checks, applied to the whole simulation folder.
    #[serde(default)]
    pub checks: Vec<String>,
}

/// The contents of `.hateno/hateno.conf`.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct FolderSettings {
    /// The simulation program invocation, prepended to all rendered
    /// setting fragments.
    pub exec: String,
    /// Default rendering pattern, e.g. `"--{name} {value}"`.
    pub setting_pattern: String,
    pub settings: Vec<SettingSetConfig>,
    #[serde(default)]
    pub output: Option<OutputConfig>,
    /// Fixer specs: either `"name"` or `["name", args...]`.
    #[serde(default)]
    pub fixers: Vec<Value>,
    #[serde(default)]
    pub namers: Vec<Value>,
    #[serde(default)]
    pub default_config: Option<String>,
}

pub struct Folder {
    folder: PathBuf,
    conf_folder_path: PathBuf,
    tmp_dir: PathBuf,
    settings: FolderSettings,
    configs: Mutex<HashMap<(String, String), Option<Arc<serde_json::Map<String, Value>>>>>,
    fixers: FCollection<Fixer>,
    namers: FCollection<Namer>,
}

impl Folder {
    /// Open a simulations folder. The folder must contain
    /// `.hateno/hateno.conf`.
    pub fn open(folder: impl AsRef<Path>) -> Result<Self> {
        let folder = folder.as_ref().to_owned();
        let conf_folder_path = (&folder).append(MAIN_FOLDER);
        let settings_file = (&conf_folder_path).append(CONF_FILENAME);
        let tmp_dir = (&conf_folder_path).append(TMP_FOLDER);

        let settings: FolderSettings = try_load_json_file(&settings_file)?
            .ok_or_else(|| anyhow!("no configuration file at {settings_file:?}"))?;

        if !tmp_dir.is_dir() {
            std::fs::create_dir_all(&tmp_dir).map_err(ctx!("creating {tmp_dir:?}"))?;
        }

        let mut fixers = FCollection::new();
        fixers.set_filter_regex(r"^fixer_(?P<name>[A-Za-z0-9_]+)$")?;
        fixers.load_entries(fixers::BUILTINS.iter().copied())?;

        let mut namers = FCollection::new();
        namers.set_filter_regex(r"^namer_(?P<name>[A-Za-z0-9_]+)$")?;
        namers.load_entries(namers::BUILTINS.iter().copied())?;

        Ok(Self {
            folder,
            conf_folder_path,
            tmp_dir,
            settings,
            configs: Mutex::new(HashMap::new()),
            fixers,
            namers,
        })
    }

    pub fn folder(&self) -> &Path {
        &self.folder
    }

    pub fn settings(&self) -> &FolderSettings {
        &self.settings
    }

    /// Create a scratch directory under `.hateno/tmp/`. The caller
    /// owns it; nothing deletes it automatically.
    pub fn tempdir(&self) -> Result<PathBuf> {
        Ok(tempfile::Builder::new()
            .tempdir_in(&self.tmp_dir)
            .map_err(ctx!("creating scratch dir in {:?}", self.tmp_dir))?
            .into_path())
    }

    /// Register an additional fixer (user extension). Must happen
    /// before the folder is shared.
    pub fn register_fixer(&mut self, name: impl Into<String>, f: Fixer) {
        self.fixers
            .set(name, f, None)
            .expect("flat collection accepts any name");
    }

    pub fn register_namer(&mut self, name: impl Into<String>, f: Namer) {
        self.namers
            .set(name, f, None)
            .expect("flat collection accepts any name");
    }

    /// Get a named sub-config. A missing file resolves to `None`,
    /// not an error; the result is cached either way.
    pub fn config(
        &self,
        configname: &str,
        foldername: Option<&str>,
    ) -> Result<Option<Arc<serde_json::Map<String, Value>>>> {
        let foldername = foldername
            .or(self.settings.default_config.as_deref())
            .ok_or(ConfigError::NoConfig)?
            .to_owned();

        let key = (foldername.clone(), configname.to_owned());
        let mut configs = self.configs.lock().expect("not poisoned");
        if let Some(cached) = configs.get(&key) {
            return Ok(cached.clone());
        }

        let path = (&self.conf_folder_path)
            .append(CONFIG_FOLDER)
            .append(foldername.as_str())
            .append(format!("{configname}.json"));
        let loaded: Option<serde_json::Map<String, Value>> = try_load_json_file(&path)?;
        let loaded = loaded.map(Arc::new);
        configs.insert(key, loaded.clone());
        Ok(loaded)
    }

    /// Resolve a file referenced from a sub-config (e.g. a skeleton):
    /// first next to the sub-config files, then in the shared
    /// skeletons folder.
    pub fn config_filepath(&self, filename: &str, foldername: Option<&str>) -> Result<PathBuf> {
        let foldername = foldername
            .or(self.settings.default_config.as_deref())
            .ok_or(ConfigError::NoConfig)?;

        let in_config = (&self.conf_folder_path)
            .append(CONFIG_FOLDER)
            .append(foldername)
            .append(filename);
        if in_config.exists() {
            return Ok(in_config);
        }
        Ok(self.skeletons(filename))
    }

    /// The path of a skeleton file.
    pub fn skeletons(&self, name: &str) -> PathBuf {
        (&self.conf_folder_path).append(SKELETONS_FOLDER).append(name)
    }

    pub fn simulations_list_filename(&self) -> PathBuf {
        (&self.conf_folder_path).append(SIMULATIONS_LIST_FILENAME)
    }

    /// The archives folder, created on demand.
    pub fn simulations_folder(&self) -> Result<PathBuf> {
        let path = (&self.conf_folder_path).append(SIMULATIONS_FOLDER);
        if !path.is_dir() {
            std::fs::create_dir_all(&path).map_err(ctx!("creating {path:?}"))?;
        }
        Ok(path)
    }

    pub fn running_manager_indicator_filename(&self) -> PathBuf {
        (&self.conf_folder_path).append(RUNNING_MANAGER_INDICATOR_FILENAME)
    }

    fn spec_name_and_args(spec: &Value) -> Option<(&str, &[Value])> {
        match spec {
            Value::String(name) => Some((name, &[])),
            Value::Array(items) => {
                let (name, args) = items.split_first()?;
                Some((name.as_str()?, args))
            }
            _ => None,
        }
    }

    /// Fix a value to prevent false duplicates (e.g. `2.0` vs `2`).
    /// Runs, in order, `before`, the folder's configured fixers, then
    /// `after`. Each spec is either a fixer name or `[name, args...]`.
    pub fn apply_fixers(
        &self,
        value: &Value,
        before: &[Value],
        after: &[Value],
    ) -> Result<Value, ConfigError> {
        let mut value = value.clone();
        for spec in before
            .iter()
            .chain(self.settings.fixers.iter())
            .chain(after.iter())
        {
            let (name, args) = Self::spec_name_and_args(spec)
                .ok_or_else(|| ConfigError::FixerNotFound(spec.to_string()))?;
            let fixer = self.fixers.get(name, None).map_err(|e| match e {
                FCollectionError::FunctionNotFound(n) => ConfigError::FixerNotFound(n),
                _ => ConfigError::FixerNotFound(name.to_owned()),
            })?;
            value = fixer(value, args);
        }
        Ok(value)
    }

    /// Transform the name of a setting before it is used in a
    /// command-line fragment. The chain folds: each namer sees the
    /// name produced by the previous one.
    pub fn apply_namers(
        &self,
        setting: &SettingRecord,
        before: &[Value],
        after: &[Value],
    ) -> Result<String, ConfigError> {
        let mut current = setting.clone();
        for spec in before
            .iter()
            .chain(self.settings.namers.iter())
            .chain(after.iter())
        {
            let (name, args) = Self::spec_name_and_args(spec)
                .ok_or_else(|| ConfigError::NamerNotFound(spec.to_string()))?;
            let namer = self.namers.get(name, None).map_err(|e| match e {
                FCollectionError::FunctionNotFound(n) => ConfigError::NamerNotFound(n),
                _ => ConfigError::NamerNotFound(name.to_owned()),
            })?;
            current.name = namer(&current, args);
        }
        Ok(current.name)
    }
}

impl std::fmt::Debug for Folder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Folder").field("folder", &self.folder).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    pub(crate) fn write_minimal_conf(root: &Path) {
        let conf_dir = root.join(MAIN_FOLDER);
        std::fs::create_dir_all(&conf_dir).unwrap();
        std::fs::write(
            conf_dir.join(CONF_FILENAME),
            serde_json::to_string_pretty(&json!({
                "exec": "./run.sh",
                "setting_pattern": "--{name} {value}",
                "settings": [
                    {
                        "set": "main",
                        "required": true,
                        "settings": [
                            {"name": "n", "default": 1},
                            {"name": "seed", "default": 0, "exclude": true}
                        ]
                    }
                ],
                "fixers": ["intFloats"],
                "default_config": "default"
            }))
            .unwrap(),
        )
        .unwrap();
    }

    #[test]
    fn t_open_requires_conf() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Folder::open(dir.path()).is_err());
        write_minimal_conf(dir.path());
        let folder = Folder::open(dir.path()).unwrap();
        assert_eq!(folder.settings().exec, "./run.sh");
    }

    #[test]
    fn t_missing_config_is_absent_not_error() {
        let dir = tempfile::tempdir().unwrap();
        write_minimal_conf(dir.path());
        let folder = Folder::open(dir.path()).unwrap();
        assert!(folder.config("generator", None).unwrap().is_none());
        // cached: still absent
        assert!(folder.config("generator", None).unwrap().is_none());
    }

    #[test]
    fn t_config_loaded_and_cached() {
        let dir = tempfile::tempdir().unwrap();
        write_minimal_conf(dir.path());
        let sub = dir.path().join(MAIN_FOLDER).join(CONFIG_FOLDER).join("default");
        std::fs::create_dir_all(&sub).unwrap();
        std::fs::write(sub.join("maker.json"), r#"{"max_corrupted": 2}"#).unwrap();

        let folder = Folder::open(dir.path()).unwrap();
        let conf = folder.config("maker", None).unwrap().unwrap();
        assert_eq!(conf.get("max_corrupted"), Some(&json!(2)));
        // deleting the file does not matter any more, the value is cached
        std::fs::remove_file(sub.join("maker.json")).unwrap();
        assert!(folder.config("maker", None).unwrap().is_some());
    }

    #[test]
    fn t_apply_fixers_chain_and_missing() {
        let dir = tempfile::tempdir().unwrap();
        write_minimal_conf(dir.path());
        let folder = Folder::open(dir.path()).unwrap();

        // configured intFloats collapses 2.0 into 2
        assert_eq!(folder.apply_fixers(&json!(2.0), &[], &[]).unwrap(), json!(2));
        // idempotent
        let once = folder.apply_fixers(&json!(2.0), &[], &[]).unwrap();
        assert_eq!(folder.apply_fixers(&once, &[], &[]).unwrap(), once);

        match folder.apply_fixers(&json!(1), &[json!("nope")], &[]) {
            Err(ConfigError::FixerNotFound(name)) => assert_eq!(name, "nope"),
            other => panic!("expected FixerNotFound, got {other:?}"),
        }
    }

    #[test]
    fn t_apply_namers() {
        let dir = tempfile::tempdir().unwrap();
        write_minimal_conf(dir.path());
        let folder = Folder::open(dir.path()).unwrap();
        let record = SettingRecord {
            name: "n".into(),
            value: json!(3),
            exclude: false,
            pattern: "--{name} {value}".into(),
        };
        let name = folder
            .apply_namers(&record, &[], &[json!(["suffix", "_max"])])
            .unwrap();
        assert_eq!(name, "n_max");
    }
}
