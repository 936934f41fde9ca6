//! A simulation, identified by its settings.
//!
//! The *raw settings* are materialized lazily from the user's setting
//! references plus the folder's defaults: one occurrence per supplied
//! `(set, set_index)` pair, in the order the folder configuration
//! declares the sets, plus a default-only occurrence for required
//! sets the user did not mention. Fixers run on every value at
//! materialization time, so both the identity hash and the rendered
//! command line see normalized values.

use std::{
    cell::OnceCell,
    collections::BTreeSet,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{anyhow, Result};
use itertools::Itertools;
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::{Map, Value};

use crate::{
    folder::Folder,
    identity,
    serde::archive_name::ArchiveName,
};

/// One fully-resolved setting inside an occurrence.
#[derive(Debug, Clone, PartialEq)]
pub struct SettingRecord {
    pub name: String,
    pub value: Value,
    /// Excluded records do not take part in the identity hash.
    pub exclude: bool,
    pub pattern: String,
}

/// One occurrence of a setting set.
#[derive(Debug, Clone, PartialEq)]
pub struct SettingsOccurrence {
    pub set: String,
    pub set_index: usize,
    pub settings: Vec<SettingRecord>,
}

/// A user setting reference, as given in a request.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct UserSetting {
    pub set: String,
    #[serde(default)]
    pub set_index: usize,
    pub name: String,
    pub value: Value,
}

/// Points at one setting record inside the raw settings.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SettingSelector {
    pub set: String,
    #[serde(default)]
    pub set_index: usize,
    pub name: String,
}

/// A requested simulation: where its files should appear, and the
/// setting values identifying it. Extra top-level keys are kept as
/// *global settings*, reachable from `{globalsetting:NAME}` tags.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Request {
    pub folder: PathBuf,
    #[serde(default)]
    pub settings: Vec<UserSetting>,
    #[serde(flatten)]
    pub globals: Map<String, Value>,
}

pub struct Simulation {
    folder: Arc<Folder>,
    request: Request,
    raw_settings: OnceCell<Vec<SettingsOccurrence>>,
}

/// Render a value the way it appears on a command line: strings bare,
/// everything else as its JSON representation.
pub fn value_to_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

lazy_static! {
    static ref SETTING_TAG_REGEX: Regex =
        Regex::new(r"\{(?P<category>(?:global)?setting):(?P<name>[^}]+)\}").expect("valid regex");
}

impl Simulation {
    pub fn new(folder: Arc<Folder>, request: Request) -> Self {
        Self {
            folder,
            request,
            raw_settings: OnceCell::new(),
        }
    }

    pub fn folder(&self) -> &Arc<Folder> {
        &self.folder
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    /// The destination folder of the simulation's files.
    pub fn folder_path(&self) -> &Path {
        &self.request.folder
    }

    pub fn set_folder_path(&mut self, path: PathBuf) {
        self.request.folder = path;
    }

    /// Read a request-level value: `folder`, or one of the free-form
    /// global settings.
    pub fn global_setting(&self, key: &str) -> Option<Value> {
        if key == "folder" {
            Some(Value::String(self.request.folder.display().to_string()))
        } else {
            self.request.globals.get(key).cloned()
        }
    }

    pub fn set_global_setting(&mut self, key: &str, value: Value) {
        if key == "folder" {
            if let Value::String(s) = &value {
                self.request.folder = PathBuf::from(s);
                return;
            }
        }
        self.request.globals.insert(key.to_owned(), value);
    }

    /// A deep copy with the destination folder cleared.
    pub fn copy(&self) -> Self {
        let mut request = self.request.clone();
        request.folder = PathBuf::new();
        Self {
            folder: self.folder.clone(),
            request,
            raw_settings: OnceCell::new(),
        }
    }

    fn generate_settings(&self) -> Result<Vec<SettingsOccurrence>> {
        let folder_settings = self.folder.settings();
        let mut occurrences = Vec::new();

        for set_config in &folder_settings.settings {
            let defaults: Vec<SettingRecord> = set_config
                .settings
                .iter()
                .map(|s| -> Result<SettingRecord> {
                    Ok(SettingRecord {
                        name: s.name.clone(),
                        value: self.folder.apply_fixers(&s.default, &[], &[])?,
                        exclude: s.exclude,
                        pattern: s
                            .pattern
                            .clone()
                            .unwrap_or_else(|| folder_settings.setting_pattern.clone()),
                    })
                })
                .collect::<Result<_>>()?;

            let supplied_indexes: BTreeSet<usize> = self
                .request
                .settings
                .iter()
                .filter(|u| u.set == set_config.set)
                .map(|u| u.set_index)
                .collect();

            if supplied_indexes.is_empty() {
                if set_config.required {
                    occurrences.push(SettingsOccurrence {
                        set: set_config.set.clone(),
                        set_index: 0,
                        settings: defaults,
                    });
                }
                continue;
            }

            for set_index in supplied_indexes {
                let mut settings = defaults.clone();
                for user in self
                    .request
                    .settings
                    .iter()
                    .filter(|u| u.set == set_config.set && u.set_index == set_index)
                {
                    // A name the folder does not declare is ignored.
                    if let Some(record) = settings.iter_mut().find(|r| r.name == user.name) {
                        record.value = self.folder.apply_fixers(&user.value, &[], &[])?;
                    }
                }
                occurrences.push(SettingsOccurrence {
                    set: set_config.set.clone(),
                    set_index,
                    settings,
                });
            }
        }

        Ok(occurrences)
    }

    /// The raw settings, generated on first access and cached.
    pub fn raw_settings(&self) -> Result<&Vec<SettingsOccurrence>> {
        if let Some(raw) = self.raw_settings.get() {
            return Ok(raw);
        }
        let generated = self.generate_settings()?;
        Ok(self.raw_settings.get_or_init(|| generated))
    }

    /// Canonical settings: the identity-bearing projection, excluded
    /// records removed.
    pub fn settings(&self) -> Result<Vec<Map<String, Value>>> {
        Ok(self
            .raw_settings()?
            .iter()
            .map(|occurrence| {
                occurrence
                    .settings
                    .iter()
                    .filter(|s| !s.exclude)
                    .map(|s| (s.name.clone(), s.value.clone()))
                    .collect()
            })
            .collect())
    }

    fn settings_value(&self) -> Result<Value> {
        Ok(Value::Array(
            self.settings()?.into_iter().map(Value::Object).collect(),
        ))
    }

    /// The canonical settings as the base64 string stored in the
    /// catalog.
    pub fn settings_b64(&self) -> Result<String> {
        Ok(identity::object_to_base64(&self.settings_value()?))
    }

    /// The simulation's identity.
    pub fn name(&self) -> Result<ArchiveName> {
        Ok(identity::archive_name(&self.settings_value()?))
    }

    /// Per occurrence, the rendered command-line fragments. Setting
    /// tags inside a fragment (e.g. a value of
    /// `"{globalsetting:folder}"`) are resolved here, at render time,
    /// so they never touch the identity hash.
    pub fn settings_as_strings(&self) -> Result<Vec<Vec<String>>> {
        self.raw_settings()?
            .iter()
            .map(|occurrence| {
                occurrence
                    .settings
                    .iter()
                    .map(|record| -> Result<String> {
                        let name = self.folder.apply_namers(record, &[], &[])?;
                        let fragment = record
                            .pattern
                            .replace("{name}", &name)
                            .replace("{value}", &value_to_string(&record.value));
                        self.parse_string(&fragment)
                    })
                    .collect()
            })
            .collect()
    }

    /// The command line generating this simulation.
    pub fn command_line(&self) -> Result<String> {
        let fragments = self.settings_as_strings()?;
        Ok(std::iter::once(self.folder.settings().exec.clone())
            .chain(fragments.into_iter().flatten())
            .join(" "))
    }

    /// A mutable handle to one setting record of the raw settings.
    pub fn get_setting(&mut self, selector: &SettingSelector) -> Result<&mut SettingRecord> {
        self.raw_settings()?;
        let raw = self
            .raw_settings
            .get_mut()
            .expect("just generated above");
        raw.iter_mut()
            .find(|o| o.set == selector.set && o.set_index == selector.set_index)
            .and_then(|o| o.settings.iter_mut().find(|s| s.name == selector.name))
            .ok_or_else(|| {
                anyhow!(
                    "no setting {:?} in occurrence {} of set {:?}",
                    selector.name,
                    selector.set_index,
                    selector.set
                )
            })
    }

    /// All occurrences folded into a single map, later occurrences
    /// winning.
    pub fn reduced_settings(&self) -> Result<Map<String, Value>> {
        let mut reduced = Map::new();
        for map in self.settings()? {
            for (k, v) in map {
                reduced.insert(k, v);
            }
        }
        Ok(reduced)
    }

    /// Replace `{setting:NAME}` tags with the simulation's reduced
    /// settings and `{globalsetting:NAME}` tags with request-level
    /// values. Unknown tags are left verbatim.
    pub fn parse_string(&self, s: &str) -> Result<String> {
        let reduced = self.reduced_settings()?;
        let mut parsed = String::new();
        let mut k0 = 0;
        for m in SETTING_TAG_REGEX.captures_iter(s) {
            let whole = m.get(0).expect("group 0 always present");
            let name = &m["name"];
            let replacement = match &m["category"] {
                "setting" => reduced.get(name).map(value_to_string),
                "globalsetting" => self.global_setting(name).as_ref().map(value_to_string),
                _ => unreachable!("regex only matches the two categories"),
            };
            parsed.push_str(&s[k0..whole.start()]);
            match replacement {
                Some(r) => parsed.push_str(&r),
                None => parsed.push_str(whole.as_str()),
            }
            k0 = whole.end();
        }
        parsed.push_str(&s[k0..]);
        Ok(parsed)
    }
}

impl std::fmt::Debug for Simulation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Simulation")
            .field("request", &self.request)
            .finish()
    }
}

impl Clone for Simulation {
    fn clone(&self) -> Self {
        Self {
            folder: self.folder.clone(),
            request: self.request.clone(),
            raw_settings: OnceCell::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fixture() -> (tempfile::TempDir, Arc<Folder>) {
        let dir = tempfile::tempdir().unwrap();
        let conf_dir = dir.path().join(".hateno");
        std::fs::create_dir_all(&conf_dir).unwrap();
        std::fs::write(
            conf_dir.join("hateno.conf"),
            serde_json::to_string(&json!({
                "exec": "./cos.sh",
                "setting_pattern": "--{name} {value}",
                "settings": [
                    {
                        "set": "main",
                        "required": true,
                        "settings": [
                            {"name": "n", "default": 1},
                            {"name": "tag", "default": "a", "exclude": true}
                        ]
                    },
                    {
                        "set": "output",
                        "required": false,
                        "settings": [
                            {"name": "file", "default": "out.txt", "pattern": "-o {value}"}
                        ]
                    }
                ],
                "fixers": ["intFloats"]
            }))
            .unwrap(),
        )
        .unwrap();
        let folder = Arc::new(Folder::open(dir.path()).unwrap());
        (dir, folder)
    }

    fn request(settings: Vec<UserSetting>) -> Request {
        Request {
            folder: PathBuf::from("dest"),
            settings,
            globals: Map::new(),
        }
    }

    fn user(set: &str, set_index: usize, name: &str, value: Value) -> UserSetting {
        UserSetting {
            set: set.into(),
            set_index,
            name: name.into(),
            value,
        }
    }

    #[test]
    fn t_default_only_occurrence_for_required_set() {
        let (_dir, folder) = fixture();
        let sim = Simulation::new(folder, request(vec![]));
        let settings = sim.settings().unwrap();
        // only the required set appears, with the excluded setting removed
        assert_eq!(settings.len(), 1);
        assert_eq!(settings[0].get("n"), Some(&json!(1)));
        assert_eq!(settings[0].get("tag"), None);
    }

    #[test]
    fn t_multiple_occurrences_in_index_order() {
        let (_dir, folder) = fixture();
        let sim = Simulation::new(
            folder,
            request(vec![
                user("output", 1, "file", json!("b.txt")),
                user("output", 0, "file", json!("a.txt")),
                user("main", 0, "n", json!(7)),
            ]),
        );
        let strings = sim.settings_as_strings().unwrap();
        assert_eq!(
            strings,
            vec![
                vec!["--n 7".to_string(), "--tag a".to_string()],
                vec!["-o a.txt".to_string()],
                vec!["-o b.txt".to_string()],
            ]
        );
        assert_eq!(
            sim.command_line().unwrap(),
            "./cos.sh --n 7 --tag a -o a.txt -o b.txt"
        );
    }

    #[test]
    fn t_identity_ignores_excluded_and_input_order() {
        let (_dir, folder) = fixture();
        let a = Simulation::new(
            folder.clone(),
            request(vec![
                user("main", 0, "n", json!(2)),
                user("main", 0, "tag", json!("x")),
            ]),
        );
        let b = Simulation::new(
            folder,
            request(vec![
                user("main", 0, "tag", json!("y")),
                user("main", 0, "n", json!(2)),
            ]),
        );
        // `tag` is excluded, so both have the same identity
        assert_eq!(a.name().unwrap(), b.name().unwrap());
    }

    #[test]
    fn t_fixers_collapse_identity() {
        let (_dir, folder) = fixture();
        let a = Simulation::new(folder.clone(), request(vec![user("main", 0, "n", json!(2))]));
        let b = Simulation::new(folder, request(vec![user("main", 0, "n", json!(2.0))]));
        assert_eq!(a.name().unwrap(), b.name().unwrap());
    }

    #[test]
    fn t_get_setting_handle() {
        let (_dir, folder) = fixture();
        let mut sim = Simulation::new(folder, request(vec![]));
        let record = sim
            .get_setting(&SettingSelector {
                set: "main".into(),
                set_index: 0,
                name: "n".into(),
            })
            .unwrap();
        record.value = json!(9);
        assert_eq!(sim.settings().unwrap()[0].get("n"), Some(&json!(9)));
        assert!(sim
            .get_setting(&SettingSelector {
                set: "main".into(),
                set_index: 0,
                name: "missing".into(),
            })
            .is_err());
    }

    #[test]
    fn t_parse_string_tags() {
        let (_dir, folder) = fixture();
        let mut request = request(vec![user("main", 0, "n", json!(4))]);
        request.globals.insert("label".into(), json!("run-A"));
        let sim = Simulation::new(folder, request);
        assert_eq!(
            sim.parse_string("data-{setting:n}/{globalsetting:label}").unwrap(),
            "data-4/run-A"
        );
        assert_eq!(
            sim.parse_string("{setting:unknown} stays").unwrap(),
            "{setting:unknown} stays"
        );
    }

    #[test]
    fn t_folder_tag_renders_into_fragments_but_not_identity() {
        let (_dir, folder) = fixture();
        let mut sim = Simulation::new(
            folder,
            request(vec![user(
                "output",
                0,
                "file",
                json!("{globalsetting:folder}/out.txt"),
            )]),
        );
        assert!(sim
            .command_line()
            .unwrap()
            .ends_with("-o dest/out.txt"));

        // moving the destination folder changes the rendering only
        let name_before = sim.name().unwrap();
        sim.set_folder_path(PathBuf::from("elsewhere"));
        assert!(sim
            .command_line()
            .unwrap()
            .ends_with("-o elsewhere/out.txt"));
        assert_eq!(sim.name().unwrap(), name_before);
    }

    #[test]
    fn t_copy_clears_folder() {
        let (_dir, folder) = fixture();
        let sim = Simulation::new(folder, request(vec![]));
        let copy = sim.copy();
        assert_eq!(copy.folder_path(), Path::new(""));
        assert_eq!(copy.name().unwrap(), sim.name().unwrap());
    }

    #[test]
    fn t_reduced_settings_last_occurrence_wins() {
        let (_dir, folder) = fixture();
        let sim = Simulation::new(
            folder,
            request(vec![
                user("output", 0, "file", json!("a.txt")),
                user("output", 1, "file", json!("b.txt")),
            ]),
        );
        let reduced = sim.reduced_settings().unwrap();
        assert_eq!(reduced.get("file"), Some(&json!("b.txt")));
        assert_eq!(reduced.get("n"), Some(&json!(1)));
    }
}
