//! Renders the launcher script for a batch of simulations.
//!
//! The skeleton is user-supplied; the single
//! `### BEGIN_EXEC ### ... ### END_EXEC ###` block is repeated once
//! per worker, and `$NAME` placeholders receive the recipe values.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{anyhow, Result};
use lazy_static::lazy_static;
use regex::{Captures, Regex};
use serde_json::{Map, Value};

use crate::{
    ctx,
    folder::Folder,
    io_util,
    serde::proper_filename::ProperFilename,
    simulation::{value_to_string, Simulation},
};

#[derive(thiserror::Error, Debug)]
pub enum GeneratorError {
    #[error("no simulations to generate")]
    EmptyList,

    #[error("the destination folder {0:?} already exists")]
    DestinationFolderExists(PathBuf),

    #[error("the launch skeleton {0:?} does not exist")]
    ScriptNotFound(PathBuf),
}

/// The `generator` sub-config: skeleton, file names and worker count.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct Recipe {
    pub skeleton_filename: String,
    pub launch_filename: ProperFilename,
    /// Where the ordered command lines are stored, relative to the
    /// scripts folder.
    #[serde(default = "default_command_lines_filename")]
    pub command_lines_filename: ProperFilename,
    /// `%k` is replaced by the worker index inside exec blocks.
    pub log_filename: String,
    pub n_exec: usize,
    /// All recipe keys, upper-cased, become `$NAME` substitutions.
    #[serde(skip)]
    raw: Map<String, Value>,
}

fn default_command_lines_filename() -> ProperFilename {
    "command_lines.json".parse().expect("valid file name")
}

impl Recipe {
    pub fn from_map(map: Map<String, Value>) -> Result<Self> {
        let mut recipe: Recipe = serde_json::from_value(Value::Object(map.clone()))
            .map_err(ctx!("reading the generator recipe"))?;
        recipe.raw = map;
        Ok(recipe)
    }
}

lazy_static! {
    static ref EXEC_BLOCK_REGEX: Regex = Regex::new(
        r"(?ms)^[ \t]*#{3} BEGIN_EXEC #{3}[ \t]*\n(?P<content>.*?)^[ \t]*#{3} END_EXEC #{3}[ \t]*\n"
    )
    .expect("valid regex");
    static ref TEMPLATE_VAR_REGEX: Regex =
        Regex::new(r"\$(?:\$|\{(?P<braced>[A-Za-z_][A-Za-z0-9_]*)\}|(?P<named>[A-Za-z_][A-Za-z0-9_]*))")
            .expect("valid regex");
}

/// `$NAME` / `${NAME}` substitution; unknown names are left verbatim
/// and `$$` is an escaped dollar.
fn substitute(template: &str, variables: &Map<String, Value>) -> String {
    TEMPLATE_VAR_REGEX
        .replace_all(template, |caps: &Captures| {
            let name = caps
                .name("braced")
                .or_else(|| caps.name("named"))
                .map(|m| m.as_str());
            match name {
                None => "$".to_owned(),
                Some(name) => match variables.get(name) {
                    Some(value) => value_to_string(value),
                    None => caps[0].to_owned(),
                },
            }
        })
        .into_owned()
}

pub struct Generator {
    folder: Arc<Folder>,
    simulations: Vec<Simulation>,
}

impl Generator {
    pub fn new(folder: Arc<Folder>) -> Self {
        Self {
            folder,
            simulations: Vec::new(),
        }
    }

    pub fn folder(&self) -> &Arc<Folder> {
        &self.folder
    }

    pub fn add(&mut self, simulation: Simulation) {
        self.simulations.push(simulation);
    }

    pub fn add_all(&mut self, simulations: impl IntoIterator<Item = Simulation>) {
        self.simulations.extend(simulations);
    }

    pub fn clear(&mut self) {
        self.simulations.clear();
    }

    pub fn len(&self) -> usize {
        self.simulations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.simulations.is_empty()
    }

    /// The rendered command line of each pending simulation, in the
    /// order they were added.
    pub fn command_lines(&self) -> Result<Vec<String>> {
        self.simulations
            .iter()
            .map(|simulation| simulation.command_line())
            .collect()
    }

    fn create_destination_folder(dest: &Path, empty_dest: bool) -> Result<()> {
        if dest.is_dir() {
            if empty_dest {
                for entry in std::fs::read_dir(dest).map_err(ctx!("reading {dest:?}"))? {
                    let path = entry.map_err(ctx!("reading an entry of {dest:?}"))?.path();
                    if path.is_dir() {
                        std::fs::remove_dir_all(&path).map_err(ctx!("removing {path:?}"))?;
                    } else {
                        std::fs::remove_file(&path).map_err(ctx!("removing {path:?}"))?;
                    }
                }
            } else {
                return Err(GeneratorError::DestinationFolderExists(dest.to_owned()).into());
            }
        } else {
            std::fs::create_dir_all(dest).map_err(ctx!("creating {dest:?}"))?;
        }
        Ok(())
    }

    /// Render the per-worker exec blocks:
    /// `min(n_exec, simulations)` copies of the inner block, each
    /// with `$LOG_FILENAME` expanded for its worker index.
    fn replace_exec_blocks(&self, skeleton: &str, recipe: &Recipe) -> String {
        let n_workers = recipe.n_exec.min(self.simulations.len());
        EXEC_BLOCK_REGEX
            .replace_all(skeleton, |caps: &Captures| {
                let content = &caps["content"];
                (0..n_workers)
                    .map(|k| {
                        let mut variables = Map::new();
                        variables.insert(
                            "LOG_FILENAME".to_owned(),
                            Value::String(recipe.log_filename.replace("%k", &k.to_string())),
                        );
                        substitute(content, &variables)
                    })
                    .collect::<String>()
            })
            .into_owned()
    }

    /// Write `command_lines.json` and the launcher script into
    /// `dest`. Returns `(launch_path, log_path)`, both rooted in
    /// `basedir` (which defaults to `dest`).
    pub fn generate(
        &self,
        dest: &Path,
        config_name: Option<&str>,
        empty_dest: bool,
        basedir: Option<&Path>,
    ) -> Result<(PathBuf, PathBuf)> {
        if self.simulations.is_empty() {
            return Err(GeneratorError::EmptyList.into());
        }

        Self::create_destination_folder(dest, empty_dest)?;

        let recipe = Recipe::from_map(
            self.folder
                .config("generator", config_name)?
                .ok_or_else(|| anyhow!("the folder has no `generator` sub-config"))?
                .as_ref()
                .clone(),
        )?;

        let command_lines = self.command_lines()?;
        let command_lines_path = dest.join(recipe.command_lines_filename.as_str());
        std::fs::write(
            &command_lines_path,
            serde_json::to_string_pretty(&command_lines)?,
        )
        .map_err(ctx!("writing {command_lines_path:?}"))?;

        let skeleton_path = self
            .folder
            .config_filepath(&recipe.skeleton_filename, config_name)?;
        let skeleton = std::fs::read_to_string(&skeleton_path)
            .map_err(|_| GeneratorError::ScriptNotFound(skeleton_path.clone()))?;

        let script = self.replace_exec_blocks(&skeleton, &recipe);

        let basedir = basedir.unwrap_or(dest);
        let log_path = basedir.join(&recipe.log_filename);
        let mut variables: Map<String, Value> = recipe
            .raw
            .iter()
            .map(|(k, v)| (k.to_uppercase(), v.clone()))
            .collect();
        variables.insert(
            "COMMAND_LINES_FILENAME".to_owned(),
            Value::String(
                basedir
                    .join(recipe.command_lines_filename.as_str())
                    .display()
                    .to_string(),
            ),
        );
        variables.insert(
            "LOG_FILENAME".to_owned(),
            Value::String(log_path.display().to_string()),
        );
        let script = substitute(&script, &variables);

        let script_path = dest.join(recipe.launch_filename.as_str());
        std::fs::write(&script_path, script).map_err(ctx!("writing {script_path:?}"))?;
        io_util::make_executable(&script_path)?;

        Ok((basedir.join(recipe.launch_filename.as_str()), log_path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation::{Request, UserSetting};
    use serde_json::json;

    const SKELETON: &str = "\
#!/bin/sh
serve $COMMAND_LINES_FILENAME $LOG_FILENAME &
### BEGIN_EXEC ###
work >> $LOG_FILENAME &
### END_EXEC ###
wait
";

    fn fixture(n_exec: usize) -> (tempfile::TempDir, Arc<Folder>) {
        let dir = tempfile::tempdir().unwrap();
        let conf_dir = dir.path().join(".hateno");
        std::fs::create_dir_all(conf_dir.join("config/default")).unwrap();
        std::fs::create_dir_all(conf_dir.join("skeletons")).unwrap();
        std::fs::write(
            conf_dir.join("hateno.conf"),
            serde_json::to_string(&json!({
                "exec": "./run.sh",
                "setting_pattern": "--{name} {value}",
                "settings": [
                    {
                        "set": "main",
                        "required": true,
                        "settings": [{"name": "n", "default": 1}]
                    }
                ],
                "default_config": "default"
            }))
            .unwrap(),
        )
        .unwrap();
        std::fs::write(
            conf_dir.join("config/default/generator.json"),
            serde_json::to_string(&json!({
                "skeleton_filename": "launch.skeleton.sh",
                "launch_filename": "launch.sh",
                "log_filename": "exec-%k.log",
                "n_exec": n_exec
            }))
            .unwrap(),
        )
        .unwrap();
        std::fs::write(conf_dir.join("skeletons/launch.skeleton.sh"), SKELETON).unwrap();
        let folder = Arc::new(Folder::open(dir.path()).unwrap());
        (dir, folder)
    }

    fn sim(folder: &Arc<Folder>, n: i64) -> Simulation {
        Simulation::new(
            folder.clone(),
            Request {
                folder: PathBuf::from(format!("dest-{n}")),
                settings: vec![UserSetting {
                    set: "main".into(),
                    set_index: 0,
                    name: "n".into(),
                    value: json!(n),
                }],
                globals: Map::new(),
            },
        )
    }

    #[test]
    fn t_empty_list_refused() {
        let (dir, folder) = fixture(2);
        let generator = Generator::new(folder);
        let err = generator
            .generate(&dir.path().join("scripts"), None, false, None)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<GeneratorError>(),
            Some(GeneratorError::EmptyList)
        ));
    }

    #[test]
    fn t_existing_destination_refused_unless_emptied() {
        let (dir, folder) = fixture(2);
        let mut generator = Generator::new(folder.clone());
        generator.add(sim(&folder, 1));

        let dest = dir.path().join("scripts");
        std::fs::create_dir_all(&dest).unwrap();
        std::fs::write(dest.join("leftover"), b"x").unwrap();

        let err = generator.generate(&dest, None, false, None).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<GeneratorError>(),
            Some(GeneratorError::DestinationFolderExists(_))
        ));

        generator.generate(&dest, None, true, None).unwrap();
        assert!(!dest.join("leftover").exists());
        assert!(dest.join("launch.sh").exists());
    }

    #[test]
    fn t_worker_blocks_and_command_lines() {
        let (dir, folder) = fixture(3);
        let mut generator = Generator::new(folder.clone());
        generator.add_all([sim(&folder, 1), sim(&folder, 2)]);

        let dest = dir.path().join("scripts");
        let basedir = PathBuf::from("/remote/scripts");
        let (launch_path, log_path) = generator
            .generate(&dest, None, false, Some(&basedir))
            .unwrap();
        assert_eq!(launch_path, basedir.join("launch.sh"));
        assert_eq!(log_path, basedir.join("exec-%k.log"));

        // two simulations, three workers configured: two blocks, with
        // distinct per-worker logs
        let script = std::fs::read_to_string(dest.join("launch.sh")).unwrap();
        assert_eq!(script.matches("work >>").count(), 2);
        assert!(script.contains("work >> exec-0.log &"));
        assert!(script.contains("work >> exec-1.log &"));
        assert!(!script.contains("exec-2.log"));
        // the whole-script pass resolved against basedir
        assert!(script.contains("serve /remote/scripts/command_lines.json"));

        let command_lines: Vec<String> = serde_json::from_str(
            &std::fs::read_to_string(dest.join("command_lines.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(
            command_lines,
            vec!["./run.sh --n 1".to_string(), "./run.sh --n 2".to_string()]
        );

        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(dest.join("launch.sh"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o111, 0o111);
    }

    #[test]
    fn t_substitute_rules() {
        let mut vars = Map::new();
        vars.insert("NAME".to_owned(), json!("value"));
        assert_eq!(substitute("x $NAME y", &vars), "x value y");
        assert_eq!(substitute("x ${NAME}y", &vars), "x valuey");
        assert_eq!(substitute("$UNKNOWN stays", &vars), "$UNKNOWN stays");
        assert_eq!(substitute("$$NAME", &vars), "$NAME");
    }
}
