//! Integrity checkers for produced simulation folders.
//!
//! Three categories: *file* and *folder* checkers get one declared
//! output entry (its name already resolved, possibly still a glob
//! pattern); *global* checkers get the whole declared output tree.
//! Glob patterns are honored: an existence check passes if at least
//! one match of the right kind exists.

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::Result;
use walkdir::WalkDir;

use crate::{
    fcollection::{FCollection, FCollectionError},
    simulation::Simulation,
};

/// The declared outputs of a simulation, names resolved.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutputTree {
    pub files: Vec<String>,
    pub folders: Vec<String>,
}

pub type EntryChecker = fn(&Simulation, &str) -> Result<bool>;
pub type GlobalChecker = fn(&Simulation, &OutputTree) -> Result<bool>;

#[derive(Clone, Copy)]
pub enum Checker {
    Entry(EntryChecker),
    Global(GlobalChecker),
}

#[derive(thiserror::Error, Debug)]
pub enum CheckerError {
    #[error("no checkers category named {0:?}")]
    CheckersCategoryNotFound(String),

    #[error("no checker named {name:?} in category {category:?}")]
    CheckerNotFound { category: String, name: String },
}

/// The checker registry, preloaded with the built-ins below.
pub struct Checkers {
    collection: FCollection<Checker>,
}

impl Checkers {
    pub fn new() -> Self {
        let mut collection = FCollection::with_categories(["file", "folder", "global"]);
        collection
            .set_filter_regex(r"^(?P<category>file|folder|global)_(?P<name>[A-Za-z0-9_]+)$")
            .expect("valid regex");
        collection
            .load_entries(BUILTINS.iter().map(|(n, c)| (*n, *c)))
            .expect("built-in names all match the filter");
        Self { collection }
    }

    pub fn set(&mut self, category: &str, name: impl Into<String>, checker: Checker)
        -> Result<(), CheckerError>
    {
        self.collection
            .set(name, checker, Some(category))
            .map_err(|_| CheckerError::CheckersCategoryNotFound(category.to_owned()))
    }

    pub fn remove(&mut self, category: &str, name: &str) -> Result<(), CheckerError> {
        self.collection
            .delete(name, Some(category))
            .map_err(|e| match e {
                FCollectionError::CategoryNotFound(c) => CheckerError::CheckersCategoryNotFound(c),
                _ => CheckerError::CheckerNotFound {
                    category: category.to_owned(),
                    name: name.to_owned(),
                },
            })
    }

    pub fn get(&self, category: &str, name: &str) -> Result<Checker, CheckerError> {
        self.collection
            .get(name, Some(category))
            .copied()
            .map_err(|e| match e {
                FCollectionError::CategoryNotFound(c) => CheckerError::CheckersCategoryNotFound(c),
                _ => CheckerError::CheckerNotFound {
                    category: category.to_owned(),
                    name: name.to_owned(),
                },
            })
    }
}

impl Default for Checkers {
    fn default() -> Self {
        Self::new()
    }
}

fn matches_in(simulation: &Simulation, pattern: &str) -> Result<Vec<std::path::PathBuf>> {
    let full = simulation.folder_path().join(pattern);
    let full = full.to_string_lossy();
    let paths = glob::glob(&full)
        .map_err(crate::ctx!("invalid glob pattern {full:?}"))?
        .filter_map(|entry| entry.ok())
        .collect();
    Ok(paths)
}

/// At least one matching regular file exists.
fn file_exists(simulation: &Simulation, filename: &str) -> Result<bool> {
    Ok(matches_in(simulation, filename)?
        .iter()
        .any(|p| p.is_file()))
}

/// At least one matching regular file has nonzero size.
fn file_not_empty(simulation: &Simulation, filename: &str) -> Result<bool> {
    for path in matches_in(simulation, filename)? {
        if path.is_file() && std::fs::metadata(&path)?.len() != 0 {
            return Ok(true);
        }
    }
    Ok(false)
}

/// At least one matching folder exists.
fn folder_exists(simulation: &Simulation, foldername: &str) -> Result<bool> {
    Ok(matches_in(simulation, foldername)?.iter().any(|p| p.is_dir()))
}

/// At least one matching folder has at least one entry.
fn folder_not_empty(simulation: &Simulation, foldername: &str) -> Result<bool> {
    for path in matches_in(simulation, foldername)? {
        if path.is_dir() && std::fs::read_dir(&path)?.next().is_some() {
            return Ok(true);
        }
    }
    Ok(false)
}

fn relative_to<'p>(path: &'p Path, base: &Path) -> &'p Path {
    path.strip_prefix(base).unwrap_or(path)
}

/// The walked tree contains exactly the declared entries (after glob
/// expansion): no more files or folders than the output declares.
fn global_no_more(simulation: &Simulation, tree: &OutputTree) -> Result<bool> {
    let base = simulation.folder_path();

    let mut walked_files = BTreeSet::new();
    let mut walked_folders = BTreeSet::new();
    for entry in WalkDir::new(base).min_depth(1) {
        let entry = entry?;
        let rel = relative_to(entry.path(), base).to_path_buf();
        if entry.file_type().is_dir() {
            walked_folders.insert(rel);
        } else {
            walked_files.insert(rel);
        }
    }

    let expand = |patterns: &[String]| -> Result<BTreeSet<std::path::PathBuf>> {
        let mut matched = BTreeSet::new();
        for pattern in patterns {
            for path in matches_in(simulation, pattern)? {
                matched.insert(relative_to(&path, base).to_path_buf());
            }
        }
        Ok(matched)
    };

    Ok(walked_files == expand(&tree.files)? && walked_folders == expand(&tree.folders)?)
}

const BUILTINS: &[(&str, Checker)] = &[
    ("file_exists", Checker::Entry(file_exists)),
    ("file_notEmpty", Checker::Entry(file_not_empty)),
    ("folder_exists", Checker::Entry(folder_exists)),
    ("folder_notEmpty", Checker::Entry(folder_not_empty)),
    ("global_noMore", Checker::Global(global_no_more)),
];
