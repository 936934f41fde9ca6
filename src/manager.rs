//! The simulations catalog: content-addressed compressed archives
//! plus the `simulations.list` mapping.
//!
//! A Manager holds the folder's presence marker for its whole
//! lifetime; a second Manager on the same folder is refused. Batch
//! operations defer the catalog write until the batch completes and
//! classify per-simulation errors as *store* (returned to the
//! caller), *pass* (ignored) or propagate.

use std::{
    collections::BTreeMap,
    fs::File,
    path::PathBuf,
    sync::Arc,
};

use anyhow::{anyhow, Result};
use bzip2::{read::BzDecoder, write::BzEncoder};

use crate::{
    checkers::{Checker, CheckerError, Checkers, OutputTree},
    ctx,
    folder::Folder,
    io_util,
    lockable_file::StandaloneExclusiveFileLock,
    serde::archive_name::ArchiveName,
    simulation::Simulation,
};

#[derive(thiserror::Error, Debug)]
pub enum ManagerError {
    #[error("the simulation folder {0:?} does not exist")]
    SimulationFolderNotFound(PathBuf),

    #[error("no simulation named {0} in the catalog")]
    SimulationNotFound(ArchiveName),

    #[error("the destination folder {0:?} already exists")]
    SimulationFolderAlreadyExist(PathBuf),

    #[error("integrity check failed for {0:?}")]
    SimulationIntegrityCheckFailed(PathBuf),

    #[error(transparent)]
    Checker(#[from] CheckerError),

    #[error("{0:#}")]
    Other(#[from] anyhow::Error),
}

/// The classification key of a `ManagerError`, for the batch
/// store/pass filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerErrorKind {
    SimulationFolderNotFound,
    SimulationNotFound,
    SimulationFolderAlreadyExist,
    SimulationIntegrityCheckFailed,
    Checker,
    Other,
}

impl ManagerError {
    pub fn kind(&self) -> ManagerErrorKind {
        match self {
            ManagerError::SimulationFolderNotFound(_) => ManagerErrorKind::SimulationFolderNotFound,
            ManagerError::SimulationNotFound(_) => ManagerErrorKind::SimulationNotFound,
            ManagerError::SimulationFolderAlreadyExist(_) => {
                ManagerErrorKind::SimulationFolderAlreadyExist
            }
            ManagerError::SimulationIntegrityCheckFailed(_) => {
                ManagerErrorKind::SimulationIntegrityCheckFailed
            }
            ManagerError::Checker(_) => ManagerErrorKind::Checker,
            ManagerError::Other(_) => ManagerErrorKind::Other,
        }
    }
}

/// Options shared by the batch operations.
#[derive(Debug, Clone, Copy, Default)]
pub struct BatchOptions<'a> {
    /// When given, write the simulation's request as JSON under this
    /// file name inside the simulation folder.
    pub settings_file: Option<&'a str>,
}

pub struct Manager {
    folder: Arc<Folder>,
    // Held for the Manager's lifetime; the file is removed on drop.
    running_marker: Option<StandaloneExclusiveFileLock>,
    simulations_list: Option<BTreeMap<String, String>>,
    checkers: Checkers,
}

impl Manager {
    /// Open the catalog, taking the folder's presence marker. Fails
    /// if another Manager is active on the same folder.
    pub fn new(folder: Arc<Folder>) -> Result<Self> {
        let marker_path = folder.running_manager_indicator_filename();
        let running_marker = StandaloneExclusiveFileLock::try_lock_path(&marker_path, || {
            format!("a Manager is already running on {:?}", folder.folder())
        })
        .map_err(|e| anyhow!("{e}"))?;
        Ok(Self {
            folder,
            running_marker: Some(running_marker),
            simulations_list: None,
            checkers: Checkers::new(),
        })
    }

    pub fn folder(&self) -> &Arc<Folder> {
        &self.folder
    }

    /// Register or replace a checker (user extension).
    pub fn set_checker(
        &mut self,
        category: &str,
        name: impl Into<String>,
        checker: Checker,
    ) -> Result<(), CheckerError> {
        self.checkers.set(category, name, checker)
    }

    pub fn remove_checker(&mut self, category: &str, name: &str) -> Result<(), CheckerError> {
        self.checkers.remove(category, name)
    }

    fn simulations_list(&mut self) -> Result<&mut BTreeMap<String, String>> {
        if self.simulations_list.is_none() {
            let path = self.folder.simulations_list_filename();
            let loaded: Option<BTreeMap<String, String>> =
                crate::load_config_file::try_load_json_file(&path)?;
            self.simulations_list = Some(loaded.unwrap_or_default());
        }
        Ok(self.simulations_list.as_mut().expect("just filled above"))
    }

    /// The number of catalogued simulations.
    pub fn count(&mut self) -> Result<usize> {
        Ok(self.simulations_list()?.len())
    }

    /// Whether a simulation with these settings is catalogued.
    pub fn contains(&mut self, simulation: &Simulation) -> Result<bool> {
        let name = simulation.name()?;
        Ok(self.simulations_list()?.contains_key(name.as_str()))
    }

    /// Write the catalog mapping back to `simulations.list`.
    pub fn save_simulations_list(&mut self) -> Result<()> {
        let path = self.folder.simulations_list_filename();
        let list = self.simulations_list()?;
        let contents = serde_json::to_string_pretty(list)?;
        std::fs::write(&path, contents).map_err(ctx!("writing {path:?}"))?;
        Ok(())
    }

    /// Check the integrity of a produced simulation folder against
    /// the declared outputs.
    pub fn check_integrity(&self, simulation: &Simulation) -> Result<bool, ManagerError> {
        let output = match &self.folder.settings().output {
            Some(output) => output.clone(),
            None => return Ok(true),
        };

        let mut tree = OutputTree::default();

        for (entries, category, target) in [
            (&output.files, "file", &mut tree.files),
            (&output.folders, "folder", &mut tree.folders),
        ] {
            for entry in entries {
                let parsed_name = simulation.parse_string(&entry.name)?;
                target.push(parsed_name.clone());
                for checker_name in &entry.checks {
                    match self.checkers.get(category, checker_name)? {
                        Checker::Entry(f) => {
                            if !f(simulation, &parsed_name)? {
                                return Ok(false);
                            }
                        }
                        Checker::Global(_) => {
                            return Err(CheckerError::CheckerNotFound {
                                category: category.to_owned(),
                                name: checker_name.clone(),
                            }
                            .into())
                        }
                    }
                }
            }
        }

        for checker_name in &output.checks {
            match self.checkers.get("global", checker_name)? {
                Checker::Global(f) => {
                    if !f(simulation, &tree)? {
                        return Ok(false);
                    }
                }
                Checker::Entry(_) => {
                    return Err(CheckerError::CheckerNotFound {
                        category: "global".to_owned(),
                        name: checker_name.clone(),
                    }
                    .into())
                }
            }
        }

        Ok(true)
    }

    fn archive_path(&self, name: &ArchiveName) -> Result<PathBuf> {
        Ok(self.folder.simulations_folder()?.join(name.archive_filename()))
    }

    /// Compress a simulation folder into its archive and delete the
    /// source. The archive holds a single top-level directory equal
    /// to the name.
    fn compress(&self, folder: &std::path::Path, name: &ArchiveName) -> Result<()> {
        let archive_path = self.archive_path(name)?;
        let file = File::create(&archive_path).map_err(ctx!("creating {archive_path:?}"))?;
        let encoder = BzEncoder::new(file, bzip2::Compression::best());
        let mut tar = tar::Builder::new(encoder);
        tar.append_dir_all(name.as_str(), folder)
            .map_err(ctx!("archiving {folder:?}"))?;
        tar.into_inner()
            .map_err(ctx!("finishing archive {archive_path:?}"))?
            .finish()
            .map_err(ctx!("finishing bzip2 stream of {archive_path:?}"))?;
        std::fs::remove_dir_all(folder).map_err(ctx!("removing {folder:?}"))?;
        Ok(())
    }

    /// Extract an archive into `destination` (which must not exist
    /// yet; parents are created). The archive is kept.
    fn uncompress(&self, name: &ArchiveName, destination: &std::path::Path) -> Result<()> {
        let archive_path = self.archive_path(name)?;
        let file = File::open(&archive_path).map_err(ctx!("opening {archive_path:?}"))?;
        let mut tar = tar::Archive::new(BzDecoder::new(file));
        let scratch = self.folder.tempdir()?;
        tar.unpack(&scratch).map_err(ctx!("unpacking {archive_path:?}"))?;
        if let Some(parent) = destination.parent() {
            if !parent.as_os_str().is_empty() && !parent.is_dir() {
                std::fs::create_dir_all(parent).map_err(ctx!("creating {parent:?}"))?;
            }
        }
        io_util::move_dir(&scratch.join(name.as_str()), destination)?;
        std::fs::remove_dir_all(&scratch).ok();
        Ok(())
    }

    /// Add a simulation: check its folder, run integrity checks,
    /// archive it (deleting the source folder) and record the
    /// mapping.
    pub fn add(&mut self, simulation: &Simulation, save_list: bool) -> Result<(), ManagerError> {
        let folder_path = simulation.folder_path().to_owned();
        if !folder_path.is_dir() {
            return Err(ManagerError::SimulationFolderNotFound(folder_path));
        }

        let settings_str = simulation.settings_b64()?;
        let name = simulation.name()?;

        if !self.check_integrity(simulation)? {
            return Err(ManagerError::SimulationIntegrityCheckFailed(folder_path));
        }

        self.compress(&folder_path, &name)?;
        self.simulations_list()?
            .insert(name.as_str().to_owned(), settings_str);

        if save_list {
            self.save_simulations_list()?;
        }
        Ok(())
    }

    /// Delete a simulation: archive and mapping entry.
    pub fn delete(&mut self, simulation: &Simulation, save_list: bool) -> Result<(), ManagerError> {
        let name = simulation.name()?;
        if !self.simulations_list()?.contains_key(name.as_str()) {
            return Err(ManagerError::SimulationNotFound(name));
        }

        let archive_path = self.archive_path(&name)?;
        std::fs::remove_file(&archive_path).map_err(ctx!("removing {archive_path:?}"))?;
        self.simulations_list()?.remove(name.as_str());

        if save_list {
            self.save_simulations_list()?;
        }
        Ok(())
    }

    /// Extract a simulation into its destination folder.
    pub fn extract(&mut self, simulation: &Simulation) -> Result<(), ManagerError> {
        let name = simulation.name()?;
        if !self.simulations_list()?.contains_key(name.as_str()) {
            return Err(ManagerError::SimulationNotFound(name));
        }

        let destination = simulation.folder_path().to_owned();
        if destination.exists() {
            return Err(ManagerError::SimulationFolderAlreadyExist(destination));
        }

        self.uncompress(&name, &destination)?;
        Ok(())
    }

    fn write_settings_file(simulation: &Simulation, filename: &str) -> Result<()> {
        let path = simulation.folder_path().join(filename);
        let contents = serde_json::to_string_pretty(simulation.request())?;
        std::fs::write(&path, contents).map_err(ctx!("writing {path:?}"))?;
        Ok(())
    }

    /// Apply `operation` to each simulation, classifying raised
    /// errors: kinds in `store` accumulate the simulation into the
    /// returned list, kinds in `pass` are ignored, anything else
    /// propagates.
    fn batch_action<'s>(
        &mut self,
        simulations: impl IntoIterator<Item = &'s Simulation>,
        mut operation: impl FnMut(&mut Self, &Simulation) -> Result<(), ManagerError>,
        store: &[ManagerErrorKind],
        pass: &[ManagerErrorKind],
        save_list: bool,
        mut progress: impl FnMut(),
    ) -> Result<Vec<Simulation>> {
        let mut errors = Vec::new();

        for simulation in simulations {
            match operation(self, simulation) {
                Ok(()) => (),
                Err(e) if store.contains(&e.kind()) => errors.push(simulation.clone()),
                Err(e) if pass.contains(&e.kind()) => (),
                Err(e) => return Err(e.into()),
            }
            progress();
        }

        if save_list {
            self.save_simulations_list()?;
        }
        Ok(errors)
    }

    /// Add many simulations; returns the ones whose folder was
    /// missing or failed the integrity checks.
    pub fn batch_add<'s>(
        &mut self,
        simulations: impl IntoIterator<Item = &'s Simulation>,
        options: BatchOptions,
        progress: impl FnMut(),
    ) -> Result<Vec<Simulation>> {
        self.batch_action(
            simulations,
            |manager, simulation| {
                if let Some(filename) = options.settings_file {
                    if simulation.folder_path().is_dir() {
                        Self::write_settings_file(simulation, filename)?;
                    }
                }
                manager.add(simulation, false)
            },
            &[
                ManagerErrorKind::SimulationFolderNotFound,
                ManagerErrorKind::SimulationIntegrityCheckFailed,
            ],
            &[
                ManagerErrorKind::SimulationNotFound,
                ManagerErrorKind::SimulationFolderAlreadyExist,
            ],
            true,
            progress,
        )
    }

    /// Delete many simulations; returns the unknown ones.
    pub fn batch_delete<'s>(
        &mut self,
        simulations: impl IntoIterator<Item = &'s Simulation>,
        progress: impl FnMut(),
    ) -> Result<Vec<Simulation>> {
        self.batch_action(
            simulations,
            |manager, simulation| manager.delete(simulation, false),
            &[ManagerErrorKind::SimulationNotFound],
            &[
                ManagerErrorKind::SimulationFolderNotFound,
                ManagerErrorKind::SimulationFolderAlreadyExist,
                ManagerErrorKind::SimulationIntegrityCheckFailed,
            ],
            true,
            progress,
        )
    }

    /// Extract many simulations; returns the unknown ones. With
    /// `ignore_existing`, an already-present destination folder
    /// counts as satisfied.
    pub fn batch_extract<'s>(
        &mut self,
        simulations: impl IntoIterator<Item = &'s Simulation>,
        ignore_existing: bool,
        options: BatchOptions,
        progress: impl FnMut(),
    ) -> Result<Vec<Simulation>> {
        let (store, pass): (&[ManagerErrorKind], &[ManagerErrorKind]) = if ignore_existing {
            (
                &[ManagerErrorKind::SimulationNotFound],
                &[ManagerErrorKind::SimulationFolderAlreadyExist],
            )
        } else {
            (
                &[
                    ManagerErrorKind::SimulationNotFound,
                    ManagerErrorKind::SimulationFolderAlreadyExist,
                ],
                &[],
            )
        };
        self.batch_action(
            simulations,
            |manager, simulation| {
                manager.extract(simulation)?;
                if let Some(filename) = options.settings_file {
                    Self::write_settings_file(simulation, filename)?;
                }
                Ok(())
            },
            store,
            pass,
            false,
            progress,
        )
    }

    /// Release the presence marker explicitly.
    pub fn close(mut self) {
        self.release_marker();
    }

    fn release_marker(&mut self) {
        if self.running_marker.take().is_some() {
            std::fs::remove_file(self.folder.running_manager_indicator_filename()).ok();
        }
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        self.release_marker();
    }
}
