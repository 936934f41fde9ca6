//! The driver loop: turn a request list into a completed batch.
//!
//! One iteration runs EXTRACT (serve what the catalog already holds),
//! GENERATE (scripts for the remainder, mirrored to the compute
//! host and launched), WAIT (poll the job log), DOWNLOAD (pull the
//! produced folders back and register them) and a remote cleanup.
//! The loop ends when the request list is satisfied or a budget is
//! exhausted; a keyboard interrupt during WAIT parks the driver in
//! the paused state, which can be serialized and resumed from
//! another process.

use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::sleep,
    time::Duration,
};

use anyhow::Result;
use serde_json::Value;

use crate::{
    ctx,
    events::{EventPayload, Events},
    folder::Folder,
    generator::Generator,
    info,
    jobs::JobsManager,
    manager::{BatchOptions, Manager},
    remote::{RemoteError, RemoteFolder},
    simulation::{Request, Simulation},
};

/// How often the remote job log is polled.
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(500);

pub const EVENTS: &[&str] = &[
    "close-start",
    "close-end",
    "delete-scripts",
    "run-start",
    "run-end",
    "extract-start",
    "extract-progress",
    "extract-end",
    "generate-start",
    "generate-end",
    "wait-start",
    "wait-progress",
    "wait-end",
    "download-start",
    "download-progress",
    "download-end",
    "addition-start",
    "addition-progress",
    "addition-end",
    "paused",
    "resumed",
];

#[derive(thiserror::Error, Debug)]
pub enum MakerError {
    #[error("the maker is paused")]
    MakerPaused,

    #[error("the maker is not paused")]
    MakerNotPaused,

    #[error("unreadable maker state: {0}")]
    MakerStateWrongFormat(String),
}

/// The `maker` sub-config.
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct MakerConfig {
    /// Allowed corrupted iterations; negative means unbounded.
    pub max_corrupted: i64,
    /// Allowed iterations with failed workers; negative means
    /// unbounded.
    pub max_failures: i64,
    /// Do not archive: check and move the produced folders straight
    /// to their destinations.
    pub generate_only: bool,
    /// When set, a per-simulation settings file of this name is
    /// written into every materialized folder.
    pub settings_file: Option<String>,
}

impl Default for MakerConfig {
    fn default() -> Self {
        Self {
            max_corrupted: -1,
            max_failures: 0,
            generate_only: false,
            settings_file: None,
        }
    }
}

/// An unknown simulation that has been assigned a remote work
/// folder. `request.folder` is the remote work folder; `dest` keeps
/// the folder the user asked for.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
struct GeneratedSimulation {
    request: Request,
    dest: PathBuf,
}

/// Everything the driver needs to continue a run, serializable for
/// pause/resume.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
struct MakerState {
    simulations: Vec<Request>,
    corruptions_counter: u64,
    failures_counter: u64,
    unknown_simulations: Vec<GeneratedSimulation>,
    remote_scripts_dir: Option<PathBuf>,
    remote_simulations_dir: Option<PathBuf>,
    remote_log_path: Option<PathBuf>,
}

pub enum RunOutcome {
    /// The loop ended; the listed requests could not be satisfied.
    Completed { unknown: Vec<Request> },
    /// A keyboard interrupt parked the run; save the state or call
    /// `resume`.
    Paused,
}

enum WaitOutcome {
    Completed,
    Interrupted,
}

pub struct Maker {
    folder: Arc<Folder>,
    config_name: Option<String>,
    config: MakerConfig,
    manager: Manager,
    generator: Generator,
    remote: RemoteFolder,
    jobs: JobsManager,
    events: Events,
    interrupted: Arc<AtomicBool>,
    paused: Option<MakerState>,
}

impl Maker {
    pub fn new(folder: Arc<Folder>, config_name: Option<&str>) -> Result<Self> {
        let config: MakerConfig = match folder.config("maker", config_name)? {
            Some(map) => serde_json::from_value(Value::Object(map.as_ref().clone()))
                .map_err(ctx!("reading the maker sub-config"))?,
            None => MakerConfig::default(),
        };
        let manager = Manager::new(folder.clone())?;
        let generator = Generator::new(folder.clone());
        let remote = RemoteFolder::from_folder(&folder, config_name)?;
        Ok(Self {
            folder,
            config_name: config_name.map(str::to_owned),
            config,
            manager,
            generator,
            remote,
            jobs: JobsManager::new(),
            events: Events::new(EVENTS.iter().copied()),
            interrupted: Arc::new(AtomicBool::new(false)),
            paused: None,
        })
    }

    pub fn config(&self) -> &MakerConfig {
        &self.config
    }

    pub fn set_generate_only(&mut self, generate_only: bool) {
        self.config.generate_only = generate_only;
    }

    pub fn set_settings_file(&mut self, settings_file: Option<String>) {
        self.config.settings_file = settings_file;
    }

    /// The flag a Ctrl-C handler should set to request a pause.
    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        self.interrupted.clone()
    }

    pub fn add_event_listener(
        &mut self,
        event: &str,
        listener: impl FnMut(&EventPayload) + 'static,
    ) -> Result<(), crate::events::EventError> {
        self.events.add_listener(event, listener)
    }

    fn trigger(&mut self, event: &str, payload: EventPayload) {
        self.events
            .trigger(event, payload)
            .expect("all emitted events are declared in EVENTS");
    }

    pub fn is_paused(&self) -> bool {
        self.paused.is_some()
    }

    /// Run until the request list is satisfied or a budget is
    /// exhausted.
    pub fn run(&mut self, simulations: Vec<Request>) -> Result<RunOutcome> {
        if self.paused.is_some() {
            return Err(MakerError::MakerPaused.into());
        }
        self.trigger("run-start", EventPayload::count(simulations.len()));
        let state = MakerState {
            simulations,
            ..MakerState::default()
        };
        self.run_loop(state)
    }

    /// Re-enter the loop after a pause.
    pub fn resume(&mut self) -> Result<RunOutcome> {
        let state = self.paused.take().ok_or(MakerError::MakerNotPaused)?;
        self.trigger("resumed", EventPayload::none());
        self.run_loop(state)
    }

    /// Serialize the paused driver state.
    pub fn save_state(&self, path: &Path) -> Result<()> {
        let state = self.paused.as_ref().ok_or(MakerError::MakerNotPaused)?;
        let contents = serde_json::to_string_pretty(state)?;
        std::fs::write(path, contents).map_err(ctx!("writing the maker state to {path:?}"))?;
        Ok(())
    }

    /// Load a previously saved state; the maker becomes paused.
    pub fn load_state(&mut self, path: &Path) -> Result<()> {
        if self.paused.is_some() {
            return Err(MakerError::MakerPaused.into());
        }
        let contents =
            std::fs::read_to_string(path).map_err(ctx!("reading the maker state from {path:?}"))?;
        let state: MakerState = serde_json::from_str(&contents)
            .map_err(|e| MakerError::MakerStateWrongFormat(e.to_string()))?;
        self.paused = Some(state);
        Ok(())
    }

    pub fn close(&mut self) {
        self.trigger("close-start", EventPayload::none());
        self.remote.close();
        self.trigger("close-end", EventPayload::none());
    }

    fn budgets_allow(&self, state: &MakerState) -> bool {
        (self.config.max_corrupted < 0
            || state.corruptions_counter <= self.config.max_corrupted as u64)
            && (self.config.max_failures < 0
                || state.failures_counter <= self.config.max_failures as u64)
    }

    fn run_loop(&mut self, mut state: MakerState) -> Result<RunOutcome> {
        loop {
            // A pending WAIT (fresh from GENERATE, or loaded from a
            // saved state) comes first.
            if let Some(log_path) = state.remote_log_path.clone() {
                let total = state.unknown_simulations.len();
                if self.jobs.is_empty() {
                    // Resuming from a saved state: re-register the
                    // batch so failed workers are counted again.
                    for generated in &state.unknown_simulations {
                        let simulation =
                            Simulation::new(self.folder.clone(), generated.request.clone());
                        self.jobs.add(simulation.command_line()?).ok();
                    }
                }
                match self.wait(&log_path, total)? {
                    WaitOutcome::Interrupted => {
                        self.paused = Some(state);
                        self.trigger("paused", EventPayload::none());
                        return Ok(RunOutcome::Paused);
                    }
                    WaitOutcome::Completed => {
                        if self.jobs.failed_count() > 0 {
                            state.failures_counter += 1;
                        }
                        let corrupted = self.download(&state)?;
                        if corrupted > 0 {
                            state.corruptions_counter += 1;
                        }
                        self.cleanup_remote(&mut state);
                    }
                }
                continue;
            }

            let unknown = self.extract(&state.simulations)?;
            if unknown.is_empty() {
                self.trigger("run-end", EventPayload::count(0));
                return Ok(RunOutcome::Completed { unknown: vec![] });
            }
            if !self.budgets_allow(&state) {
                let unknown: Vec<Request> =
                    unknown.iter().map(|s| s.request().clone()).collect();
                self.trigger("run-end", EventPayload::count(unknown.len()));
                return Ok(RunOutcome::Completed { unknown });
            }

            self.generate(&mut state, unknown)?;
        }
    }

    /// EXTRACT: serve every request the catalog can satisfy; returns
    /// the unknown simulations.
    fn extract(&mut self, simulations: &[Request]) -> Result<Vec<Simulation>> {
        self.trigger("extract-start", EventPayload::count(simulations.len()));

        let sims: Vec<Simulation> = simulations
            .iter()
            .map(|request| Simulation::new(self.folder.clone(), request.clone()))
            .collect();

        let options = BatchOptions {
            settings_file: self.config.settings_file.as_deref(),
        };
        let total = sims.len();
        let mut done = 0;
        let events = &mut self.events;
        let mut unknown = self.manager.batch_extract(sims.iter(), true, options, || {
            done += 1;
            events
                .trigger("extract-progress", EventPayload::progress(done, total))
                .ok();
        })?;

        if self.config.generate_only {
            // A destination that already exists counts as satisfied.
            unknown.retain(|simulation| !simulation.folder_path().exists());
        }

        self.trigger("extract-end", EventPayload::none());
        Ok(unknown)
    }

    /// GENERATE: mirror a scripts folder to the compute host, assign
    /// remote work folders, render the launcher and start it.
    fn generate(&mut self, state: &mut MakerState, unknown: Vec<Simulation>) -> Result<()> {
        self.trigger("generate-start", EventPayload::count(unknown.len()));

        let scripts_dir = self.folder.tempdir()?;
        let remote_basedir = self.remote.send(&scripts_dir, None, false, false)?;

        let remote_simulations_dir =
            PathBuf::from(format!("simulations_{:x}", chrono::Utc::now().timestamp()));

        let mut generated = Vec::new();
        for (k, mut simulation) in unknown.into_iter().enumerate() {
            let dest = simulation.folder_path().to_owned();
            simulation.set_folder_path(remote_simulations_dir.join(k.to_string()));
            generated.push(GeneratedSimulation {
                request: simulation.request().clone(),
                dest,
            });
            self.generator.add(simulation);
        }

        let command_lines = self.generator.command_lines()?;
        let (launch_path, log_path) = self.generator.generate(
            &scripts_dir,
            self.config_name.as_deref(),
            true,
            Some(&remote_basedir),
        )?;
        self.generator.clear();

        self.remote.send(&scripts_dir, None, true, false)?;
        std::fs::remove_dir_all(&scripts_dir).ok();

        self.jobs.clear();
        self.jobs
            .add_all(command_lines)
            .map_err(|e| anyhow::anyhow!("registering the batch: {e}"))?;

        info!("launching {launch_path:?}");
        self.remote.execute(&launch_path.display().to_string())?;

        state.remote_scripts_dir = Some(remote_basedir);
        state.remote_simulations_dir = Some(remote_simulations_dir);
        state.remote_log_path = Some(log_path);
        state.unknown_simulations = generated;

        self.trigger("generate-end", EventPayload::none());
        Ok(())
    }

    /// WAIT: poll the remote job log until it holds one entry per
    /// dispatched command line.
    fn wait(&mut self, log_path: &Path, total: usize) -> Result<WaitOutcome> {
        self.trigger("wait-start", EventPayload::count(total));

        let mut previous_len = None;
        loop {
            if self.interrupted.swap(false, Ordering::SeqCst) {
                return Ok(WaitOutcome::Interrupted);
            }

            let contents = match self.remote.get_file_contents(log_path) {
                Ok(contents) => contents,
                Err(RemoteError::RemotePathNotFound(_)) => String::from("[]"),
                Err(e) => return Err(e.into()),
            };
            // A partially written file reads as "no change yet".
            let log: Vec<Value> = serde_json::from_str(&contents).unwrap_or_default();
            self.jobs.update_from_log(&log).ok();

            if previous_len != Some(log.len()) {
                previous_len = Some(log.len());
                self.trigger("wait-progress", EventPayload::progress(log.len(), total));
            }
            if log.len() >= total {
                break;
            }
            sleep(WAIT_POLL_INTERVAL);
        }

        self.trigger("wait-end", EventPayload::none());
        Ok(WaitOutcome::Completed)
    }

    /// DOWNLOAD: pull every produced folder back, then register it
    /// (or, in generate-only mode, move it to its destination).
    /// Returns the number of failed registrations.
    fn download(&mut self, state: &MakerState) -> Result<usize> {
        let total = state.unknown_simulations.len();
        self.trigger("download-start", EventPayload::count(total));

        let mut to_add = Vec::new();
        let mut corrupted = 0;

        for (k, generated) in state.unknown_simulations.iter().enumerate() {
            let tmpdir = self.folder.tempdir()?;
            let remote_folder = PathBuf::from(&generated.request.folder);
            if let Err(e) = self.remote.receive(&remote_folder, Some(&tmpdir), true) {
                // The integrity check below will catch the missing
                // files and count the corruption.
                info!("could not download {remote_folder:?}: {e:#}");
            }

            let mut simulation = Simulation::new(self.folder.clone(), generated.request.clone());
            if self.config.generate_only {
                simulation.set_folder_path(tmpdir.clone());
                if generated.dest.exists() {
                    // Someone produced the destination meanwhile:
                    // leave it alone.
                    std::fs::remove_dir_all(&tmpdir).ok();
                } else if self.manager.check_integrity(&simulation)? {
                    crate::io_util::move_dir(&tmpdir, &generated.dest)?;
                    if let Some(filename) = &self.config.settings_file {
                        let path = generated.dest.join(filename);
                        let mut request = generated.request.clone();
                        request.folder = generated.dest.clone();
                        std::fs::write(&path, serde_json::to_string_pretty(&request)?)
                            .map_err(ctx!("writing {path:?}"))?;
                    }
                } else {
                    std::fs::remove_dir_all(&tmpdir).ok();
                    corrupted += 1;
                }
            } else {
                simulation.set_folder_path(tmpdir);
                to_add.push(simulation);
            }

            self.trigger("download-progress", EventPayload::progress(k + 1, total));
        }
        self.trigger("download-end", EventPayload::none());

        if !self.config.generate_only {
            self.trigger("addition-start", EventPayload::count(to_add.len()));
            let options = BatchOptions {
                settings_file: self.config.settings_file.as_deref(),
            };
            let add_total = to_add.len();
            let mut done = 0;
            let events = &mut self.events;
            let failed = self.manager.batch_add(to_add.iter(), options, || {
                done += 1;
                events
                    .trigger("addition-progress", EventPayload::progress(done, add_total))
                    .ok();
            })?;
            corrupted += failed.len();
            self.trigger("addition-end", EventPayload::none());
        }

        Ok(corrupted)
    }

    /// Delete the remote work folders and scripts of the finished
    /// iteration.
    fn cleanup_remote(&mut self, state: &mut MakerState) {
        if let Some(dir) = state.remote_simulations_dir.take() {
            if let Err(e) = self.remote.delete_remote(&[dir]) {
                info!("remote simulations dir cleanup: {e:#}");
            }
        }
        self.trigger("delete-scripts", EventPayload::none());
        if let Some(dir) = state.remote_scripts_dir.take() {
            if let Err(e) = self.remote.delete_remote(&[dir]) {
                info!("remote scripts dir cleanup: {e:#}");
            }
        }
        state.remote_log_path = None;
        state.unknown_simulations.clear();
        self.jobs.clear();
    }
}
