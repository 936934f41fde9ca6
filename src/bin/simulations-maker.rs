use std::{cell::RefCell, path::PathBuf, rc::Rc};

use anyhow::{Context, Result};
use clap::Parser;

use hateno::{
    events::EventPayload,
    folder::Folder,
    maker::{Maker, RunOutcome},
    simulation::Request,
    ui::UI,
    utillib::logging::{set_log_level, LogLevelOpt},
};

#[derive(clap::Parser, Debug)]
#[clap(next_line_help = true)]
/// Produce the requested simulations: serve the catalogued ones,
/// generate the missing ones on the configured compute host.
struct Opts {
    #[clap(flatten)]
    log_level: LogLevelOpt,

    /// Name of the configuration folder to use (default: the
    /// folder's `default_config`)
    #[clap(long)]
    config: Option<String>,

    /// Name of the per-simulation settings file to write into every
    /// materialized folder
    #[clap(long)]
    settings: Option<String>,

    /// Where to save the requests that could not be satisfied
    #[clap(long)]
    save_unknown: Option<PathBuf>,

    /// Check and move the produced folders to their destinations
    /// instead of archiving them
    #[clap(long)]
    generate_only: bool,

    /// The pause/resume state file: written on Ctrl-C, and resumed
    /// from when it already exists
    #[clap(long)]
    state: Option<PathBuf>,

    /// The simulations folder
    folder: PathBuf,

    /// JSON file holding the request list (one request or an array)
    requests: PathBuf,
}

fn read_requests(path: &PathBuf) -> Result<Vec<Request>> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("reading requests from {path:?}"))?;
    let value: serde_json::Value = serde_json::from_str(&contents)?;
    let requests = match value {
        serde_json::Value::Array(_) => serde_json::from_value(value)?,
        other => vec![serde_json::from_value(other)?],
    };
    Ok(requests)
}

/// Wire the maker events to state lines and progress bars.
fn attach_ui(maker: &mut Maker) -> Result<()> {
    let ui = Rc::new(RefCell::new(UI::new()));
    let state_line = ui.borrow_mut().add_line("Starting…");
    let bar_line = ui.borrow_mut().add_line("");

    let states: &[(&str, &str)] = &[
        ("extract-start", "Extracting the simulations…"),
        ("generate-start", "Generating the scripts…"),
        ("wait-start", "Waiting for the jobs to finish…"),
        ("download-start", "Downloading the simulations…"),
        ("addition-start", "Registering the simulations…"),
        ("delete-scripts", "Deleting the scripts folder…"),
        ("paused", "Paused."),
        ("resumed", "Resuming…"),
        ("run-end", "Done."),
    ];
    for (event, text) in states {
        let ui = ui.clone();
        let text = *text;
        maker.add_event_listener(event, move |_| {
            ui.borrow_mut().replace_line(state_line, text).ok();
        })?;
    }

    let bars: &[(&str, &str)] = &[
        ("extract-progress", "extracted"),
        ("wait-progress", "finished jobs"),
        ("download-progress", "downloaded"),
        ("addition-progress", "registered"),
    ];
    for (event, label) in bars {
        let ui = ui.clone();
        let label = *label;
        maker.add_event_listener(event, move |payload: &EventPayload| {
            if let Some((done, total)) = payload.progress {
                ui.borrow_mut()
                    .update_progress(bar_line, label, done, total)
                    .ok();
            }
        })?;
    }
    Ok(())
}

fn main() -> Result<()> {
    let Opts {
        log_level,
        config,
        settings,
        save_unknown,
        generate_only,
        state,
        folder,
        requests,
    } = Opts::parse();
    set_log_level(log_level.into());

    let folder = std::sync::Arc::new(Folder::open(&folder)?);
    let mut maker = Maker::new(folder, config.as_deref())?;
    if generate_only {
        maker.set_generate_only(true);
    }
    if settings.is_some() {
        maker.set_settings_file(settings);
    }
    attach_ui(&mut maker)?;

    let interrupt = maker.interrupt_flag();
    ctrlc::set_handler(move || {
        interrupt.store(true, std::sync::atomic::Ordering::SeqCst);
    })?;

    let resume_from = state.as_ref().filter(|p| p.exists());
    let outcome = match resume_from {
        Some(path) => {
            maker.load_state(path)?;
            maker.resume()?
        }
        None => {
            let requests = read_requests(&requests)?;
            maker.run(requests)?
        }
    };

    match outcome {
        RunOutcome::Paused => {
            let path = state.unwrap_or_else(|| PathBuf::from("maker-state.json"));
            maker.save_state(&path)?;
            eprintln!("Paused; state saved to {path:?}. Run again with --state to resume.");
        }
        RunOutcome::Completed { unknown } => {
            if let Some(path) = state.as_ref().filter(|p| p.exists()) {
                std::fs::remove_file(path).ok();
            }
            if !unknown.is_empty() {
                eprintln!("{} request(s) could not be satisfied.", unknown.len());
                if let Some(path) = save_unknown {
                    std::fs::write(&path, serde_json::to_string_pretty(&unknown)?)
                        .with_context(|| format!("saving unknown requests to {path:?}"))?;
                }
            }
            maker.close();
        }
    }

    Ok(())
}
