use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use hateno::{
    folder::Folder,
    generator::Generator,
    simulation::{Request, Simulation},
    utillib::logging::{set_log_level, LogLevelOpt},
};

#[derive(clap::Parser, Debug)]
#[clap(next_line_help = true)]
/// Render the launcher script and command lines for a request list,
/// without executing anything.
struct Opts {
    #[clap(flatten)]
    log_level: LogLevelOpt,

    /// Name of the recipe (configuration folder) to use
    #[clap(long)]
    recipe: Option<String>,

    /// Where the scripts are written
    #[clap(long, default_value = "scripts")]
    output_dir: PathBuf,

    /// Empty the output folder first instead of refusing to reuse it
    #[clap(long)]
    empty_output: bool,

    /// The simulations folder
    folder: PathBuf,

    /// JSON file holding the request list (one request or an array)
    requests: PathBuf,
}

fn main() -> Result<()> {
    let Opts {
        log_level,
        recipe,
        output_dir,
        empty_output,
        folder,
        requests,
    } = Opts::parse();
    set_log_level(log_level.into());

    let folder = std::sync::Arc::new(Folder::open(&folder)?);

    let contents = std::fs::read_to_string(&requests)
        .with_context(|| format!("reading requests from {requests:?}"))?;
    let value: serde_json::Value = serde_json::from_str(&contents)?;
    let requests: Vec<Request> = match value {
        serde_json::Value::Array(_) => serde_json::from_value(value)?,
        other => vec![serde_json::from_value(other)?],
    };

    let mut generator = Generator::new(folder.clone());
    generator.add_all(
        requests
            .into_iter()
            .map(|request| Simulation::new(folder.clone(), request)),
    );

    let (launch_path, log_path) =
        generator.generate(&output_dir, recipe.as_deref(), empty_output, None)?;
    println!("{}", launch_path.display());
    println!("{}", log_path.display());
    Ok(())
}
