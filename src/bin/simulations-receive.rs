use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use hateno::{
    folder::Folder,
    remote::RemoteFolder,
    utillib::logging::{set_log_level, LogLevelOpt},
};

#[derive(clap::Parser, Debug)]
#[clap(next_line_help = true)]
/// Download a file or directory from the folder's configured compute
/// host.
struct Opts {
    #[clap(flatten)]
    log_level: LogLevelOpt,

    /// Name of the configuration folder to use
    #[clap(long)]
    config: Option<String>,

    /// Local destination (default: the source's base name)
    #[clap(long)]
    dest: Option<PathBuf>,

    /// Delete the remote source once received
    #[clap(long)]
    delete: bool,

    /// The simulations folder
    folder: PathBuf,

    /// The remote file or directory to receive
    path: PathBuf,
}

fn main() -> Result<()> {
    let Opts {
        log_level,
        config,
        dest,
        delete,
        folder,
        path,
    } = Opts::parse();
    set_log_level(log_level.into());

    let folder = Folder::open(&folder)?;
    let mut remote = RemoteFolder::from_folder(&folder, config.as_deref())?;
    let received = remote.receive(&path, dest.as_deref(), delete)?;
    println!("{}", received.display());
    Ok(())
}
