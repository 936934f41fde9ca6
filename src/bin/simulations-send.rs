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
/// Send a file or directory to the folder's configured compute host.
struct Opts {
    #[clap(flatten)]
    log_level: LogLevelOpt,

    /// Name of the configuration folder to use
    #[clap(long)]
    config: Option<String>,

    /// Remote destination (default: the source's base name)
    #[clap(long)]
    dest: Option<PathBuf>,

    /// Send files even when the destination is at least as recent
    #[clap(long)]
    replace: bool,

    /// Delete the local source once sent
    #[clap(long)]
    delete: bool,

    /// The simulations folder
    folder: PathBuf,

    /// The file or directory to send
    path: PathBuf,
}

fn main() -> Result<()> {
    let Opts {
        log_level,
        config,
        dest,
        replace,
        delete,
        folder,
        path,
    } = Opts::parse();
    set_log_level(log_level.into());

    let folder = Folder::open(&folder)?;
    let mut remote = RemoteFolder::from_folder(&folder, config.as_deref())?;
    let sent = remote.send(&path, dest.as_deref(), replace, delete)?;
    println!("{}", sent.display());
    Ok(())
}
