use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use hateno::{
    job::{client::JobClient, server::JobServer, LogEntry, DEFAULT_HOST, DEFAULT_PORT},
    utillib::logging::{set_log_level, LogLevelOpt},
};

#[derive(clap::Parser, Debug)]
#[clap(next_line_help = true)]
/// The two halves of the dispatch protocol a launcher script embeds.
struct Opts {
    #[clap(flatten)]
    log_level: LogLevelOpt,

    #[clap(subcommand)]
    subcommand: SubCommand,
}

#[derive(clap::Subcommand, Debug)]
enum SubCommand {
    /// Distribute command lines to the workers and maintain the log
    /// file.
    Server {
        /// JSON array of command lines to distribute
        #[clap(long)]
        command_lines: PathBuf,

        /// Where the log array is written after each execution
        #[clap(long)]
        log: PathBuf,

        /// Write the bound port here (it may differ from the default
        /// on collision)
        #[clap(long)]
        port_file: Option<PathBuf>,
    },
    /// Execute command lines handed out by the server, until there
    /// are none left.
    Client {
        #[clap(long, default_value = DEFAULT_HOST)]
        host: String,

        #[clap(long, default_value_t = DEFAULT_PORT)]
        port: u16,
    },
}

fn write_log(path: &PathBuf, entries: &[LogEntry]) -> Result<()> {
    std::fs::write(path, serde_json::to_string_pretty(entries)?)
        .with_context(|| format!("writing the log to {path:?}"))
}

fn main() -> Result<()> {
    let Opts {
        log_level,
        subcommand,
    } = Opts::parse();
    set_log_level(log_level.into());

    match subcommand {
        SubCommand::Server {
            command_lines,
            log,
            port_file,
        } => {
            let contents = std::fs::read_to_string(&command_lines)
                .with_context(|| format!("reading command lines from {command_lines:?}"))?;
            let command_lines: Vec<String> = serde_json::from_str(&contents)?;

            let mut server = JobServer::new(command_lines)?;
            if let Some(port_file) = port_file {
                std::fs::write(&port_file, server.port().to_string())
                    .with_context(|| format!("writing the port to {port_file:?}"))?;
            }
            println!("{}", server.port());

            // The log file must exist before the first worker
            // reports: the Maker polls it.
            write_log(&log, &[])?;
            let log_path = log.clone();
            server.on_log(move |entries| {
                write_log(&log_path, entries).ok();
            });
            server.run()?;
            write_log(&log, server.log())?;
        }
        SubCommand::Client { host, port } => {
            JobClient::new(host, port).run()?;
        }
    }

    Ok(())
}
