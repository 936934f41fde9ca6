//! Progress logging on stderr.
//!
//! The Maker's user-facing output goes through the UI (state lines,
//! progress bars); these macros carry the narration behind it: what
//! is being launched, downloaded, retried. One line per message,
//! prefixed with the wall-clock time and the emitting location, so a
//! long campaign's log can be correlated with the remote job log.

use std::{
    fmt,
    io::{stderr, Write},
    sync::atomic::{AtomicU8, Ordering},
};

use chrono::Local;

/// What gets written. `Info` narrates the campaign; `Debug` adds the
/// protocol-level noise (accepted connections, dropped clients).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Quiet,
    Info,
    Debug,
}

impl LogLevel {
    fn tag(self) -> &'static str {
        match self {
            LogLevel::Quiet => "",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        }
    }
}

/// The `--verbose`/`--debug` flags every binary takes.
#[derive(Debug, clap::Args)]
pub struct LogLevelOpt {
    /// Narrate what is being done
    #[clap(short, long)]
    verbose: bool,

    /// Also log the job protocol details (implies `--verbose`)
    #[clap(short, long)]
    debug: bool,
}

impl From<LogLevelOpt> for LogLevel {
    fn from(opt: LogLevelOpt) -> Self {
        if opt.debug {
            LogLevel::Debug
        } else if opt.verbose {
            LogLevel::Info
        } else {
            LogLevel::Quiet
        }
    }
}

// Stored as the discriminant; `Quiet` is the starting state.
static LOGLEVEL: AtomicU8 = AtomicU8::new(LogLevel::Quiet as u8);

pub fn set_log_level(level: LogLevel) {
    LOGLEVEL.store(level as u8, Ordering::Relaxed);
}

#[inline]
pub fn log_level() -> LogLevel {
    match LOGLEVEL.load(Ordering::Relaxed) {
        0 => LogLevel::Quiet,
        1 => LogLevel::Info,
        _ => LogLevel::Debug,
    }
}

/// Write one log line if `level` is enabled. Called through the
/// macros below, which supply the location.
pub fn emit(level: LogLevel, file: &str, line: u32, message: fmt::Arguments) {
    if level > log_level() {
        return;
    }
    let now = Local::now().format("%H:%M:%S%.3f");
    let mut lock = stderr().lock();
    writeln!(
        &mut lock,
        "[hateno {} {}] {file}:{line}: {message}",
        level.tag(),
        now
    )
    .expect("stderr must not fail");
}

#[macro_export]
macro_rules! info {
    { $($arg:tt)* } => {
        $crate::utillib::logging::emit(
            $crate::utillib::logging::LogLevel::Info,
            file!(),
            line!(),
            format_args!($($arg)*),
        )
    }
}

#[macro_export]
macro_rules! debug {
    { $($arg:tt)* } => {
        $crate::utillib::logging::emit(
            $crate::utillib::logging::LogLevel::Debug,
            file!(),
            line!(),
            format_args!($($arg)*),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn t_levels_are_ordered() {
        assert!(LogLevel::Quiet < LogLevel::Info);
        assert!(LogLevel::Info < LogLevel::Debug);
    }

    #[test]
    fn t_flags_to_level() {
        let level = |verbose, debug| LogLevel::from(LogLevelOpt { verbose, debug });
        assert_eq!(level(false, false), LogLevel::Quiet);
        assert_eq!(level(true, false), LogLevel::Info);
        // --debug wins, with or without --verbose
        assert_eq!(level(false, true), LogLevel::Debug);
        assert_eq!(level(true, true), LogLevel::Debug);
    }

    #[test]
    fn t_level_round_trips_through_the_atomic() {
        for level in [LogLevel::Debug, LogLevel::Info, LogLevel::Quiet] {
            set_log_level(level);
            assert_eq!(log_level(), level);
        }
    }
}
