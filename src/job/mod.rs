//! The command-line dispatch protocol.
//!
//! A launcher script embeds one `JobServer` and one or more
//! `JobClient` workers. The server hands out command lines one at a
//! time; each client executes its line through the shell, reports the
//! outcome, and receives the next line, until the server answers with
//! `null`.
//!
//! Wire format: a 2-byte big-endian length followed by that many
//! bytes of UTF-8 JSON. Requests are `{"query": "next"}` or
//! `{"query": "log", "content": {exec, stdout, stderr, success}}`;
//! every response is `{"command_line": <string or null>}`.

pub mod client;
pub mod message;
pub mod server;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 21621;

/// The outcome of one executed command line, as appended to the job
/// log.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct LogEntry {
    pub exec: String,
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "query")]
pub enum Request {
    #[serde(rename = "next")]
    Next,
    #[serde(rename = "log")]
    Log { content: LogEntry },
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Response {
    pub command_line: Option<String>,
}
