//! The worker half of the dispatch protocol: asks for a command
//! line, executes it through the shell, reports the outcome, and
//! repeats until the server runs out of lines.

use std::{
    io::{ErrorKind, Read, Write},
    net::SocketAddr,
    process::Command,
};

use anyhow::Result;
use mio::{net::TcpStream, Events, Interest, Poll, Token};

use crate::{debug, info};

use super::{message::Message, LogEntry, Request, Response};

const CONNECTION: Token = Token(0);

pub struct JobClient {
    host: String,
    port: u16,
    /// Called around each execution; used by the CLI for progress.
    on_exec: Option<Box<dyn FnMut(&LogEntry)>>,
}

/// Run one command line through the shell, capturing everything.
fn execute_command_line(command_line: &str) -> LogEntry {
    match Command::new("sh").arg("-c").arg(command_line).output() {
        Ok(output) => LogEntry {
            exec: command_line.to_owned(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            success: output.status.success(),
        },
        Err(e) => LogEntry {
            exec: command_line.to_owned(),
            stdout: String::new(),
            stderr: format!("could not run the command: {e}"),
            success: false,
        },
    }
}

impl JobClient {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            on_exec: None,
        }
    }

    pub fn on_exec(&mut self, f: impl FnMut(&LogEntry) + 'static) {
        self.on_exec = Some(Box::new(f));
    }

    /// Work until the server answers with a `null` command line.
    pub fn run(&mut self) -> Result<()> {
        let addr: SocketAddr = format!("{}:{}", self.host, self.port).parse()?;
        let mut stream = TcpStream::connect(addr)?;

        let mut poll = Poll::new()?;
        poll.registry()
            .register(&mut stream, CONNECTION, Interest::WRITABLE)?;

        let mut message = Message::new();
        message.queue(&Request::Next)?;

        let mut events = Events::with_capacity(16);
        let mut executed = 0usize;

        'outer: loop {
            poll.poll(&mut events, None)?;
            for event in &events {
                if event.token() != CONNECTION {
                    continue;
                }

                if event.is_writable() && message.wants_write() {
                    while message.wants_write() {
                        match stream.write(message.pending_out()) {
                            Ok(n) => message.advance_out(n),
                            Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                            Err(e) => return Err(e.into()),
                        }
                    }
                    if !message.wants_write() {
                        poll.registry()
                            .reregister(&mut stream, CONNECTION, Interest::READABLE)?;
                    }
                }

                if event.is_readable() {
                    let mut buf = [0u8; 4096];
                    let mut received = Vec::new();
                    loop {
                        match stream.read(&mut buf) {
                            Ok(0) => {
                                debug!("server closed the connection");
                                break 'outer;
                            }
                            Ok(n) => received.extend_from_slice(&buf[..n]),
                            Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                            Err(e) => return Err(e.into()),
                        }
                    }

                    for response in message.push_received::<Response>(&received)? {
                        match response.command_line {
                            Some(command_line) => {
                                info!("executing: {command_line}");
                                let entry = execute_command_line(&command_line);
                                if let Some(on_exec) = &mut self.on_exec {
                                    on_exec(&entry);
                                }
                                executed += 1;
                                message.queue(&Request::Log { content: entry })?;
                                poll.registry().reregister(
                                    &mut stream,
                                    CONNECTION,
                                    Interest::WRITABLE,
                                )?;
                            }
                            None => {
                                debug!("no more command lines");
                                break 'outer;
                            }
                        }
                    }
                }
            }
        }

        info!("worker done, {executed} command lines executed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn t_execute_command_line_captures_everything() {
        let entry = execute_command_line("printf out; printf err >&2; exit 0");
        assert_eq!(entry.stdout, "out");
        assert_eq!(entry.stderr, "err");
        assert!(entry.success);

        let entry = execute_command_line("exit 3");
        assert!(!entry.success);
    }
}
