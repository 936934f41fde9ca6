//! The server half of the dispatch protocol: a single-threaded event
//! loop multiplexing all client sockets through an OS readiness
//! selector.

use std::{
    collections::HashMap,
    io::{ErrorKind, Read, Write},
    net::SocketAddr,
};

use anyhow::Result;
use mio::{
    net::{TcpListener, TcpStream},
    Events, Interest, Poll, Token,
};

use crate::{debug, info};

use super::{message::Message, LogEntry, Request, Response, DEFAULT_HOST, DEFAULT_PORT};

const SERVER: Token = Token(0);
/// How many successive ports are tried when the default one is taken.
const MAX_PORT_TRIES: u16 = 256;

struct ClientConnection {
    stream: TcpStream,
    message: Message,
}

pub struct JobServer {
    poll: Poll,
    listener: TcpListener,
    port: u16,
    command_lines: Vec<String>,
    /// Advances on each `next`/`log` request; starts before the first
    /// line.
    cursor: usize,
    clients: HashMap<Token, ClientConnection>,
    next_token: usize,
    any_client_seen: bool,
    log: Vec<LogEntry>,
    on_log: Option<Box<dyn FnMut(&[LogEntry])>>,
}

impl JobServer {
    /// Bind on `127.0.0.1`, starting at port 21621 and incrementing on
    /// collision.
    pub fn new(command_lines: Vec<String>) -> Result<Self> {
        let poll = Poll::new()?;
        let (mut listener, port) = Self::bind()?;
        poll.registry()
            .register(&mut listener, SERVER, Interest::READABLE)?;
        Ok(Self {
            poll,
            listener,
            port,
            command_lines,
            cursor: 0,
            clients: HashMap::new(),
            next_token: 1,
            any_client_seen: false,
            log: Vec::new(),
            on_log: None,
        })
    }

    fn bind() -> Result<(TcpListener, u16)> {
        let mut port = DEFAULT_PORT;
        loop {
            let addr: SocketAddr = format!("{DEFAULT_HOST}:{port}").parse()?;
            match TcpListener::bind(addr) {
                Ok(listener) => return Ok((listener, port)),
                Err(e) => {
                    if port >= DEFAULT_PORT + MAX_PORT_TRIES {
                        return Err(e.into());
                    }
                    port += 1;
                }
            }
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Called with the whole log after each appended entry.
    pub fn on_log(&mut self, f: impl FnMut(&[LogEntry]) + 'static) {
        self.on_log = Some(Box::new(f));
    }

    pub fn log(&self) -> &[LogEntry] {
        &self.log
    }

    fn next_command_line(&mut self) -> Option<String> {
        let line = self.command_lines.get(self.cursor).cloned();
        self.cursor += 1;
        line
    }

    fn accept_pending(&mut self) -> Result<()> {
        loop {
            match self.listener.accept() {
                Ok((mut stream, addr)) => {
                    let token = Token(self.next_token);
                    self.next_token += 1;
                    self.poll
                        .registry()
                        .register(&mut stream, token, Interest::READABLE)?;
                    self.clients.insert(
                        token,
                        ClientConnection {
                            stream,
                            message: Message::new(),
                        },
                    );
                    self.any_client_seen = true;
                    debug!("accepted client {addr}");
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn close_client(&mut self, token: Token) {
        if let Some(mut client) = self.clients.remove(&token) {
            self.poll.registry().deregister(&mut client.stream).ok();
        }
    }

    /// Handle one readiness event for one client. Returns an error
    /// when the connection should be dropped.
    fn handle_client(&mut self, token: Token, readable: bool, writable: bool) -> Result<()> {
        if readable {
            let requests = {
                let client = self.clients.get_mut(&token).expect("known token");
                let mut buf = [0u8; 4096];
                let mut received = Vec::new();
                loop {
                    match client.stream.read(&mut buf) {
                        Ok(0) => {
                            if received.is_empty() {
                                anyhow::bail!("peer closed");
                            }
                            break;
                        }
                        Ok(n) => received.extend_from_slice(&buf[..n]),
                        Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                        Err(e) => return Err(e.into()),
                    }
                }
                let client = self.clients.get_mut(&token).expect("known token");
                client.message.push_received::<Request>(&received)?
            };

            for request in requests {
                if let Request::Log { content } = request {
                    info!("logged: {} (success: {})", content.exec, content.success);
                    self.log.push(content);
                    if let Some(on_log) = &mut self.on_log {
                        on_log(&self.log);
                    }
                }
                let response = Response {
                    command_line: self.next_command_line(),
                };
                let client = self.clients.get_mut(&token).expect("known token");
                client.message.queue_back(&response)?;
            }
        }

        let client = self.clients.get_mut(&token).expect("known token");
        if writable || client.message.wants_write() {
            while client.message.wants_write() {
                match client.stream.write(client.message.pending_out()) {
                    Ok(n) => client.message.advance_out(n),
                    Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(e) => return Err(e.into()),
                }
            }
            let interest = if client.message.wants_write() {
                Interest::WRITABLE
            } else {
                Interest::READABLE
            };
            self.poll
                .registry()
                .reregister(&mut client.stream, token, interest)?;
        }

        Ok(())
    }

    /// Serve until every connected client has received a `null`
    /// command line and closed. A failing connection is dropped
    /// without taking the server down.
    pub fn run(&mut self) -> Result<()> {
        let mut events = Events::with_capacity(128);
        info!(
            "serving {} command lines on port {}",
            self.command_lines.len(),
            self.port
        );
        loop {
            self.poll.poll(&mut events, None)?;
            let ready: Vec<(Token, bool, bool)> = events
                .iter()
                .map(|e| (e.token(), e.is_readable(), e.is_writable()))
                .collect();
            for (token, readable, writable) in ready {
                if token == SERVER {
                    self.accept_pending()?;
                } else if self.clients.contains_key(&token) {
                    if let Err(e) = self.handle_client(token, readable, writable) {
                        debug!("dropping client: {e:#}");
                        self.close_client(token);
                    }
                }
            }
            if self.any_client_seen && self.clients.is_empty() {
                break;
            }
        }
        info!("all clients done, {} entries logged", self.log.len());
        Ok(())
    }
}
