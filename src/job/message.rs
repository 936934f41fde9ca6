//! Per-connection buffering: length-prefixed JSON frames, one queued
//! outgoing message at a time.

use anyhow::{anyhow, bail, Result};
use serde::{de::DeserializeOwned, Serialize};

pub const HEADER_LEN: usize = 2;

/// Encode one frame: 2-byte big-endian length, then the JSON body.
pub fn encode_frame<T: Serialize>(msg: &T) -> Result<Vec<u8>> {
    let body = serde_json::to_vec(msg)?;
    let len: u16 = body
        .len()
        .try_into()
        .map_err(|_| anyhow!("message of {} bytes does not fit a frame", body.len()))?;
    let mut frame = Vec::with_capacity(HEADER_LEN + body.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Buffers for one socket. Incoming bytes accumulate until whole
/// frames can be decoded; outgoing frames drain as the socket accepts
/// them.
#[derive(Debug, Default)]
pub struct Message {
    recv_buffer: Vec<u8>,
    send_buffer: Vec<u8>,
}

impl Message {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes read from the socket; returns every message that is
    /// now complete.
    pub fn push_received<T: DeserializeOwned>(&mut self, data: &[u8]) -> Result<Vec<T>> {
        self.recv_buffer.extend_from_slice(data);
        let mut messages = Vec::new();
        loop {
            if self.recv_buffer.len() < HEADER_LEN {
                break;
            }
            let len = u16::from_be_bytes([self.recv_buffer[0], self.recv_buffer[1]]) as usize;
            if self.recv_buffer.len() < HEADER_LEN + len {
                break;
            }
            let body = &self.recv_buffer[HEADER_LEN..HEADER_LEN + len];
            let msg = serde_json::from_slice(body)
                .map_err(crate::ctx!("decoding a {len}-byte frame"))?;
            messages.push(msg);
            self.recv_buffer.drain(..HEADER_LEN + len);
        }
        Ok(messages)
    }

    /// Queue one message. The previous one must have been fully sent.
    pub fn queue<T: Serialize>(&mut self, msg: &T) -> Result<()> {
        if !self.send_buffer.is_empty() {
            bail!("a message is already queued on this connection");
        }
        self.send_buffer = encode_frame(msg)?;
        Ok(())
    }

    /// Queue a message behind whatever is still pending. Only the
    /// server uses this, when a single read burst carried several
    /// requests.
    pub fn queue_back<T: Serialize>(&mut self, msg: &T) -> Result<()> {
        let frame = encode_frame(msg)?;
        self.send_buffer.extend_from_slice(&frame);
        Ok(())
    }

    pub fn wants_write(&self) -> bool {
        !self.send_buffer.is_empty()
    }

    pub fn pending_out(&self) -> &[u8] {
        &self.send_buffer
    }

    /// Drop `n` sent bytes from the outgoing buffer.
    pub fn advance_out(&mut self, n: usize) {
        self.send_buffer.drain(..n);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{Request, Response};

    #[test]
    fn t_frame_round_trip() {
        let frame = encode_frame(&Request::Next).unwrap();
        assert_eq!(&frame[..2], &[0, frame.len() as u8 - 2]);

        let mut message = Message::new();
        let decoded: Vec<Request> = message.push_received(&frame).unwrap();
        assert_eq!(decoded, vec![Request::Next]);
    }

    #[test]
    fn t_partial_and_coalesced_frames() {
        let a = encode_frame(&Response {
            command_line: Some("./run --n 1".into()),
        })
        .unwrap();
        let b = encode_frame(&Response { command_line: None }).unwrap();

        let mut message = Message::new();
        // first frame delivered in two pieces
        let decoded: Vec<Response> = message.push_received(&a[..3]).unwrap();
        assert!(decoded.is_empty());
        // rest of the first frame arrives glued to the second one
        let mut rest = a[3..].to_vec();
        rest.extend_from_slice(&b);
        let decoded: Vec<Response> = message.push_received(&rest).unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].command_line.as_deref(), Some("./run --n 1"));
        assert_eq!(decoded[1].command_line, None);
    }

    #[test]
    fn t_single_message_in_flight() {
        let mut message = Message::new();
        message.queue(&Request::Next).unwrap();
        assert!(message.queue(&Request::Next).is_err());
        let n = message.pending_out().len();
        message.advance_out(n);
        assert!(!message.wants_write());
        message.queue(&Request::Next).unwrap();
    }

    #[test]
    fn t_wire_shapes() {
        // the JSON bodies are part of the protocol
        let next = serde_json::to_value(Request::Next).unwrap();
        assert_eq!(next, serde_json::json!({"query": "next"}));
        let log = serde_json::to_value(Request::Log {
            content: crate::job::LogEntry {
                exec: "x".into(),
                stdout: "o".into(),
                stderr: "e".into(),
                success: true,
            },
        })
        .unwrap();
        assert_eq!(
            log,
            serde_json::json!({
                "query": "log",
                "content": {"exec": "x", "stdout": "o", "stderr": "e", "success": true}
            })
        );
    }
}
