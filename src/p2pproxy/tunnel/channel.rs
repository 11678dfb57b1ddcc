//! Header-driven reader for the control channel.
//!
//! Both ends of the control channel parse the same stream shape: a 12-byte
//! header, then `length` payload bytes that may arrive over several reads and
//! must be consumed before the next header.

use bytes::Bytes;

use crate::p2pproxy::tunnel::{
    protocol::{self, Command, FrameHeader, HEADER_LEN, ProtocolError},
    session::Session,
};

/// Largest payload slice handed out per read.
pub const DEFAULT_CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A zero-length frame (LOGIN, LOGOUT, TIMER, CLIENT, or an unknown code).
    Command(FrameHeader),
    /// Part of a DATA frame's payload.
    Data { id: u32, payload: Bytes },
}

#[derive(Debug)]
pub struct FrameReader {
    current: FrameHeader,
    remaining: u32,
    chunk: usize,
}

impl FrameReader {
    pub fn new(chunk: usize) -> Self {
        Self {
            current: FrameHeader::control(protocol::CHANNEL_ID, Command::Unknown(0)),
            remaining: 0,
            chunk: chunk.max(1),
        }
    }

    /// Returns the next event, or `None` once the session reached EOF or was
    /// stopped. Payloads of non-DATA frames are consumed and discarded.
    pub async fn next(&mut self, sess: &Session) -> Result<Option<Inbound>, ProtocolError> {
        loop {
            if self.remaining > 0 {
                let want = (self.remaining as usize).min(self.chunk);
                let data = sess.read(want).await?;
                if data.is_empty() {
                    return Ok(None);
                }
                self.remaining -= data.len() as u32;
                if self.current.command == Command::Data {
                    return Ok(Some(Inbound::Data {
                        id: self.current.id,
                        payload: data,
                    }));
                }
                continue;
            }

            let Some(h) = read_header(sess).await? else {
                return Ok(None);
            };
            h.validate()?;

            if h.length > 0 {
                if h.command != Command::Data {
                    tracing::debug!(cmd = %h.command, len = h.length, id = h.id, "channel: skipping payload");
                }
                self.current = h;
                self.remaining = h.length;
                continue;
            }

            if h.command == Command::Data {
                continue;
            }
            return Ok(Some(Inbound::Command(h)));
        }
    }
}

/// Reads exactly one header. `None` on EOF before the first header byte.
pub async fn read_header(sess: &Session) -> Result<Option<FrameHeader>, ProtocolError> {
    let mut buf = [0u8; HEADER_LEN];
    if !sess.read_exact(&mut buf).await? {
        return Ok(None);
    }
    protocol::decode_header(&buf).map(Some)
}
