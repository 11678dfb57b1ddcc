use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Size of every frame header on the control channel.
pub const HEADER_LEN: usize = 12;

/// Non-DATA frames declaring a payload this large are treated as garbage.
pub const MAX_CONTROL_PAYLOAD: u32 = 1 << 20; // 1 MiB

/// Connection id reserved for channel-level frames (hello, heartbeat).
pub const CHANNEL_ID: u32 = 0;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("short header: {0} bytes")]
    ShortHeader(usize),
    #[error("{cmd} frame carries unexpected payload of {len} bytes")]
    UnexpectedPayload { cmd: Command, len: u32 },
    #[error("{cmd} frame payload too large: {len}")]
    PayloadTooLarge { cmd: Command, len: u32 },
    #[error("bad handshake: {0:?}")]
    BadHandshake(FrameHeader),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Login,
    Data,
    Logout,
    Client,
    Timer,
    Unknown(u32),
}

impl Command {
    pub fn code(self) -> u32 {
        match self {
            Command::Login => 1,
            Command::Data => 2,
            Command::Logout => 3,
            Command::Client => 4,
            Command::Timer => 5,
            Command::Unknown(c) => c,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Command::Login => "login",
            Command::Data => "data",
            Command::Logout => "logout",
            Command::Client => "client",
            Command::Timer => "timer",
            Command::Unknown(_) => "unknown",
        }
    }

    /// Control commands never carry a payload.
    pub fn is_control(self) -> bool {
        matches!(
            self,
            Command::Login | Command::Logout | Command::Client | Command::Timer
        )
    }
}

impl From<u32> for Command {
    fn from(v: u32) -> Self {
        match v {
            1 => Command::Login,
            2 => Command::Data,
            3 => Command::Logout,
            4 => Command::Client,
            5 => Command::Timer,
            other => Command::Unknown(other),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Unknown(c) => write!(f, "unknown({c})"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Fixed 12-byte frame header: `length`, `connection_id`, `command`, each a
/// little-endian `u32`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub length: u32,
    pub id: u32,
    pub command: Command,
}

impl FrameHeader {
    pub fn new(length: u32, id: u32, command: Command) -> Self {
        Self {
            length,
            id,
            command,
        }
    }

    pub fn control(id: u32, command: Command) -> Self {
        Self::new(0, id, command)
    }

    /// First frame a client sends after connecting.
    pub fn hello() -> Self {
        Self::control(CHANNEL_ID, Command::Client)
    }

    pub fn heartbeat() -> Self {
        Self::control(CHANNEL_ID, Command::Timer)
    }

    pub fn is_hello(&self) -> bool {
        *self == Self::hello()
    }

    /// Checks the payload rules that apply as soon as a header is parsed.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.command.is_control() {
            if self.length != 0 {
                return Err(ProtocolError::UnexpectedPayload {
                    cmd: self.command,
                    len: self.length,
                });
            }
        } else if self.command != Command::Data && self.length >= MAX_CONTROL_PAYLOAD {
            return Err(ProtocolError::PayloadTooLarge {
                cmd: self.command,
                len: self.length,
            });
        }
        Ok(())
    }
}

pub fn encode_header(h: &FrameHeader) -> [u8; HEADER_LEN] {
    let mut out = [0u8; HEADER_LEN];
    out[0..4].copy_from_slice(&h.length.to_le_bytes());
    out[4..8].copy_from_slice(&h.id.to_le_bytes());
    out[8..12].copy_from_slice(&h.command.code().to_le_bytes());
    out
}

pub fn decode_header(buf: &[u8]) -> Result<FrameHeader, ProtocolError> {
    if buf.len() < HEADER_LEN {
        return Err(ProtocolError::ShortHeader(buf.len()));
    }
    let word = |i: usize| u32::from_le_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);
    Ok(FrameHeader {
        length: word(0),
        id: word(4),
        command: Command::from(word(8)),
    })
}

/// Encodes a header and its payload into one contiguous buffer.
pub fn encode_frame(id: u32, command: Command, payload: &[u8]) -> Bytes {
    let length: u32 = payload.len().try_into().unwrap_or(u32::MAX);
    let mut out = BytesMut::with_capacity(HEADER_LEN + payload.len());
    out.put_slice(&encode_header(&FrameHeader::new(length, id, command)));
    out.put_slice(payload);
    out.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip_preserves_unknown_commands() {
        let cases = [
            FrameHeader::new(0, 0, Command::Client),
            FrameHeader::new(4096, 7, Command::Data),
            FrameHeader::new(0, u32::MAX, Command::Logout),
            FrameHeader::new(12, 3, Command::Unknown(42)),
        ];
        for h in cases {
            assert_eq!(decode_header(&encode_header(&h)).unwrap(), h);
        }
    }

    #[test]
    fn header_layout_is_little_endian() {
        let b = encode_header(&FrameHeader::new(0x0102_0304, 9, Command::Data));
        assert_eq!(b, [4, 3, 2, 1, 9, 0, 0, 0, 2, 0, 0, 0]);
    }

    #[test]
    fn decode_rejects_short_input() {
        match decode_header(&[0u8; 11]) {
            Err(ProtocolError::ShortHeader(11)) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn control_frames_must_not_carry_payload() {
        for cmd in [Command::Login, Command::Logout, Command::Timer, Command::Client] {
            assert!(FrameHeader::new(0, 1, cmd).validate().is_ok());
            assert!(matches!(
                FrameHeader::new(1, 1, cmd).validate(),
                Err(ProtocolError::UnexpectedPayload { .. })
            ));
        }
    }

    #[test]
    fn unknown_commands_are_capped_but_data_is_not() {
        assert!(FrameHeader::new(MAX_CONTROL_PAYLOAD - 1, 1, Command::Unknown(9))
            .validate()
            .is_ok());
        assert!(matches!(
            FrameHeader::new(MAX_CONTROL_PAYLOAD, 1, Command::Unknown(9)).validate(),
            Err(ProtocolError::PayloadTooLarge { .. })
        ));
        assert!(FrameHeader::new(MAX_CONTROL_PAYLOAD * 4, 1, Command::Data)
            .validate()
            .is_ok());
    }

    #[test]
    fn encode_frame_prefixes_payload_with_its_length() {
        let f = encode_frame(5, Command::Data, b"hello");
        assert_eq!(f.len(), HEADER_LEN + 5);
        let h = decode_header(&f[..HEADER_LEN]).unwrap();
        assert_eq!(h, FrameHeader::new(5, 5, Command::Data));
        assert_eq!(&f[HEADER_LEN..], b"hello");
    }
}
