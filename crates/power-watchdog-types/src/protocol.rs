//! Wire protocol constants and packet framing helpers.
//!
//! Every packet on the notify characteristic has the same envelope:
//!
//! | Offset | Size | Field |
//! |--------|------|-------|
//! | 0 | 4 | identifier `0x24797740` (big-endian) |
//! | 4 | 1 | version |
//! | 5 | 1 | message id |
//! | 6 | 1 | command |
//! | 7 | 2 | body length (big-endian) |
//! | 9 | n | body |
//! | 9+n | 2 | tail `0x7121` (big-endian) |
//!
//! A single packet may be split across several notifications, and one
//! notification may carry several packets. Reassembly lives in
//! `power-watchdog-core`; this module only knows the layout.

use core::fmt;

use bytes::{Buf, BufMut};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{ParseError, ParseResult};

/// 4-byte magic that opens every packet.
pub const PACKET_IDENTIFIER: u32 = 0x2479_7740;

/// 2-byte magic that closes every packet.
pub const PACKET_TAIL: u16 = 0x7121;

/// Identifier + version + message id + command + body length.
pub const HEADER_SIZE: usize = 9;

/// Size of the closing tail.
pub const TAIL_SIZE: usize = 2;

/// Size of the leading identifier.
pub const IDENTIFIER_SIZE: usize = 4;

/// Hard ceiling on buffered undecoded bytes and on a declared body length.
pub const MAX_BUFFER_SIZE: usize = 8192;

/// Size of one line's fixed-point record inside a DLReport body.
pub const LINE_BLOCK_SIZE: usize = 34;

/// Version byte written by [`encode_packet`].
pub const PROTOCOL_VERSION: u8 = 1;

/// Payload written once after subscribing to start the data stream.
pub const HANDSHAKE: &[u8; 19] = b"!%!%,protocol,open,";

/// Command byte of a packet.
///
/// Unrecognized codes are preserved in [`Command::Unknown`] so that newer
/// firmware never causes a hard error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Command {
    /// Telemetry report carrying one or two line measurements.
    DlReport,
    /// Device error report (layout undocumented).
    ErrorReport,
    /// Alarm notification (layout undocumented).
    Alarm,
    /// Any other command code.
    Unknown(u8),
}

impl Command {
    /// Wire value of the command.
    #[must_use]
    pub fn code(self) -> u8 {
        match self {
            Command::DlReport => 1,
            Command::ErrorReport => 2,
            Command::Alarm => 14,
            Command::Unknown(code) => code,
        }
    }
}

impl From<u8> for Command {
    fn from(value: u8) -> Self {
        match value {
            1 => Command::DlReport,
            2 => Command::ErrorReport,
            14 => Command::Alarm,
            other => Command::Unknown(other),
        }
    }
}

impl From<Command> for u8 {
    fn from(command: Command) -> Self {
        command.code()
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::DlReport => write!(f, "DLReport"),
            Command::ErrorReport => write!(f, "ErrorReport"),
            Command::Alarm => write!(f, "Alarm"),
            Command::Unknown(code) => write!(f, "Unknown({})", code),
        }
    }
}

/// Decoded packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Protocol version byte.
    pub version: u8,
    /// Message id byte.
    pub message_id: u8,
    /// Command byte.
    pub command: Command,
    /// Declared body length.
    pub body_len: u16,
}

impl PacketHeader {
    /// Parse a header from the start of `data`.
    ///
    /// The identifier is not checked here; callers resynchronize on it first.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::InsufficientBytes`] if fewer than
    /// [`HEADER_SIZE`] bytes are available.
    pub fn parse(data: &[u8]) -> ParseResult<Self> {
        if data.len() < HEADER_SIZE {
            return Err(ParseError::InsufficientBytes {
                expected: HEADER_SIZE,
                actual: data.len(),
            });
        }

        let mut buf = &data[IDENTIFIER_SIZE..HEADER_SIZE];
        let version = buf.get_u8();
        let message_id = buf.get_u8();
        let command = Command::from(buf.get_u8());
        let body_len = buf.get_u16();

        Ok(Self {
            version,
            message_id,
            command,
            body_len,
        })
    }

    /// Total size of the packet this header announces.
    #[must_use]
    pub fn packet_len(&self) -> usize {
        HEADER_SIZE + usize::from(self.body_len) + TAIL_SIZE
    }
}

/// Whether `data` starts with the packet identifier.
#[must_use]
pub fn starts_with_identifier(data: &[u8]) -> bool {
    data.len() >= IDENTIFIER_SIZE
        && u32::from_be_bytes([data[0], data[1], data[2], data[3]]) == PACKET_IDENTIFIER
}

/// Build a complete framed packet around `body`.
///
/// Used by fakes and fixtures; the device is the only real producer.
///
/// # Errors
///
/// Returns [`ParseError::InvalidData`] if the body does not fit the
/// 16-bit length field.
pub fn encode_packet(command: Command, message_id: u8, body: &[u8]) -> ParseResult<Vec<u8>> {
    let body_len = u16::try_from(body.len()).map_err(|_| {
        ParseError::InvalidData(format!("body of {} bytes exceeds u16 length", body.len()))
    })?;

    let mut packet = Vec::with_capacity(HEADER_SIZE + body.len() + TAIL_SIZE);
    packet.put_u32(PACKET_IDENTIFIER);
    packet.put_u8(PROTOCOL_VERSION);
    packet.put_u8(message_id);
    packet.put_u8(command.code());
    packet.put_u16(body_len);
    packet.put_slice(body);
    packet.put_u16(PACKET_TAIL);
    Ok(packet)
}
