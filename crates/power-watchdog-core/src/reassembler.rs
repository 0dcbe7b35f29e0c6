//! Packet reassembly over an arbitrarily chunked notification stream.
//!
//! Notifications are appended to a bounded buffer and complete packets are
//! cut out of it. The engine resynchronizes byte by byte on the packet
//! identifier, waits for partial packets to complete, and consumes a packet
//! whose tail is corrupt instead of retrying it. If undecoded bytes ever
//! exceed [`MAX_BUFFER_SIZE`] the whole buffer is dropped.

use bytes::{Buf, Bytes, BytesMut};
use tracing::{debug, warn};

use power_watchdog_types::PacketHeader;
use power_watchdog_types::protocol::{
    HEADER_SIZE, IDENTIFIER_SIZE, MAX_BUFFER_SIZE, PACKET_TAIL, TAIL_SIZE,
    starts_with_identifier,
};

/// A complete, tail-verified packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Parsed header.
    pub header: PacketHeader,
    /// Body bytes (between header and tail).
    pub body: Bytes,
    /// The full span consumed from the buffer, header through tail.
    pub raw: Bytes,
}

/// Outcome of one extraction step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReassemblyEvent {
    /// A packet with a valid tail.
    Packet(Packet),
    /// A packet-shaped span whose tail did not match; its bytes were consumed.
    BadTail {
        /// Tail value found.
        found: u16,
        /// Bytes consumed.
        consumed: usize,
    },
    /// A header declaring a body longer than the ceiling; the identifier was
    /// skipped.
    OversizedLength {
        /// Declared body length.
        declared: u16,
    },
    /// The buffer grew past the ceiling and was cleared.
    Overflow {
        /// Bytes buffered at the time of the overflow.
        buffered: usize,
    },
}

/// Stateful packet framer.
///
/// One instance belongs to one connection attempt and is never shared.
#[derive(Debug, Default)]
pub struct Reassembler {
    buffer: BytesMut,
}

impl Reassembler {
    /// Create an empty reassembler.
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(256),
        }
    }

    /// Number of undecoded bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Drop all buffered bytes.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Append a notification chunk and extract every packet now complete.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<ReassemblyEvent> {
        self.buffer.extend_from_slice(chunk);

        if self.buffer.len() > MAX_BUFFER_SIZE {
            let buffered = self.buffer.len();
            warn!("RX buffer overflow ({} bytes), clearing", buffered);
            self.buffer.clear();
            return vec![ReassemblyEvent::Overflow { buffered }];
        }

        let mut events = Vec::new();
        while let Some(event) = self.extract() {
            events.push(event);
        }
        events
    }

    /// Try to cut one packet from the front of the buffer.
    ///
    /// Returns `None` when more bytes are needed.
    fn extract(&mut self) -> Option<ReassemblyEvent> {
        let mut skipped = 0usize;
        while self.buffer.len() >= IDENTIFIER_SIZE && !starts_with_identifier(&self.buffer) {
            self.buffer.advance(1);
            skipped += 1;
        }
        if skipped > 0 {
            debug!("Skipped {} bytes to resynchronize", skipped);
        }

        let header = PacketHeader::parse(&self.buffer).ok()?;

        if usize::from(header.body_len) > MAX_BUFFER_SIZE {
            warn!("Invalid body length {}, discarding", header.body_len);
            self.buffer.advance(IDENTIFIER_SIZE);
            return Some(ReassemblyEvent::OversizedLength {
                declared: header.body_len,
            });
        }

        let total = header.packet_len();
        if self.buffer.len() < total {
            return None;
        }

        let raw = self.buffer.split_to(total).freeze();
        let tail = u16::from_be_bytes([raw[total - 2], raw[total - 1]]);
        if tail != PACKET_TAIL {
            debug!(
                "Bad packet tail 0x{:04X} (expected 0x{:04X})",
                tail, PACKET_TAIL
            );
            return Some(ReassemblyEvent::BadTail {
                found: tail,
                consumed: total,
            });
        }

        let body = raw.slice(HEADER_SIZE..total - TAIL_SIZE);
        Some(ReassemblyEvent::Packet(Packet { header, body, raw }))
    }
}
