//! Fixed frame prefix shared by commands and replies.
//!
//! ```text
//! message_counter: u16 LE  (2)
//! kind:            u8      (1)
//! ```
//!
//! The counter is chosen by the host and echoed verbatim by the brick;
//! it is the only correlation key a reply carries.

use crate::error::DecodeError;

/// Encoded size of [`PacketHeader`] on the wire.
pub const HEADER_SIZE: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub message_counter: u16,
    pub kind: u8,
}

impl PacketHeader {
    pub fn new(message_counter: u16, kind: u8) -> Self {
        Self {
            message_counter,
            kind,
        }
    }

    /// Serialize to bytes (little-endian counter).
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let counter = self.message_counter.to_le_bytes();
        [counter[0], counter[1], self.kind]
    }

    /// Parse the prefix of `bytes`; trailing bytes are ignored.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        match bytes {
            [lo, hi, kind, ..] => Ok(Self {
                message_counter: u16::from_le_bytes([*lo, *hi]),
                kind: *kind,
            }),
            _ => Err(DecodeError::Truncated {
                len: bytes.len(),
                min: HEADER_SIZE,
            }),
        }
    }
}
