//! Command/reply packets and their wire encoding.
//!
//! A frame body is a [`PacketHeader`] followed by the payload. Stream
//! transports add a length prefix on top (see [`Ev3FrameCodec`]).
//!
//! [`Ev3FrameCodec`]: crate::codec::Ev3FrameCodec

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{DecodeError, EncodeError};
use crate::header::{HEADER_SIZE, PacketHeader};
use crate::message::{CommandKind, ReplyKind, SystemReplyStatus};

/// Largest frame body (header + payload) accepted by default.
pub const MAX_FRAME_SIZE: usize = 1024;

/// Largest payload that fits a default-sized frame.
pub const MAX_PAYLOAD_SIZE: usize = MAX_FRAME_SIZE - HEADER_SIZE;

// ── PacketKind ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Command(CommandKind),
    Reply(ReplyKind),
}

impl PacketKind {
    fn byte(&self) -> u8 {
        match self {
            PacketKind::Command(k) => *k as u8,
            PacketKind::Reply(k) => *k as u8,
        }
    }
}

// ── Packet ───────────────────────────────────────────────────────

#[derive(Clone, PartialEq, Eq)]
pub struct Packet {
    message_counter: u16,
    kind: PacketKind,
    payload: Bytes,
}

impl Packet {
    pub fn command(message_counter: u16, kind: CommandKind, payload: impl Into<Bytes>) -> Self {
        Self {
            message_counter,
            kind: PacketKind::Command(kind),
            payload: payload.into(),
        }
    }

    pub fn reply(message_counter: u16, kind: ReplyKind, payload: impl Into<Bytes>) -> Self {
        Self {
            message_counter,
            kind: PacketKind::Reply(kind),
            payload: payload.into(),
        }
    }

    pub fn message_counter(&self) -> u16 {
        self.message_counter
    }

    pub fn kind(&self) -> PacketKind {
        self.kind
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// The reply kind, or `None` for command packets.
    pub fn reply_kind(&self) -> Option<ReplyKind> {
        match self.kind {
            PacketKind::Reply(k) => Some(k),
            PacketKind::Command(_) => None,
        }
    }

    /// Returns `true` for a reply in which the brick rejected the command.
    pub fn is_error(&self) -> bool {
        self.reply_kind().is_some_and(|k| k.is_error())
    }

    /// For system replies: the echoed system command byte and its status.
    pub fn system_status(&self) -> Option<(u8, SystemReplyStatus)> {
        if !self.reply_kind().is_some_and(|k| k.is_system()) {
            return None;
        }
        match self.payload.as_ref() {
            [echo, status, ..] => Some((*echo, SystemReplyStatus::from(*status))),
            _ => None,
        }
    }

    /// Serialize header + payload, enforcing `max_frame`.
    pub fn to_bytes(&self, max_frame: usize) -> Result<Bytes, EncodeError> {
        let size = HEADER_SIZE + self.payload.len();
        if size > max_frame {
            return Err(EncodeError::FrameTooLarge {
                size,
                max: max_frame,
            });
        }
        let mut buf = BytesMut::with_capacity(size);
        buf.put_slice(&PacketHeader::new(self.message_counter, self.kind.byte()).encode());
        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("message_counter", &self.message_counter)
            .field("kind", &self.kind)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

// ── Free-standing codec operations ───────────────────────────────

/// Encode a command frame body with the default frame limit.
pub fn encode_command(counter: u16, kind: CommandKind, payload: &[u8]) -> Result<Bytes, EncodeError> {
    encode_command_limited(counter, kind, payload, MAX_FRAME_SIZE)
}

/// Encode a command frame body against a transport-specific limit.
pub fn encode_command_limited(
    counter: u16,
    kind: CommandKind,
    payload: &[u8],
    max_frame: usize,
) -> Result<Bytes, EncodeError> {
    Packet::command(counter, kind, Bytes::copy_from_slice(payload)).to_bytes(max_frame)
}

/// Decode a reply frame body.
pub fn decode_reply(bytes: &[u8]) -> Result<Packet, DecodeError> {
    let header = PacketHeader::decode(bytes)?;
    let kind = ReplyKind::try_from(header.kind)?;
    Ok(Packet::reply(
        header.message_counter,
        kind,
        Bytes::copy_from_slice(&bytes[HEADER_SIZE..]),
    ))
}

/// Decode a command frame body, as the brick side would.
pub fn decode_command(bytes: &[u8]) -> Result<Packet, DecodeError> {
    let header = PacketHeader::decode(bytes)?;
    let kind = CommandKind::try_from(header.kind)?;
    Ok(Packet::command(
        header.message_counter,
        kind,
        Bytes::copy_from_slice(&bytes[HEADER_SIZE..]),
    ))
}

/// Encode a reply frame body, as the brick side would.
pub fn encode_reply(counter: u16, kind: ReplyKind, payload: &[u8]) -> Result<Bytes, EncodeError> {
    Packet::reply(counter, kind, Bytes::copy_from_slice(payload)).to_bytes(MAX_FRAME_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_command_layout() {
        let bytes = encode_command(0x0102, CommandKind::SystemReply, &[0x9D]).unwrap();
        assert_eq!(bytes.as_ref(), &[0x02, 0x01, 0x01, 0x9D]);
    }

    #[test]
    fn encode_rejects_oversized_payload() {
        let payload = vec![0u8; MAX_PAYLOAD_SIZE + 1];
        let err = encode_command(1, CommandKind::DirectReply, &payload).unwrap_err();
        assert_eq!(
            err,
            EncodeError::FrameTooLarge {
                size: MAX_FRAME_SIZE + 1,
                max: MAX_FRAME_SIZE
            }
        );
        assert!(encode_command(1, CommandKind::DirectReply, &payload[1..]).is_ok());
    }

    #[test]
    fn encode_respects_custom_limit() {
        assert!(encode_command_limited(1, CommandKind::DirectReply, &[0; 8], 10).is_err());
        assert!(encode_command_limited(1, CommandKind::DirectReply, &[0; 7], 10).is_ok());
    }

    #[test]
    fn decode_reply_fields() {
        let pkt = decode_reply(&[0x07, 0x00, 0x03, 0x9D, 0x00, 0xAA]).unwrap();
        assert_eq!(pkt.message_counter(), 7);
        assert_eq!(pkt.reply_kind(), Some(ReplyKind::SystemReply));
        assert_eq!(pkt.payload(), &[0x9D, 0x00, 0xAA]);
        assert_eq!(pkt.system_status(), Some((0x9D, SystemReplyStatus::Success)));
        assert!(!pkt.is_error());
    }

    #[test]
    fn decode_reply_truncated() {
        assert!(matches!(
            decode_reply(&[0x01, 0x00]),
            Err(DecodeError::Truncated { len: 2, .. })
        ));
        assert!(matches!(decode_reply(&[]), Err(DecodeError::Truncated { .. })));
    }

    #[test]
    fn decode_reply_rejects_command_kind() {
        assert_eq!(
            decode_reply(&[0x01, 0x00, 0x00]).unwrap_err(),
            DecodeError::UnknownKind(0x00)
        );
    }

    #[test]
    fn error_reply_is_flagged() {
        let pkt = decode_reply(&[0x01, 0x00, 0x05, 0x99, 0x06]).unwrap();
        assert!(pkt.is_error());
        assert_eq!(
            pkt.system_status(),
            Some((0x99, SystemReplyStatus::IllegalPath))
        );
    }

    #[test]
    fn direct_reply_has_no_system_status() {
        let pkt = decode_reply(&[0x01, 0x00, 0x02, 0x10, 0x20]).unwrap();
        assert_eq!(pkt.system_status(), None);
    }

    #[test]
    fn brick_side_roundtrip_keeps_counter() {
        let body = encode_command(0xFFFF, CommandKind::DirectReply, b"\x00\x00").unwrap();
        let cmd = decode_command(&body).unwrap();
        assert_eq!(cmd.message_counter(), 0xFFFF);
        assert_eq!(cmd.kind(), PacketKind::Command(CommandKind::DirectReply));
    }
}
