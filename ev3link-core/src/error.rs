//! Domain-specific error types for the EV3 link core.
//!
//! Every fallible request-level operation returns `Result<T, Ev3Error>`.
//! Wire-level failures are split into [`EncodeError`] and [`DecodeError`]
//! so callers can tell "never left the host" apart from "arrived garbled".

use std::time::Duration;

use thiserror::Error;

use crate::message::ReplyKind;
use crate::orphan::OrphanReason;

// ── EncodeError ──────────────────────────────────────────────────

/// Failure while turning logical command fields into wire bytes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    /// The encoded frame does not fit the transport's maximum frame size.
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// A bytecode operand cannot be represented by the requested encoding.
    #[error("operand out of range for {encoding}: {value}")]
    OperandOutOfRange { encoding: &'static str, value: i64 },

    /// String constants are NUL terminated and may not contain NUL.
    #[error("string constant contains an interior NUL byte")]
    InteriorNul,
}

// ── DecodeError ──────────────────────────────────────────────────

/// Failure while turning inbound wire bytes into a [`Packet`].
///
/// [`Packet`]: crate::packet::Packet
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Fewer bytes than the fixed counter + kind prefix.
    #[error("truncated reply: {len} bytes (need at least {min})")]
    Truncated { len: usize, min: usize },

    /// The kind byte is not one of the reply kinds.
    #[error("unknown reply kind: {0:#04x}")]
    UnknownKind(u8),

    /// A stream frame declared a body larger than the configured limit.
    #[error("inbound frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },
}

// ── Ev3Error ─────────────────────────────────────────────────────

/// The request-level error taxonomy.
///
/// | variant     | executed on the brick? | recovery run? |
/// |-------------|------------------------|---------------|
/// | `Encode`    | no                     | no            |
/// | `Transport` | no                     | no            |
/// | `Orphaned`  | unknown                | yes           |
/// | `Disposed`  | no (or abandoned)      | no            |
/// | `Protocol`  | rejected by the brick  | no            |
#[derive(Debug, Error)]
pub enum Ev3Error {
    /// The command could not be encoded.
    #[error("encode error: {0}")]
    Encode(#[from] EncodeError),

    /// A frame could not be decoded.
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Writing or connecting failed; the command provably never reached
    /// the brick.
    #[error("transport error: {0}")]
    Transport(String),

    /// No reply was matched before the deadline or the link closed.
    /// Whether the brick executed the command is unknown.
    #[error("request {request_id} orphaned ({reason})")]
    Orphaned {
        request_id: String,
        reason: OrphanReason,
    },

    /// The scheduler was torn down before the request resolved.
    #[error("scheduler disposed")]
    Disposed,

    /// A well-formed reply in which the brick rejected the command.
    #[error("brick rejected command ({kind}): {detail}")]
    Protocol { kind: ReplyKind, detail: String },

    /// An operation outside the scheduler exceeded its deadline.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    /// Catch-all for errors that do not fit another variant.
    #[error("{0}")]
    Other(String),
}

impl Ev3Error {
    /// `true` when the brick may have executed the command.
    pub fn outcome_unknown(&self) -> bool {
        matches!(self, Ev3Error::Orphaned { .. })
    }
}

// ── Convenient From implementations ──────────────────────────────

impl From<std::io::Error> for Ev3Error {
    fn from(e: std::io::Error) -> Self {
        Ev3Error::Transport(e.to_string())
    }
}

impl From<String> for Ev3Error {
    fn from(s: String) -> Self {
        Ev3Error::Other(s)
    }
}

impl From<&str> for Ev3Error {
    fn from(s: &str) -> Self {
        Ev3Error::Other(s.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Ev3Error {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Ev3Error::Disposed
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for Ev3Error {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        Ev3Error::Disposed
    }
}
