//! Wire discriminants: command kinds, reply kinds, system commands.
//!
//! Uses proper enums with `TryFrom`; no panics on unknown values.

use std::fmt;

use serde::Serialize;

use crate::error::DecodeError;

// ── CommandKind ──────────────────────────────────────────────────

/// Kind byte of an outgoing command frame.
///
/// Only reply-requesting kinds are modelled: every request submitted to
/// the scheduler resolves from a matched reply.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CommandKind {
    /// Bytecode executed by the VM; reply carries the global variables.
    DirectReply = 0x00,
    /// Firmware-level system command (file system, mailbox, handles).
    SystemReply = 0x01,
}

impl TryFrom<u8> for CommandKind {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(CommandKind::DirectReply),
            0x01 => Ok(CommandKind::SystemReply),
            other => Err(DecodeError::UnknownKind(other)),
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandKind::DirectReply => write!(f, "direct"),
            CommandKind::SystemReply => write!(f, "system"),
        }
    }
}

// ── ReplyKind ────────────────────────────────────────────────────

/// Kind byte of an inbound reply frame.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ReplyKind {
    DirectReply = 0x02,
    SystemReply = 0x03,
    DirectReplyError = 0x04,
    SystemReplyError = 0x05,
}

impl ReplyKind {
    /// Returns `true` if the brick rejected the command.
    pub fn is_error(&self) -> bool {
        matches!(self, ReplyKind::DirectReplyError | ReplyKind::SystemReplyError)
    }

    /// Returns `true` for replies to system commands.
    pub fn is_system(&self) -> bool {
        matches!(self, ReplyKind::SystemReply | ReplyKind::SystemReplyError)
    }
}

impl TryFrom<u8> for ReplyKind {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x02 => Ok(ReplyKind::DirectReply),
            0x03 => Ok(ReplyKind::SystemReply),
            0x04 => Ok(ReplyKind::DirectReplyError),
            0x05 => Ok(ReplyKind::SystemReplyError),
            other => Err(DecodeError::UnknownKind(other)),
        }
    }
}

impl fmt::Display for ReplyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplyKind::DirectReply => write!(f, "direct reply"),
            ReplyKind::SystemReply => write!(f, "system reply"),
            ReplyKind::DirectReplyError => write!(f, "direct reply error"),
            ReplyKind::SystemReplyError => write!(f, "system reply error"),
        }
    }
}

// ── SystemCommand ────────────────────────────────────────────────

/// First payload byte of a system command; echoed in the reply.
///
/// - `0x92..0x98`: file transfer handles
/// - `0x99..0x9D`: file system listing and maintenance
/// - `0x9E..0xA0`: mailbox, pairing, firmware
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SystemCommand {
    BeginDownload = 0x92,
    ContinueDownload = 0x93,
    BeginUpload = 0x94,
    ContinueUpload = 0x95,
    BeginGetFile = 0x96,
    ContinueGetFile = 0x97,
    CloseFileHandle = 0x98,
    ListFiles = 0x99,
    ContinueListFiles = 0x9A,
    CreateDir = 0x9B,
    DeleteFile = 0x9C,
    /// Side-effect free; reserved for link-liveness probes.
    ListOpenHandles = 0x9D,
    WriteMailbox = 0x9E,
    BluetoothPin = 0x9F,
    EnterFirmwareUpdate = 0xA0,
}

/// The system command used to probe link liveness.
pub const PROBE_COMMAND: SystemCommand = SystemCommand::ListOpenHandles;

impl TryFrom<u8> for SystemCommand {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x92 => Ok(SystemCommand::BeginDownload),
            0x93 => Ok(SystemCommand::ContinueDownload),
            0x94 => Ok(SystemCommand::BeginUpload),
            0x95 => Ok(SystemCommand::ContinueUpload),
            0x96 => Ok(SystemCommand::BeginGetFile),
            0x97 => Ok(SystemCommand::ContinueGetFile),
            0x98 => Ok(SystemCommand::CloseFileHandle),
            0x99 => Ok(SystemCommand::ListFiles),
            0x9A => Ok(SystemCommand::ContinueListFiles),
            0x9B => Ok(SystemCommand::CreateDir),
            0x9C => Ok(SystemCommand::DeleteFile),
            0x9D => Ok(SystemCommand::ListOpenHandles),
            0x9E => Ok(SystemCommand::WriteMailbox),
            0x9F => Ok(SystemCommand::BluetoothPin),
            0xA0 => Ok(SystemCommand::EnterFirmwareUpdate),
            other => Err(DecodeError::UnknownKind(other)),
        }
    }
}

impl fmt::Display for SystemCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({:#04x})", self, *self as u8)
    }
}

// ── SystemReplyStatus ────────────────────────────────────────────

/// Status byte following the echoed command in a system reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemReplyStatus {
    Success,
    UnknownHandle,
    HandleNotReady,
    CorruptFile,
    NoHandlesAvailable,
    NoPermission,
    IllegalPath,
    FileExists,
    EndOfFile,
    SizeError,
    UnknownError,
    IllegalFilename,
    IllegalConnection,
    Unrecognized(u8),
}

impl From<u8> for SystemReplyStatus {
    fn from(value: u8) -> Self {
        match value {
            0x00 => SystemReplyStatus::Success,
            0x01 => SystemReplyStatus::UnknownHandle,
            0x02 => SystemReplyStatus::HandleNotReady,
            0x03 => SystemReplyStatus::CorruptFile,
            0x04 => SystemReplyStatus::NoHandlesAvailable,
            0x05 => SystemReplyStatus::NoPermission,
            0x06 => SystemReplyStatus::IllegalPath,
            0x07 => SystemReplyStatus::FileExists,
            0x08 => SystemReplyStatus::EndOfFile,
            0x09 => SystemReplyStatus::SizeError,
            0x0A => SystemReplyStatus::UnknownError,
            0x0B => SystemReplyStatus::IllegalFilename,
            0x0C => SystemReplyStatus::IllegalConnection,
            other => SystemReplyStatus::Unrecognized(other),
        }
    }
}

impl SystemReplyStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, SystemReplyStatus::Success)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_kind_roundtrip() {
        for kind in [
            ReplyKind::DirectReply,
            ReplyKind::SystemReply,
            ReplyKind::DirectReplyError,
            ReplyKind::SystemReplyError,
        ] {
            assert_eq!(ReplyKind::try_from(kind as u8).unwrap(), kind);
        }
    }

    #[test]
    fn command_kinds_are_not_reply_kinds() {
        assert!(ReplyKind::try_from(CommandKind::DirectReply as u8).is_err());
        assert!(ReplyKind::try_from(CommandKind::SystemReply as u8).is_err());
    }

    #[test]
    fn reply_kind_error_flags() {
        assert!(ReplyKind::SystemReplyError.is_error());
        assert!(ReplyKind::SystemReplyError.is_system());
        assert!(!ReplyKind::DirectReply.is_error());
        assert!(!ReplyKind::DirectReplyError.is_system());
    }

    #[test]
    fn probe_command_is_list_open_handles() {
        assert_eq!(PROBE_COMMAND as u8, 0x9D);
        assert_eq!(SystemCommand::try_from(0x9D).unwrap(), PROBE_COMMAND);
    }

    #[test]
    fn system_status_unrecognized_is_preserved() {
        assert_eq!(SystemReplyStatus::from(0x42), SystemReplyStatus::Unrecognized(0x42));
        assert!(SystemReplyStatus::from(0).is_success());
    }
}
