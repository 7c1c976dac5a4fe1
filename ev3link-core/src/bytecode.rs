//! Bytecode operand primitives for building command payloads.
//!
//! Pure helpers; device-capability code composes them into direct
//! commands. Encodings follow the brick VM's parameter format:
//!
//! ```text
//! short   0b0VSx_xxxx        V=0 constant / 1 variable, S=sign (constants)
//! long    0b1V0G_0sss        s: 1=1 byte, 2=2 bytes, 3=4 bytes, 4=string
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::EncodeError;
use crate::message::SystemCommand;

const LONG_1: u8 = 0x81;
const LONG_2: u8 = 0x82;
const LONG_4: u8 = 0x83;
const LONG_STR: u8 = 0x84;

const SHORT_LOCAL: u8 = 0x40;
const SHORT_GLOBAL: u8 = 0x60;
const LONG_LOCAL: u8 = 0xC0;
const LONG_GLOBAL: u8 = 0xE0;

/// Upper bounds of the direct command variable allocation header.
pub const MAX_GLOBAL_BYTES: u16 = 1023;
pub const MAX_LOCAL_BYTES: u8 = 63;

// ── Constants ────────────────────────────────────────────────────

/// Short constant, `-31..=31`.
pub fn lc0(value: i8) -> Result<[u8; 1], EncodeError> {
    if !(-31..=31).contains(&value) {
        return Err(EncodeError::OperandOutOfRange {
            encoding: "LC0",
            value: value as i64,
        });
    }
    Ok([(value as u8) & 0x3F])
}

pub fn lc1(value: i8) -> [u8; 2] {
    [LONG_1, value as u8]
}

pub fn lc2(value: i16) -> [u8; 3] {
    let b = value.to_le_bytes();
    [LONG_2, b[0], b[1]]
}

pub fn lc4(value: i32) -> [u8; 5] {
    let b = value.to_le_bytes();
    [LONG_4, b[0], b[1], b[2], b[3]]
}

/// Smallest constant encoding that holds `value`.
pub fn lcx(value: i32) -> Vec<u8> {
    if (-31..=31).contains(&value) {
        vec![(value as u8) & 0x3F]
    } else if let Ok(v) = i8::try_from(value) {
        lc1(v).to_vec()
    } else if let Ok(v) = i16::try_from(value) {
        lc2(v).to_vec()
    } else {
        lc4(value).to_vec()
    }
}

/// NUL-terminated string constant.
pub fn lcs(value: &str) -> Result<Vec<u8>, EncodeError> {
    if value.as_bytes().contains(&0) {
        return Err(EncodeError::InteriorNul);
    }
    let mut out = Vec::with_capacity(value.len() + 2);
    out.push(LONG_STR);
    out.extend_from_slice(value.as_bytes());
    out.push(0);
    Ok(out)
}

// ── Variables ────────────────────────────────────────────────────

/// Short local variable reference, offset `0..=31`.
pub fn lv0(offset: u8) -> Result<[u8; 1], EncodeError> {
    short_var(SHORT_LOCAL, "LV0", offset)
}

/// Smallest local variable reference that holds `offset`.
pub fn lvx(offset: u16) -> Vec<u8> {
    var_x(SHORT_LOCAL, LONG_LOCAL, offset)
}

/// Short global variable reference, offset `0..=31`.
pub fn gv0(offset: u8) -> Result<[u8; 1], EncodeError> {
    short_var(SHORT_GLOBAL, "GV0", offset)
}

pub fn gv1(offset: u8) -> [u8; 2] {
    [LONG_GLOBAL | 0x01, offset]
}

pub fn gv2(offset: u16) -> [u8; 3] {
    let b = offset.to_le_bytes();
    [LONG_GLOBAL | 0x02, b[0], b[1]]
}

/// Smallest global variable reference that holds `offset`.
pub fn gvx(offset: u16) -> Vec<u8> {
    var_x(SHORT_GLOBAL, LONG_GLOBAL, offset)
}

fn short_var(tag: u8, encoding: &'static str, offset: u8) -> Result<[u8; 1], EncodeError> {
    if offset > 31 {
        return Err(EncodeError::OperandOutOfRange {
            encoding,
            value: offset as i64,
        });
    }
    Ok([tag | offset])
}

fn var_x(short_tag: u8, long_tag: u8, offset: u16) -> Vec<u8> {
    match u8::try_from(offset) {
        Ok(o) if o <= 31 => vec![short_tag | o],
        Ok(o) => vec![long_tag | 0x01, o],
        Err(_) => {
            let b = offset.to_le_bytes();
            vec![long_tag | 0x02, b[0], b[1]]
        }
    }
}

// ── Payload builders ─────────────────────────────────────────────

/// Builder for a direct command payload.
///
/// The payload starts with the variable allocation header
/// (`globals | locals << 10`, little-endian) followed by opcodes and
/// operands in submission order.
#[derive(Debug, Clone)]
pub struct DirectCommand {
    buf: BytesMut,
}

impl DirectCommand {
    /// Reserve `globals` bytes of reply space and `locals` scratch bytes.
    pub fn new(globals: u16, locals: u8) -> Result<Self, EncodeError> {
        if globals > MAX_GLOBAL_BYTES {
            return Err(EncodeError::OperandOutOfRange {
                encoding: "global allocation",
                value: globals as i64,
            });
        }
        if locals > MAX_LOCAL_BYTES {
            return Err(EncodeError::OperandOutOfRange {
                encoding: "local allocation",
                value: locals as i64,
            });
        }
        let mut buf = BytesMut::with_capacity(32);
        buf.put_u16_le(globals | (u16::from(locals) << 10));
        Ok(Self { buf })
    }

    pub fn opcode(mut self, op: u8) -> Self {
        self.buf.put_u8(op);
        self
    }

    pub fn operand(mut self, encoded: impl AsRef<[u8]>) -> Self {
        self.buf.put_slice(encoded.as_ref());
        self
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn build(self) -> Bytes {
        self.buf.freeze()
    }
}

/// A system command payload: the command byte followed by `params`.
pub fn system_command(cmd: SystemCommand, params: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(1 + params.len());
    buf.put_u8(cmd as u8);
    buf.put_slice(params);
    buf.freeze()
}
