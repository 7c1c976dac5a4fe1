//! Length-prefixed framing for stream transports (TCP, Bluetooth serial).
//!
//! Every frame body is preceded by its length as a little-endian u16.
//! The codec only splits the stream; packet decoding happens in the
//! scheduler so a corrupt body can be discarded without tearing down
//! the link.
//!
//! A length prefix above the frame limit is different: the stream can
//! no longer be resynchronized, so the decoder errors and the scheduler
//! treats the link as closed.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{DecodeError, EncodeError, Ev3Error};
use crate::packet::MAX_FRAME_SIZE;

const LENGTH_PREFIX: usize = 2;

#[derive(Debug, Clone)]
pub struct Ev3FrameCodec {
    max_frame: usize,
}

impl Ev3FrameCodec {
    pub fn new(max_frame: usize) -> Self {
        Self {
            max_frame: max_frame.min(u16::MAX as usize),
        }
    }

    pub fn max_frame(&self) -> usize {
        self.max_frame
    }
}

impl Default for Ev3FrameCodec {
    fn default() -> Self {
        Self::new(MAX_FRAME_SIZE)
    }
}

impl Decoder for Ev3FrameCodec {
    type Item = Bytes;
    type Error = Ev3Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < LENGTH_PREFIX {
            return Ok(None);
        }
        let len = u16::from_le_bytes([src[0], src[1]]) as usize;
        if len > self.max_frame {
            return Err(DecodeError::FrameTooLarge {
                size: len,
                max: self.max_frame,
            }
            .into());
        }
        if src.len() < LENGTH_PREFIX + len {
            src.reserve(LENGTH_PREFIX + len - src.len());
            return Ok(None);
        }
        src.advance(LENGTH_PREFIX);
        Ok(Some(src.split_to(len).freeze()))
    }
}

impl Encoder<Bytes> for Ev3FrameCodec {
    type Error = Ev3Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.len() > self.max_frame {
            return Err(EncodeError::FrameTooLarge {
                size: item.len(),
                max: self.max_frame,
            }
            .into());
        }
        dst.reserve(LENGTH_PREFIX + item.len());
        dst.put_u16_le(item.len() as u16);
        dst.put_slice(&item);
        Ok(())
    }
}
