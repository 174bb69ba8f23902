//! Chunk framing for the encrypted stream.
//!
//! Each frame is a 2-byte big-endian length prefix followed by exactly
//! that many ciphertext bytes. Zero-length frames are never emitted; a
//! peer that sends one is misbehaving and the decoder rejects it.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::SessionError;

/// Upper bound on a single frame's payload.
///
/// The largest legitimate frame is an OTA chunk message (594-byte chunk
/// plus CoAP and padding overhead), comfortably under this.
pub const MAX_FRAME_SIZE: usize = 1024;

/// Duplex framer for `u16_be length || bytes` chunk frames.
#[derive(Debug)]
pub struct ChunkingFramer {
    max_frame_size: usize,
}

impl ChunkingFramer {
    /// Create a framer with the default frame cap.
    pub fn new() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    /// Create a framer with a custom frame cap.
    pub fn with_max_frame(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }
}

impl Default for ChunkingFramer {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for ChunkingFramer {
    type Item = Bytes;
    type Error = crate::Error;

    fn decode(
        &mut self,
        src: &mut BytesMut,
    ) -> std::result::Result<Option<Self::Item>, Self::Error> {
        if src.len() < 2 {
            return Ok(None);
        }

        let length = u16::from_be_bytes([src[0], src[1]]) as usize;

        if length == 0 {
            return Err(SessionError::MalformedMessage("zero-length frame".into()).into());
        }

        if length > self.max_frame_size {
            return Err(SessionError::FrameOversize {
                size: length,
                max: self.max_frame_size,
            }
            .into());
        }

        let total_len = 2 + length;

        // Wait for the complete frame
        if src.len() < total_len {
            src.reserve(total_len - src.len());
            return Ok(None);
        }

        src.advance(2);
        Ok(Some(src.split_to(length).freeze()))
    }
}

impl Encoder<Bytes> for ChunkingFramer {
    type Error = crate::Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> std::result::Result<(), Self::Error> {
        if item.is_empty() {
            return Err(SessionError::MalformedMessage("refusing zero-length frame".into()).into());
        }

        if item.len() > self.max_frame_size {
            return Err(SessionError::FrameOversize {
                size: item.len(),
                max: self.max_frame_size,
            }
            .into());
        }

        dst.reserve(2 + item.len());
        dst.put_u16(item.len() as u16);
        dst.put_slice(&item);

        Ok(())
    }
}
