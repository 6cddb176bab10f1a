//! Codec for encoding/decoding stream frames

use crate::messages::Frame;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Serialization error: {0}")]
    SerializationError(#[from] bincode::Error),

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Length-prefixed bincode codec
///
/// Format: `[length: u32 big-endian][payload: bincode serialized Frame]`
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCodec;

impl FrameCodec {
    const HEADER_SIZE: usize = 4;

    /// Encode a frame to bytes
    pub fn encode_frame(frame: &Frame) -> Result<Bytes, CodecError> {
        let mut buf = BytesMut::new();
        Self::write_frame(frame, &mut buf)?;
        Ok(buf.freeze())
    }

    /// Decode one frame from the front of `buf`
    ///
    /// Returns `Ok(None)` if more data is needed.
    pub fn decode_frame(buf: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
        if buf.len() < Self::HEADER_SIZE {
            return Ok(None);
        }

        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&buf[..Self::HEADER_SIZE]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length > crate::MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge(length));
        }

        if buf.len() < Self::HEADER_SIZE + length {
            buf.reserve(Self::HEADER_SIZE + length - buf.len());
            return Ok(None);
        }

        buf.advance(Self::HEADER_SIZE);
        let payload = buf.split_to(length);
        let frame: Frame = bincode::deserialize(&payload)?;

        Ok(Some(frame))
    }

    fn write_frame(frame: &Frame, dst: &mut BytesMut) -> Result<(), CodecError> {
        let payload = bincode::serialize(frame)?;

        if payload.len() > crate::MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge(payload.len()));
        }

        dst.reserve(Self::HEADER_SIZE + payload.len());
        dst.put_u32(payload.len() as u32);
        dst.extend_from_slice(&payload);
        Ok(())
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        Self::write_frame(&item, dst)
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        Self::decode_frame(src)
    }
}
