//! Chunk framing over a byte stream.
//!
//! Each frame is exactly one chunk, cut with `codec::split_chunk`. Frames
//! are left raw so the session can open sealed envelopes itself.
//!
//! A plain container does not declare its byte length, so an incomplete
//! frame is rescanned as more bytes arrive. `max_frame_len` bounds both the
//! buffered bytes and that rescanning.

use bytes::{Bytes, BytesMut};
use ember_core::codec::{self, CodecError};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
    #[error("bad frame: {0}")]
    Codec(#[from] CodecError),
}

/// Largest frame a session will buffer.
pub const DEFAULT_MAX_FRAME_LEN: usize = 8 * 1024 * 1024;

#[derive(Debug, Clone, Copy)]
pub struct ChunkFrameCodec {
    max_frame_len: usize,
}

impl ChunkFrameCodec {
    pub fn new() -> Self {
        Self::with_max_frame_len(DEFAULT_MAX_FRAME_LEN)
    }

    pub fn with_max_frame_len(max_frame_len: usize) -> Self {
        Self { max_frame_len }
    }

    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }
}

impl Default for ChunkFrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for ChunkFrameCodec {
    type Item = Bytes;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match codec::split_chunk(&src[..])? {
            Some(len) if len > self.max_frame_len => Err(CodecError::TooLarge(len).into()),
            Some(len) => Ok(Some(src.split_to(len).freeze())),
            None if src.len() > self.max_frame_len => Err(CodecError::TooLarge(src.len()).into()),
            None => Ok(None),
        }
    }
}

impl Encoder<Bytes> for ChunkFrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(&item);
        Ok(())
    }
}
