//! Multiplexer frames over plain byte streams.
//!
//! A WebSocket message already delimits one frame. TCP and Unix sockets do
//! not, so every frame is sent behind a 4-byte big-endian length:
//! ```text
//! +----------------+------------------+
//! |  4 bytes       |  N bytes         |
//! |  (length BE)   |  (frame)         |
//! +----------------+------------------+
//! ```
//!
//! A body that fails to parse is yielded as an `Err` item, so the stream
//! stays usable and the multiplexer can close only the channel it named.
//! An oversized length or an I/O failure ends the stream.

use std::io;

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec, LengthDelimitedCodecError};

use crate::frame::{Frame, FrameError};

/// Largest frame body accepted in either direction (16 MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Length-delimited [`Frame`] codec for `Framed` byte streams
#[derive(Debug)]
pub struct FrameCodec {
    lengths: LengthDelimitedCodec,
}

impl FrameCodec {
    #[must_use]
    pub fn new() -> Self {
        Self {
            lengths: LengthDelimitedCodec::builder()
                .length_field_length(4)
                .max_frame_length(MAX_FRAME_SIZE)
                .big_endian()
                .new_codec(),
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = std::result::Result<Frame, FrameError>;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let body = self.lengths.decode(src).map_err(CodecError::from_length)?;
        Ok(body.map(|body| Frame::decode(body.freeze())))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let len = item.encoded_len();
        if len > MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge(len));
        }
        self.lengths
            .encode(item.to_bytes(), dst)
            .map_err(CodecError::from_length)
    }
}

/// Errors that end a framed byte stream
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Frame too large: {0} bytes (max: {MAX_FRAME_SIZE})")]
    FrameTooLarge(usize),

    #[error("Length prefix exceeds {MAX_FRAME_SIZE} bytes")]
    LengthOverLimit,
}

impl CodecError {
    /// The length codec reports oversized frames as `InvalidData` I/O errors.
    fn from_length(e: io::Error) -> Self {
        if e.get_ref()
            .is_some_and(|inner| inner.is::<LengthDelimitedCodecError>())
        {
            Self::LengthOverLimit
        } else {
            Self::Io(e)
        }
    }
}
