//! Multiplexer frame model.
//!
//! Every frame starts with a kind byte and the channel id it belongs to:
//! ```text
//! +--------+----------------+--------------------------+
//! | kind   | channel id     | body                     |
//! | 1 byte | u32 LE         | kind-specific            |
//! +--------+----------------+--------------------------+
//! ```
//!
//! - `OPEN` (4): body is the 4-byte ASCII [`ChannelCode`]
//! - `CLOSE` (8): body is an optional u16 LE close code followed by a UTF-8 reason
//! - `BINARY` (16): opaque payload
//! - `TEXT` (32): UTF-8 payload
//!
//! On a WebSocket one binary message carries exactly one frame. Byte streams
//! use [`crate::codec::FrameCodec`] to add a length prefix.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use devmux_types::ChannelCode;

pub const KIND_OPEN: u8 = 4;
pub const KIND_CLOSE: u8 = 8;
pub const KIND_BINARY: u8 = 16;
pub const KIND_TEXT: u8 = 32;

/// Kind byte plus channel id
pub const HEADER_SIZE: usize = 5;

/// Close code for an orderly shutdown
pub const NORMAL_CLOSURE: u16 = 1000;
/// Close code when the peer goes away
pub const GOING_AWAY: u16 = 1001;
/// Close code for protocol violations (malformed frames)
pub const PROTOCOL_ERROR: u16 = 1002;
/// Close code for channels no handler claims
pub const UNSUPPORTED: u16 = 1003;
/// Close code used when a connection ends without a close handshake
pub const ABNORMAL_CLOSURE: u16 = 1006;

/// Data carried by a channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    Binary(Bytes),
}

impl Payload {
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Payload::Text(text) => text.len(),
            Payload::Binary(bytes) => bytes.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Text view of the payload; binary payloads are read as UTF-8 if valid.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Payload::Text(text) => Some(text),
            Payload::Binary(bytes) => std::str::from_utf8(bytes).ok(),
        }
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Payload::Text(text)
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Payload::Text(text.to_string())
    }
}

impl From<Bytes> for Payload {
    fn from(bytes: Bytes) -> Self {
        Payload::Binary(bytes)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Open {
        id: u32,
        code: ChannelCode,
    },
    Close {
        id: u32,
        code: u16,
        reason: String,
    },
    Data {
        id: u32,
        payload: Payload,
    },
}

impl Frame {
    #[must_use]
    pub fn channel_id(&self) -> u32 {
        match self {
            Frame::Open { id, .. } | Frame::Close { id, .. } | Frame::Data { id, .. } => *id,
        }
    }

    #[must_use]
    pub fn close(id: u32, code: u16, reason: impl Into<String>) -> Self {
        Frame::Close {
            id,
            code,
            reason: reason.into(),
        }
    }

    #[must_use]
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE
            + match self {
                Frame::Open { .. } => 4,
                Frame::Close { reason, .. } => 2 + reason.len(),
                Frame::Data { payload, .. } => payload.len(),
            }
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(self.encoded_len());
        match self {
            Frame::Open { id, code } => {
                dst.put_u8(KIND_OPEN);
                dst.put_u32_le(*id);
                dst.put_slice(code.as_bytes());
            }
            Frame::Close { id, code, reason } => {
                dst.put_u8(KIND_CLOSE);
                dst.put_u32_le(*id);
                dst.put_u16_le(*code);
                dst.put_slice(reason.as_bytes());
            }
            Frame::Data {
                id,
                payload: Payload::Binary(bytes),
            } => {
                dst.put_u8(KIND_BINARY);
                dst.put_u32_le(*id);
                dst.put_slice(bytes);
            }
            Frame::Data {
                id,
                payload: Payload::Text(text),
            } => {
                dst.put_u8(KIND_TEXT);
                dst.put_u32_le(*id);
                dst.put_slice(text.as_bytes());
            }
        }
    }

    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Parse one complete frame.
    ///
    /// # Errors
    ///
    /// Returns a [`FrameError`] if the frame is truncated, has an unknown kind,
    /// an invalid type code or a text body that is not UTF-8.
    pub fn decode(mut src: Bytes) -> Result<Self, FrameError> {
        if src.len() < HEADER_SIZE {
            return Err(FrameError::Truncated { len: src.len() });
        }

        let kind = src.get_u8();
        let id = src.get_u32_le();

        match kind {
            KIND_OPEN => {
                if src.len() < 4 {
                    return Err(FrameError::MissingTypeCode { id });
                }
                let mut raw = [0u8; 4];
                src.copy_to_slice(&mut raw);
                let code =
                    ChannelCode::from_bytes(raw).ok_or(FrameError::InvalidTypeCode { id, raw })?;
                Ok(Frame::Open { id, code })
            }
            KIND_CLOSE => {
                if src.is_empty() {
                    return Ok(Frame::close(id, NORMAL_CLOSURE, ""));
                }
                if src.len() < 2 {
                    return Err(FrameError::InvalidClose { id });
                }
                let code = src.get_u16_le();
                let reason =
                    String::from_utf8(src.to_vec()).map_err(|_| FrameError::InvalidClose { id })?;
                Ok(Frame::Close { id, code, reason })
            }
            KIND_BINARY => Ok(Frame::Data {
                id,
                payload: Payload::Binary(src),
            }),
            KIND_TEXT => {
                let text = String::from_utf8(src.to_vec())
                    .map_err(|_| FrameError::InvalidText { id })?;
                Ok(Frame::Data {
                    id,
                    payload: Payload::Text(text),
                })
            }
            other => Err(FrameError::UnknownKind { id, kind: other }),
        }
    }
}

/// A frame that could not be parsed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("Truncated frame: {len} bytes (header needs {HEADER_SIZE})")]
    Truncated { len: usize },

    #[error("Unknown frame kind {kind} on channel {id}")]
    UnknownKind { id: u32, kind: u8 },

    #[error("Open frame for channel {id} has no type code")]
    MissingTypeCode { id: u32 },

    #[error("Open frame for channel {id} has invalid type code {raw:?}")]
    InvalidTypeCode { id: u32, raw: [u8; 4] },

    #[error("Malformed close frame for channel {id}")]
    InvalidClose { id: u32 },

    #[error("Text frame for channel {id} is not valid UTF-8")]
    InvalidText { id: u32 },
}

impl FrameError {
    /// Channel the malformed frame was addressed to, if the header was readable.
    #[must_use]
    pub fn channel_id(&self) -> Option<u32> {
        match self {
            FrameError::Truncated { .. } => None,
            FrameError::UnknownKind { id, .. }
            | FrameError::MissingTypeCode { id }
            | FrameError::InvalidTypeCode { id, .. }
            | FrameError::InvalidClose { id }
            | FrameError::InvalidText { id } => Some(*id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_frame_layout() {
        let frame = Frame::Open {
            id: 0x0102_0304,
            code: ChannelCode::GTRC,
        };
        let bytes = frame.to_bytes();
        assert_eq!(&bytes[..], &[4, 0x04, 0x03, 0x02, 0x01, b'G', b'T', b'R', b'C']);
        assert_eq!(Frame::decode(bytes).unwrap(), frame);
    }

    #[test]
    fn close_frame_with_reason() {
        let frame = Frame::close(9, GOING_AWAY, "bye");
        let bytes = frame.to_bytes();
        assert_eq!(bytes.len(), frame.encoded_len());
        assert_eq!(Frame::decode(bytes).unwrap(), frame);
    }

    #[test]
    fn bare_close_frame_is_normal_closure() {
        let bytes = Bytes::from_static(&[KIND_CLOSE, 7, 0, 0, 0]);
        assert_eq!(
            Frame::decode(bytes).unwrap(),
            Frame::close(7, NORMAL_CLOSURE, "")
        );
    }

    #[test]
    fn text_and_binary_payloads() {
        let text = Frame::Data {
            id: 3,
            payload: Payload::from(r#"{"type":"HOSTS"}"#),
        };
        assert_eq!(Frame::decode(text.to_bytes()).unwrap(), text);

        let binary = Frame::Data {
            id: 3,
            payload: Payload::Binary(Bytes::from_static(&[0, 1, 2, 255])),
        };
        assert_eq!(Frame::decode(binary.to_bytes()).unwrap(), binary);
    }

    #[test]
    fn truncated_header() {
        let err = Frame::decode(Bytes::from_static(&[KIND_TEXT, 1, 0])).unwrap_err();
        assert_eq!(err, FrameError::Truncated { len: 3 });
        assert_eq!(err.channel_id(), None);
    }

    #[test]
    fn unknown_kind_keeps_channel_id() {
        let err = Frame::decode(Bytes::from_static(&[99, 5, 0, 0, 0])).unwrap_err();
        assert_eq!(err, FrameError::UnknownKind { id: 5, kind: 99 });
        assert_eq!(err.channel_id(), Some(5));
    }

    #[test]
    fn open_frame_needs_printable_code() {
        let err =
            Frame::decode(Bytes::from_static(&[KIND_OPEN, 1, 0, 0, 0, b'G', 0, b'R', b'C']))
                .unwrap_err();
        assert!(matches!(err, FrameError::InvalidTypeCode { id: 1, .. }));

        let err = Frame::decode(Bytes::from_static(&[KIND_OPEN, 1, 0, 0, 0, b'G'])).unwrap_err();
        assert_eq!(err, FrameError::MissingTypeCode { id: 1 });
    }

    #[test]
    fn invalid_utf8_text() {
        let err =
            Frame::decode(Bytes::from_static(&[KIND_TEXT, 2, 0, 0, 0, 0xff, 0xfe])).unwrap_err();
        assert_eq!(err, FrameError::InvalidText { id: 2 });
    }

    #[test]
    fn binary_payload_text_view() {
        let payload = Payload::Binary(Bytes::from_static(b"hello"));
        assert_eq!(payload.as_text(), Some("hello"));
        let payload = Payload::Binary(Bytes::from_static(&[0xff]));
        assert_eq!(payload.as_text(), None);
    }
}
