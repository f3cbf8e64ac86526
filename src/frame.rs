//! # Frame
//!
//! WebSocket frames as defined in [RFC 6455 Section 5.2](https://datatracker.ietf.org/doc/html/rfc6455#section-5.2),
//! the atomic unit of data transmission on a WebSocket connection.
//!
//! ## Frame Binary Format
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |         (16 or 64 bits)       |
//! |N|V|V|V|       |S|             |                               |
//! | |1|2|3|       |K|             |                               |
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |        Extended payload length continued, if payload len == 127|
//! +---------------------------------------------------------------+
//! |                               |   Masking-key, if MASK set to 1|
//! +-------------------------------+-------------------------------+
//! |     Masking-key (continued)       |          Payload Data      |
//! +-----------------------------------+ - - - - - - - - - - - - - -+
//! :                     Payload Data continued ...                :
//! +---------------------------------------------------------------+
//! ```
//!
//! Frames come in two categories:
//!
//! - **Data Frames**: carry application payload with [`OpCode::Text`],
//!   [`OpCode::Binary`], or [`OpCode::Continuation`] for fragmented messages.
//! - **Control Frames**: manage the connection with [`OpCode::Close`],
//!   [`OpCode::Ping`], and [`OpCode::Pong`]. Control frames carry at most 125
//!   payload bytes and are never fragmented.
//!
//! A [`Frame`] holds its payload as immutable [`Bytes`]: once constructed, a
//! frame's content never changes, and `clone()` produces an independent frame
//! whose payload is shared without any mutable aliasing. Handlers that need to
//! retain a frame beyond a callback simply clone it. Masking is a wire-level
//! concern handled entirely by the codec: payloads held in memory are always
//! unmasked.
//!
//! Construction goes through the factory methods:
//!
//! ```rust
//! use wscore::frame::Frame;
//! use wscore::close::CloseCode;
//!
//! let text = Frame::text("Hello, WebSocket!");
//! let ping = Frame::ping("liveness");
//! let close = Frame::close(CloseCode::Normal, b"bye");
//! ```
use bytes::{Bytes, BytesMut};

use crate::{close::CloseCode, WebSocketError};

/// WebSocket operation code (OpCode) that determines the semantic meaning and
/// handling of a frame.
///
/// The numeric values are defined in
/// [RFC 6455, Section 11.8](https://datatracker.ietf.org/doc/html/rfc6455#section-11.8):
/// - Continuation = 0x0
/// - Text = 0x1
/// - Binary = 0x2
/// - Close = 0x8
/// - Ping = 0x9
/// - Pong = 0xA
///
/// The ranges 0x3-0x7 and 0xB-0xF are reserved for future protocol versions;
/// frames using them are rejected as invalid.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl OpCode {
    /// Returns `true` if the `OpCode` represents a control frame (`Close`,
    /// `Ping`, or `Pong`).
    ///
    /// Control frames have special constraints: they cannot be fragmented (the
    /// FIN bit must be set), their payload must not exceed 125 bytes, and they
    /// are processed immediately rather than queued behind data frames.
    pub fn is_control(&self) -> bool {
        matches!(*self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }

    /// Returns `true` for the data frame opcodes (`Text`, `Binary`,
    /// `Continuation`).
    pub fn is_data(&self) -> bool {
        !self.is_control()
    }
}

impl TryFrom<u8> for OpCode {
    type Error = WebSocketError;

    /// Interprets the opcode field from a frame header. Reserved opcodes
    /// (0x3-0x7 and 0xB-0xF) yield [`WebSocketError::InvalidOpCode`].
    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x0 => Ok(Self::Continuation),
            0x1 => Ok(Self::Text),
            0x2 => Ok(Self::Binary),
            0x8 => Ok(Self::Close),
            0x9 => Ok(Self::Ping),
            0xA => Ok(Self::Pong),
            _ => Err(WebSocketError::InvalidOpCode(value)),
        }
    }
}

impl From<OpCode> for u8 {
    fn from(val: OpCode) -> Self {
        match val {
            OpCode::Continuation => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
        }
    }
}

/// Largest possible frame header: 2 fixed bytes, 8 extended-length bytes and a
/// 4-byte mask key.
pub(crate) const MAX_HEAD_SIZE: usize = 16;

/// Maximum payload of a control frame per RFC 6455 Section 5.5.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// One WebSocket frame: header metadata plus an immutable payload.
///
/// # Fields
/// - `fin`: final-fragment flag. When `true` this frame completes a message.
/// - `rsv1`..`rsv3`: extension-reserved bits. `rsv1` is claimed by
///   permessage-deflate to mark a compressed message; `rsv2`/`rsv3` must be
///   zero on the wire unless an extension negotiates them.
/// - `opcode`: frame type.
/// - `payload`: frame data as immutable [`Bytes`], always unmasked in memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Indicates if this is the final frame in a message.
    pub fin: bool,
    /// Extension-reserved bit 1 (compression flag under permessage-deflate).
    pub rsv1: bool,
    /// Extension-reserved bit 2.
    pub rsv2: bool,
    /// Extension-reserved bit 3.
    pub rsv3: bool,
    /// The opcode of the frame, defining its type.
    pub opcode: OpCode,
    /// The payload of the frame, containing the actual data.
    pub payload: Bytes,
}

impl Frame {
    /// Creates a new final frame with the given opcode and payload, all
    /// reserved bits clear.
    pub fn new(opcode: OpCode, payload: impl Into<Bytes>) -> Self {
        Self {
            fin: true,
            rsv1: false,
            rsv2: false,
            rsv3: false,
            opcode,
            payload: payload.into(),
        }
    }

    /// Creates a new text frame with the given payload.
    pub fn text(payload: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Text, payload)
    }

    /// Creates a new binary frame with the given payload.
    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Binary, payload)
    }

    /// Creates a continuation frame carrying the next fragment of a message.
    pub fn continuation(payload: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Continuation, payload)
    }

    /// Creates a ping frame. Used to check connection liveness; the peer must
    /// answer with a pong carrying the same payload.
    pub fn ping(payload: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Ping, payload)
    }

    /// Creates a pong frame, answering a ping.
    pub fn pong(payload: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Pong, payload)
    }

    /// Creates a close frame from a status code and reason.
    ///
    /// The payload is the 2-byte big-endian code followed by the reason bytes.
    pub fn close(code: CloseCode, reason: impl AsRef<[u8]>) -> Self {
        let reason = reason.as_ref();
        let mut payload = BytesMut::with_capacity(2 + reason.len());
        payload.extend_from_slice(&u16::from(code).to_be_bytes());
        payload.extend_from_slice(reason);
        Self::new(OpCode::Close, payload.freeze())
    }

    /// Creates a close frame with a raw payload, without enforcing the
    /// code/reason structure. Used to echo a peer's close payload verbatim.
    pub fn close_raw(payload: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Close, payload)
    }

    /// Returns this frame with the FIN bit set as given.
    pub fn with_fin(mut self, fin: bool) -> Self {
        self.fin = fin;
        self
    }

    /// Returns this frame with the RSV1 bit set as given.
    pub fn with_rsv1(mut self, rsv1: bool) -> Self {
        self.rsv1 = rsv1;
        self
    }

    /// Extracts the close code from a close frame's payload.
    ///
    /// # Returns
    /// - `Some(CloseCode)` if the payload carries at least the 2-byte code
    /// - `None` if the payload is empty or too short
    pub fn close_code(&self) -> Option<CloseCode> {
        let raw = self.payload.get(0..2)?;
        let code = u16::from_be_bytes([raw[0], raw[1]]);
        Some(CloseCode::from(code))
    }

    /// Extracts the UTF-8 close reason from a close frame's payload, if any.
    pub fn close_reason(&self) -> Option<&str> {
        std::str::from_utf8(self.payload.get(2..)?).ok()
    }

    /// Checks if the frame payload is valid UTF-8.
    #[cfg(feature = "simd")]
    #[inline(always)]
    pub fn is_utf8(&self) -> bool {
        simdutf8::basic::from_utf8(&self.payload).is_ok()
    }

    /// Checks if the frame payload is valid UTF-8.
    #[cfg(not(feature = "simd"))]
    #[inline(always)]
    pub fn is_utf8(&self) -> bool {
        std::str::from_utf8(&self.payload).is_ok()
    }

    /// Formats the frame header into `head` and returns the number of bytes
    /// written.
    ///
    /// The mask key, when present, is appended after the length field and the
    /// MASK bit is set; applying the key to the payload is the generator's
    /// job. The minimal length encoding is always chosen.
    pub(crate) fn fmt_head(&self, head: &mut [u8; MAX_HEAD_SIZE], mask: Option<[u8; 4]>) -> usize {
        head[0] = (self.fin as u8) << 7
            | (self.rsv1 as u8) << 6
            | (self.rsv2 as u8) << 5
            | (self.rsv3 as u8) << 4
            | u8::from(self.opcode);

        let len = self.payload.len();
        let size = if len < 126 {
            head[1] = len as u8;
            2
        } else if len < 65536 {
            head[1] = 126;
            head[2..4].copy_from_slice(&(len as u16).to_be_bytes());
            4
        } else {
            head[1] = 127;
            head[2..10].copy_from_slice(&(len as u64).to_be_bytes());
            10
        };

        if let Some(mask) = mask {
            head[1] |= 0x80;
            head[size..size + 4].copy_from_slice(&mask);
            size + 4
        } else {
            size
        }
    }
}

impl From<(OpCode, Bytes)> for Frame {
    fn from((opcode, payload): (OpCode, Bytes)) -> Self {
        Self::new(opcode, payload)
    }
}

impl From<Frame> for (OpCode, Bytes) {
    fn from(val: Frame) -> Self {
        (val.opcode, val.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::close::CloseCode;

    mod opcode_tests {
        use super::*;

        #[test]
        fn test_is_control() {
            assert!(OpCode::Close.is_control());
            assert!(OpCode::Ping.is_control());
            assert!(OpCode::Pong.is_control());

            assert!(!OpCode::Continuation.is_control());
            assert!(!OpCode::Text.is_control());
            assert!(!OpCode::Binary.is_control());
        }

        #[test]
        fn test_try_from_u8_valid() {
            assert_eq!(OpCode::try_from(0x0).unwrap(), OpCode::Continuation);
            assert_eq!(OpCode::try_from(0x1).unwrap(), OpCode::Text);
            assert_eq!(OpCode::try_from(0x2).unwrap(), OpCode::Binary);
            assert_eq!(OpCode::try_from(0x8).unwrap(), OpCode::Close);
            assert_eq!(OpCode::try_from(0x9).unwrap(), OpCode::Ping);
            assert_eq!(OpCode::try_from(0xA).unwrap(), OpCode::Pong);
        }

        #[test]
        fn test_try_from_u8_reserved() {
            for &code in &[0x3, 0x4, 0x5, 0x6, 0x7, 0xB, 0xC, 0xD, 0xE, 0xF] {
                assert!(OpCode::try_from(code).is_err());
            }
        }

        #[test]
        fn test_roundtrip_u8() {
            for opcode in [
                OpCode::Continuation,
                OpCode::Text,
                OpCode::Binary,
                OpCode::Close,
                OpCode::Ping,
                OpCode::Pong,
            ] {
                assert_eq!(OpCode::try_from(u8::from(opcode)).unwrap(), opcode);
            }
        }
    }

    mod frame_tests {
        use super::*;
        use bytes::Bytes;

        #[test]
        fn test_text_frame() {
            let frame = Frame::text("Hello, WebSocket!");
            assert!(frame.fin);
            assert!(!frame.rsv1);
            assert_eq!(frame.opcode, OpCode::Text);
            assert_eq!(frame.payload, Bytes::from("Hello, WebSocket!"));
        }

        #[test]
        fn test_close_frame_payload_layout() {
            let frame = Frame::close(CloseCode::Normal, "done");
            assert_eq!(frame.opcode, OpCode::Close);
            assert_eq!(&frame.payload[..2], &1000u16.to_be_bytes());
            assert_eq!(&frame.payload[2..], b"done");
            assert_eq!(frame.close_code(), Some(CloseCode::Normal));
            assert_eq!(frame.close_reason(), Some("done"));
        }

        #[test]
        fn test_close_code_on_short_payload() {
            let frame = Frame::close_raw(Bytes::new());
            assert_eq!(frame.close_code(), None);
            let frame = Frame::close_raw(Bytes::from_static(&[0x03]));
            assert_eq!(frame.close_code(), None);
        }

        #[test]
        fn test_clone_shares_payload_immutably() {
            let frame = Frame::binary(vec![1u8, 2, 3]);
            let copy = frame.clone();
            assert_eq!(copy, frame);
            // Both views see the same bytes; neither can mutate them.
            assert_eq!(copy.payload.as_ptr(), frame.payload.as_ptr());
        }

        #[test]
        fn test_is_utf8() {
            assert!(Frame::text("Hello, 世界").is_utf8());
            assert!(!Frame::text(Bytes::from_static(&[0xFF, 0xFE, 0xFD])).is_utf8());
        }

        #[test]
        fn test_fmt_head_short_unmasked() {
            let frame = Frame::text("Header test");
            let mut head = [0u8; MAX_HEAD_SIZE];
            let size = frame.fmt_head(&mut head, None);

            assert_eq!(size, 2);
            assert_eq!(head[0], 0x81); // FIN=1, RSV=0, opcode=Text
            assert_eq!(head[1], 11); // MASK=0, length 11
        }

        #[test]
        fn test_fmt_head_masked() {
            let key = [0xAA, 0xBB, 0xCC, 0xDD];
            let frame = Frame::text("Header test");
            let mut head = [0u8; MAX_HEAD_SIZE];
            let size = frame.fmt_head(&mut head, Some(key));

            assert_eq!(size, 6);
            assert_eq!(head[1], 0x80 | 11);
            assert_eq!(&head[2..6], &key);
        }

        #[test]
        fn test_fmt_head_extended_lengths() {
            let frame = Frame::binary(vec![0u8; 126]);
            let mut head = [0u8; MAX_HEAD_SIZE];
            let size = frame.fmt_head(&mut head, None);
            assert_eq!(size, 4);
            assert_eq!(head[1], 126);
            assert_eq!(&head[2..4], &126u16.to_be_bytes());

            let frame = Frame::binary(vec![0u8; 65536]);
            let size = frame.fmt_head(&mut head, None);
            assert_eq!(size, 10);
            assert_eq!(head[1], 127);
            assert_eq!(&head[2..10], &65536u64.to_be_bytes());
        }

        #[test]
        fn test_fmt_head_rsv_bits() {
            let frame = Frame::binary("x").with_rsv1(true).with_fin(false);
            let mut head = [0u8; MAX_HEAD_SIZE];
            frame.fmt_head(&mut head, None);
            assert_eq!(head[0], 0b0100_0010); // FIN=0, RSV1=1, opcode=Binary
        }
    }
}
