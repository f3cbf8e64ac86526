//! Reassembly of fragmented messages.
//!
//! RFC 6455 Section 5.4: a message is one non-continuation data frame with
//! fin unset, any number of continuations, and a final continuation with fin
//! set — or a single fin frame. Control frames are interleaved by the session
//! and never reach this module.

use bytes::{Bytes, BytesMut};

use crate::{Frame, OpCode, Result, WebSocketError};

/// Accumulates data-frame fragments into complete messages.
///
/// Feed every inbound data frame through [`accept`](Self::accept); complete
/// messages come back as a single fin frame carrying the first fragment's
/// opcode and the concatenated payload. Fragmentation violations and
/// oversized messages are fatal errors; after an error the partial state is
/// abandoned.
pub struct MessageAssembler {
    /// Opcode of the message in progress; `None` between messages.
    opcode: Option<OpCode>,
    buffer: BytesMut,
    max_message_size: usize,
    /// Validate completed TEXT messages as UTF-8.
    check_utf8: bool,
}

impl MessageAssembler {
    pub fn new(max_message_size: usize, check_utf8: bool) -> Self {
        Self {
            opcode: None,
            buffer: BytesMut::new(),
            max_message_size,
            check_utf8,
        }
    }

    /// Whether a fragmented message is currently in progress.
    pub fn in_message(&self) -> bool {
        self.opcode.is_some()
    }

    /// Consumes one data frame.
    ///
    /// # Returns
    /// - `Ok(Some(Frame))`: a complete message (possibly the input itself)
    /// - `Ok(None)`: fragment absorbed, message still in progress
    ///
    /// # Errors
    /// - [`WebSocketError::InvalidContinuationFrame`]: continuation with no
    ///   message in progress
    /// - [`WebSocketError::InvalidFragment`]: TEXT/BINARY while a message is
    ///   in progress
    /// - [`WebSocketError::MessageTooLarge`]: accumulated size exceeds the cap
    /// - [`WebSocketError::InvalidUTF8`]: completed TEXT message fails
    ///   validation (when enabled)
    pub fn accept(&mut self, frame: Frame) -> Result<Option<Frame>> {
        debug_assert!(frame.opcode.is_data());

        match (self.opcode, frame.opcode) {
            (None, OpCode::Continuation) => {
                return Err(WebSocketError::InvalidContinuationFrame);
            }
            (None, opcode) => {
                if frame.fin {
                    // Unfragmented fast path: no buffering.
                    return self.complete(opcode, frame.payload);
                }
                self.opcode = Some(opcode);
            }
            (Some(_), OpCode::Continuation) => {}
            (Some(_), _) => {
                self.abandon();
                return Err(WebSocketError::InvalidFragment);
            }
        }

        if self.buffer.len() + frame.payload.len() > self.max_message_size {
            self.abandon();
            return Err(WebSocketError::MessageTooLarge);
        }
        self.buffer.extend_from_slice(&frame.payload);

        if !frame.fin {
            return Ok(None);
        }

        let opcode = self.opcode.take().unwrap_or(OpCode::Binary);
        let payload = self.buffer.split().freeze();
        self.complete(opcode, payload)
    }

    fn complete(&mut self, opcode: OpCode, payload: Bytes) -> Result<Option<Frame>> {
        if payload.len() > self.max_message_size {
            return Err(WebSocketError::MessageTooLarge);
        }
        let message = Frame::new(opcode, payload);
        if self.check_utf8 && opcode == OpCode::Text && !message.is_utf8() {
            return Err(WebSocketError::InvalidUTF8);
        }
        Ok(Some(message))
    }

    fn abandon(&mut self) {
        self.opcode = None;
        self.buffer.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn assembler() -> MessageAssembler {
        MessageAssembler::new(1024, false)
    }

    #[test]
    fn test_unfragmented_message_passes_through() {
        let mut assembler = assembler();
        let message = assembler.accept(Frame::text("whole")).unwrap().unwrap();
        assert_eq!(message, Frame::text("whole"));
        assert!(!assembler.in_message());
    }

    #[test]
    fn test_fragments_joined_under_first_opcode() {
        let mut assembler = assembler();

        assert!(assembler
            .accept(Frame::text("one ").with_fin(false))
            .unwrap()
            .is_none());
        assert!(assembler.in_message());
        assert!(assembler
            .accept(Frame::continuation("two ").with_fin(false))
            .unwrap()
            .is_none());
        let message = assembler
            .accept(Frame::continuation("three"))
            .unwrap()
            .unwrap();

        assert_eq!(message.opcode, OpCode::Text);
        assert!(message.fin);
        assert_eq!(message.payload, Bytes::from("one two three"));
        assert!(!assembler.in_message());
    }

    #[test]
    fn test_orphan_continuation_rejected() {
        let mut assembler = assembler();
        assert!(matches!(
            assembler.accept(Frame::continuation("stray")),
            Err(WebSocketError::InvalidContinuationFrame)
        ));
    }

    #[test]
    fn test_data_frame_mid_message_rejected() {
        let mut assembler = assembler();
        assembler
            .accept(Frame::text("start").with_fin(false))
            .unwrap();
        assert!(matches!(
            assembler.accept(Frame::binary("interloper")),
            Err(WebSocketError::InvalidFragment)
        ));
        // The partial message was abandoned; a new one may start.
        assert!(!assembler.in_message());
        assert!(assembler.accept(Frame::text("fresh")).unwrap().is_some());
    }

    #[test]
    fn test_message_size_cap() {
        let mut assembler = MessageAssembler::new(10, false);

        assembler
            .accept(Frame::binary(vec![0u8; 6]).with_fin(false))
            .unwrap();
        assert!(matches!(
            assembler.accept(Frame::continuation(vec![0u8; 5])),
            Err(WebSocketError::MessageTooLarge)
        ));

        // Single oversized frame too.
        assert!(matches!(
            assembler.accept(Frame::binary(vec![0u8; 11])),
            Err(WebSocketError::MessageTooLarge)
        ));
    }

    #[test]
    fn test_utf8_validation_of_text_messages() {
        let mut assembler = MessageAssembler::new(1024, true);

        // Multi-byte scalar split across fragments is fine once joined.
        let encoded = "héllo".as_bytes();
        assembler
            .accept(Frame::text(Bytes::copy_from_slice(&encoded[..2])).with_fin(false))
            .unwrap();
        let message = assembler
            .accept(Frame::continuation(Bytes::copy_from_slice(&encoded[2..])))
            .unwrap()
            .unwrap();
        assert_eq!(message.payload, Bytes::copy_from_slice(encoded));

        assert!(matches!(
            assembler.accept(Frame::text(Bytes::from_static(&[0xFF, 0xFE]))),
            Err(WebSocketError::InvalidUTF8)
        ));

        // Binary messages are never validated.
        assert!(assembler
            .accept(Frame::binary(Bytes::from_static(&[0xFF, 0xFE])))
            .unwrap()
            .is_some());
    }
}
