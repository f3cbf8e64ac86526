//! Incremental frame parsing and serialization.
//!
//! [`Parser`] and [`Generator`] implement [`tokio_util::codec::Decoder`] and
//! [`tokio_util::codec::Encoder`], so they compose with framed transports, but
//! neither owns any I/O: the session drives them directly on its own buffers.
//!
//! The parser consumes bytes in whatever chunks the transport produces,
//! persisting its position across calls, and yields complete unmasked frames.
//! The generator writes minimal headers and, in client role, masks the bytes
//! it writes with a fresh random key per frame without touching the input
//! frame.

use bytes::{Buf, BytesMut};
use tokio_util::codec;

use crate::{
    frame::{self, Frame, MAX_CONTROL_PAYLOAD, MAX_HEAD_SIZE},
    mask::apply_mask,
    OpCode, Role, WebSocketError,
};

/// Position of the parser inside the current frame.
enum ReadState {
    /// Reading the extended length and mask key that follow the fixed header.
    Header(Header),
    /// Reading the payload.
    Payload(HeaderAndMask),
}

/// Fields decoded from the two fixed header bytes.
struct Header {
    fin: bool,
    rsv1: bool,
    masked: bool,
    opcode: OpCode,
    /// Size of the extended length field (0, 2 or 8 bytes).
    extra: usize,
    /// The 7-bit length code.
    length_code: u8,
    /// Remaining header bytes after the fixed two: extended length plus mask.
    header_size: usize,
}

/// Header plus the mask key, retained while waiting for the payload.
struct HeaderAndMask {
    header: Header,
    mask: Option<[u8; 4]>,
    payload_len: usize,
}

/// Incremental WebSocket frame parser.
///
/// State persists across `decode` calls, so the input may arrive in arbitrary
/// chunks down to a single byte. Frames are validated against the protocol
/// rules as soon as the relevant bytes are available: reserved bits, opcode,
/// control-frame fin and size, and the configured payload cap.
///
/// After any protocol error the parser is poisoned: every later call returns
/// `Ok(None)` and the buffer is left untouched. The session reacts to the
/// first error by starting the close handshake, so nothing after the offending
/// bytes is meaningful.
pub struct Parser {
    state: Option<ReadState>,
    /// Maximum allowed size for a single frame payload.
    max_payload: usize,
    /// Whether a negotiated extension claimed the RSV1 bit.
    rsv1_allowed: bool,
    poisoned: bool,
}

impl Parser {
    /// Creates a parser enforcing `max_payload` per frame. `rsv1_allowed`
    /// reflects whether an extension (permessage-deflate) negotiated use of
    /// the RSV1 bit; RSV2 and RSV3 are always rejected.
    pub fn new(max_payload: usize, rsv1_allowed: bool) -> Self {
        Self {
            state: None,
            max_payload,
            rsv1_allowed,
            poisoned: false,
        }
    }

    fn fail(&mut self, err: WebSocketError) -> WebSocketError {
        self.poisoned = true;
        self.state = None;
        err
    }
}

impl codec::Decoder for Parser {
    type Item = Frame;
    type Error = WebSocketError;

    /// Parses the next frame out of `src`, advancing the buffer past the
    /// bytes consumed.
    ///
    /// # Returns
    /// - `Ok(Some(Frame))`: a complete frame, payload already unmasked
    /// - `Ok(None)`: more bytes needed (or the parser is poisoned)
    /// - `Err(WebSocketError)`: protocol violation; the parser is now poisoned
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if self.poisoned {
            return Ok(None);
        }

        loop {
            match self.state.take() {
                None => {
                    if src.remaining() < 2 {
                        return Ok(None);
                    }

                    let fin = src[0] & 0b10000000 != 0;
                    let rsv1 = src[0] & 0b01000000 != 0;

                    if src[0] & 0b00110000 != 0 {
                        return Err(self.fail(WebSocketError::ReservedBitsNotZero));
                    }

                    let opcode = frame::OpCode::try_from(src[0] & 0b00001111)
                        .map_err(|err| self.fail(err))?;

                    // RSV1 only marks compression, only on data frames, and
                    // only when an extension negotiated it.
                    if rsv1 && (!self.rsv1_allowed || opcode.is_control()) {
                        return Err(self.fail(WebSocketError::ReservedBitsNotZero));
                    }

                    let masked = src[1] & 0b10000000 != 0;
                    let length_code = src[1] & 0x7F;

                    let extra = match length_code {
                        126 => 2,
                        127 => 8,
                        _ => 0,
                    };
                    let header_size = extra + masked as usize * 4;
                    src.advance(2);

                    self.state = Some(ReadState::Header(Header {
                        fin,
                        rsv1,
                        masked,
                        opcode,
                        length_code,
                        extra,
                        header_size,
                    }));
                }
                Some(ReadState::Header(header)) => {
                    if src.remaining() < header.header_size {
                        self.state = Some(ReadState::Header(header));
                        return Ok(None);
                    }

                    let payload_len: usize = match header.extra {
                        0 => usize::from(header.length_code),
                        2 => src.get_u16() as usize,
                        #[cfg(target_pointer_width = "64")]
                        8 => src.get_u64() as usize,
                        #[cfg(any(target_pointer_width = "16", target_pointer_width = "32"))]
                        8 => match usize::try_from(src.get_u64()) {
                            Ok(length) => length,
                            Err(_) => return Err(self.fail(WebSocketError::FrameTooLarge)),
                        },
                        _ => unreachable!(),
                    };

                    let mask = if header.masked {
                        Some(src.get_u32().to_be_bytes())
                    } else {
                        None
                    };

                    if header.opcode.is_control() {
                        if !header.fin {
                            return Err(self.fail(WebSocketError::ControlFrameFragmented));
                        }
                        if payload_len > MAX_CONTROL_PAYLOAD {
                            return Err(self.fail(WebSocketError::ControlFrameTooLarge));
                        }
                    }
                    if payload_len > self.max_payload {
                        return Err(self.fail(WebSocketError::FrameTooLarge));
                    }

                    self.state = Some(ReadState::Payload(HeaderAndMask {
                        header,
                        mask,
                        payload_len,
                    }));
                }
                Some(ReadState::Payload(header_and_mask)) => {
                    if src.remaining() < header_and_mask.payload_len {
                        self.state = Some(ReadState::Payload(header_and_mask));
                        return Ok(None);
                    }

                    let header = header_and_mask.header;
                    let payload_len = header_and_mask.payload_len;

                    let mut payload = src.split_to(payload_len);
                    if let Some(mask) = header_and_mask.mask {
                        apply_mask(&mut payload, mask);
                    }

                    let frame = Frame::new(header.opcode, payload.freeze())
                        .with_fin(header.fin)
                        .with_rsv1(header.rsv1);

                    break Ok(Some(frame));
                }
            }
        }
    }
}

/// WebSocket frame serializer.
///
/// Validates the control-frame invariants before writing anything, so a
/// rejected frame leaves the output buffer unchanged. In [`Role::Client`] a
/// fresh random mask key is drawn per frame and applied to the payload bytes
/// written into the buffer; the input frame keeps its unmasked payload.
pub struct Generator {
    role: Role,
}

impl Generator {
    pub fn new(role: Role) -> Self {
        Self { role }
    }
}

impl codec::Encoder<&Frame> for Generator {
    type Error = WebSocketError;

    fn encode(&mut self, frame: &Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if frame.opcode.is_control() {
            if !frame.fin {
                return Err(WebSocketError::ControlFrameFragmented);
            }
            if frame.payload.len() > MAX_CONTROL_PAYLOAD {
                return Err(WebSocketError::ControlFrameTooLarge);
            }
        }

        let mask = match self.role {
            Role::Client => Some(rand::random::<[u8; 4]>()),
            Role::Server => None,
        };

        let mut header = [0; MAX_HEAD_SIZE];
        let size = frame.fmt_head(&mut header, mask);

        dst.reserve(size + frame.payload.len());
        dst.extend_from_slice(&header[..size]);

        let payload_start = dst.len();
        dst.extend_from_slice(&frame.payload);
        if let Some(mask) = mask {
            apply_mask(&mut dst[payload_start..], mask);
        }

        Ok(())
    }
}

impl codec::Encoder<Frame> for Generator {
    type Error = WebSocketError;

    #[inline]
    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        self.encode(&frame, dst)
    }
}
