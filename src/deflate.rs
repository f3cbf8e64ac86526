//! permessage-deflate ([RFC 7692](https://datatracker.ietf.org/doc/html/rfc7692)).
//!
//! Messages are compressed as a raw deflate stream. The first frame of a
//! compressed message carries RSV1; every frame is terminated with a sync
//! flush and the final frame drops the trailing `00 00 FF FF` the flush
//! produces, which the receiver re-appends before inflating. With context
//! takeover (the default) the LZ77 window survives across messages in each
//! direction; the negotiated `no_context_takeover` flags reset it at message
//! boundaries instead.
//!
//! Inbound fragments are fed into the shared inflate context as they arrive;
//! intermediate fragments come out with drained payloads and the final frame
//! carries the whole inflated message, so reassembly downstream stays a plain
//! concatenation.

use std::io;

use bytes::{BufMut, BytesMut};
use flate2::{CompressError, DecompressError, Status};

use crate::{
    config::DeflateConfig,
    extension::{Extension, ExtensionConfig},
    CompressionLevel, Frame, Result, Role, WebSocketError,
};

/// The extension token as it appears in `Sec-WebSocket-Extensions`.
pub static PERMESSAGE_DEFLATE: &str = "permessage-deflate";

/// The permessage-deflate transform, one instance per session.
///
/// Holds the compressor for the local outbound direction and the
/// decompressor for the inbound one, plus the fragmentation state needed to
/// put RSV1 only on first frames and to flush the inflater only on final
/// ones.
pub struct PerMessageDeflate {
    deflater: Deflater,
    inflater: Inflater,
    /// Reset the compressor at outbound message boundaries.
    reset_tx: bool,
    /// Reset the decompressor at inbound message boundaries.
    reset_rx: bool,
    /// An outbound message is mid-flight (last encoded frame had fin unset).
    tx_in_message: bool,
    /// Whether the inbound message in progress is compressed; `None` between
    /// messages.
    rx_compressed: Option<bool>,
}

impl PerMessageDeflate {
    /// Creates the transform for the given role and merged configuration.
    ///
    /// The role decides which negotiated `no_context_takeover` flag applies
    /// to which direction: `server_no_context_takeover` governs the bytes the
    /// server sends, so for [`Role::Server`] it controls the compressor and
    /// for [`Role::Client`] the decompressor.
    ///
    /// `max_message_size` caps the inflated size of one inbound message. The
    /// cap is enforced while bytes come out of the decompressor, so a small
    /// compressed frame cannot balloon past it in memory before failing.
    pub fn new(role: Role, config: &DeflateConfig, max_message_size: usize) -> Self {
        let (reset_tx, reset_rx) = match role {
            Role::Server => (
                config.server_no_context_takeover,
                config.client_no_context_takeover,
            ),
            Role::Client => (
                config.client_no_context_takeover,
                config.server_no_context_takeover,
            ),
        };

        Self {
            deflater: Deflater::new(config.level),
            inflater: Inflater::new(max_message_size),
            reset_tx,
            reset_rx,
            tx_in_message: false,
            rx_compressed: None,
        }
    }

    /// Returns a factory for [`ExtensionRegistry::register`] that merges the
    /// negotiated parameters into `config` before construction.
    ///
    /// [`ExtensionRegistry::register`]: crate::extension::ExtensionRegistry::register
    pub fn factory(
        role: Role,
        config: DeflateConfig,
        max_message_size: usize,
    ) -> impl Fn(&ExtensionConfig) -> Result<Box<dyn Extension>> + Send + Sync {
        move |negotiated| {
            let merged = config.merge(negotiated);
            Ok(Box::new(PerMessageDeflate::new(role, &merged, max_message_size)))
        }
    }
}

impl Extension for PerMessageDeflate {
    fn name(&self) -> &str {
        PERMESSAGE_DEFLATE
    }

    fn rsv1(&self) -> bool {
        true
    }

    fn encode(&mut self, frame: Frame) -> Result<Frame> {
        let first = !self.tx_in_message;
        let compressed = self
            .deflater
            .compress(&frame.payload, frame.fin)
            .map_err(extension_error)?;

        if frame.fin {
            self.tx_in_message = false;
            if self.reset_tx {
                self.deflater.reset();
            }
        } else {
            self.tx_in_message = true;
        }

        Ok(Frame::new(frame.opcode, compressed.freeze())
            .with_fin(frame.fin)
            .with_rsv1(first))
    }

    fn decode(&mut self, frame: Frame) -> Result<Frame> {
        let compressed = *self.rx_compressed.get_or_insert(frame.rsv1);
        if !compressed {
            if frame.fin {
                self.rx_compressed = None;
            }
            return Ok(frame);
        }

        let inflated = self.inflater.decompress(&frame.payload, frame.fin)?;

        if frame.fin {
            self.rx_compressed = None;
            if self.reset_rx {
                self.inflater.reset();
            }
        }

        let payload = inflated.map(BytesMut::freeze).unwrap_or_default();
        Ok(Frame::new(frame.opcode, payload).with_fin(frame.fin))
    }
}

fn extension_error(err: io::Error) -> WebSocketError {
    WebSocketError::Extension(format!("{PERMESSAGE_DEFLATE}: {err}"))
}

fn deflate_error(err: CompressError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, format!("compression error: {err}"))
}

fn inflate_error(err: DecompressError) -> WebSocketError {
    WebSocketError::Extension(format!("{PERMESSAGE_DEFLATE}: decompression error: {err}"))
}

fn corrupt_stream() -> WebSocketError {
    WebSocketError::Extension(format!("{PERMESSAGE_DEFLATE}: corrupt deflate stream"))
}

/// Returns the spare capacity of `output` as an initialized byte slice,
/// growing the buffer when it is full.
///
/// # Safety
/// Treating `MaybeUninit<u8>` as `u8` is sound here: the slice is only ever
/// written through, and `advance_mut` is called with exactly the number of
/// bytes the (de)compressor reported writing.
fn chunk(output: &mut BytesMut) -> &mut [u8] {
    if output.len() == output.capacity() {
        // chunk_mut would reserve only 64 bytes
        output.reserve(1024);
    }

    let uninit = output.spare_capacity_mut();
    unsafe { &mut *(uninit as *mut [std::mem::MaybeUninit<u8>] as *mut [u8]) }
}

/// Streaming compressor for the outbound direction.
struct Deflater {
    output: BytesMut,
    compress: flate2::Compress,
}

impl Deflater {
    fn new(level: CompressionLevel) -> Self {
        Self {
            output: BytesMut::with_capacity(1024),
            compress: flate2::Compress::new(level, false),
        }
    }

    /// Drops the compression context, as required between messages under
    /// no-context-takeover.
    fn reset(&mut self) {
        self.compress.reset();
    }

    /// Compresses one frame payload, sync-flushing so the fragment is
    /// decodable on its own. `final_frame` strips the `00 00 FF FF` flush
    /// tail per RFC 7692 Section 7.2.1.
    fn compress(&mut self, mut input: &[u8], final_frame: bool) -> io::Result<BytesMut> {
        while !input.is_empty() {
            let consumed = self.write(input)?;
            input = &input[consumed..];
        }
        self.flush(final_frame)
    }

    fn write(&mut self, input: &[u8]) -> io::Result<usize> {
        let output = &mut self.output;
        let compressor = &mut self.compress;

        let dst = chunk(output);

        let before_out = compressor.total_out();
        let before_in = compressor.total_in();

        let status = compressor.compress(input, dst, flate2::FlushCompress::None);

        let written = (compressor.total_out() - before_out) as usize;
        let consumed = (compressor.total_in() - before_in) as usize;

        unsafe { output.advance_mut(written) };

        match status {
            Ok(Status::Ok) => Ok(consumed),
            Ok(Status::StreamEnd | Status::BufError) | Err(..) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "corrupt deflate stream",
            )),
        }
    }

    fn flush(&mut self, strip_tail: bool) -> io::Result<BytesMut> {
        let output = &mut self.output;
        let compressor = &mut self.compress;

        let dst = chunk(output);
        let before_out = compressor.total_out();

        compressor
            .compress(&[], dst, flate2::FlushCompress::Sync)
            .map_err(deflate_error)?;

        let written = (compressor.total_out() - before_out) as usize;
        unsafe { output.advance_mut(written) };

        loop {
            let dst = chunk(output);

            let before_out = compressor.total_out();
            compressor
                .compress(&[], dst, flate2::FlushCompress::None)
                .map_err(deflate_error)?;

            if before_out == compressor.total_out() {
                if strip_tail && output.ends_with(&[0x0, 0x0, 0xff, 0xff]) {
                    output.truncate(output.len() - 4);
                }

                break Ok(output.split());
            }

            let written = (compressor.total_out() - before_out) as usize;
            unsafe { output.advance_mut(written) };
        }
    }
}

/// Streaming decompressor for the inbound direction.
struct Inflater {
    output: BytesMut,
    decompress: flate2::Decompress,
    /// Inflated-size cap for one message, checked as bytes come out so a
    /// compression bomb fails before the allocation, not after.
    max_size: usize,
}

impl Inflater {
    fn new(max_size: usize) -> Self {
        Self {
            output: BytesMut::with_capacity(1024),
            decompress: flate2::Decompress::new(false),
            max_size,
        }
    }

    fn reset(&mut self) {
        self.decompress.reset(false);
    }

    /// Feeds one fragment into the inflate context.
    ///
    /// # Returns
    /// - `Ok(Some(BytesMut))`: the whole inflated message, on the final frame
    /// - `Ok(None)`: fragment absorbed, message still in progress
    /// - [`WebSocketError::MessageTooLarge`]: inflated size exceeded the cap
    /// - [`WebSocketError::Extension`]: corrupt deflate data
    fn decompress(&mut self, input: &[u8], final_frame: bool) -> Result<Option<BytesMut>> {
        self.write(input)?;

        if final_frame {
            // Restore the flush tail the sender stripped (RFC 7692, 7.2.2)
            self.write(&[0x0, 0x0, 0xff, 0xff])?;
            self.flush().map(Some)
        } else {
            Ok(None)
        }
    }

    fn check_cap(&self) -> Result<()> {
        if self.output.len() > self.max_size {
            return Err(WebSocketError::MessageTooLarge);
        }
        Ok(())
    }

    fn write(&mut self, mut input: &[u8]) -> Result<()> {
        while !input.is_empty() {
            let output = &mut self.output;
            let decompressor = &mut self.decompress;
            let dst = chunk(output);

            let before_out = decompressor.total_out();
            let before_in = decompressor.total_in();

            let status = decompressor.decompress(input, dst, flate2::FlushDecompress::None);

            let read = (decompressor.total_out() - before_out) as usize;
            let consumed = (decompressor.total_in() - before_in) as usize;

            unsafe { output.advance_mut(read) };
            self.check_cap()?;

            input = &input[consumed..];

            match status {
                Ok(Status::Ok | Status::BufError | Status::StreamEnd) => {}
                Err(..) => return Err(corrupt_stream()),
            }
        }

        Ok(())
    }

    fn flush(&mut self) -> Result<BytesMut> {
        {
            let output = &mut self.output;
            let decompressor = &mut self.decompress;
            let dst = chunk(output);
            let before_out = decompressor.total_out();

            decompressor
                .decompress(&[], dst, flate2::FlushDecompress::Sync)
                .map_err(inflate_error)?;

            let written = (decompressor.total_out() - before_out) as usize;
            unsafe { output.advance_mut(written) };
        }
        self.check_cap()?;

        loop {
            let output = &mut self.output;
            let decompressor = &mut self.decompress;
            let dst = chunk(output);

            let before_out = decompressor.total_out();
            decompressor
                .decompress(&[], dst, flate2::FlushDecompress::None)
                .map_err(inflate_error)?;

            if before_out == decompressor.total_out() {
                break Ok(output.split());
            }

            let written = (decompressor.total_out() - before_out) as usize;
            unsafe { output.advance_mut(written) };
            self.check_cap()?;
        }
    }
}
