//! # wscore
//! Sans-io engine for the WebSocket protocol (RFC 6455) with permessage-deflate
//! compression (RFC 7692): incremental frame parsing and generation, the
//! extension stack, message reassembly and the close-handshake state machine,
//! driven entirely through callbacks.
//!
//! The crate owns no sockets, spawns no tasks and keeps no clocks. The
//! embedder feeds raw inbound bytes into a [`CoreSession`], receives outbound
//! bytes through a [`Transport`], and implements a [`FrameHandler`] that is
//! told about every delivered frame. Timeouts are reported *to* the session
//! (`on_idle_timeout`, `on_close_timeout`) by whoever owns the timers.
//!
//! ```no_run
//! use std::sync::Arc;
//! use wscore::{
//!     Callback, CoreSession, Frame, FrameHandler, InlineExecutor, Role,
//!     SendCallback, SessionConfig,
//! };
//!
//! struct Echo;
//!
//! impl FrameHandler for Echo {
//!     fn on_open(&mut self, session: &CoreSession, callback: Callback) {
//!         let _ = session;
//!         callback.succeed();
//!     }
//!
//!     fn on_frame(&mut self, session: &CoreSession, frame: Frame, callback: Callback) {
//!         session.send_frame(frame, SendCallback::ignore(), false);
//!         callback.succeed();
//!         session.demand(1);
//!     }
//! }
//!
//! # fn transport() -> Arc<dyn wscore::Transport> { unimplemented!() }
//! let session = CoreSession::open(
//!     Role::Server,
//!     SessionConfig::default(),
//!     Box::new(Echo),
//!     transport(),
//!     Arc::new(InlineExecutor),
//! );
//! session.demand(1);
//! // session.feed(&bytes_from_the_socket)?;
//! ```
//!
//! ## Flow control
//!
//! Frames are only delivered while the handler has outstanding demand:
//! [`CoreSession::demand`] adds to a counter, each `on_frame` consumes one
//! unit, and at zero the parser stops consuming buffered bytes. A transport
//! pump should check [`CoreSession::is_paused`] before reading more from the
//! socket.
//!
//! ## Close handshake
//!
//! Either side sends a CLOSE frame; the peer echoes one back; the connection
//! then terminates. The session tracks this as
//! `OPEN -> LOCAL_CLOSING | REMOTE_CLOSING -> CLOSED` and reports the
//! resolved [`CloseStatus`] through [`FrameHandler::on_closed`], exactly once,
//! in every termination scenario including transport failure (synthetic 1006).

pub mod close;
pub mod codec;
pub mod config;
pub mod deflate;
pub mod extension;
pub mod frame;
pub mod mask;
pub mod message;
pub mod session;
pub mod sink;

use thiserror::Error;

pub use close::{CloseCode, CloseStatus};
pub use config::{DeflateConfig, SessionConfig};
pub use extension::{Extension, ExtensionConfig, ExtensionRegistry, ExtensionStack};
pub use frame::{Frame, OpCode};
pub use session::{
    Callback, CoreSession, Executor, FrameHandler, InlineExecutor, SendCallback, SessionState,
    Transport, WriteCallback,
};
pub use sink::{EventSink, LogSink, NullSink, SessionEvent};

/// Compression level for permessage-deflate, re-exported from `flate2`.
pub type CompressionLevel = flate2::Compression;

/// A specialized `Result` type for WebSocket operations.
pub type Result<T> = std::result::Result<T, WebSocketError>;

/// Which side of the connection this endpoint is.
///
/// The role decides masking (clients mask outbound frames, servers never do)
/// and which negotiated deflate parameter applies to which direction.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Server => write!(f, "server"),
            Role::Client => write!(f, "client"),
        }
    }
}

/// Errors raised by the protocol engine.
///
/// Protocol variants are fatal: the session answers them with an
/// engine-initiated CLOSE carrying [`close_code`](Self::close_code) and then
/// terminates. [`IllegalState`](Self::IllegalState) is an API-misuse error
/// reported to the caller without affecting the connection.
#[derive(Error, Debug)]
pub enum WebSocketError {
    /// A new data frame arrived while a fragmented message was in progress.
    #[error("Invalid fragment")]
    InvalidFragment,

    /// A continuation frame arrived with no message in progress.
    #[error("Invalid continuation frame")]
    InvalidContinuationFrame,

    /// A text payload or close reason is not valid UTF-8.
    #[error("Invalid UTF-8")]
    InvalidUTF8,

    /// A frame used one of the reserved opcodes (0x3-0x7, 0xB-0xF).
    #[error("Invalid opcode (byte={0})")]
    InvalidOpCode(u8),

    /// Reserved header bits were set without an extension negotiating them.
    #[error("Reserved bits are not zero")]
    ReservedBitsNotZero,

    /// A control frame arrived with the FIN bit clear.
    #[error("Control frame must not be fragmented")]
    ControlFrameFragmented,

    /// A control frame payload exceeded 125 bytes.
    #[error("Control frame too large")]
    ControlFrameTooLarge,

    /// A close frame payload was exactly one byte.
    #[error("Invalid close frame")]
    InvalidCloseFrame,

    /// A close frame carried a code that is not legal on the wire.
    #[error("Invalid close code (code={0})")]
    InvalidCloseCode(u16),

    /// A frame payload exceeded the configured per-frame limit.
    #[error("Frame too large")]
    FrameTooLarge,

    /// A reassembled message exceeded the configured message limit.
    #[error("Message too large")]
    MessageTooLarge,

    /// Unparsed inbound bytes exceeded the receive-buffer cap while delivery
    /// was paused.
    #[error("Read buffer full")]
    ReadBufferFull,

    /// The operation requires a connection that is no longer there.
    #[error("Connection is closed")]
    ConnectionClosed,

    /// The operation is not valid in the session's current state.
    #[error("Illegal state: {0}")]
    IllegalState(&'static str),

    /// An extension transform failed; the session cannot continue.
    #[error("Extension failure: {0}")]
    Extension(String),

    /// The transport reported an I/O failure.
    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

impl WebSocketError {
    /// The status code the engine sends in its error-initiated CLOSE frame.
    ///
    /// Size violations map to [`CloseCode::Size`], unsupported opcodes to
    /// [`CloseCode::Unsupported`], bad text to [`CloseCode::Invalid`],
    /// framing violations to [`CloseCode::Protocol`] and everything else to
    /// [`CloseCode::Error`].
    pub fn close_code(&self) -> CloseCode {
        match self {
            WebSocketError::FrameTooLarge
            | WebSocketError::MessageTooLarge
            | WebSocketError::ReadBufferFull => CloseCode::Size,
            WebSocketError::InvalidOpCode(_) => CloseCode::Unsupported,
            WebSocketError::InvalidUTF8 => CloseCode::Invalid,
            WebSocketError::ReservedBitsNotZero
            | WebSocketError::ControlFrameFragmented
            | WebSocketError::ControlFrameTooLarge
            | WebSocketError::InvalidFragment
            | WebSocketError::InvalidContinuationFrame
            | WebSocketError::InvalidCloseFrame
            | WebSocketError::InvalidCloseCode(_) => CloseCode::Protocol,
            _ => CloseCode::Error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_close_codes() {
        assert_eq!(WebSocketError::FrameTooLarge.close_code(), CloseCode::Size);
        assert_eq!(
            WebSocketError::MessageTooLarge.close_code(),
            CloseCode::Size
        );
        assert_eq!(
            WebSocketError::InvalidOpCode(0x5).close_code(),
            CloseCode::Unsupported
        );
        assert_eq!(
            WebSocketError::InvalidUTF8.close_code(),
            CloseCode::Invalid
        );
        assert_eq!(
            WebSocketError::ReservedBitsNotZero.close_code(),
            CloseCode::Protocol
        );
        assert_eq!(
            WebSocketError::InvalidCloseCode(1006).close_code(),
            CloseCode::Protocol
        );
        assert_eq!(
            WebSocketError::Extension("boom".into()).close_code(),
            CloseCode::Error
        );
        assert_eq!(
            WebSocketError::IoError(std::io::Error::other("reset")).close_code(),
            CloseCode::Error
        );
    }
}
