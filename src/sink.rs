//! Session observability.
//!
//! The engine never logs on its own; it reports what happens to an injected
//! [`EventSink`]. [`LogSink`] forwards to the `log` facade for embedders that
//! just want log lines, [`NullSink`] drops everything.

use std::io;

use crate::{session::SessionState, Frame, WebSocketError};

/// Something observable that happened inside a session.
#[derive(Debug)]
pub enum SessionEvent<'a> {
    /// The session state machine moved.
    StateChanged {
        from: SessionState,
        to: SessionState,
    },
    /// A frame was parsed off the wire (before extension decode).
    FrameIn(&'a Frame),
    /// A frame was serialized to the wire (after extension encode).
    FrameOut(&'a Frame),
    /// A fatal protocol or extension error was detected.
    ProtocolViolation(&'a WebSocketError),
    /// The frame handler reported a callback failure.
    HandlerFailure(&'a io::Error),
    /// The embedder reported that the close handshake timed out.
    CloseTimeout,
    /// The embedder reported the idle timeout; an automatic PING follows.
    IdleTimeout,
}

/// Receiver for [`SessionEvent`]s. Implementations must be cheap: events are
/// emitted from inside the session hot path.
pub trait EventSink: Send + Sync {
    fn event(&self, event: SessionEvent<'_>);
}

/// Forwards events to the `log` crate: debug for traffic and state, warn for
/// violations and failures.
#[derive(Default)]
pub struct LogSink;

impl EventSink for LogSink {
    fn event(&self, event: SessionEvent<'_>) {
        match event {
            SessionEvent::StateChanged { from, to } => {
                log::debug!("session state {from:?} -> {to:?}");
            }
            SessionEvent::FrameIn(frame) => {
                log::debug!(
                    "recv frame {:?} fin={} len={}",
                    frame.opcode,
                    frame.fin,
                    frame.payload.len()
                );
            }
            SessionEvent::FrameOut(frame) => {
                log::debug!(
                    "send frame {:?} fin={} len={}",
                    frame.opcode,
                    frame.fin,
                    frame.payload.len()
                );
            }
            SessionEvent::ProtocolViolation(err) => {
                log::warn!("protocol violation: {err}");
            }
            SessionEvent::HandlerFailure(err) => {
                log::warn!("handler failure: {err}");
            }
            SessionEvent::CloseTimeout => {
                log::warn!("close handshake timed out");
            }
            SessionEvent::IdleTimeout => {
                log::debug!("idle timeout, sending ping");
            }
        }
    }
}

/// Discards every event.
#[derive(Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn event(&self, _event: SessionEvent<'_>) {}
}
