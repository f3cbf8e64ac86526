//! The core session: state machine, flow control and frame delivery.
//!
//! A [`CoreSession`] sits between a byte transport and a [`FrameHandler`].
//! Inbound bytes go through [`feed`](CoreSession::feed): parse, extension
//! decode, control handling, reassembly, then handler delivery bounded by the
//! demand counter. Outbound frames go through
//! [`send_frame`](CoreSession::send_frame): extension encode, serialization,
//! optional batching, then a single transport write whose completion resolves
//! the send callbacks.
//!
//! The session owns no I/O and no clocks. The embedder implements
//! [`Transport`] and [`Executor`], pumps the socket, and reports timeouts via
//! [`on_idle_timeout`](CoreSession::on_idle_timeout) and
//! [`on_close_timeout`](CoreSession::on_close_timeout).
//!
//! # Locking
//!
//! All mutable state lives behind one mutex per session; two sessions never
//! contend. Handler callbacks are serialized through an internal event queue
//! and run via the executor with the state lock released, so a handler may
//! freely call back into the session (send, demand, close) from inside any
//! callback.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder as _, Encoder as _};

use crate::{
    close::{CloseCode, CloseStatus},
    codec::{Generator, Parser},
    config::SessionConfig,
    deflate::PerMessageDeflate,
    extension::ExtensionStack,
    frame::{Frame, OpCode},
    message::MessageAssembler,
    sink::{EventSink, LogSink, SessionEvent},
    Role, WebSocketError,
};

/// Where the session is in its lifecycle.
///
/// `Open` is the only state that accepts data frames in either direction.
/// The closing states track who sent the first CLOSE frame; both resolve to
/// `Closed`, which is terminal.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SessionState {
    Open,
    /// This endpoint sent CLOSE and awaits the peer's reply.
    LocalClosing,
    /// The peer sent CLOSE; the echo is being flushed.
    RemoteClosing,
    Closed,
}

/// Schedules deferred work. Handler callbacks and send completions run
/// through here, never inline from the calling stack of the operation that
/// produced them (unless the executor itself is inline).
pub trait Executor: Send + Sync {
    fn execute(&self, task: Box<dyn FnOnce() + Send>);
}

/// Runs every task immediately on the calling thread. Deterministic, which
/// makes it the executor of choice for tests and single-threaded embedders.
pub struct InlineExecutor;

impl Executor for InlineExecutor {
    fn execute(&self, task: Box<dyn FnOnce() + Send>) {
        task();
    }
}

/// The byte sink under the session.
///
/// `write` takes ownership of fully serialized wire bytes and must complete
/// the callback exactly once, after the bytes are handed to the OS (or once
/// the write fails). `shutdown` closes the underlying connection; the session
/// calls it when the session reaches `Closed`.
pub trait Transport: Send + Sync {
    fn write(&self, data: Bytes, callback: WriteCallback);
    fn shutdown(&self);
}

/// Completion handle for one [`Transport::write`].
pub struct WriteCallback {
    completion: Option<Box<dyn FnOnce(io::Result<()>) + Send>>,
}

impl WriteCallback {
    pub fn new(completion: impl FnOnce(io::Result<()>) + Send + 'static) -> Self {
        Self {
            completion: Some(Box::new(completion)),
        }
    }

    pub fn succeed(mut self) {
        if let Some(completion) = self.completion.take() {
            completion(Ok(()));
        }
    }

    pub fn fail(mut self, err: io::Error) {
        if let Some(completion) = self.completion.take() {
            completion(Err(err));
        }
    }
}

/// Completion handle passed to every [`FrameHandler`] callback.
///
/// Complete it with [`succeed`](Self::succeed) when the event has been
/// processed, or [`fail`](Self::fail) to report an application failure: the
/// session logs the failure and starts an application-initiated close with
/// status 1011. Dropping the callback counts as success.
pub struct Callback {
    completion: Option<Box<dyn FnOnce(io::Result<()>) + Send>>,
}

impl Callback {
    pub fn new(completion: impl FnOnce(io::Result<()>) + Send + 'static) -> Self {
        Self {
            completion: Some(Box::new(completion)),
        }
    }

    pub fn succeed(mut self) {
        if let Some(completion) = self.completion.take() {
            completion(Ok(()));
        }
    }

    pub fn fail(mut self, err: io::Error) {
        if let Some(completion) = self.completion.take() {
            completion(Err(err));
        }
    }
}

impl Drop for Callback {
    fn drop(&mut self) {
        if let Some(completion) = self.completion.take() {
            completion(Ok(()));
        }
    }
}

/// Completion handle for one [`CoreSession::send_frame`].
///
/// Resolves with `Ok(())` once the frame's bytes have been flushed to the
/// transport, or with an error if the frame was rejected, the write failed,
/// or the session terminated with the frame still pending. Completions run
/// on the executor, exactly once, in submission order.
pub struct SendCallback {
    completion: Option<Box<dyn FnOnce(crate::Result<()>) + Send>>,
}

impl SendCallback {
    pub fn new(completion: impl FnOnce(crate::Result<()>) + Send + 'static) -> Self {
        Self {
            completion: Some(Box::new(completion)),
        }
    }

    /// A callback that discards the outcome.
    pub fn ignore() -> Self {
        Self { completion: None }
    }

    fn complete(mut self, result: crate::Result<()>) {
        if let Some(completion) = self.completion.take() {
            completion(result);
        }
    }
}

/// The application side of a session.
///
/// Callbacks are serialized: the session never invokes two of them
/// concurrently, and `on_open` is always first. `on_error` (if any) precedes
/// `on_closed`, and `on_closed` is the last callback a handler ever receives.
/// Every callback may call back into the session.
pub trait FrameHandler: Send {
    /// The session is open. Request frames with [`CoreSession::demand`] when
    /// ready to receive.
    fn on_open(&mut self, session: &CoreSession, callback: Callback);

    /// One complete message or control frame, delivered against demand.
    fn on_frame(&mut self, session: &CoreSession, frame: Frame, callback: Callback);

    /// A fatal error occurred; `on_closed` follows.
    fn on_error(&mut self, session: &CoreSession, error: &WebSocketError, callback: Callback) {
        let _ = (session, error);
        callback.succeed();
    }

    /// The session reached its terminal state with the given resolution.
    fn on_closed(&mut self, session: &CoreSession, status: CloseStatus, callback: Callback) {
        let _ = (session, status);
        callback.succeed();
    }
}

/// What to do once a transport write has flushed.
enum FlushEffect {
    None,
    /// The write carried the echo of the peer's CLOSE; flushing it completes
    /// the handshake.
    CloseFlushed,
    Shutdown,
}

/// Side effect computed under the state lock, performed after it is released.
enum Action {
    Write {
        data: Bytes,
        completions: Vec<SendCallback>,
        on_flush: FlushEffect,
    },
    FailSend {
        completion: SendCallback,
        error: WebSocketError,
    },
    /// Fail every completion with `ConnectionClosed`.
    AbortSends(Vec<SendCallback>),
    Shutdown,
}

/// Queued handler invocation.
enum HandlerEvent {
    Open,
    Frame(Frame),
    Error(WebSocketError),
    Closed(CloseStatus),
}

struct Inner {
    core: Mutex<Core>,
    handler: Mutex<Box<dyn FrameHandler>>,
    transport: Arc<dyn Transport>,
    executor: Arc<dyn Executor>,
    sink: Arc<dyn EventSink>,
    /// Guards the event-dispatch loop so handler callbacks never nest.
    dispatching: AtomicBool,
}

struct Core {
    state: SessionState,
    role: Role,
    config: SessionConfig,
    parser: Parser,
    generator: Generator,
    extensions: ExtensionStack,
    assembler: MessageAssembler,
    /// Number of frames the handler is willing to receive.
    demand: u64,
    /// Unparsed inbound bytes.
    recv_buf: BytesMut,
    /// Parsed, post-extension frames awaiting demand.
    inbound: VecDeque<Frame>,
    /// Serialized outbound bytes not yet handed to the transport.
    batch: BytesMut,
    /// Send completions riding on the bytes in `batch`.
    pending_sends: Vec<SendCallback>,
    events: VecDeque<HandlerEvent>,
    /// Status this endpoint sent in its CLOSE frame, if any.
    sent_close: Option<CloseStatus>,
    /// Status the peer sent in its CLOSE frame, if any.
    recv_close: Option<CloseStatus>,
    error_delivered: bool,
    closed_delivered: bool,
}

/// Handle to one WebSocket session. Cloning is cheap and every clone refers
/// to the same session.
#[derive(Clone)]
pub struct CoreSession {
    inner: Arc<Inner>,
}

impl CoreSession {
    /// Opens a session in `Open` state and schedules
    /// [`FrameHandler::on_open`] through the executor.
    ///
    /// The extension stack is derived from `config`: permessage-deflate when
    /// `config.compression` is set, nothing otherwise. Events go to
    /// [`LogSink`]. Use [`open_with`](Self::open_with) to inject a custom
    /// stack (e.g. one built by an
    /// [`ExtensionRegistry`](crate::extension::ExtensionRegistry) from a
    /// negotiated header) or a custom sink.
    pub fn open(
        role: Role,
        config: SessionConfig,
        handler: Box<dyn FrameHandler>,
        transport: Arc<dyn Transport>,
        executor: Arc<dyn Executor>,
    ) -> CoreSession {
        let extensions = match &config.compression {
            Some(deflate) => ExtensionStack::new(vec![Box::new(PerMessageDeflate::new(
                role,
                deflate,
                config.max_message_size(),
            ))]),
            None => ExtensionStack::empty(),
        };
        Self::open_with(
            role,
            config,
            extensions,
            handler,
            transport,
            executor,
            Arc::new(LogSink),
        )
    }

    /// Opens a session with an explicit extension stack and event sink.
    #[allow(clippy::too_many_arguments)]
    pub fn open_with(
        role: Role,
        config: SessionConfig,
        extensions: ExtensionStack,
        handler: Box<dyn FrameHandler>,
        transport: Arc<dyn Transport>,
        executor: Arc<dyn Executor>,
        sink: Arc<dyn EventSink>,
    ) -> CoreSession {
        let core = Core {
            state: SessionState::Open,
            role,
            parser: Parser::new(config.max_frame_payload(), extensions.rsv1()),
            generator: Generator::new(role),
            assembler: MessageAssembler::new(config.max_message_size(), config.check_utf8),
            extensions,
            demand: 0,
            recv_buf: BytesMut::new(),
            inbound: VecDeque::new(),
            batch: BytesMut::new(),
            pending_sends: Vec::new(),
            events: VecDeque::from([HandlerEvent::Open]),
            sent_close: None,
            recv_close: None,
            error_delivered: false,
            closed_delivered: false,
            config,
        };

        let session = CoreSession {
            inner: Arc::new(Inner {
                core: Mutex::new(core),
                handler: Mutex::new(handler),
                transport,
                executor,
                sink,
                dispatching: AtomicBool::new(false),
            }),
        };
        session.dispatch();
        session
    }

    pub fn role(&self) -> Role {
        self.lock().role
    }

    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    pub fn is_open(&self) -> bool {
        self.state() == SessionState::Open
    }

    /// Whether inbound delivery is paused. A transport pump should stop
    /// reading from the socket while this returns `true`.
    pub fn is_paused(&self) -> bool {
        let core = self.lock();
        core.demand == 0 || core.state == SessionState::Closed
    }

    /// Allows `n` more frames to be delivered to the handler, resuming
    /// parsing of any buffered bytes.
    pub fn demand(&self, n: u64) {
        let actions = {
            let mut core = self.lock();
            core.demand = core.demand.saturating_add(n);
            core.pump(&*self.inner.sink)
        };
        self.perform(actions);
        self.dispatch();
    }

    /// Consumes inbound transport bytes.
    ///
    /// Frames are delivered only against outstanding demand; surplus bytes
    /// are buffered up to the configured receive-buffer cap, beyond which the
    /// session fails with `ReadBufferFull`. Bytes fed after the session is
    /// `Closed` are ignored.
    pub fn feed(&self, data: &[u8]) {
        let actions = {
            let mut core = self.lock();
            if core.state == SessionState::Closed {
                return;
            }
            core.recv_buf.extend_from_slice(data);
            if core.recv_buf.len() > core.config.max_recv_buffer() {
                core.fatal(WebSocketError::ReadBufferFull, &*self.inner.sink)
            } else {
                core.pump(&*self.inner.sink)
            }
        };
        self.perform(actions);
        self.dispatch();
    }

    /// Submits one frame for transmission.
    ///
    /// Output order is strict submission order. With `batch` set the
    /// serialized bytes are held back and coalesced with subsequent frames
    /// until a non-batched frame or [`flush`](Self::flush); the callback
    /// still resolves only when the bytes reach the transport.
    ///
    /// Data frames are rejected with `IllegalState` once closing has begun;
    /// PING/PONG remain sendable until `Closed`, after which every send is
    /// rejected the same way. Sending a CLOSE frame transitions
    /// `Open -> LocalClosing`.
    pub fn send_frame(&self, frame: Frame, callback: SendCallback, batch: bool) {
        let actions = {
            let mut core = self.lock();
            core.send(frame, callback, batch, &*self.inner.sink)
        };
        self.perform(actions);
        self.dispatch();
    }

    /// Splits a message into fragments of at most `fragment_size` payload
    /// bytes and submits them as one batched sequence. The callback resolves
    /// with the final fragment.
    pub fn send_fragmented(
        &self,
        opcode: OpCode,
        payload: Bytes,
        fragment_size: usize,
        callback: SendCallback,
    ) {
        if fragment_size == 0 || opcode.is_control() || opcode == OpCode::Continuation {
            self.schedule_completion(
                callback,
                Err(WebSocketError::IllegalState(
                    "send_fragmented requires a data opcode and a nonzero fragment size",
                )),
            );
            return;
        }

        if payload.len() <= fragment_size {
            return self.send_frame(Frame::new(opcode, payload), callback, false);
        }

        let mut callback = Some(callback);
        let mut offset = 0;
        let mut first = true;
        while offset < payload.len() {
            let end = (offset + fragment_size).min(payload.len());
            let chunk = payload.slice(offset..end);
            let fin = end == payload.len();

            let frame = if first {
                Frame::new(opcode, chunk).with_fin(fin)
            } else {
                Frame::continuation(chunk).with_fin(fin)
            };
            let completion = if fin {
                callback.take().unwrap_or_else(SendCallback::ignore)
            } else {
                SendCallback::ignore()
            };
            self.send_frame(frame, completion, !fin);

            first = false;
            offset = end;
        }
    }

    /// Writes out any batched frames.
    pub fn flush(&self) {
        let actions = {
            let mut core = self.lock();
            if core.batch.is_empty() {
                Vec::new()
            } else {
                vec![Action::Write {
                    data: core.batch.split().freeze(),
                    completions: std::mem::take(&mut core.pending_sends),
                    on_flush: FlushEffect::None,
                }]
            }
        };
        self.perform(actions);
    }

    /// Starts the close handshake with the given status.
    pub fn close(&self, code: CloseCode, reason: &str, callback: SendCallback) {
        let status = CloseStatus::truncated(code, reason);
        self.send_frame(Frame::close_raw(status.to_payload()), callback, false);
    }

    /// Tears the session down immediately: no CLOSE frame, every pending
    /// send fails, the transport is shut down and `on_closed` reports an
    /// abnormal (1006) status.
    pub fn abort(&self) {
        let actions = {
            let mut core = self.lock();
            if core.state == SessionState::Closed {
                return;
            }
            core.set_state(SessionState::Closed, &*self.inner.sink);
            core.batch.clear();
            core.enqueue_closed(CloseStatus::abnormal("session aborted"));
            vec![
                Action::AbortSends(std::mem::take(&mut core.pending_sends)),
                Action::Shutdown,
            ]
        };
        self.perform(actions);
        self.dispatch();
    }

    /// Reports a transport failure. The session goes straight to `Closed`
    /// with a synthetic 1006 status; no CLOSE frame is attempted.
    pub fn on_transport_error(&self, err: io::Error) {
        let actions = {
            let mut core = self.lock();
            if core.state == SessionState::Closed {
                return;
            }
            let status = CloseStatus::abnormal(&err.to_string());
            core.set_state(SessionState::Closed, &*self.inner.sink);
            core.batch.clear();
            core.enqueue_error(WebSocketError::IoError(err));
            core.enqueue_closed(status);
            vec![
                Action::AbortSends(std::mem::take(&mut core.pending_sends)),
                Action::Shutdown,
            ]
        };
        self.perform(actions);
        self.dispatch();
    }

    /// Reports that the close handshake did not finish in time. Forces
    /// `Closed` and shuts the transport down; this is not an error, so only
    /// `on_closed` fires.
    pub fn on_close_timeout(&self) {
        self.inner.sink.event(SessionEvent::CloseTimeout);
        let actions = {
            let mut core = self.lock();
            if core.state == SessionState::Closed {
                return;
            }
            let status = core
                .sent_close
                .clone()
                .or_else(|| core.recv_close.clone())
                .unwrap_or_else(|| CloseStatus::abnormal("close handshake timed out"));
            core.set_state(SessionState::Closed, &*self.inner.sink);
            core.batch.clear();
            core.enqueue_closed(status);
            vec![
                Action::AbortSends(std::mem::take(&mut core.pending_sends)),
                Action::Shutdown,
            ]
        };
        self.perform(actions);
        self.dispatch();
    }

    /// Reports that the connection has been idle. While `Open` the session
    /// sends an automatic PING to probe the peer; in any other state this is
    /// a no-op.
    pub fn on_idle_timeout(&self) {
        self.inner.sink.event(SessionEvent::IdleTimeout);
        let actions = {
            let mut core = self.lock();
            if core.state != SessionState::Open {
                return;
            }
            let core = &mut *core;
            let ping = Frame::ping(Bytes::new());
            match core.generator.encode(&ping, &mut core.batch) {
                Ok(()) => {
                    self.inner.sink.event(SessionEvent::FrameOut(&ping));
                    vec![Action::Write {
                        data: core.batch.split().freeze(),
                        completions: std::mem::take(&mut core.pending_sends),
                        on_flush: FlushEffect::None,
                    }]
                }
                Err(err) => core.fatal(err, &*self.inner.sink),
            }
        };
        self.perform(actions);
        self.dispatch();
    }

    fn lock(&self) -> MutexGuard<'_, Core> {
        self.inner
            .core
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn schedule(&self, task: impl FnOnce() + Send + 'static) {
        self.inner.executor.execute(Box::new(task));
    }

    fn perform(&self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Write {
                    data,
                    completions,
                    on_flush,
                } => {
                    let session = self.clone();
                    let callback = WriteCallback::new(move |result| match result {
                        Ok(()) => {
                            for completion in completions {
                                session.schedule_completion(completion, Ok(()));
                            }
                            match on_flush {
                                FlushEffect::None => {}
                                FlushEffect::CloseFlushed => session.close_flushed(),
                                FlushEffect::Shutdown => session.inner.transport.shutdown(),
                            }
                        }
                        Err(err) => {
                            for completion in completions {
                                let err = clone_io_error(&err);
                                session.schedule_completion(completion, Err(err.into()));
                            }
                            session.on_transport_error(err);
                        }
                    });
                    self.inner.transport.write(data, callback);
                }
                Action::FailSend { completion, error } => {
                    self.schedule_completion(completion, Err(error));
                }
                Action::AbortSends(completions) => {
                    for completion in completions {
                        self.schedule_completion(completion, Err(WebSocketError::ConnectionClosed));
                    }
                }
                Action::Shutdown => self.inner.transport.shutdown(),
            }
        }
    }

    fn schedule_completion(&self, completion: SendCallback, result: crate::Result<()>) {
        self.schedule(move || completion.complete(result));
    }

    /// The echo of the peer's CLOSE has been flushed: the handshake is done.
    fn close_flushed(&self) {
        let actions = {
            let mut core = self.lock();
            if core.state == SessionState::Closed {
                return;
            }
            core.set_state(SessionState::Closed, &*self.inner.sink);
            let status = core
                .recv_close
                .clone()
                .unwrap_or_else(CloseStatus::no_status);
            core.enqueue_closed(status);
            vec![
                Action::AbortSends(std::mem::take(&mut core.pending_sends)),
                Action::Shutdown,
            ]
        };
        self.perform(actions);
        self.dispatch();
    }

    /// Drains the handler event queue through the executor. The dispatching
    /// flag guarantees a single drain loop at a time, which serializes
    /// handler callbacks and keeps them from nesting when the executor is
    /// inline.
    fn dispatch(&self) {
        if self.inner.dispatching.swap(true, Ordering::SeqCst) {
            return;
        }
        let session = self.clone();
        self.schedule(move || session.run_dispatch());
    }

    fn run_dispatch(&self) {
        loop {
            let event = {
                let mut core = self.lock();
                match core.events.pop_front() {
                    Some(event) => event,
                    None => {
                        // Still under the lock, so no enqueue can race the
                        // flag reset.
                        self.inner.dispatching.store(false, Ordering::SeqCst);
                        return;
                    }
                }
            };
            self.deliver(event);
        }
    }

    fn deliver(&self, event: HandlerEvent) {
        let mut handler = self
            .inner
            .handler
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match event {
            HandlerEvent::Open => handler.on_open(self, self.handler_callback()),
            HandlerEvent::Frame(frame) => handler.on_frame(self, frame, self.handler_callback()),
            HandlerEvent::Error(err) => handler.on_error(self, &err, self.handler_callback()),
            HandlerEvent::Closed(status) => handler.on_closed(self, status, self.handler_callback()),
        }
    }

    fn handler_callback(&self) -> Callback {
        let session = self.clone();
        Callback::new(move |result| {
            if let Err(err) = result {
                session.handler_failed(err);
            }
        })
    }

    /// A handler callback failed: log it and close with 1011.
    fn handler_failed(&self, err: io::Error) {
        self.inner.sink.event(SessionEvent::HandlerFailure(&err));
        let reason = err.to_string();
        let actions = {
            let mut core = self.lock();
            if core.state != SessionState::Open {
                return;
            }
            let status = CloseStatus::truncated(CloseCode::Error, &reason);
            core.send(
                Frame::close_raw(status.to_payload()),
                SendCallback::ignore(),
                false,
                &*self.inner.sink,
            )
        };
        self.perform(actions);
        self.dispatch();
    }
}

impl Core {
    fn set_state(&mut self, to: SessionState, sink: &dyn EventSink) {
        let from = std::mem::replace(&mut self.state, to);
        sink.event(SessionEvent::StateChanged { from, to });
    }

    fn enqueue_error(&mut self, err: WebSocketError) {
        if !self.error_delivered {
            self.error_delivered = true;
            self.events.push_back(HandlerEvent::Error(err));
        }
    }

    fn enqueue_closed(&mut self, status: CloseStatus) {
        if !self.closed_delivered {
            self.closed_delivered = true;
            self.events.push_back(HandlerEvent::Closed(status));
        }
    }

    /// Parses and delivers as long as the handler has demand.
    fn pump(&mut self, sink: &dyn EventSink) -> Vec<Action> {
        let mut actions = Vec::new();
        while self.state != SessionState::Closed && self.demand > 0 {
            if let Some(frame) = self.inbound.pop_front() {
                self.demand -= 1;
                self.events.push_back(HandlerEvent::Frame(frame));
                continue;
            }

            match self.parser.decode(&mut self.recv_buf) {
                Ok(Some(frame)) => {
                    sink.event(SessionEvent::FrameIn(&frame));
                    self.on_frame_in(frame, sink, &mut actions);
                }
                Ok(None) => break,
                Err(err) => {
                    actions.extend(self.fatal(err, sink));
                    break;
                }
            }
        }
        actions
    }

    fn on_frame_in(&mut self, frame: Frame, sink: &dyn EventSink, actions: &mut Vec<Action>) {
        let frame = match self.extensions.decode(frame) {
            Ok(frame) => frame,
            Err(err) => {
                actions.extend(self.fatal(err, sink));
                return;
            }
        };

        match frame.opcode {
            OpCode::Ping => {
                if self.config.deliver_ping {
                    self.inbound.push_back(frame.clone());
                }
                // Answered without consulting the handler, in every state
                // but Closed.
                let pong = Frame::pong(frame.payload);
                match self.generator.encode(&pong, &mut self.batch) {
                    Ok(()) => {
                        sink.event(SessionEvent::FrameOut(&pong));
                        actions.push(Action::Write {
                            data: self.batch.split().freeze(),
                            completions: std::mem::take(&mut self.pending_sends),
                            on_flush: FlushEffect::None,
                        });
                    }
                    Err(err) => actions.extend(self.fatal(err, sink)),
                }
            }
            OpCode::Pong => self.inbound.push_back(frame),
            OpCode::Close => self.handle_close(frame, sink, actions),
            _ => match self.assembler.accept(frame) {
                Ok(Some(message)) => self.inbound.push_back(message),
                Ok(None) => {}
                Err(err) => actions.extend(self.fatal(err, sink)),
            },
        }
    }

    fn handle_close(&mut self, frame: Frame, sink: &dyn EventSink, actions: &mut Vec<Action>) {
        let status = match CloseStatus::from_payload(&frame.payload) {
            Ok(status) => status,
            Err(err) => {
                actions.extend(self.fatal(err, sink));
                return;
            }
        };

        // A CLOSE without a status code is echoed and reported as 1000.
        let status = if status.code() == CloseCode::Status {
            CloseStatus::normal()
        } else {
            status
        };

        match self.state {
            SessionState::Open => {
                let echo = Frame::close_raw(status.to_payload());
                if let Err(err) = self.generator.encode(&echo, &mut self.batch) {
                    actions.extend(self.fatal(err, sink));
                    return;
                }
                sink.event(SessionEvent::FrameOut(&echo));
                self.recv_close = Some(status);
                self.set_state(SessionState::RemoteClosing, sink);
                actions.push(Action::Write {
                    data: self.batch.split().freeze(),
                    completions: std::mem::take(&mut self.pending_sends),
                    on_flush: FlushEffect::CloseFlushed,
                });
            }
            SessionState::LocalClosing => {
                // The peer's reply to our CLOSE completes the handshake.
                // The resolution is the status this endpoint initiated with.
                self.recv_close = Some(status.clone());
                self.set_state(SessionState::Closed, sink);
                let resolved = self.sent_close.clone().unwrap_or(status);
                self.enqueue_closed(resolved);
                actions.push(Action::AbortSends(std::mem::take(&mut self.pending_sends)));
                actions.push(Action::Shutdown);
            }
            // Duplicate CLOSE while the echo is in flight; nothing to do.
            SessionState::RemoteClosing | SessionState::Closed => {}
        }
    }

    fn send(
        &mut self,
        frame: Frame,
        callback: SendCallback,
        batch: bool,
        sink: &dyn EventSink,
    ) -> Vec<Action> {
        match self.state {
            SessionState::Closed => {
                return vec![Action::FailSend {
                    completion: callback,
                    error: WebSocketError::IllegalState("session closed"),
                }]
            }
            SessionState::LocalClosing | SessionState::RemoteClosing => {
                if frame.opcode.is_data() {
                    return vec![Action::FailSend {
                        completion: callback,
                        error: WebSocketError::IllegalState("data frame after close initiated"),
                    }];
                }
                if frame.opcode == OpCode::Close {
                    return vec![Action::FailSend {
                        completion: callback,
                        error: WebSocketError::IllegalState("close already in progress"),
                    }];
                }
            }
            SessionState::Open => {}
        }

        let closing = frame.opcode == OpCode::Close;
        if closing {
            match CloseStatus::from_payload(&frame.payload) {
                Ok(status) => self.sent_close = Some(status),
                Err(error) => {
                    return vec![Action::FailSend {
                        completion: callback,
                        error,
                    }]
                }
            }
        }

        let mut actions = Vec::new();
        let frame = match self.extensions.encode(frame) {
            Ok(frame) => frame,
            Err(err) => {
                let error = match &err {
                    WebSocketError::Extension(msg) => WebSocketError::Extension(msg.clone()),
                    other => WebSocketError::Extension(other.to_string()),
                };
                actions.extend(self.fatal(err, sink));
                actions.push(Action::FailSend {
                    completion: callback,
                    error,
                });
                return actions;
            }
        };

        // Validation happens before serialization, so a rejected frame
        // leaves the batch untouched.
        if let Err(error) = self.generator.encode(&frame, &mut self.batch) {
            return vec![Action::FailSend {
                completion: callback,
                error,
            }];
        }
        sink.event(SessionEvent::FrameOut(&frame));
        self.pending_sends.push(callback);

        if closing {
            self.set_state(SessionState::LocalClosing, sink);
        }

        if !batch || closing {
            actions.push(Action::Write {
                data: self.batch.split().freeze(),
                completions: std::mem::take(&mut self.pending_sends),
                on_flush: FlushEffect::None,
            });
        }
        actions
    }

    /// Terminates the session over a fatal engine error: send the mapped
    /// CLOSE, then `on_error` and `on_closed`.
    fn fatal(&mut self, err: WebSocketError, sink: &dyn EventSink) -> Vec<Action> {
        if self.state == SessionState::Closed {
            return Vec::new();
        }
        sink.event(SessionEvent::ProtocolViolation(&err));

        let status = CloseStatus::truncated(err.close_code(), &err.to_string());
        let mut actions = Vec::new();

        // One CLOSE per session: skip the frame once ours or the echo of the
        // peer's is on the wire.
        if self.state == SessionState::Open {
            let frame = Frame::close_raw(status.to_payload());
            if self.generator.encode(&frame, &mut self.batch).is_ok() {
                sink.event(SessionEvent::FrameOut(&frame));
            }
        }
        self.sent_close = Some(status.clone());

        let completions = std::mem::take(&mut self.pending_sends);
        let data = self.batch.split().freeze();
        if data.is_empty() {
            actions.push(Action::AbortSends(completions));
            actions.push(Action::Shutdown);
        } else {
            // Batched frames ahead of the CLOSE still go out; their
            // completions resolve with the write.
            actions.push(Action::Write {
                data,
                completions,
                on_flush: FlushEffect::Shutdown,
            });
        }

        self.set_state(SessionState::Closed, sink);
        self.enqueue_error(err);
        self.enqueue_closed(status);
        actions
    }
}

fn clone_io_error(err: &io::Error) -> io::Error {
    io::Error::new(err.kind(), err.to_string())
}
