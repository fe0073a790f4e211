//! The connection driver: wires the transport, the codec, the extension
//! chain, the flusher, and the lifecycle state machine together.
//!
//! The driver owns three tightly coupled responsibilities:
//!
//! - the **read pump** (`fill_and_parse`): drains the transport through the
//!   parser, dispatches frames through the extension chain, and re-arms
//!   read readiness when the transport runs dry;
//! - the **lifecycle reactions**: as a listener on [`IoState`] it emits
//!   close frames, shuts transport output down, and disconnects at the
//!   instants the state machine dictates;
//! - the **public connection API** used by the session and the upgrade
//!   layer.
//!
//! The pump body is single-threaded by construction: a one-shot `pumping`
//! flag elects the running thread, and any caller that loses the election
//! (a resume racing the reader, an asynchronous frame completion) requests
//! a rerun instead of blocking.

use std::{
    io,
    net::SocketAddr,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError, Weak,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use log::{debug, trace, warn};

use crate::{
    buffer::BufferPool,
    close::{CloseInfo, status},
    codec::{CodecError, Generator, MAX_HEADER_LENGTH, Parser},
    endpoint::{Endpoint, EndpointListener, Fill},
    executor::Executor,
    extension::{ExtensionConfig, ExtensionStack, OutgoingSink},
    frame::{Frame, OpCode},
    io::{
        flusher::{BatchMode, FrameFlusher, WriteCallback, WriteError},
        state::{ConnectionState, IoState},
    },
    policy::{Behaviour, Policy, PolicyError},
    session::{FrameConsumed, Session},
};

struct ReadState {
    parser: Box<dyn Parser>,
    network_buffer: Option<bytes::BytesMut>,
    prefill: Option<Bytes>,
}

impl ReadState {
    /// Merge any prefill, ensure a network buffer, and ask the parser for
    /// the next frame.
    fn parse_step(
        &mut self,
        pool: &dyn BufferPool,
        input_buffer_size: usize,
    ) -> Result<Option<Frame>, CodecError> {
        let buffer = self
            .network_buffer
            .get_or_insert_with(|| pool.acquire(input_buffer_size));
        if let Some(prefill) = self.prefill.take() {
            debug!("parsing {} bytes of upgrade prefill", prefill.len());
            buffer.extend_from_slice(&prefill);
        }
        self.parser.parse(buffer)
    }
}

/// Idempotent, thread-safe handle to resume a suspended connection.
pub struct SuspendToken {
    connection: Weak<Connection>,
}

impl SuspendToken {
    /// Clear the suspension and re-enter the read pump.
    pub fn resume(&self) {
        if let Some(connection) = self.connection.upgrade() {
            connection.resume();
        }
    }
}

/// The WebSocket connection driver.
///
/// Constructed by the upgrade layer around a post-handshake transport, then
/// [`open`](Connection::open)ed exactly once. Shared between the transport's
/// reader, the executor, and application threads.
pub struct Connection {
    id: String,
    policy: Policy,
    endpoint: Arc<dyn Endpoint>,
    pool: Arc<dyn BufferPool>,
    extension_stack: Arc<dyn ExtensionStack>,
    session: Arc<dyn Session>,
    io_state: Arc<IoState>,
    flusher: Arc<FrameFlusher>,
    read: Mutex<ReadState>,
    negotiated: Mutex<Vec<ExtensionConfig>>,
    input_buffer_size: AtomicUsize,
    suspended: AtomicBool,
    pumping: AtomicBool,
    repump: AtomicBool,
    // one-shot guards
    opened: AtomicBool,
    closed: AtomicBool,
    output_shutdown: AtomicBool,
    transport_closed: AtomicBool,
    weak_self: Weak<Connection>,
}

impl Connection {
    /// Assemble a driver around its collaborators.
    ///
    /// Applies the policy and the negotiated extension configuration to the
    /// codec, wires the extension chain's termini (session in, flusher
    /// out), registers with the transport, and forwards the policy's idle
    /// timeout. The connection stays in `Connecting` until
    /// [`open`](Connection::open).
    #[must_use]
    pub fn new(
        endpoint: Arc<dyn Endpoint>,
        executor: Arc<dyn Executor>,
        pool: Arc<dyn BufferPool>,
        extension_stack: Arc<dyn ExtensionStack>,
        session: Arc<dyn Session>,
        mut parser: Box<dyn Parser>,
        mut generator: Box<dyn Generator>,
        policy: Policy,
    ) -> Arc<Self> {
        extension_stack.set_policy(&policy);
        extension_stack.configure_codec(parser.as_mut(), generator.as_mut());
        extension_stack.set_session(Arc::clone(&session));

        let id = format!(
            "{}->{}",
            endpoint.local_address(),
            endpoint.remote_address()
        );
        let connection = Arc::new_cyclic(|weak: &Weak<Connection>| {
            let failure_weak = weak.clone();
            let flusher = FrameFlusher::new(
                Arc::clone(&endpoint),
                Arc::clone(&pool),
                executor,
                generator,
                policy.output_buffer_size(),
                Box::new(move |error| {
                    if let Some(connection) = failure_weak.upgrade() {
                        connection.on_flush_failure(error);
                    }
                }),
            );
            Connection {
                id,
                input_buffer_size: AtomicUsize::new(policy.input_buffer_size()),
                policy,
                endpoint,
                pool,
                extension_stack,
                session,
                io_state: Arc::new(IoState::new()),
                flusher,
                read: Mutex::new(ReadState {
                    parser,
                    network_buffer: None,
                    prefill: None,
                }),
                negotiated: Mutex::new(Vec::new()),
                suspended: AtomicBool::new(false),
                pumping: AtomicBool::new(false),
                repump: AtomicBool::new(false),
                opened: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                output_shutdown: AtomicBool::new(false),
                transport_closed: AtomicBool::new(false),
                weak_self: weak.clone(),
            }
        });

        connection
            .extension_stack
            .set_outgoing(Arc::clone(&connection.flusher) as Arc<dyn OutgoingSink>);

        let reaction = Arc::downgrade(&connection);
        connection.io_state.add_listener(move |state| {
            if let Some(connection) = reaction.upgrade() {
                connection.on_connection_state_change(state);
            }
        });

        let listener: Weak<dyn EndpointListener> =
            Arc::downgrade(&(Arc::clone(&connection) as Arc<dyn EndpointListener>));
        connection.endpoint.register(listener);
        connection
            .endpoint
            .set_idle_timeout(connection.policy.idle_timeout());
        connection
    }

    fn lock_read(&self) -> MutexGuard<'_, ReadState> {
        self.read.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Human-readable connection identity (`lip:lport->rip:rport`).
    #[must_use]
    pub fn id(&self) -> &str { &self.id }

    /// The configuration this connection runs under.
    #[must_use]
    pub fn policy(&self) -> &Policy { &self.policy }

    /// Client or server behaviour.
    #[must_use]
    pub fn behaviour(&self) -> Behaviour { self.policy.behaviour() }

    /// The lifecycle state machine, for inspection.
    #[must_use]
    pub fn io_state(&self) -> Arc<IoState> { Arc::clone(&self.io_state) }

    /// Local socket address.
    #[must_use]
    pub fn local_address(&self) -> SocketAddr { self.endpoint.local_address() }

    /// Remote socket address.
    #[must_use]
    pub fn remote_address(&self) -> SocketAddr { self.endpoint.remote_address() }

    /// Whether the connection is still usable for traffic: no local close
    /// initiated and not terminally closed.
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
            && self.io_state.connection_state() != ConnectionState::Closed
    }

    /// The extension list negotiated during the upgrade handshake.
    #[must_use]
    pub fn negotiated_extensions(&self) -> Vec<ExtensionConfig> {
        self.negotiated
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Record the negotiated extension list.
    pub fn set_negotiated_extensions(&self, extensions: Vec<ExtensionConfig>) {
        *self
            .negotiated
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = extensions;
    }

    /// Inject bytes the upgrade layer read past the end of the handshake.
    /// They are parsed before any transport read, once the connection opens.
    pub fn on_upgrade_to(&self, prefilled: Bytes) {
        debug!("[{}] upgrade prefill of {} bytes", self.id, prefilled.len());
        self.lock_read().prefill = Some(prefilled);
    }

    /// Transition `Connecting → Open` and start reading. Exactly one call
    /// has effect; later calls are logged no-ops.
    pub fn open(&self) {
        if self
            .opened
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!("[{}] open() called more than once", self.id);
            return;
        }
        debug!("[{}] opening as {}", self.id, self.behaviour());
        self.io_state.on_opened();
    }

    /// Initiate the closing handshake without a status code.
    pub fn close(&self) { self.enqueue_close(CloseInfo::empty(), None); }

    /// Initiate the closing handshake with a status code and reason.
    ///
    /// Only the first close attempt (from any path) sends a CLOSE frame;
    /// the rest are no-ops. Non-blocking.
    pub fn close_with(&self, code: u16, reason: &str) {
        self.enqueue_close(CloseInfo::new(code, reason), None);
    }

    /// Tear the transport down without a closing handshake: close the
    /// flusher, shut down output, then close the transport. Idempotent.
    pub fn disconnect(&self) { self.disconnect_mode(false); }

    /// Route a frame through the extension chain's outgoing direction into
    /// the flusher.
    pub fn outgoing_frame(&self, frame: Frame, callback: WriteCallback, mode: BatchMode) {
        trace!("[{}] outgoing {:?} frame", self.id, frame.opcode());
        self.extension_stack.outgoing_frame(frame, callback, mode);
    }

    /// Halt frame delivery until the returned token (or
    /// [`resume`](Connection::resume)) releases it.
    pub fn suspend(&self) -> SuspendToken {
        trace!("[{}] suspend", self.id);
        self.suspended.store(true, Ordering::Release);
        SuspendToken {
            connection: self.weak_self.clone(),
        }
    }

    /// Clear a suspension and re-enter the read pump.
    pub fn resume(&self) {
        trace!("[{}] resume", self.id);
        self.suspended.store(false, Ordering::Release);
        self.fill_and_parse();
    }

    /// Resize the network read buffer used by subsequent acquisitions.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::InputBufferTooSmall`] when `size` cannot hold
    /// a full frame header.
    pub fn set_input_buffer_size(&self, size: usize) -> Result<(), PolicyError> {
        if size < MAX_HEADER_LENGTH {
            return Err(PolicyError::InputBufferTooSmall {
                size,
                min: MAX_HEADER_LENGTH,
            });
        }
        self.input_buffer_size.store(size, Ordering::Relaxed);
        Ok(())
    }

    /// Forward a new idle timeout to the transport.
    pub fn set_max_idle_timeout(&self, timeout: Duration) {
        self.endpoint.set_idle_timeout(timeout);
    }

    /// The read pump. Runs until the transport runs dry, delivery is
    /// suspended or deferred, or the connection terminates; exclusive to
    /// one thread at a time, with lost callers queueing a rerun.
    fn fill_and_parse(&self) {
        loop {
            if self
                .pumping
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                self.repump.store(true, Ordering::Release);
                return;
            }
            self.run_pump();
            self.pumping.store(false, Ordering::Release);
            if !self.repump.swap(false, Ordering::AcqRel) {
                return;
            }
        }
    }

    fn run_pump(&self) {
        loop {
            if self.suspended.load(Ordering::Acquire) {
                trace!("[{}] pump suspended", self.id);
                return;
            }
            if self.io_state.connection_state() == ConnectionState::Closed {
                self.release_network_buffer();
                return;
            }

            // Drain bytes already in hand before touching the transport.
            let parsed = {
                let mut read = self.lock_read();
                let input_buffer_size = self.input_buffer_size.load(Ordering::Relaxed);
                read.parse_step(self.pool.as_ref(), input_buffer_size)
            };
            match parsed {
                Ok(Some(frame)) => {
                    if self.dispatch_frame(frame) {
                        continue;
                    }
                    // completion deferred: the callback re-enters the pump
                    return;
                }
                Ok(None) => {}
                Err(error) => {
                    self.handle_parse_error(&error);
                    return;
                }
            }

            let filled = {
                let mut read = self.lock_read();
                let input_buffer_size = self.input_buffer_size.load(Ordering::Relaxed);
                let buffer = read
                    .network_buffer
                    .get_or_insert_with(|| self.pool.acquire(input_buffer_size));
                self.endpoint.fill(buffer)
            };
            match filled {
                Ok(Fill::Bytes(n)) => trace!("[{}] filled {n} bytes", self.id),
                Ok(Fill::Empty) => {
                    self.release_network_buffer();
                    self.endpoint.fill_interested();
                    return;
                }
                Ok(Fill::Eof) => {
                    debug!("[{}] read EOF", self.id);
                    self.release_network_buffer();
                    self.io_state
                        .on_read_failure(&io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "remote read EOF",
                        ));
                    return;
                }
                Err(error) => {
                    warn!("[{}] read failure: {error}", self.id);
                    self.release_network_buffer();
                    self.io_state.on_read_failure(&error);
                    return;
                }
            }
        }
    }

    fn release_network_buffer(&self) {
        if let Some(buffer) = self.lock_read().network_buffer.take() {
            self.pool.release(buffer);
        }
    }

    /// Deliver one parsed frame through the extension chain.
    ///
    /// Returns `true` when the chain completed synchronously (the pump may
    /// continue), `false` when completion is deferred (the pump must pause;
    /// the completion callback re-enters it). A one-shot flag swapped at
    /// both sites decides which path resumes parsing, whatever order the
    /// two run in.
    fn dispatch_frame(&self, frame: Frame) -> bool {
        trace!("[{}] incoming {:?} frame", self.id, frame.opcode());
        if frame.opcode() == OpCode::Close {
            let close =
                CloseInfo::from_payload(frame.payload()).unwrap_or_else(|_| CloseInfo::empty());
            debug!("[{}] remote close: {close}", self.id);
            self.io_state.on_close_remote(close);
        }

        let completed = Arc::new(AtomicBool::new(false));
        let completion = {
            let completed = Arc::clone(&completed);
            let weak = self.weak_self.clone();
            FrameConsumed::new(move |result| {
                let Some(connection) = weak.upgrade() else {
                    return;
                };
                match result {
                    Ok(()) => {
                        if completed.swap(true, Ordering::AcqRel) {
                            // the pump already paused on our behalf
                            connection.fill_and_parse();
                        }
                    }
                    Err(error) => connection.notify_error(&error),
                }
            })
        };
        self.extension_stack.incoming_frame(frame, completion);

        // whichever site swaps second owns the resumption
        completed.swap(true, Ordering::AcqRel)
    }

    fn handle_parse_error(&self, error: &CodecError) {
        warn!("[{}] parse failure: {error}", self.id);
        self.release_network_buffer();
        // always the local close path, so the peer gets a CLOSE when possible
        self.enqueue_close(error.close_info(), None);
    }

    /// Enqueue the connection's single CLOSE frame, guarded so every close
    /// path together sends at most one. The frame's completion signals the
    /// state machine; `disconnect_after` optionally tears the transport
    /// down first (used when replying to a remote close).
    fn enqueue_close(&self, close: CloseInfo, disconnect_after: Option<bool>) {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("[{}] close already in flight; {close} suppressed", self.id);
            return;
        }
        debug!("[{}] sending close frame {close}", self.id);
        let frame = close.to_frame();
        let weak = self.weak_self.clone();
        let callback: WriteCallback = Box::new(move |result| {
            let Some(connection) = weak.upgrade() else {
                return;
            };
            if let Err(error) = &result {
                debug!("close frame write failed: {error}");
            }
            if let Some(output_only) = disconnect_after {
                connection.disconnect_mode(output_only);
            }
            connection.on_local_close_written(close);
        });
        self.outgoing_frame(frame, callback, BatchMode::Off);
    }

    /// The local CLOSE frame left (or failed to leave) this endpoint.
    fn on_local_close_written(&self, close: CloseInfo) {
        debug!("[{}] local close confirmed {close}", self.id);
        if close.is_abnormal() {
            self.io_state.on_abnormal_close(close);
        } else {
            self.io_state.on_close_local(close);
        }
    }

    fn on_flush_failure(&self, error: &WriteError) {
        self.notify_error(error);
        if self.io_state.was_abnormal_close() {
            debug!("[{}] write failure after abnormal close ignored: {error}", self.id);
            return;
        }
        debug!("[{}] write flush failure: {error}", self.id);
        self.io_state.on_write_failure(error);
    }

    fn notify_error(&self, error: &(dyn std::error::Error + 'static)) {
        self.session.on_error(error);
    }

    fn disconnect_mode(&self, output_only: bool) {
        debug!(
            "[{}] disconnect ({})",
            self.id,
            if output_only { "output-only" } else { "both" }
        );
        // no more writes from this point
        self.flusher.close();
        if self
            .output_shutdown
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            // gentle half-close first, so TLS close alerts can still flow
            self.endpoint.shutdown_output();
        }
        if !output_only
            && self
                .transport_closed
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            self.endpoint.close();
        }
    }

    /// Reaction to lifecycle transitions; registered on [`IoState`].
    fn on_connection_state_change(&self, state: ConnectionState) {
        debug!("[{}] connection state {state}", self.id);
        match state {
            ConnectionState::Open => {
                // parses any prefill, then arms read readiness
                self.fill_and_parse();
            }
            ConnectionState::Closing => {
                if self.io_state.was_remote_close_initiated()
                    && let Some(close) = self.io_state.close_info()
                {
                    // reply to the remote close; shut down output only, so
                    // the transport close completes when the peer does
                    self.enqueue_close(close, Some(true));
                }
            }
            ConnectionState::Closed => {
                if self.io_state.was_abnormal_close() {
                    self.abnormal_close_reaction();
                } else {
                    self.disconnect_mode(false);
                }
            }
            ConnectionState::Connecting => {}
        }
    }

    /// Best-effort CLOSE frame on abnormal termination, then a full
    /// disconnect either way.
    fn abnormal_close_reaction(&self) {
        let reason = self
            .io_state
            .close_info()
            .and_then(|close| close.reason().map(str::to_owned))
            .unwrap_or_default();
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let close = CloseInfo::new(status::SHUTDOWN, format!("abnormal close - {reason}"));
            debug!("[{}] best-effort close frame {close}", self.id);
            let weak = self.weak_self.clone();
            let callback: WriteCallback = Box::new(move |_result| {
                if let Some(connection) = weak.upgrade() {
                    connection.disconnect_mode(false);
                }
            });
            self.outgoing_frame(close.to_frame(), callback, BatchMode::Off);
        } else {
            self.disconnect_mode(false);
        }
    }
}

impl EndpointListener for Connection {
    fn on_readable(&self) {
        trace!("[{}] readable", self.id);
        self.fill_and_parse();
    }

    fn on_read_timeout(&self) -> bool {
        let state = self.io_state.connection_state();
        if state == ConnectionState::Closed {
            debug!("[{}] read timeout after CLOSED absorbed", self.id);
            return true;
        }
        debug!("[{}] idle timeout in {state}", self.id);
        self.notify_error(&io::Error::new(io::ErrorKind::TimedOut, "timeout on read"));
        self.close_with(status::SHUTDOWN, "Idle Timeout");
        false
    }

    fn on_closed(&self) {
        debug!("[{}] transport closed", self.id);
        self.io_state.on_disconnected();
        self.flusher.close();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("behaviour", &self.behaviour())
            .field("state", &self.io_state.connection_state())
            .finish_non_exhaustive()
    }
}
