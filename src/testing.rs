//! Scriptable collaborators for exercising the driver without a transport.
//!
//! Used by this crate's unit and integration tests; hidden from the public
//! API surface but kept compilable for downstream test suites.

use std::{
    collections::VecDeque,
    io,
    net::SocketAddr,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    time::Duration,
};

use bytes::{Bytes, BytesMut};

use crate::{
    endpoint::{Endpoint, EndpointListener, Fill},
    executor::{ExecuteError, Executor},
    frame::Frame,
    session::{FrameConsumed, Session},
};

/// Observable endpoint interactions, in call order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EndpointEvent {
    /// `fill` returned zero bytes.
    ZeroFill,
    /// `fill` reported EOF.
    Eof,
    /// `fill_interested` was armed.
    FillInterested,
    /// `flush` accepted bytes (fully or partially).
    Flushed(usize),
    /// `shutdown_output` was called.
    ShutdownOutput,
    /// `close` was called.
    Close,
    /// `set_idle_timeout` was called.
    IdleTimeout(Duration),
}

/// One scripted `fill` outcome.
enum FillScript {
    Data(Vec<u8>),
    Empty,
    Eof,
    Error(io::Error),
}

/// One scripted `flush` outcome.
enum FlushScript {
    WriteAll,
    /// Accept at most this many bytes, then report an incomplete write.
    Partial(usize),
    Error(io::Error),
}

struct MockState {
    fills: VecDeque<FillScript>,
    flushes: VecDeque<FlushScript>,
    written: BytesMut,
    events: Vec<EndpointEvent>,
    listener: Option<Weak<dyn EndpointListener>>,
    write_waker: Option<Box<dyn FnOnce() + Send>>,
    output_shutdown: bool,
    closed: bool,
}

/// A deterministic, fully scriptable [`Endpoint`].
///
/// `fill` pops scripted outcomes (defaulting to "no bytes available");
/// `flush` accepts everything unless scripted otherwise. Every interaction
/// is recorded in an ordered event log for invariant assertions.
pub struct MockEndpoint {
    state: Mutex<MockState>,
    local: SocketAddr,
    remote: SocketAddr,
}

impl Default for MockEndpoint {
    fn default() -> Self { Self::new() }
}

impl MockEndpoint {
    /// An endpoint with fixed local/remote addresses and an empty script.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                fills: VecDeque::new(),
                flushes: VecDeque::new(),
                written: BytesMut::new(),
                events: Vec::new(),
                listener: None,
                write_waker: None,
                output_shutdown: false,
                closed: false,
            }),
            local: "127.0.0.1:9001".parse().expect("addr"),
            remote: "127.0.0.2:51234".parse().expect("addr"),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Script bytes for the next `fill`.
    pub fn push_fill(&self, bytes: impl AsRef<[u8]>) {
        self.lock()
            .fills
            .push_back(FillScript::Data(bytes.as_ref().to_vec()));
    }

    /// Script an explicit zero-byte `fill`.
    pub fn push_empty(&self) { self.lock().fills.push_back(FillScript::Empty); }

    /// Script an EOF.
    pub fn push_eof(&self) { self.lock().fills.push_back(FillScript::Eof); }

    /// Script a read error.
    pub fn push_fill_error(&self, error: io::Error) {
        self.lock().fills.push_back(FillScript::Error(error));
    }

    /// Script the next `flush` to accept only `n` bytes.
    pub fn push_partial_flush(&self, n: usize) {
        self.lock().flushes.push_back(FlushScript::Partial(n));
    }

    /// Script the next `flush` to fail.
    pub fn push_flush_error(&self, error: io::Error) {
        self.lock().flushes.push_back(FlushScript::Error(error));
    }

    /// Bytes the driver handed to the transport so far.
    #[must_use]
    pub fn written(&self) -> Bytes { Bytes::copy_from_slice(&self.lock().written) }

    /// Drain and return the bytes written so far.
    pub fn take_written(&self) -> Bytes { self.lock().written.split().freeze() }

    /// Snapshot of the ordered event log.
    #[must_use]
    pub fn events(&self) -> Vec<EndpointEvent> { self.lock().events.clone() }

    /// Number of `fill_interested` arms so far.
    #[must_use]
    pub fn fill_interested_count(&self) -> usize {
        self.lock()
            .events
            .iter()
            .filter(|event| **event == EndpointEvent::FillInterested)
            .count()
    }

    /// Whether the writing half was shut down.
    #[must_use]
    pub fn is_output_shutdown(&self) -> bool { self.lock().output_shutdown }

    /// Whether the transport was fully closed.
    #[must_use]
    pub fn is_closed(&self) -> bool { self.lock().closed }

    fn listener(&self) -> Option<Arc<dyn EndpointListener>> {
        self.lock().listener.clone().and_then(|weak| weak.upgrade())
    }

    /// Deliver read readiness to the registered listener, as the transport's
    /// reader would.
    pub fn notify_readable(&self) {
        if let Some(listener) = self.listener() {
            listener.on_readable();
        }
    }

    /// Deliver an idle timeout. Returns the listener's absorbed flag, or
    /// `true` when no listener is registered.
    pub fn notify_read_timeout(&self) -> bool {
        self.listener().is_none_or(|listener| listener.on_read_timeout())
    }

    /// Fire a pending write-readiness wakeup, if one is armed.
    pub fn notify_writable(&self) {
        let waker = self.lock().write_waker.take();
        if let Some(waker) = waker {
            waker();
        }
    }

    /// Whether a write-readiness wakeup is currently armed.
    #[must_use]
    pub fn has_write_waker(&self) -> bool { self.lock().write_waker.is_some() }
}

impl Endpoint for MockEndpoint {
    fn fill(&self, buffer: &mut BytesMut) -> io::Result<Fill> {
        let mut state = self.lock();
        match state.fills.pop_front() {
            Some(FillScript::Data(bytes)) => {
                buffer.extend_from_slice(&bytes);
                Ok(Fill::Bytes(bytes.len()))
            }
            Some(FillScript::Empty) | None => {
                state.events.push(EndpointEvent::ZeroFill);
                Ok(Fill::Empty)
            }
            Some(FillScript::Eof) => {
                state.events.push(EndpointEvent::Eof);
                Ok(Fill::Eof)
            }
            Some(FillScript::Error(error)) => Err(error),
        }
    }

    fn flush(&self, buffer: &mut BytesMut) -> io::Result<bool> {
        let mut state = self.lock();
        match state.flushes.pop_front() {
            Some(FlushScript::WriteAll) | None => {
                let n = buffer.len();
                let bytes = buffer.split();
                state.written.extend_from_slice(&bytes);
                state.events.push(EndpointEvent::Flushed(n));
                Ok(true)
            }
            Some(FlushScript::Partial(limit)) => {
                let n = buffer.len().min(limit);
                let bytes = buffer.split_to(n);
                state.written.extend_from_slice(&bytes);
                state.events.push(EndpointEvent::Flushed(n));
                Ok(buffer.is_empty())
            }
            Some(FlushScript::Error(error)) => Err(error),
        }
    }

    fn fill_interested(&self) { self.lock().events.push(EndpointEvent::FillInterested); }

    fn flush_interested(&self, wakeup: Box<dyn FnOnce() + Send>) {
        self.lock().write_waker = Some(wakeup);
    }

    fn shutdown_output(&self) {
        let mut state = self.lock();
        state.output_shutdown = true;
        state.events.push(EndpointEvent::ShutdownOutput);
    }

    fn close(&self) {
        {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.events.push(EndpointEvent::Close);
        }
        // a real transport reports the disconnect back to its listener
        if let Some(listener) = self.listener() {
            listener.on_closed();
        }
    }

    fn set_idle_timeout(&self, timeout: Duration) {
        self.lock().events.push(EndpointEvent::IdleTimeout(timeout));
    }

    fn register(&self, listener: Weak<dyn EndpointListener>) {
        self.lock().listener = Some(listener);
    }

    fn local_address(&self) -> SocketAddr { self.local }

    fn remote_address(&self) -> SocketAddr { self.remote }
}

/// Runs tasks immediately on the calling thread.
#[derive(Clone, Copy, Debug, Default)]
pub struct InlineExecutor;

impl Executor for InlineExecutor {
    fn execute(&self, task: Box<dyn FnOnce() + Send>) -> Result<(), ExecuteError> {
        task();
        Ok(())
    }
}

/// Queues tasks until [`DeferredExecutor::run_all`] is called.
#[derive(Default)]
pub struct DeferredExecutor {
    tasks: Mutex<VecDeque<Box<dyn FnOnce() + Send>>>,
}

impl DeferredExecutor {
    /// An executor with an empty task queue.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Number of queued tasks.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Run queued tasks (including those they enqueue) to exhaustion.
    pub fn run_all(&self) {
        loop {
            let task = self
                .tasks
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pop_front();
            match task {
                Some(task) => task(),
                None => return,
            }
        }
    }
}

impl Executor for DeferredExecutor {
    fn execute(&self, task: Box<dyn FnOnce() + Send>) -> Result<(), ExecuteError> {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(task);
        Ok(())
    }
}

/// Refuses every task, for exercising rejected-dispatch paths.
#[derive(Clone, Copy, Debug, Default)]
pub struct RejectingExecutor;

impl Executor for RejectingExecutor {
    fn execute(&self, _task: Box<dyn FnOnce() + Send>) -> Result<(), ExecuteError> {
        Err(ExecuteError)
    }
}

/// A session that records delivered frames and reported errors.
///
/// By default every frame completes synchronously; [`CollectingSession::deferred`]
/// holds completions for the test to resolve, exercising the asynchronous
/// completion path.
#[derive(Default)]
pub struct CollectingSession {
    defer: bool,
    frames: Mutex<Vec<Frame>>,
    completions: Mutex<VecDeque<FrameConsumed>>,
    errors: Mutex<Vec<String>>,
}

impl CollectingSession {
    /// A session completing every frame synchronously.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// A session that parks completions until the test resolves them.
    #[must_use]
    pub fn deferred() -> Self {
        Self {
            defer: true,
            ..Self::default()
        }
    }

    /// Frames delivered so far.
    #[must_use]
    pub fn frames(&self) -> Vec<Frame> {
        self.frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of frames delivered so far.
    #[must_use]
    pub fn frame_count(&self) -> usize {
        self.frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Errors reported through [`Session::on_error`].
    #[must_use]
    pub fn errors(&self) -> Vec<String> {
        self.errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Resolve the oldest parked completion. Returns `false` when none is
    /// parked.
    pub fn complete_next(&self) -> bool {
        let completion = self
            .completions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        match completion {
            Some(completion) => {
                completion.succeed();
                true
            }
            None => false,
        }
    }
}

impl Session for CollectingSession {
    fn on_frame(&self, frame: Frame, completion: FrameConsumed) {
        self.frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(frame);
        if self.defer {
            self.completions
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push_back(completion);
        } else {
            completion.succeed();
        }
    }

    fn on_error(&self, error: &(dyn std::error::Error + 'static)) {
        self.errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(error.to_string());
    }
}
