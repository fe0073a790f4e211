//! The frame flusher: the single-writer outbound pipeline.
//!
//! Outgoing frames are queued as `(frame, callback, batch mode)` entries.
//! Whichever thread finds the flusher idle runs the flush turn: it
//! aggregates up to [`MAX_BATCH`] frames into one pooled output buffer,
//! drives the transport write, and resolves callbacks in enqueue order. A
//! second enqueue during an active turn only appends, so transport writes
//! never interleave.
//!
//! When the transport cannot accept more bytes, the flusher parks with its
//! partially written buffer and re-enters the loop through the executor once
//! the endpoint signals writability.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
};

use bytes::BytesMut;
use log::{debug, trace, warn};
use thiserror::Error;

use crate::{
    buffer::BufferPool,
    codec::{CodecError, Generator},
    endpoint::Endpoint,
    executor::Executor,
    extension::OutgoingSink,
    frame::Frame,
};

/// Hint about coalescing a frame with its queue neighbours.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BatchMode {
    /// Let the flusher decide; control frames are never delayed.
    Auto,
    /// The frame may be coalesced with adjacent `On`/`Auto` frames.
    On,
    /// Force a transport write immediately after this frame.
    Off,
}

/// Failure delivered to write callbacks.
#[derive(Clone, Debug, Error)]
pub enum WriteError {
    /// The flusher was closed before the frame reached the transport.
    #[error("frame flusher closed")]
    Closed,

    /// The transport write failed.
    #[error("write failed: {0}")]
    Io(Arc<std::io::Error>),

    /// The generator rejected the frame.
    #[error("frame generation failed: {0}")]
    Generate(Arc<CodecError>),
}

/// Per-frame completion callback: resolved exactly once, in enqueue order.
pub type WriteCallback = Box<dyn FnOnce(Result<(), WriteError>) + Send>;

/// Handler invoked once per flusher failure, before queued entries are
/// failed. Wired to the driver's write-failure path.
pub type FailureHandler = Box<dyn Fn(&WriteError) + Send + Sync>;

/// Fixed upper bound of frames aggregated into one flush turn.
pub const MAX_BATCH: usize = 8;

struct Entry {
    frame: Frame,
    callback: WriteCallback,
    mode: BatchMode,
}

enum FlushState {
    Idle,
    Flushing,
    Failed(WriteError),
    Closed,
}

struct Inner {
    state: FlushState,
    // sub-state of Flushing: awaiting transport writability
    parked: bool,
    queue: VecDeque<Entry>,
    aggregate: Option<BytesMut>,
    in_flight: Vec<WriteCallback>,
    generator: Box<dyn Generator>,
}

/// Queues outgoing frames and writes them with single-writer discipline.
pub struct FrameFlusher {
    inner: Mutex<Inner>,
    endpoint: Arc<dyn Endpoint>,
    pool: Arc<dyn BufferPool>,
    executor: Arc<dyn Executor>,
    on_failure: FailureHandler,
    buffer_size: usize,
    weak_self: Weak<FrameFlusher>,
}

enum EnqueueAction {
    Start,
    Queued,
    Reject(WriteError, WriteCallback),
}

impl FrameFlusher {
    /// Assemble a flusher around its collaborators.
    ///
    /// `buffer_size` bounds the aggregated output buffer; `on_failure` is
    /// invoked once per write failure before pending entries are failed.
    #[must_use]
    pub fn new(
        endpoint: Arc<dyn Endpoint>,
        pool: Arc<dyn BufferPool>,
        executor: Arc<dyn Executor>,
        generator: Box<dyn Generator>,
        buffer_size: usize,
        on_failure: FailureHandler,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            inner: Mutex::new(Inner {
                state: FlushState::Idle,
                parked: false,
                queue: VecDeque::new(),
                aggregate: None,
                in_flight: Vec::new(),
                generator,
            }),
            endpoint,
            pool,
            executor,
            on_failure,
            buffer_size,
            weak_self: weak.clone(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether the flusher is idle with nothing queued or in flight.
    #[must_use]
    pub fn is_idle(&self) -> bool { matches!(self.lock().state, FlushState::Idle) }

    /// Queue a frame. The callback resolves exactly once: after the frame's
    /// bytes were handed to the transport, or with the failure that stopped
    /// them getting there.
    pub fn enqueue(&self, frame: Frame, callback: WriteCallback, mode: BatchMode) {
        let action = {
            let mut inner = self.lock();
            let inner = &mut *inner;
            match &inner.state {
                FlushState::Failed(error) => EnqueueAction::Reject(error.clone(), callback),
                FlushState::Closed => EnqueueAction::Reject(WriteError::Closed, callback),
                FlushState::Idle => {
                    inner.queue.push_back(Entry {
                        frame,
                        callback,
                        mode,
                    });
                    inner.state = FlushState::Flushing;
                    EnqueueAction::Start
                }
                FlushState::Flushing => {
                    inner.queue.push_back(Entry {
                        frame,
                        callback,
                        mode,
                    });
                    EnqueueAction::Queued
                }
            }
        };
        match action {
            EnqueueAction::Start => self.run_flush_loop(),
            EnqueueAction::Queued => {}
            EnqueueAction::Reject(error, callback) => {
                debug!("enqueue rejected: {error}");
                callback(Err(error));
            }
        }
    }

    /// Fail everything pending and refuse further enqueues with
    /// [`WriteError::Closed`]. Idempotent.
    pub fn close(&self) {
        let pending = {
            let mut inner = self.lock();
            if matches!(inner.state, FlushState::Closed) {
                return;
            }
            inner.state = FlushState::Closed;
            inner.parked = false;
            if let Some(buffer) = inner.aggregate.take() {
                self.pool.release(buffer);
            }
            let mut pending = std::mem::take(&mut inner.in_flight);
            pending.extend(inner.queue.drain(..).map(|entry| entry.callback));
            pending
        };
        if !pending.is_empty() {
            debug!("flusher closed with {} pending frames", pending.len());
        }
        for callback in pending {
            callback(Err(WriteError::Closed));
        }
    }

    /// One flush turn: aggregate, write, resolve, repeat until the queue
    /// drains, the transport pushes back, or a failure ends the flusher.
    fn run_flush_loop(&self) {
        loop {
            let (mut buffer, callbacks) = match self.aggregate_batch() {
                Some(batch) => batch,
                None => return,
            };

            // The write happens outside the lock; Flushing state keeps it
            // exclusive to this thread.
            match self.endpoint.flush(&mut buffer) {
                Ok(true) => {
                    trace!("flushed batch of {} frames", callbacks.len());
                    for callback in callbacks {
                        callback(Ok(()));
                    }
                    let mut inner = self.lock();
                    if matches!(inner.state, FlushState::Flushing) {
                        inner.aggregate = Some(buffer);
                    } else {
                        self.pool.release(buffer);
                        return;
                    }
                }
                Ok(false) => {
                    let outcome = {
                        let mut inner = self.lock();
                        if matches!(inner.state, FlushState::Flushing) {
                            inner.aggregate = Some(buffer);
                            inner.in_flight = callbacks;
                            inner.parked = true;
                            None
                        } else {
                            Some((buffer, callbacks))
                        }
                    };
                    match outcome {
                        None => {
                            trace!("transport backpressure; awaiting writability");
                            let weak = self.weak_self.clone();
                            self.endpoint.flush_interested(Box::new(move || {
                                if let Some(flusher) = weak.upgrade() {
                                    flusher.on_writable();
                                }
                            }));
                        }
                        Some((buffer, callbacks)) => {
                            // closed or failed while the write was in progress
                            let error = self.terminal_error();
                            self.pool.release(buffer);
                            for callback in callbacks {
                                callback(Err(error.clone()));
                            }
                        }
                    }
                    return;
                }
                Err(error) => {
                    warn!("write flush failure: {error}");
                    self.pool.release(buffer);
                    self.fail_pending(WriteError::Io(Arc::new(error)), callbacks);
                    return;
                }
            }
        }
    }

    /// Pull up to [`MAX_BATCH`] frames into the output buffer. Returns the
    /// buffer and the callbacks it covers, or `None` when the turn is over.
    fn aggregate_batch(&self) -> Option<(BytesMut, Vec<WriteCallback>)> {
        let mut inner = self.lock();
        if !matches!(inner.state, FlushState::Flushing) || inner.parked {
            return None;
        }
        let mut buffer = match inner.aggregate.take() {
            Some(buffer) => buffer,
            None => self.pool.acquire(self.buffer_size),
        };
        let mut callbacks = std::mem::take(&mut inner.in_flight);

        let mut batched = 0;
        while batched < MAX_BATCH {
            let Some(entry) = inner.queue.front() else {
                break;
            };
            let need =
                inner.generator.header_length(&entry.frame) + entry.frame.payload_len();
            if !buffer.is_empty() && buffer.len() + need > self.buffer_size {
                // flush what we have first, then start a new buffer
                break;
            }
            let entry = match inner.queue.pop_front() {
                Some(entry) => entry,
                None => break,
            };
            let flush_now = matches!(entry.mode, BatchMode::Off)
                || (matches!(entry.mode, BatchMode::Auto) && entry.frame.is_control());
            match inner.generator.generate(&entry.frame, &mut buffer) {
                Ok(written) => {
                    trace!("aggregated {written} byte frame");
                    callbacks.push(entry.callback);
                    batched += 1;
                }
                Err(error) => {
                    callbacks.push(entry.callback);
                    drop(inner);
                    self.pool.release(buffer);
                    self.fail_pending(WriteError::Generate(Arc::new(error)), callbacks);
                    return None;
                }
            }
            if flush_now {
                break;
            }
        }

        if buffer.is_empty() {
            debug_assert!(callbacks.is_empty(), "callbacks without buffered bytes");
            self.pool.release(buffer);
            inner.state = FlushState::Idle;
            return None;
        }
        Some((buffer, callbacks))
    }

    /// Transition to `Failed`, fail `held` plus everything queued (in
    /// enqueue order), and notify the failure handler once.
    fn fail_pending(&self, error: WriteError, held: Vec<WriteCallback>) {
        let (queued, notify) = {
            let mut inner = self.lock();
            let notify = if matches!(inner.state, FlushState::Closed | FlushState::Failed(_)) {
                false
            } else {
                inner.state = FlushState::Failed(error.clone());
                true
            };
            inner.parked = false;
            if let Some(buffer) = inner.aggregate.take() {
                self.pool.release(buffer);
            }
            let mut queued = std::mem::take(&mut inner.in_flight);
            queued.extend(inner.queue.drain(..).map(|entry| entry.callback));
            (queued, notify)
        };
        for callback in held {
            callback(Err(error.clone()));
        }
        for callback in queued {
            callback(Err(error.clone()));
        }
        if notify {
            (self.on_failure)(&error);
        }
    }

    fn terminal_error(&self) -> WriteError {
        match &self.lock().state {
            FlushState::Failed(error) => error.clone(),
            _ => WriteError::Closed,
        }
    }

    /// The endpoint became writable while parked: resume through the
    /// executor, which is the flusher's designated call site.
    fn on_writable(&self) {
        let resume = {
            let mut inner = self.lock();
            if matches!(inner.state, FlushState::Flushing) && inner.parked {
                inner.parked = false;
                true
            } else {
                false
            }
        };
        if !resume {
            return;
        }
        let weak = self.weak_self.clone();
        let dispatched = self.executor.execute(Box::new(move || {
            if let Some(flusher) = weak.upgrade() {
                flusher.run_flush_loop();
            }
        }));
        if dispatched.is_err() {
            warn!("flush continuation rejected by executor; dropping");
        }
    }
}

impl OutgoingSink for FrameFlusher {
    fn send_frame(&self, frame: Frame, callback: WriteCallback, mode: BatchMode) {
        self.enqueue(frame, callback, mode);
    }
}

#[cfg(test)]
#[path = "flusher_tests.rs"]
mod tests;
