//! The connection lifecycle state machine.
//!
//! [`IoState`] is the single authority on where a connection stands in the
//! closing handshake. Events arrive from the read pump, the flusher, the
//! driver, and the session; listeners observe each transition exactly once,
//! in registration order. States only move forward: `Connecting → Open →
//! Closing → Closed`, where abnormal paths may skip `Closing`.
//!
//! Listener delivery is serialised through an internal pending queue: a
//! listener that re-enters a state-mutating event enqueues the resulting
//! notification instead of recursing, so delivery order always matches
//! transition order.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, PoisonError},
};

use log::debug;

use crate::close::{CloseInfo, status};

/// Lifecycle phase of a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionState {
    /// Constructed, not yet opened.
    Connecting,
    /// Frames flow in both directions.
    Open,
    /// One side of the closing handshake has completed.
    Closing,
    /// Terminal. Never left once entered.
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let token = match self {
            Self::Connecting => "CONNECTING",
            Self::Open => "OPEN",
            Self::Closing => "CLOSING",
            Self::Closed => "CLOSED",
        };
        f.write_str(token)
    }
}

type Listener = Arc<dyn Fn(ConnectionState) + Send + Sync>;

struct Inner {
    state: ConnectionState,
    close_info: Option<CloseInfo>,
    local_close_initiated: bool,
    remote_close_initiated: bool,
    abnormal: bool,
    io_failure: Option<String>,
    listeners: Vec<Listener>,
    pending: VecDeque<ConnectionState>,
    notifying: bool,
}

impl Inner {
    fn new() -> Self {
        Self {
            state: ConnectionState::Connecting,
            close_info: None,
            local_close_initiated: false,
            remote_close_initiated: false,
            abnormal: false,
            io_failure: None,
            listeners: Vec::new(),
            pending: VecDeque::new(),
            notifying: false,
        }
    }

    fn state(&self) -> ConnectionState { self.state }

    fn transition(&mut self, next: ConnectionState) {
        self.state = next;
        self.pending.push_back(next);
    }

    fn record_close_info(&mut self, close: CloseInfo) {
        // first close wins on the handshake path
        if self.close_info.is_none() {
            self.close_info = Some(close);
        }
    }
}

/// Authoritative connection lifecycle state and its listeners.
pub struct IoState {
    inner: Mutex<Inner>,
}

impl Default for IoState {
    fn default() -> Self { Self::new() }
}

impl IoState {
    /// A fresh state machine in `Connecting`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a transition listener. Listeners run in registration order
    /// and observe every subsequent transition exactly once.
    pub fn add_listener(&self, listener: impl Fn(ConnectionState) + Send + Sync + 'static) {
        self.lock().listeners.push(Arc::new(listener));
    }

    /// The driver was opened: `Connecting → Open`.
    pub fn on_opened(&self) {
        {
            let mut inner = self.lock();
            if inner.state() == ConnectionState::Connecting {
                inner.transition(ConnectionState::Open);
            } else {
                debug!("on_opened ignored in {}", inner.state());
            }
        }
        self.pump_notifications();
    }

    /// This endpoint's CLOSE frame completed: it initiated (or answered) the
    /// closing handshake.
    pub fn on_close_local(&self, close: CloseInfo) {
        {
            let mut inner = self.lock();
            match inner.state() {
                ConnectionState::Open => {
                    inner.local_close_initiated = true;
                    inner.record_close_info(close);
                    inner.transition(ConnectionState::Closing);
                }
                ConnectionState::Closing => {
                    inner.local_close_initiated = true;
                    inner.record_close_info(close);
                    if inner.remote_close_initiated {
                        inner.transition(ConnectionState::Closed);
                    }
                }
                state => debug!("on_close_local ignored in {state}"),
            }
        }
        self.pump_notifications();
    }

    /// The peer's CLOSE frame arrived.
    pub fn on_close_remote(&self, close: CloseInfo) {
        {
            let mut inner = self.lock();
            match inner.state() {
                ConnectionState::Open => {
                    inner.remote_close_initiated = true;
                    inner.record_close_info(close);
                    inner.transition(ConnectionState::Closing);
                }
                ConnectionState::Closing => {
                    inner.remote_close_initiated = true;
                    inner.record_close_info(close);
                    if inner.local_close_initiated {
                        inner.transition(ConnectionState::Closed);
                    }
                }
                state => debug!("on_close_remote ignored in {state}"),
            }
        }
        self.pump_notifications();
    }

    /// Terminate without completing the handshake.
    pub fn on_abnormal_close(&self, close: CloseInfo) {
        {
            let mut inner = self.lock();
            if inner.state() == ConnectionState::Closed {
                debug!("on_abnormal_close ignored in CLOSED");
            } else {
                inner.close_info = Some(close);
                inner.abnormal = true;
                inner.transition(ConnectionState::Closed);
            }
        }
        self.pump_notifications();
    }

    /// A transport read failed; terminates abnormally.
    pub fn on_read_failure(&self, error: &(dyn std::error::Error + '_)) {
        self.on_io_failure("read failure", error);
    }

    /// A transport write failed; terminates abnormally.
    pub fn on_write_failure(&self, error: &(dyn std::error::Error + '_)) {
        self.on_io_failure("write failure", error);
    }

    fn on_io_failure(&self, kind: &str, error: &(dyn std::error::Error + '_)) {
        {
            let mut inner = self.lock();
            if inner.state() == ConnectionState::Closed {
                debug!("{kind} after CLOSED ignored: {error}");
            } else {
                inner.io_failure = Some(error.to_string());
                inner.close_info = Some(CloseInfo::new(status::ABNORMAL, format!("{kind}: {error}")));
                inner.abnormal = true;
                inner.transition(ConnectionState::Closed);
            }
        }
        self.pump_notifications();
    }

    /// The transport has disconnected.
    pub fn on_disconnected(&self) {
        {
            let mut inner = self.lock();
            if inner.state() != ConnectionState::Closed {
                if inner.close_info.is_none() {
                    inner.close_info = Some(CloseInfo::new(status::NO_CLOSE, "disconnected"));
                }
                inner.transition(ConnectionState::Closed);
            }
        }
        self.pump_notifications();
    }

    /// Current lifecycle phase.
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState { self.lock().state() }

    /// The close information recorded for this connection, if any.
    #[must_use]
    pub fn close_info(&self) -> Option<CloseInfo> { self.lock().close_info.clone() }

    /// Whether termination bypassed (or will bypass) the closing handshake.
    #[must_use]
    pub fn was_abnormal_close(&self) -> bool { self.lock().abnormal }

    /// Whether the peer initiated the closing handshake.
    #[must_use]
    pub fn was_remote_close_initiated(&self) -> bool { self.lock().remote_close_initiated }

    /// Whether this endpoint initiated the closing handshake.
    #[must_use]
    pub fn was_local_close_initiated(&self) -> bool { self.lock().local_close_initiated }

    /// Message of the transport failure that terminated the connection.
    #[must_use]
    pub fn io_failure(&self) -> Option<String> { self.lock().io_failure.clone() }

    /// Deliver queued transitions unless another thread (or an outer frame
    /// of this one) is already doing so.
    fn pump_notifications(&self) {
        {
            let mut inner = self.lock();
            if inner.notifying || inner.pending.is_empty() {
                return;
            }
            inner.notifying = true;
        }
        loop {
            let (state, listeners) = {
                let mut inner = self.lock();
                let Some(state) = inner.pending.pop_front() else {
                    inner.notifying = false;
                    return;
                };
                (state, inner.listeners.clone())
            };
            for listener in &listeners {
                listener(state);
            }
        }
    }
}

impl std::fmt::Debug for IoState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("IoState")
            .field("state", &inner.state())
            .field("close_info", &inner.close_info)
            .field("local_close_initiated", &inner.local_close_initiated)
            .field("remote_close_initiated", &inner.remote_close_initiated)
            .field("abnormal", &inner.abnormal)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[path = "state_tests.rs"]
mod tests;
