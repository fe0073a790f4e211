//! The duplex byte-transport contract the driver runs against.
//!
//! An [`Endpoint`] is a non-blocking transport: `fill` and `flush` never
//! wait, and readiness is delivered through the registered
//! [`EndpointListener`]. The Tokio-backed adapter lives in [`tcp`]; tests
//! script a mock endpoint instead.

use std::{io, net::SocketAddr, sync::Weak, time::Duration};

use bytes::BytesMut;

pub mod tcp;

/// Outcome of a non-blocking read.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fill {
    /// `n` bytes were appended to the buffer.
    Bytes(usize),
    /// No bytes are available right now; register interest and wait.
    Empty,
    /// The peer closed its writing half.
    Eof,
}

/// Receiver of transport events, registered once per connection.
pub trait EndpointListener: Send + Sync {
    /// Bytes may be available after a [`Endpoint::fill_interested`] arm.
    fn on_readable(&self);

    /// No I/O occurred within the idle timeout. Returns `true` when the
    /// timeout was absorbed and the transport need not act on it.
    fn on_read_timeout(&self) -> bool;

    /// The transport has fully closed.
    fn on_closed(&self);
}

/// A non-blocking duplex byte transport.
pub trait Endpoint: Send + Sync {
    /// Append available bytes to `buffer` without blocking.
    ///
    /// # Errors
    ///
    /// Returns the underlying transport error; the connection is then torn
    /// down abnormally.
    fn fill(&self, buffer: &mut BytesMut) -> io::Result<Fill>;

    /// Write from the front of `buffer` without blocking, consuming what was
    /// accepted. Returns `true` when the buffer was fully written.
    ///
    /// # Errors
    ///
    /// Returns the underlying transport error; pending writes are then
    /// failed.
    fn flush(&self, buffer: &mut BytesMut) -> io::Result<bool>;

    /// Arm a one-shot read-readiness notification delivered through
    /// [`EndpointListener::on_readable`].
    fn fill_interested(&self);

    /// Arm a one-shot write-readiness wakeup for a parked flusher.
    fn flush_interested(&self, wakeup: Box<dyn FnOnce() + Send>);

    /// Shut down the writing half, leaving reads open.
    fn shutdown_output(&self);

    /// Fully close the transport.
    fn close(&self);

    /// Forward the idle timeout after which
    /// [`EndpointListener::on_read_timeout`] fires.
    fn set_idle_timeout(&self, timeout: Duration);

    /// Install the event listener. Called once, before any readiness arm.
    fn register(&self, listener: Weak<dyn EndpointListener>);

    /// Local socket address.
    fn local_address(&self) -> SocketAddr;

    /// Remote socket address.
    fn remote_address(&self) -> SocketAddr;
}
