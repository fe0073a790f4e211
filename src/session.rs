//! The upward-facing session contract and the per-frame completion handle.
//!
//! The driver delivers parsed frames to a [`Session`] one at a time; the
//! session acknowledges each through a [`FrameConsumed`] handle. Until the
//! handle is resolved, the read pump stays paused, which is how application
//! processing exerts backpressure frame by frame.

use std::io;

use log::warn;

use crate::frame::Frame;

/// One-shot acknowledgement for a delivered frame.
///
/// Resolving the handle (from any thread) lets the read pump continue.
/// Dropping it unresolved counts as failure so a lost acknowledgement cannot
/// stall the connection silently.
pub struct FrameConsumed {
    complete: Option<Box<dyn FnOnce(Result<(), io::Error>) + Send>>,
}

impl FrameConsumed {
    /// Wrap a completion function. Intended for the driver and for extension
    /// stacks that interpose on frame completion.
    #[must_use]
    pub fn new(complete: impl FnOnce(Result<(), io::Error>) + Send + 'static) -> Self {
        Self {
            complete: Some(Box::new(complete)),
        }
    }

    /// The frame was fully consumed.
    pub fn succeed(mut self) {
        if let Some(complete) = self.complete.take() {
            complete(Ok(()));
        }
    }

    /// Frame processing failed.
    pub fn fail(mut self, error: io::Error) {
        if let Some(complete) = self.complete.take() {
            complete(Err(error));
        }
    }
}

impl Drop for FrameConsumed {
    fn drop(&mut self) {
        if let Some(complete) = self.complete.take() {
            warn!("frame completion dropped without being resolved");
            complete(Err(io::Error::other("frame completion dropped")));
        }
    }
}

impl std::fmt::Debug for FrameConsumed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameConsumed")
            .field("resolved", &self.complete.is_none())
            .finish()
    }
}

/// Consumer of inbound frames and connection-level errors.
///
/// Frames arrive in wire order; a new frame is only delivered once the
/// previous [`FrameConsumed`] has been resolved.
pub trait Session: Send + Sync {
    /// A complete frame arrived. Resolve `completion` when done with it.
    fn on_frame(&self, frame: Frame, completion: FrameConsumed);

    /// A connection-level error occurred (transport failure, rejected write,
    /// idle timeout). Informational; lifecycle handling stays in the driver.
    fn on_error(&self, _error: &(dyn std::error::Error + 'static)) {}
}
