//! Connection configuration.
//!
//! A [`Policy`] is fixed for the lifetime of a connection. It selects the
//! endpoint behaviour (client or server), sizes the network and output
//! buffers, and carries the limits consumed by the frame codec.

use std::time::Duration;

use thiserror::Error;

use crate::codec::MAX_HEADER_LENGTH;

/// Which side of the WebSocket handshake this endpoint plays.
///
/// Client endpoints mask the frames they generate and expect unmasked
/// frames from the peer; server endpoints do the opposite.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Behaviour {
    /// Connection initiated by this endpoint.
    Client,
    /// Connection accepted by this endpoint.
    Server,
}

impl std::fmt::Display for Behaviour {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Client => f.write_str("client"),
            Self::Server => f.write_str("server"),
        }
    }
}

/// Errors raised while building or adjusting a [`Policy`].
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum PolicyError {
    /// A buffer size fell below the minimum the frame generator requires.
    #[error("input buffer size {size} below minimum {min}")]
    InputBufferTooSmall {
        /// Requested buffer size.
        size: usize,
        /// Minimum acceptable size ([`MAX_HEADER_LENGTH`]).
        min: usize,
    },

    /// A size option that must be non-zero was zero.
    #[error("{field} must be non-zero")]
    ZeroSize {
        /// Name of the offending option.
        field: &'static str,
    },
}

/// Read-only configuration for a single connection.
///
/// # Examples
///
/// ```
/// use wiresocket::policy::{Behaviour, Policy};
///
/// let policy = Policy::server()
///     .with_input_buffer_size(8192)
///     .expect("valid size");
/// assert_eq!(policy.behaviour(), Behaviour::Server);
/// assert_eq!(policy.input_buffer_size(), 8192);
/// ```
#[derive(Clone, Debug)]
pub struct Policy {
    behaviour: Behaviour,
    input_buffer_size: usize,
    output_buffer_size: usize,
    idle_timeout: Duration,
    max_frame_size: usize,
    max_message_size: usize,
}

/// Default network read buffer size in bytes.
pub const DEFAULT_INPUT_BUFFER_SIZE: usize = 4 * 1024;

/// Default aggregated write buffer size in bytes.
pub const DEFAULT_OUTPUT_BUFFER_SIZE: usize = 32 * 1024;

/// Default idle timeout before the transport reports a read timeout.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Default upper bound for a single frame's payload.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024;

/// Default upper bound for a whole (possibly fragmented) message.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024;

impl Policy {
    fn new(behaviour: Behaviour) -> Self {
        Self {
            behaviour,
            input_buffer_size: DEFAULT_INPUT_BUFFER_SIZE,
            output_buffer_size: DEFAULT_OUTPUT_BUFFER_SIZE,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }

    /// Policy for an accepted (server-side) connection.
    #[must_use]
    pub fn server() -> Self { Self::new(Behaviour::Server) }

    /// Policy for an initiated (client-side) connection.
    #[must_use]
    pub fn client() -> Self { Self::new(Behaviour::Client) }

    /// Replace the network read buffer size.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::InputBufferTooSmall`] when `size` is smaller
    /// than the largest frame header the generator can emit.
    pub fn with_input_buffer_size(mut self, size: usize) -> Result<Self, PolicyError> {
        if size < MAX_HEADER_LENGTH {
            return Err(PolicyError::InputBufferTooSmall {
                size,
                min: MAX_HEADER_LENGTH,
            });
        }
        self.input_buffer_size = size;
        Ok(self)
    }

    /// Replace the aggregated write buffer size.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::InputBufferTooSmall`] when `size` could not
    /// hold a single generated frame header.
    pub fn with_output_buffer_size(mut self, size: usize) -> Result<Self, PolicyError> {
        if size < MAX_HEADER_LENGTH {
            return Err(PolicyError::InputBufferTooSmall {
                size,
                min: MAX_HEADER_LENGTH,
            });
        }
        self.output_buffer_size = size;
        Ok(self)
    }

    /// Replace the idle timeout forwarded to the transport.
    #[must_use]
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Replace the single-frame payload limit.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::ZeroSize`] when `size` is zero.
    pub fn with_max_frame_size(mut self, size: usize) -> Result<Self, PolicyError> {
        if size == 0 {
            return Err(PolicyError::ZeroSize {
                field: "max_frame_size",
            });
        }
        self.max_frame_size = size;
        Ok(self)
    }

    /// Replace the whole-message payload limit.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::ZeroSize`] when `size` is zero.
    pub fn with_max_message_size(mut self, size: usize) -> Result<Self, PolicyError> {
        if size == 0 {
            return Err(PolicyError::ZeroSize {
                field: "max_message_size",
            });
        }
        self.max_message_size = size;
        Ok(self)
    }

    /// Endpoint behaviour selected at construction.
    #[must_use]
    pub fn behaviour(&self) -> Behaviour { self.behaviour }

    /// Network read buffer size in bytes.
    #[must_use]
    pub fn input_buffer_size(&self) -> usize { self.input_buffer_size }

    /// Aggregated write buffer size in bytes.
    #[must_use]
    pub fn output_buffer_size(&self) -> usize { self.output_buffer_size }

    /// Idle timeout forwarded to the transport.
    #[must_use]
    pub fn idle_timeout(&self) -> Duration { self.idle_timeout }

    /// Single-frame payload limit in bytes.
    #[must_use]
    pub fn max_frame_size(&self) -> usize { self.max_frame_size }

    /// Whole-message payload limit in bytes.
    #[must_use]
    pub fn max_message_size(&self) -> usize { self.max_message_size }
}
