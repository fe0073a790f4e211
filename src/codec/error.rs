//! Error taxonomy for the codec layer.
//!
//! Every variant knows the close status the driver should initiate, so the
//! read pump can translate a failed parse into the right closing handshake
//! without inspecting variant internals.

use std::io;

use thiserror::Error;

use crate::close::{CloseInfo, status};

/// Failures raised by the frame parser or generator.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Malformed framing or a semantic protocol violation.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Payload inconsistent with its frame type (e.g. invalid UTF-8 in a
    /// CLOSE reason).
    #[error("bad payload: {0}")]
    BadPayload(String),

    /// A frame or message exceeded a configured limit.
    #[error("message too large: {size} > {max}")]
    MessageTooLarge {
        /// Observed size in bytes.
        size: usize,
        /// Configured limit in bytes.
        max: usize,
    },

    /// The codec requests closing the connection with a specific status.
    #[error("close requested ({code}): {reason}")]
    Close {
        /// Close status to send to the peer.
        code: u16,
        /// Human-readable reason.
        reason: String,
    },

    /// Transport-level failure surfaced through the codec.
    #[error("I/O failure in codec: {0}")]
    Io(#[from] io::Error),
}

impl CodecError {
    /// The close status the driver should initiate for this failure.
    #[must_use]
    pub fn close_code(&self) -> u16 {
        match self {
            Self::Protocol(_) => status::PROTOCOL,
            Self::BadPayload(_) => status::BAD_PAYLOAD,
            Self::MessageTooLarge { .. } => status::MESSAGE_TOO_LARGE,
            Self::Close { code, .. } => *code,
            Self::Io(_) => status::ABNORMAL,
        }
    }

    /// The [`CloseInfo`] the driver should initiate for this failure.
    #[must_use]
    pub fn close_info(&self) -> CloseInfo { CloseInfo::new(self.close_code(), self.to_string()) }
}
