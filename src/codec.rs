//! Byte⇄frame codec contracts.
//!
//! The driver consumes the codec through two narrow traits: a [`Parser`]
//! turning transport bytes into [`Frame`] values, and a [`Generator`]
//! serialising frames for the flusher. Both are incremental and restartable:
//! the parser buffers partial input internally, so the read pump may hand it
//! bytes split at arbitrary points (and release its network buffer between
//! calls) without losing framing state.
//!
//! # Error Handling
//!
//! Codec failures carry their close semantics: every [`CodecError`] maps to
//! the close status the driver should initiate (protocol violations to 1002,
//! payload errors to 1007, size violations to 1009, explicit close requests
//! to their own code, I/O errors to the abnormal marker 1006).

use bytes::BytesMut;

use crate::frame::Frame;

pub mod error;
pub mod rfc6455;

pub use error::CodecError;
pub use rfc6455::{Rfc6455Generator, Rfc6455Parser};

/// Upper bound on the size of a generated frame header.
///
/// The base RFC 6455 header is at most 14 bytes (flags and length, 64-bit
/// extended length, masking key); the bound leaves headroom for
/// extension-injected framing. This is also the smallest legal network or
/// output buffer size.
pub const MAX_HEADER_LENGTH: usize = 28;

/// Incremental frame parser.
///
/// `parse` consumes everything the caller offers; bytes that do not yet
/// complete a frame are retained inside the parser. Frames are surfaced one
/// at a time so the caller controls delivery pacing.
pub trait Parser: Send {
    /// Consume `buffer` and decode at most one complete frame.
    ///
    /// Returns `Ok(None)` when more bytes are needed. The caller's buffer is
    /// always drained, whether or not a frame completed.
    ///
    /// # Errors
    ///
    /// Returns a [`CodecError`] on malformed framing, limit violations, or a
    /// codec-requested close; the parser must not be reused afterwards.
    fn parse(&mut self, buffer: &mut BytesMut) -> Result<Option<Frame>, CodecError>;

    /// Permit reserved header bits claimed by negotiated extensions.
    fn set_rsv_allowed(&mut self, rsv1: bool, rsv2: bool, rsv3: bool);
}

/// Frame serialiser feeding the flusher's output buffer.
pub trait Generator: Send {
    /// Exact number of header bytes `generate` will emit for `frame`.
    fn header_length(&self, frame: &Frame) -> usize;

    /// Serialise `frame` (header and payload) into `out`.
    ///
    /// Returns the number of bytes written.
    ///
    /// # Errors
    ///
    /// Returns a [`CodecError`] when the frame violates framing rules (for
    /// example an oversized or fragmented control frame).
    fn generate(&mut self, frame: &Frame, out: &mut BytesMut) -> Result<usize, CodecError>;

    /// Permit reserved header bits claimed by negotiated extensions.
    fn set_rsv_allowed(&mut self, rsv1: bool, rsv2: bool, rsv3: bool);
}
