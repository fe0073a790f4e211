//! Close-handshake status codes and the [`CloseInfo`] record.
//!
//! `CloseInfo` captures the `(status code, reason)` pair carried by a CLOSE
//! frame, together with the classification the lifecycle state machine
//! relies on. Reasons are bounded to 123 bytes of UTF-8 so the encoded
//! payload fits a control frame.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::frame::Frame;

/// WebSocket close status codes emitted or interpreted by the driver.
pub mod status {
    /// Normal closure.
    pub const NORMAL: u16 = 1000;
    /// Endpoint is going away (also used for idle timeout).
    pub const SHUTDOWN: u16 = 1001;
    /// Protocol violation.
    pub const PROTOCOL: u16 = 1002;
    /// Unacceptable data type.
    pub const BAD_DATA: u16 = 1003;
    /// No status code present in the CLOSE frame. Never sent on the wire.
    pub const NO_CODE: u16 = 1005;
    /// Connection closed without a CLOSE frame. Never sent on the wire.
    pub const NO_CLOSE: u16 = 1006;
    /// Synonym for [`NO_CLOSE`]: abnormal termination marker.
    pub const ABNORMAL: u16 = 1006;
    /// Payload inconsistent with the message type (e.g. invalid UTF-8).
    pub const BAD_PAYLOAD: u16 = 1007;
    /// Policy violation.
    pub const POLICY_VIOLATION: u16 = 1008;
    /// Message too large to process.
    pub const MESSAGE_TOO_LARGE: u16 = 1009;
    /// Client required extensions the server did not negotiate.
    pub const REQUIRED_EXTENSION: u16 = 1010;
    /// Server encountered an unexpected condition.
    pub const SERVER_ERROR: u16 = 1011;
    /// TLS handshake failure marker. Never sent on the wire.
    pub const FAILED_TLS_HANDSHAKE: u16 = 1015;

    /// Whether `code` may appear in a CLOSE frame on the wire.
    #[must_use]
    pub fn is_transmittable(code: u16) -> bool {
        matches!(code, 1000..=1003 | 1007..=1014 | 3000..=4999)
    }
}

/// Maximum reason length in bytes: control payload (125) minus the status code.
pub const MAX_REASON_LENGTH: usize = 123;

/// Errors decoding a CLOSE frame payload.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ClosePayloadError {
    /// Payload of exactly one byte: a code needs two.
    #[error("close payload of 1 byte cannot carry a status code")]
    TruncatedCode,
    /// Status code outside the transmittable ranges.
    #[error("invalid close status code {code}")]
    InvalidCode {
        /// The offending code.
        code: u16,
    },
    /// Reason bytes are not valid UTF-8.
    #[error("close reason is not valid UTF-8")]
    InvalidReason,
}

/// The `(status code, reason)` pair of a close handshake.
///
/// # Examples
///
/// ```
/// use wiresocket::close::{CloseInfo, status};
///
/// let close = CloseInfo::new(status::NORMAL, "bye");
/// assert_eq!(close.code(), 1000);
/// assert_eq!(close.reason(), Some("bye"));
/// assert!(!close.is_abnormal());
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CloseInfo {
    code: u16,
    reason: Option<String>,
}

impl CloseInfo {
    /// Build a close record, truncating the reason to [`MAX_REASON_LENGTH`]
    /// bytes on a character boundary.
    #[must_use]
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        let mut reason: String = reason.into();
        if reason.len() > MAX_REASON_LENGTH {
            let mut cut = MAX_REASON_LENGTH;
            while !reason.is_char_boundary(cut) {
                cut -= 1;
            }
            reason.truncate(cut);
        }
        let reason = (!reason.is_empty()).then_some(reason);
        Self { code, reason }
    }

    /// A close without status code or reason.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            code: status::NO_CODE,
            reason: None,
        }
    }

    /// Decode the payload of a received CLOSE frame.
    ///
    /// An empty payload decodes to [`CloseInfo::empty`].
    ///
    /// # Errors
    ///
    /// Returns a [`ClosePayloadError`] for a one-byte payload, a
    /// non-transmittable status code, or a reason that is not UTF-8.
    pub fn from_payload(payload: &[u8]) -> Result<Self, ClosePayloadError> {
        match payload {
            [] => Ok(Self::empty()),
            [_] => Err(ClosePayloadError::TruncatedCode),
            [hi, lo, reason @ ..] => {
                let code = u16::from_be_bytes([*hi, *lo]);
                if !status::is_transmittable(code) {
                    return Err(ClosePayloadError::InvalidCode { code });
                }
                let reason = std::str::from_utf8(reason)
                    .map_err(|_| ClosePayloadError::InvalidReason)?;
                Ok(Self::new(code, reason))
            }
        }
    }

    /// Status code.
    #[must_use]
    pub fn code(&self) -> u16 { self.code }

    /// Optional reason text.
    #[must_use]
    pub fn reason(&self) -> Option<&str> { self.reason.as_deref() }

    /// Whether this close counts as abnormal termination.
    ///
    /// Covers the markers that never appear on the wire (1005, 1006, 1015).
    /// Status 1001 is a normal close: idle timeouts walk the ordinary
    /// closing handshake.
    #[must_use]
    pub fn is_abnormal(&self) -> bool {
        matches!(
            self.code,
            status::NO_CODE | status::NO_CLOSE | status::FAILED_TLS_HANDSHAKE
        )
    }

    /// Materialise the CLOSE frame for this record.
    ///
    /// A [`CloseInfo::empty`] record produces an empty payload; otherwise
    /// the payload is the two-byte code followed by the reason bytes.
    #[must_use]
    pub fn to_frame(&self) -> Frame {
        if self.code == status::NO_CODE && self.reason.is_none() {
            return Frame::close(Bytes::new());
        }
        let reason = self.reason.as_deref().unwrap_or("");
        let mut payload = BytesMut::with_capacity(2 + reason.len());
        payload.put_u16(self.code);
        payload.put_slice(reason.as_bytes());
        Frame::close(payload.freeze())
    }
}

impl std::fmt::Display for CloseInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.reason {
            Some(reason) => write!(f, "{}:{reason}", self.code),
            None => write!(f, "{}", self.code),
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::frame::OpCode;

    #[rstest]
    #[case::normal(status::NORMAL, false)]
    #[case::going_away(status::SHUTDOWN, false)]
    #[case::protocol(status::PROTOCOL, false)]
    #[case::no_code(status::NO_CODE, true)]
    #[case::no_close(status::NO_CLOSE, true)]
    #[case::failed_tls(status::FAILED_TLS_HANDSHAKE, true)]
    fn abnormal_classification(#[case] code: u16, #[case] abnormal: bool) {
        assert_eq!(CloseInfo::new(code, "").is_abnormal(), abnormal);
    }

    #[test]
    fn reason_is_truncated_on_char_boundary() {
        // 62 two-byte characters encode to 124 bytes; truncation must not
        // split the last character.
        let reason: String = "é".repeat(62);
        let close = CloseInfo::new(status::NORMAL, reason);
        let kept = close.reason().unwrap();
        assert_eq!(kept.len(), 122);
        assert_eq!(kept.chars().count(), 61);
    }

    #[test]
    fn frame_payload_layout() {
        let frame = CloseInfo::new(status::NORMAL, "bye").to_frame();
        assert_eq!(frame.opcode(), OpCode::Close);
        assert_eq!(frame.payload().as_ref(), &[0x03, 0xE8, b'b', b'y', b'e']);
    }

    #[test]
    fn empty_close_has_empty_payload() {
        let frame = CloseInfo::empty().to_frame();
        assert!(frame.payload().is_empty());
    }

    #[rstest]
    #[case::empty(&[][..], Ok(CloseInfo::empty()))]
    #[case::one_byte(&[0x03][..], Err(ClosePayloadError::TruncatedCode))]
    #[case::normal(&[0x03, 0xE8][..], Ok(CloseInfo::new(1000, "")))]
    #[case::with_reason(&[0x03, 0xE9, b'h', b'i'][..], Ok(CloseInfo::new(1001, "hi")))]
    #[case::reserved(&[0x03, 0xEC][..], Err(ClosePayloadError::InvalidCode { code: 1004 }))]
    #[case::bad_utf8(&[0x03, 0xE8, 0xFF][..], Err(ClosePayloadError::InvalidReason))]
    fn payload_round_trip(
        #[case] payload: &[u8],
        #[case] expected: Result<CloseInfo, ClosePayloadError>,
    ) {
        assert_eq!(CloseInfo::from_payload(payload), expected);
    }
}
