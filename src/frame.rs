//! The WebSocket frame value type shared by the codec, the extension chain,
//! and the driver.
//!
//! A [`Frame`] owns its payload as [`Bytes`], so payload lifetime is tied to
//! the frame value itself: dropping the last clone releases the bytes.

use bytes::Bytes;

/// Frame opcode per RFC 6455 §5.2.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpCode {
    /// Continuation of a fragmented TEXT or BINARY message.
    Continuation,
    /// UTF-8 text payload.
    Text,
    /// Arbitrary binary payload.
    Binary,
    /// Closing-handshake frame.
    Close,
    /// Keep-alive probe.
    Ping,
    /// Keep-alive response.
    Pong,
}

impl OpCode {
    /// Decode a wire opcode nibble. Returns `None` for reserved values.
    #[must_use]
    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            0x0 => Some(Self::Continuation),
            0x1 => Some(Self::Text),
            0x2 => Some(Self::Binary),
            0x8 => Some(Self::Close),
            0x9 => Some(Self::Ping),
            0xA => Some(Self::Pong),
            _ => None,
        }
    }

    /// Wire value of this opcode.
    #[must_use]
    pub fn to_wire(self) -> u8 {
        match self {
            Self::Continuation => 0x0,
            Self::Text => 0x1,
            Self::Binary => 0x2,
            Self::Close => 0x8,
            Self::Ping => 0x9,
            Self::Pong => 0xA,
        }
    }

    /// Whether this opcode designates a control frame.
    #[must_use]
    pub fn is_control(self) -> bool { matches!(self, Self::Close | Self::Ping | Self::Pong) }

    /// Whether this opcode starts a data message.
    #[must_use]
    pub fn is_data(self) -> bool { matches!(self, Self::Text | Self::Binary) }
}

/// A single WebSocket frame.
///
/// # Examples
///
/// ```
/// use wiresocket::frame::{Frame, OpCode};
///
/// let frame = Frame::text("hello");
/// assert_eq!(frame.opcode(), OpCode::Text);
/// assert!(frame.fin());
/// assert_eq!(frame.payload().as_ref(), b"hello");
/// ```
#[derive(Clone, Debug)]
pub struct Frame {
    opcode: OpCode,
    fin: bool,
    rsv1: bool,
    rsv2: bool,
    rsv3: bool,
    payload: Bytes,
}

impl Frame {
    /// Build a frame with the given opcode and payload; FIN set, RSV clear.
    #[must_use]
    pub fn new(opcode: OpCode, payload: Bytes) -> Self {
        Self {
            opcode,
            fin: true,
            rsv1: false,
            rsv2: false,
            rsv3: false,
            payload,
        }
    }

    /// A final TEXT frame.
    #[must_use]
    pub fn text(payload: impl Into<Bytes>) -> Self { Self::new(OpCode::Text, payload.into()) }

    /// A final BINARY frame.
    #[must_use]
    pub fn binary(payload: impl Into<Bytes>) -> Self { Self::new(OpCode::Binary, payload.into()) }

    /// A CLOSE frame carrying an already-encoded status payload.
    #[must_use]
    pub fn close(payload: impl Into<Bytes>) -> Self { Self::new(OpCode::Close, payload.into()) }

    /// A PING frame.
    #[must_use]
    pub fn ping(payload: impl Into<Bytes>) -> Self { Self::new(OpCode::Ping, payload.into()) }

    /// A PONG frame.
    #[must_use]
    pub fn pong(payload: impl Into<Bytes>) -> Self { Self::new(OpCode::Pong, payload.into()) }

    /// Clear or set the FIN bit.
    #[must_use]
    pub fn with_fin(mut self, fin: bool) -> Self {
        self.fin = fin;
        self
    }

    /// Set the reserved bits, as negotiated extensions do.
    #[must_use]
    pub fn with_rsv(mut self, rsv1: bool, rsv2: bool, rsv3: bool) -> Self {
        self.rsv1 = rsv1;
        self.rsv2 = rsv2;
        self.rsv3 = rsv3;
        self
    }

    /// Replace the payload, keeping flags and opcode.
    #[must_use]
    pub fn with_payload(mut self, payload: Bytes) -> Self {
        self.payload = payload;
        self
    }

    /// Frame opcode.
    #[must_use]
    pub fn opcode(&self) -> OpCode { self.opcode }

    /// FIN bit.
    #[must_use]
    pub fn fin(&self) -> bool { self.fin }

    /// RSV1 bit.
    #[must_use]
    pub fn rsv1(&self) -> bool { self.rsv1 }

    /// RSV2 bit.
    #[must_use]
    pub fn rsv2(&self) -> bool { self.rsv2 }

    /// RSV3 bit.
    #[must_use]
    pub fn rsv3(&self) -> bool { self.rsv3 }

    /// Payload bytes.
    #[must_use]
    pub fn payload(&self) -> &Bytes { &self.payload }

    /// Payload length in bytes.
    #[must_use]
    pub fn payload_len(&self) -> usize { self.payload.len() }

    /// Whether this is a control frame.
    #[must_use]
    pub fn is_control(&self) -> bool { self.opcode.is_control() }
}
