//! Incremental RFC 6455 frame parser and generator.
//!
//! The parser accumulates input internally and surfaces one frame per call,
//! so callers may deliver bytes split at arbitrary boundaries and discard
//! their own buffers between calls. Validation follows RFC 6455 §5: reserved
//! opcodes and bits, control-frame rules, masking discipline per endpoint
//! behaviour, CLOSE payload structure, and the policy's frame and message
//! size limits.

use bytes::{Buf, BufMut, BytesMut};

use super::{CodecError, Generator, Parser};
use crate::{
    close::{CloseInfo, ClosePayloadError},
    frame::{Frame, OpCode},
    policy::{Behaviour, Policy},
};

/// Largest payload a control frame may carry (RFC 6455 §5.5).
const MAX_CONTROL_PAYLOAD: usize = 125;

fn apply_mask(key: [u8; 4], data: &mut [u8]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

/// Incremental RFC 6455 parser.
#[derive(Debug)]
pub struct Rfc6455Parser {
    behaviour: Behaviour,
    max_frame_size: usize,
    max_message_size: usize,
    rsv_allowed: [bool; 3],
    buffer: BytesMut,
    // fragmented data message in progress, and its accumulated size
    in_message: bool,
    message_size: usize,
}

impl Rfc6455Parser {
    /// Build a parser with the limits and behaviour of `policy`.
    #[must_use]
    pub fn new(policy: &Policy) -> Self {
        Self {
            behaviour: policy.behaviour(),
            max_frame_size: policy.max_frame_size(),
            max_message_size: policy.max_message_size(),
            rsv_allowed: [false; 3],
            buffer: BytesMut::new(),
            in_message: false,
            message_size: 0,
        }
    }

    /// Number of bytes buffered awaiting a complete frame.
    #[must_use]
    pub fn buffered(&self) -> usize { self.buffer.len() }

    fn decode(&mut self) -> Result<Option<Frame>, CodecError> {
        let buf = &self.buffer;
        if buf.len() < 2 {
            return Ok(None);
        }

        let b0 = buf[0];
        let b1 = buf[1];
        let fin = b0 & 0x80 != 0;
        let rsv = [b0 & 0x40 != 0, b0 & 0x20 != 0, b0 & 0x10 != 0];
        let opcode = OpCode::from_wire(b0 & 0x0F)
            .ok_or_else(|| CodecError::Protocol(format!("reserved opcode {:#x}", b0 & 0x0F)))?;

        for (i, set) in rsv.iter().enumerate() {
            if *set && !self.rsv_allowed[i] {
                return Err(CodecError::Protocol(format!(
                    "RSV{} set without a negotiated extension",
                    i + 1
                )));
            }
        }

        let masked = b1 & 0x80 != 0;
        match self.behaviour {
            Behaviour::Server if !masked => {
                return Err(CodecError::Protocol(
                    "client frame is not masked".to_owned(),
                ));
            }
            Behaviour::Client if masked => {
                return Err(CodecError::Protocol("server frame is masked".to_owned()));
            }
            _ => {}
        }

        let len7 = usize::from(b1 & 0x7F);
        let (length_bytes, payload_len) = match len7 {
            126 => {
                if buf.len() < 4 {
                    return Ok(None);
                }
                (2, usize::from(u16::from_be_bytes([buf[2], buf[3]])))
            }
            127 => {
                if buf.len() < 10 {
                    return Ok(None);
                }
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&buf[2..10]);
                let len = u64::from_be_bytes(raw);
                if len & (1 << 63) != 0 {
                    return Err(CodecError::Protocol(
                        "most significant length bit set".to_owned(),
                    ));
                }
                let len = usize::try_from(len).map_err(|_| CodecError::MessageTooLarge {
                    size: usize::MAX,
                    max: self.max_frame_size,
                })?;
                (8, len)
            }
            n => (0, n),
        };

        if opcode.is_control() {
            if !fin {
                return Err(CodecError::Protocol(
                    "fragmented control frame".to_owned(),
                ));
            }
            if payload_len > MAX_CONTROL_PAYLOAD {
                return Err(CodecError::Protocol(format!(
                    "control frame payload of {payload_len} bytes exceeds {MAX_CONTROL_PAYLOAD}"
                )));
            }
        } else if payload_len > self.max_frame_size {
            return Err(CodecError::MessageTooLarge {
                size: payload_len,
                max: self.max_frame_size,
            });
        }

        let header_len = 2 + length_bytes + if masked { 4 } else { 0 };
        if buf.len() < header_len + payload_len {
            return Ok(None);
        }

        self.buffer.advance(2 + length_bytes);
        let mask = masked.then(|| {
            let mut key = [0u8; 4];
            key.copy_from_slice(&self.buffer[..4]);
            self.buffer.advance(4);
            key
        });

        let mut payload = self.buffer.split_to(payload_len);
        if let Some(key) = mask {
            apply_mask(key, &mut payload);
        }
        let payload = payload.freeze();

        self.track_message(opcode, fin, payload.len())?;
        if opcode == OpCode::Close {
            validate_close_payload(&payload)?;
        }

        Ok(Some(
            Frame::new(opcode, payload)
                .with_fin(fin)
                .with_rsv(rsv[0], rsv[1], rsv[2]),
        ))
    }

    fn track_message(&mut self, opcode: OpCode, fin: bool, len: usize) -> Result<(), CodecError> {
        match opcode {
            OpCode::Continuation => {
                if !self.in_message {
                    return Err(CodecError::Protocol(
                        "continuation frame outside a message".to_owned(),
                    ));
                }
                self.message_size += len;
            }
            op if op.is_data() => {
                if self.in_message {
                    return Err(CodecError::Protocol(
                        "data frame while a fragmented message is in progress".to_owned(),
                    ));
                }
                self.message_size = len;
            }
            // control frames are permitted between fragments
            _ => return Ok(()),
        }

        if self.message_size > self.max_message_size {
            return Err(CodecError::MessageTooLarge {
                size: self.message_size,
                max: self.max_message_size,
            });
        }

        self.in_message = !fin;
        if fin {
            self.message_size = 0;
        }
        Ok(())
    }
}

fn validate_close_payload(payload: &[u8]) -> Result<(), CodecError> {
    match CloseInfo::from_payload(payload) {
        Ok(_) => Ok(()),
        Err(err @ ClosePayloadError::InvalidReason) => Err(CodecError::BadPayload(err.to_string())),
        Err(err) => Err(CodecError::Protocol(err.to_string())),
    }
}

impl Parser for Rfc6455Parser {
    fn parse(&mut self, buffer: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
        if !buffer.is_empty() {
            self.buffer.extend_from_slice(buffer);
            buffer.clear();
        }
        self.decode()
    }

    fn set_rsv_allowed(&mut self, rsv1: bool, rsv2: bool, rsv3: bool) {
        self.rsv_allowed = [rsv1, rsv2, rsv3];
    }
}

/// RFC 6455 frame serialiser.
///
/// Client-behaviour generators mask every frame with a fresh random key;
/// server-behaviour generators emit unmasked frames.
#[derive(Debug)]
pub struct Rfc6455Generator {
    behaviour: Behaviour,
    rsv_allowed: [bool; 3],
}

impl Rfc6455Generator {
    /// Build a generator with the behaviour of `policy`.
    #[must_use]
    pub fn new(policy: &Policy) -> Self {
        Self {
            behaviour: policy.behaviour(),
            rsv_allowed: [false; 3],
        }
    }

    fn length_bytes(payload_len: usize) -> usize {
        if payload_len < 126 {
            0
        } else if payload_len <= usize::from(u16::MAX) {
            2
        } else {
            8
        }
    }

    fn validate(&self, frame: &Frame) -> Result<(), CodecError> {
        if frame.is_control() {
            if !frame.fin() {
                return Err(CodecError::Protocol(
                    "fragmented control frame".to_owned(),
                ));
            }
            if frame.payload_len() > MAX_CONTROL_PAYLOAD {
                return Err(CodecError::Protocol(format!(
                    "control frame payload of {} bytes exceeds {MAX_CONTROL_PAYLOAD}",
                    frame.payload_len()
                )));
            }
        }
        let rsv = [frame.rsv1(), frame.rsv2(), frame.rsv3()];
        for (i, set) in rsv.iter().enumerate() {
            if *set && !self.rsv_allowed[i] {
                return Err(CodecError::Protocol(format!(
                    "RSV{} set without a negotiated extension",
                    i + 1
                )));
            }
        }
        Ok(())
    }
}

impl Generator for Rfc6455Generator {
    fn header_length(&self, frame: &Frame) -> usize {
        let mask = if self.behaviour == Behaviour::Client { 4 } else { 0 };
        2 + Self::length_bytes(frame.payload_len()) + mask
    }

    fn generate(&mut self, frame: &Frame, out: &mut BytesMut) -> Result<usize, CodecError> {
        self.validate(frame)?;

        let payload = frame.payload();
        let start = out.len();
        out.reserve(self.header_length(frame) + payload.len());

        let mut b0 = frame.opcode().to_wire();
        if frame.fin() {
            b0 |= 0x80;
        }
        if frame.rsv1() {
            b0 |= 0x40;
        }
        if frame.rsv2() {
            b0 |= 0x20;
        }
        if frame.rsv3() {
            b0 |= 0x10;
        }
        out.put_u8(b0);

        let masked = self.behaviour == Behaviour::Client;
        let mask_bit = if masked { 0x80 } else { 0x00 };
        match payload.len() {
            n if n < 126 => {
                #[allow(clippy::cast_possible_truncation)]
                out.put_u8(mask_bit | n as u8);
            }
            n if n <= usize::from(u16::MAX) => {
                out.put_u8(mask_bit | 126);
                #[allow(clippy::cast_possible_truncation)]
                out.put_u16(n as u16);
            }
            n => {
                out.put_u8(mask_bit | 127);
                out.put_u64(n as u64);
            }
        }

        if masked {
            let mut key = [0u8; 4];
            getrandom::fill(&mut key).map_err(|e| CodecError::Io(std::io::Error::other(e)))?;
            out.put_slice(&key);
            let masked_start = out.len();
            out.put_slice(payload);
            apply_mask(key, &mut out[masked_start..]);
        } else {
            out.put_slice(payload);
        }

        Ok(out.len() - start)
    }

    fn set_rsv_allowed(&mut self, rsv1: bool, rsv2: bool, rsv3: bool) {
        self.rsv_allowed = [rsv1, rsv2, rsv3];
    }
}

#[cfg(test)]
#[path = "rfc6455_tests.rs"]
mod tests;
