//! The bidirectional extension chain contract.
//!
//! Negotiated extensions sit between the driver and the codec: inbound
//! frames pass through [`ExtensionStack::incoming_frame`] on their way to
//! the session, outbound frames through [`ExtensionStack::outgoing_frame`]
//! on their way to the flusher. Extensions may transform, split, merge, or
//! drop frames; the chain's termini are wired once when the connection is
//! assembled.

use std::sync::{Arc, Mutex};

use log::warn;

use crate::{
    codec::{Generator, Parser},
    frame::Frame,
    io::flusher::{BatchMode, WriteCallback, WriteError},
    policy::Policy,
    session::{FrameConsumed, Session},
};

/// A single negotiated extension, as agreed during the upgrade handshake.
///
/// # Examples
///
/// ```
/// use wiresocket::extension::ExtensionConfig;
///
/// let config = ExtensionConfig::parse("permessage-deflate; client_max_window_bits=15");
/// assert_eq!(config.name(), "permessage-deflate");
/// assert_eq!(config.param("client_max_window_bits"), Some("15"));
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExtensionConfig {
    name: String,
    params: Vec<(String, String)>,
}

impl ExtensionConfig {
    /// An extension with no parameters.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
        }
    }

    /// Parse a `Sec-WebSocket-Extensions` list entry of the form
    /// `name; key=value; flag`.
    #[must_use]
    pub fn parse(entry: &str) -> Self {
        let mut parts = entry.split(';').map(str::trim);
        let name = parts.next().unwrap_or_default();
        let mut config = Self::new(name);
        for part in parts.filter(|p| !p.is_empty()) {
            match part.split_once('=') {
                Some((key, value)) => config = config.with_param(key.trim(), value.trim()),
                None => config = config.with_param(part, ""),
            }
        }
        config
    }

    /// Add a parameter.
    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((key.into(), value.into()));
        self
    }

    /// Extension token name.
    #[must_use]
    pub fn name(&self) -> &str { &self.name }

    /// Look up a parameter value.
    #[must_use]
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// All parameters, in declaration order.
    #[must_use]
    pub fn params(&self) -> &[(String, String)] { &self.params }
}

/// Egress terminus of the chain: where fully transformed frames are queued
/// for the transport. Implemented by the frame flusher.
pub trait OutgoingSink: Send + Sync {
    /// Queue a frame for writing.
    fn send_frame(&self, frame: Frame, callback: WriteCallback, mode: BatchMode);
}

/// An ordered, bidirectional pipeline of frame middlewares.
pub trait ExtensionStack: Send + Sync {
    /// Supply the connection policy before any frame flows.
    fn set_policy(&self, _policy: &Policy) {}

    /// Claim reserved header bits on the codec for the negotiated
    /// extensions.
    fn configure_codec(&self, _parser: &mut dyn Parser, _generator: &mut dyn Generator) {}

    /// Wire the ingress terminus.
    fn set_session(&self, session: Arc<dyn Session>);

    /// Wire the egress terminus.
    fn set_outgoing(&self, sink: Arc<dyn OutgoingSink>);

    /// Pass an inbound frame down the chain towards the session.
    fn incoming_frame(&self, frame: Frame, completion: FrameConsumed);

    /// Pass an outbound frame up the chain towards the flusher.
    fn outgoing_frame(&self, frame: Frame, callback: WriteCallback, mode: BatchMode);
}

/// The no-extensions chain: frames pass through unchanged.
#[derive(Default)]
pub struct PassthroughExtensions {
    session: Mutex<Option<Arc<dyn Session>>>,
    outgoing: Mutex<Option<Arc<dyn OutgoingSink>>>,
}

impl PassthroughExtensions {
    /// An empty chain.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    fn session(&self) -> Option<Arc<dyn Session>> {
        self.session
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    fn outgoing(&self) -> Option<Arc<dyn OutgoingSink>> {
        self.outgoing
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

impl ExtensionStack for PassthroughExtensions {
    fn set_session(&self, session: Arc<dyn Session>) {
        *self
            .session
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(session);
    }

    fn set_outgoing(&self, sink: Arc<dyn OutgoingSink>) {
        *self
            .outgoing
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(sink);
    }

    fn incoming_frame(&self, frame: Frame, completion: FrameConsumed) {
        match self.session() {
            Some(session) => session.on_frame(frame, completion),
            None => {
                warn!("incoming frame before a session was wired");
                completion.fail(std::io::Error::other("no session wired"));
            }
        }
    }

    fn outgoing_frame(&self, frame: Frame, callback: WriteCallback, mode: BatchMode) {
        match self.outgoing() {
            Some(sink) => sink.send_frame(frame, callback, mode),
            None => {
                warn!("outgoing frame before a sink was wired");
                callback(Err(WriteError::Closed));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::bare("identity", "identity", &[])]
    #[case::with_params(
        "permessage-deflate; server_no_context_takeover; client_max_window_bits=10",
        "permessage-deflate",
        &[("server_no_context_takeover", ""), ("client_max_window_bits", "10")]
    )]
    fn parses_header_entries(
        #[case] entry: &str,
        #[case] name: &str,
        #[case] params: &[(&str, &str)],
    ) {
        let config = ExtensionConfig::parse(entry);
        assert_eq!(config.name(), name);
        for (key, value) in params {
            assert_eq!(config.param(key), Some(*value));
        }
    }
}
