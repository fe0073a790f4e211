//! Shared utilities for integration tests.
//!
//! Builds a server-behaviour [`Connection`] around the scriptable mock
//! endpoint and provides encoders for the masked client frames a peer would
//! send. These helpers reduce duplication across test modules.
#![allow(dead_code, reason = "each test binary uses a subset of the helpers")]

use std::sync::Arc;

use wiresocket::{
    Connection, Endpoint, Policy, Session,
    buffer::RecyclingBufferPool,
    codec::{Rfc6455Generator, Rfc6455Parser},
    extension::PassthroughExtensions,
    frame::OpCode,
    testing::{CollectingSession, InlineExecutor, MockEndpoint},
};

/// Masking key used for every synthetic peer frame.
pub const PEER_MASK: [u8; 4] = [0x01, 0x02, 0x03, 0x04];

/// A driver wired to fully scriptable collaborators.
pub struct TestConnection {
    pub connection: Arc<Connection>,
    pub endpoint: Arc<MockEndpoint>,
    pub session: Arc<CollectingSession>,
}

/// Build an unopened server-behaviour connection with the given session.
#[must_use]
pub fn connect_with_session(session: CollectingSession) -> TestConnection {
    let policy = Policy::server();
    let endpoint = Arc::new(MockEndpoint::new());
    let session = Arc::new(session);
    let connection = Connection::new(
        Arc::clone(&endpoint) as Arc<dyn Endpoint>,
        Arc::new(InlineExecutor),
        Arc::new(RecyclingBufferPool::default()),
        Arc::new(PassthroughExtensions::new()),
        Arc::clone(&session) as Arc<dyn Session>,
        Box::new(Rfc6455Parser::new(&policy)),
        Box::new(Rfc6455Generator::new(&policy)),
        policy,
    );
    TestConnection {
        connection,
        endpoint,
        session,
    }
}

/// Build and open a server-behaviour connection.
#[must_use]
pub fn open_connection() -> TestConnection {
    let harness = connect_with_session(CollectingSession::new());
    harness.connection.open();
    harness
}

/// Encode a masked peer frame as a client would send it.
#[must_use]
pub fn peer_frame(opcode: OpCode, payload: &[u8]) -> Vec<u8> {
    assert!(payload.len() < 126, "helper only builds short frames");
    #[allow(clippy::cast_possible_truncation)]
    let mut wire = vec![0x80 | opcode.to_wire(), 0x80 | payload.len() as u8];
    wire.extend_from_slice(&PEER_MASK);
    wire.extend(
        payload
            .iter()
            .enumerate()
            .map(|(i, byte)| byte ^ PEER_MASK[i % 4]),
    );
    wire
}

/// Encode a masked peer CLOSE frame carrying `code` and `reason`.
#[must_use]
pub fn peer_close(code: u16, reason: &str) -> Vec<u8> {
    let mut payload = code.to_be_bytes().to_vec();
    payload.extend_from_slice(reason.as_bytes());
    peer_frame(OpCode::Close, &payload)
}

/// Decode the unmasked frames the driver wrote to the transport.
#[must_use]
pub fn written_frames(bytes: &[u8]) -> Vec<(OpCode, Vec<u8>)> {
    let mut frames = Vec::new();
    let mut rest = bytes;
    while rest.len() >= 2 {
        let opcode = OpCode::from_wire(rest[0] & 0x0F).expect("valid opcode");
        let len = usize::from(rest[1] & 0x7F);
        assert!(rest[1] & 0x80 == 0, "server frames are unmasked");
        assert!(len < 126, "helper only decodes short frames");
        frames.push((opcode, rest[2..2 + len].to_vec()));
        rest = &rest[2 + len..];
    }
    assert!(rest.is_empty(), "trailing partial frame in written bytes");
    frames
}
