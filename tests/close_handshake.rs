//! Closing-handshake scenarios: local initiation, remote initiation, write
//! failures, and disconnect idempotence.

mod common;

use common::{open_connection, peer_close, written_frames};
use wiresocket::{
    BatchMode, ConnectionState, WriteError,
    close::status,
    frame::{Frame, OpCode},
    testing::EndpointEvent,
};

fn close_payload(code: u16, reason: &str) -> Vec<u8> {
    let mut payload = code.to_be_bytes().to_vec();
    payload.extend_from_slice(reason.as_bytes());
    payload
}

#[test]
fn clean_local_close_walks_the_handshake() {
    let harness = open_connection();
    let state = harness.connection.io_state();

    harness.connection.close_with(status::NORMAL, "bye");
    let frames = written_frames(&harness.endpoint.written());
    assert_eq!(
        frames,
        vec![(OpCode::Close, close_payload(status::NORMAL, "bye"))]
    );
    assert_eq!(state.connection_state(), ConnectionState::Closing);
    assert!(state.was_local_close_initiated());
    assert!(!harness.connection.is_open());

    // the peer answers our close
    harness
        .endpoint
        .push_fill(peer_close(status::NORMAL, "bye"));
    harness.endpoint.notify_readable();

    assert_eq!(state.connection_state(), ConnectionState::Closed);
    assert!(!state.was_abnormal_close());
    assert!(harness.endpoint.is_output_shutdown());
    assert!(harness.endpoint.is_closed());
}

#[test]
fn repeated_close_sends_exactly_one_frame() {
    let harness = open_connection();
    harness.connection.close_with(status::NORMAL, "bye");
    harness.connection.close_with(status::NORMAL, "again");
    harness.connection.close();

    let frames = written_frames(&harness.endpoint.written());
    assert_eq!(frames.len(), 1, "exactly one CLOSE frame per connection");
}

#[test]
fn remote_close_is_replied_and_output_shut_down_first() {
    let harness = open_connection();
    let state = harness.connection.io_state();

    harness
        .endpoint
        .push_fill(peer_close(status::SHUTDOWN, "going away"));
    harness.endpoint.notify_readable();

    assert!(state.was_remote_close_initiated());
    assert_eq!(state.connection_state(), ConnectionState::Closed);
    assert!(!state.was_abnormal_close());

    // the reply mirrors the peer's close info
    let frames = written_frames(&harness.endpoint.written());
    assert_eq!(
        frames,
        vec![(OpCode::Close, close_payload(status::SHUTDOWN, "going away"))]
    );

    // the session saw the peer's CLOSE frame
    let delivered = harness.session.frames();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].opcode(), OpCode::Close);

    // output shutdown strictly precedes the full close
    let events = harness.endpoint.events();
    let shutdown_at = events
        .iter()
        .position(|event| *event == EndpointEvent::ShutdownOutput)
        .expect("output shutdown");
    let close_at = events
        .iter()
        .position(|event| *event == EndpointEvent::Close)
        .expect("transport close");
    assert!(shutdown_at < close_at);
}

#[test]
fn write_failure_during_close_disconnects_abnormally() {
    let harness = open_connection();
    let state = harness.connection.io_state();

    harness
        .endpoint
        .push_flush_error(std::io::Error::other("pipe burst"));
    harness.connection.close_with(status::NORMAL, "bye");

    assert_eq!(state.connection_state(), ConnectionState::Closed);
    assert!(state.was_abnormal_close());
    assert_eq!(state.io_failure().as_deref(), Some("write failed: pipe burst"));
    assert!(harness.endpoint.is_closed());
    assert!(!harness.session.errors().is_empty());

    // later writes fail immediately
    let failed = std::sync::Arc::new(std::sync::Mutex::new(None));
    let sink = std::sync::Arc::clone(&failed);
    harness.connection.outgoing_frame(
        Frame::text("late"),
        Box::new(move |result| {
            *sink.lock().expect("lock") = Some(result);
        }),
        BatchMode::Auto,
    );
    let outcome = failed.lock().expect("lock").take().expect("callback ran");
    assert!(matches!(outcome, Err(WriteError::Closed | WriteError::Io(_))));
}

#[test]
fn read_eof_attempts_best_effort_close_then_disconnects() {
    let harness = open_connection();
    let state = harness.connection.io_state();

    harness.endpoint.push_eof();
    harness.endpoint.notify_readable();

    assert_eq!(state.connection_state(), ConnectionState::Closed);
    assert!(state.was_abnormal_close());

    // one best-effort CLOSE frame with the going-away status went out
    let frames = written_frames(&harness.endpoint.written());
    assert_eq!(frames.len(), 1);
    let (opcode, payload) = &frames[0];
    assert_eq!(*opcode, OpCode::Close);
    assert_eq!(
        u16::from_be_bytes([payload[0], payload[1]]),
        status::SHUTDOWN
    );
    assert!(harness.endpoint.is_output_shutdown());
    assert!(harness.endpoint.is_closed());
}

#[test]
fn disconnect_is_idempotent() {
    let harness = open_connection();
    harness.connection.disconnect();
    harness.connection.disconnect();
    harness.connection.disconnect();

    let events = harness.endpoint.events();
    let closes = events
        .iter()
        .filter(|event| **event == EndpointEvent::Close)
        .count();
    let shutdowns = events
        .iter()
        .filter(|event| **event == EndpointEvent::ShutdownOutput)
        .count();
    assert_eq!(closes, 1, "exactly one transport close");
    assert_eq!(shutdowns, 1, "exactly one output shutdown");
}
