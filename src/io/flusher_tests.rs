//! Unit tests for the frame flusher.

use std::sync::{Arc, Mutex};

use rstest::{fixture, rstest};

use super::*;
use crate::{
    buffer::RecyclingBufferPool,
    codec::Rfc6455Generator,
    executor::Executor,
    frame::Frame,
    policy::Policy,
    testing::{DeferredExecutor, EndpointEvent, InlineExecutor, MockEndpoint, RejectingExecutor},
};

type Outcomes = Arc<Mutex<Vec<(&'static str, Result<(), WriteError>)>>>;

struct Harness {
    endpoint: Arc<MockEndpoint>,
    flusher: Arc<FrameFlusher>,
    outcomes: Outcomes,
    failures: Arc<Mutex<Vec<String>>>,
}

impl Harness {
    fn with_buffer_size(buffer_size: usize) -> Self {
        Self::build(buffer_size, Arc::new(InlineExecutor))
    }

    fn build(buffer_size: usize, executor: Arc<dyn Executor>) -> Self {
        let endpoint = Arc::new(MockEndpoint::new());
        let failures: Arc<Mutex<Vec<String>>> = Arc::default();
        let failure_sink = Arc::clone(&failures);
        let flusher = FrameFlusher::new(
            Arc::clone(&endpoint) as Arc<dyn crate::endpoint::Endpoint>,
            Arc::new(RecyclingBufferPool::default()),
            executor,
            Box::new(Rfc6455Generator::new(&Policy::server())),
            buffer_size,
            Box::new(move |error| {
                failure_sink.lock().expect("lock").push(error.to_string());
            }),
        );
        Self {
            endpoint,
            flusher,
            outcomes: Arc::default(),
            failures,
        }
    }

    fn callback(&self, label: &'static str) -> WriteCallback {
        let outcomes = Arc::clone(&self.outcomes);
        Box::new(move |result| outcomes.lock().expect("lock").push((label, result)))
    }

    fn enqueue(&self, label: &'static str, frame: Frame, mode: BatchMode) {
        self.flusher.enqueue(frame, self.callback(label), mode);
    }

    fn labels(&self) -> Vec<(&'static str, bool)> {
        self.outcomes
            .lock()
            .expect("lock")
            .iter()
            .map(|(label, result)| (*label, result.is_ok()))
            .collect()
    }

    fn flushed_sizes(&self) -> Vec<usize> {
        self.endpoint
            .events()
            .into_iter()
            .filter_map(|event| match event {
                EndpointEvent::Flushed(n) => Some(n),
                _ => None,
            })
            .collect()
    }
}

#[fixture]
fn harness() -> Harness { Harness::with_buffer_size(4096) }

#[rstest]
fn single_frame_is_written_and_succeeds(harness: Harness) {
    harness.enqueue("a", Frame::text("hello"), BatchMode::Auto);
    assert_eq!(harness.endpoint.written().as_ref(), b"\x81\x05hello");
    assert_eq!(harness.labels(), vec![("a", true)]);
    assert!(harness.flusher.is_idle());
}

#[rstest]
fn parked_flusher_resumes_and_preserves_callback_order(harness: Harness) {
    // accept only 2 bytes of the first frame, then park
    harness.endpoint.push_partial_flush(2);
    harness.enqueue("a", Frame::text("aaaa"), BatchMode::Auto);
    assert!(harness.endpoint.has_write_waker());
    assert_eq!(harness.labels(), Vec::new(), "no callback before full write");

    harness.enqueue("b", Frame::text("bbbb"), BatchMode::Auto);
    harness.enqueue("c", Frame::text("cccc"), BatchMode::Auto);

    harness.endpoint.notify_writable();
    assert_eq!(
        harness.labels(),
        vec![("a", true), ("b", true), ("c", true)]
    );
    assert_eq!(
        harness.endpoint.written().as_ref(),
        b"\x81\x04aaaa\x81\x04bbbb\x81\x04cccc"
    );
    assert!(harness.flusher.is_idle());
}

#[rstest]
fn batch_off_forces_flush_boundary(harness: Harness) {
    harness.endpoint.push_partial_flush(0);
    harness.enqueue("a", Frame::text("aa"), BatchMode::On);
    harness.enqueue("b", Frame::text("bb"), BatchMode::Off);
    harness.enqueue("c", Frame::text("cc"), BatchMode::On);

    harness.endpoint.notify_writable();
    // first write carries a+b (OFF ends the batch), second carries c
    assert_eq!(harness.flushed_sizes(), vec![0, 8, 4]);
    assert_eq!(
        harness.labels(),
        vec![("a", true), ("b", true), ("c", true)]
    );
}

#[rstest]
fn auto_control_frame_is_not_delayed(harness: Harness) {
    harness.endpoint.push_partial_flush(0);
    harness.enqueue("a", Frame::text("aa"), BatchMode::On);
    harness.enqueue("ping", Frame::ping("p"), BatchMode::Auto);
    harness.enqueue("c", Frame::text("cc"), BatchMode::On);

    harness.endpoint.notify_writable();
    // the AUTO ping terminates the first batch
    assert_eq!(harness.flushed_sizes(), vec![0, 4 + 3, 4]);
    assert_eq!(
        harness.labels(),
        vec![("a", true), ("ping", true), ("c", true)]
    );
}

#[test]
fn overflowing_frame_starts_a_new_buffer() {
    let harness = Harness::with_buffer_size(64);
    harness.endpoint.push_partial_flush(0);
    harness.enqueue("a", Frame::binary(vec![0u8; 40]), BatchMode::On);
    harness.enqueue("b", Frame::binary(vec![1u8; 40]), BatchMode::On);

    harness.endpoint.notify_writable();
    // 42 bytes fit the 64-byte buffer; the next 42 would overflow it
    assert_eq!(harness.flushed_sizes(), vec![0, 42, 42]);
    assert_eq!(harness.labels(), vec![("a", true), ("b", true)]);
}

#[rstest]
fn write_failure_fails_everything_in_order(harness: Harness) {
    harness.endpoint.push_partial_flush(0);
    harness.enqueue("a", Frame::text("aa"), BatchMode::Auto);
    harness.enqueue("b", Frame::text("bb"), BatchMode::Auto);
    harness
        .endpoint
        .push_flush_error(std::io::Error::other("pipe burst"));

    harness.endpoint.notify_writable();
    assert_eq!(harness.labels(), vec![("a", false), ("b", false)]);
    assert_eq!(harness.failures.lock().expect("lock").len(), 1);

    // the flusher stays failed: later enqueues are rejected immediately
    harness.enqueue("late", Frame::text("x"), BatchMode::Auto);
    let outcomes = harness.outcomes.lock().expect("lock");
    let (label, result) = outcomes.last().expect("outcome");
    assert_eq!(*label, "late");
    assert!(matches!(result, Err(WriteError::Io(_))));
}

#[rstest]
fn close_fails_pending_with_closed(harness: Harness) {
    harness.endpoint.push_partial_flush(0);
    harness.enqueue("a", Frame::text("aa"), BatchMode::Auto);
    harness.enqueue("b", Frame::text("bb"), BatchMode::Auto);

    harness.flusher.close();
    harness.flusher.close(); // idempotent
    let outcomes = harness.outcomes.lock().expect("lock");
    assert_eq!(outcomes.len(), 2);
    for (_, result) in outcomes.iter() {
        assert!(matches!(result, Err(WriteError::Closed)));
    }
    drop(outcomes);

    harness.enqueue("late", Frame::text("x"), BatchMode::Auto);
    let outcomes = harness.outcomes.lock().expect("lock");
    assert!(matches!(
        outcomes.last().expect("outcome").1,
        Err(WriteError::Closed)
    ));
    // close is not a write failure
    assert!(harness.failures.lock().expect("lock").is_empty());
}

#[rstest]
fn generation_failure_fails_the_flusher(harness: Harness) {
    harness.enqueue("big-ping", Frame::ping(vec![0u8; 200]), BatchMode::Auto);
    let outcomes = harness.outcomes.lock().expect("lock");
    assert!(matches!(
        outcomes.first().expect("outcome").1,
        Err(WriteError::Generate(_))
    ));
    drop(outcomes);
    assert_eq!(harness.failures.lock().expect("lock").len(), 1);
}

#[test]
fn writability_resume_runs_through_the_executor() {
    let executor = Arc::new(DeferredExecutor::new());
    let harness = Harness::build(4096, Arc::clone(&executor) as Arc<dyn Executor>);
    harness.endpoint.push_partial_flush(0);
    harness.enqueue("a", Frame::text("aa"), BatchMode::Auto);

    harness.endpoint.notify_writable();
    // the continuation is a task, not an inline call
    assert_eq!(executor.pending(), 1);
    assert_eq!(harness.labels(), Vec::new());

    executor.run_all();
    assert_eq!(harness.labels(), vec![("a", true)]);
}

#[test]
fn rejected_continuation_is_dropped() {
    let harness = Harness::build(4096, Arc::new(RejectingExecutor));
    harness.endpoint.push_partial_flush(0);
    harness.enqueue("a", Frame::text("aa"), BatchMode::Auto);

    harness.endpoint.notify_writable();
    // best effort: the frame is neither written nor resolved...
    assert_eq!(harness.labels(), Vec::new());
    assert_eq!(harness.flushed_sizes(), vec![0]);

    // ...until teardown fails it
    harness.flusher.close();
    assert_eq!(harness.labels(), vec![("a", false)]);
}

#[rstest]
fn wakeup_after_close_is_ignored(harness: Harness) {
    harness.endpoint.push_partial_flush(0);
    harness.enqueue("a", Frame::text("aa"), BatchMode::Auto);
    assert!(harness.endpoint.has_write_waker());

    harness.flusher.close();
    harness.endpoint.notify_writable();
    // nothing further was written
    assert_eq!(harness.flushed_sizes(), vec![0]);
}
