use std::sync::Arc;
use std::time::{Duration, Instant};

use connectusb_lib::serial::stream::{StreamError, TokioDelivery};
use connectusb_lib::testing::{usb_device, LoopbackHost, RecordingSink};
use connectusb_lib::{BridgeConfig, SessionManager, SessionState, StreamEvent, StreamState};

const WAIT: Duration = Duration::from_secs(2);

fn setup() -> (Arc<LoopbackHost>, SessionManager) {
    let host = Arc::new(LoopbackHost::new(vec![usb_device("A80", 12216, 8661, 7)]));
    let config = BridgeConfig { read_timeout_ms: 10, read_buffer_size: 64, ..BridgeConfig::default() };
    let manager = SessionManager::new(host.clone(), config);
    (host, manager)
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    false
}

#[test]
fn streamed_reads_reach_the_subscriber() {
    let (host, manager) = setup();
    let sink = Arc::new(RecordingSink::new());
    manager.subscribe(sink.clone());
    manager.connect().unwrap();

    let info = manager.start_streaming().unwrap();
    assert_eq!(info.buffer_size, 64);
    assert_eq!(info.read_timeout_ms, 10);
    assert_eq!(manager.stream_state(), StreamState::Running);

    manager.send(b"ping").unwrap();
    host.bus().inject(b"-pong");
    assert_eq!(sink.wait_for_data(9, WAIT), b"ping-pong");

    assert!(wait_until(|| {
        let metrics = manager.metrics().borrow().clone();
        metrics.delivered == metrics.chunks_read
    }));
    let metrics = manager.metrics().borrow().clone();
    assert_eq!(metrics.bytes_read, 9);
    assert_eq!(metrics.dropped, 0);
}

#[test]
fn second_start_is_rejected_and_single_reader_remains() {
    let (host, manager) = setup();
    manager.connect().unwrap();
    manager.start_streaming().unwrap();

    let err = manager.start_streaming().unwrap_err();
    assert!(matches!(err, StreamError::AlreadyRunning), "got {:?}", err);
    assert_eq!(err.code(), "ALREADY_STREAMING");

    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(host.bus().max_concurrent_reads(), 1);
    assert_eq!(host.bus().live_links(), 2);
}

#[test]
fn stop_streaming_is_idempotent() {
    let (host, manager) = setup();
    manager.stop_streaming();

    manager.connect().unwrap();
    manager.start_streaming().unwrap();
    manager.stop_streaming();
    manager.stop_streaming();

    assert_eq!(manager.stream_state(), StreamState::Idle);
    assert_eq!(manager.session_state(), SessionState::Open);
    assert_eq!(host.bus().live_links(), 1);

    // the stream can be restarted on the same session
    manager.start_streaming().unwrap();
    assert_eq!(manager.stream_state(), StreamState::Running);
}

#[test]
fn disconnect_stops_reader_before_closing_port() {
    let (host, manager) = setup();
    manager.connect().unwrap();
    manager.start_streaming().unwrap();

    manager.disconnect().unwrap();
    assert_eq!(manager.stream_state(), StreamState::Idle);
    assert_eq!(manager.session_state(), SessionState::Closed);

    let trace = host.bus().trace();
    let released = trace.iter().position(|e| e == "reader released").unwrap();
    let close = trace.iter().position(|e| e == "close").unwrap();
    assert!(released < close, "trace: {:?}", trace);
    assert_eq!(host.bus().live_links(), 0);
}

#[test]
fn start_without_session_does_not_connect() {
    let (host, manager) = setup();
    let err = manager.start_streaming().unwrap_err();
    assert!(matches!(err, StreamError::NotConnected));
    assert_eq!(host.open_attempts(), 0);
    assert_eq!(manager.stream_state(), StreamState::Idle);
}

#[test]
fn reads_without_subscriber_are_dropped() {
    let (host, manager) = setup();
    let mut diagnostics = manager.diagnostics();
    manager.connect().unwrap();
    manager.start_streaming().unwrap();

    host.bus().inject(b"lost");
    assert!(wait_until(|| manager.metrics().borrow().dropped >= 1));
    assert!(host.bus().wait_until_drained(WAIT));
    assert!(wait_until(|| diagnostics.try_recv().is_ok()));

    // a late subscriber only sees reads that happen after it attached
    let sink = Arc::new(RecordingSink::new());
    manager.subscribe(sink.clone());
    host.bus().inject(b"kept");
    assert_eq!(sink.wait_for_data(4, WAIT), b"kept");

    manager.unsubscribe();
    host.bus().inject(b"gone");
    assert!(host.bus().wait_until_drained(WAIT));
    assert!(wait_until(|| manager.metrics().borrow().dropped >= 2));
    assert_eq!(sink.data(), b"kept");
}

#[test]
fn read_fault_terminates_stream_and_closes_session() {
    let (host, manager) = setup();
    let sink = Arc::new(RecordingSink::new());
    manager.subscribe(sink.clone());
    manager.connect().unwrap();
    manager.start_streaming().unwrap();

    host.bus().fail_reads(true);
    assert!(wait_until(|| sink.events().iter().any(|e| matches!(e, StreamEvent::Terminated { .. }))));
    assert!(wait_until(|| manager.session_state() == SessionState::Closed));

    assert_eq!(manager.stream_state(), StreamState::Idle);
    assert!(manager.connected_device().is_none());
    assert!(manager.metrics().borrow().last_error.is_some());
    assert!(host.bus().trace().iter().any(|e| e == "close"));

    // next send reconnects
    host.bus().fail_reads(false);
    manager.send(b"AT").unwrap();
    assert_eq!(host.open_attempts(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn tokio_delivery_preserves_read_order() {
    let host = Arc::new(LoopbackHost::new(vec![usb_device("A80", 12216, 8661, 7)]));
    let config = BridgeConfig { read_timeout_ms: 10, read_buffer_size: 4, ..BridgeConfig::default() };
    let delivery = TokioDelivery::spawn(&tokio::runtime::Handle::current());
    let manager = SessionManager::new(host.clone(), config).with_delivery(Arc::new(delivery));

    let sink = Arc::new(RecordingSink::new());
    manager.subscribe(sink.clone());
    manager.connect().unwrap();
    manager.start_streaming().unwrap();

    let payload: Vec<u8> = (0u8..64).collect();
    host.bus().inject(&payload);

    let sink_clone = sink.clone();
    let received = tokio::task::spawn_blocking(move || sink_clone.wait_for_data(64, WAIT)).await.unwrap();
    assert_eq!(received, payload);
    assert!(sink.events().iter().all(|e| match e {
        StreamEvent::Data { bytes } => bytes.len() <= 4,
        StreamEvent::Terminated { .. } => false,
    }));

    tokio::task::spawn_blocking(move || manager.disconnect()).await.unwrap().unwrap();
}
