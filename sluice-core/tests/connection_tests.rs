//! Integration tests for a single connection against a mock ingestion node.

use sluice_core::*;
use sluice_testing::{ACK, Behavior, MockNode, frame, probe};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::runtime::Handle;
use tokio::time::{sleep, timeout};

const WAIT: Duration = Duration::from_secs(5);

fn connect_to(node: &MockNode, config: ConnectionConfig) -> Connection {
    Connection::builder("127.0.0.1", node.port())
        .config(config)
        .spawn(&Handle::current())
        .unwrap()
}

async fn wait_for(conn: &Connection, status: Status) {
    let mut rx = conn.subscribe();
    timeout(WAIT, rx.wait_for(|s| *s == status))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {status}, still {}", conn.status()))
        .unwrap();
}

async fn resolve(receipt: WriteReceipt) -> WriteResult {
    timeout(WAIT, receipt).await.expect("write never resolved")
}

/// Port with nothing listening on it.
async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

// =============================================================================
// Connect
// =============================================================================

#[tokio::test]
async fn test_connect_becomes_free() {
    let node = MockNode::start(Behavior::Ack).await.unwrap();
    let conn = connect_to(&node, ConnectionConfig::default());

    conn.async_connect();
    wait_for(&conn, Status::Free).await;

    assert!(conn.is_free());
    assert!(conn.client_info().contains(&format!("127.0.0.1:{}", node.port())));
    assert_eq!(conn.stats().connects(), 1);
    assert_eq!(conn.stats().connect_attempts(), 1);
    assert_eq!(node.connections(), 1);
}

#[tokio::test]
async fn test_connect_refused_fails() {
    let port = closed_port().await;
    let conn = Connection::builder("127.0.0.1", port)
        .config(
            ConnectionConfig::builder()
                .retry_interval(Duration::from_millis(50))
                .build()
                .unwrap(),
        )
        .spawn(&Handle::current())
        .unwrap();

    let (write, mut receipt) = PendingWrite::new(frame(b"queued"));
    conn.write(write);
    conn.async_connect();
    wait_for(&conn, Status::ConnectFailed).await;

    let failure = conn.last_failure().unwrap();
    assert_eq!(failure.kind, ErrorKind::Connect);
    assert_eq!(conn.stats().connect_failures(), 1);

    // Queued buffers survive a failed connect.
    assert_eq!(conn.pending_len(), 1);
    assert!(receipt.try_result().is_none());

    sleep(Duration::from_millis(100)).await;
    assert!(conn.is_retry_eligible());
}

#[tokio::test]
async fn test_connect_timeout_fails() {
    // A listener whose backlog is full leaves further connects hanging.
    let socket = TcpSocket::new_v4().unwrap();
    socket.bind("127.0.0.1:0".parse().unwrap()).unwrap();
    let listener = socket.listen(0).unwrap();
    let addr = listener.local_addr().unwrap();
    let _backlog = TcpStream::connect(addr).await.unwrap();

    let conn = Connection::builder("127.0.0.1", addr.port())
        .config(
            ConnectionConfig::builder()
                .connect_timeout(Duration::from_millis(300))
                .build()
                .unwrap(),
        )
        .spawn(&Handle::current())
        .unwrap();

    conn.async_connect();
    wait_for(&conn, Status::ConnectFailed).await;

    let failure = conn.last_failure().unwrap();
    assert_eq!(failure.kind, ErrorKind::Connect);
    assert!(failure.message.contains("timed out"), "{}", failure.message);
    assert_eq!(conn.stats().connect_failures(), 1);
    assert_eq!(conn.stats().connects(), 0);
}

#[tokio::test]
async fn test_connect_from_free_reconnects() {
    let node = MockNode::start(Behavior::Ack).await.unwrap();
    let conn = connect_to(&node, ConnectionConfig::default());
    conn.async_connect();
    wait_for(&conn, Status::Free).await;

    // From Free this reconnects.
    conn.async_connect();
    sleep(Duration::from_millis(100)).await;
    wait_for(&conn, Status::Free).await;
    assert_eq!(conn.stats().connects(), 2);
    assert_eq!(node.connections(), 2);
}

// =============================================================================
// Writes
// =============================================================================

#[tokio::test]
async fn test_write_while_connecting_is_sent_first() {
    let node = MockNode::start(Behavior::Ack).await.unwrap();
    let conn = connect_to(&node, ConnectionConfig::default());

    conn.async_connect();
    let (a, receipt_a) = PendingWrite::new(frame(b"bufA"));
    conn.write(a);

    let delivery = resolve(receipt_a).await.unwrap();
    assert_eq!(delivery.response, Some(frame(ACK)));
    assert_eq!(delivery.bytes_sent, 8);

    let (b, receipt_b) = PendingWrite::new(frame(b"bufB"));
    conn.write(b);
    resolve(receipt_b).await.unwrap();

    assert_eq!(node.received(), vec![&b"bufA"[..], &b"bufB"[..]]);
    wait_for(&conn, Status::Free).await;
    assert_eq!(conn.stats().writes_succeeded(), 2);
}

#[tokio::test]
async fn test_split_response_completes_frame() {
    let node = MockNode::start(Behavior::Split {
        delay: Duration::from_millis(300),
    })
    .await
    .unwrap();
    let conn = connect_to(&node, ConnectionConfig::default());
    conn.async_connect();
    wait_for(&conn, Status::Free).await;

    let (write, mut receipt) = PendingWrite::new(frame(b"split"));
    conn.write(write);

    // First chunk is a partial frame.
    sleep(Duration::from_millis(150)).await;
    assert_eq!(conn.status(), Status::Waiting);
    assert!(receipt.try_result().is_none());

    let delivery = resolve(receipt).await.unwrap();
    assert_eq!(delivery.response, Some(frame(ACK)));
    wait_for(&conn, Status::Free).await;
    assert_eq!(conn.stats().bytes_received(), 6);
}

#[tokio::test]
async fn test_write_error_fails_only_in_flight() {
    // Accepts and immediately drops every connection.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            drop(socket);
        }
    });

    let config = ConnectionConfig::builder()
        .request_timeout(Duration::from_secs(3))
        .build()
        .unwrap();
    let conn = Connection::builder("127.0.0.1", port)
        .config(config)
        .spawn(&Handle::current())
        .unwrap();

    // Larger than any socket buffer, so the reset surfaces during the write.
    let (a, receipt_a) = PendingWrite::new(vec![7u8; 8 * 1024 * 1024]);
    let (b, mut receipt_b) = PendingWrite::new(frame(b"bufB"));
    conn.write(a);
    conn.write(b);
    conn.async_connect();

    let undelivered = resolve(receipt_a).await.unwrap_err();
    assert_eq!(undelivered.kind(), ErrorKind::Write);
    assert_eq!(undelivered.payload.len(), 8 * 1024 * 1024);

    wait_for(&conn, Status::ConnectFailed).await;
    assert_eq!(conn.pending_len(), 1);
    assert!(receipt_b.try_result().is_none());
    assert_eq!(conn.stats().writes_failed(), 1);
}

#[tokio::test]
async fn test_queued_write_sent_after_reconnect() {
    let node = MockNode::start(Behavior::CloseOnFrame).await.unwrap();
    let conn = connect_to(&node, ConnectionConfig::default());
    conn.async_connect();
    wait_for(&conn, Status::Free).await;

    let (a, receipt_a) = PendingWrite::new(frame(b"first"));
    let (b, receipt_b) = PendingWrite::new(frame(b"second"));
    conn.write(a);
    conn.write(b);

    let undelivered = resolve(receipt_a).await.unwrap_err();
    assert_eq!(undelivered.kind(), ErrorKind::Protocol);
    wait_for(&conn, Status::ConnectFailed).await;
    assert_eq!(conn.pending_len(), 1);

    node.set_behavior(Behavior::Ack);
    conn.async_connect();
    let delivery = resolve(receipt_b).await.unwrap();
    assert_eq!(delivery.response, Some(frame(ACK)));
    assert_eq!(node.connections(), 2);
    assert_eq!(node.received().last().unwrap(), &b"second"[..]);
}

#[tokio::test]
async fn test_garbage_response_is_protocol_error() {
    let node = MockNode::start(Behavior::Garbage).await.unwrap();
    let conn = connect_to(&node, ConnectionConfig::default());
    conn.async_connect();

    let (write, receipt) = PendingWrite::new(frame(b"event"));
    conn.write(write);

    let undelivered = resolve(receipt).await.unwrap_err();
    assert_eq!(undelivered.kind(), ErrorKind::Protocol);
    wait_for(&conn, Status::ConnectFailed).await;
    assert_eq!(conn.last_failure().unwrap().kind, ErrorKind::Protocol);
}

#[tokio::test]
async fn test_request_timeout_without_response() {
    let node = MockNode::start(Behavior::Silent).await.unwrap();
    let config = ConnectionConfig::builder()
        .request_timeout(Duration::from_millis(100))
        .build()
        .unwrap();
    let conn = connect_to(&node, config);
    conn.async_connect();

    let (write, receipt) = PendingWrite::new(frame(b"event"));
    conn.write(write);

    let undelivered = resolve(receipt).await.unwrap_err();
    assert_eq!(undelivered.kind(), ErrorKind::Protocol);
    assert!(undelivered.error.to_string().contains("no response"));
    wait_for(&conn, Status::ConnectFailed).await;
}

#[tokio::test]
async fn test_fire_and_forget_writes() {
    let node = MockNode::start(Behavior::Silent).await.unwrap();
    let config = ConnectionConfig::builder()
        .expect_response(false)
        .build()
        .unwrap();
    let conn = connect_to(&node, config);
    conn.async_connect();

    let (write, receipt) = PendingWrite::new(frame(b"event"));
    conn.write(write);

    let delivery = resolve(receipt).await.unwrap();
    assert_eq!(delivery.response, None);
    wait_for(&conn, Status::Free).await;
    assert_eq!(conn.stats().writes_succeeded(), 1);
}

#[tokio::test]
async fn test_per_write_response_override() {
    let node = MockNode::start(Behavior::Silent).await.unwrap();
    let conn = connect_to(&node, ConnectionConfig::default());
    conn.async_connect();

    let (write, receipt) = PendingWrite::new(frame(b"event"));
    conn.write(write.expect_response(false));

    assert_eq!(resolve(receipt).await.unwrap().response, None);
    wait_for(&conn, Status::Free).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_fifo_per_submitter() {
    const PRODUCERS: usize = 4;
    const PER_PRODUCER: usize = 25;

    let node = MockNode::start(Behavior::Ack).await.unwrap();
    let conn = Arc::new(connect_to(&node, ConnectionConfig::default()));
    conn.async_connect();

    let mut tasks = Vec::new();
    for p in 0..PRODUCERS {
        let conn = Arc::clone(&conn);
        tasks.push(tokio::spawn(async move {
            let mut receipts = Vec::new();
            for i in 0..PER_PRODUCER {
                let (write, receipt) = PendingWrite::new(frame(format!("{p}:{i}").as_bytes()));
                conn.write(write);
                receipts.push(receipt);
            }
            for receipt in receipts {
                resolve(receipt).await.unwrap();
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let received = node.received();
    assert_eq!(received.len(), PRODUCERS * PER_PRODUCER);
    for p in 0..PRODUCERS {
        let prefix = format!("{p}:");
        let order: Vec<usize> = received
            .iter()
            .filter_map(|f| std::str::from_utf8(f).ok()?.strip_prefix(&prefix)?.parse().ok())
            .collect();
        assert_eq!(order, (0..PER_PRODUCER).collect::<Vec<_>>());
    }
    assert_eq!(conn.stats().writes_succeeded(), (PRODUCERS * PER_PRODUCER) as u64);
    assert_eq!(conn.stats().writes_failed(), 0);
}

// =============================================================================
// Keep-alive
// =============================================================================

fn idle_config() -> ConnectionConfig {
    ConnectionConfig::builder()
        .idle_time(Duration::from_millis(200))
        .detection_interval(Duration::from_millis(100))
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_unanswered_probe_fails_connection() {
    let node = MockNode::start(Behavior::Silent).await.unwrap();
    let conn = Connection::builder("127.0.0.1", node.port())
        .config(idle_config())
        .codec(LengthPrefixedCodec::default().with_probe(probe()))
        .spawn(&Handle::current())
        .unwrap();
    conn.async_connect();
    wait_for(&conn, Status::Free).await;

    wait_for(&conn, Status::ConnectFailed).await;
    assert_eq!(conn.last_failure().unwrap().kind, ErrorKind::IdleTimeout);
    assert_eq!(node.probes(), 1);
    assert_eq!(conn.stats().probes_sent(), 1);

    // Reported once, not on every tick.
    sleep(Duration::from_millis(400)).await;
    assert_eq!(conn.stats().idle_timeouts(), 1);
    assert_eq!(conn.status(), Status::ConnectFailed);
}

#[tokio::test]
async fn test_answered_probes_keep_connection_free() {
    let node = MockNode::start(Behavior::Ack).await.unwrap();
    node.set_answer_probes(true);
    let conn = Connection::builder("127.0.0.1", node.port())
        .config(idle_config())
        .codec(LengthPrefixedCodec::default().with_probe(probe()))
        .spawn(&Handle::current())
        .unwrap();
    conn.async_connect();
    wait_for(&conn, Status::Free).await;

    sleep(Duration::from_millis(1000)).await;
    assert_eq!(conn.status(), Status::Free);
    assert!(node.probes() >= 2);
    assert_eq!(conn.stats().idle_timeouts(), 0);

    let (write, receipt) = PendingWrite::new(frame(b"after-idle"));
    conn.write(write);
    assert_eq!(resolve(receipt).await.unwrap().response, Some(frame(ACK)));
    assert_eq!(node.connections(), 1);
}

#[tokio::test]
async fn test_idle_without_probe_fails_connection() {
    let node = MockNode::start(Behavior::Ack).await.unwrap();
    let conn = connect_to(&node, idle_config());
    conn.async_connect();
    wait_for(&conn, Status::Free).await;

    wait_for(&conn, Status::ConnectFailed).await;
    assert_eq!(conn.last_failure().unwrap().kind, ErrorKind::IdleTimeout);
    assert_eq!(node.probes(), 0);
}

// =============================================================================
// Close
// =============================================================================

#[tokio::test]
async fn test_double_close_is_noop() {
    let node = MockNode::start(Behavior::Ack).await.unwrap();
    let conn = connect_to(&node, ConnectionConfig::default());
    conn.async_connect();
    wait_for(&conn, Status::Free).await;

    conn.close().await;
    assert_eq!(conn.status(), Status::Stopped);
    let transitions = conn.stats().transitions();

    conn.close().await;
    assert_eq!(conn.status(), Status::Stopped);
    assert_eq!(conn.stats().transitions(), transitions);
    assert_eq!(conn.stats().writes_cancelled(), 0);
}

#[tokio::test]
async fn test_close_cancels_in_flight_and_queued() {
    let node = MockNode::start(Behavior::Silent).await.unwrap();
    let conn = connect_to(&node, ConnectionConfig::default());
    conn.async_connect();

    let (a, receipt_a) = PendingWrite::new(frame(b"in-flight"));
    let (b, receipt_b) = PendingWrite::new(frame(b"queued"));
    conn.write(a);
    conn.write(b);
    wait_for(&conn, Status::Waiting).await;

    conn.close().await;
    assert_eq!(resolve(receipt_a).await.unwrap_err().kind(), ErrorKind::Cancelled);
    assert_eq!(resolve(receipt_b).await.unwrap_err().kind(), ErrorKind::Cancelled);
    assert_eq!(conn.stats().writes_cancelled(), 2);
    assert_eq!(conn.pending_len(), 0);
}

#[tokio::test]
async fn test_drop_cancels_queued_writes() {
    let port = closed_port().await;
    let conn = Connection::new(&Handle::current(), "127.0.0.1", port);
    let (write, receipt) = PendingWrite::new(frame(b"never"));
    conn.write(write);

    drop(conn);
    let undelivered = resolve(receipt).await.unwrap_err();
    assert_eq!(undelivered.kind(), ErrorKind::Cancelled);
    assert_eq!(undelivered.into_payload(), frame(b"never"));
}
