//! Integration tests for cross-crate interactions.
//!
//! Runs complete sender/receiver pairs over the in-memory signaling hub and
//! the TCP signaling server, with real SOCKS5 bytestreams through the local
//! relay and the pairing proxy.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use wisp_core::signal::memory::MemoryHub;
use wisp_core::signal::tcp::{SignalServer, TcpSignaling};
use wisp_core::{
    ErrorKind, FileReceiver, FileSender, LimitsPolicy, NegotiationState, ReceiveReport,
    ReceiveRequest, SendRequest, Session, SessionManager, Signaling, TransferSummary,
};
use wisp_integration_tests::{
    ALICE, BOB, SCENARIO_TIMEOUT, closed_port, local_relay, wait_connected, write_source,
};
use wisp_transport::memory::{ScriptedConnector, pair};
use wisp_transport::{CandidateTrial, DstAddr, ProxyServer, StreamHostCandidate, TransportError};

/// Start a receiver for `BOB` and wait until it is online
async fn spawn_receiver(
    hub: &MemoryHub,
    request: ReceiveRequest,
) -> tokio::task::JoinHandle<wisp_core::Result<ReceiveReport>> {
    let receiver = FileReceiver::new(request, Arc::new(hub.endpoint(BOB)));
    let handle = tokio::spawn(receiver.run());
    wait_connected(hub, BOB).await;
    handle
}

async fn run_sender(hub: &MemoryHub, request: SendRequest) -> wisp_core::Result<Session> {
    tokio::time::timeout(
        SCENARIO_TIMEOUT,
        FileSender::new(request, Arc::new(hub.endpoint(ALICE))).run(),
    )
    .await
    .expect("sender timed out")
}

fn assert_same_file(a: &Path, b: &Path) {
    assert_eq!(std::fs::read(a).unwrap(), std::fs::read(b).unwrap());
}

// ============================================================================
// End-to-end transfers
// ============================================================================

#[tokio::test]
async fn test_hello_over_local_relay() {
    let src = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    let hub = MemoryHub::new();

    let mut receive = ReceiveRequest::new(out.path());
    receive.max_transfers = Some(1);
    let receiver = spawn_receiver(&hub, receive).await;

    let mut request = SendRequest::new(write_source(&src, "a.txt", b"hello"), BOB);
    request.relay = Some(local_relay());

    let session = run_sender(&hub, request).await.unwrap();
    assert!(session.succeeded(), "sender failed: {:?}", session.error());
    assert_eq!(session.state(), NegotiationState::Closed);
    assert!(session.error().is_none());
    assert_eq!(session.offer().file_size, 5);

    let report = tokio::time::timeout(SCENARIO_TIMEOUT, receiver)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(report.completed, 1);
    assert!(report.is_clean());
    assert_eq!(std::fs::read(out.path().join("a.txt")).unwrap(), b"hello");
}

#[tokio::test]
async fn test_transfer_through_proxy() {
    let src = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    let hub = MemoryHub::new();

    let proxy = Arc::new(ProxyServer::bind("127.0.0.1:0".parse().unwrap()).await.unwrap());
    let proxy_addr = proxy.local_addr();
    let proxy_task = {
        let proxy = Arc::clone(&proxy);
        tokio::spawn(async move { proxy.run().await })
    };

    let mut receive = ReceiveRequest::new(out.path());
    receive.max_transfers = Some(1);
    let receiver = spawn_receiver(&hub, receive).await;

    let contents: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
    let source = write_source(&src, "data.bin", &contents);
    let mut request = SendRequest::new(&source, BOB);
    request.proxies.push(StreamHostCandidate::new(
        "proxy.example.org",
        "127.0.0.1",
        proxy_addr.port(),
    ));

    let session = run_sender(&hub, request).await.unwrap();
    assert!(session.succeeded(), "sender failed: {:?}", session.error());

    let report = receiver.await.unwrap().unwrap();
    assert_eq!(report.completed, 1);
    assert_same_file(&source, &out.path().join("data.bin"));

    proxy_task.abort();
}

#[tokio::test]
async fn test_transfer_over_tcp_signaling() {
    let src = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();

    let accounts = HashMap::from([
        ("alice@example.org".to_string(), "alice-pw".to_string()),
        ("bob@example.org".to_string(), "bob-pw".to_string()),
    ]);
    let server = Arc::new(
        SignalServer::bind("127.0.0.1:0".parse().unwrap(), accounts)
            .await
            .unwrap(),
    );
    let server_addr: SocketAddr = server.local_addr();
    let server_task = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.run().await })
    };

    let mut receive = ReceiveRequest::new(out.path());
    receive.max_transfers = Some(1);
    let bob = Arc::new(TcpSignaling::new(
        server_addr.to_string(),
        BOB,
        Some("bob-pw".to_string()),
    ));
    let receiver = tokio::spawn(FileReceiver::new(receive, bob).run());

    tokio::time::timeout(SCENARIO_TIMEOUT, async {
        while server.connected_count() < 1 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    let contents: Vec<u8> = (0..300_000u32).map(|i| (i.wrapping_mul(7) % 256) as u8).collect();
    let source = write_source(&src, "report.pdf", &contents);
    let mut request = SendRequest::new(&source, BOB);
    request.relay = Some(local_relay());
    request.mime_type = Some("application/pdf".to_string());

    let alice = Arc::new(TcpSignaling::new(
        server_addr.to_string(),
        ALICE,
        Some("alice-pw".to_string()),
    ));
    let session = tokio::time::timeout(SCENARIO_TIMEOUT, FileSender::new(request, alice).run())
        .await
        .unwrap()
        .unwrap();
    assert!(session.succeeded(), "sender failed: {:?}", session.error());

    let report = tokio::time::timeout(SCENARIO_TIMEOUT, receiver)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(report.completed, 1);
    assert_same_file(&source, &out.path().join("report.pdf"));

    server_task.abort();
}

// ============================================================================
// Negotiation failures
// ============================================================================

#[tokio::test]
async fn test_empty_candidates_is_offer_invalid() {
    let src = TempDir::new().unwrap();
    let hub = MemoryHub::new();

    let request = SendRequest::new(write_source(&src, "a.txt", b"hello"), BOB);
    let err = run_sender(&hub, request).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::OfferInvalid);
    assert!(!hub.is_connected(ALICE));
}

#[tokio::test]
async fn test_both_candidates_fail() {
    let src = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    let hub = MemoryHub::new();

    let mut receive = ReceiveRequest::new(out.path());
    receive.max_transfers = Some(1);
    let receiver = spawn_receiver(&hub, receive).await;

    let mut request = SendRequest::new(write_source(&src, "a.txt", b"hello"), BOB);
    request.proxies = vec![
        StreamHostCandidate::new("first.example.org", "127.0.0.1", closed_port()),
        StreamHostCandidate::new("second.example.org", "127.0.0.1", closed_port()),
    ];

    let session = run_sender(&hub, request).await.unwrap();
    assert!(!session.succeeded());
    assert_eq!(session.error().unwrap().kind(), ErrorKind::NoUsableCandidate);

    let report = receiver.await.unwrap().unwrap();
    assert_eq!(report.failed, 1);
    assert!(!out.path().join("a.txt").exists());
}

#[tokio::test]
async fn test_trial_reports_every_attempt_in_order() {
    let connector = Arc::new(ScriptedConnector::new());
    connector.fail("first.example.org", "connection refused");
    connector.fail("second.example.org", "host unreachable");

    let candidates = vec![
        StreamHostCandidate::new("first.example.org", "10.0.0.1", 7777),
        StreamHostCandidate::new("second.example.org", "10.0.0.2", 7777),
    ];
    let dst = DstAddr::derive("sid-1", ALICE, BOB);
    let trial = CandidateTrial::new(candidates, dst, connector.clone());

    let err = trial.run().await.err().unwrap();
    match err {
        TransportError::NoUsableCandidate { attempts } => assert_eq!(attempts.len(), 2),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(
        connector.attempts().await,
        vec!["first.example.org", "second.example.org"]
    );
}

#[tokio::test]
async fn test_policy_rejection_reaches_sender() {
    let src = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    let hub = MemoryHub::new();
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();

    let mut receive = ReceiveRequest::new(out.path());
    receive.policy = Arc::new(LimitsPolicy {
        max_file_size: Some(4),
        allowed_senders: Vec::new(),
    });
    let receiver = FileReceiver::new(receive, Arc::new(hub.endpoint(BOB))).with_shutdown(async move {
        let _ = stop_rx.await;
    });
    let receiver = tokio::spawn(receiver.run());
    wait_connected(&hub, BOB).await;

    let mut request = SendRequest::new(write_source(&src, "a.txt", b"hello"), BOB);
    request.relay = Some(local_relay());

    let session = run_sender(&hub, request).await.unwrap();
    assert_eq!(session.state(), NegotiationState::Rejected);
    assert_eq!(
        session.error().unwrap().kind(),
        ErrorKind::NegotiationRejected
    );

    stop_tx.send(()).unwrap();
    let report = receiver.await.unwrap().unwrap();
    assert_eq!(report.rejected, 1);
    assert_eq!(report.completed, 0);
    assert!(report.is_clean());
}

#[tokio::test]
async fn test_receiver_disconnect_fails_sender() {
    let src = TempDir::new().unwrap();
    let hub = MemoryHub::new();

    // A peer that never answers, then vanishes
    let silent = hub.endpoint(BOB);
    let (silent_tx, _silent_rx) = wisp_core::event::channel();
    silent.connect(silent_tx).await.unwrap();

    let mut request = SendRequest::new(write_source(&src, "a.txt", b"hello"), BOB);
    request.relay = Some(local_relay());
    let sender = tokio::spawn(FileSender::new(request, Arc::new(hub.endpoint(ALICE))).run());
    wait_connected(&hub, ALICE).await;

    hub.drop_peer(ALICE);

    let result = tokio::time::timeout(SCENARIO_TIMEOUT, sender)
        .await
        .unwrap()
        .unwrap();
    let session = result.unwrap();
    assert_eq!(session.error().unwrap().kind(), ErrorKind::ConnectionLost);
}

// ============================================================================
// Session manager
// ============================================================================

#[tokio::test]
async fn test_concurrent_workers_each_report_once() {
    const WORKERS: usize = 32;

    let (events_tx, mut events_rx) = wisp_core::event::channel();
    let manager = SessionManager::new(events_tx);
    let start = Arc::new(tokio::sync::Barrier::new(WORKERS));

    let mut sids = Vec::with_capacity(WORKERS);
    for _ in 0..WORKERS {
        let sid = wisp_core::SessionId::generate();
        let (transport, _peer) = pair(None);
        let start = Arc::clone(&start);
        let work_sid = sid.clone();
        manager
            .create_task(sid.clone(), Arc::new(transport), async move {
                start.wait().await;
                Ok(TransferSummary {
                    sid: work_sid,
                    bytes: 0,
                    path: PathBuf::new(),
                })
            })
            .unwrap();
        sids.push(sid);
    }

    let mut finished = Vec::with_capacity(WORKERS);
    while finished.len() < WORKERS {
        let event = tokio::time::timeout(SCENARIO_TIMEOUT, events_rx.recv())
            .await
            .unwrap()
            .unwrap();
        if let wisp_core::Event::TaskFinished(completion) = event {
            assert!(completion.result.is_ok());
            finished.push(completion.sid);
        }
    }

    finished.sort();
    sids.sort();
    assert_eq!(finished, sids);
    assert_eq!(manager.task_count(), 0);
    assert!(events_rx.try_recv().is_err());
}

#[tokio::test]
async fn test_shutdown_waits_for_in_flight_workers() {
    let (events_tx, _events_rx) = wisp_core::event::channel();
    let manager = SessionManager::new(events_tx);
    let done = Arc::new(std::sync::atomic::AtomicUsize::new(0));

    for _ in 0..4 {
        let sid = wisp_core::SessionId::generate();
        let (transport, _peer) = pair(None);
        let done = Arc::clone(&done);
        let work_sid = sid.clone();
        manager
            .create_task(sid, Arc::new(transport), async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                done.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Ok(TransferSummary {
                    sid: work_sid,
                    bytes: 0,
                    path: PathBuf::new(),
                })
            })
            .unwrap();
    }

    manager.shutdown().await;
    assert_eq!(done.load(std::sync::atomic::Ordering::SeqCst), 4);
    assert_eq!(manager.task_count(), 0);

    let (transport, _peer) = pair(None);
    let err = manager
        .create_task(wisp_core::SessionId::generate(), Arc::new(transport), async {
            Err(wisp_core::Error::Internal("never runs".into()))
        })
        .unwrap_err();
    assert!(matches!(err, wisp_core::Error::ShuttingDown));
}
