//! Tunnel session lifecycle against the reference relay

mod common;

use common::*;
use iap_auth::StaticAuthorizer;
use iap_transport::{ReconnectConfig, RelayError};
use iap_tunnel::{PumpEnd, TunnelError, TunnelSession, TunnelState};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

/// Range the OS hands out for port 0 binds
fn ephemeral_port_range() -> (u16, u16) {
    std::fs::read_to_string("/proc/sys/net/ipv4/ip_local_port_range")
        .ok()
        .and_then(|range| {
            let mut bounds = range.split_whitespace().map(|n| n.parse::<u16>());
            match (bounds.next(), bounds.next()) {
                (Some(Ok(low)), Some(Ok(high))) => Some((low, high)),
                _ => None,
            }
        })
        // IANA dynamic range, used by macOS and Windows
        .unwrap_or((49152, 65535))
}

#[tokio::test]
async fn test_create_is_listening_on_ephemeral_port() {
    init_logging();
    let relay = start_relay(None).await;

    let tunnel = TunnelSession::create(target(), anonymous(), tunnel_config(&relay))
        .await
        .unwrap();

    assert_eq!(tunnel.state(), TunnelState::Listening);
    let (low, high) = ephemeral_port_range();
    assert!(
        (low..=high).contains(&tunnel.local_port()),
        "port {} outside {}..={}",
        tunnel.local_port(),
        low,
        high
    );
    assert!(tunnel.local_addr().ip().is_loopback());
    assert_eq!(tunnel.endpoint().unwrap(), tunnel.local_addr());
    assert_eq!(tunnel.target(), &target());

    tunnel.close().await;
    assert_eq!(tunnel.state(), TunnelState::Closed);
}

#[tokio::test]
async fn test_echo_byte_for_byte() {
    init_logging();
    let relay = start_relay(None).await;
    let tunnel = TunnelSession::create(target(), anonymous(), tunnel_config(&relay))
        .await
        .unwrap();

    let mut client = TcpStream::connect(tunnel.local_addr()).await.unwrap();

    let payload: Vec<u8> = (0..100_000u32).map(|i| (i * 7 % 256) as u8).collect();
    let echoed = round_trip(&mut client, &payload).await;
    assert_eq!(echoed, payload);
    assert_eq!(tunnel.state(), TunnelState::Relaying);

    let echoed = round_trip(&mut client, b"small follow-up").await;
    assert_eq!(echoed, b"small follow-up");
}

#[tokio::test]
async fn test_local_disconnect_closes_cleanly() {
    init_logging();
    let relay = start_relay(None).await;
    let tunnel = TunnelSession::create(target(), anonymous(), tunnel_config(&relay))
        .await
        .unwrap();

    let mut client = TcpStream::connect(tunnel.local_addr()).await.unwrap();
    round_trip(&mut client, b"hello").await;
    assert_eq!(relay.session_count(), 1);
    drop(client);

    let summary = timeout(Duration::from_secs(10), tunnel.closed())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(tunnel.state(), TunnelState::Closed);

    let pump = summary.pump.unwrap();
    assert!(matches!(
        pump.end,
        PumpEnd::Completed | PumpEnd::LocalDisconnected
    ));
    assert_eq!(pump.bytes_to_relay, 5);
    assert_eq!(summary.session_id, tunnel.session_id());

    // The relay saw a graceful close and forgot the session
    timeout(Duration::from_secs(5), async {
        while relay.session_count() != 0 {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();

    assert_eq!(tunnel.endpoint(), Err(TunnelError::TunnelClosed));
}

#[tokio::test]
async fn test_upload_then_half_close_delivers_everything() {
    init_logging();
    let (backend, mut delivered) = counting_backend().await;
    let relay = start_relay_with_backend(backend, None).await;
    let payload = vec![0x5au8; 8 * 1024 * 1024];

    for round in 0..3 {
        let tunnel = TunnelSession::create(target(), anonymous(), tunnel_config(&relay))
            .await
            .unwrap();
        let mut client = TcpStream::connect(tunnel.local_addr()).await.unwrap();

        client.write_all(&payload).await.unwrap();
        client.shutdown().await.unwrap();

        // The backend sent nothing and closed its side straight away
        let mut response = Vec::new();
        timeout(Duration::from_secs(20), client.read_to_end(&mut response))
            .await
            .unwrap()
            .unwrap();
        assert!(response.is_empty());

        let summary = timeout(Duration::from_secs(20), tunnel.closed())
            .await
            .unwrap()
            .unwrap();
        let pump = summary.pump.unwrap();
        assert_eq!(pump.end, PumpEnd::Completed);
        assert_eq!(pump.bytes_to_relay, payload.len() as u64);

        let received = timeout(Duration::from_secs(10), delivered.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, payload.len(), "round {} lost bytes", round);
    }
}

#[tokio::test]
async fn test_writer_stalls_when_client_never_reads() {
    init_logging();
    let relay = start_relay(None).await;
    let tunnel = TunnelSession::create(target(), anonymous(), tunnel_config(&relay))
        .await
        .unwrap();

    let client = TcpStream::connect(tunnel.local_addr()).await.unwrap();
    // The read half is held but never read, so the echo backs up
    let (_unread, mut writer) = client.into_split();

    let written = Arc::new(AtomicU64::new(0));
    let counter = written.clone();
    let flood = tokio::spawn(async move {
        let chunk = vec![0xa5u8; 64 * 1024];
        while writer.write_all(&chunk).await.is_ok() {
            counter.fetch_add(chunk.len() as u64, Ordering::Relaxed);
        }
    });

    let mut last = 0;
    let mut stalled = false;
    for _ in 0..30 {
        sleep(Duration::from_secs(1)).await;
        let now = written.load(Ordering::Relaxed);
        if now > 0 && now == last {
            stalled = true;
            break;
        }
        last = now;
    }
    assert!(stalled, "writes never stalled, {} bytes accepted", last);
    assert!(last < 64 * 1024 * 1024, "{} bytes buffered before stalling", last);

    sleep(Duration::from_secs(1)).await;
    assert_eq!(written.load(Ordering::Relaxed), last);
    assert_eq!(tunnel.state(), TunnelState::Relaying);

    flood.abort();
    tunnel.close().await;
    assert!(tunnel.is_closed());
}

#[tokio::test]
async fn test_half_close_propagates() {
    init_logging();
    let relay = start_relay(None).await;
    let tunnel = TunnelSession::create(target(), anonymous(), tunnel_config(&relay))
        .await
        .unwrap();

    let mut client = TcpStream::connect(tunnel.local_addr()).await.unwrap();
    client.write_all(b"request").await.unwrap();
    client.shutdown().await.unwrap();

    // The read side stays open until the relay finishes too
    let mut response = Vec::new();
    timeout(Duration::from_secs(10), client.read_to_end(&mut response))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response, b"request");

    let summary = timeout(Duration::from_secs(10), tunnel.closed())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(summary.pump.unwrap().end, PumpEnd::Completed);
}

#[tokio::test]
async fn test_second_client_is_rejected() {
    init_logging();
    let relay = start_relay(None).await;
    let tunnel = TunnelSession::create(target(), anonymous(), tunnel_config(&relay))
        .await
        .unwrap();

    let mut first = TcpStream::connect(tunnel.local_addr()).await.unwrap();
    round_trip(&mut first, b"first").await;

    let mut second = TcpStream::connect(tunnel.local_addr()).await.unwrap();
    let mut buf = [0u8; 16];
    let read = timeout(Duration::from_secs(5), second.read(&mut buf))
        .await
        .unwrap();
    assert!(matches!(read, Ok(0) | Err(_)));

    // The first client is unaffected
    assert_eq!(round_trip(&mut first, b"still here").await, b"still here");
    assert_eq!(tunnel.state(), TunnelState::Relaying);
}

#[tokio::test]
async fn test_transient_drop_is_invisible() {
    init_logging();
    let relay = start_relay(None).await;
    let tunnel = TunnelSession::create(target(), anonymous(), tunnel_config(&relay))
        .await
        .unwrap();
    let mut states = tunnel.subscribe();

    let mut client = TcpStream::connect(tunnel.local_addr()).await.unwrap();
    assert_eq!(round_trip(&mut client, b"before drop").await, b"before drop");

    relay.drop_connections();

    assert_eq!(round_trip(&mut client, b"after drop").await, b"after drop");
    assert_eq!(tunnel.state(), TunnelState::Relaying);
    assert!(!matches!(*states.borrow_and_update(), TunnelState::Faulted(_)));
}

#[tokio::test]
async fn test_reconnect_budget_exhausted_faults() {
    init_logging();
    let relay = start_relay(None).await;
    let mut config = tunnel_config(&relay);
    config.relay.reconnect = ReconnectConfig::default()
        .with_max_attempts(Some(2))
        .with_initial_backoff(Duration::from_millis(20));

    let tunnel = TunnelSession::create(target(), anonymous(), config)
        .await
        .unwrap();

    let mut client = TcpStream::connect(tunnel.local_addr()).await.unwrap();
    round_trip(&mut client, b"ping").await;

    relay.shutdown();

    let result = timeout(Duration::from_secs(10), tunnel.closed())
        .await
        .unwrap();
    assert!(matches!(
        result,
        Err(TunnelError::Relay(RelayError::ReconnectExhausted { .. }))
    ));
    assert!(matches!(tunnel.state(), TunnelState::Faulted(_)));

    // The local client sees its connection end
    let mut buf = [0u8; 16];
    let read = timeout(Duration::from_secs(5), client.read(&mut buf))
        .await
        .unwrap();
    assert!(matches!(read, Ok(0) | Err(_)));
}

#[tokio::test]
async fn test_close_is_idempotent_and_releases_port() {
    init_logging();
    let relay = start_relay(None).await;
    let tunnel = Arc::new(
        TunnelSession::create(target(), anonymous(), tunnel_config(&relay))
            .await
            .unwrap(),
    );
    let addr = tunnel.local_addr();

    let mut client = TcpStream::connect(addr).await.unwrap();
    round_trip(&mut client, b"bytes").await;

    let (a, b) = (tunnel.clone(), tunnel.clone());
    let first = tokio::spawn(async move { a.close().await });
    let second = tokio::spawn(async move { b.close().await });
    first.await.unwrap();
    second.await.unwrap();
    tunnel.close().await;

    assert_eq!(tunnel.state(), TunnelState::Closed);
    assert_eq!(tunnel.local_addr(), addr);
    TcpListener::bind(addr).await.unwrap();
}

#[tokio::test]
async fn test_close_while_listening() {
    init_logging();
    let relay = start_relay(None).await;
    let tunnel = TunnelSession::create(target(), anonymous(), tunnel_config(&relay))
        .await
        .unwrap();

    tunnel.close().await;

    let summary = tunnel.closed().await.unwrap();
    assert!(summary.pump.is_none());
    TcpListener::bind(tunnel.local_addr()).await.unwrap();
}

#[tokio::test]
async fn test_rejected_credential_binds_nothing() {
    init_logging();
    let relay = start_relay(Some(SECRET)).await;
    let port = free_port().await;
    let config = tunnel_config(&relay).with_local_port(port);

    let result = TunnelSession::create(
        target(),
        Arc::new(StaticAuthorizer::from_token("forged")),
        config,
    )
    .await;

    match result {
        Err(error) => assert!(error.is_authentication_failure(), "{}", error),
        Ok(_) => panic!("forged credential was accepted"),
    }
    TcpListener::bind(("127.0.0.1", port)).await.unwrap();
}

#[tokio::test]
async fn test_unknown_target() {
    init_logging();
    let relay = start_relay(None).await;
    let unknown = iap_proto::Target::new("test-project", "us-central1-a", "gone-vm", 3389);

    let result = TunnelSession::create(unknown, anonymous(), tunnel_config(&relay)).await;
    assert!(matches!(
        result,
        Err(TunnelError::Relay(RelayError::TargetUnreachable(_)))
    ));
}

#[tokio::test]
async fn test_port_in_use() {
    init_logging();
    let relay = start_relay(None).await;
    let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = occupied.local_addr().unwrap().port();

    let result = TunnelSession::create(
        target(),
        anonymous(),
        tunnel_config(&relay).with_local_port(port),
    )
    .await;

    match result {
        Err(TunnelError::LocalBindFailed { port: failed, .. }) => assert_eq!(failed, port),
        other => panic!("expected LocalBindFailed, got {:?}", other),
    }

    // The relay session opened for the attempt was released
    timeout(Duration::from_secs(5), async {
        while relay.session_count() != 0 {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_cancel_closes_session() {
    init_logging();
    let relay = start_relay(None).await;
    let cancel = CancellationToken::new();
    let tunnel =
        TunnelSession::create_with_cancel(target(), anonymous(), tunnel_config(&relay), &cancel)
            .await
            .unwrap();

    let mut client = TcpStream::connect(tunnel.local_addr()).await.unwrap();
    round_trip(&mut client, b"data").await;

    cancel.cancel();
    let summary = timeout(Duration::from_secs(10), tunnel.closed())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(summary.pump.unwrap().end, PumpEnd::Cancelled);
}
