//! Shared harness: an echo backend behind the reference relay

#![allow(dead_code)]

use iap_auth::{Authorizer, StaticAuthorizer};
use iap_proto::Target;
use iap_relay::{RelayServer, RelayServerConfig, RouteTable};
use iap_transport::{ReconnectConfig, RelayConfig};
use iap_tunnel::TunnelConfig;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

pub const SECRET: &[u8] = b"tunnel-test-secret";

pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("iap_tunnel=debug,iap_transport=debug,iap_relay=info")
        .with_test_writer()
        .try_init();
}

pub fn target() -> Target {
    Target::new("test-project", "us-central1-a", "rdp-vm", 3389)
}

pub async fn echo_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = socket.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
                let _ = writer.shutdown().await;
            });
        }
    });
    addr
}

/// Closes its sending side at once and reports how many bytes each
/// connection delivered before EOF
pub async fn counting_backend() -> (SocketAddr, mpsc::UnboundedReceiver<usize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let tx = tx.clone();
            tokio::spawn(async move {
                let _ = socket.shutdown().await;
                let mut received = Vec::new();
                if socket.read_to_end(&mut received).await.is_ok() {
                    let _ = tx.send(received.len());
                }
            });
        }
    });
    (addr, rx)
}

pub async fn start_relay(secret: Option<&[u8]>) -> RelayServer {
    start_relay_with_backend(echo_backend().await, secret).await
}

pub async fn start_relay_with_backend(backend: SocketAddr, secret: Option<&[u8]>) -> RelayServer {
    let mut config = RelayServerConfig::default()
        .with_routes(RouteTable::new().with_route(target(), backend.to_string()));
    if let Some(secret) = secret {
        config = config.with_jwt_secret(secret);
    }
    let relay = RelayServer::bind(config).await.unwrap();
    relay.spawn().unwrap();
    relay
}

pub fn tunnel_config(relay: &RelayServer) -> TunnelConfig {
    let relay_config = RelayConfig::new(relay.url().unwrap())
        .with_handshake_timeout(Duration::from_secs(5))
        .with_close_timeout(Duration::from_secs(2))
        .with_reconnect(
            ReconnectConfig::default()
                .with_initial_backoff(Duration::from_millis(50))
                .with_max_backoff(Duration::from_millis(200)),
        );
    TunnelConfig::new(relay_config)
}

pub fn anonymous() -> Arc<dyn Authorizer> {
    Arc::new(StaticAuthorizer::from_token("anonymous"))
}

/// Write `payload` and read back the same number of bytes
pub async fn round_trip(client: &mut TcpStream, payload: &[u8]) -> Vec<u8> {
    client.write_all(payload).await.unwrap();
    let mut echoed = vec![0u8; payload.len()];
    tokio::time::timeout(Duration::from_secs(10), client.read_exact(&mut echoed))
        .await
        .unwrap()
        .unwrap();
    echoed
}

/// A port that was free a moment ago
pub async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}
