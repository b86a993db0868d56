//! Wire-level tests against the reference relay

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use iap_auth::{JwtValidator, RelayClaims};
use iap_proto::{connect_url, reconnect_url, Frame, FrameCodec, Target, SUBPROTOCOL};
use iap_relay::{RelayServer, RelayServerConfig, RouteTable};
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const SECRET: &[u8] = b"relay-test-secret";

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("iap_relay=debug")
        .with_test_writer()
        .try_init();
}

async fn echo_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if socket.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

fn target() -> Target {
    Target::new("test-project", "us-central1-a", "echo-vm", 7)
}

async fn start_relay(secret: Option<&[u8]>) -> RelayServer {
    let backend = echo_backend().await;
    let mut config = RelayServerConfig::default()
        .with_routes(RouteTable::new().with_route(target(), backend.to_string()));
    if let Some(secret) = secret {
        config = config.with_jwt_secret(secret);
    }
    let relay = RelayServer::bind(config).await.unwrap();
    relay.spawn().unwrap();
    relay
}

fn token(allowed: Vec<String>) -> String {
    let claims = RelayClaims::new(
        "tester".to_string(),
        "iap".to_string(),
        "iap-relay".to_string(),
        chrono::Duration::hours(1),
    )
    .with_allowed_targets(allowed);
    JwtValidator::encode(SECRET, &claims).unwrap()
}

async fn dial(url: &Url, token: Option<&str>) -> Result<Client, WsError> {
    let mut request = url.as_str().into_client_request().unwrap();
    request.headers_mut().insert(
        "Sec-WebSocket-Protocol",
        HeaderValue::from_static(SUBPROTOCOL),
    );
    if let Some(token) = token {
        request.headers_mut().insert(
            "Authorization",
            HeaderValue::from_str(&format!("Bearer {}", token)).unwrap(),
        );
    }
    connect_async(request).await.map(|(ws, _)| ws)
}

async fn next_frames(ws: &mut Client) -> Vec<Frame> {
    loop {
        match ws.next().await {
            Some(Ok(Message::Binary(data))) => return FrameCodec::decode_message(&data).unwrap(),
            Some(Ok(Message::Close(frame))) => panic!("relay closed: {:?}", frame),
            Some(Ok(_)) => continue,
            other => panic!("connection ended: {:?}", other),
        }
    }
}

async fn close_code(ws: &mut Client) -> u16 {
    loop {
        match ws.next().await {
            Some(Ok(Message::Close(Some(frame)))) => return u16::from(frame.code),
            Some(Ok(_)) => continue,
            other => panic!("expected close frame, got {:?}", other),
        }
    }
}

async fn send(ws: &mut Client, frame: Frame) {
    let encoded = FrameCodec::encode(&frame).unwrap();
    ws.send(Message::Binary(encoded.to_vec())).await.unwrap();
}

#[tokio::test]
async fn test_connect_and_echo() {
    init_logging();
    let relay = start_relay(None).await;
    let url = connect_url(&relay.url().unwrap(), &target()).unwrap();

    let mut ws = dial(&url, None).await.unwrap();
    let frames = next_frames(&mut ws).await;
    assert!(matches!(frames[0], Frame::ConnectSuccessSid(_)));
    assert_eq!(relay.session_count(), 1);

    send(&mut ws, Frame::Data(Bytes::from_static(b"ping"))).await;

    let mut echoed = Vec::new();
    while echoed.len() < 4 {
        for frame in next_frames(&mut ws).await {
            if let Frame::Data(data) = frame {
                echoed.extend_from_slice(&data);
            }
        }
    }
    assert_eq!(echoed, b"ping");
}

#[tokio::test]
async fn test_missing_token_is_unauthorized() {
    init_logging();
    let relay = start_relay(Some(SECRET)).await;
    let url = connect_url(&relay.url().unwrap(), &target()).unwrap();

    match dial(&url, None).await {
        Err(WsError::Http(response)) => assert_eq!(response.status().as_u16(), 401),
        other => panic!("expected HTTP 401, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn test_token_for_other_target_is_forbidden() {
    init_logging();
    let relay = start_relay(Some(SECRET)).await;
    let url = connect_url(&relay.url().unwrap(), &target()).unwrap();
    let token = token(vec!["other-project/zone/vm:3389".to_string()]);

    match dial(&url, Some(&token)).await {
        Err(WsError::Http(response)) => assert_eq!(response.status().as_u16(), 403),
        other => panic!("expected HTTP 403, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn test_unknown_target_closes_with_lookup_failed() {
    init_logging();
    let relay = start_relay(Some(SECRET)).await;
    let unknown = Target::new("test-project", "us-central1-a", "missing-vm", 22);
    let url = connect_url(&relay.url().unwrap(), &unknown).unwrap();

    let mut ws = dial(&url, Some(&token(vec!["*".to_string()]))).await.unwrap();
    assert_eq!(close_code(&mut ws).await, 4047);
}

#[tokio::test]
async fn test_reconnect_unknown_session() {
    init_logging();
    let relay = start_relay(None).await;
    let url = reconnect_url(&relay.url().unwrap(), "no-such-session", 0, &target()).unwrap();

    let mut ws = dial(&url, None).await.unwrap();
    assert_eq!(close_code(&mut ws).await, 4001);
}

#[tokio::test]
async fn test_session_resumes_after_drop() {
    init_logging();
    let relay = start_relay(None).await;
    let base = relay.url().unwrap();

    let mut ws = dial(&connect_url(&base, &target()).unwrap(), None)
        .await
        .unwrap();
    let sid = match next_frames(&mut ws).await.remove(0) {
        Frame::ConnectSuccessSid(sid) => sid,
        other => panic!("unexpected frame {:?}", other),
    };

    relay.drop_connections();
    drop(ws);

    let url = reconnect_url(&base, &sid, 0, &target()).unwrap();
    let mut ws = dial(&url, None).await.unwrap();
    let frames = next_frames(&mut ws).await;
    assert_eq!(frames[0], Frame::ReconnectSuccessAck(0));

    send(&mut ws, Frame::Data(Bytes::from_static(b"again"))).await;
    let mut echoed = Vec::new();
    while echoed.len() < 5 {
        for frame in next_frames(&mut ws).await {
            if let Frame::Data(data) = frame {
                echoed.extend_from_slice(&data);
            }
        }
    }
    assert_eq!(echoed, b"again");
    assert_eq!(relay.session_count(), 1);
}
