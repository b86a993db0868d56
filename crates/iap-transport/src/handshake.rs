//! Dialing the relay and classifying how a physical connection ended

use crate::error::RelayError;
use futures_util::{SinkExt, StreamExt};
use iap_auth::{Authorizer, Credential};
use iap_proto::{CloseCode, CloseDisposition, CodecError, Frame, FrameCodec, SUBPROTOCOL};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header, HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;
use url::Url;

pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Why a physical relay connection ended
#[derive(Debug)]
pub(crate) enum Disconnect {
    /// The session ended normally
    Closed,
    /// Local abort
    Aborted,
    /// Transient loss, the session may be resumed
    Dropped {
        reason: String,
        reauthenticate: bool,
    },
    /// The session cannot continue
    Fatal(RelayError),
}

impl Disconnect {
    pub(crate) fn dropped(reason: impl Into<String>) -> Self {
        Disconnect::Dropped {
            reason: reason.into(),
            reauthenticate: false,
        }
    }

    /// Error reported when the first handshake ends this way
    pub(crate) fn into_open_error(self) -> RelayError {
        match self {
            Disconnect::Closed => RelayError::ConnectionFailed(
                "relay closed the connection during the handshake".to_string(),
            ),
            Disconnect::Aborted => {
                RelayError::Cancelled("relay handshake cancelled".to_string())
            }
            Disconnect::Dropped { reason, .. } => RelayError::ConnectionFailed(reason),
            Disconnect::Fatal(error) => error,
        }
    }
}

pub(crate) fn protocol_error(error: CodecError) -> Disconnect {
    Disconnect::Fatal(RelayError::Protocol(error.to_string()))
}

/// Map a relay close frame onto what the session should do next
pub(crate) fn classify_close(frame: Option<&CloseFrame<'_>>) -> Disconnect {
    let Some(frame) = frame else {
        return Disconnect::dropped("relay closed the connection without a close code");
    };

    let raw = u16::from(frame.code);
    let reason = if frame.reason.is_empty() {
        format!("close code {}", raw)
    } else {
        format!("{} (close code {})", frame.reason, raw)
    };

    match CloseCode::from(raw).disposition() {
        CloseDisposition::Graceful => Disconnect::Closed,
        CloseDisposition::Retry => Disconnect::Dropped {
            reason,
            reauthenticate: false,
        },
        CloseDisposition::Reauthenticate => Disconnect::Dropped {
            reason,
            reauthenticate: true,
        },
        CloseDisposition::AuthenticationFailed => {
            Disconnect::Fatal(RelayError::AuthenticationFailed(reason))
        }
        CloseDisposition::TargetUnreachable => {
            Disconnect::Fatal(RelayError::TargetUnreachable(reason))
        }
        CloseDisposition::SessionLost | CloseDisposition::Destination => {
            Disconnect::Fatal(RelayError::ConnectionLost(reason))
        }
        CloseDisposition::Protocol => Disconnect::Fatal(RelayError::Protocol(reason)),
    }
}

fn classify_status(status: StatusCode) -> Disconnect {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Disconnect::Fatal(
            RelayError::AuthenticationFailed(format!("relay rejected the credential ({})", status)),
        ),
        StatusCode::NOT_FOUND => Disconnect::Fatal(RelayError::TargetUnreachable(format!(
            "relay has no route to the target ({})",
            status
        ))),
        other => Disconnect::dropped(format!("relay refused the upgrade ({})", other)),
    }
}

/// Ask the authorizer for a usable credential
///
/// An expired credential is re-requested once; if the fresh one is expired too
/// the handshake fails instead of retrying.
pub(crate) async fn fetch_credential(
    authorizer: &dyn Authorizer,
    refresh: bool,
) -> Result<Credential, RelayError> {
    let credential = if refresh {
        authorizer.refresh().await
    } else {
        authorizer.credential().await
    }
    .map_err(|e| RelayError::AuthenticationFailed(e.to_string()))?;

    if !credential.is_expired() {
        return Ok(credential);
    }

    if !refresh {
        debug!("Credential expired, requesting a fresh one");
        let fresh = authorizer
            .refresh()
            .await
            .map_err(|e| RelayError::AuthenticationFailed(e.to_string()))?;
        if !fresh.is_expired() {
            return Ok(fresh);
        }
    }

    Err(RelayError::AuthenticationFailed(
        "credential expired".to_string(),
    ))
}

/// Open the WebSocket, presenting the credential as a bearer token
pub(crate) async fn dial(url: &Url, credential: &Credential) -> Result<WsStream, Disconnect> {
    let mut request = url.as_str().into_client_request().map_err(|e| {
        Disconnect::Fatal(RelayError::ConnectionFailed(format!(
            "invalid relay request: {}",
            e
        )))
    })?;

    let bearer = HeaderValue::from_str(&credential.bearer()).map_err(|_| {
        Disconnect::Fatal(RelayError::AuthenticationFailed(
            "credential is not a valid header value".to_string(),
        ))
    })?;

    let headers = request.headers_mut();
    headers.insert(header::AUTHORIZATION, bearer);
    headers.insert(
        header::SEC_WEBSOCKET_PROTOCOL,
        HeaderValue::from_static(SUBPROTOCOL),
    );

    match connect_async(request).await {
        Ok((ws, _response)) => Ok(ws),
        Err(WsError::Http(response)) => Err(classify_status(response.status())),
        Err(e) => Err(Disconnect::dropped(format!("relay unreachable: {}", e))),
    }
}

/// Read until the first binary message and return its frames
pub(crate) async fn read_handshake(ws: &mut WsStream) -> Result<Vec<Frame>, Disconnect> {
    loop {
        match ws.next().await {
            Some(Ok(Message::Binary(data))) => {
                let frames = FrameCodec::decode_message(&data).map_err(protocol_error)?;
                if !frames.is_empty() {
                    return Ok(frames);
                }
            }
            Some(Ok(Message::Close(frame))) => return Err(classify_close(frame.as_ref())),
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(Disconnect::dropped(e.to_string())),
            None => {
                return Err(Disconnect::dropped(
                    "relay closed the connection during the handshake",
                ))
            }
        }
    }
}

pub(crate) async fn send_frame(ws: &mut WsStream, frame: &Frame) -> Result<(), Disconnect> {
    let encoded = FrameCodec::encode(frame).map_err(protocol_error)?;
    ws.send(Message::Binary(encoded.to_vec()))
        .await
        .map_err(|e| Disconnect::dropped(format!("send failed: {}", e)))
}
