//! Relay server: accepts WebSocket upgrades and serves relay sessions

use crate::config::RelayServerConfig;
use crate::error::RelayServerError;
use crate::session::{close_with, send_frame, AttachmentEnd, RelaySession, RelayStream};
use dashmap::DashMap;
use iap_auth::{JwtValidator, RelayClaims};
use iap_proto::{CloseCode, EndpointError, Frame, RelayRequest, Target, SUBPROTOCOL};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{header, HeaderValue, StatusCode};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

struct RelayShared {
    config: RelayServerConfig,
    validator: Option<JwtValidator>,
    sessions: DashMap<String, Arc<RelaySession>>,
    /// Parent token of every live WebSocket, replaced by `drop_connections`
    connections: RwLock<CancellationToken>,
    shutdown: CancellationToken,
}

/// Reference relay server
pub struct RelayServer {
    local_addr: SocketAddr,
    listener: Mutex<Option<TcpListener>>,
    shared: Arc<RelayShared>,
}

fn reject(status: StatusCode, message: impl Into<String>) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(message.into()));
    *response.status_mut() = status;
    response
}

fn bearer_token(request: &Request) -> Option<&str> {
    request
        .headers()
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

impl RelayServer {
    /// Bind the listener; connections are served once [`spawn`](Self::spawn) is called
    pub async fn bind(config: RelayServerConfig) -> Result<Self, RelayServerError> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let local_addr = listener.local_addr()?;

        let validator = config
            .jwt_secret
            .as_deref()
            .map(JwtValidator::new);

        info!(
            "Relay listening on {} ({} routes, auth {})",
            local_addr,
            config.routes.len(),
            if validator.is_some() { "on" } else { "off" }
        );

        let shutdown = CancellationToken::new();
        let shared = Arc::new(RelayShared {
            config,
            validator,
            sessions: DashMap::new(),
            connections: RwLock::new(shutdown.child_token()),
            shutdown,
        });

        Ok(Self {
            local_addr,
            listener: Mutex::new(Some(listener)),
            shared,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Base URL clients connect to
    pub fn url(&self) -> Result<Url, url::ParseError> {
        Url::parse(&format!("ws://{}", self.local_addr))
    }

    /// Start the accept loop
    pub fn spawn(&self) -> Result<JoinHandle<()>, RelayServerError> {
        let listener = self
            .listener
            .lock()
            .ok()
            .and_then(|mut listener| listener.take())
            .ok_or(RelayServerError::AlreadyRunning)?;

        let shared = self.shared.clone();
        Ok(tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = shared.shutdown.cancelled() => break,
                    accepted = listener.accept() => accepted,
                };

                match accepted {
                    Ok((stream, peer)) => {
                        debug!("Incoming relay connection from {}", peer);
                        let shared = shared.clone();
                        tokio::spawn(async move {
                            shared.handle_connection(stream, peer).await;
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept relay connection: {}", e);
                    }
                }
            }
            info!("Relay listener closed");
        }))
    }

    /// Abruptly drop every live WebSocket; sessions survive and can be resumed
    pub fn drop_connections(&self) {
        if let Ok(mut connections) = self.shared.connections.write() {
            let previous =
                std::mem::replace(&mut *connections, self.shared.shutdown.child_token());
            previous.cancel();
        }
        info!("Dropped all relay connections");
    }

    /// Stop accepting, drop every connection and forget every session
    pub fn shutdown(&self) {
        self.shared.shutdown.cancel();
        self.shared.sessions.clear();
        if let Ok(mut listener) = self.listener.lock() {
            listener.take();
        }
    }

    /// Number of sessions the relay currently holds
    pub fn session_count(&self) -> usize {
        self.shared.sessions.len()
    }
}

impl Drop for RelayServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl RelayShared {
    fn connection_token(&self) -> CancellationToken {
        match self.connections.read() {
            Ok(token) => token.child_token(),
            Err(_) => self.shutdown.child_token(),
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let mut accepted: Option<(RelayRequest, Option<RelayClaims>)> = None;

        let callback = |request: &Request, mut response: Response| -> Result<Response, ErrorResponse> {
            let parsed = RelayRequest::parse(request.uri().path(), request.uri().query())
                .map_err(|e| match e {
                    EndpointError::UnknownPath(_) => reject(StatusCode::NOT_FOUND, e.to_string()),
                    _ => reject(StatusCode::BAD_REQUEST, e.to_string()),
                })?;

            let claims = match &self.validator {
                Some(validator) => {
                    let token = bearer_token(request)
                        .ok_or_else(|| reject(StatusCode::UNAUTHORIZED, "missing bearer token"))?;
                    let claims = validator
                        .validate(token)
                        .map_err(|e| reject(StatusCode::UNAUTHORIZED, e.to_string()))?;
                    if let RelayRequest::Connect(target) = &parsed {
                        if !claims.allows(target) {
                            return Err(reject(
                                StatusCode::FORBIDDEN,
                                format!("{} may not access {}", claims.sub, target),
                            ));
                        }
                    }
                    Some(claims)
                }
                None => None,
            };

            response.headers_mut().insert(
                header::SEC_WEBSOCKET_PROTOCOL,
                HeaderValue::from_static(SUBPROTOCOL),
            );
            accepted = Some((parsed, claims));
            Ok(response)
        };

        let mut ws = match accept_hdr_async(stream, callback).await {
            Ok(ws) => ws,
            Err(e) => {
                warn!("Rejected relay upgrade from {}: {}", peer, e);
                return;
            }
        };

        let Some((request, claims)) = accepted else {
            return;
        };

        match request {
            RelayRequest::Connect(target) => self.open_session(&mut ws, target).await,
            RelayRequest::Reconnect { sid, ack } => {
                self.resume_session(&mut ws, sid, ack, claims).await
            }
        }
    }

    async fn open_session(self: &Arc<Self>, ws: &mut RelayStream, target: Target) {
        let Some(backend_addr) = self.config.routes.resolve(&target) else {
            warn!("No route for {}", target);
            close_with(ws, CloseCode::LookupFailed, "no route to target").await;
            return;
        };

        let backend = match timeout(
            self.config.backend_connect_timeout,
            TcpStream::connect(backend_addr),
        )
        .await
        {
            Ok(Ok(backend)) => backend,
            Ok(Err(e)) => {
                warn!("Backend {} for {} unreachable: {}", backend_addr, target, e);
                close_with(ws, CloseCode::FailedToConnectToBackend, "backend unreachable").await;
                return;
            }
            Err(_) => {
                warn!("Backend {} for {} timed out", backend_addr, target);
                close_with(ws, CloseCode::FailedToConnectToBackend, "backend timed out").await;
                return;
            }
        };

        let sid = uuid::Uuid::new_v4().to_string();
        let session = Arc::new(RelaySession::new(
            sid.clone(),
            target.clone(),
            backend,
            self.config.max_unacked_bytes,
        ));
        self.sessions.insert(sid.clone(), session.clone());
        info!("[{}] Session opened for {} -> {}", sid, target, backend_addr);

        if !send_frame(ws, &Frame::ConnectSuccessSid(sid)).await {
            self.schedule_expiry(session);
            return;
        }

        self.serve(ws, session, None).await;
    }

    async fn resume_session(
        self: &Arc<Self>,
        ws: &mut RelayStream,
        sid: String,
        ack: u64,
        claims: Option<RelayClaims>,
    ) {
        let Some(session) = self.sessions.get(&sid).map(|entry| entry.value().clone()) else {
            warn!("[{}] Reconnect for unknown session", sid);
            close_with(ws, CloseCode::SidUnknown, "unknown session").await;
            return;
        };

        if let Some(claims) = claims {
            if !claims.allows(session.target()) {
                close_with(ws, CloseCode::NotAuthorized, "not authorized").await;
                return;
            }
        }

        info!("[{}] Session resumed", sid);
        self.serve(ws, session, Some(ack)).await;
    }

    async fn serve(self: &Arc<Self>, ws: &mut RelayStream, session: Arc<RelaySession>, ack: Option<u64>) {
        let token = self.connection_token();
        let end = session
            .attach(ws, token, ack, self.config.keepalive_interval)
            .await;

        match end {
            AttachmentEnd::Finished => {
                self.sessions.remove(session.sid());
                info!("[{}] Session finished", session.sid());
            }
            AttachmentEnd::Detached => {
                debug!("[{}] Session detached", session.sid());
                self.schedule_expiry(session);
            }
        }
    }

    /// Forget the session if nobody resumes it within the linger period
    fn schedule_expiry(self: &Arc<Self>, session: Arc<RelaySession>) {
        let shared = self.clone();
        let attachments = session.attachments();

        tokio::spawn(async move {
            tokio::select! {
                _ = sleep(shared.config.session_linger) => {}
                _ = shared.shutdown.cancelled() => {}
            }

            if session.attachments() == attachments
                && shared.sessions.remove(session.sid()).is_some()
            {
                info!("[{}] Session expired", session.sid());
            }
        });
    }
}
