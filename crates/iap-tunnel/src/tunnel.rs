//! Tunnel session: a loopback listener in front of one relay session

use crate::config::{PumpConfig, TunnelConfig};
use crate::error::{TunnelError, TunnelResult};
use crate::pump::{self, PumpStats};
use iap_auth::Authorizer;
use iap_proto::Target;
use iap_transport::{RelayConnection, RelayError, RelayState, RelayStats};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, OnceCell};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lifecycle of a tunnel session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelState {
    Created,
    /// Relay handshake in flight
    Opening,
    /// Local port bound, waiting for the client
    Listening,
    /// Client connected, bytes flowing
    Relaying,
    /// Releasing the listener and the relay session
    Closing,
    Closed,
    Faulted(TunnelError),
}

impl TunnelState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TunnelState::Closed | TunnelState::Faulted(_))
    }

    /// Listening or relaying
    pub fn is_live(&self) -> bool {
        matches!(self, TunnelState::Listening | TunnelState::Relaying)
    }
}

/// What a session did, available once it has closed
#[derive(Debug, Clone)]
pub struct TunnelSummary {
    pub session_id: String,
    pub target: Target,
    pub local_addr: SocketAddr,
    /// None if no client ever connected
    pub pump: Option<PumpStats>,
    pub relay: RelayStats,
}

/// One open tunnel: a local port that forwards exactly one client connection
/// to the target through the relay
///
/// Dropping the session closes it in the background.
pub struct TunnelSession {
    session_id: String,
    target: Target,
    local_addr: SocketAddr,
    state: watch::Receiver<TunnelState>,
    summary: Arc<OnceCell<TunnelSummary>>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for TunnelSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelSession")
            .field("session_id", &self.session_id)
            .field("target", &self.target)
            .field("local_addr", &self.local_addr)
            .field("state", &*self.state.borrow())
            .finish()
    }
}

impl TunnelSession {
    /// Open the relay session and bind the local port
    ///
    /// Returns once the session is `Listening`, so the local port can be read
    /// back before any client connects.
    pub async fn create(
        target: Target,
        authorizer: Arc<dyn Authorizer>,
        config: TunnelConfig,
    ) -> TunnelResult<Self> {
        Self::create_with_cancel(target, authorizer, config, &CancellationToken::new()).await
    }

    /// Like [`create`](Self::create); cancelling `cancel` aborts the relay
    /// handshake, and later closes the session
    pub async fn create_with_cancel(
        target: Target,
        authorizer: Arc<dyn Authorizer>,
        config: TunnelConfig,
        cancel: &CancellationToken,
    ) -> TunnelResult<Self> {
        let (state_tx, state_rx) = watch::channel(TunnelState::Created);

        state_tx.send_replace(TunnelState::Opening);
        let relay = match RelayConnection::open(
            target.clone(),
            authorizer,
            config.relay.clone(),
            cancel,
        )
        .await
        {
            Ok(relay) => relay,
            Err(e) => {
                warn!("Failed to open tunnel to {}: {}", target, e);
                return Err(e.into());
            }
        };
        let session_id = relay.session_id().to_string();

        let bind_failed = |reason: String| TunnelError::LocalBindFailed {
            address: config.bind_address,
            port: config.local_port,
            reason,
        };
        let bound = match TcpListener::bind((config.bind_address, config.local_port)).await {
            Ok(listener) => listener
                .local_addr()
                .map(|addr| (listener, addr))
                .map_err(|e| bind_failed(e.to_string())),
            Err(e) => Err(bind_failed(e.to_string())),
        };
        let (listener, local_addr) = match bound {
            Ok(bound) => bound,
            Err(e) => {
                warn!("[{}] {}", session_id, e);
                relay.close().await;
                return Err(e);
            }
        };

        state_tx.send_replace(TunnelState::Listening);
        info!(
            "[{}] ✅ Tunnel to {} listening on {}",
            session_id, target, local_addr
        );

        let cancel = cancel.child_token();
        let summary = Arc::new(OnceCell::new());
        let acceptor = Acceptor {
            session_id: session_id.clone(),
            target: target.clone(),
            local_addr,
            pump: config.pump,
            state_tx,
            summary: summary.clone(),
            cancel: cancel.clone(),
        };
        tokio::spawn(acceptor.run(listener, relay));

        Ok(Self {
            session_id,
            target,
            local_addr,
            state: state_rx,
            summary,
            cancel,
        })
    }

    /// Relay-assigned session id
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    /// Bound local port; stable for the lifetime of the session
    pub fn local_port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Address a client should connect to
    ///
    /// Fails with [`TunnelError::TunnelClosed`] once the session has ended.
    pub fn endpoint(&self) -> TunnelResult<SocketAddr> {
        if self.is_closed() {
            return Err(TunnelError::TunnelClosed);
        }
        Ok(self.local_addr)
    }

    pub fn state(&self) -> TunnelState {
        self.state.borrow().clone()
    }

    /// Subscribe to state changes
    pub fn subscribe(&self) -> watch::Receiver<TunnelState> {
        self.state.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state.borrow().is_terminal()
    }

    /// Wait for the session to end
    ///
    /// Resolves to the summary after a normal close and to the fault
    /// otherwise.
    pub async fn closed(&self) -> TunnelResult<TunnelSummary> {
        let mut state = self.state.clone();
        let terminal = match state.wait_for(TunnelState::is_terminal).await {
            Ok(terminal) => terminal.clone(),
            Err(_) => TunnelState::Closed,
        };

        match terminal {
            TunnelState::Faulted(error) => Err(error),
            _ => self.summary.get().cloned().ok_or(TunnelError::TunnelClosed),
        }
    }

    /// Close the session and wait until the local port and relay session are
    /// released
    ///
    /// Safe to call more than once and from several tasks.
    pub async fn close(&self) {
        self.cancel.cancel();
        let mut state = self.state.clone();
        let _ = state.wait_for(TunnelState::is_terminal).await;
    }
}

impl Drop for TunnelSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Background half of a session: accepts the client and runs the pump
struct Acceptor {
    session_id: String,
    target: Target,
    local_addr: SocketAddr,
    pump: PumpConfig,
    state_tx: watch::Sender<TunnelState>,
    summary: Arc<OnceCell<TunnelSummary>>,
    cancel: CancellationToken,
}

enum Accepted {
    Client(TcpStream, SocketAddr),
    Cancelled,
    RelayEnded(RelayError),
}

impl Acceptor {
    async fn run(self, listener: TcpListener, mut relay: RelayConnection) {
        let accepted = self.accept(&listener, &relay).await;

        let result = match accepted {
            Accepted::Client(mut socket, peer) => {
                info!("[{}] Client connected from {}", self.session_id, peer);
                self.state_tx.send_replace(TunnelState::Relaying);
                self.relay_client(&listener, &mut socket, &mut relay)
                    .await
                    .map(Some)
            }
            Accepted::Cancelled => Ok(None),
            Accepted::RelayEnded(error) => Err(error),
        };

        self.state_tx.send_replace(TunnelState::Closing);
        drop(listener);
        relay.close().await;

        let terminal = match result {
            Ok(pump) => {
                if let Some(stats) = &pump {
                    info!(
                        "[{}] Tunnel closed ({:?}, {} bytes up, {} bytes down)",
                        self.session_id, stats.end, stats.bytes_to_relay, stats.bytes_from_relay
                    );
                } else {
                    info!("[{}] Tunnel closed before a client connected", self.session_id);
                }
                let _ = self.summary.set(TunnelSummary {
                    session_id: self.session_id.clone(),
                    target: self.target.clone(),
                    local_addr: self.local_addr,
                    pump,
                    relay: relay.stats(),
                });
                TunnelState::Closed
            }
            Err(error) => {
                warn!("[{}] Tunnel faulted: {}", self.session_id, error);
                TunnelState::Faulted(TunnelError::Relay(error))
            }
        };

        drop(relay);
        self.state_tx.send_replace(terminal);
    }

    /// Wait for the one client, the relay ending, or cancellation
    async fn accept(&self, listener: &TcpListener, relay: &RelayConnection) -> Accepted {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Accepted::Cancelled,

                state = relay.wait_terminated() => {
                    let error = match state {
                        RelayState::Failed(error) => error,
                        _ => RelayError::Closed,
                    };
                    return Accepted::RelayEnded(error);
                }

                accepted = listener.accept() => match accepted {
                    Ok((socket, peer)) => return Accepted::Client(socket, peer),
                    Err(e) => warn!("[{}] Failed to accept local connection: {}", self.session_id, e),
                },
            }
        }
    }

    /// Pump the client until either side ends, turning away further clients
    async fn relay_client(
        &self,
        listener: &TcpListener,
        socket: &mut TcpStream,
        relay: &mut RelayConnection,
    ) -> Result<PumpStats, RelayError> {
        let pump = pump::run(socket, relay, &self.pump, &self.cancel);
        tokio::pin!(pump);

        loop {
            tokio::select! {
                result = &mut pump => return result,

                extra = listener.accept() => match extra {
                    Ok((extra, peer)) => {
                        warn!(
                            "[{}] Rejecting second local connection from {}",
                            self.session_id, peer
                        );
                        drop(extra);
                    }
                    Err(e) => debug!("[{}] Accept failed while relaying: {}", self.session_id, e),
                },
            }
        }
    }
}
