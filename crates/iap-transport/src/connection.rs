//! Logical relay session

use crate::config::RelayConfig;
use crate::driver::{Driver, SessionIo};
use crate::error::{RelayError, RelayResult};
use crate::handshake::{dial, fetch_credential, read_handshake, Disconnect};
use bytes::Bytes;
use iap_auth::Authorizer;
use iap_proto::{connect_url, Frame, Target, MAX_DATA_FRAME_SIZE};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Observable state of a relay session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayState {
    Connected,
    /// The physical connection dropped and is being re-established
    Reconnecting { attempt: usize },
    Closed,
    Failed(RelayError),
}

impl RelayState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RelayState::Closed | RelayState::Failed(_))
    }
}

/// Statistics about a relay session
#[derive(Debug, Clone, Default)]
pub struct RelayStats {
    /// Payload bytes sent (resends not counted)
    pub bytes_sent: u64,

    /// Payload bytes received
    pub bytes_received: u64,

    /// Successful silent reconnects
    pub reconnects: u64,

    /// Session uptime (seconds)
    pub uptime_secs: u64,
}

#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    pub reconnects: AtomicU64,
}

#[derive(Debug)]
pub(crate) enum Outbound {
    Data(Bytes),
    Fin,
}

#[derive(Debug)]
pub(crate) enum Inbound {
    Data(Bytes),
    End,
}

fn terminal_error(state: &watch::Receiver<RelayState>) -> RelayError {
    match &*state.borrow() {
        RelayState::Failed(error) => error.clone(),
        _ => RelayError::Closed,
    }
}

/// Sending half of a relay session
pub struct RelayWriter {
    tx: mpsc::Sender<Outbound>,
    state: watch::Receiver<RelayState>,
    finished: bool,
}

impl RelayWriter {
    /// Queue bytes for the relay, waiting while the session is saturated
    pub async fn send(&mut self, mut data: Bytes) -> RelayResult<()> {
        if self.finished {
            return Err(RelayError::Protocol("send after finish".to_string()));
        }

        while !data.is_empty() {
            let chunk = data.split_to(data.len().min(MAX_DATA_FRAME_SIZE));
            self.tx
                .send(Outbound::Data(chunk))
                .await
                .map_err(|_| terminal_error(&self.state))?;
        }

        Ok(())
    }

    /// Half-close: the relay is told no more data follows
    pub async fn finish(&mut self) -> RelayResult<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        self.tx
            .send(Outbound::Fin)
            .await
            .map_err(|_| terminal_error(&self.state))
    }
}

/// Receiving half of a relay session
pub struct RelayReader {
    rx: mpsc::Receiver<Inbound>,
    state: watch::Receiver<RelayState>,
    ended: bool,
}

impl RelayReader {
    /// Next chunk from the relay, `None` at end of stream
    pub async fn receive(&mut self) -> RelayResult<Option<Bytes>> {
        if self.ended {
            return Ok(None);
        }

        match self.rx.recv().await {
            Some(Inbound::Data(data)) => Ok(Some(data)),
            Some(Inbound::End) => {
                self.ended = true;
                Ok(None)
            }
            None => match terminal_error(&self.state) {
                RelayError::Closed => {
                    self.ended = true;
                    Ok(None)
                }
                error => Err(error),
            },
        }
    }
}

/// One logical session to the relay for one target
///
/// Survives transient drops of the underlying WebSocket. Dropping the handle
/// aborts the session.
pub struct RelayConnection {
    session_id: String,
    target: Target,
    writer: RelayWriter,
    reader: RelayReader,
    state: watch::Receiver<RelayState>,
    close_token: CancellationToken,
    abort_token: CancellationToken,
    close_timeout: Duration,
    stats: Arc<StatsCounters>,
    created_at: Instant,
}

impl std::fmt::Debug for RelayConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayConnection")
            .field("session_id", &self.session_id)
            .field("target", &self.target)
            .field("state", &*self.state.borrow())
            .finish()
    }
}

impl RelayConnection {
    /// Perform the connect handshake and start the session driver
    ///
    /// Bounded by `config.handshake_timeout`; cancelling `cancel` aborts the
    /// handshake with [`RelayError::Cancelled`].
    pub async fn open(
        target: Target,
        authorizer: Arc<dyn Authorizer>,
        config: RelayConfig,
        cancel: &CancellationToken,
    ) -> RelayResult<Self> {
        let url = connect_url(&config.relay_url, &target)
            .map_err(|e| RelayError::ConnectionFailed(e.to_string()))?;

        info!("Opening relay session to {} via {}", target, config.relay_url);

        let handshake = async {
            let credential = fetch_credential(authorizer.as_ref(), false)
                .await
                .map_err(Disconnect::Fatal)?;
            let mut ws = dial(&url, &credential).await?;
            let frames = read_handshake(&mut ws).await?;
            Ok::<_, Disconnect>((ws, frames))
        };

        let (ws, frames) = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(RelayError::Cancelled("relay handshake cancelled".to_string()));
            }
            result = timeout(config.handshake_timeout, handshake) => match result {
                Ok(Ok(established)) => established,
                Ok(Err(disconnect)) => return Err(disconnect.into_open_error()),
                Err(_) => {
                    return Err(RelayError::Timeout(format!(
                        "relay handshake exceeded {}ms",
                        config.handshake_timeout.as_millis()
                    )));
                }
            },
        };

        let mut frames = frames.into_iter();
        let session_id = match frames.next() {
            Some(Frame::ConnectSuccessSid(sid)) => sid,
            Some(other) => {
                return Err(RelayError::Protocol(format!(
                    "expected CONNECT_SUCCESS_SID, got {:#06x}",
                    other.tag()
                )))
            }
            None => return Err(RelayError::Protocol("empty handshake".to_string())),
        };

        let (outbound_tx, outbound_rx) = mpsc::channel(config.channel_capacity);
        let (inbound_tx, inbound_rx) = mpsc::channel(config.channel_capacity);
        let (state_tx, state_rx) = watch::channel(RelayState::Connected);
        let close_token = CancellationToken::new();
        let abort_token = CancellationToken::new();
        let stats = Arc::new(StatsCounters::default());
        let close_timeout = config.close_timeout;

        let io = SessionIo {
            outbound_rx,
            inbound_tx,
            state_tx,
            stats: stats.clone(),
            close_token: close_token.clone(),
            abort_token: abort_token.clone(),
        };
        let mut driver = Driver::new(session_id.clone(), target.clone(), config, authorizer, io);

        // Frames that arrived in the same message as the session id
        for frame in frames {
            driver
                .handle_frame(frame)
                .map_err(Disconnect::into_open_error)?;
        }

        info!("[{}] ✅ Relay session established for {}", session_id, target);
        tokio::spawn(driver.run(ws));

        Ok(Self {
            session_id,
            target,
            writer: RelayWriter {
                tx: outbound_tx,
                state: state_rx.clone(),
                finished: false,
            },
            reader: RelayReader {
                rx: inbound_rx,
                state: state_rx.clone(),
                ended: false,
            },
            state: state_rx,
            close_token,
            abort_token,
            close_timeout,
            stats,
            created_at: Instant::now(),
        })
    }

    /// Relay-assigned session id
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub async fn send(&mut self, data: Bytes) -> RelayResult<()> {
        self.writer.send(data).await
    }

    pub async fn receive(&mut self) -> RelayResult<Option<Bytes>> {
        self.reader.receive().await
    }

    pub async fn finish(&mut self) -> RelayResult<()> {
        self.writer.finish().await
    }

    /// Both halves, for driving the two directions concurrently
    pub fn io(&mut self) -> (&mut RelayWriter, &mut RelayReader) {
        (&mut self.writer, &mut self.reader)
    }

    /// Subscribe to state changes
    pub fn state(&self) -> watch::Receiver<RelayState> {
        self.state.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state.borrow().is_terminal()
    }

    /// Close gracefully: deliver data already queued by [`send`](Self::send),
    /// send FIN, wait for the relay to acknowledge it all, then end the session
    ///
    /// Falls back to [`abort`](Self::abort) if the relay does not finish in time.
    /// Safe to call more than once.
    pub async fn close(&self) {
        if self.is_closed() {
            return;
        }

        debug!("[{}] Closing relay session", self.session_id);
        self.close_token.cancel();

        let grace = self.close_timeout + Duration::from_secs(1);
        if timeout(grace, self.wait_terminated()).await.is_err() {
            warn!(
                "[{}] Relay session did not close in time, aborting",
                self.session_id
            );
            self.abort();
            self.wait_terminated().await;
        }
    }

    /// End the session immediately without a close handshake
    pub fn abort(&self) {
        self.abort_token.cancel();
    }

    /// Wait for the session to reach `Closed` or `Failed`
    pub async fn wait_terminated(&self) -> RelayState {
        let mut state = self.state.clone();
        let terminal = match state.wait_for(RelayState::is_terminal).await {
            Ok(terminal) => terminal.clone(),
            Err(_) => RelayState::Closed,
        };
        terminal
    }

    pub fn stats(&self) -> RelayStats {
        RelayStats {
            bytes_sent: self.stats.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.stats.bytes_received.load(Ordering::Relaxed),
            reconnects: self.stats.reconnects.load(Ordering::Relaxed),
            uptime_secs: self.created_at.elapsed().as_secs(),
        }
    }
}

impl Drop for RelayConnection {
    fn drop(&mut self) {
        self.abort_token.cancel();
    }
}
