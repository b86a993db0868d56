//! Task that owns the relay WebSocket for the lifetime of a session

use crate::config::RelayConfig;
use crate::connection::{Inbound, Outbound, RelayState, StatsCounters};
use crate::error::RelayError;
use crate::handshake::{
    classify_close, dial, fetch_credential, protocol_error, read_handshake, send_frame,
    Disconnect, WsStream,
};
use crate::reconnect::{ReconnectError, ReconnectManager};
use futures_util::{SinkExt, StreamExt};
use iap_auth::Authorizer;
use iap_proto::{reconnect_url, Frame, FrameCodec, ReceiveCounter, SendWindow, Target};
use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, sleep_until, timeout, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode as WsCloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Channels and signals shared between a driver and its connection handle
pub(crate) struct SessionIo {
    pub outbound_rx: mpsc::Receiver<Outbound>,
    pub inbound_tx: mpsc::Sender<Inbound>,
    pub state_tx: watch::Sender<RelayState>,
    pub stats: Arc<StatsCounters>,
    pub close_token: CancellationToken,
    pub abort_token: CancellationToken,
}

pub(crate) struct Driver {
    session_id: String,
    target: Target,
    config: RelayConfig,
    authorizer: Arc<dyn Authorizer>,
    window: SendWindow,
    received: ReceiveCounter,
    outbound_rx: mpsc::Receiver<Outbound>,
    outbound_open: bool,
    inbound_tx: mpsc::Sender<Inbound>,
    /// Inbound items waiting for room in the reader channel
    pending: VecDeque<Inbound>,
    remote_fin: bool,
    ack_now: bool,
    /// Deadline of a graceful close in progress
    closing: Option<Instant>,
    state_tx: watch::Sender<RelayState>,
    stats: Arc<StatsCounters>,
    close_token: CancellationToken,
    abort_token: CancellationToken,
}

/// What woke the session loop
enum Event {
    Abort,
    Close,
    CloseTimeout,
    Message(Option<Result<Message, WsError>>),
    Delivered,
    Outbound(Option<Outbound>),
    Keepalive,
    Idle,
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl Driver {
    pub(crate) fn new(
        session_id: String,
        target: Target,
        config: RelayConfig,
        authorizer: Arc<dyn Authorizer>,
        io: SessionIo,
    ) -> Self {
        let window = SendWindow::new(config.max_unacked_bytes);
        Self {
            session_id,
            target,
            config,
            authorizer,
            window,
            received: ReceiveCounter::new(),
            outbound_rx: io.outbound_rx,
            outbound_open: true,
            inbound_tx: io.inbound_tx,
            pending: VecDeque::new(),
            remote_fin: false,
            ack_now: false,
            closing: None,
            state_tx: io.state_tx,
            stats: io.stats,
            close_token: io.close_token,
            abort_token: io.abort_token,
        }
    }

    /// Drive the session until it closes, fails or is aborted
    pub(crate) async fn run(mut self, ws: WsStream) {
        let mut budget = ReconnectManager::new(self.config.reconnect.clone());
        let mut ws = ws;

        loop {
            let (reason, reauthenticate) = match self.run_session(ws).await {
                Disconnect::Closed => {
                    if self.closing.is_none() {
                        self.drain_pending().await;
                    }
                    info!("[{}] Relay session closed", self.session_id);
                    self.finish(RelayState::Closed);
                    return;
                }
                Disconnect::Aborted => {
                    debug!("[{}] Relay session aborted", self.session_id);
                    self.finish(RelayState::Closed);
                    return;
                }
                Disconnect::Fatal(error) => {
                    error!("[{}] Relay session failed: {}", self.session_id, error);
                    self.finish(RelayState::Failed(error));
                    return;
                }
                Disconnect::Dropped {
                    reason,
                    reauthenticate,
                } => (reason, reauthenticate),
            };

            warn!("[{}] Relay connection dropped: {}", self.session_id, reason);

            match self.reconnect(&mut budget, reauthenticate, reason).await {
                Ok(resumed) => {
                    ws = resumed;
                    budget.reset();
                    self.stats.reconnects.fetch_add(1, Ordering::Relaxed);
                    self.state_tx.send_replace(RelayState::Connected);
                    info!("[{}] ✅ Relay session resumed", self.session_id);
                }
                Err(Disconnect::Fatal(error)) => {
                    error!("[{}] Relay session failed: {}", self.session_id, error);
                    self.finish(RelayState::Failed(error));
                    return;
                }
                Err(_) => {
                    debug!("[{}] Reconnect abandoned", self.session_id);
                    self.finish(RelayState::Closed);
                    return;
                }
            }
        }
    }

    fn finish(&mut self, state: RelayState) {
        self.state_tx.send_replace(state);
    }

    /// Hand what is left to the reader, ending with end-of-stream
    async fn drain_pending(&mut self) {
        if !self.remote_fin {
            self.remote_fin = true;
            self.pending.push_back(Inbound::End);
        }

        while let Some(item) = self.pending.pop_front() {
            tokio::select! {
                _ = self.abort_token.cancelled() => return,
                sent = self.inbound_tx.send(item) => {
                    if sent.is_err() {
                        return;
                    }
                }
            }
        }
    }

    async fn run_session(&mut self, mut ws: WsStream) -> Disconnect {
        let period = self.config.keepalive_interval;
        let mut keepalive = interval_at(Instant::now() + period, period);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_seen = Instant::now();

        loop {
            if let Err(disconnect) = self.flush_ack(&mut ws).await {
                return disconnect;
            }

            // Everything the writer queued before the close went out first
            if self.closing.is_some() && !self.outbound_open && !self.window.fin_sent() {
                debug!("[{}] Sending FIN", self.session_id);
                self.window.mark_fin();
                if let Err(disconnect) = send_frame(&mut ws, &Frame::Fin).await {
                    return disconnect;
                }
            }

            if self.closing.is_some() && self.window.fin_sent() && self.window.is_drained() {
                return self.close_gracefully(ws).await;
            }

            let idle_deadline = last_seen + self.config.idle_timeout;
            let reading = self.pending.is_empty();
            let can_send =
                self.outbound_open && !self.window.fin_sent() && self.window.has_capacity();

            let event = tokio::select! {
                _ = self.abort_token.cancelled() => Event::Abort,
                _ = self.close_token.cancelled(), if self.closing.is_none() => Event::Close,
                _ = sleep_until_opt(self.closing) => Event::CloseTimeout,
                message = ws.next(), if reading => Event::Message(message),
                permit = self.inbound_tx.reserve(), if !reading => {
                    match permit {
                        Ok(permit) => {
                            if let Some(item) = self.pending.pop_front() {
                                permit.send(item);
                            }
                        }
                        // Reader gone, nothing will consume inbound data
                        Err(_) => self.pending.clear(),
                    }
                    Event::Delivered
                }
                outbound = self.outbound_rx.recv(), if can_send => Event::Outbound(outbound),
                _ = keepalive.tick() => Event::Keepalive,
                _ = sleep_until(idle_deadline), if reading => Event::Idle,
            };

            match event {
                Event::Abort => return Disconnect::Aborted,
                Event::Close => {
                    debug!("[{}] Closing relay session", self.session_id);
                    self.closing = Some(Instant::now() + self.config.close_timeout);
                    // No new sends; what is already queued is still delivered
                    self.outbound_rx.close();
                }
                Event::CloseTimeout => {
                    warn!(
                        "[{}] {} bytes still unacknowledged at close timeout",
                        self.session_id,
                        self.window.unacked_bytes()
                    );
                    return self.close_gracefully(ws).await;
                }
                Event::Message(message) => {
                    last_seen = Instant::now();
                    if let Err(disconnect) = self.handle_message(message) {
                        return disconnect;
                    }
                }
                Event::Delivered => last_seen = Instant::now(),
                Event::Outbound(Some(Outbound::Data(data))) => {
                    trace!("[{}] Sending {} bytes", self.session_id, data.len());
                    self.window.push(data.clone());
                    self.stats
                        .bytes_sent
                        .fetch_add(data.len() as u64, Ordering::Relaxed);
                    if let Err(disconnect) = send_frame(&mut ws, &Frame::Data(data)).await {
                        return disconnect;
                    }
                }
                Event::Outbound(Some(Outbound::Fin)) => {
                    debug!("[{}] Sending FIN", self.session_id);
                    self.window.mark_fin();
                    if let Err(disconnect) = send_frame(&mut ws, &Frame::Fin).await {
                        return disconnect;
                    }
                }
                Event::Outbound(None) => self.outbound_open = false,
                Event::Keepalive => {
                    if let Err(e) = ws.send(Message::Ping(Vec::new())).await {
                        return Disconnect::dropped(format!("keep-alive failed: {}", e));
                    }
                    if self.received.ack_pending() {
                        self.ack_now = true;
                    }
                }
                Event::Idle => {
                    return Disconnect::dropped(format!(
                        "no traffic from relay for {}s",
                        self.config.idle_timeout.as_secs()
                    ));
                }
            }
        }
    }

    fn handle_message(
        &mut self,
        message: Option<Result<Message, WsError>>,
    ) -> Result<(), Disconnect> {
        match message {
            Some(Ok(Message::Binary(data))) => {
                let frames = FrameCodec::decode_message(&data).map_err(protocol_error)?;
                for frame in frames {
                    self.handle_frame(frame)?;
                }
                Ok(())
            }
            Some(Ok(Message::Close(frame))) => Err(classify_close(frame.as_ref())),
            Some(Ok(_)) => Ok(()),
            Some(Err(e)) => Err(Disconnect::dropped(e.to_string())),
            None => Err(Disconnect::dropped(
                "relay connection ended without a close frame",
            )),
        }
    }

    pub(crate) fn handle_frame(&mut self, frame: Frame) -> Result<(), Disconnect> {
        match frame {
            Frame::Data(data) => {
                if self.remote_fin {
                    warn!("[{}] Dropping data received after FIN", self.session_id);
                    return Ok(());
                }
                if data.is_empty() {
                    return Ok(());
                }
                self.received.record(data.len());
                self.stats
                    .bytes_received
                    .fetch_add(data.len() as u64, Ordering::Relaxed);
                self.pending.push_back(Inbound::Data(data));
            }
            Frame::Ack(ack) => {
                self.window
                    .acknowledge(ack)
                    .map_err(|e| Disconnect::Fatal(RelayError::Protocol(e.to_string())))?;
            }
            Frame::Fin => {
                if !self.remote_fin {
                    debug!("[{}] Relay sent FIN", self.session_id);
                    self.remote_fin = true;
                    self.pending.push_back(Inbound::End);
                    self.ack_now = true;
                }
            }
            other => {
                return Err(Disconnect::Fatal(RelayError::Protocol(format!(
                    "unexpected frame {:#06x} mid-session",
                    other.tag()
                ))));
            }
        }
        Ok(())
    }

    async fn flush_ack(&mut self, ws: &mut WsStream) -> Result<(), Disconnect> {
        let due = self.received.ack_due() || (self.ack_now && self.received.ack_pending());
        self.ack_now = false;
        if due {
            let ack = self.received.mark_acked();
            trace!("[{}] Acknowledging {} bytes", self.session_id, ack);
            send_frame(ws, &Frame::Ack(ack)).await?;
        }
        Ok(())
    }

    async fn close_gracefully(&mut self, mut ws: WsStream) -> Disconnect {
        let frame = CloseFrame {
            code: WsCloseCode::Normal,
            reason: "".into(),
        };

        if ws.close(Some(frame)).await.is_ok() {
            // Wait for the relay to answer the close
            let _ = timeout(self.config.close_timeout, async {
                while let Some(Ok(_)) = ws.next().await {}
            })
            .await;
        }

        Disconnect::Closed
    }

    async fn reconnect(
        &mut self,
        budget: &mut ReconnectManager,
        mut reauthenticate: bool,
        mut last_error: String,
    ) -> Result<WsStream, Disconnect> {
        let abort = self.abort_token.clone();

        loop {
            let attempt = budget.attempt() + 1;
            if budget.max_attempts().map_or(true, |max| attempt <= max) {
                self.state_tx
                    .send_replace(RelayState::Reconnecting { attempt });
            }

            match budget.wait(&abort).await {
                Ok(()) => {}
                Err(ReconnectError::Cancelled) => return Err(Disconnect::Aborted),
                Err(ReconnectError::MaxAttemptsReached) => {
                    return Err(Disconnect::Fatal(RelayError::ReconnectExhausted {
                        attempts: attempt - 1,
                        last_error,
                    }));
                }
            }

            info!(
                "[{}] Reconnecting to relay (attempt {})",
                self.session_id, attempt
            );

            let resumed = tokio::select! {
                _ = abort.cancelled() => return Err(Disconnect::Aborted),
                resumed = self.resume(reauthenticate) => resumed,
            };

            match resumed {
                Ok(ws) => return Ok(ws),
                Err(Disconnect::Dropped {
                    reason,
                    reauthenticate: refresh,
                }) => {
                    warn!(
                        "[{}] Reconnect attempt {} failed: {}",
                        self.session_id, attempt, reason
                    );
                    last_error = reason;
                    reauthenticate = refresh;
                }
                Err(Disconnect::Closed) => {
                    last_error = "relay closed the connection during reconnect".to_string();
                }
                Err(other) => return Err(other),
            }
        }
    }

    /// Resume the session on a new WebSocket and resend what the relay is missing
    async fn resume(&mut self, reauthenticate: bool) -> Result<WsStream, Disconnect> {
        let credential = fetch_credential(self.authorizer.as_ref(), reauthenticate)
            .await
            .map_err(Disconnect::Fatal)?;

        let url = reconnect_url(
            &self.config.relay_url,
            &self.session_id,
            self.received.received(),
            &self.target,
        )
        .map_err(|e| Disconnect::Fatal(RelayError::ConnectionFailed(e.to_string())))?;

        let handshake = async {
            let mut ws = dial(&url, &credential).await?;
            let frames = read_handshake(&mut ws).await?;
            Ok::<_, Disconnect>((ws, frames))
        };

        let (mut ws, frames) = timeout(self.config.handshake_timeout, handshake)
            .await
            .map_err(|_| Disconnect::dropped("reconnect handshake timed out"))??;

        let mut frames = frames.into_iter();
        let relay_ack = match frames.next() {
            Some(Frame::ReconnectSuccessAck(ack)) => ack,
            Some(other) => {
                return Err(Disconnect::Fatal(RelayError::Protocol(format!(
                    "expected RECONNECT_SUCCESS_ACK, got {:#06x}",
                    other.tag()
                ))))
            }
            None => {
                return Err(Disconnect::Fatal(RelayError::Protocol(
                    "empty reconnect handshake".to_string(),
                )))
            }
        };

        self.window
            .acknowledge(relay_ack)
            .map_err(|e| Disconnect::Fatal(RelayError::Protocol(e.to_string())))?;
        // The reconnect URL carried our receive count
        self.received.mark_acked();

        for frame in frames {
            self.handle_frame(frame)?;
        }

        debug!(
            "[{}] Relay holds {} bytes, resending {}",
            self.session_id,
            relay_ack,
            self.window.unacked_bytes()
        );

        for chunk in self.window.pending() {
            send_frame(&mut ws, &Frame::Data(chunk)).await?;
        }
        if self.window.fin_sent() {
            send_frame(&mut ws, &Frame::Fin).await?;
        }

        Ok(ws)
    }
}
