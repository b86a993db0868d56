//! Relay-side session: one backend connection that outlives WebSocket drops

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use iap_proto::{
    CloseCode, Frame, FrameCodec, ReceiveCounter, SendWindow, Target, MAX_DATA_FRAME_SIZE,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode as WsCloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

pub(crate) type RelayStream = WebSocketStream<TcpStream>;

/// How an attachment ended
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum AttachmentEnd {
    /// The session is over and can be forgotten
    Finished,
    /// The WebSocket went away; the session waits to be resumed
    Detached,
}

pub(crate) struct SessionState {
    backend_reader: OwnedReadHalf,
    backend_writer: OwnedWriteHalf,
    window: SendWindow,
    received: ReceiveCounter,
    backend_eof: bool,
    client_fin: bool,
    ack_now: bool,
}

pub(crate) struct RelaySession {
    sid: String,
    target: Target,
    /// Token of the attachment currently serving the session
    attachment: Mutex<Option<CancellationToken>>,
    attachments: AtomicU64,
    state: tokio::sync::Mutex<SessionState>,
}

pub(crate) async fn close_with(ws: &mut RelayStream, code: CloseCode, reason: &str) {
    let frame = CloseFrame {
        code: WsCloseCode::from(u16::from(code)),
        reason: reason.to_string().into(),
    };
    let _ = ws.close(Some(frame)).await;
}

pub(crate) async fn send_frame(ws: &mut RelayStream, frame: &Frame) -> bool {
    match FrameCodec::encode(frame) {
        Ok(encoded) => ws.send(Message::Binary(encoded.to_vec())).await.is_ok(),
        Err(_) => false,
    }
}

impl RelaySession {
    pub(crate) fn new(sid: String, target: Target, backend: TcpStream, max_unacked: usize) -> Self {
        let (backend_reader, backend_writer) = backend.into_split();
        Self {
            sid,
            target,
            attachment: Mutex::new(None),
            attachments: AtomicU64::new(0),
            state: tokio::sync::Mutex::new(SessionState {
                backend_reader,
                backend_writer,
                window: SendWindow::new(max_unacked),
                received: ReceiveCounter::new(),
                backend_eof: false,
                client_fin: false,
                ack_now: false,
            }),
        }
    }

    pub(crate) fn sid(&self) -> &str {
        &self.sid
    }

    pub(crate) fn target(&self) -> &Target {
        &self.target
    }

    /// Number of attachments so far
    pub(crate) fn attachments(&self) -> u64 {
        self.attachments.load(Ordering::SeqCst)
    }

    /// Serve the session on `ws`, displacing any attachment still holding it
    ///
    /// `resume_ack` is the client's receive count from a reconnect request;
    /// `None` for the attachment that created the session.
    pub(crate) async fn attach(
        &self,
        ws: &mut RelayStream,
        token: CancellationToken,
        resume_ack: Option<u64>,
        keepalive: Duration,
    ) -> AttachmentEnd {
        if let Ok(mut current) = self.attachment.lock() {
            if let Some(previous) = current.replace(token.clone()) {
                previous.cancel();
            }
        }
        self.attachments.fetch_add(1, Ordering::SeqCst);

        let mut state = tokio::select! {
            state = self.state.lock() => state,
            _ = token.cancelled() => return AttachmentEnd::Detached,
        };

        if let Some(ack) = resume_ack {
            if let Err(e) = state.window.acknowledge(ack) {
                warn!("[{}] Rejecting reconnect: {}", self.sid, e);
                close_with(ws, CloseCode::BadAck, "bad ack").await;
                return AttachmentEnd::Finished;
            }

            let received = state.received.mark_acked();
            if !send_frame(ws, &Frame::ReconnectSuccessAck(received)).await {
                return AttachmentEnd::Detached;
            }

            debug!(
                "[{}] Resumed at client ack {}, resending {} bytes",
                self.sid,
                ack,
                state.window.unacked_bytes()
            );

            for chunk in state.window.pending() {
                if !send_frame(ws, &Frame::Data(chunk)).await {
                    return AttachmentEnd::Detached;
                }
            }
            if state.window.fin_sent() && !send_frame(ws, &Frame::Fin).await {
                return AttachmentEnd::Detached;
            }
        }

        self.serve(ws, &mut state, &token, keepalive).await
    }

    async fn serve(
        &self,
        ws: &mut RelayStream,
        state: &mut SessionState,
        token: &CancellationToken,
        keepalive: Duration,
    ) -> AttachmentEnd {
        let mut buf = vec![0u8; MAX_DATA_FRAME_SIZE];
        let mut ticker = interval_at(Instant::now() + keepalive, keepalive);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let ack_due = state.received.ack_due()
                || (state.ack_now && state.received.ack_pending());
            state.ack_now = false;
            if ack_due {
                let ack = state.received.mark_acked();
                if !send_frame(ws, &Frame::Ack(ack)).await {
                    return AttachmentEnd::Detached;
                }
            }

            let read_backend = !state.backend_eof && state.window.has_capacity();

            tokio::select! {
                _ = token.cancelled() => {
                    debug!("[{}] Attachment dropped", self.sid);
                    return AttachmentEnd::Detached;
                }

                message = ws.next() => match message {
                    Some(Ok(Message::Binary(data))) => {
                        let frames = match FrameCodec::decode_message(&data) {
                            Ok(frames) => frames,
                            Err(e) => {
                                warn!("[{}] Invalid frame from client: {}", self.sid, e);
                                close_with(ws, CloseCode::InvalidTag, "invalid frame").await;
                                return AttachmentEnd::Finished;
                            }
                        };
                        for frame in frames {
                            if let Some(end) = self.handle_frame(ws, state, frame).await {
                                return end;
                            }
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let _ = ws.flush().await;
                        let graceful = frame
                            .map(|frame| u16::from(frame.code) == u16::from(CloseCode::Normal))
                            .unwrap_or(false);
                        return if graceful {
                            debug!("[{}] Client closed the session", self.sid);
                            AttachmentEnd::Finished
                        } else {
                            AttachmentEnd::Detached
                        };
                    }
                    Some(Ok(_)) => {}
                    Some(Err(_)) | None => return AttachmentEnd::Detached,
                },

                read = state.backend_reader.read(&mut buf), if read_backend => match read {
                    Ok(0) => {
                        debug!("[{}] Backend closed its side", self.sid);
                        state.backend_eof = true;
                        state.window.mark_fin();
                        if !send_frame(ws, &Frame::Fin).await {
                            return AttachmentEnd::Detached;
                        }
                    }
                    Ok(n) => {
                        let data = Bytes::copy_from_slice(&buf[..n]);
                        state.window.push(data.clone());
                        if !send_frame(ws, &Frame::Data(data)).await {
                            return AttachmentEnd::Detached;
                        }
                    }
                    Err(e) => {
                        warn!("[{}] Backend read failed: {}", self.sid, e);
                        close_with(ws, CloseCode::DestinationReadFailed, "backend read failed").await;
                        return AttachmentEnd::Finished;
                    }
                },

                _ = ticker.tick() => {
                    if state.received.ack_pending() {
                        state.ack_now = true;
                    }
                }
            }
        }
    }

    async fn handle_frame(
        &self,
        ws: &mut RelayStream,
        state: &mut SessionState,
        frame: Frame,
    ) -> Option<AttachmentEnd> {
        match frame {
            Frame::Data(data) => {
                if state.client_fin {
                    return None;
                }
                trace!("[{}] {} bytes for backend", self.sid, data.len());
                state.received.record(data.len());
                if let Err(e) = state.backend_writer.write_all(&data).await {
                    warn!("[{}] Backend write failed: {}", self.sid, e);
                    close_with(ws, CloseCode::DestinationWriteFailed, "backend write failed")
                        .await;
                    return Some(AttachmentEnd::Finished);
                }
            }
            Frame::Ack(ack) => {
                if let Err(e) = state.window.acknowledge(ack) {
                    warn!("[{}] {}", self.sid, e);
                    close_with(ws, CloseCode::InvalidAck, "invalid ack").await;
                    return Some(AttachmentEnd::Finished);
                }
            }
            Frame::Fin => {
                if !state.client_fin {
                    debug!("[{}] Client sent FIN", self.sid);
                    state.client_fin = true;
                    state.ack_now = true;
                    let _ = state.backend_writer.shutdown().await;
                }
            }
            other => {
                warn!("[{}] Unexpected frame {:#06x}", self.sid, other.tag());
                close_with(ws, CloseCode::InvalidTag, "unexpected frame").await;
                return Some(AttachmentEnd::Finished);
            }
        }
        None
    }
}
