//! Bidirectional copy between a local socket and a relay session

use crate::config::PumpConfig;
use bytes::Bytes;
use iap_transport::{RelayConnection, RelayError, RelayReader, RelayWriter};
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Why the pump stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpEnd {
    /// Both directions reached end of stream
    Completed,
    /// The local client went away; the relay was closed gracefully
    LocalDisconnected,
    /// One direction ended and the other did not follow in time
    HalfCloseTimeout,
    Cancelled,
}

/// Outcome of a pump run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PumpStats {
    /// Bytes read from the local socket and handed to the relay
    pub bytes_to_relay: u64,
    /// Bytes received from the relay and written to the local socket
    pub bytes_from_relay: u64,
    pub end: PumpEnd,
}

enum Failure {
    Local(io::Error),
    Relay(RelayError),
}

async fn local_to_relay<R>(
    local: &mut R,
    relay: &mut RelayWriter,
    buffer_size: usize,
    total: &mut u64,
) -> Result<(), Failure>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; buffer_size];
    loop {
        let n = local.read(&mut buf).await.map_err(Failure::Local)?;
        if n == 0 {
            trace!("Local client finished sending");
            return relay.finish().await.map_err(Failure::Relay);
        }

        relay
            .send(Bytes::copy_from_slice(&buf[..n]))
            .await
            .map_err(Failure::Relay)?;
        *total += n as u64;
    }
}

async fn relay_to_local<W>(
    relay: &mut RelayReader,
    local: &mut W,
    total: &mut u64,
) -> Result<(), Failure>
where
    W: AsyncWrite + Unpin,
{
    while let Some(data) = relay.receive().await.map_err(Failure::Relay)? {
        local.write_all(&data).await.map_err(Failure::Local)?;
        *total += data.len() as u64;
    }

    trace!("Relay finished sending");
    local.shutdown().await.map_err(Failure::Local)
}

/// Copy bytes both ways until both directions end, an error fires, or
/// `cancel` is triggered
///
/// Relay failures are returned as errors. A local socket failure is a normal
/// end: the relay is closed gracefully and [`PumpEnd::LocalDisconnected`] is
/// reported.
pub async fn run(
    local: &mut TcpStream,
    relay: &mut RelayConnection,
    config: &PumpConfig,
    cancel: &CancellationToken,
) -> Result<PumpStats, RelayError> {
    let mut bytes_to_relay = 0u64;
    let mut bytes_from_relay = 0u64;

    let outcome = {
        let (mut local_reader, mut local_writer) = local.split();
        let (relay_writer, relay_reader) = relay.io();

        let upstream = local_to_relay(
            &mut local_reader,
            relay_writer,
            config.buffer_size,
            &mut bytes_to_relay,
        );
        let downstream = relay_to_local(relay_reader, &mut local_writer, &mut bytes_from_relay);
        let half_close = sleep(Duration::ZERO);
        tokio::pin!(upstream, downstream, half_close);

        let mut upstream_done = false;
        let mut downstream_done = false;
        let mut half_close_armed = false;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break Ok(PumpEnd::Cancelled),

                result = &mut upstream, if !upstream_done => match result {
                    Ok(()) => upstream_done = true,
                    Err(failure) => break Err(failure),
                },

                result = &mut downstream, if !downstream_done => match result {
                    Ok(()) => downstream_done = true,
                    Err(failure) => break Err(failure),
                },

                () = &mut half_close, if half_close_armed => break Ok(PumpEnd::HalfCloseTimeout),
            }

            if upstream_done && downstream_done {
                break Ok(PumpEnd::Completed);
            }

            if !half_close_armed && (upstream_done || downstream_done) {
                if let Some(timeout) = config.half_close_timeout {
                    half_close.as_mut().reset(Instant::now() + timeout);
                    half_close_armed = true;
                }
            }
        }
    };

    let end = match outcome {
        Ok(end) => end,
        Err(Failure::Relay(error)) => {
            debug!("[{}] Relay failed mid-stream: {}", relay.session_id(), error);
            return Err(error);
        }
        Err(Failure::Local(error)) => {
            debug!(
                "[{}] Local connection ended: {}",
                relay.session_id(),
                error
            );
            relay.close().await;
            PumpEnd::LocalDisconnected
        }
    };

    Ok(PumpStats {
        bytes_to_relay,
        bytes_from_relay,
        end,
    })
}

