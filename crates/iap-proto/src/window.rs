//! Byte accounting for acknowledgement and resend
//!
//! Both directions count payload bytes only. A sender keeps every DATA payload
//! until the peer acknowledges it, so the unacknowledged tail can be resent on a
//! fresh WebSocket after a reconnect.

use crate::frame::MAX_DATA_FRAME_SIZE;
use bytes::{Buf, Bytes};
use std::collections::VecDeque;
use thiserror::Error;

/// Received bytes beyond the last ACK that trigger a new ACK
pub const ACK_THRESHOLD: u64 = 2 * MAX_DATA_FRAME_SIZE as u64;

/// Window errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WindowError {
    #[error("Peer acknowledged {ack} bytes but only {sent} were sent")]
    InvalidAck { ack: u64, sent: u64 },
}

/// Outbound payload not yet acknowledged by the peer
#[derive(Debug)]
pub struct SendWindow {
    limit: usize,
    pending: VecDeque<Bytes>,
    unacked: usize,
    sent: u64,
    acked: u64,
    fin_sent: bool,
}

impl SendWindow {
    /// `limit` bounds the unacknowledged bytes held for resend
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(MAX_DATA_FRAME_SIZE),
            pending: VecDeque::new(),
            unacked: 0,
            sent: 0,
            acked: 0,
            fin_sent: false,
        }
    }

    /// Whether another DATA frame may be sent without exceeding the limit
    pub fn has_capacity(&self) -> bool {
        self.unacked < self.limit
    }

    pub fn unacked_bytes(&self) -> usize {
        self.unacked
    }

    /// Record a payload that is about to be sent
    pub fn push(&mut self, data: Bytes) {
        if data.is_empty() {
            return;
        }
        self.unacked += data.len();
        self.sent += data.len() as u64;
        self.pending.push_back(data);
    }

    /// Total payload bytes sent over the session
    pub fn bytes_sent(&self) -> u64 {
        self.sent
    }

    /// Total payload bytes the peer has confirmed
    pub fn acked(&self) -> u64 {
        self.acked
    }

    /// Whether everything sent has been acknowledged
    pub fn is_drained(&self) -> bool {
        self.unacked == 0
    }

    /// Release everything up to `ack` total bytes
    ///
    /// Stale acknowledgements (below what was already confirmed) are ignored.
    pub fn acknowledge(&mut self, ack: u64) -> Result<(), WindowError> {
        if ack > self.sent {
            return Err(WindowError::InvalidAck {
                ack,
                sent: self.sent,
            });
        }
        if ack <= self.acked {
            return Ok(());
        }

        let mut remaining = (ack - self.acked) as usize;
        while remaining > 0 {
            let Some(front) = self.pending.front_mut() else {
                break;
            };
            if front.len() <= remaining {
                remaining -= front.len();
                self.unacked -= front.len();
                self.pending.pop_front();
            } else {
                front.advance(remaining);
                self.unacked -= remaining;
                remaining = 0;
            }
        }

        self.acked = ack;
        Ok(())
    }

    /// Unacknowledged payloads in send order
    pub fn pending(&self) -> Vec<Bytes> {
        self.pending.iter().cloned().collect()
    }

    pub fn mark_fin(&mut self) {
        self.fin_sent = true;
    }

    pub fn fin_sent(&self) -> bool {
        self.fin_sent
    }
}

/// Inbound byte counter driving ACK emission
#[derive(Debug, Default)]
pub struct ReceiveCounter {
    received: u64,
    last_acked: u64,
}

impl ReceiveCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, len: usize) {
        self.received += len as u64;
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    /// Enough has arrived since the last ACK that one should be sent now
    pub fn ack_due(&self) -> bool {
        self.received - self.last_acked > ACK_THRESHOLD
    }

    /// Some bytes have not been acknowledged yet
    pub fn ack_pending(&self) -> bool {
        self.received > self.last_acked
    }

    /// Note that the peer has been told about everything received, returns the ACK value
    pub fn mark_acked(&mut self) -> u64 {
        self.last_acked = self.received;
        self.received
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acknowledge_releases_whole_and_partial_chunks() {
        let mut window = SendWindow::new(64 * 1024);
        window.push(Bytes::from_static(b"hello"));
        window.push(Bytes::from_static(b"world"));
        assert_eq!(window.unacked_bytes(), 10);

        window.acknowledge(7).unwrap();
        assert_eq!(window.acked(), 7);
        assert_eq!(window.unacked_bytes(), 3);
        assert_eq!(window.pending(), vec![Bytes::from_static(b"rld")]);

        window.acknowledge(10).unwrap();
        assert!(window.is_drained());
        assert!(window.pending().is_empty());
    }

    #[test]
    fn test_stale_ack_is_ignored() {
        let mut window = SendWindow::new(64 * 1024);
        window.push(Bytes::from_static(b"abcdef"));
        window.acknowledge(4).unwrap();
        window.acknowledge(2).unwrap();
        assert_eq!(window.acked(), 4);
        assert_eq!(window.unacked_bytes(), 2);
    }

    #[test]
    fn test_ack_beyond_sent_is_rejected() {
        let mut window = SendWindow::new(64 * 1024);
        window.push(Bytes::from_static(b"abc"));
        assert_eq!(
            window.acknowledge(4),
            Err(WindowError::InvalidAck { ack: 4, sent: 3 })
        );
    }

    #[test]
    fn test_capacity_limit() {
        let mut window = SendWindow::new(MAX_DATA_FRAME_SIZE);
        assert!(window.has_capacity());
        window.push(Bytes::from(vec![0u8; MAX_DATA_FRAME_SIZE]));
        assert!(!window.has_capacity());
        window.acknowledge(1).unwrap();
        assert!(window.has_capacity());
    }

    #[test]
    fn test_receive_counter_threshold() {
        let mut counter = ReceiveCounter::new();
        counter.record(MAX_DATA_FRAME_SIZE);
        counter.record(MAX_DATA_FRAME_SIZE);
        assert!(counter.ack_pending());
        assert!(!counter.ack_due());

        counter.record(1);
        assert!(counter.ack_due());
        assert_eq!(counter.mark_acked(), ACK_THRESHOLD + 1);
        assert!(!counter.ack_pending());
    }
}
