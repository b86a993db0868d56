//! Relay transport configuration

use crate::reconnect::ReconnectConfig;
use std::time::Duration;
use url::Url;

/// Relay session configuration
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Relay base URL (`ws://` or `wss://`)
    pub relay_url: Url,

    /// Deadline for the connect (and each reconnect) handshake
    pub handshake_timeout: Duration,

    /// Keep-alive interval (ping frames)
    pub keepalive_interval: Duration,

    /// Silence from the relay longer than this counts as a drop
    pub idle_timeout: Duration,

    /// How long a graceful close waits for outstanding data to be acknowledged
    pub close_timeout: Duration,

    /// Unacknowledged bytes kept for resend before the sender is paused
    pub max_unacked_bytes: usize,

    /// Frames queued between the session and its reader/writer
    pub channel_capacity: usize,

    /// Silent reconnect policy
    pub reconnect: ReconnectConfig,
}

impl RelayConfig {
    pub fn new(relay_url: Url) -> Self {
        Self {
            relay_url,
            handshake_timeout: Duration::from_secs(15),
            keepalive_interval: Duration::from_secs(20),
            idle_timeout: Duration::from_secs(60),
            close_timeout: Duration::from_secs(5),
            max_unacked_bytes: 1024 * 1024, // 1MB
            channel_capacity: 16,
            reconnect: ReconnectConfig::default(),
        }
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    pub fn with_max_unacked_bytes(mut self, bytes: usize) -> Self {
        self.max_unacked_bytes = bytes;
        self
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let url = Url::parse("ws://127.0.0.1:9000").unwrap();
        let config = RelayConfig::new(url.clone())
            .with_handshake_timeout(Duration::from_secs(2))
            .with_channel_capacity(0)
            .with_reconnect(ReconnectConfig::disabled());

        assert_eq!(config.relay_url, url);
        assert_eq!(config.handshake_timeout, Duration::from_secs(2));
        assert_eq!(config.channel_capacity, 1);
        assert_eq!(config.reconnect.max_attempts, Some(0));
        assert_eq!(config.idle_timeout, Duration::from_secs(60));
    }
}
