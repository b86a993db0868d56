//! Tunnel configuration

use iap_transport::RelayConfig;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

/// Byte pump configuration
#[derive(Debug, Clone)]
pub struct PumpConfig {
    /// Read buffer per direction; at most one buffer is in flight each way
    pub buffer_size: usize,

    /// After one direction ends, how long the other may keep going
    /// (None = until it ends too)
    pub half_close_timeout: Option<Duration>,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            buffer_size: 16 * 1024,
            half_close_timeout: None,
        }
    }
}

impl PumpConfig {
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size.max(1);
        self
    }

    pub fn with_half_close_timeout(mut self, timeout: Duration) -> Self {
        self.half_close_timeout = Some(timeout);
        self
    }
}

/// Tunnel session configuration
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Local address to listen on
    pub bind_address: IpAddr,

    /// Local port (0 = ephemeral)
    pub local_port: u16,

    /// Relay session settings
    pub relay: RelayConfig,

    /// Byte pump settings
    pub pump: PumpConfig,
}

impl TunnelConfig {
    pub fn new(relay: RelayConfig) -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            local_port: 0,
            relay,
            pump: PumpConfig::default(),
        }
    }

    pub fn with_bind_address(mut self, address: IpAddr) -> Self {
        self.bind_address = address;
        self
    }

    pub fn with_local_port(mut self, port: u16) -> Self {
        self.local_port = port;
        self
    }

    pub fn with_pump(mut self, pump: PumpConfig) -> Self {
        self.pump = pump;
        self
    }
}
