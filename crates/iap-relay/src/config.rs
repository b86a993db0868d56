//! Relay server configuration

use crate::routes::RouteTable;
use std::net::SocketAddr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RelayServerConfig {
    /// Address to listen on
    pub bind_addr: SocketAddr,

    /// Target routing
    pub routes: RouteTable,

    /// HS256 secret for bearer tokens (None = accept any caller)
    pub jwt_secret: Option<Vec<u8>>,

    /// How long a detached session keeps its backend connection
    pub session_linger: Duration,

    /// Deadline for connecting to a backend
    pub backend_connect_timeout: Duration,

    /// Interval at which pending acknowledgements are flushed
    pub keepalive_interval: Duration,

    /// Unacknowledged bytes kept per session for resend
    pub max_unacked_bytes: usize,
}

impl Default for RelayServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            routes: RouteTable::new(),
            jwt_secret: None,
            session_linger: Duration::from_secs(60),
            backend_connect_timeout: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(20),
            max_unacked_bytes: 1024 * 1024,
        }
    }
}

impl RelayServerConfig {
    pub fn with_bind_addr(mut self, bind_addr: SocketAddr) -> Self {
        self.bind_addr = bind_addr;
        self
    }

    pub fn with_routes(mut self, routes: RouteTable) -> Self {
        self.routes = routes;
        self
    }

    pub fn with_jwt_secret(mut self, secret: impl Into<Vec<u8>>) -> Self {
        self.jwt_secret = Some(secret.into());
        self
    }

    pub fn with_session_linger(mut self, linger: Duration) -> Self {
        self.session_linger = linger;
        self
    }

    pub fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }
}
