//! Relay transport
//!
//! A [`RelayConnection`] is one logical session to the relay for one
//! [`Target`](iap_proto::Target). A driver task owns the WebSocket: it frames
//! outbound bytes, tracks acknowledgements, keeps the connection alive and
//! silently resumes the session on a new WebSocket after a transient drop.
//!
//! ```text
//!  RelayWriter ──mpsc──▶ ┌────────┐ ──DATA/FIN──▶
//!                        │ driver │                relay (WebSocket)
//!  RelayReader ◀──mpsc── └────────┘ ◀──DATA/ACK──
//! ```

pub mod config;
pub mod connection;
mod driver;
pub mod error;
mod handshake;
pub mod reconnect;

pub use config::RelayConfig;
pub use connection::{RelayConnection, RelayReader, RelayState, RelayStats, RelayWriter};
pub use error::{RelayError, RelayResult};
pub use reconnect::{ReconnectConfig, ReconnectError, ReconnectManager};
