//! Reference relay
//!
//! A development relay speaking the same wire protocol as the production
//! relay: it validates bearer tokens, routes each [`Target`](iap_proto::Target)
//! to a TCP backend, and keeps sessions alive across WebSocket drops so clients
//! can resume them. Integration tests use it together with
//! [`RelayServer::drop_connections`] to inject transient failures.

pub mod config;
pub mod error;
pub mod routes;
pub mod server;
mod session;

pub use config::RelayServerConfig;
pub use error::RelayServerError;
pub use routes::RouteTable;
pub use server::RelayServer;
