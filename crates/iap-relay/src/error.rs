//! Relay server errors

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid route '{0}': expected project/zone/instance:port=host:port")]
    InvalidRoute(String),

    #[error("Relay server is already running")]
    AlreadyRunning,
}
