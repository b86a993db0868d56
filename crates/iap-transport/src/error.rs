//! Relay transport errors

use thiserror::Error;

/// Errors surfaced by a relay session
///
/// Cloneable so a terminal error can be handed to every reader, writer and
/// state subscriber of the session.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RelayError {
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Target unreachable: {0}")]
    TargetUnreachable(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Reconnect failed after {attempts} attempts: {last_error}")]
    ReconnectExhausted { attempts: usize, last_error: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Relay session closed")]
    Closed,
}

impl RelayError {
    /// Whether the caller may reasonably retry with a new session
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RelayError::Timeout(_)
                | RelayError::ConnectionFailed(_)
                | RelayError::ConnectionLost(_)
                | RelayError::ReconnectExhausted { .. }
        )
    }
}

/// Result type for relay operations
pub type RelayResult<T> = Result<T, RelayError>;
