//! Tunnel errors

use iap_transport::RelayError;
use std::net::IpAddr;
use thiserror::Error;

/// Errors surfaced by a tunnel session
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TunnelError {
    /// Relay transport failure, propagated unchanged
    #[error(transparent)]
    Relay(#[from] RelayError),

    #[error("Tunnel is closed")]
    TunnelClosed,

    #[error("Failed to bind local port {address}:{port}: {reason}")]
    LocalBindFailed {
        address: IpAddr,
        port: u16,
        reason: String,
    },
}

impl TunnelError {
    /// The relay rejected or could not obtain a credential
    pub fn is_authentication_failure(&self) -> bool {
        matches!(self, TunnelError::Relay(RelayError::AuthenticationFailed(_)))
    }

    /// Whether a new tunnel for the same target may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            TunnelError::Relay(error) => error.is_retryable(),
            TunnelError::TunnelClosed => false,
            TunnelError::LocalBindFailed { .. } => false,
        }
    }
}

/// Result type for tunnel operations
pub type TunnelResult<T> = Result<T, TunnelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relay_errors_pass_through() {
        let error: TunnelError = RelayError::Timeout("handshake".into()).into();
        assert_eq!(error.to_string(), "Timeout: handshake");
        assert!(error.is_retryable());

        let auth: TunnelError = RelayError::AuthenticationFailed("401".into()).into();
        assert!(auth.is_authentication_failure());
        assert!(!auth.is_retryable());
        assert!(!TunnelError::TunnelClosed.is_retryable());
    }
}
