//! Credential providers

use crate::credential::Credential;
use crate::jwt::{JwtError, JwtValidator, RelayClaims};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::sync::Mutex;
use thiserror::Error;
use tracing::debug;

/// Authorization errors
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Credential expired")]
    CredentialExpired,

    #[error("Token error: {0}")]
    Token(#[from] JwtError),
}

/// Source of bearer credentials for the relay
///
/// The transport asks for a credential on every handshake and every reconnect,
/// and calls [`Authorizer::refresh`] when the relay demands re-authentication.
#[async_trait]
pub trait Authorizer: Send + Sync {
    /// Current credential
    async fn credential(&self) -> Result<Credential, AuthError>;

    /// A fresh credential, discarding any cached one
    async fn refresh(&self) -> Result<Credential, AuthError> {
        self.credential().await
    }
}

/// Hands out one fixed credential
#[derive(Debug, Clone)]
pub struct StaticAuthorizer {
    credential: Credential,
}

impl StaticAuthorizer {
    pub fn new(credential: Credential) -> Self {
        Self { credential }
    }

    pub fn from_token(token: impl Into<String>) -> Self {
        Self::new(Credential::new(token))
    }
}

#[async_trait]
impl Authorizer for StaticAuthorizer {
    async fn credential(&self) -> Result<Credential, AuthError> {
        Ok(self.credential.clone())
    }
}

/// Mints HS256 tokens locally, for development relays sharing the secret
pub struct JwtAuthorizer {
    secret: Vec<u8>,
    subject: String,
    issuer: String,
    audience: String,
    validity: Duration,
    allowed_targets: Vec<String>,
    cached: Mutex<Option<Credential>>,
}

impl JwtAuthorizer {
    pub fn new(secret: impl Into<Vec<u8>>, subject: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            subject: subject.into(),
            issuer: "iap".to_string(),
            audience: "iap-relay".to_string(),
            validity: Duration::hours(1),
            allowed_targets: Vec::new(),
            cached: Mutex::new(None),
        }
    }

    pub fn with_validity(mut self, validity: Duration) -> Self {
        self.validity = validity;
        self
    }

    pub fn with_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.issuer = issuer.into();
        self
    }

    pub fn with_audience(mut self, audience: impl Into<String>) -> Self {
        self.audience = audience.into();
        self
    }

    pub fn with_allowed_targets(mut self, targets: Vec<String>) -> Self {
        self.allowed_targets = targets;
        self
    }

    /// Mint a new token without touching the cache
    pub fn mint(&self) -> Result<Credential, AuthError> {
        let claims = RelayClaims::new(
            self.subject.clone(),
            self.issuer.clone(),
            self.audience.clone(),
            self.validity,
        )
        .with_allowed_targets(self.allowed_targets.clone());

        let token = JwtValidator::encode(&self.secret, &claims)?;
        let expires_at = chrono::DateTime::<Utc>::from_timestamp(claims.exp, 0)
            .ok_or_else(|| AuthError::AuthenticationFailed("invalid expiry".to_string()))?;

        debug!("Minted relay token for {} (expires {})", self.subject, expires_at);
        Ok(Credential::new(token).with_expiry(expires_at))
    }

    fn store(&self, credential: &Credential) {
        if let Ok(mut cached) = self.cached.lock() {
            *cached = Some(credential.clone());
        }
    }
}

#[async_trait]
impl Authorizer for JwtAuthorizer {
    async fn credential(&self) -> Result<Credential, AuthError> {
        let cached = self
            .cached
            .lock()
            .ok()
            .and_then(|cached| cached.clone())
            .filter(|credential| !credential.is_expired());

        if let Some(credential) = cached {
            return Ok(credential);
        }

        let credential = self.mint()?;
        self.store(&credential);
        Ok(credential)
    }

    async fn refresh(&self) -> Result<Credential, AuthError> {
        let credential = self.mint()?;
        self.store(&credential);
        Ok(credential)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"dev-secret";

    #[tokio::test]
    async fn test_static_authorizer() {
        let authorizer = StaticAuthorizer::from_token("abc");
        assert_eq!(authorizer.credential().await.unwrap().token(), "abc");
        assert_eq!(authorizer.refresh().await.unwrap().token(), "abc");
    }

    #[tokio::test]
    async fn test_jwt_authorizer_caches_until_expiry() {
        let authorizer = JwtAuthorizer::new(SECRET, "tester")
            .with_allowed_targets(vec!["p/z/i:3389".to_string()]);

        let first = authorizer.credential().await.unwrap();
        let second = authorizer.credential().await.unwrap();
        assert_eq!(first, second);

        let claims = JwtValidator::new(SECRET).validate(first.token()).unwrap();
        assert_eq!(claims.sub, "tester");
        assert_eq!(claims.allowed_targets, Some(vec!["p/z/i:3389".to_string()]));
    }

    #[tokio::test]
    async fn test_jwt_authorizer_does_not_reuse_expired_token() {
        // Shorter than the clock skew, so every cached token counts as expired
        let authorizer = JwtAuthorizer::new(SECRET, "tester").with_validity(Duration::seconds(5));

        let first = authorizer.credential().await.unwrap();
        assert!(first.is_expired());

        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        let second = authorizer.credential().await.unwrap();
        assert_ne!(first.token(), second.token());
    }
}
