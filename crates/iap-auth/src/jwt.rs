//! JWT (JSON Web Token) handling

use chrono::{Duration, Utc};
use iap_proto::Target;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// JWT claims presented to the relay
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RelayClaims {
    /// Subject (caller identity)
    pub sub: String,
    /// Issued at (timestamp)
    pub iat: i64,
    /// Expiration time (timestamp)
    pub exp: i64,
    /// Issuer
    pub iss: String,
    /// Audience
    pub aud: String,
    /// Targets the caller may open sessions to
    ///
    /// Entries are `project/zone/instance:port`, `project/zone/instance` (any
    /// port) or `*`. `None` allows every target.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_targets: Option<Vec<String>>,
}

impl RelayClaims {
    pub fn new(subject: String, issuer: String, audience: String, validity: Duration) -> Self {
        let now = Utc::now();
        let exp = now + validity;

        Self {
            sub: subject,
            iat: now.timestamp(),
            exp: exp.timestamp(),
            iss: issuer,
            aud: audience,
            allowed_targets: None,
        }
    }

    /// Restrict the token to the given targets (empty keeps it unrestricted)
    pub fn with_allowed_targets(mut self, targets: Vec<String>) -> Self {
        self.allowed_targets = if targets.is_empty() {
            None
        } else {
            Some(targets)
        };
        self
    }

    pub fn is_expired(&self) -> bool {
        Utc::now().timestamp() > self.exp
    }

    pub fn allows(&self, target: &Target) -> bool {
        let Some(allowed) = &self.allowed_targets else {
            return true;
        };

        let full = target.to_string();
        let any_port = format!(
            "{}/{}/{}",
            target.project(),
            target.zone(),
            target.instance()
        );

        allowed
            .iter()
            .any(|entry| entry == "*" || *entry == full || *entry == any_port)
    }
}

/// JWT errors
#[derive(Debug, Error)]
pub enum JwtError {
    #[error("JWT encoding error: {0}")]
    EncodingError(#[from] jsonwebtoken::errors::Error),

    #[error("Token expired")]
    TokenExpired,

    #[error("Invalid token: {0}")]
    InvalidToken(String),
}

/// JWT validator (HMAC-SHA256)
pub struct JwtValidator {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtValidator {
    /// Validates signature and expiry only, unless issuer or audience are set
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.validate_aud = false;
        validation.validate_nbf = false;

        Self {
            decoding_key: DecodingKey::from_secret(secret),
            validation,
        }
    }

    pub fn with_audience(mut self, audience: String) -> Self {
        self.validation.set_audience(&[audience]);
        self
    }

    pub fn with_issuer(mut self, issuer: String) -> Self {
        self.validation.set_issuer(&[issuer]);
        self
    }

    pub fn validate(&self, token: &str) -> Result<RelayClaims, JwtError> {
        let token_data = decode::<RelayClaims>(token, &self.decoding_key, &self.validation)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => JwtError::TokenExpired,
                _ => JwtError::InvalidToken(e.to_string()),
            })?;

        if token_data.claims.is_expired() {
            return Err(JwtError::TokenExpired);
        }

        Ok(token_data.claims)
    }

    /// Encode JWT using HMAC-SHA256
    pub fn encode(secret: &[u8], claims: &RelayClaims) -> Result<String, JwtError> {
        let header = Header::new(Algorithm::HS256);
        let encoding_key = EncodingKey::from_secret(secret);

        Ok(encode(&header, claims, &encoding_key)?)
    }
}
