//! Bearer credential

use chrono::{DateTime, Duration, Utc};
use std::fmt;

/// Credentials expiring within this window are treated as already expired
const CLOCK_SKEW_SECS: i64 = 30;

/// An opaque, possibly time-limited bearer token
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    token: String,
    expires_at: Option<DateTime<Utc>>,
}

impl Credential {
    /// A credential with no known expiry
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            expires_at: None,
        }
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    /// Value for the `Authorization` header
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.token)
    }

    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(expires_at) => Utc::now() + Duration::seconds(CLOCK_SKEW_SECS) >= expires_at,
            None => false,
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expiry_with_skew() {
        let fresh = Credential::new("t").with_expiry(Utc::now() + Duration::hours(1));
        assert!(!fresh.is_expired());

        let nearly = Credential::new("t").with_expiry(Utc::now() + Duration::seconds(5));
        assert!(nearly.is_expired());

        let past = Credential::new("t").with_expiry(Utc::now() - Duration::seconds(1));
        assert!(past.is_expired());

        assert!(!Credential::new("t").is_expired());
    }

    #[test]
    fn test_debug_hides_token() {
        let credential = Credential::new("super-secret");
        let printed = format!("{:?}", credential);
        assert!(!printed.contains("super-secret"));
        assert_eq!(credential.bearer(), "Bearer super-secret");
    }
}
