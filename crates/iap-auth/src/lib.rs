//! Credentials for authenticating to the relay
//!
//! The tunnel core only consumes the [`Authorizer`] trait. This crate also ships
//! a fixed-token authorizer, a local HS256 token minter for development relays,
//! and the [`JwtValidator`] the reference relay checks bearer tokens with.

pub mod authorizer;
pub mod credential;
pub mod jwt;

pub use authorizer::{AuthError, Authorizer, JwtAuthorizer, StaticAuthorizer};
pub use credential::Credential;
pub use jwt::{JwtError, JwtValidator, RelayClaims};

// Re-export useful types
pub use async_trait::async_trait;
