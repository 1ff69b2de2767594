//! OAuth2 authorization server core.
//!
//! Authenticates principals by password or through an external identity
//! provider, runs the authorization code and refresh token grants for
//! registered clients, and signs access tokens with a rotating Ed25519 key
//! published as a JWK set. Account data lives behind [`directory::AccountDirectory`].

pub mod api;
pub mod config;
pub mod directory;
pub mod error;
pub mod oauth2;
