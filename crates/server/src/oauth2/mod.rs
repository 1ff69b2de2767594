//! OAuth2 Authorization Server module.
//!
//! Authenticates principals (password or external identity provider), issues
//! authorization codes, access tokens and refresh tokens, and publishes the
//! keys resource servers verify access tokens with.
//!
//! ## Supported Flows
//!
//! - Authorization Code
//! - Refresh Token
//!
//! ## Endpoints
//!
//! - `GET /oauth2/authorize` - Authorization endpoint
//! - `POST /oauth2/token` - Token endpoint
//! - `POST /oauth2/revoke` - Refresh token revocation
//! - `POST /oauth2/introspect` - Token introspection
//! - `GET /oauth2/jwks` - Verification keys
//! - `GET /.well-known/openid-configuration` - Discovery
//! - `POST /login`, `POST /logout` - Password login session
//! - `GET /oauth2/authorization/{provider}` - Federated login
//! - `GET /login/oauth2/code/{provider}` - Federated login callback
//! - `POST /register` - Account registration

pub mod authenticator;
pub mod clock;
pub mod endpoints;
pub mod engine;
pub mod identity;
pub mod keys;
pub mod login;
pub mod password;
pub mod provider;
pub mod register;
pub mod registrar;
pub mod session;
pub mod state;
pub mod store;

pub use authenticator::CredentialAuthenticator;
pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::{AccessTokenClaims, ClientCredentials, TokenEngine, TokenPair};
pub use identity::FederatedIdentityBridge;
pub use keys::{RotatingKeyProvider, SigningKeyProvider};
pub use password::{hash_password, verify_password};
pub use registrar::ClientRegistry;
pub use state::{OAuth2State, spawn_purge_task};

use utoipa_axum::router::OpenApiRouter;

/// OpenAPI tag for OAuth2 endpoints
pub const OAUTH2_TAG: &str = "OAuth2";

/// Creates the authorization server router.
pub fn router(state: OAuth2State) -> OpenApiRouter {
    OpenApiRouter::new()
        .merge(endpoints::router())
        .merge(login::router())
        .merge(register::router())
        .with_state(state)
}
