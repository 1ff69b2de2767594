use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

/// OAuth2 error body (RFC 6749 Section 5.2).
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_description: Option<String>,
}

impl ErrorResponse {
    pub fn new(error: &str, description: Option<&str>) -> Self {
        Self {
            error: error.to_string(),
            error_description: description.map(String::from),
        }
    }

    pub fn into_response_with(self, status: StatusCode) -> Response {
        (status, Json(self)).into_response()
    }
}

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("Account directory unreachable: {0}")]
    Unreachable(String),
    #[error("Account directory returned HTTP {status}: {context}")]
    Status { status: u16, context: String },
    #[error("Invalid account directory response: {0}")]
    Decode(String),
    #[error("Invalid account directory URL: {0}")]
    InvalidUrl(String),
}

impl DirectoryError {
    pub fn is_retryable(&self) -> bool {
        match self {
            DirectoryError::Unreachable(_) => true,
            DirectoryError::Status { status, .. } => *status >= 500,
            DirectoryError::Decode(_) | DirectoryError::InvalidUrl(_) => false,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClientAuthenticationError {
    #[error("Unknown client: {0}")]
    UnknownClient(String),
    #[error("Client {client_id} may not authenticate with {method}")]
    MethodNotAllowed { client_id: String, method: String },
    #[error("Invalid credential for client {0}")]
    InvalidCredential(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthorizationError {
    #[error("Unknown client: {0}")]
    UnknownClient(String),
    #[error("Client {0} is not authorized for the authorization_code grant")]
    UnauthorizedClient(String),
    #[error("Redirect URI is not registered for this client: {0}")]
    RedirectUriMismatch(String),
    #[error("Scope not allowed for this client: {0}")]
    ScopeNotAllowed(String),
    #[error("Principal {0} is disabled")]
    PrincipalDisabled(String),
    #[error("Client {0} must send a S256 code_challenge")]
    PkceRequired(String),
    #[error(transparent)]
    Key(#[from] KeyError),
}

impl AuthorizationError {
    /// OAuth2 error code for this rejection.
    pub fn code(&self) -> &'static str {
        match self {
            AuthorizationError::UnknownClient(_) => "invalid_client",
            AuthorizationError::UnauthorizedClient(_) => "unauthorized_client",
            AuthorizationError::RedirectUriMismatch(_) => "invalid_request",
            AuthorizationError::ScopeNotAllowed(_) => "invalid_scope",
            AuthorizationError::PrincipalDisabled(_) => "access_denied",
            AuthorizationError::PkceRequired(_) => "invalid_request",
            AuthorizationError::Key(_) => "server_error",
        }
    }

    /// Whether the redirect URI can be trusted for an error redirect.
    ///
    /// Errors raised before the client and its redirect URI are validated
    /// must never redirect.
    pub fn redirect_is_safe(&self) -> bool {
        matches!(
            self,
            AuthorizationError::ScopeNotAllowed(_)
                | AuthorizationError::UnauthorizedClient(_)
                | AuthorizationError::PrincipalDisabled(_)
                | AuthorizationError::PkceRequired(_)
        )
    }
}

#[derive(Debug, Error)]
pub enum TokenError {
    #[error(transparent)]
    Client(#[from] ClientAuthenticationError),
    #[error("Invalid grant: {0}")]
    InvalidGrant(String),
    #[error("Client {0} is not allowed to use this grant type")]
    UnauthorizedClient(String),
    #[error("Unsupported grant type: {0}")]
    UnsupportedGrantType(String),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Failed to sign access token: {0}")]
    Signing(#[from] jsonwebtoken::errors::Error),
    #[error(transparent)]
    Key(#[from] KeyError),
}

impl IntoResponse for TokenError {
    fn into_response(self) -> Response {
        let (status, code, description) = match &self {
            TokenError::Client(e) => {
                tracing::info!(reason = %e, "Client authentication failed");
                (StatusCode::UNAUTHORIZED, "invalid_client", None)
            }
            TokenError::InvalidGrant(reason) => (
                StatusCode::BAD_REQUEST,
                "invalid_grant",
                Some(reason.as_str()),
            ),
            TokenError::UnauthorizedClient(_) => {
                (StatusCode::BAD_REQUEST, "unauthorized_client", None)
            }
            TokenError::UnsupportedGrantType(_) => {
                (StatusCode::BAD_REQUEST, "unsupported_grant_type", None)
            }
            TokenError::InvalidRequest(reason) => (
                StatusCode::BAD_REQUEST,
                "invalid_request",
                Some(reason.as_str()),
            ),
            TokenError::Signing(e) => {
                tracing::error!(error = %e, "Token signing failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "server_error", None)
            }
            TokenError::Key(e) => {
                tracing::error!(error = %e, "Token generation failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "server_error", None)
            }
        };
        let mut response = ErrorResponse::new(code, description).into_response_with(status);
        if status == StatusCode::UNAUTHORIZED {
            response.headers_mut().insert(
                axum::http::header::WWW_AUTHENTICATE,
                axum::http::HeaderValue::from_static("Basic realm=\"oauth2\""),
            );
        }
        response
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InvalidTokenError {
    #[error("Malformed token: {0}")]
    Malformed(String),
    #[error("No verification key for kid {0:?}")]
    UnknownKey(Option<String>),
    #[error("Signature or claims rejected: {0}")]
    Rejected(String),
    #[error("Token expired")]
    Expired,
}

/// Password-login failures. All variants surface to the user as the same
/// generic message; the distinction only reaches the logs.
#[derive(Debug, Error)]
pub enum AuthenticationError {
    #[error("Account not found")]
    AccountNotFound,
    #[error("Account locked")]
    AccountLocked,
    #[error("Invalid credentials")]
    InvalidCredentials,
    #[error(transparent)]
    Directory(#[from] DirectoryError),
}

impl IntoResponse for AuthenticationError {
    fn into_response(self) -> Response {
        match self {
            AuthenticationError::Directory(e) => {
                tracing::error!(error = %e, "Account directory unavailable during login");
                ErrorResponse::new("server_error", Some("Account directory unavailable"))
                    .into_response_with(StatusCode::SERVICE_UNAVAILABLE)
            }
            reason => {
                tracing::info!(%reason, "Password login failed");
                ErrorResponse::new("authentication_failed", Some("Invalid email or password"))
                    .into_response_with(StatusCode::UNAUTHORIZED)
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum FederationError {
    #[error("Unsupported identity provider: {0}")]
    UnsupportedProvider(String),
    #[error("Identity provider {0} is not configured")]
    ProviderNotConfigured(String),
    #[error("Identity provider response is missing {0}")]
    MissingAttribute(&'static str),
    #[error("Identity provider error during {operation}: {detail}")]
    Provider {
        operation: &'static str,
        detail: String,
    },
    #[error("Linked account is locked")]
    AccountLocked,
    #[error("Identity provider has not verified the email address")]
    UnverifiedEmail,
    #[error("Email {0} belongs to an account not linked to this identity")]
    EmailInUse(String),
    #[error(transparent)]
    Directory(#[from] DirectoryError),
    #[error(transparent)]
    Key(#[from] KeyError),
}

impl From<reqwest::Error> for FederationError {
    fn from(e: reqwest::Error) -> Self {
        FederationError::Provider {
            operation: "request",
            detail: e.to_string(),
        }
    }
}

impl IntoResponse for FederationError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            FederationError::UnsupportedProvider(_) | FederationError::ProviderNotConfigured(_) => {
                (StatusCode::BAD_REQUEST, "unsupported_provider")
            }
            FederationError::AccountLocked | FederationError::UnverifiedEmail => {
                (StatusCode::UNAUTHORIZED, "authentication_failed")
            }
            FederationError::EmailInUse(_) => (StatusCode::CONFLICT, "account_exists"),
            FederationError::MissingAttribute(_) | FederationError::Provider { .. } => {
                (StatusCode::BAD_GATEWAY, "provider_error")
            }
            FederationError::Directory(_) => (StatusCode::SERVICE_UNAVAILABLE, "server_error"),
            FederationError::Key(_) => (StatusCode::INTERNAL_SERVER_ERROR, "server_error"),
        };
        if status.is_server_error() {
            tracing::error!(error = %self, "Federated login failed");
        } else {
            tracing::info!(error = %self, "Federated login rejected");
        }
        ErrorResponse::new(code, None).into_response_with(status)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("Entropy source unavailable: {0}")]
    Entropy(String),
    #[error("Failed to encode signing key: {0}")]
    Encoding(String),
}

impl IntoResponse for KeyError {
    fn into_response(self) -> Response {
        tracing::error!(error = %self, "Random token generation failed");
        ErrorResponse::new("server_error", None)
            .into_response_with(StatusCode::INTERNAL_SERVER_ERROR)
    }
}
