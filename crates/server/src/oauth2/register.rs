//! Self-service account registration.

use crate::directory::{AccountRecord, RegistrationOutcome, normalize_email};
use crate::error::ErrorResponse;
use crate::oauth2::password::hash_password;
use crate::oauth2::{OAUTH2_TAG, state::OAuth2State};
use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use utoipa::ToSchema;
use utoipa_axum::{router::OpenApiRouter, routes};

const MIN_PASSWORD_LEN: usize = 8;

/// Creates the registration router.
pub fn router() -> OpenApiRouter<OAuth2State> {
    OpenApiRouter::new().routes(routes!(register))
}

#[derive(Deserialize, ToSchema)]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub surnames: Option<String>,
}

impl std::fmt::Debug for RegisterRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisterRequest")
            .field("email", &self.email)
            .field("name", &self.name)
            .field("surnames", &self.surnames)
            .finish_non_exhaustive()
    }
}

fn is_plausible_email(email: &str) -> bool {
    match email.split_once('@') {
        Some((local, domain)) => !local.is_empty() && domain.contains('.') && !domain.contains('@'),
        None => false,
    }
}

fn bad_request(description: &str) -> Response {
    ErrorResponse::new("invalid_request", Some(description))
        .into_response_with(StatusCode::BAD_REQUEST)
}

/// Register a password account.
#[tracing::instrument(skip(state, request), fields(email = %request.email))]
#[utoipa::path(
    post,
    path = "/register",
    tag = OAUTH2_TAG,
    operation_id = "Register Account",
    summary = "Create a password account",
    description = "Creates an account with the `DEFAULT` role in the account directory. \
                   The password is stored only as an Argon2id hash.",
    request_body = RegisterRequest,
    responses(
        (status = 201, description = "Account created"),
        (status = 400, description = "Invalid email or password too short", body = ErrorResponse),
        (status = 409, description = "Email already registered", body = ErrorResponse),
        (status = 503, description = "Account directory unavailable", body = ErrorResponse),
    )
)]
pub async fn register(
    State(state): State<OAuth2State>,
    Json(request): Json<RegisterRequest>,
) -> Response {
    let email = normalize_email(&request.email);
    if !is_plausible_email(&email) {
        return bad_request("Please enter a valid email address");
    }
    if request.password.chars().count() < MIN_PASSWORD_LEN {
        return bad_request("Password must be at least 8 characters");
    }

    let password = request.password;
    let hash = match tokio::task::spawn_blocking(move || hash_password(&password)).await {
        Ok(Ok(hash)) => hash,
        Ok(Err(e)) => {
            tracing::error!(error = %e, "Failed to hash password");
            return ErrorResponse::new("server_error", None)
                .into_response_with(StatusCode::INTERNAL_SERVER_ERROR);
        }
        Err(e) => {
            tracing::error!(error = %e, "Password hashing task failed");
            return ErrorResponse::new("server_error", None)
                .into_response_with(StatusCode::INTERNAL_SERVER_ERROR);
        }
    };

    let account = AccountRecord {
        email,
        password_hash: Some(hash),
        name: request.name.filter(|n| !n.trim().is_empty()),
        surnames: request.surnames.filter(|s| !s.trim().is_empty()),
        roles: AccountRecord::default_roles(),
        locked: false,
        federated_identity: None,
    };

    match state.directory.register_account(&account).await {
        Ok(RegistrationOutcome::Created) => {
            tracing::info!(principal = %account.email, "Registered account");
            StatusCode::CREATED.into_response()
        }
        Ok(RegistrationOutcome::AlreadyExists) => {
            ErrorResponse::new(
                "already_registered",
                Some("An account with this email already exists"),
            )
            .into_response_with(StatusCode::CONFLICT)
        }
        Err(e) => {
            tracing::error!(error = %e, "Account directory unavailable during registration");
            ErrorResponse::new("server_error", Some("Account directory unavailable"))
                .into_response_with(StatusCode::SERVICE_UNAVAILABLE)
        }
    }
}
