//! Login endpoints.
//!
//! A successful login establishes a session cookie that `/oauth2/authorize`
//! accepts. Two ways in:
//! - `POST /login` with email and password
//! - `GET /oauth2/authorization/{provider}` which sends the browser to an
//!   external provider, which sends it back to `/login/oauth2/code/{provider}`
//!
//! The federated `state` is also set in a short-lived cookie, and the callback
//! only accepts a `state` that matches the cookie of the browser presenting it.

use crate::directory::PrincipalIdentity;
use crate::error::{ErrorResponse, FederationError};
use crate::oauth2::provider::FederatedProvider;
use crate::oauth2::{OAUTH2_TAG, state::OAuth2State};
use axum::{
    Form,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Redirect, Response},
};
use axum_extra::extract::{
    CookieJar,
    cookie::{Cookie, SameSite},
};
use serde::Deserialize;
use subtle::ConstantTimeEq;
use utoipa::{IntoParams, ToSchema};
use utoipa_axum::{router::OpenApiRouter, routes};

/// Form data for password login.
#[derive(Deserialize, ToSchema)]
pub struct LoginForm {
    pub email: String,
    pub password: String,
}

impl std::fmt::Debug for LoginForm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoginForm")
            .field("email", &self.email)
            .finish_non_exhaustive()
    }
}

/// Query parameters the external provider sends back.
#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct CallbackQuery {
    pub code: Option<String>,
    pub state: Option<String>,
    /// Set instead of `code` when the user declined at the provider
    pub error: Option<String>,
}

/// Cookie binding a federated login in flight to the browser that started it.
pub const LOGIN_STATE_COOKIE: &str = "AUTHZ_LOGIN_STATE";
const LOGIN_STATE_PATH: &str = "/login/oauth2/code";

/// Creates the login router.
pub fn router() -> OpenApiRouter<OAuth2State> {
    OpenApiRouter::new()
        .routes(routes!(login))
        .routes(routes!(logout))
        .routes(routes!(federated_start))
        .routes(routes!(federated_callback))
}

/// Principal behind the request's session cookie, if any.
pub fn session_principal(state: &OAuth2State, jar: &CookieJar) -> Option<PrincipalIdentity> {
    jar.get(&state.session_config.cookie_name)
        .and_then(|cookie| state.sessions.get(cookie.value()))
}

fn start_session(
    state: &OAuth2State,
    jar: CookieJar,
    principal: PrincipalIdentity,
) -> Result<CookieJar, Response> {
    let id = state
        .sessions
        .create(principal)
        .map_err(IntoResponse::into_response)?;
    let cookie = Cookie::build((state.session_config.cookie_name.clone(), id))
        .http_only(true)
        .secure(state.session_config.secure)
        .same_site(SameSite::Lax)
        .path("/")
        .max_age(state.sessions.ttl());
    Ok(jar.add(cookie))
}

/// Password login.
#[tracing::instrument(skip(state, jar))]
#[utoipa::path(
    post,
    path = "/login",
    tag = OAUTH2_TAG,
    operation_id = "Password Login",
    summary = "Log in with email and password",
    description = "Checks the credentials against the account directory and sets the session cookie. \
                   Every kind of failure (unknown email, wrong password, locked account) produces \
                   the same response.",
    request_body(
        content = LoginForm,
        content_type = "application/x-www-form-urlencoded",
    ),
    responses(
        (status = 204, description = "Logged in; session cookie set"),
        (status = 401, description = "Authentication failed", body = ErrorResponse),
        (status = 503, description = "Account directory unavailable", body = ErrorResponse),
    )
)]
pub async fn login(
    State(state): State<OAuth2State>,
    jar: CookieJar,
    Form(form): Form<LoginForm>,
) -> Result<(CookieJar, StatusCode), Response> {
    let principal = state
        .authenticator
        .authenticate(&form.email, &form.password)
        .await
        .map_err(IntoResponse::into_response)?;

    tracing::info!(principal = %principal.principal_id, "Password login succeeded");
    let jar = start_session(&state, jar, principal)?;
    Ok((jar, StatusCode::NO_CONTENT))
}

/// End the current session.
#[tracing::instrument(skip(state, jar))]
#[utoipa::path(
    post,
    path = "/logout",
    tag = OAUTH2_TAG,
    operation_id = "Logout",
    summary = "End the login session",
    responses(
        (status = 204, description = "Session ended (or there was none)"),
    )
)]
pub async fn logout(State(state): State<OAuth2State>, jar: CookieJar) -> (CookieJar, StatusCode) {
    let name = state.session_config.cookie_name.clone();
    if let Some(cookie) = jar.get(&name) {
        state.sessions.remove(cookie.value());
    }
    (jar.remove(Cookie::build(name).path("/")), StatusCode::NO_CONTENT)
}

/// Start a federated login.
#[tracing::instrument(skip(state, jar))]
#[utoipa::path(
    get,
    path = "/oauth2/authorization/{provider}",
    tag = OAUTH2_TAG,
    operation_id = "Federated Login",
    summary = "Log in through an external identity provider",
    params(
        ("provider" = String, Path, description = "Provider name, e.g. `google`"),
    ),
    responses(
        (status = 303, description = "Redirect to the provider's login page; login state cookie set"),
        (status = 400, description = "Unknown or unconfigured provider", body = ErrorResponse),
    )
)]
pub async fn federated_start(
    State(state): State<OAuth2State>,
    Path(provider): Path<String>,
    jar: CookieJar,
) -> Result<(CookieJar, Redirect), FederationError> {
    let provider: FederatedProvider = provider.parse()?;
    let client = state.provider(provider)?;
    let ttl = state.pending_login_ttl();
    let login_state = state
        .pending_logins
        .issue(provider, state.clock.now(), ttl)?;

    let cookie = Cookie::build((LOGIN_STATE_COOKIE, login_state.clone()))
        .http_only(true)
        .secure(state.session_config.secure)
        .same_site(SameSite::Lax)
        .path(LOGIN_STATE_PATH)
        .max_age(ttl);
    Ok((
        jar.add(cookie),
        Redirect::to(&client.authorization_url(&login_state)),
    ))
}

/// Federated login callback.
#[tracing::instrument(skip(state, jar, params))]
#[utoipa::path(
    get,
    path = "/login/oauth2/code/{provider}",
    tag = OAUTH2_TAG,
    operation_id = "Federated Login Callback",
    summary = "Complete a federated login",
    description = "Checks `state` against the login state cookie, redeems the provider's \
                   authorization code, reads the user's profile, provisions the local account on \
                   first login and sets the session cookie.",
    params(
        ("provider" = String, Path, description = "Provider name, e.g. `google`"),
        CallbackQuery,
    ),
    responses(
        (status = 204, description = "Logged in; session cookie set"),
        (status = 400, description = "Unknown provider, invalid state or declined login", body = ErrorResponse),
        (status = 401, description = "Linked account is locked or email not verified", body = ErrorResponse),
        (status = 409, description = "Email belongs to an account not linked to this identity", body = ErrorResponse),
        (status = 502, description = "Identity provider failure", body = ErrorResponse),
    )
)]
pub async fn federated_callback(
    State(state): State<OAuth2State>,
    Path(provider): Path<String>,
    jar: CookieJar,
    Query(params): Query<CallbackQuery>,
) -> Response {
    let bound_state = jar
        .get(LOGIN_STATE_COOKIE)
        .map(|cookie| cookie.value().to_string());
    let jar = jar.remove(Cookie::build(LOGIN_STATE_COOKIE).path(LOGIN_STATE_PATH));

    match complete_federated_login(&state, &provider, bound_state.as_deref(), &params).await {
        Ok(principal) => match start_session(&state, jar, principal) {
            Ok(jar) => (jar, StatusCode::NO_CONTENT).into_response(),
            Err(response) => response,
        },
        Err(response) => (jar, response).into_response(),
    }
}

async fn complete_federated_login(
    state: &OAuth2State,
    provider: &str,
    bound_state: Option<&str>,
    params: &CallbackQuery,
) -> Result<PrincipalIdentity, Response> {
    let provider: FederatedProvider = provider.parse().map_err(IntoResponse::into_response)?;

    // The cookie is checked first so a foreign state is never consumed.
    let state_is_valid = match (params.state.as_deref(), bound_state) {
        (Some(presented), Some(bound))
            if bool::from(presented.as_bytes().ct_eq(bound.as_bytes())) =>
        {
            state
                .pending_logins
                .take(presented, provider, state.clock.now())
        }
        _ => false,
    };
    if !state_is_valid {
        return Err(
            ErrorResponse::new("invalid_request", Some("Unknown or expired login state"))
                .into_response_with(StatusCode::BAD_REQUEST),
        );
    }

    if let Some(error) = params.error.as_deref() {
        tracing::info!(%provider, error, "Federated login declined at provider");
        return Err(ErrorResponse::new("access_denied", Some(error))
            .into_response_with(StatusCode::BAD_REQUEST));
    }
    let Some(code) = params.code.as_deref() else {
        return Err(ErrorResponse::new("invalid_request", Some("code is required"))
            .into_response_with(StatusCode::BAD_REQUEST));
    };

    let principal = async {
        let profile = state.provider(provider)?.complete_login(code).await?;
        state
            .bridge
            .on_federated_login_success(provider.name(), &profile.subject, profile.attributes)
            .await
    }
    .await
    .map_err(IntoResponse::into_response)?;

    tracing::info!(principal = %principal.principal_id, %provider, "Federated login succeeded");
    Ok(principal)
}
