//! OAuth2 HTTP endpoints.
//!
//! - `GET  /oauth2/authorize` - Authorization endpoint
//! - `POST /oauth2/token` - Token endpoint
//! - `POST /oauth2/revoke` - Refresh token revocation (RFC 7009)
//! - `POST /oauth2/introspect` - Token introspection (RFC 7662)
//! - `GET  /oauth2/jwks` - Published verification keys
//! - `GET  /.well-known/openid-configuration` - Discovery document

use crate::error::{ErrorResponse, TokenError};
use crate::oauth2::engine::{ClientCredentials, TokenIntrospection, TokenPair, parse_scope};
use crate::oauth2::keys::JwkSet;
use crate::oauth2::login::session_principal;
use crate::oauth2::registrar::GrantType;
use crate::oauth2::store::CodeChallenge;
use crate::oauth2::{OAUTH2_TAG, state::OAuth2State};
use axum::{
    Form, Json,
    extract::{Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Redirect, Response},
};
use axum_extra::extract::CookieJar;
use base64::Engine;
use serde::{Deserialize, Serialize};
use url::Url;
use utoipa::{IntoParams, ToSchema};
use utoipa_axum::{router::OpenApiRouter, routes};

/// Protocol endpoints.
pub fn router() -> OpenApiRouter<OAuth2State> {
    OpenApiRouter::new()
        .routes(routes!(authorize))
        .routes(routes!(token))
        .routes(routes!(revoke))
        .routes(routes!(introspect))
        .routes(routes!(jwks))
        .routes(routes!(openid_configuration))
}

// =============================================================================
// Request/Response Types
// =============================================================================

/// OAuth2 authorization request parameters.
#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct AuthorizeRequest {
    /// Must be "code"
    pub response_type: String,
    pub client_id: String,
    /// Must exactly match a registered redirect URI
    pub redirect_uri: Option<String>,
    /// Space-separated list of requested scopes
    pub scope: Option<String>,
    /// Opaque value returned unchanged in the redirect
    pub state: Option<String>,
    /// PKCE challenge, base64url SHA-256 of the verifier. Required for public clients.
    pub code_challenge: Option<String>,
    /// Must be "S256" when `code_challenge` is sent
    pub code_challenge_method: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct TokenRequest {
    pub grant_type: String,
    pub code: Option<String>,
    pub redirect_uri: Option<String>,
    pub refresh_token: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub code_verifier: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct TokenActionRequest {
    pub token: String,
    pub token_type_hint: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct OpenIdConfiguration {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub jwks_uri: String,
    pub revocation_endpoint: String,
    pub introspection_endpoint: String,
    pub response_types_supported: Vec<String>,
    pub grant_types_supported: Vec<String>,
    pub token_endpoint_auth_methods_supported: Vec<String>,
    pub code_challenge_methods_supported: Vec<String>,
    pub id_token_signing_alg_values_supported: Vec<String>,
}

// =============================================================================
// Endpoints
// =============================================================================

/// OAuth2 Authorization endpoint.
///
/// Requires a session established by `/login` or a federated login.
#[tracing::instrument(skip(state, jar))]
#[utoipa::path(
    get,
    path = "/oauth2/authorize",
    tag = OAUTH2_TAG,
    operation_id = "OAuth2 Authorize",
    summary = "Issue an authorization code",
    description = "Validates the client, redirect URI and requested scopes for the logged-in principal \
                   and redirects back to the client with a one-time authorization code.\n\n\
                   Errors detected before the redirect URI is validated are returned as JSON; \
                   later errors are reported to the client through the redirect.",
    params(AuthorizeRequest),
    responses(
        (status = 303, description = "Redirect to the client with `code` and `state`, or with `error`"),
        (status = 400, description = "Unknown client or unregistered redirect URI", body = ErrorResponse),
        (status = 401, description = "No login session", body = ErrorResponse),
    )
)]
pub async fn authorize(
    State(state): State<OAuth2State>,
    jar: CookieJar,
    Query(params): Query<AuthorizeRequest>,
) -> Response {
    let Some(principal) = session_principal(&state, &jar) else {
        return ErrorResponse::new("login_required", Some("Log in before authorizing a client"))
            .into_response_with(StatusCode::UNAUTHORIZED);
    };

    let Some(redirect_uri) = params.redirect_uri.as_deref() else {
        return ErrorResponse::new("invalid_request", Some("redirect_uri is required"))
            .into_response_with(StatusCode::BAD_REQUEST);
    };

    // Nothing may be redirected until the client and its redirect URI check out.
    match state.engine.clients().lookup(&params.client_id) {
        None => {
            return ErrorResponse::new("invalid_client", Some("Client not found"))
                .into_response_with(StatusCode::BAD_REQUEST);
        }
        Some(client) if !client.is_redirect_uri_allowed(redirect_uri) => {
            return ErrorResponse::new("invalid_request", Some("Invalid redirect_uri"))
                .into_response_with(StatusCode::BAD_REQUEST);
        }
        Some(_) => {}
    }

    if params.response_type != "code" {
        return error_redirect(
            redirect_uri,
            params.state.as_deref(),
            "unsupported_response_type",
            Some("Only 'code' response type is supported"),
        );
    }

    let code_challenge = match params.code_challenge.as_deref() {
        None => None,
        Some(challenge) => {
            match CodeChallenge::parse(challenge, params.code_challenge_method.as_deref()) {
                Ok(challenge) => Some(challenge),
                Err(reason) => {
                    return error_redirect(
                        redirect_uri,
                        params.state.as_deref(),
                        "invalid_request",
                        Some(&reason),
                    );
                }
            }
        }
    };

    let requested = parse_scope(params.scope.as_deref());
    match state.engine.begin_authorization(
        &params.client_id,
        redirect_uri,
        &requested,
        &principal,
        code_challenge,
    ) {
        Ok(artifact) => {
            let mut location = match Url::parse(redirect_uri) {
                Ok(url) => url,
                Err(_) => {
                    return ErrorResponse::new("invalid_request", Some("Invalid redirect_uri"))
                        .into_response_with(StatusCode::BAD_REQUEST);
                }
            };
            {
                let mut query = location.query_pairs_mut();
                query.append_pair("code", &artifact.value);
                if let Some(s) = &params.state {
                    query.append_pair("state", s);
                }
            }
            Redirect::to(location.as_str()).into_response()
        }
        Err(e) if e.redirect_is_safe() => {
            tracing::info!(error = %e, "Authorization request rejected");
            error_redirect(
                redirect_uri,
                params.state.as_deref(),
                e.code(),
                Some(&e.to_string()),
            )
        }
        Err(e) => {
            let status = if e.code() == "server_error" {
                tracing::error!(error = %e, "Authorization failed");
                StatusCode::INTERNAL_SERVER_ERROR
            } else {
                StatusCode::BAD_REQUEST
            };
            ErrorResponse::new(e.code(), None).into_response_with(status)
        }
    }
}

/// OAuth2 Token endpoint.
#[tracing::instrument(skip(state, headers, params), fields(grant_type = %params.grant_type))]
#[utoipa::path(
    post,
    path = "/oauth2/token",
    tag = OAUTH2_TAG,
    operation_id = "OAuth2 Token",
    summary = "Exchange an authorization code or refresh token for tokens",
    description = "**Supported grant types:**\n\
                   - `authorization_code`: requires `code` and the `redirect_uri` used at authorization\n\
                   - `refresh_token`: requires `refresh_token`\n\n\
                   **Client authentication:** HTTP Basic (`client_secret_basic`), `client_id` and \
                   `client_secret` in the body (`client_secret_post`), or `client_id` alone for \
                   public clients. Codes issued with a PKCE challenge need the matching `code_verifier`.",
    request_body(
        content = TokenRequest,
        content_type = "application/x-www-form-urlencoded",
        description = "Token request parameters"
    ),
    responses(
        (status = 200, description = "Tokens issued", body = TokenPair),
        (status = 400, description = "Invalid request or grant", body = ErrorResponse),
        (status = 401, description = "Client authentication failed", body = ErrorResponse),
    )
)]
pub async fn token(
    State(state): State<OAuth2State>,
    headers: HeaderMap,
    Form(params): Form<TokenRequest>,
) -> Result<Response, TokenError> {
    let credentials = extract_client_credentials(
        &headers,
        params.client_id.as_deref(),
        params.client_secret.as_deref(),
    )?;

    let grant: GrantType = params
        .grant_type
        .parse()
        .map_err(TokenError::UnsupportedGrantType)?;

    let pair = match grant {
        GrantType::AuthorizationCode => {
            let code = required(params.code.as_deref(), "code")?;
            let redirect_uri = required(params.redirect_uri.as_deref(), "redirect_uri")?;
            state.engine.exchange_authorization_code(
                code,
                &credentials,
                redirect_uri,
                params.code_verifier.as_deref(),
            )?
        }
        GrantType::RefreshToken => {
            let refresh_token = required(params.refresh_token.as_deref(), "refresh_token")?;
            state.engine.refresh(refresh_token, &credentials)?
        }
    };

    Ok(no_store(Json(pair)))
}

/// Token revocation endpoint (RFC 7009).
#[tracing::instrument(skip(state, headers, params))]
#[utoipa::path(
    post,
    path = "/oauth2/revoke",
    tag = OAUTH2_TAG,
    operation_id = "OAuth2 Revoke Token",
    summary = "Revoke a refresh token",
    description = "Revokes a refresh token issued to the authenticated client. Returns 200 whether \
                   or not the token existed. Access tokens are self-contained and expire on their own.",
    request_body(
        content = TokenActionRequest,
        content_type = "application/x-www-form-urlencoded",
        description = "Token revocation request"
    ),
    responses(
        (status = 200, description = "Token revoked (or was already invalid)"),
        (status = 401, description = "Client authentication failed", body = ErrorResponse),
    )
)]
pub async fn revoke(
    State(state): State<OAuth2State>,
    headers: HeaderMap,
    Form(params): Form<TokenActionRequest>,
) -> Result<StatusCode, TokenError> {
    let credentials = extract_client_credentials(
        &headers,
        params.client_id.as_deref(),
        params.client_secret.as_deref(),
    )?;
    if let Some(hint) = params.token_type_hint.as_deref()
        && hint != "refresh_token"
    {
        tracing::debug!(hint, "Ignoring token_type_hint");
    }
    state.engine.revoke_refresh_token(&params.token, &credentials)?;
    Ok(StatusCode::OK)
}

/// Token introspection endpoint (RFC 7662).
#[tracing::instrument(skip(state, headers, params))]
#[utoipa::path(
    post,
    path = "/oauth2/introspect",
    tag = OAUTH2_TAG,
    operation_id = "OAuth2 Introspect Token",
    summary = "Describe an access or refresh token",
    request_body(
        content = TokenActionRequest,
        content_type = "application/x-www-form-urlencoded",
        description = "Token introspection request"
    ),
    responses(
        (status = 200, description = "Token description; `active` is false for any invalid token", body = TokenIntrospection),
        (status = 401, description = "Client authentication failed", body = ErrorResponse),
    )
)]
pub async fn introspect(
    State(state): State<OAuth2State>,
    headers: HeaderMap,
    Form(params): Form<TokenActionRequest>,
) -> Result<Response, TokenError> {
    let credentials = extract_client_credentials(
        &headers,
        params.client_id.as_deref(),
        params.client_secret.as_deref(),
    )?;
    let introspection = state.engine.introspect(&params.token, &credentials)?;
    Ok(no_store(Json(introspection)))
}

/// Published verification keys.
#[tracing::instrument(skip(state))]
#[utoipa::path(
    get,
    path = "/oauth2/jwks",
    tag = OAUTH2_TAG,
    operation_id = "OAuth2 JWKS",
    summary = "JSON Web Key Set used to verify access tokens",
    description = "Every key whose signatures are currently accepted. After a key rotation the \
                   previous key stays listed until tokens signed with it have expired.",
    responses(
        (status = 200, description = "Key set", body = JwkSet),
    )
)]
pub async fn jwks(State(state): State<OAuth2State>) -> Json<JwkSet> {
    Json(state.engine.jwks())
}

/// Discovery document.
#[tracing::instrument(skip(state))]
#[utoipa::path(
    get,
    path = "/.well-known/openid-configuration",
    tag = OAUTH2_TAG,
    operation_id = "OpenID Configuration",
    summary = "Authorization server metadata",
    responses(
        (status = 200, description = "Server metadata", body = OpenIdConfiguration),
    )
)]
pub async fn openid_configuration(State(state): State<OAuth2State>) -> Json<OpenIdConfiguration> {
    let issuer = state.engine.issuer();
    Json(OpenIdConfiguration {
        issuer: issuer.to_string(),
        authorization_endpoint: format!("{issuer}/oauth2/authorize"),
        token_endpoint: format!("{issuer}/oauth2/token"),
        jwks_uri: format!("{issuer}/oauth2/jwks"),
        revocation_endpoint: format!("{issuer}/oauth2/revoke"),
        introspection_endpoint: format!("{issuer}/oauth2/introspect"),
        response_types_supported: vec!["code".to_string()],
        grant_types_supported: vec![
            GrantType::AuthorizationCode.to_string(),
            GrantType::RefreshToken.to_string(),
        ],
        token_endpoint_auth_methods_supported: vec![
            "client_secret_basic".to_string(),
            "client_secret_post".to_string(),
            "none".to_string(),
        ],
        code_challenge_methods_supported: vec!["S256".to_string()],
        id_token_signing_alg_values_supported: vec!["EdDSA".to_string()],
    })
}

// =============================================================================
// Helpers
// =============================================================================

/// Work out which authentication method the client used.
///
/// HTTP Basic wins when present; a request using two methods at once is
/// rejected. Basic credentials are form-urlencoded before base64
/// (RFC 6749 Section 2.3.1).
pub fn extract_client_credentials(
    headers: &HeaderMap,
    form_client_id: Option<&str>,
    form_client_secret: Option<&str>,
) -> Result<ClientCredentials, TokenError> {
    if let Some(auth) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Basic "))
    {
        if form_client_secret.is_some() {
            return Err(TokenError::InvalidRequest(
                "multiple client authentication methods".into(),
            ));
        }
        let (id, secret) = base64::engine::general_purpose::STANDARD
            .decode(auth.trim())
            .ok()
            .and_then(|decoded| String::from_utf8(decoded).ok())
            .and_then(|creds| {
                let (id, secret) = creds.split_once(':')?;
                Some((form_urldecode(id)?, form_urldecode(secret)?))
            })
            .ok_or_else(|| TokenError::InvalidRequest("malformed Basic credentials".into()))?;
        return Ok(ClientCredentials::basic(&id, &secret));
    }

    match (form_client_id, form_client_secret) {
        (Some(id), Some(secret)) => Ok(ClientCredentials::post(id, secret)),
        (Some(id), None) => Ok(ClientCredentials::public(id)),
        (None, _) => Err(TokenError::InvalidRequest("client_id is required".into())),
    }
}

fn form_urldecode(value: &str) -> Option<String> {
    percent_encoding::percent_decode_str(&value.replace('+', " "))
        .decode_utf8()
        .ok()
        .map(|decoded| decoded.into_owned())
}

fn required<'a>(value: Option<&'a str>, name: &str) -> Result<&'a str, TokenError> {
    value
        .filter(|v| !v.is_empty())
        .ok_or_else(|| TokenError::InvalidRequest(format!("{name} is required")))
}

fn no_store(body: impl IntoResponse) -> Response {
    (
        [
            (header::CACHE_CONTROL, "no-store"),
            (header::PRAGMA, "no-cache"),
        ],
        body,
    )
        .into_response()
}

/// Redirect back to the client carrying an OAuth2 error.
fn error_redirect(
    redirect_uri: &str,
    state: Option<&str>,
    error: &str,
    description: Option<&str>,
) -> Response {
    let Ok(mut url) = Url::parse(redirect_uri) else {
        return ErrorResponse::new(error, description).into_response_with(StatusCode::BAD_REQUEST);
    };
    {
        let mut query = url.query_pairs_mut();
        query.append_pair("error", error);
        if let Some(d) = description {
            query.append_pair("error_description", d);
        }
        if let Some(s) = state {
            query.append_pair("state", s);
        }
    }
    Redirect::to(url.as_str()).into_response()
}
