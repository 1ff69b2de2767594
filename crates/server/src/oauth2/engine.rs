//! Authorization & token engine.
//!
//! Drives the authorization code flow:
//!
//! 1. [`TokenEngine::begin_authorization`] mints a one-time code for an
//!    authenticated principal.
//! 2. [`TokenEngine::exchange_authorization_code`] trades the code for an
//!    access token (EdDSA-signed JWT) and a refresh token.
//! 3. [`TokenEngine::refresh`] mints new access tokens from a refresh token.
//!
//! Access tokens are never stored; resource servers verify them against the
//! published key set. Codes and refresh tokens live in [`crate::oauth2::store`].

use crate::config::TokenConfig;
use crate::directory::PrincipalIdentity;
use crate::error::{AuthorizationError, InvalidTokenError, TokenError};
use crate::oauth2::clock::Clock;
use crate::oauth2::keys::{JwkSet, SIGNING_ALGORITHM, SigningKeyProvider};
use crate::oauth2::password::generate_token;
use crate::oauth2::registrar::{ClientAuthMethod, ClientRegistry, GrantType, RegisteredClient};
use crate::oauth2::store::{
    AuthorizationArtifact, AuthorizationCodeStore, CodeChallenge, RefreshTokenRecord,
    RefreshTokenStore,
};
use jsonwebtoken::{Header, Validation};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use utoipa::ToSchema;

/// Claims carried by every access token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessTokenClaims {
    pub iss: String,
    pub sub: String,
    pub client_id: String,
    /// Space-delimited granted scopes.
    pub scope: String,
    pub roles: Vec<String>,
    pub iat: i64,
    pub exp: i64,
    pub jti: String,
}

impl AccessTokenClaims {
    pub fn scopes(&self) -> BTreeSet<String> {
        parse_scope(Some(&self.scope))
    }
}

/// Successful token endpoint response (RFC 6749 Section 5.1).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct TokenPair {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    pub scope: String,
}

/// Introspection response (RFC 7662). Inactive tokens carry nothing else.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct TokenIntrospection {
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
}

/// Credentials a client presented at the token endpoint.
#[derive(Clone, PartialEq, Eq)]
pub struct ClientCredentials {
    pub client_id: String,
    pub secret: Option<String>,
    pub method: ClientAuthMethod,
}

impl std::fmt::Debug for ClientCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientCredentials")
            .field("client_id", &self.client_id)
            .field("method", &self.method)
            .finish_non_exhaustive()
    }
}

impl ClientCredentials {
    pub fn basic(client_id: &str, secret: &str) -> Self {
        Self {
            client_id: client_id.to_string(),
            secret: Some(secret.to_string()),
            method: ClientAuthMethod::ClientSecretBasic,
        }
    }

    pub fn post(client_id: &str, secret: &str) -> Self {
        Self {
            client_id: client_id.to_string(),
            secret: Some(secret.to_string()),
            method: ClientAuthMethod::ClientSecretPost,
        }
    }

    pub fn public(client_id: &str) -> Self {
        Self {
            client_id: client_id.to_string(),
            secret: None,
            method: ClientAuthMethod::None,
        }
    }
}

/// Split a space-delimited scope parameter. Empty or missing means no scopes.
pub fn parse_scope(scope: Option<&str>) -> BTreeSet<String> {
    scope
        .unwrap_or_default()
        .split_whitespace()
        .map(String::from)
        .collect()
}

fn join_scope(scopes: &BTreeSet<String>) -> String {
    scopes.iter().map(String::as_str).collect::<Vec<_>>().join(" ")
}

pub struct TokenEngine {
    issuer: String,
    clients: Arc<ClientRegistry>,
    keys: Arc<dyn SigningKeyProvider>,
    clock: Arc<dyn Clock>,
    codes: AuthorizationCodeStore,
    refresh_tokens: RefreshTokenStore,
    code_ttl: Duration,
    rotate_refresh_tokens: bool,
}

impl TokenEngine {
    pub fn new(
        issuer: impl Into<String>,
        clients: Arc<ClientRegistry>,
        keys: Arc<dyn SigningKeyProvider>,
        clock: Arc<dyn Clock>,
        tokens: &TokenConfig,
    ) -> Self {
        Self {
            issuer: issuer.into(),
            clients,
            keys,
            clock,
            codes: AuthorizationCodeStore::new(),
            refresh_tokens: RefreshTokenStore::new(),
            code_ttl: Duration::seconds(tokens.authorization_code_ttl_secs),
            rotate_refresh_tokens: tokens.rotate_refresh_tokens,
        }
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    pub fn clients(&self) -> &ClientRegistry {
        &self.clients
    }

    pub fn jwks(&self) -> JwkSet {
        self.keys.jwks()
    }

    /// Validate an authorization request for an authenticated principal and
    /// mint the one-time code.
    ///
    /// An empty scope request is granted every scope the client is allowed.
    /// Clients that may authenticate without a secret must send a PKCE
    /// challenge.
    #[tracing::instrument(
        skip(self, principal, code_challenge),
        fields(principal = %principal.principal_id)
    )]
    pub fn begin_authorization(
        &self,
        client_id: &str,
        redirect_uri: &str,
        requested_scopes: &BTreeSet<String>,
        principal: &PrincipalIdentity,
        code_challenge: Option<CodeChallenge>,
    ) -> Result<AuthorizationArtifact, AuthorizationError> {
        let client = self
            .clients
            .lookup(client_id)
            .ok_or_else(|| AuthorizationError::UnknownClient(client_id.to_string()))?;

        if !client.is_redirect_uri_allowed(redirect_uri) {
            return Err(AuthorizationError::RedirectUriMismatch(
                redirect_uri.to_string(),
            ));
        }
        if !client.allows_grant(GrantType::AuthorizationCode) {
            return Err(AuthorizationError::UnauthorizedClient(client_id.to_string()));
        }
        if client.allows_method(ClientAuthMethod::None) && code_challenge.is_none() {
            return Err(AuthorizationError::PkceRequired(client_id.to_string()));
        }

        let granted_scopes = if requested_scopes.is_empty() {
            client.scopes.clone()
        } else {
            let denied: Vec<_> = requested_scopes.difference(&client.scopes).cloned().collect();
            if !denied.is_empty() {
                return Err(AuthorizationError::ScopeNotAllowed(denied.join(" ")));
            }
            requested_scopes.clone()
        };

        if !principal.enabled {
            return Err(AuthorizationError::PrincipalDisabled(
                principal.principal_id.clone(),
            ));
        }

        let now = self.clock.now();
        let artifact = AuthorizationArtifact {
            value: generate_token()?,
            client_id: client.client_id.clone(),
            principal_id: principal.principal_id.clone(),
            roles: principal.roles.clone(),
            granted_scopes,
            redirect_uri: redirect_uri.to_string(),
            code_challenge,
            issued_at: now,
            expires_at: now + self.code_ttl,
            consumed: false,
        };
        self.codes.insert(artifact.clone());

        tracing::debug!(client_id, "Issued authorization code");
        Ok(artifact)
    }

    /// Trade an authorization code for tokens. Each code succeeds at most once.
    #[tracing::instrument(
        skip(self, code, credentials, code_verifier),
        fields(client_id = %credentials.client_id)
    )]
    pub fn exchange_authorization_code(
        &self,
        code: &str,
        credentials: &ClientCredentials,
        redirect_uri: &str,
        code_verifier: Option<&str>,
    ) -> Result<TokenPair, TokenError> {
        let client = self.authenticate_client(credentials)?;
        if !client.allows_grant(GrantType::AuthorizationCode) {
            return Err(TokenError::UnauthorizedClient(client.client_id.clone()));
        }

        let now = self.clock.now();
        let artifact = self
            .codes
            .consume(code, &client.client_id, redirect_uri, code_verifier, now)
            .map_err(|rejection| {
                tracing::info!(%rejection, "Authorization code rejected");
                TokenError::InvalidGrant(rejection.to_string())
            })?;

        let access_token = self.mint_access_token(
            client,
            &artifact.principal_id,
            &artifact.roles,
            &artifact.granted_scopes,
            now,
        )?;

        let refresh_token = if client.allows_grant(GrantType::RefreshToken) {
            Some(self.mint_refresh_token(
                client,
                &artifact.principal_id,
                &artifact.roles,
                &artifact.granted_scopes,
                now,
            )?)
        } else {
            None
        };

        tracing::info!(principal = %artifact.principal_id, "Issued tokens for authorization code");
        Ok(TokenPair {
            access_token,
            token_type: "Bearer".to_string(),
            expires_in: client.access_token_ttl.whole_seconds(),
            refresh_token,
            scope: join_scope(&artifact.granted_scopes),
        })
    }

    /// Mint a new access token from a refresh token.
    ///
    /// The same refresh token is returned unless rotation is enabled, in which
    /// case the presented token is revoked and a new one issued.
    #[tracing::instrument(
        skip(self, refresh_token, credentials),
        fields(client_id = %credentials.client_id)
    )]
    pub fn refresh(
        &self,
        refresh_token: &str,
        credentials: &ClientCredentials,
    ) -> Result<TokenPair, TokenError> {
        let client = self.authenticate_client(credentials)?;
        if !client.allows_grant(GrantType::RefreshToken) {
            return Err(TokenError::UnauthorizedClient(client.client_id.clone()));
        }

        let now = self.clock.now();
        let record = self
            .refresh_tokens
            .redeem(refresh_token, &client.client_id, now, self.rotate_refresh_tokens)
            .map_err(|rejection| {
                tracing::info!(%rejection, "Refresh token rejected");
                TokenError::InvalidGrant(rejection.to_string())
            })?;

        let access_token = self.mint_access_token(
            client,
            &record.principal_id,
            &record.roles,
            &record.scopes,
            now,
        )?;

        let refresh_token = if self.rotate_refresh_tokens {
            self.mint_refresh_token(
                client,
                &record.principal_id,
                &record.roles,
                &record.scopes,
                now,
            )?
        } else {
            record.value.clone()
        };

        Ok(TokenPair {
            access_token,
            token_type: "Bearer".to_string(),
            expires_in: client.access_token_ttl.whole_seconds(),
            refresh_token: Some(refresh_token),
            scope: join_scope(&record.scopes),
        })
    }

    /// Check an access token's signature, issuer and expiry.
    pub fn verify_access_token(&self, token: &str) -> Result<AccessTokenClaims, InvalidTokenError> {
        let header = jsonwebtoken::decode_header(token)
            .map_err(|e| InvalidTokenError::Malformed(e.to_string()))?;
        if header.alg != SIGNING_ALGORITHM {
            return Err(InvalidTokenError::Rejected(format!(
                "unexpected algorithm {:?}",
                header.alg
            )));
        }

        let key = self
            .keys
            .public_key_set()
            .into_iter()
            .find(|k| header.kid.as_deref() == Some(k.key_id.as_str()))
            .ok_or_else(|| InvalidTokenError::UnknownKey(header.kid.clone()))?;
        let decoding_key = key
            .decoding_key()
            .map_err(|e| InvalidTokenError::Rejected(e.to_string()))?;

        // Expiry is checked below against the engine clock.
        let mut validation = Validation::new(SIGNING_ALGORITHM);
        validation.validate_exp = false;
        validation.leeway = 0;
        validation.set_issuer(&[&self.issuer]);
        validation.set_required_spec_claims(&["exp", "iss", "sub"]);

        let claims = jsonwebtoken::decode::<AccessTokenClaims>(token, &decoding_key, &validation)
            .map_err(|e| InvalidTokenError::Rejected(e.to_string()))?
            .claims;

        if claims.exp <= self.clock.now().unix_timestamp() {
            return Err(InvalidTokenError::Expired);
        }
        Ok(claims)
    }

    /// Revoke a refresh token (RFC 7009). Succeeds for any authenticated
    /// client whether or not the token existed. Access tokens are stateless
    /// and expire on their own.
    #[tracing::instrument(
        skip(self, token, credentials),
        fields(client_id = %credentials.client_id)
    )]
    pub fn revoke_refresh_token(
        &self,
        token: &str,
        credentials: &ClientCredentials,
    ) -> Result<(), TokenError> {
        let client = self.authenticate_client(credentials)?;
        if self.refresh_tokens.revoke(token, &client.client_id) {
            tracing::info!("Refresh token revoked");
        }
        Ok(())
    }

    /// Describe a token (RFC 7662). Any failure reads as inactive.
    pub fn introspect(
        &self,
        token: &str,
        credentials: &ClientCredentials,
    ) -> Result<TokenIntrospection, TokenError> {
        self.authenticate_client(credentials)?;

        if let Ok(claims) = self.verify_access_token(token) {
            return Ok(TokenIntrospection {
                active: true,
                scope: Some(claims.scope),
                client_id: Some(claims.client_id),
                sub: Some(claims.sub),
                token_type: Some("access_token".to_string()),
                iat: Some(claims.iat),
                exp: Some(claims.exp),
            });
        }

        let now = self.clock.now();
        match self.refresh_tokens.get(token) {
            Some(record) if record.is_active(now) => Ok(TokenIntrospection {
                active: true,
                scope: Some(join_scope(&record.scopes)),
                client_id: Some(record.client_id),
                sub: Some(record.principal_id),
                token_type: Some("refresh_token".to_string()),
                iat: Some(record.issued_at.unix_timestamp()),
                exp: Some(record.expires_at.unix_timestamp()),
            }),
            _ => Ok(TokenIntrospection::default()),
        }
    }

    /// Drop expired codes and dead refresh tokens. Returns how many of each
    /// were removed.
    pub fn purge_expired(&self) -> (usize, usize) {
        let now = self.clock.now();
        (
            self.codes.purge_expired(now),
            self.refresh_tokens.purge_expired(now),
        )
    }

    fn authenticate_client(
        &self,
        credentials: &ClientCredentials,
    ) -> Result<&RegisteredClient, TokenError> {
        Ok(self.clients.authenticate(
            &credentials.client_id,
            credentials.secret.as_deref(),
            credentials.method,
        )?)
    }

    fn mint_access_token(
        &self,
        client: &RegisteredClient,
        principal_id: &str,
        roles: &BTreeSet<String>,
        scopes: &BTreeSet<String>,
        now: OffsetDateTime,
    ) -> Result<String, TokenError> {
        let key = self.keys.current_signing_key();
        let mut header = Header::new(SIGNING_ALGORITHM);
        header.kid = Some(key.key_id.clone());

        let claims = AccessTokenClaims {
            iss: self.issuer.clone(),
            sub: principal_id.to_string(),
            client_id: client.client_id.clone(),
            scope: join_scope(scopes),
            roles: roles.iter().cloned().collect(),
            iat: now.unix_timestamp(),
            exp: (now + client.access_token_ttl).unix_timestamp(),
            jti: uuid::Uuid::new_v4().to_string(),
        };
        Ok(jsonwebtoken::encode(&header, &claims, key.encoding_key())?)
    }

    fn mint_refresh_token(
        &self,
        client: &RegisteredClient,
        principal_id: &str,
        roles: &BTreeSet<String>,
        scopes: &BTreeSet<String>,
        now: OffsetDateTime,
    ) -> Result<String, TokenError> {
        let record = RefreshTokenRecord {
            value: generate_token()?,
            client_id: client.client_id.clone(),
            principal_id: principal_id.to_string(),
            roles: roles.clone(),
            scopes: scopes.clone(),
            issued_at: now,
            expires_at: now + client.refresh_token_ttl,
            revoked: false,
        };
        let value = record.value.clone();
        self.refresh_tokens.insert(record);
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::error::ClientAuthenticationError;
    use crate::oauth2::clock::ManualClock;
    use crate::oauth2::keys::{RotatingKeyProvider, SigningKeyPair};

    const ACME_CB: &str = "https://acme.test/cb";
    const SPA_CB: &str = "https://spa.test/cb";
    const VERIFIER: &str = "Vq0NUrmIDMhhEYs9ZC3P3jP2gYSCpDw7e7tnR_4sU5c";

    struct Fixture {
        engine: Arc<TokenEngine>,
        clock: ManualClock,
        keys: Arc<RotatingKeyProvider>,
    }

    fn clients() -> Vec<ClientConfig> {
        vec![
            ClientConfig {
                client_id: "acme".into(),
                client_secret: Some("s3cret".into()),
                authentication_methods: vec![
                    ClientAuthMethod::ClientSecretBasic,
                    ClientAuthMethod::ClientSecretPost,
                ],
                grant_types: vec![GrantType::AuthorizationCode, GrantType::RefreshToken],
                redirect_uris: vec![ACME_CB.into()],
                scopes: vec!["profile".into(), "email".into()],
                access_token_ttl_secs: None,
                refresh_token_ttl_secs: None,
            },
            ClientConfig {
                client_id: "code-only".into(),
                client_secret: Some("other".into()),
                authentication_methods: vec![ClientAuthMethod::ClientSecretBasic],
                grant_types: vec![GrantType::AuthorizationCode],
                redirect_uris: vec!["https://code-only.test/cb".into()],
                scopes: vec!["profile".into()],
                access_token_ttl_secs: Some(60),
                refresh_token_ttl_secs: None,
            },
            ClientConfig {
                client_id: "spa".into(),
                client_secret: None,
                authentication_methods: vec![ClientAuthMethod::None],
                grant_types: vec![GrantType::AuthorizationCode],
                redirect_uris: vec![SPA_CB.into()],
                scopes: vec!["profile".into()],
                access_token_ttl_secs: None,
                refresh_token_ttl_secs: None,
            },
        ]
    }

    fn fixture_with(tokens: TokenConfig, key_overlap: Duration) -> Fixture {
        let clock = ManualClock::starting_now();
        let shared_clock: Arc<dyn Clock> = Arc::new(clock.clone());
        let keys = Arc::new(RotatingKeyProvider::new(shared_clock.clone(), key_overlap).unwrap());
        let registry = Arc::new(ClientRegistry::from_config(&clients(), &tokens));
        let engine = TokenEngine::new(
            "https://auth.example.com",
            registry,
            keys.clone(),
            shared_clock,
            &tokens,
        );
        Fixture {
            engine: Arc::new(engine),
            clock,
            keys,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(TokenConfig::default(), Duration::minutes(15))
    }

    fn ada() -> PrincipalIdentity {
        PrincipalIdentity {
            principal_id: "ada@example.com".into(),
            roles: ["DEFAULT".to_string()].into(),
            enabled: true,
        }
    }

    fn acme() -> ClientCredentials {
        ClientCredentials::basic("acme", "s3cret")
    }

    fn scopes(s: &str) -> BTreeSet<String> {
        parse_scope(Some(s))
    }

    fn code_for(f: &Fixture, scope: &str) -> String {
        f.engine
            .begin_authorization("acme", ACME_CB, &scopes(scope), &ada(), None)
            .unwrap()
            .value
    }

    #[test]
    fn code_exchange_issues_verifiable_tokens() {
        let f = fixture();
        let code = code_for(&f, "profile");

        let pair = f
            .engine
            .exchange_authorization_code(&code, &acme(), ACME_CB, None)
            .unwrap();
        assert_eq!(pair.token_type, "Bearer");
        assert_eq!(pair.expires_in, 900);
        assert_eq!(pair.scope, "profile");
        assert!(pair.refresh_token.is_some());

        let claims = f.engine.verify_access_token(&pair.access_token).unwrap();
        assert_eq!(claims.sub, "ada@example.com");
        assert_eq!(claims.client_id, "acme");
        assert_eq!(claims.iss, "https://auth.example.com");
        assert_eq!(claims.roles, vec!["DEFAULT".to_string()]);
        assert_eq!(claims.exp - claims.iat, 900);
    }

    #[test]
    fn second_exchange_is_invalid_grant() {
        let f = fixture();
        let code = code_for(&f, "profile");
        f.engine
            .exchange_authorization_code(&code, &acme(), ACME_CB, None)
            .unwrap();

        let err = f
            .engine
            .exchange_authorization_code(&code, &acme(), ACME_CB, None)
            .unwrap_err();
        assert!(matches!(err, TokenError::InvalidGrant(_)));
    }

    #[test]
    fn concurrent_exchanges_have_exactly_one_winner() {
        let f = fixture();
        let code = code_for(&f, "profile");

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let engine = f.engine.clone();
                let code = code.clone();
                std::thread::spawn(move || {
                    engine.exchange_authorization_code(&code, &acme(), ACME_CB, None)
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(
            results
                .iter()
                .filter_map(|r| r.as_ref().err())
                .all(|e| matches!(e, TokenError::InvalidGrant(_)))
        );
    }

    #[test]
    fn redirect_uri_must_match_exactly() {
        let f = fixture();
        for variant in ["https://acme.test/cb/", "https://ACME.test/cb", "https://acme.test/cb?x"] {
            let err = f
                .engine
                .begin_authorization("acme", variant, &BTreeSet::new(), &ada(), None)
                .unwrap_err();
            assert!(matches!(err, AuthorizationError::RedirectUriMismatch(_)));
        }

        let code = code_for(&f, "profile");
        let err = f
            .engine
            .exchange_authorization_code(&code, &acme(), "https://acme.test/cb/", None)
            .unwrap_err();
        assert!(matches!(err, TokenError::InvalidGrant(_)));
    }

    #[test]
    fn scope_must_be_subset_of_client_scopes() {
        let f = fixture();
        let err = f
            .engine
            .begin_authorization("acme", ACME_CB, &scopes("profile admin"), &ada(), None)
            .unwrap_err();
        assert_eq!(err, AuthorizationError::ScopeNotAllowed("admin".into()));

        let artifact = f
            .engine
            .begin_authorization("acme", ACME_CB, &BTreeSet::new(), &ada(), None)
            .unwrap();
        assert_eq!(artifact.granted_scopes, scopes("email profile"));
    }

    #[test]
    fn unknown_client_and_disabled_principal_are_rejected() {
        let f = fixture();
        let err = f
            .engine
            .begin_authorization("nope", ACME_CB, &BTreeSet::new(), &ada(), None)
            .unwrap_err();
        assert!(matches!(err, AuthorizationError::UnknownClient(_)));

        let mut locked = ada();
        locked.enabled = false;
        let err = f
            .engine
            .begin_authorization("acme", ACME_CB, &BTreeSet::new(), &locked, None)
            .unwrap_err();
        assert!(matches!(err, AuthorizationError::PrincipalDisabled(_)));
    }

    #[test]
    fn code_expires_at_ttl() {
        let f = fixture();
        let code = code_for(&f, "profile");
        f.clock.advance(Duration::minutes(5));

        let err = f
            .engine
            .exchange_authorization_code(&code, &acme(), ACME_CB, None)
            .unwrap_err();
        assert!(matches!(err, TokenError::InvalidGrant(_)));
    }

    #[test]
    fn code_bound_to_issuing_client() {
        let f = fixture();
        let code = code_for(&f, "profile");
        let err = f
            .engine
            .exchange_authorization_code(
                &code,
                &ClientCredentials::basic("code-only", "other"),
                ACME_CB,
                None,
            )
            .unwrap_err();
        assert!(matches!(err, TokenError::InvalidGrant(_)));
        // the rightful client can still use it
        assert!(
            f.engine
                .exchange_authorization_code(&code, &acme(), ACME_CB, None)
                .is_ok()
        );
    }

    #[test]
    fn bad_client_credentials_are_invalid_client() {
        let f = fixture();
        let code = code_for(&f, "profile");
        let err = f
            .engine
            .exchange_authorization_code(
                &code,
                &ClientCredentials::basic("acme", "nope"),
                ACME_CB,
                None,
            )
            .unwrap_err();
        assert!(matches!(
            err,
            TokenError::Client(ClientAuthenticationError::InvalidCredential(_))
        ));
    }

    #[test]
    fn access_token_expiry_is_strict() {
        let f = fixture();
        let code = code_for(&f, "profile");
        let pair = f
            .engine
            .exchange_authorization_code(&code, &acme(), ACME_CB, None)
            .unwrap();

        f.clock.advance(Duration::seconds(899));
        assert!(f.engine.verify_access_token(&pair.access_token).is_ok());
        f.clock.advance(Duration::seconds(1));
        assert_eq!(
            f.engine.verify_access_token(&pair.access_token),
            Err(InvalidTokenError::Expired)
        );
    }

    #[test]
    fn refresh_keeps_refresh_token_by_default() {
        let f = fixture();
        let code = code_for(&f, "profile email");
        let pair = f
            .engine
            .exchange_authorization_code(&code, &acme(), ACME_CB, None)
            .unwrap();
        let refresh_token = pair.refresh_token.unwrap();

        f.clock.advance(Duration::minutes(20));
        let refreshed = f.engine.refresh(&refresh_token, &acme()).unwrap();
        assert_eq!(refreshed.refresh_token.as_deref(), Some(refresh_token.as_str()));
        assert_eq!(refreshed.scope, "email profile");
        assert!(f.engine.verify_access_token(&refreshed.access_token).is_ok());

        let again = f.engine.refresh(&refresh_token, &acme()).unwrap();
        assert_eq!(again.refresh_token, refreshed.refresh_token);
    }

    #[test]
    fn refresh_rotation_revokes_presented_token() {
        let tokens = TokenConfig {
            rotate_refresh_tokens: true,
            ..TokenConfig::default()
        };
        let f = fixture_with(tokens, Duration::minutes(15));
        let code = code_for(&f, "profile");
        let pair = f
            .engine
            .exchange_authorization_code(&code, &acme(), ACME_CB, None)
            .unwrap();
        let first = pair.refresh_token.unwrap();

        let refreshed = f.engine.refresh(&first, &acme()).unwrap();
        let second = refreshed.refresh_token.unwrap();
        assert_ne!(first, second);
        assert!(matches!(
            f.engine.refresh(&first, &acme()),
            Err(TokenError::InvalidGrant(_))
        ));
        assert!(f.engine.refresh(&second, &acme()).is_ok());
    }

    #[test]
    fn refresh_token_expires() {
        let f = fixture();
        let code = code_for(&f, "profile");
        let refresh_token = f
            .engine
            .exchange_authorization_code(&code, &acme(), ACME_CB, None)
            .unwrap()
            .refresh_token
            .unwrap();

        f.clock.advance(Duration::hours(12));
        assert!(matches!(
            f.engine.refresh(&refresh_token, &acme()),
            Err(TokenError::InvalidGrant(_))
        ));
    }

    #[test]
    fn client_without_refresh_grant_gets_no_refresh_token() {
        let f = fixture();
        let code = f
            .engine
            .begin_authorization(
                "code-only",
                "https://code-only.test/cb",
                &BTreeSet::new(),
                &ada(),
                None,
            )
            .unwrap()
            .value;
        let credentials = ClientCredentials::basic("code-only", "other");
        let pair = f
            .engine
            .exchange_authorization_code(&code, &credentials, "https://code-only.test/cb", None)
            .unwrap();
        assert!(pair.refresh_token.is_none());
        assert_eq!(pair.expires_in, 60);

        assert!(matches!(
            f.engine.refresh("anything", &credentials),
            Err(TokenError::UnauthorizedClient(_))
        ));
    }

    #[test]
    fn revoked_refresh_token_is_rejected() {
        let f = fixture();
        let code = code_for(&f, "profile");
        let refresh_token = f
            .engine
            .exchange_authorization_code(&code, &acme(), ACME_CB, None)
            .unwrap()
            .refresh_token
            .unwrap();

        f.engine
            .revoke_refresh_token(&refresh_token, &ClientCredentials::post("acme", "s3cret"))
            .unwrap();
        assert!(matches!(
            f.engine.refresh(&refresh_token, &acme()),
            Err(TokenError::InvalidGrant(_))
        ));
        // unknown tokens revoke fine
        assert!(f.engine.revoke_refresh_token("unknown", &acme()).is_ok());
    }

    #[test]
    fn public_client_must_use_pkce() {
        let f = fixture();
        let err = f
            .engine
            .begin_authorization("spa", SPA_CB, &BTreeSet::new(), &ada(), None)
            .unwrap_err();
        assert_eq!(err, AuthorizationError::PkceRequired("spa".into()));
        assert!(err.redirect_is_safe());

        let code = f
            .engine
            .begin_authorization(
                "spa",
                SPA_CB,
                &BTreeSet::new(),
                &ada(),
                Some(CodeChallenge::from_verifier(VERIFIER)),
            )
            .unwrap()
            .value;
        let spa = ClientCredentials::public("spa");

        // A leaked code is useless without the verifier.
        let err = f
            .engine
            .exchange_authorization_code(&code, &spa, SPA_CB, None)
            .unwrap_err();
        assert!(matches!(err, TokenError::InvalidGrant(_)));

        let pair = f
            .engine
            .exchange_authorization_code(&code, &spa, SPA_CB, Some(VERIFIER))
            .unwrap();
        assert!(pair.refresh_token.is_none());
        assert!(f.engine.verify_access_token(&pair.access_token).is_ok());
    }

    #[test]
    fn confidential_client_may_add_pkce() {
        let f = fixture();
        let code = f
            .engine
            .begin_authorization(
                "acme",
                ACME_CB,
                &BTreeSet::new(),
                &ada(),
                Some(CodeChallenge::from_verifier(VERIFIER)),
            )
            .unwrap()
            .value;
        let wrong = "w".repeat(43);
        assert!(
            f.engine
                .exchange_authorization_code(&code, &acme(), ACME_CB, Some(&wrong))
                .is_err()
        );
        assert!(
            f.engine
                .exchange_authorization_code(&code, &acme(), ACME_CB, Some(VERIFIER))
                .is_ok()
        );
    }

    #[test]
    fn token_outlives_rotation_when_overlap_covers_ttl() {
        let tokens = TokenConfig {
            access_token_ttl_secs: 3600,
            ..TokenConfig::default()
        };
        let f = fixture_with(tokens, Duration::seconds(3600));
        let code = code_for(&f, "profile");
        let pair = f
            .engine
            .exchange_authorization_code(&code, &acme(), ACME_CB, None)
            .unwrap();
        assert_eq!(pair.expires_in, 3600);

        f.keys.rotate().unwrap();
        f.clock.advance(Duration::seconds(3599));
        assert!(f.engine.verify_access_token(&pair.access_token).is_ok());
        f.clock.advance(Duration::seconds(1));
        assert!(f.engine.verify_access_token(&pair.access_token).is_err());
    }

    #[test]
    fn rotated_key_verifies_during_overlap_only() {
        let f = fixture_with(TokenConfig::default(), Duration::seconds(60));
        let code = code_for(&f, "profile");
        let pair = f
            .engine
            .exchange_authorization_code(&code, &acme(), ACME_CB, None)
            .unwrap();

        f.keys.rotate().unwrap();
        assert!(f.engine.verify_access_token(&pair.access_token).is_ok());

        f.clock.advance(Duration::seconds(60));
        assert!(matches!(
            f.engine.verify_access_token(&pair.access_token),
            Err(InvalidTokenError::UnknownKey(Some(_)))
        ));
    }

    #[test]
    fn foreign_and_forged_tokens_fail() {
        let f = fixture();
        let now = f.clock.now();
        let foreign = SigningKeyPair::generate(now).unwrap();
        let claims = AccessTokenClaims {
            iss: "https://auth.example.com".into(),
            sub: "mallory@example.com".into(),
            client_id: "acme".into(),
            scope: "profile".into(),
            roles: vec!["ADMIN".into()],
            iat: now.unix_timestamp(),
            exp: now.unix_timestamp() + 900,
            jti: "x".into(),
        };

        let mut header = Header::new(SIGNING_ALGORITHM);
        header.kid = Some(foreign.key_id.clone());
        let unknown_kid = jsonwebtoken::encode(&header, &claims, foreign.encoding_key()).unwrap();
        assert!(matches!(
            f.engine.verify_access_token(&unknown_kid),
            Err(InvalidTokenError::UnknownKey(_))
        ));

        header.kid = Some(f.keys.current_signing_key().key_id);
        let forged = jsonwebtoken::encode(&header, &claims, foreign.encoding_key()).unwrap();
        assert!(matches!(
            f.engine.verify_access_token(&forged),
            Err(InvalidTokenError::Rejected(_))
        ));

        assert!(matches!(
            f.engine.verify_access_token("not-a-jwt"),
            Err(InvalidTokenError::Malformed(_))
        ));
    }

    #[test]
    fn wrong_issuer_is_rejected() {
        let f = fixture();
        let now = f.clock.now();
        let key = f.keys.current_signing_key();
        let mut header = Header::new(SIGNING_ALGORITHM);
        header.kid = Some(key.key_id.clone());
        let claims = AccessTokenClaims {
            iss: "https://elsewhere.example.com".into(),
            sub: "ada@example.com".into(),
            client_id: "acme".into(),
            scope: String::new(),
            roles: vec![],
            iat: now.unix_timestamp(),
            exp: now.unix_timestamp() + 900,
            jti: "x".into(),
        };
        let token = jsonwebtoken::encode(&header, &claims, key.encoding_key()).unwrap();
        assert!(matches!(
            f.engine.verify_access_token(&token),
            Err(InvalidTokenError::Rejected(_))
        ));
    }

    #[test]
    fn introspection_reports_active_and_inactive_tokens() {
        let f = fixture();
        let code = code_for(&f, "profile");
        let pair = f
            .engine
            .exchange_authorization_code(&code, &acme(), ACME_CB, None)
            .unwrap();

        let access = f.engine.introspect(&pair.access_token, &acme()).unwrap();
        assert!(access.active);
        assert_eq!(access.token_type.as_deref(), Some("access_token"));
        assert_eq!(access.sub.as_deref(), Some("ada@example.com"));

        let refresh = f
            .engine
            .introspect(pair.refresh_token.as_deref().unwrap(), &acme())
            .unwrap();
        assert!(refresh.active);
        assert_eq!(refresh.token_type.as_deref(), Some("refresh_token"));

        let garbage = f.engine.introspect("garbage", &acme()).unwrap();
        assert_eq!(garbage, TokenIntrospection::default());
    }

    #[test]
    fn purge_removes_expired_state() {
        let f = fixture();
        let code = code_for(&f, "profile");
        f.engine
            .exchange_authorization_code(&code, &acme(), ACME_CB, None)
            .unwrap();
        code_for(&f, "profile");

        f.clock.advance(Duration::hours(13));
        assert_eq!(f.engine.purge_expired(), (2, 1));
    }
}
