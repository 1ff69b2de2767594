//! External identity providers.
//!
//! [`FederatedProvider`] is the closed set of providers this server accepts
//! logins from. Each variant knows how to turn its userinfo claims into a
//! subject id and the attributes used to provision a local account.
//! [`ProviderClient`] is the outbound OAuth2 client for one provider.

use crate::config::GoogleProviderConfig;
use crate::error::FederationError;
use crate::oauth2::password::generate_token;
use dashmap::DashMap;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use time::{Duration, OffsetDateTime};
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FederatedProvider {
    Google,
}

impl FederatedProvider {
    pub fn name(&self) -> &'static str {
        match self {
            FederatedProvider::Google => "google",
        }
    }

    /// Pull the subject id and profile attributes out of userinfo claims.
    pub fn extract_profile(
        &self,
        claims: &Map<String, Value>,
    ) -> Result<FederatedProfile, FederationError> {
        match self {
            FederatedProvider::Google => {
                let subject =
                    string_claim(claims, "sub").ok_or(FederationError::MissingAttribute("sub"))?;
                let email = string_claim(claims, "email")
                    .ok_or(FederationError::MissingAttribute("email"))?;
                Ok(FederatedProfile {
                    subject,
                    attributes: FederatedAttributes {
                        email,
                        email_verified: bool_claim(claims, "email_verified"),
                        given_name: string_claim(claims, "given_name"),
                        family_name: string_claim(claims, "family_name"),
                    },
                })
            }
        }
    }
}

impl fmt::Display for FederatedProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for FederatedProvider {
    type Err = FederationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "google" => Ok(FederatedProvider::Google),
            other => Err(FederationError::UnsupportedProvider(other.to_string())),
        }
    }
}

fn string_claim(claims: &Map<String, Value>, name: &str) -> Option<String> {
    claims
        .get(name)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
}

/// Google sends `email_verified` as a JSON bool, older endpoints as a string.
fn bool_claim(claims: &Map<String, Value>, name: &str) -> bool {
    match claims.get(name) {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => s.eq_ignore_ascii_case("true"),
        _ => false,
    }
}

/// Profile attributes asserted by a provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FederatedAttributes {
    pub email: String,
    /// Whether the provider vouches that the subject controls `email`.
    pub email_verified: bool,
    pub given_name: Option<String>,
    pub family_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FederatedProfile {
    pub subject: String,
    pub attributes: FederatedAttributes,
}

#[derive(Debug, Deserialize)]
struct ProviderTokenResponse {
    access_token: String,
}

/// Outbound OAuth2 client for one external provider.
#[derive(Debug, Clone)]
pub struct ProviderClient {
    provider: FederatedProvider,
    client_id: String,
    client_secret: String,
    redirect_uri: Url,
    auth_url: Url,
    token_url: Url,
    userinfo_url: Url,
    scopes: Vec<String>,
    http: reqwest::Client,
}

impl ProviderClient {
    pub fn google(
        config: &GoogleProviderConfig,
        http: reqwest::Client,
    ) -> Result<Self, FederationError> {
        let parse = |value: &str| {
            Url::parse(value).map_err(|e| FederationError::Provider {
                operation: "configuration",
                detail: format!("{value}: {e}"),
            })
        };
        Ok(Self {
            provider: FederatedProvider::Google,
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            redirect_uri: parse(&config.redirect_uri)?,
            auth_url: parse(&config.auth_url)?,
            token_url: parse(&config.token_url)?,
            userinfo_url: parse(&config.userinfo_url)?,
            scopes: config.scopes.clone(),
            http,
        })
    }

    pub fn provider(&self) -> FederatedProvider {
        self.provider
    }

    /// URL the browser is sent to in order to log in at the provider.
    pub fn authorization_url(&self, state: &str) -> String {
        let mut url = self.auth_url.clone();
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &self.client_id)
            .append_pair("redirect_uri", self.redirect_uri.as_str())
            .append_pair("scope", &self.scopes.join(" "))
            .append_pair("state", state);
        url.into()
    }

    /// Exchange the provider's authorization code for its access token.
    #[tracing::instrument(skip_all, fields(provider = %self.provider))]
    pub async fn exchange_code(&self, code: &str) -> Result<String, FederationError> {
        let params = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", self.redirect_uri.as_str()),
        ];
        let response = self
            .http
            .post(self.token_url.clone())
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(&params)
            .send()
            .await?;

        let response = ensure_success(response, "token exchange").await?;
        let token: ProviderTokenResponse = response.json().await?;
        Ok(token.access_token)
    }

    #[tracing::instrument(skip_all, fields(provider = %self.provider))]
    pub async fn fetch_userinfo(
        &self,
        access_token: &str,
    ) -> Result<Map<String, Value>, FederationError> {
        let response = self
            .http
            .get(self.userinfo_url.clone())
            .bearer_auth(access_token)
            .send()
            .await?;

        let response = ensure_success(response, "userinfo request").await?;
        Ok(response.json().await?)
    }

    /// Redeem the callback code and resolve the provider profile.
    pub async fn complete_login(&self, code: &str) -> Result<FederatedProfile, FederationError> {
        let access_token = self.exchange_code(code).await?;
        let claims = self.fetch_userinfo(&access_token).await?;
        self.provider.extract_profile(&claims)
    }
}

async fn ensure_success(
    response: reqwest::Response,
    operation: &'static str,
) -> Result<reqwest::Response, FederationError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    Err(FederationError::Provider {
        operation,
        detail: format!("HTTP {status}: {body}"),
    })
}

/// One-time `state` values for federated logins in flight.
#[derive(Debug, Default)]
pub struct PendingLogins {
    pending: DashMap<String, (FederatedProvider, OffsetDateTime)>,
}

impl PendingLogins {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn issue(
        &self,
        provider: FederatedProvider,
        now: OffsetDateTime,
        ttl: Duration,
    ) -> Result<String, FederationError> {
        let state = generate_token()?;
        self.pending.insert(state.clone(), (provider, now + ttl));
        Ok(state)
    }

    /// Consume a state value. Valid only once, only for the provider it was
    /// issued for, and only before it expires.
    pub fn take(&self, state: &str, provider: FederatedProvider, now: OffsetDateTime) -> bool {
        match self.pending.remove(state) {
            Some((_, (issued_for, expires_at))) => issued_for == provider && now < expires_at,
            None => false,
        }
    }

    pub fn purge_expired(&self, now: OffsetDateTime) -> usize {
        let before = self.pending.len();
        self.pending.retain(|_, (_, expires_at)| now < *expires_at);
        before.saturating_sub(self.pending.len())
    }
}
