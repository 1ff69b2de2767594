//! Registry of trusted relying-party clients.
//!
//! Clients are loaded once from configuration and never change afterwards.

use crate::config::{ClientConfig, TokenConfig};
use crate::error::ClientAuthenticationError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use subtle::ConstantTimeEq;
use time::Duration;

/// How a client proves its identity at the token endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientAuthMethod {
    /// `Authorization: Basic` header.
    ClientSecretBasic,
    /// `client_id` and `client_secret` in the form body.
    ClientSecretPost,
    /// Public client, `client_id` only.
    None,
}

impl ClientAuthMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientAuthMethod::ClientSecretBasic => "client_secret_basic",
            ClientAuthMethod::ClientSecretPost => "client_secret_post",
            ClientAuthMethod::None => "none",
        }
    }
}

impl fmt::Display for ClientAuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantType {
    AuthorizationCode,
    RefreshToken,
}

impl GrantType {
    pub fn as_str(&self) -> &'static str {
        match self {
            GrantType::AuthorizationCode => "authorization_code",
            GrantType::RefreshToken => "refresh_token",
        }
    }
}

impl fmt::Display for GrantType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GrantType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "authorization_code" => Ok(GrantType::AuthorizationCode),
            "refresh_token" => Ok(GrantType::RefreshToken),
            other => Err(other.to_string()),
        }
    }
}

#[derive(Clone)]
pub struct RegisteredClient {
    pub client_id: String,
    client_secret: Option<String>,
    pub authentication_methods: Vec<ClientAuthMethod>,
    pub grant_types: Vec<GrantType>,
    pub redirect_uris: Vec<String>,
    pub scopes: BTreeSet<String>,
    pub access_token_ttl: Duration,
    pub refresh_token_ttl: Duration,
}

impl fmt::Debug for RegisteredClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredClient")
            .field("client_id", &self.client_id)
            .field("authentication_methods", &self.authentication_methods)
            .field("grant_types", &self.grant_types)
            .field("redirect_uris", &self.redirect_uris)
            .field("scopes", &self.scopes)
            .finish_non_exhaustive()
    }
}

impl RegisteredClient {
    pub fn from_config(config: &ClientConfig, tokens: &TokenConfig) -> Self {
        Self {
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            authentication_methods: config.authentication_methods.clone(),
            grant_types: config.grant_types.clone(),
            redirect_uris: config.redirect_uris.clone(),
            scopes: config.scopes.iter().cloned().collect(),
            access_token_ttl: Duration::seconds(
                config
                    .access_token_ttl_secs
                    .unwrap_or(tokens.access_token_ttl_secs),
            ),
            refresh_token_ttl: Duration::seconds(
                config
                    .refresh_token_ttl_secs
                    .unwrap_or(tokens.refresh_token_ttl_secs),
            ),
        }
    }

    /// Redirect URIs are compared byte for byte. No normalisation.
    pub fn is_redirect_uri_allowed(&self, uri: &str) -> bool {
        self.redirect_uris.iter().any(|allowed| allowed == uri)
    }

    pub fn allows_grant(&self, grant: GrantType) -> bool {
        self.grant_types.contains(&grant)
    }

    pub fn allows_method(&self, method: ClientAuthMethod) -> bool {
        self.authentication_methods.contains(&method)
    }

    fn secret_matches(&self, presented: Option<&str>) -> bool {
        match (self.client_secret.as_deref(), presented) {
            (Some(stored), Some(presented)) => {
                bool::from(stored.as_bytes().ct_eq(presented.as_bytes()))
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ClientRegistry {
    clients: HashMap<String, RegisteredClient>,
}

impl ClientRegistry {
    pub fn from_config(clients: &[ClientConfig], tokens: &TokenConfig) -> Self {
        let clients = clients
            .iter()
            .map(|c| {
                (
                    c.client_id.clone(),
                    RegisteredClient::from_config(c, tokens),
                )
            })
            .collect();
        Self { clients }
    }

    pub fn lookup(&self, client_id: &str) -> Option<&RegisteredClient> {
        self.clients.get(client_id)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Authenticate a client using the method it presented credentials with.
    ///
    /// `credential` is the presented secret; public clients (`none`) present none.
    pub fn authenticate(
        &self,
        client_id: &str,
        credential: Option<&str>,
        method: ClientAuthMethod,
    ) -> Result<&RegisteredClient, ClientAuthenticationError> {
        let client = self
            .lookup(client_id)
            .ok_or_else(|| ClientAuthenticationError::UnknownClient(client_id.to_string()))?;

        if !client.allows_method(method) {
            return Err(ClientAuthenticationError::MethodNotAllowed {
                client_id: client_id.to_string(),
                method: method.to_string(),
            });
        }

        match method {
            ClientAuthMethod::None => Ok(client),
            ClientAuthMethod::ClientSecretBasic | ClientAuthMethod::ClientSecretPost => {
                if client.secret_matches(credential) {
                    Ok(client)
                } else {
                    Err(ClientAuthenticationError::InvalidCredential(
                        client_id.to_string(),
                    ))
                }
            }
        }
    }
}
