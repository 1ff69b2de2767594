use crate::oauth2::registrar::{ClientAuthMethod, GrantType};
use serde::Deserialize;
use std::collections::HashSet;
use thiserror::Error;
use url::Url;

/// Upper bound for every lifetime in the configuration. Larger values would
/// overflow timestamp arithmetic.
pub const MAX_TTL_SECS: i64 = 10 * 365 * 24 * 3600;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration build error: {0}")]
    Build(#[from] config::ConfigError),
    #[error("Invalid configuration: {0}")]
    Validation(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Base URL of this server, used as the `iss` claim.
    pub issuer_url: String,
    pub directory: DirectoryConfig,
    #[serde(default)]
    pub tokens: TokenConfig,
    pub clients: Vec<ClientConfig>,
    #[serde(default)]
    pub federation: FederationConfig,
    #[serde(default)]
    pub session: SessionConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DirectoryConfig {
    pub base_url: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenConfig {
    #[serde(default = "default_access_token_ttl")]
    pub access_token_ttl_secs: i64,
    #[serde(default = "default_refresh_token_ttl")]
    pub refresh_token_ttl_secs: i64,
    #[serde(default = "default_code_ttl")]
    pub authorization_code_ttl_secs: i64,
    /// Issue a new refresh token on every refresh and revoke the old one.
    #[serde(default)]
    pub rotate_refresh_tokens: bool,
    /// How long a retired signing key stays in the published key set. With
    /// rotation enabled it must cover the longest access token lifetime.
    #[serde(default = "default_access_token_ttl")]
    pub key_overlap_secs: i64,
    /// Rotate the signing key on this interval. Unset keeps one key for the
    /// process lifetime.
    #[serde(default)]
    pub key_rotation_interval_secs: Option<u64>,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            access_token_ttl_secs: default_access_token_ttl(),
            refresh_token_ttl_secs: default_refresh_token_ttl(),
            authorization_code_ttl_secs: default_code_ttl(),
            rotate_refresh_tokens: false,
            key_overlap_secs: default_access_token_ttl(),
            key_rotation_interval_secs: None,
        }
    }
}

/// A relying party allowed to take part in the authorization code flow.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    pub client_id: String,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default = "default_auth_methods")]
    pub authentication_methods: Vec<ClientAuthMethod>,
    #[serde(default = "default_grant_types")]
    pub grant_types: Vec<GrantType>,
    pub redirect_uris: Vec<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub access_token_ttl_secs: Option<i64>,
    #[serde(default)]
    pub refresh_token_ttl_secs: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FederationConfig {
    #[serde(default)]
    pub google: Option<GoogleProviderConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GoogleProviderConfig {
    pub client_id: String,
    pub client_secret: String,
    /// Our callback, e.g. `https://auth.example.com/login/oauth2/code/google`.
    pub redirect_uri: String,
    #[serde(default = "default_google_auth_url")]
    pub auth_url: String,
    #[serde(default = "default_google_token_url")]
    pub token_url: String,
    #[serde(default = "default_google_userinfo_url")]
    pub userinfo_url: String,
    #[serde(default = "default_google_scopes")]
    pub scopes: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_cookie_name")]
    pub cookie_name: String,
    #[serde(default = "default_session_ttl")]
    pub ttl_secs: i64,
    #[serde(default = "default_true")]
    pub secure: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cookie_name: default_cookie_name(),
            ttl_secs: default_session_ttl(),
            secure: true,
        }
    }
}

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_timeout_ms() -> u64 {
    5000
}

fn default_access_token_ttl() -> i64 {
    900
}

fn default_refresh_token_ttl() -> i64 {
    12 * 3600
}

fn default_code_ttl() -> i64 {
    300
}

fn default_auth_methods() -> Vec<ClientAuthMethod> {
    vec![ClientAuthMethod::ClientSecretBasic]
}

fn default_grant_types() -> Vec<GrantType> {
    vec![GrantType::AuthorizationCode, GrantType::RefreshToken]
}

fn default_google_auth_url() -> String {
    "https://accounts.google.com/o/oauth2/v2/auth".to_string()
}

fn default_google_token_url() -> String {
    "https://oauth2.googleapis.com/token".to_string()
}

fn default_google_userinfo_url() -> String {
    "https://openidconnect.googleapis.com/v1/userinfo".to_string()
}

fn default_google_scopes() -> Vec<String> {
    vec!["openid".into(), "email".into(), "profile".into()]
}

fn default_cookie_name() -> String {
    "AUTHZ_SESSION".to_string()
}

fn default_session_ttl() -> i64 {
    3600
}

fn default_true() -> bool {
    true
}

impl AppConfig {
    /// Check invariants that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        parse_url("issuer_url", &self.issuer_url)?;
        parse_url("directory.base_url", &self.directory.base_url)?;

        let tokens = &self.tokens;
        for (name, value) in [
            ("tokens.access_token_ttl_secs", tokens.access_token_ttl_secs),
            ("tokens.refresh_token_ttl_secs", tokens.refresh_token_ttl_secs),
            (
                "tokens.authorization_code_ttl_secs",
                tokens.authorization_code_ttl_secs,
            ),
            ("session.ttl_secs", self.session.ttl_secs),
        ] {
            check_ttl(name, value)?;
        }
        if !(0..=MAX_TTL_SECS).contains(&tokens.key_overlap_secs) {
            return Err(ConfigError::Validation(format!(
                "tokens.key_overlap_secs must be between 0 and {MAX_TTL_SECS}"
            )));
        }
        if let Some(interval) = tokens.key_rotation_interval_secs {
            if interval == 0 || interval > MAX_TTL_SECS as u64 {
                return Err(ConfigError::Validation(format!(
                    "tokens.key_rotation_interval_secs must be between 1 and {MAX_TTL_SECS}"
                )));
            }
            let longest = self.max_access_token_ttl_secs();
            if tokens.key_overlap_secs < longest {
                return Err(ConfigError::Validation(format!(
                    "tokens.key_overlap_secs ({}) must be at least the longest access token \
                     lifetime ({longest}) when key rotation is enabled",
                    tokens.key_overlap_secs
                )));
            }
        }

        let mut seen = HashSet::new();
        for client in &self.clients {
            if !seen.insert(client.client_id.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "duplicate client_id {}",
                    client.client_id
                )));
            }
            client.validate()?;
        }

        if let Some(google) = &self.federation.google {
            parse_url("federation.google.redirect_uri", &google.redirect_uri)?;
            parse_url("federation.google.auth_url", &google.auth_url)?;
            parse_url("federation.google.token_url", &google.token_url)?;
            parse_url("federation.google.userinfo_url", &google.userinfo_url)?;
        }

        Ok(())
    }

    /// Longest access token lifetime any client can be issued.
    pub fn max_access_token_ttl_secs(&self) -> i64 {
        self.clients
            .iter()
            .filter_map(|c| c.access_token_ttl_secs)
            .fold(self.tokens.access_token_ttl_secs, i64::max)
    }
}

impl ClientConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        let id = &self.client_id;
        if id.is_empty() {
            return Err(ConfigError::Validation("client_id must not be empty".into()));
        }
        if self.redirect_uris.is_empty() {
            return Err(ConfigError::Validation(format!(
                "client {id} has no redirect_uris"
            )));
        }
        for uri in &self.redirect_uris {
            parse_url(&format!("client {id} redirect_uri"), uri)?;
        }
        if self.authentication_methods.is_empty() {
            return Err(ConfigError::Validation(format!(
                "client {id} has no authentication_methods"
            )));
        }
        let needs_secret = self
            .authentication_methods
            .iter()
            .any(|m| *m != ClientAuthMethod::None);
        if needs_secret && self.client_secret.as_deref().is_none_or(str::is_empty) {
            return Err(ConfigError::Validation(format!(
                "client {id} uses a secret-based authentication method but has no client_secret"
            )));
        }
        for (name, ttl) in [
            ("access_token_ttl_secs", self.access_token_ttl_secs),
            ("refresh_token_ttl_secs", self.refresh_token_ttl_secs),
        ] {
            if let Some(ttl) = ttl {
                check_ttl(&format!("client {id} {name}"), ttl)?;
            }
        }
        Ok(())
    }
}

fn check_ttl(name: &str, value: i64) -> Result<(), ConfigError> {
    if value <= 0 || value > MAX_TTL_SECS {
        return Err(ConfigError::Validation(format!(
            "{name} must be between 1 and {MAX_TTL_SECS}"
        )));
    }
    Ok(())
}

fn parse_url(name: &str, value: &str) -> Result<Url, ConfigError> {
    Url::parse(value).map_err(|e| ConfigError::Validation(format!("{name} is not a URL: {e}")))
}

/// Load application configuration from `config.yaml` + environment overrides.
///
/// Any environment variable matching the key path separated by double
/// underscores (e.g. `DIRECTORY__BASE_URL`) overrides the file value.
pub fn load_config() -> Result<AppConfig, ConfigError> {
    load_config_from("config.yaml")
}

pub fn load_config_from(path: &str) -> Result<AppConfig, ConfigError> {
    use config::{Config, Environment, File};
    let cfg = Config::builder()
        .add_source(File::with_name(path))
        .add_source(Environment::default().separator("__"))
        .build()?;

    let app: AppConfig = cfg.try_deserialize()?;
    app.validate()?;
    Ok(app)
}
