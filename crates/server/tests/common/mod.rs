//! Shared harness for the HTTP-level tests.
#![allow(dead_code)]

use authz_server::api::build_router;
use authz_server::config::AppConfig;
use authz_server::directory::{AccountRecord, InMemoryAccountDirectory};
use authz_server::oauth2::{
    Clock, ManualClock, OAuth2State, RotatingKeyProvider, hash_password,
};
use axum::http::{HeaderName, HeaderValue, header};
use axum_test::TestServer;
use base64::Engine;
use std::sync::Arc;

pub const ACME_SECRET: &str = "acme-s3cret";
pub const ACME_REDIRECT: &str = "https://acme.example.com/callback";
pub const ADA_EMAIL: &str = "ada@example.com";
pub const ADA_PASSWORD: &str = "correct horse battery";
pub const SESSION_COOKIE: &str = "AUTHZ_SESSION";

pub struct Harness {
    pub server: TestServer,
    pub state: OAuth2State,
    pub directory: Arc<InMemoryAccountDirectory>,
    pub clock: Arc<ManualClock>,
}

/// Configuration with two clients: `acme` (confidential, code + refresh)
/// and `spa` (public, code only). `extra` is appended verbatim.
pub fn test_config(extra: &str) -> AppConfig {
    let yaml = format!(
        r#"
issuer_url: "https://auth.example.com/"
directory:
  base_url: "http://directory.invalid"
clients:
  - client_id: "acme"
    client_secret: "{ACME_SECRET}"
    authentication_methods: [client_secret_basic, client_secret_post]
    grant_types: [authorization_code, refresh_token]
    redirect_uris: ["{ACME_REDIRECT}"]
    scopes: [read, write]
  - client_id: "spa"
    authentication_methods: [none]
    grant_types: [authorization_code]
    redirect_uris: ["http://localhost:3000/callback"]
session:
  secure: false
{extra}
"#
    );
    let app: AppConfig = config::Config::builder()
        .add_source(config::File::from_str(&yaml, config::FileFormat::Yaml))
        .build()
        .expect("build config")
        .try_deserialize()
        .expect("deserialize config");
    app.validate().expect("valid config");
    app
}

pub fn ada() -> AccountRecord {
    AccountRecord {
        email: ADA_EMAIL.to_string(),
        password_hash: Some(hash_password(ADA_PASSWORD).expect("hash")),
        name: Some("Ada".to_string()),
        surnames: Some("Lovelace".to_string()),
        roles: AccountRecord::default_roles(),
        locked: false,
        federated_identity: None,
    }
}

pub fn harness(config: AppConfig, directory: InMemoryAccountDirectory) -> Harness {
    let directory = Arc::new(directory);
    let clock = Arc::new(ManualClock::starting_now());
    let keys = RotatingKeyProvider::new(clock.clone(), time::Duration::minutes(15))
        .expect("signing key");
    let state = OAuth2State::from_config(
        &config,
        directory.clone(),
        Arc::new(keys),
        clock.clone() as Arc<dyn Clock>,
        reqwest::Client::new(),
    )
    .expect("state");
    let server = TestServer::new(build_router(state.clone())).expect("create test server");
    Harness {
        server,
        state,
        directory,
        clock,
    }
}

pub fn basic_auth(client_id: &str, secret: &str) -> (HeaderName, HeaderValue) {
    let encoded = base64::engine::general_purpose::STANDARD.encode(format!("{client_id}:{secret}"));
    (
        header::AUTHORIZATION,
        HeaderValue::from_str(&format!("Basic {encoded}")).expect("header value"),
    )
}

/// Value of a query parameter in a redirect `Location`.
pub fn query_param(location: &str, name: &str) -> Option<String> {
    url::Url::parse(location)
        .expect("absolute location")
        .query_pairs()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.into_owned())
}
