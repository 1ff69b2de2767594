//! Shared state for the authorization server endpoints.

use crate::config::{AppConfig, SessionConfig};
use crate::directory::AccountDirectory;
use crate::error::FederationError;
use crate::oauth2::authenticator::CredentialAuthenticator;
use crate::oauth2::clock::Clock;
use crate::oauth2::engine::TokenEngine;
use crate::oauth2::identity::FederatedIdentityBridge;
use crate::oauth2::keys::SigningKeyProvider;
use crate::oauth2::provider::{FederatedProvider, PendingLogins, ProviderClient};
use crate::oauth2::registrar::ClientRegistry;
use crate::oauth2::session::SessionStore;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// How long a federated login may take between redirect and callback.
const PENDING_LOGIN_TTL: time::Duration = time::Duration::minutes(10);

#[derive(Clone)]
pub struct OAuth2State {
    pub engine: Arc<TokenEngine>,
    pub authenticator: CredentialAuthenticator,
    pub bridge: FederatedIdentityBridge,
    pub directory: Arc<dyn AccountDirectory>,
    pub sessions: Arc<SessionStore>,
    pub providers: Arc<HashMap<FederatedProvider, ProviderClient>>,
    pub pending_logins: Arc<PendingLogins>,
    pub session_config: SessionConfig,
    pub clock: Arc<dyn Clock>,
}

impl OAuth2State {
    /// Wire every component from configuration. `http` is shared by all
    /// outbound provider calls.
    pub fn from_config(
        config: &AppConfig,
        directory: Arc<dyn AccountDirectory>,
        keys: Arc<dyn SigningKeyProvider>,
        clock: Arc<dyn Clock>,
        http: reqwest::Client,
    ) -> Result<Self, FederationError> {
        let clients = Arc::new(ClientRegistry::from_config(&config.clients, &config.tokens));
        tracing::info!(clients = clients.len(), "Loaded client registry");

        let engine = TokenEngine::new(
            config.issuer_url.trim_end_matches('/'),
            clients,
            keys,
            clock.clone(),
            &config.tokens,
        );

        let mut providers = HashMap::new();
        if let Some(google) = &config.federation.google {
            providers.insert(FederatedProvider::Google, ProviderClient::google(google, http)?);
        }

        Ok(Self {
            engine: Arc::new(engine),
            authenticator: CredentialAuthenticator::new(directory.clone()),
            bridge: FederatedIdentityBridge::new(directory.clone()),
            directory,
            sessions: Arc::new(SessionStore::new(
                time::Duration::seconds(config.session.ttl_secs),
                clock.clone(),
            )),
            providers: Arc::new(providers),
            pending_logins: Arc::new(PendingLogins::new()),
            session_config: config.session.clone(),
            clock,
        })
    }

    pub fn provider(
        &self,
        provider: FederatedProvider,
    ) -> Result<&ProviderClient, FederationError> {
        self.providers
            .get(&provider)
            .ok_or_else(|| FederationError::ProviderNotConfigured(provider.to_string()))
    }

    pub fn pending_login_ttl(&self) -> time::Duration {
        PENDING_LOGIN_TTL
    }

    /// Drop expired codes, refresh tokens, sessions and pending logins.
    pub fn purge_expired(&self) {
        let (codes, refresh_tokens) = self.engine.purge_expired();
        let sessions = self.sessions.purge_expired();
        let pending = self.pending_logins.purge_expired(self.clock.now());
        if codes + refresh_tokens + sessions + pending > 0 {
            tracing::debug!(codes, refresh_tokens, sessions, pending, "Purged expired state");
        }
    }
}

/// Periodically purge expired protocol state.
pub fn spawn_purge_task(state: OAuth2State, every: Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            state.purge_expired();
        }
    });
}
