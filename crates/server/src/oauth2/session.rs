//! Interactive login sessions.
//!
//! A session is created by a successful password or federated login and is
//! what `/oauth2/authorize` accepts as proof that the principal is
//! authenticated. Sessions are referenced by an opaque id in a cookie.

use crate::directory::PrincipalIdentity;
use crate::error::KeyError;
use crate::oauth2::clock::Clock;
use crate::oauth2::password::generate_token;
use dashmap::DashMap;
use std::sync::Arc;
use time::{Duration, OffsetDateTime};

#[derive(Debug, Clone)]
struct Session {
    principal: PrincipalIdentity,
    expires_at: OffsetDateTime,
}

pub struct SessionStore {
    sessions: DashMap<String, Session>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl SessionStore {
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            sessions: DashMap::new(),
            ttl,
            clock,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Start a session and return its id.
    pub fn create(&self, principal: PrincipalIdentity) -> Result<String, KeyError> {
        let id = generate_token()?;
        let expires_at = self.clock.now() + self.ttl;
        self.sessions.insert(
            id.clone(),
            Session {
                principal,
                expires_at,
            },
        );
        Ok(id)
    }

    /// Principal behind a live session. Expired sessions are dropped.
    pub fn get(&self, id: &str) -> Option<PrincipalIdentity> {
        let now = self.clock.now();
        let live = self
            .sessions
            .get(id)
            .map(|s| (now < s.expires_at).then(|| s.principal.clone()))?;
        if live.is_none() {
            self.sessions.remove(id);
        }
        live
    }

    pub fn remove(&self, id: &str) {
        self.sessions.remove(id);
    }

    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.sessions.len();
        self.sessions.retain(|_, s| now < s.expires_at);
        before.saturating_sub(self.sessions.len())
    }
}
