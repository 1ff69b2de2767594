//! In-memory stores for authorization codes and refresh tokens.
//!
//! Both are `DashMap`s. Every state change on a single entry (consuming a
//! code, revoking a refresh token) happens while holding that entry's shard
//! lock, so concurrent requests for the same value serialize and exactly one
//! of them observes the unconsumed state.

use base64::Engine;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use subtle::ConstantTimeEq;
use thiserror::Error;
use time::OffsetDateTime;

/// PKCE code challenge (RFC 7636). Only the `S256` method is accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeChallenge(String);

impl CodeChallenge {
    /// Validate the `code_challenge` and `code_challenge_method` parameters
    /// of an authorization request.
    pub fn parse(challenge: &str, method: Option<&str>) -> Result<Self, String> {
        if method != Some("S256") {
            return Err("code_challenge_method must be S256".to_string());
        }
        let well_formed = challenge.len() == 43
            && challenge
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
        if !well_formed {
            return Err("code_challenge is not a base64url SHA-256 digest".to_string());
        }
        Ok(Self(challenge.to_string()))
    }

    /// The challenge a client derives from its verifier.
    pub fn from_verifier(verifier: &str) -> Self {
        let digest = Sha256::digest(verifier.as_bytes());
        Self(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(digest))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Verifiers are 43 to 128 unreserved characters.
    pub fn verify(&self, verifier: &str) -> bool {
        let well_formed = (43..=128).contains(&verifier.len())
            && verifier
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~'));
        well_formed
            && bool::from(
                Self::from_verifier(verifier)
                    .0
                    .as_bytes()
                    .ct_eq(self.0.as_bytes()),
            )
    }
}

/// One-time authorization code bound to a client, principal and redirect URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationArtifact {
    pub value: String,
    pub client_id: String,
    pub principal_id: String,
    pub roles: BTreeSet<String>,
    pub granted_scopes: BTreeSet<String>,
    pub redirect_uri: String,
    pub code_challenge: Option<CodeChallenge>,
    pub issued_at: OffsetDateTime,
    pub expires_at: OffsetDateTime,
    pub consumed: bool,
}

impl AuthorizationArtifact {
    /// Expiry is strict: at `expires_at` the code is already dead.
    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConsumeRejection {
    #[error("authorization code not found")]
    NotFound,
    #[error("authorization code already used")]
    AlreadyConsumed,
    #[error("authorization code expired")]
    Expired,
    #[error("authorization code was issued to another client")]
    ClientMismatch,
    #[error("redirect_uri does not match the authorization request")]
    RedirectMismatch,
    #[error("code_verifier is required")]
    VerifierMissing,
    #[error("code_verifier does not match the code_challenge")]
    VerifierMismatch,
}

#[derive(Debug, Default)]
pub struct AuthorizationCodeStore {
    codes: DashMap<String, AuthorizationArtifact>,
}

impl AuthorizationCodeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, artifact: AuthorizationArtifact) {
        self.codes.insert(artifact.value.clone(), artifact);
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }

    /// Atomically validate and consume a code.
    ///
    /// A rejected attempt leaves the code untouched, so a client presenting
    /// someone else's code cannot burn it. Codes issued with a PKCE challenge
    /// also need the matching verifier.
    pub fn consume(
        &self,
        code: &str,
        client_id: &str,
        redirect_uri: &str,
        code_verifier: Option<&str>,
        now: OffsetDateTime,
    ) -> Result<AuthorizationArtifact, ConsumeRejection> {
        let mut entry = self.codes.get_mut(code).ok_or(ConsumeRejection::NotFound)?;
        let artifact = entry.value_mut();

        if artifact.consumed {
            return Err(ConsumeRejection::AlreadyConsumed);
        }
        if artifact.is_expired(now) {
            return Err(ConsumeRejection::Expired);
        }
        if artifact.client_id != client_id {
            return Err(ConsumeRejection::ClientMismatch);
        }
        if artifact.redirect_uri != redirect_uri {
            return Err(ConsumeRejection::RedirectMismatch);
        }
        if let Some(challenge) = &artifact.code_challenge {
            match code_verifier {
                None => return Err(ConsumeRejection::VerifierMissing),
                Some(verifier) if !challenge.verify(verifier) => {
                    return Err(ConsumeRejection::VerifierMismatch);
                }
                Some(_) => {}
            }
        }

        artifact.consumed = true;
        Ok(artifact.clone())
    }

    pub fn purge_expired(&self, now: OffsetDateTime) -> usize {
        let before = self.codes.len();
        self.codes.retain(|_, artifact| !artifact.is_expired(now));
        before.saturating_sub(self.codes.len())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshTokenRecord {
    pub value: String,
    pub client_id: String,
    pub principal_id: String,
    pub roles: BTreeSet<String>,
    pub scopes: BTreeSet<String>,
    pub issued_at: OffsetDateTime,
    pub expires_at: OffsetDateTime,
    pub revoked: bool,
}

impl RefreshTokenRecord {
    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        now >= self.expires_at
    }

    pub fn is_active(&self, now: OffsetDateTime) -> bool {
        !self.revoked && !self.is_expired(now)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RefreshRejection {
    #[error("refresh token not found")]
    NotFound,
    #[error("refresh token revoked")]
    Revoked,
    #[error("refresh token expired")]
    Expired,
    #[error("refresh token was issued to another client")]
    ClientMismatch,
}

#[derive(Debug, Default)]
pub struct RefreshTokenStore {
    tokens: DashMap<String, RefreshTokenRecord>,
}

impl RefreshTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: RefreshTokenRecord) {
        self.tokens.insert(record.value.clone(), record);
    }

    pub fn get(&self, value: &str) -> Option<RefreshTokenRecord> {
        self.tokens.get(value).map(|r| r.clone())
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Validate a presented refresh token. With `revoke` set the token is
    /// revoked in the same critical section, so it can be redeemed once.
    pub fn redeem(
        &self,
        value: &str,
        client_id: &str,
        now: OffsetDateTime,
        revoke: bool,
    ) -> Result<RefreshTokenRecord, RefreshRejection> {
        let mut entry = self.tokens.get_mut(value).ok_or(RefreshRejection::NotFound)?;
        let record = entry.value_mut();

        if record.client_id != client_id {
            return Err(RefreshRejection::ClientMismatch);
        }
        if record.revoked {
            return Err(RefreshRejection::Revoked);
        }
        if record.is_expired(now) {
            return Err(RefreshRejection::Expired);
        }

        if revoke {
            record.revoked = true;
        }
        Ok(record.clone())
    }

    /// Revoke a token on behalf of the client it was issued to. Returns
    /// whether anything changed.
    pub fn revoke(&self, value: &str, client_id: &str) -> bool {
        match self.tokens.get_mut(value) {
            Some(mut entry) if entry.client_id == client_id && !entry.revoked => {
                entry.revoked = true;
                true
            }
            _ => false,
        }
    }

    /// Drop expired and revoked tokens.
    pub fn purge_expired(&self, now: OffsetDateTime) -> usize {
        let before = self.tokens.len();
        self.tokens.retain(|_, record| record.is_active(now));
        before.saturating_sub(self.tokens.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use time::Duration;

    fn artifact(now: OffsetDateTime) -> AuthorizationArtifact {
        AuthorizationArtifact {
            value: "code-1".into(),
            client_id: "acme".into(),
            principal_id: "ada@example.com".into(),
            roles: BTreeSet::new(),
            granted_scopes: BTreeSet::from(["profile".to_string()]),
            redirect_uri: "https://acme.test/cb".into(),
            code_challenge: None,
            issued_at: now,
            expires_at: now + Duration::minutes(5),
            consumed: false,
        }
    }

    fn refresh(now: OffsetDateTime) -> RefreshTokenRecord {
        RefreshTokenRecord {
            value: "rt-1".into(),
            client_id: "acme".into(),
            principal_id: "ada@example.com".into(),
            roles: BTreeSet::new(),
            scopes: BTreeSet::new(),
            issued_at: now,
            expires_at: now + Duration::hours(12),
            revoked: false,
        }
    }

    #[test]
    fn code_is_consumed_once() {
        let now = OffsetDateTime::now_utc();
        let store = AuthorizationCodeStore::new();
        store.insert(artifact(now));

        let consumed = store
            .consume("code-1", "acme", "https://acme.test/cb", None, now)
            .unwrap();
        assert!(consumed.consumed);
        assert_eq!(
            store.consume("code-1", "acme", "https://acme.test/cb", None, now),
            Err(ConsumeRejection::AlreadyConsumed)
        );
    }

    #[test]
    fn code_expiry_is_strict() {
        let now = OffsetDateTime::now_utc();
        let store = AuthorizationCodeStore::new();
        store.insert(artifact(now));

        let at_expiry = now + Duration::minutes(5);
        assert_eq!(
            store.consume("code-1", "acme", "https://acme.test/cb", None, at_expiry),
            Err(ConsumeRejection::Expired)
        );
        let just_before = at_expiry - Duration::seconds(1);
        assert!(
            store
                .consume("code-1", "acme", "https://acme.test/cb", None, just_before)
                .is_ok()
        );
    }

    #[test]
    fn mismatched_attempt_does_not_burn_code() {
        let now = OffsetDateTime::now_utc();
        let store = AuthorizationCodeStore::new();
        store.insert(artifact(now));

        assert_eq!(
            store.consume("code-1", "evil", "https://acme.test/cb", None, now),
            Err(ConsumeRejection::ClientMismatch)
        );
        assert_eq!(
            store.consume("code-1", "acme", "https://acme.test/cb/", None, now),
            Err(ConsumeRejection::RedirectMismatch)
        );
        assert!(
            store
                .consume("code-1", "acme", "https://acme.test/cb", None, now)
                .is_ok()
        );
    }

    #[test]
    fn concurrent_consumers_have_one_winner() {
        let now = OffsetDateTime::now_utc();
        let store = Arc::new(AuthorizationCodeStore::new());
        store.insert(artifact(now));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || {
                    store
                        .consume("code-1", "acme", "https://acme.test/cb", None, now)
                        .is_ok()
                })
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(winners, 1);
    }

    const VERIFIER: &str = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";

    #[test]
    fn challenge_matches_rfc7636_example() {
        let challenge =
            CodeChallenge::parse("E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM", Some("S256"))
                .unwrap();
        assert_eq!(CodeChallenge::from_verifier(VERIFIER), challenge);
        assert!(challenge.verify(VERIFIER));
        assert!(!challenge.verify("dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXK"));
        assert!(!challenge.verify("short"));
    }

    #[test]
    fn only_s256_challenges_are_accepted() {
        let challenge = "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM";
        assert!(CodeChallenge::parse(challenge, Some("plain")).is_err());
        assert!(CodeChallenge::parse(challenge, None).is_err());
        assert!(CodeChallenge::parse("not+base64url", Some("S256")).is_err());
    }

    #[test]
    fn pkce_code_needs_matching_verifier() {
        let now = OffsetDateTime::now_utc();
        let store = AuthorizationCodeStore::new();
        let mut pkce = artifact(now);
        pkce.code_challenge = Some(CodeChallenge::from_verifier(VERIFIER));
        store.insert(pkce);

        assert_eq!(
            store.consume("code-1", "acme", "https://acme.test/cb", None, now),
            Err(ConsumeRejection::VerifierMissing)
        );
        let wrong = "x".repeat(43);
        assert_eq!(
            store.consume("code-1", "acme", "https://acme.test/cb", Some(&wrong), now),
            Err(ConsumeRejection::VerifierMismatch)
        );
        // Failed attempts leave the code redeemable by its owner.
        assert!(
            store
                .consume("code-1", "acme", "https://acme.test/cb", Some(VERIFIER), now)
                .is_ok()
        );
    }

    #[test]
    fn purge_removes_only_expired_codes() {
        let now = OffsetDateTime::now_utc();
        let store = AuthorizationCodeStore::new();
        store.insert(artifact(now));
        let mut late = artifact(now + Duration::minutes(10));
        late.value = "code-2".into();
        store.insert(late);

        assert_eq!(store.purge_expired(now + Duration::minutes(6)), 1);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn refresh_redeem_without_rotation_is_repeatable() {
        let now = OffsetDateTime::now_utc();
        let store = RefreshTokenStore::new();
        store.insert(refresh(now));

        assert!(store.redeem("rt-1", "acme", now, false).is_ok());
        assert!(store.redeem("rt-1", "acme", now, false).is_ok());
    }

    #[test]
    fn refresh_redeem_with_rotation_is_single_use() {
        let now = OffsetDateTime::now_utc();
        let store = RefreshTokenStore::new();
        store.insert(refresh(now));

        assert!(store.redeem("rt-1", "acme", now, true).is_ok());
        assert_eq!(
            store.redeem("rt-1", "acme", now, true),
            Err(RefreshRejection::Revoked)
        );
    }

    #[test]
    fn refresh_rejections() {
        let now = OffsetDateTime::now_utc();
        let store = RefreshTokenStore::new();
        store.insert(refresh(now));

        assert_eq!(
            store.redeem("rt-1", "other", now, false),
            Err(RefreshRejection::ClientMismatch)
        );
        assert_eq!(
            store.redeem("rt-1", "acme", now + Duration::hours(12), false),
            Err(RefreshRejection::Expired)
        );
        assert_eq!(
            store.redeem("missing", "acme", now, false),
            Err(RefreshRejection::NotFound)
        );
    }

    #[test]
    fn revoke_requires_owning_client() {
        let now = OffsetDateTime::now_utc();
        let store = RefreshTokenStore::new();
        store.insert(refresh(now));

        assert!(!store.revoke("rt-1", "other"));
        assert!(store.revoke("rt-1", "acme"));
        assert!(!store.revoke("rt-1", "acme"));
        assert_eq!(store.purge_expired(now), 1);
        assert!(store.is_empty());
    }
}
