//! Signing key management.
//!
//! Access tokens are EdDSA (Ed25519) JWTs. The [`SigningKeyProvider`] trait is
//! the seam the token engine signs and verifies through; [`RotatingKeyProvider`]
//! keeps one active key and, after a rotation, keeps publishing the retired
//! key until its overlap window has elapsed.

use crate::error::KeyError;
use crate::oauth2::clock::Clock;
use base64::Engine;
use ed25519_dalek::{SigningKey, VerifyingKey, pkcs8::EncodePrivateKey};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, PoisonError, RwLock};
use time::{Duration, OffsetDateTime};
use utoipa::ToSchema;

pub const SIGNING_ALGORITHM: Algorithm = Algorithm::EdDSA;

#[derive(Clone)]
pub struct SigningKeyPair {
    pub key_id: String,
    pub public_key: VerifyingKey,
    pub created_at: OffsetDateTime,
    encoding_key: EncodingKey,
}

impl std::fmt::Debug for SigningKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKeyPair")
            .field("key_id", &self.key_id)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

impl SigningKeyPair {
    /// Generate a fresh Ed25519 key pair with a random key id.
    pub fn generate(created_at: OffsetDateTime) -> Result<Self, KeyError> {
        let mut seed = [0u8; 32];
        getrandom::fill(&mut seed).map_err(|e| KeyError::Entropy(e.to_string()))?;
        let signing_key = SigningKey::from_bytes(&seed);
        let der = signing_key
            .to_pkcs8_der()
            .map_err(|e| KeyError::Encoding(e.to_string()))?;

        Ok(Self {
            key_id: uuid::Uuid::new_v4().to_string(),
            public_key: signing_key.verifying_key(),
            created_at,
            encoding_key: EncodingKey::from_ed_der(der.as_bytes()),
        })
    }

    pub fn encoding_key(&self) -> &EncodingKey {
        &self.encoding_key
    }

    pub fn verification_key(&self) -> VerificationKey {
        VerificationKey {
            key_id: self.key_id.clone(),
            public_key: self.public_key,
        }
    }
}

/// Public half of a signing key, identified by its `kid`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationKey {
    pub key_id: String,
    pub public_key: VerifyingKey,
}

impl VerificationKey {
    /// Base64url encoding of the raw public key (the JWK `x` member).
    pub fn x(&self) -> String {
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(self.public_key.as_bytes())
    }

    pub fn decoding_key(&self) -> Result<DecodingKey, jsonwebtoken::errors::Error> {
        DecodingKey::from_ed_components(&self.x())
    }
}

/// JSON Web Key for an Ed25519 verification key (RFC 8037).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Jwk {
    pub kty: String,
    pub crv: String,
    pub alg: String,
    #[serde(rename = "use")]
    pub key_use: String,
    pub kid: String,
    pub x: String,
}

impl From<&VerificationKey> for Jwk {
    fn from(key: &VerificationKey) -> Self {
        Self {
            kty: "OKP".to_string(),
            crv: "Ed25519".to_string(),
            alg: "EdDSA".to_string(),
            key_use: "sig".to_string(),
            kid: key.key_id.clone(),
            x: key.x(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct JwkSet {
    pub keys: Vec<Jwk>,
}

pub trait SigningKeyProvider: Send + Sync {
    /// Key used to sign new tokens.
    fn current_signing_key(&self) -> SigningKeyPair;

    /// Every key whose signatures are currently accepted.
    fn public_key_set(&self) -> Vec<VerificationKey>;

    fn jwks(&self) -> JwkSet {
        JwkSet {
            keys: self.public_key_set().iter().map(Jwk::from).collect(),
        }
    }
}

struct RetiredKey {
    key: VerificationKey,
    retired_at: OffsetDateTime,
}

struct KeyRing {
    active: SigningKeyPair,
    retired: Vec<RetiredKey>,
}

pub struct RotatingKeyProvider {
    ring: RwLock<KeyRing>,
    overlap: Duration,
    clock: Arc<dyn Clock>,
}

impl RotatingKeyProvider {
    /// Generates the initial key. Failure here is a startup error.
    pub fn new(clock: Arc<dyn Clock>, overlap: Duration) -> Result<Self, KeyError> {
        let active = SigningKeyPair::generate(clock.now())?;
        tracing::info!(kid = %active.key_id, "Generated signing key");
        Ok(Self {
            ring: RwLock::new(KeyRing {
                active,
                retired: Vec::new(),
            }),
            overlap,
            clock,
        })
    }

    /// Generate a key without installing it.
    pub fn generate_key(&self) -> Result<SigningKeyPair, KeyError> {
        SigningKeyPair::generate(self.clock.now())
    }

    /// Make a fresh key the signing key. The previous key stays verifiable
    /// for the overlap window. Returns the new key id.
    pub fn rotate(&self) -> Result<String, KeyError> {
        let fresh = self.generate_key()?;
        let key_id = fresh.key_id.clone();
        let now = self.clock.now();

        let mut ring = self.ring.write().unwrap_or_else(PoisonError::into_inner);
        let previous = std::mem::replace(&mut ring.active, fresh);
        ring.retired.push(RetiredKey {
            key: previous.verification_key(),
            retired_at: now,
        });
        let overlap = self.overlap;
        ring.retired.retain(|r| r.retired_at + overlap > now);

        tracing::info!(kid = %key_id, retired = %previous.key_id, "Rotated signing key");
        Ok(key_id)
    }
}

impl SigningKeyProvider for RotatingKeyProvider {
    fn current_signing_key(&self) -> SigningKeyPair {
        self.ring
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .active
            .clone()
    }

    fn public_key_set(&self) -> Vec<VerificationKey> {
        let now = self.clock.now();
        let ring = self.ring.read().unwrap_or_else(PoisonError::into_inner);
        std::iter::once(ring.active.verification_key())
            .chain(
                ring.retired
                    .iter()
                    .filter(|r| r.retired_at + self.overlap > now)
                    .map(|r| r.key.clone()),
            )
            .collect()
    }
}
