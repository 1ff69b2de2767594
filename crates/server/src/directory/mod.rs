//! Account Directory client.
//!
//! Account records are owned by a remote directory service. This module
//! defines the narrow interface the authorization server needs from it
//! (`lookup_account_by_email`, `lookup_account_by_identity`,
//! `register_account`) plus two implementations:
//!
//! - [`HttpAccountDirectory`] talks to the remote service over HTTP
//! - [`InMemoryAccountDirectory`] for tests and local development

mod http;
mod memory;

pub use http::HttpAccountDirectory;
pub use memory::InMemoryAccountDirectory;

use crate::error::DirectoryError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::future::Future;
use std::time::Duration;

/// Role granted to every self-registered or federated account.
pub const DEFAULT_ROLE: &str = "DEFAULT";

const LOOKUP_ATTEMPTS: u32 = 3;
const LOOKUP_BACKOFF_BASE: Duration = Duration::from_millis(100);

/// Link between a local account and an identity asserted by an external provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FederatedIdentityLink {
    pub provider_name: String,
    pub provider_subject_id: String,
}

/// Account as stored by the directory. The email is the principal identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountRecord {
    pub email: String,
    /// PHC-formatted hash; `None` for federated-only accounts.
    #[serde(default)]
    pub password_hash: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub surnames: Option<String>,
    #[serde(default)]
    pub roles: BTreeSet<String>,
    #[serde(default)]
    pub locked: bool,
    #[serde(default)]
    pub federated_identity: Option<FederatedIdentityLink>,
}

impl AccountRecord {
    pub fn default_roles() -> BTreeSet<String> {
        BTreeSet::from([DEFAULT_ROLE.to_string()])
    }
}

/// Identity of an authenticated principal, as carried by sessions and tokens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrincipalIdentity {
    pub principal_id: String,
    pub roles: BTreeSet<String>,
    pub enabled: bool,
}

impl From<&AccountRecord> for PrincipalIdentity {
    fn from(account: &AccountRecord) -> Self {
        Self {
            principal_id: account.email.clone(),
            roles: account.roles.clone(),
            enabled: !account.locked,
        }
    }
}

/// Result of a registration attempt. The directory enforces uniqueness of
/// both the email and the federated identity link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationOutcome {
    Created,
    AlreadyExists,
}

#[async_trait]
pub trait AccountDirectory: Send + Sync {
    async fn lookup_account_by_email(
        &self,
        email: &str,
    ) -> Result<Option<AccountRecord>, DirectoryError>;

    /// The account an external identity is linked to, if any.
    async fn lookup_account_by_identity(
        &self,
        link: &FederatedIdentityLink,
    ) -> Result<Option<AccountRecord>, DirectoryError>;

    async fn register_account(
        &self,
        account: &AccountRecord,
    ) -> Result<RegistrationOutcome, DirectoryError>;
}

/// Look up an account, retrying transient directory failures with
/// exponential backoff. Lookups are idempotent; registration is never retried.
#[tracing::instrument(skip(directory))]
pub async fn lookup_with_retry(
    directory: &dyn AccountDirectory,
    email: &str,
) -> Result<Option<AccountRecord>, DirectoryError> {
    retry_lookup(|| directory.lookup_account_by_email(email)).await
}

/// [`lookup_with_retry`] keyed by federated identity.
#[tracing::instrument(skip(directory))]
pub async fn lookup_identity_with_retry(
    directory: &dyn AccountDirectory,
    link: &FederatedIdentityLink,
) -> Result<Option<AccountRecord>, DirectoryError> {
    retry_lookup(|| directory.lookup_account_by_identity(link)).await
}

async fn retry_lookup<F, Fut>(mut lookup: F) -> Result<Option<AccountRecord>, DirectoryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<AccountRecord>, DirectoryError>>,
{
    let mut attempt = 1;
    loop {
        match lookup().await {
            Ok(found) => return Ok(found),
            Err(e) if e.is_retryable() && attempt < LOOKUP_ATTEMPTS => {
                let delay = LOOKUP_BACKOFF_BASE * 2u32.pow(attempt - 1);
                tracing::warn!(attempt, error = %e, ?delay, "Directory lookup failed, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Normalise an email address the way the directory indexes it.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}
