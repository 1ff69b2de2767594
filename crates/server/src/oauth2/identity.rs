//! Provisioning of local accounts for federated logins.
//!
//! The first successful login through an external provider creates the local
//! account. Every later login (or a concurrent duplicate) is answered with
//! `AlreadyExists` by the directory; the bridge then logs in as whichever
//! account the external identity is linked to. An email match alone never
//! grants access to an existing account.

use crate::directory::{
    AccountDirectory, AccountRecord, FederatedIdentityLink, PrincipalIdentity,
    RegistrationOutcome, lookup_identity_with_retry, normalize_email,
};
use crate::error::FederationError;
use crate::oauth2::provider::{FederatedAttributes, FederatedProvider};
use std::sync::Arc;

#[derive(Clone)]
pub struct FederatedIdentityBridge {
    directory: Arc<dyn AccountDirectory>,
}

impl FederatedIdentityBridge {
    pub fn new(directory: Arc<dyn AccountDirectory>) -> Self {
        Self { directory }
    }

    /// Ensure a local account exists for this federated identity and return
    /// the principal to log in as.
    ///
    /// Unknown providers and unverified emails are rejected before anything
    /// is registered. When the directory already holds the identity, the
    /// linked account is re-read so a locked account stays locked. When it
    /// holds only the email, under another or no identity, the login fails.
    #[tracing::instrument(skip(self, attributes))]
    pub async fn on_federated_login_success(
        &self,
        provider_name: &str,
        provider_subject_id: &str,
        attributes: FederatedAttributes,
    ) -> Result<PrincipalIdentity, FederationError> {
        let provider: FederatedProvider = provider_name.parse()?;
        if !attributes.email_verified {
            tracing::warn!(%provider, "Federated login with unverified email");
            return Err(FederationError::UnverifiedEmail);
        }

        let link = FederatedIdentityLink {
            provider_name: provider.name().to_string(),
            provider_subject_id: provider_subject_id.to_string(),
        };
        let account = AccountRecord {
            email: normalize_email(&attributes.email),
            password_hash: None,
            name: attributes.given_name,
            surnames: attributes.family_name,
            roles: AccountRecord::default_roles(),
            locked: false,
            federated_identity: Some(link.clone()),
        };

        match self.directory.register_account(&account).await? {
            RegistrationOutcome::Created => {
                tracing::info!(
                    principal = %account.email,
                    provider = %provider,
                    "Provisioned account for federated identity"
                );
                Ok(PrincipalIdentity::from(&account))
            }
            RegistrationOutcome::AlreadyExists => {
                match lookup_identity_with_retry(self.directory.as_ref(), &link).await? {
                    Some(linked) if linked.locked => {
                        tracing::warn!(
                            principal = %linked.email,
                            "Federated login for locked account"
                        );
                        Err(FederationError::AccountLocked)
                    }
                    Some(linked) => Ok(PrincipalIdentity::from(&linked)),
                    None => {
                        tracing::warn!(
                            principal = %account.email,
                            provider = %provider,
                            "Email already belongs to an account not linked to this identity"
                        );
                        Err(FederationError::EmailInUse(account.email))
                    }
                }
            }
        }
    }
}
