use crate::directory::{AccountDirectory, PrincipalIdentity, lookup_with_retry, normalize_email};
use crate::error::AuthenticationError;
use crate::oauth2::password::verify_password;
use std::sync::Arc;

/// Validates email/password pairs against the Account Directory.
#[derive(Clone)]
pub struct CredentialAuthenticator {
    directory: Arc<dyn AccountDirectory>,
}

impl CredentialAuthenticator {
    pub fn new(directory: Arc<dyn AccountDirectory>) -> Self {
        Self { directory }
    }

    #[tracing::instrument(skip(self, password))]
    pub async fn authenticate(
        &self,
        email: &str,
        password: &str,
    ) -> Result<PrincipalIdentity, AuthenticationError> {
        let email = normalize_email(email);
        let account = lookup_with_retry(self.directory.as_ref(), &email)
            .await?
            .ok_or(AuthenticationError::AccountNotFound)?;

        if account.locked {
            return Err(AuthenticationError::AccountLocked);
        }
        let Some(hash) = account.password_hash.clone() else {
            return Err(AuthenticationError::InvalidCredentials);
        };

        // Argon2 is deliberately slow; keep it off the async workers.
        let password = password.to_string();
        let matches = tokio::task::spawn_blocking(move || verify_password(&password, &hash))
            .await
            .unwrap_or(false);
        if !matches {
            return Err(AuthenticationError::InvalidCredentials);
        }

        tracing::debug!(principal = %account.email, "Password authentication succeeded");
        Ok(PrincipalIdentity::from(&account))
    }
}
