use super::{AccountDirectory, AccountRecord, FederatedIdentityLink, RegistrationOutcome};
use crate::error::DirectoryError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Default)]
struct Accounts {
    by_email: HashMap<String, AccountRecord>,
    by_identity: HashMap<FederatedIdentityLink, String>,
}

/// In-process Account Directory with the same uniqueness rules as the remote
/// one: one account per email and one account per federated identity.
#[derive(Default)]
pub struct InMemoryAccountDirectory {
    accounts: Mutex<Accounts>,
    register_calls: AtomicUsize,
}

impl InMemoryAccountDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an account, replacing any record with the same email.
    pub fn with_account(self, account: AccountRecord) -> Self {
        {
            let mut accounts = self.lock();
            if let Some(link) = &account.federated_identity {
                accounts
                    .by_identity
                    .insert(link.clone(), account.email.clone());
            }
            accounts.by_email.insert(account.email.clone(), account);
        }
        self
    }

    pub fn len(&self) -> usize {
        self.lock().by_email.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of `register_account` calls received, successful or not.
    pub fn register_calls(&self) -> usize {
        self.register_calls.load(Ordering::SeqCst)
    }

    pub fn find_by_identity(&self, provider: &str, subject: &str) -> Option<AccountRecord> {
        let link = FederatedIdentityLink {
            provider_name: provider.to_string(),
            provider_subject_id: subject.to_string(),
        };
        let accounts = self.lock();
        accounts
            .by_identity
            .get(&link)
            .and_then(|email| accounts.by_email.get(email))
            .cloned()
    }

    pub fn find_by_email(&self, email: &str) -> Option<AccountRecord> {
        self.lock().by_email.get(email).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Accounts> {
        self.accounts
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl AccountDirectory for InMemoryAccountDirectory {
    async fn lookup_account_by_email(
        &self,
        email: &str,
    ) -> Result<Option<AccountRecord>, DirectoryError> {
        Ok(self.lock().by_email.get(email).cloned())
    }

    async fn lookup_account_by_identity(
        &self,
        link: &FederatedIdentityLink,
    ) -> Result<Option<AccountRecord>, DirectoryError> {
        let accounts = self.lock();
        Ok(accounts
            .by_identity
            .get(link)
            .and_then(|email| accounts.by_email.get(email))
            .cloned())
    }

    async fn register_account(
        &self,
        account: &AccountRecord,
    ) -> Result<RegistrationOutcome, DirectoryError> {
        self.register_calls.fetch_add(1, Ordering::SeqCst);
        let mut accounts = self.lock();

        let identity_taken = account
            .federated_identity
            .as_ref()
            .is_some_and(|link| accounts.by_identity.contains_key(link));
        if identity_taken || accounts.by_email.contains_key(&account.email) {
            return Ok(RegistrationOutcome::AlreadyExists);
        }

        if let Some(link) = &account.federated_identity {
            accounts
                .by_identity
                .insert(link.clone(), account.email.clone());
        }
        accounts
            .by_email
            .insert(account.email.clone(), account.clone());
        Ok(RegistrationOutcome::Created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account(email: &str, link: Option<(&str, &str)>) -> AccountRecord {
        AccountRecord {
            email: email.to_string(),
            password_hash: None,
            name: None,
            surnames: None,
            roles: AccountRecord::default_roles(),
            locked: false,
            federated_identity: link.map(|(p, s)| FederatedIdentityLink {
                provider_name: p.to_string(),
                provider_subject_id: s.to_string(),
            }),
        }
    }

    #[tokio::test]
    async fn duplicate_email_is_already_exists() {
        let directory = InMemoryAccountDirectory::new();
        let first = directory
            .register_account(&account("a@example.com", None))
            .await
            .unwrap();
        let second = directory
            .register_account(&account("a@example.com", None))
            .await
            .unwrap();
        assert_eq!(first, RegistrationOutcome::Created);
        assert_eq!(second, RegistrationOutcome::AlreadyExists);
        assert_eq!(directory.len(), 1);
        assert_eq!(directory.register_calls(), 2);
    }

    #[tokio::test]
    async fn federated_identity_is_unique_across_emails() {
        let directory = InMemoryAccountDirectory::new();
        directory
            .register_account(&account("a@example.com", Some(("google", "sub-1"))))
            .await
            .unwrap();
        let outcome = directory
            .register_account(&account("other@example.com", Some(("google", "sub-1"))))
            .await
            .unwrap();
        assert_eq!(outcome, RegistrationOutcome::AlreadyExists);
        assert_eq!(
            directory.find_by_identity("google", "sub-1").unwrap().email,
            "a@example.com"
        );
    }

    #[tokio::test]
    async fn lookup_finds_seeded_account() {
        let directory =
            InMemoryAccountDirectory::new().with_account(account("a@example.com", None));
        assert!(
            directory
                .lookup_account_by_email("a@example.com")
                .await
                .unwrap()
                .is_some()
        );
        assert!(
            directory
                .lookup_account_by_email("b@example.com")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn identity_lookup_follows_the_link() {
        let directory = InMemoryAccountDirectory::new()
            .with_account(account("a@example.com", Some(("google", "sub-1"))))
            .with_account(account("b@example.com", None));
        let link = |subject: &str| FederatedIdentityLink {
            provider_name: "google".to_string(),
            provider_subject_id: subject.to_string(),
        };

        let linked = directory
            .lookup_account_by_identity(&link("sub-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(linked.email, "a@example.com");
        assert!(
            directory
                .lookup_account_by_identity(&link("sub-2"))
                .await
                .unwrap()
                .is_none()
        );
    }
}
