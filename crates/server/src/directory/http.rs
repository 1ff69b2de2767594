use super::{AccountDirectory, AccountRecord, FederatedIdentityLink, RegistrationOutcome};
use crate::error::DirectoryError;
use async_trait::async_trait;
use reqwest::StatusCode;
use url::Url;

const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Account Directory reached over HTTP.
///
/// - `GET  {base}/accounts/by-email/{email}` → 200 with the record, 404 if absent
/// - `GET  {base}/accounts/by-identity/{provider}/{subject}` → same, keyed by
///   federated identity
/// - `POST {base}/accounts` → 201 on creation, 409 if the email or the
///   federated identity is already registered
#[derive(Clone, Debug)]
pub struct HttpAccountDirectory {
    base_url: Url,
    http: reqwest::Client,
}

impl HttpAccountDirectory {
    /// The client should carry the configured request timeout; the directory
    /// call inherits it.
    pub fn new(base_url: &str, http: reqwest::Client) -> Result<Self, DirectoryError> {
        let base_url =
            Url::parse(base_url).map_err(|e| DirectoryError::InvalidUrl(e.to_string()))?;
        if base_url.cannot_be_a_base() {
            return Err(DirectoryError::InvalidUrl(base_url.to_string()));
        }
        Ok(Self { base_url, http })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, DirectoryError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| DirectoryError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

fn transport_error(e: reqwest::Error) -> DirectoryError {
    if e.is_decode() {
        DirectoryError::Decode(e.to_string())
    } else {
        DirectoryError::Unreachable(e.to_string())
    }
}

async fn status_error(response: reqwest::Response, operation: &str) -> DirectoryError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    DirectoryError::Status {
        status,
        context: format!("{operation}: {body}"),
    }
}

impl HttpAccountDirectory {
    async fn fetch_account(
        &self,
        segments: &[&str],
    ) -> Result<Option<AccountRecord>, DirectoryError> {
        let url = self.endpoint(segments)?;
        let response = self
            .http
            .get(url)
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .send()
            .await
            .map_err(transport_error)?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => response
                .json::<AccountRecord>()
                .await
                .map(Some)
                .map_err(|e| DirectoryError::Decode(e.to_string())),
            _ => Err(status_error(response, "lookup").await),
        }
    }
}

#[async_trait]
impl AccountDirectory for HttpAccountDirectory {
    #[tracing::instrument(skip(self))]
    async fn lookup_account_by_email(
        &self,
        email: &str,
    ) -> Result<Option<AccountRecord>, DirectoryError> {
        self.fetch_account(&["accounts", "by-email", email]).await
    }

    #[tracing::instrument(skip(self))]
    async fn lookup_account_by_identity(
        &self,
        link: &FederatedIdentityLink,
    ) -> Result<Option<AccountRecord>, DirectoryError> {
        self.fetch_account(&[
            "accounts",
            "by-identity",
            &link.provider_name,
            &link.provider_subject_id,
        ])
        .await
    }

    #[tracing::instrument(skip(self, account), fields(email = %account.email))]
    async fn register_account(
        &self,
        account: &AccountRecord,
    ) -> Result<RegistrationOutcome, DirectoryError> {
        let url = self.endpoint(&["accounts"])?;
        let response = self
            .http
            .post(url)
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .json(account)
            .send()
            .await
            .map_err(transport_error)?;

        match response.status() {
            StatusCode::CONFLICT => Ok(RegistrationOutcome::AlreadyExists),
            s if s.is_success() => Ok(RegistrationOutcome::Created),
            _ => Err(status_error(response, "register").await),
        }
    }
}
