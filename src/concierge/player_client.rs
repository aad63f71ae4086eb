use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, error, instrument};
use url::Url;

use super::credentials::{CredentialError, CredentialIssuer};

#[derive(Error, Debug)]
pub enum LookupError {
    #[error("Failed to mint player credential: {0}")]
    Credential(#[from] CredentialError),
    #[error("Invalid player service URL: {0}")]
    InvalidUrl(String),
    #[error("Player service request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("Player service returned status {0}")]
    Status(u16),
    #[error("Player service response has no apiKey field")]
    MissingApiKey,
}

/// Source of per-principal shared secrets.
#[async_trait]
pub trait SecretLookup: Send + Sync {
    async fn fetch_secret(&self, principal: &str) -> Result<String, LookupError>;
}

#[derive(Deserialize)]
struct PlayerRecord {
    #[serde(rename = "apiKey")]
    api_key: Option<String>,
}

/// Client for the player service's account endpoint.
///
/// Issues `GET {player_url}/{principal}?jwt={token}` and reads the `apiKey`
/// field of the JSON reply. No retries; every failure is final.
pub struct PlayerClient {
    base: Url,
    client: reqwest::Client,
    issuer: Arc<CredentialIssuer>,
}

impl PlayerClient {
    /// `timeout` bounds the whole request; `None` keeps the transport default.
    pub fn new(
        player_url: &str,
        issuer: Arc<CredentialIssuer>,
        timeout: Option<Duration>,
    ) -> Result<Self, LookupError> {
        let base = Url::parse(player_url)
            .map_err(|e| LookupError::InvalidUrl(format!("{}: {}", player_url, e)))?;
        if base.cannot_be_a_base() {
            return Err(LookupError::InvalidUrl(player_url.to_string()));
        }

        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }

        Ok(Self {
            base,
            client: builder.build()?,
            issuer,
        })
    }

    fn secret_url(&self, principal: &str, jwt: &str) -> Result<Url, LookupError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| LookupError::InvalidUrl(self.base.to_string()))?
            .pop_if_empty()
            .push(principal);
        url.query_pairs_mut().append_pair("jwt", jwt);
        Ok(url)
    }
}

#[async_trait]
impl SecretLookup for PlayerClient {
    #[instrument(name = "fetch_secret", skip(self), fields(principal = %principal))]
    async fn fetch_secret(&self, principal: &str) -> Result<String, LookupError> {
        let jwt = self.issuer.issue(principal).await?;
        let url = self.secret_url(principal, &jwt)?;

        debug!("requesting shared secret from player service");
        let response = self.client.get(url).send().await?;

        let status = response.status();
        if !status.is_success() {
            error!("Player service answered {} for secret lookup", status);
            return Err(LookupError::Status(status.as_u16()));
        }

        let record: PlayerRecord = response.json().await?;
        record.api_key.ok_or(LookupError::MissingApiKey)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concierge::credentials::{DEFAULT_AUDIENCE, DEFAULT_KEY_ID};

    fn client(base: &str) -> PlayerClient {
        let issuer = Arc::new(CredentialIssuer::new(
            "unused.pem",
            DEFAULT_KEY_ID,
            DEFAULT_AUDIENCE,
        ));
        PlayerClient::new(base, issuer, None).unwrap()
    }

    #[test]
    fn test_secret_url_appends_principal_segment() {
        let client = client("https://player:9443/players/v1/accounts");
        let url = client.secret_url("alice", "a.b.c").unwrap();
        assert_eq!(
            url.as_str(),
            "https://player:9443/players/v1/accounts/alice?jwt=a.b.c"
        );
    }

    #[test]
    fn test_secret_url_handles_trailing_slash_and_escaping() {
        let client = client("http://localhost:9080/accounts/");
        let url = client.secret_url("github:12/34", "tok").unwrap();
        assert_eq!(
            url.as_str(),
            "http://localhost:9080/accounts/github:12%2F34?jwt=tok"
        );
    }

    #[test]
    fn test_invalid_base_url_rejected() {
        let issuer = Arc::new(CredentialIssuer::new(
            "unused.pem",
            DEFAULT_KEY_ID,
            DEFAULT_AUDIENCE,
        ));
        assert!(matches!(
            PlayerClient::new("not a url", issuer.clone(), None),
            Err(LookupError::InvalidUrl(_))
        ));
        assert!(matches!(
            PlayerClient::new("mailto:ops@example.com", issuer, None),
            Err(LookupError::InvalidUrl(_))
        ));
    }

    #[tokio::test]
    async fn test_unloadable_key_is_lookup_failure() {
        let client = client("http://127.0.0.1:9/accounts");
        let result = client.fetch_secret("alice").await;
        assert!(matches!(result, Err(LookupError::Credential(_))));
    }
}
