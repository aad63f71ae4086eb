use std::path::PathBuf;

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, info};

pub const DEFAULT_KEY_ID: &str = "playerssl";
pub const DEFAULT_AUDIENCE: &str = "client";

#[derive(Error, Debug)]
pub enum CredentialError {
    #[error("Failed to read signing key from {path}: {source}")]
    KeyStore {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid signing key: {0}")]
    InvalidKey(#[source] jsonwebtoken::errors::Error),
    #[error("Failed to encode token: {0}")]
    Encode(#[source] jsonwebtoken::errors::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerClaims {
    pub sub: String,
    pub aud: String,
    pub iat: i64,
    pub exp: i64,
}

/// Mints the short-lived RS256 tokens the gateway presents to the player
/// service.
///
/// The private key is read from a PEM file on first use. Concurrent first
/// callers wait on the same load; a failed load is not remembered, so the
/// next call tries again.
pub struct CredentialIssuer {
    key_path: PathBuf,
    key_id: String,
    audience: String,
    signing_key: OnceCell<EncodingKey>,
}

impl CredentialIssuer {
    pub fn new(
        key_path: impl Into<PathBuf>,
        key_id: impl Into<String>,
        audience: impl Into<String>,
    ) -> Self {
        Self {
            key_path: key_path.into(),
            key_id: key_id.into(),
            audience: audience.into(),
            signing_key: OnceCell::new(),
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.signing_key.initialized()
    }

    pub async fn issue(&self, principal: &str) -> Result<String, CredentialError> {
        self.issue_at(principal, Utc::now()).await
    }

    /// Builds a token for `principal` as of `now`.
    ///
    /// `iat` is backdated a day so verifiers with a skewed clock still accept
    /// it; `exp` is a day ahead.
    pub async fn issue_at(
        &self,
        principal: &str,
        now: DateTime<Utc>,
    ) -> Result<String, CredentialError> {
        let key = self.signing_key().await?;

        let claims = PlayerClaims {
            sub: principal.to_string(),
            aud: self.audience.clone(),
            iat: (now - Duration::hours(24)).timestamp(),
            exp: (now + Duration::hours(24)).timestamp(),
        };

        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(self.key_id.clone());

        debug!("issuing player token for {}", principal);
        jsonwebtoken::encode(&header, &claims, key).map_err(CredentialError::Encode)
    }

    async fn signing_key(&self) -> Result<&EncodingKey, CredentialError> {
        self.signing_key
            .get_or_try_init(|| async {
                info!("Loading signing key from {}", self.key_path.display());
                let pem = tokio::fs::read(&self.key_path).await.map_err(|source| {
                    CredentialError::KeyStore {
                        path: self.key_path.display().to_string(),
                        source,
                    }
                })?;
                EncodingKey::from_rsa_pem(&pem).map_err(CredentialError::InvalidKey)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{DecodingKey, Validation};
    use std::io::Write;
    use std::sync::Arc;

    const PRIVATE_KEY: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures/signing_key.pem");
    const PUBLIC_KEY: &str = include_str!("../../tests/fixtures/signing_key.pub.pem");

    fn issuer() -> CredentialIssuer {
        CredentialIssuer::new(PRIVATE_KEY, DEFAULT_KEY_ID, DEFAULT_AUDIENCE)
    }

    #[tokio::test]
    async fn test_issued_token_verifies() {
        let token = issuer().issue("alice").await.unwrap();

        let header = jsonwebtoken::decode_header(&token).unwrap();
        assert_eq!(header.alg, Algorithm::RS256);
        assert_eq!(header.kid.as_deref(), Some("playerssl"));

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_audience(&["client"]);
        let decoding_key = DecodingKey::from_rsa_pem(PUBLIC_KEY.as_bytes()).unwrap();
        let data = jsonwebtoken::decode::<PlayerClaims>(&token, &decoding_key, &validation).unwrap();
        assert_eq!(data.claims.sub, "alice");
        assert_eq!(data.claims.aud, "client");
    }

    #[tokio::test]
    async fn test_claim_window_spans_two_days() {
        let now = Utc::now();
        let token = issuer().issue_at("bob", now).await.unwrap();

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_audience(&["client"]);
        let decoding_key = DecodingKey::from_rsa_pem(PUBLIC_KEY.as_bytes()).unwrap();
        let claims = jsonwebtoken::decode::<PlayerClaims>(&token, &decoding_key, &validation)
            .unwrap()
            .claims;

        assert_eq!(claims.iat, now.timestamp() - 86_400);
        assert_eq!(claims.exp, now.timestamp() + 86_400);
    }

    #[tokio::test]
    async fn test_missing_key_store_is_retried() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("key.pem");
        let issuer = CredentialIssuer::new(&path, DEFAULT_KEY_ID, DEFAULT_AUDIENCE);

        let result = issuer.issue("alice").await;
        assert!(matches!(result, Err(CredentialError::KeyStore { .. })));
        assert!(!issuer.is_loaded());

        std::fs::copy(PRIVATE_KEY, &path).unwrap();
        assert!(issuer.issue("alice").await.is_ok());
        assert!(issuer.is_loaded());
    }

    #[tokio::test]
    async fn test_invalid_pem_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"not a key").unwrap();
        let issuer = CredentialIssuer::new(file.path(), DEFAULT_KEY_ID, DEFAULT_AUDIENCE);

        let result = issuer.issue("alice").await;
        assert!(matches!(result, Err(CredentialError::InvalidKey(_))));
    }

    #[tokio::test]
    async fn test_concurrent_first_use_loads_once() {
        let issuer = Arc::new(issuer());
        let tasks: Vec<_> = (0..8)
            .map(|i| {
                let issuer = Arc::clone(&issuer);
                tokio::spawn(async move { issuer.issue(&format!("player-{}", i)).await })
            })
            .collect();

        for task in tasks {
            assert!(task.await.unwrap().is_ok());
        }
        assert!(issuer.is_loaded());
    }
}
