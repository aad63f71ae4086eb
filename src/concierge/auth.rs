use base64::{engine::general_purpose, Engine as _};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::debug;
use url::form_urlencoded;

type HmacSha256 = Hmac<Sha256>;

// Query parameters understood by the gateway
pub const CREDENTIAL_PARAM: &str = "apikey";
pub const SERVICE_ID_PARAM: &str = "serviceID";
pub const STAMP_PARAM: &str = "stamp";
pub const ID_PARAM: &str = "id";

/// Marker located in the raw query string. Everything before its last
/// occurrence is the signed payload.
pub const CREDENTIAL_MARKER: &str = "&apikey=";

/// Reasons a request is denied. Every variant resolves to a 403.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Request has no query string")]
    MissingQuery,
    #[error("Request is missing the apikey parameter")]
    MissingCredentialParam,
    #[error("Signature verification failed")]
    SignatureMismatch,
    #[error("No shared secret is available for this request")]
    UnresolvableSecret,
    #[error("Malformed stamp parameter: {0}")]
    MalformedTimestamp(String),
    #[error("Request stamp has expired")]
    Expired,
    #[error("Signature has already been used")]
    Replayed,
    #[error("Shared secret lookup failed: {0}")]
    UpstreamLookupFailure(String),
}

impl AuthError {
    pub fn code(&self) -> &'static str {
        match self {
            AuthError::MissingQuery => "MissingQuery",
            AuthError::MissingCredentialParam => "MissingCredentialParam",
            AuthError::SignatureMismatch => "SignatureMismatch",
            AuthError::UnresolvableSecret => "UnresolvableSecret",
            AuthError::MalformedTimestamp(_) => "MalformedTimestamp",
            AuthError::Expired => "Expired",
            AuthError::Replayed => "Replayed",
            AuthError::UpstreamLookupFailure(_) => "UpstreamLookupFailure",
        }
    }
}

/// Read-only view over a raw (still percent-encoded) query string.
#[derive(Debug, Clone, Copy)]
pub struct QueryParams<'a> {
    raw: &'a str,
}

impl<'a> QueryParams<'a> {
    pub fn new(raw: &'a str) -> Self {
        Self { raw }
    }

    /// First value for `name`, form-urlencoded decoded.
    pub fn get(&self, name: &str) -> Option<String> {
        form_urlencoded::parse(self.raw.as_bytes())
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.into_owned())
    }

    /// Byte offset of the last credential marker, if any.
    pub fn credential_offset(&self) -> Option<usize> {
        self.raw.rfind(CREDENTIAL_MARKER)
    }

    /// The signed prefix: the raw query truncated at `offset`.
    pub fn signed_payload(&self, offset: usize) -> &'a str {
        &self.raw[..offset]
    }

    /// Decoded value of the credential parameter that starts at `offset`.
    pub fn credential_at(&self, offset: usize) -> Option<String> {
        // skip the leading '&' so the first pair parsed is the credential itself
        let tail = self.raw.get(offset + 1..)?;
        form_urlencoded::parse(tail.as_bytes())
            .next()
            .filter(|(key, _)| key == CREDENTIAL_PARAM)
            .map(|(_, value)| value.into_owned())
    }
}

/// HMAC-SHA256 of `payload` keyed with `secret`, standard base64.
pub fn sign(payload: &str, secret: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(payload.as_bytes());
    general_purpose::STANDARD.encode(mac.finalize().into_bytes())
}

/// Verifies the credential found at `offset` against the signed prefix.
///
/// Returns the supplied signature on success so it can be recorded for
/// replay detection. A missing secret is a verification failure.
pub fn verify_signature(
    query: &QueryParams<'_>,
    offset: usize,
    secret: Option<&str>,
) -> Result<String, AuthError> {
    let secret = secret.ok_or(AuthError::UnresolvableSecret)?;
    let supplied = query.credential_at(offset).unwrap_or_default();

    let payload = query.signed_payload(offset);
    let expected = sign(payload, secret);

    debug!("verifying signature over {} byte payload", payload.len());

    // constant-time comparison
    let signatures_match: bool = expected.as_bytes().ct_eq(supplied.as_bytes()).into();
    if !signatures_match {
        return Err(AuthError::SignatureMismatch);
    }

    Ok(supplied)
}

/// Locates the last credential marker and verifies it.
pub fn verify(query: &str, secret: Option<&str>) -> Result<String, AuthError> {
    let params = QueryParams::new(query);
    let offset = params
        .credential_offset()
        .ok_or(AuthError::MissingCredentialParam)?;
    verify_signature(&params, offset, secret)
}

/// Appends a signed credential to `payload`. Used by callers minting
/// requests against a gateway, and by the tests.
pub fn signed_query(payload: &str, secret: &str) -> String {
    let signature = sign(payload, secret);
    let encoded: String = form_urlencoded::byte_serialize(signature.as_bytes()).collect();
    format!("{}{}{}", payload, CREDENTIAL_MARKER, encoded)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAYLOAD: &str = "id=alice&serviceID=svcA&stamp=1700000000000";

    #[test]
    fn test_known_signature_vector() {
        assert_eq!(
            sign(PAYLOAD, "reg-secret"),
            "Mou5le0gfZqdJI5re4oMWGn3GOfJi3YPk/LmwOaBRyY="
        );
    }

    #[test]
    fn test_round_trip() {
        let query = signed_query(PAYLOAD, "s3cr3t");
        let supplied = verify(&query, Some("s3cr3t")).unwrap();
        assert_eq!(supplied, sign(PAYLOAD, "s3cr3t"));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let query = signed_query(PAYLOAD, "s3cr3t");
        assert_eq!(
            verify(&query, Some("other")),
            Err(AuthError::SignatureMismatch)
        );
    }

    #[test]
    fn test_missing_secret_is_unresolvable() {
        let query = signed_query(PAYLOAD, "s3cr3t");
        assert_eq!(verify(&query, None), Err(AuthError::UnresolvableSecret));
    }

    #[test]
    fn test_missing_marker() {
        assert_eq!(
            verify(PAYLOAD, Some("s3cr3t")),
            Err(AuthError::MissingCredentialParam)
        );
    }

    #[test]
    fn test_leading_apikey_is_not_a_marker() {
        let params = QueryParams::new("apikey=abc&stamp=1");
        assert_eq!(params.credential_offset(), None);
    }

    #[test]
    fn test_last_marker_wins() {
        let inner = signed_query("id=bob", "k");
        let outer = signed_query(&inner, "k");
        let params = QueryParams::new(&outer);
        let offset = params.credential_offset().unwrap();
        assert_eq!(params.signed_payload(offset), inner);
        assert!(verify(&outer, Some("k")).is_ok());
    }

    #[test]
    fn test_credential_value_is_form_decoded() {
        let params = QueryParams::new("a=1&apikey=ab%2Bc%2F%3D&b=2");
        let offset = params.credential_offset().unwrap();
        assert_eq!(params.credential_at(offset).as_deref(), Some("ab+c/="));
    }

    #[test]
    fn test_get_returns_first_value() {
        let params = QueryParams::new("id=first&id=second&serviceID=svc%20A");
        assert_eq!(params.get("id").as_deref(), Some("first"));
        assert_eq!(params.get("serviceID").as_deref(), Some("svc A"));
        assert_eq!(params.get("stamp"), None);
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(AuthError::Replayed.code(), "Replayed");
        assert_eq!(
            AuthError::MalformedTimestamp("x".to_string()).code(),
            "MalformedTimestamp"
        );
    }
}
