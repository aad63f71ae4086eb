use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, instrument, warn};

use super::auth::{verify_signature, AuthError, QueryParams, ID_PARAM, STAMP_PARAM};
use super::key_cache::KeyCache;
use super::replay::ReplayGuard;

/// Requests to this path are signed with the registration secret.
pub const REGISTRATION_PATH: &str = "/registerRoom";

/// Static secrets, chosen by request path.
#[derive(Clone, Default)]
pub struct SecretPolicy {
    pub registration_secret: Option<String>,
    pub query_secret: Option<String>,
}

impl SecretPolicy {
    pub fn for_path(&self, path: &str) -> Option<&str> {
        if path == REGISTRATION_PATH {
            self.registration_secret.as_deref()
        } else {
            self.query_secret.as_deref()
        }
    }
}

/// Time source consulted by the time-sensitive steps.
pub type Clock = dyn Fn() -> DateTime<Utc> + Send + Sync;

/// Steps of the validation pipeline, in order. Any step can deny.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationState {
    HasQuery,
    HasCredentialParam,
    SignatureValid,
    NotExpired,
    NotReplayed,
    Passed,
}

/// Scratch state for a single validation run.
#[derive(Debug, Default)]
pub struct ValidationContext {
    pub credential_offset: Option<usize>,
    pub signature: Option<String>,
    pub stamp: Option<i64>,
    pub principal: Option<String>,
    trace: Vec<String>,
}

impl ValidationContext {
    pub fn log(&mut self, line: impl Into<String>) {
        self.trace.push(line.into());
    }

    pub fn trace_lines(&self) -> &[String] {
        &self.trace
    }

    pub fn trace(&self) -> String {
        let mut out = self.trace.join("\n");
        out.push('\n');
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    Allowed { principal: Option<String> },
    Denied { reason: AuthError, trace: String },
}

impl AuthOutcome {
    pub fn is_allowed(&self) -> bool {
        matches!(self, AuthOutcome::Allowed { .. })
    }
}

pub struct RequestValidator {
    policy: SecretPolicy,
    key_cache: Arc<KeyCache>,
    replay: Arc<ReplayGuard>,
    timeout_ms: i64,
}

impl RequestValidator {
    pub fn new(
        policy: SecretPolicy,
        key_cache: Arc<KeyCache>,
        replay: Arc<ReplayGuard>,
        timeout: Duration,
    ) -> Self {
        Self {
            policy,
            key_cache,
            replay,
            timeout_ms: i64::try_from(timeout.as_millis()).unwrap_or(i64::MAX),
        }
    }

    /// Runs the full pipeline against the wall clock.
    ///
    /// The clock is read again at every time-sensitive step, so a slow
    /// secret lookup counts against the request's age.
    pub async fn validate(&self, path: &str, query: Option<&str>) -> AuthOutcome {
        self.run(path, query, &Utc::now).await
    }

    /// Runs the full pipeline with time frozen at `now`.
    pub async fn validate_at(
        &self,
        path: &str,
        query: Option<&str>,
        now: DateTime<Utc>,
    ) -> AuthOutcome {
        self.run(path, query, &move || now).await
    }

    #[instrument(name = "validate_request", skip(self, query, clock), fields(path = %path))]
    async fn run(&self, path: &str, query: Option<&str>, clock: &Clock) -> AuthOutcome {
        let mut ctx = ValidationContext::default();
        if path == REGISTRATION_PATH {
            ctx.log("AUTH: room registration request");
        } else {
            ctx.log("AUTH: concierge query request");
        }

        let mut state = ValidationState::HasQuery;
        while state != ValidationState::Passed {
            match self.step(state, path, query, &mut ctx, clock).await {
                Ok(next) => state = next,
                Err(reason) => {
                    warn!("Authentication denied at {:?}: {}", state, reason);
                    ctx.log(format!("AUTH: access denied ({})", reason.code()));
                    return AuthOutcome::Denied {
                        reason,
                        trace: ctx.trace(),
                    };
                }
            }
        }

        info!(
            "Authenticated request for {}",
            ctx.principal.as_deref().unwrap_or("<no id>")
        );
        AuthOutcome::Allowed {
            principal: ctx.principal,
        }
    }

    /// Evaluates one state and returns the next one.
    pub async fn step(
        &self,
        state: ValidationState,
        path: &str,
        query: Option<&str>,
        ctx: &mut ValidationContext,
        clock: &Clock,
    ) -> Result<ValidationState, AuthError> {
        debug!("validation step {:?}", state);

        match state {
            ValidationState::HasQuery => {
                ctx.log(format!("AUTH: query string present? {}", query.is_some()));
                parse_query(query)?;
                Ok(ValidationState::HasCredentialParam)
            }
            ValidationState::HasCredentialParam => {
                let offset = parse_query(query)?.credential_offset();
                ctx.log(format!("AUTH: apikey present? {}", offset.is_some()));
                ctx.credential_offset = Some(offset.ok_or(AuthError::MissingCredentialParam)?);
                Ok(ValidationState::SignatureValid)
            }
            ValidationState::SignatureValid => {
                let params = parse_query(query)?;
                let offset = ctx
                    .credential_offset
                    .ok_or(AuthError::MissingCredentialParam)?;

                let principal = params.get(ID_PARAM);
                ctx.log(format!("AUTH: id param present? {}", principal.is_some()));

                let secret = match &principal {
                    Some(id) => match self.key_cache.resolve_at(id, clock()).await {
                        Ok(secret) => {
                            ctx.log("AUTH: shared secret resolved for id");
                            Some(secret)
                        }
                        Err(e) => {
                            error!("Unable to obtain shared secret for {}: {}", id, e);
                            ctx.log("AUTH: unable to obtain shared secret for id");
                            return Err(AuthError::UpstreamLookupFailure(e.to_string()));
                        }
                    },
                    None => self.policy.for_path(path).map(str::to_string),
                };

                let verified = verify_signature(&params, offset, secret.as_deref());
                ctx.log(format!("AUTH: apikey valid? {}", verified.is_ok()));

                ctx.signature = Some(verified?);
                ctx.principal = principal;
                Ok(ValidationState::NotExpired)
            }
            ValidationState::NotExpired => {
                let raw = parse_query(query)?
                    .get(STAMP_PARAM)
                    .ok_or_else(|| AuthError::MalformedTimestamp("missing".to_string()))?;
                let stamp: i64 = raw.parse().map_err(|_| {
                    ctx.log("AUTH: stamp is not a number");
                    AuthError::MalformedTimestamp(raw.clone())
                })?;

                let now = clock().timestamp_millis();
                let expired = now.saturating_sub(stamp) > self.timeout_ms;
                ctx.log(format!("AUTH: stamp expired? {}", expired));
                ctx.stamp = Some(stamp);

                if expired {
                    return Err(AuthError::Expired);
                }
                Ok(ValidationState::NotReplayed)
            }
            ValidationState::NotReplayed => {
                let signature = ctx
                    .signature
                    .as_deref()
                    .ok_or(AuthError::SignatureMismatch)?;
                let stamp = ctx
                    .stamp
                    .ok_or_else(|| AuthError::MalformedTimestamp("missing".to_string()))?;

                let now = clock().timestamp_millis();
                let admitted = self.replay.admit_at(signature, stamp, now);
                ctx.log(format!("AUTH: apikey replayed? {}", !admitted));

                if !admitted {
                    return Err(AuthError::Replayed);
                }
                Ok(ValidationState::Passed)
            }
            ValidationState::Passed => Ok(ValidationState::Passed),
        }
    }
}

fn parse_query(query: Option<&str>) -> Result<QueryParams<'_>, AuthError> {
    query.map(QueryParams::new).ok_or(AuthError::MissingQuery)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concierge::auth::signed_query;
    use crate::concierge::player_client::{LookupError, SecretLookup};
    use async_trait::async_trait;

    struct NoLookup;

    #[async_trait]
    impl SecretLookup for NoLookup {
        async fn fetch_secret(&self, _principal: &str) -> Result<String, LookupError> {
            Err(LookupError::MissingApiKey)
        }
    }

    fn validator() -> RequestValidator {
        RequestValidator::new(
            SecretPolicy {
                registration_secret: Some("reg".to_string()),
                query_secret: Some("query".to_string()),
            },
            Arc::new(KeyCache::new(Arc::new(NoLookup))),
            Arc::new(ReplayGuard::default()),
            Duration::from_millis(5_000),
        )
    }

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp_millis(1_700_000_000_000).unwrap()
    }

    #[test]
    fn test_secret_policy_selects_by_path() {
        let policy = SecretPolicy {
            registration_secret: Some("reg".to_string()),
            query_secret: None,
        };
        assert_eq!(policy.for_path("/registerRoom"), Some("reg"));
        assert_eq!(policy.for_path("/rooms/abc"), None);
    }

    #[tokio::test]
    async fn test_has_query_step() {
        let v = validator();
        let mut ctx = ValidationContext::default();
        let next = v
            .step(ValidationState::HasQuery, "/", None, &mut ctx, &now)
            .await;
        assert_eq!(next, Err(AuthError::MissingQuery));
        assert_eq!(ctx.trace_lines().len(), 1);
    }

    #[tokio::test]
    async fn test_credential_param_step_records_offset() {
        let v = validator();
        let mut ctx = ValidationContext::default();
        let next = v
            .step(
                ValidationState::HasCredentialParam,
                "/",
                Some("stamp=1&apikey=x"),
                &mut ctx,
                &now,
            )
            .await;
        assert_eq!(next, Ok(ValidationState::SignatureValid));
        assert_eq!(ctx.credential_offset, Some(7));
    }

    #[tokio::test]
    async fn test_expiry_step_rejects_non_numeric_stamp() {
        let v = validator();
        let mut ctx = ValidationContext::default();
        let next = v
            .step(
                ValidationState::NotExpired,
                "/",
                Some("stamp=yesterday&apikey=x"),
                &mut ctx,
                &now,
            )
            .await;
        assert_eq!(
            next,
            Err(AuthError::MalformedTimestamp("yesterday".to_string()))
        );
    }

    #[tokio::test]
    async fn test_static_query_secret_allows_without_id() {
        let v = validator();
        let payload = format!("serviceID=svc&stamp={}", now().timestamp_millis());
        let query = signed_query(&payload, "query");

        let outcome = v.validate_at("/rooms/abc", Some(&query), now()).await;
        assert_eq!(outcome, AuthOutcome::Allowed { principal: None });
    }

    #[tokio::test]
    async fn test_registration_path_rejects_query_secret() {
        let v = validator();
        let payload = format!("serviceID=svc&stamp={}", now().timestamp_millis());
        let query = signed_query(&payload, "query");

        let outcome = v.validate_at("/registerRoom", Some(&query), now()).await;
        assert!(matches!(
            outcome,
            AuthOutcome::Denied {
                reason: AuthError::SignatureMismatch,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_failed_lookup_denies() {
        let v = validator();
        let payload = format!("id=alice&stamp={}", now().timestamp_millis());
        let query = signed_query(&payload, "query");

        match v.validate_at("/rooms/abc", Some(&query), now()).await {
            AuthOutcome::Denied { reason, trace } => {
                assert_eq!(reason.code(), "UpstreamLookupFailure");
                assert!(trace.contains("unable to obtain shared secret"));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }
}
