//! Per-principal shared secret cache.
//!
//! ```text
//! resolve(id) → cached and younger than TTL? → return it
//!             → otherwise fetch from SecretLookup → store {value, now} → return it
//! ```
//!
//! Concurrent misses for the same principal may each fetch. The result is
//! the same secret, so the duplicate write is harmless. Lookup failures are
//! returned as-is: no stale value is served and nothing is retried.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, instrument};

use super::player_client::{LookupError, SecretLookup};

/// Secrets older than this are refetched.
pub const DEFAULT_KEY_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone)]
pub struct SharedSecret {
    pub value: String,
    pub fetched_at: DateTime<Utc>,
}

impl SharedSecret {
    fn is_fresh(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        // a negative age (clock stepped back) counts as fresh
        now.signed_duration_since(self.fetched_at)
            .to_std()
            .map_or(true, |age| age < ttl)
    }
}

pub struct KeyCache {
    entries: DashMap<String, SharedSecret>,
    lookup: Arc<dyn SecretLookup>,
    ttl: Duration,
}

impl KeyCache {
    pub fn new(lookup: Arc<dyn SecretLookup>) -> Self {
        Self::with_ttl(lookup, DEFAULT_KEY_TTL)
    }

    pub fn with_ttl(lookup: Arc<dyn SecretLookup>, ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            lookup,
            ttl,
        }
    }

    pub async fn resolve(&self, principal: &str) -> Result<String, LookupError> {
        self.resolve_at(principal, Utc::now()).await
    }

    #[instrument(name = "resolve_secret", skip(self, now), fields(principal = %principal))]
    pub async fn resolve_at(
        &self,
        principal: &str,
        now: DateTime<Utc>,
    ) -> Result<String, LookupError> {
        // clone out so no shard lock is held across the fetch
        let cached = self.entries.get(principal).map(|entry| entry.value().clone());

        if let Some(entry) = cached {
            if entry.is_fresh(now, self.ttl) {
                debug!("shared secret cache hit");
                return Ok(entry.value);
            }
            debug!("cached shared secret is stale");
            self.entries.remove(principal);
        }

        let value = self.lookup.fetch_secret(principal).await?;
        self.entries.insert(
            principal.to_string(),
            SharedSecret {
                value: value.clone(),
                fetched_at: now,
            },
        );

        Ok(value)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
