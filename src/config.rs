use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::env;
use std::path::Path;

use crate::concierge::credentials::{DEFAULT_AUDIENCE, DEFAULT_KEY_ID};
use crate::concierge::{default_key_cache_ttl_secs, default_request_timeout_ms, Config};

/// Top-level settings file.
#[derive(Deserialize)]
pub struct Settings {
    pub log_level: String,
    pub concierge: Config,
}

/// Settings loader: a TOML file, or `CONCIERGE_*` environment variables.
pub struct ConfigLoader;

impl ConfigLoader {
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Settings> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("Invalid config file {}", path.display()))
    }

    /// Load configuration from environment variables with fallback defaults
    pub fn load() -> Result<Settings> {
        Self::load_with(|key| env::var(key).ok())
    }

    /// Same as [`load`](Self::load) with an explicit variable source.
    pub fn load_with<F>(var: F) -> Result<Settings>
    where
        F: Fn(&str) -> Option<String>,
    {
        let or = |key: &str, default: &str| var(key).unwrap_or_else(|| default.to_string());

        let player_url =
            var("CONCIERGE_PLAYER_URL").ok_or_else(|| anyhow!("CONCIERGE_PLAYER_URL is not set"))?;

        let request_timeout_ms = match var("CONCIERGE_REQUEST_TIMEOUT_MS") {
            Some(v) => v
                .parse()
                .map_err(|_| anyhow!("Invalid CONCIERGE_REQUEST_TIMEOUT_MS: {}", v))?,
            None => default_request_timeout_ms(),
        };
        let key_cache_ttl_secs = match var("CONCIERGE_KEY_CACHE_TTL_SECS") {
            Some(v) => v
                .parse()
                .map_err(|_| anyhow!("Invalid CONCIERGE_KEY_CACHE_TTL_SECS: {}", v))?,
            None => default_key_cache_ttl_secs(),
        };
        let player_timeout_ms = var("CONCIERGE_PLAYER_TIMEOUT_MS")
            .map(|v| {
                v.parse()
                    .map_err(|_| anyhow!("Invalid CONCIERGE_PLAYER_TIMEOUT_MS: {}", v))
            })
            .transpose()?;
        let expose_auth_trace = var("CONCIERGE_EXPOSE_AUTH_TRACE")
            .map(|v| v.to_lowercase() == "true")
            .unwrap_or(true);

        Ok(Settings {
            log_level: or("CONCIERGE_LOG_LEVEL", "info"),
            concierge: Config {
                address: or("CONCIERGE_ADDRESS", "0.0.0.0"),
                port: or("CONCIERGE_PORT", "9081"),
                context_path: or("CONCIERGE_CONTEXT_PATH", ""),
                registration_secret: var("CONCIERGE_REGISTRATION_SECRET"),
                query_secret: var("CONCIERGE_QUERY_SECRET"),
                player_url,
                jwt_key_path: or("CONCIERGE_JWT_KEY_PATH", "./keys/signing_key.pem"),
                jwt_key_id: or("CONCIERGE_JWT_KEY_ID", DEFAULT_KEY_ID),
                jwt_audience: or("CONCIERGE_JWT_AUDIENCE", DEFAULT_AUDIENCE),
                request_timeout_ms,
                key_cache_ttl_secs,
                player_timeout_ms,
                expose_auth_trace,
            },
        })
    }

    /// Print configuration help
    pub fn print_help() {
        println!("Concierge Configuration - Environment Variables");
        println!("===============================================");
        println!();
        println!("Core Configuration:");
        println!("  CONCIERGE_ADDRESS               Bind address (default: 0.0.0.0)");
        println!("  CONCIERGE_PORT                  Server port (default: 9081)");
        println!("  CONCIERGE_LOG_LEVEL             Log level (default: info)");
        println!("  CONCIERGE_CONTEXT_PATH          Path prefix stripped before routing (default: none)");
        println!();
        println!("Shared Secrets:");
        println!("  CONCIERGE_REGISTRATION_SECRET   Secret for /registerRoom requests");
        println!("  CONCIERGE_QUERY_SECRET          Secret for all other requests");
        println!();
        println!("Player Service:");
        println!("  CONCIERGE_PLAYER_URL            Account endpoint base URL (required)");
        println!("  CONCIERGE_PLAYER_TIMEOUT_MS     Lookup timeout (default: none)");
        println!("  CONCIERGE_JWT_KEY_PATH          PEM RSA private key (default: ./keys/signing_key.pem)");
        println!("  CONCIERGE_JWT_KEY_ID            Token kid header (default: playerssl)");
        println!("  CONCIERGE_JWT_AUDIENCE          Token audience (default: client)");
        println!("  CONCIERGE_KEY_CACHE_TTL_SECS    Shared secret cache lifetime (default: 86400)");
        println!();
        println!("Request Validation:");
        println!("  CONCIERGE_REQUEST_TIMEOUT_MS    Stamp validity window (default: 5000)");
        println!("  CONCIERGE_EXPOSE_AUTH_TRACE     Return the auth trace on 403 (true/false, default: true)");
        println!();
        println!("Example:");
        println!("  export CONCIERGE_PLAYER_URL=\"https://player:9443/players/v1/accounts\"");
        println!("  export CONCIERGE_REGISTRATION_SECRET=\"change-me\"");
        println!("  export CONCIERGE_QUERY_SECRET=\"change-me-too\"");
    }

    /// Validate loaded configuration
    pub fn validate(settings: &Settings) -> Result<()> {
        let config = &settings.concierge;

        // Validate port is a valid number
        config
            .port
            .parse::<u16>()
            .map_err(|_| anyhow!("Invalid port number: {}", config.port))?;

        // Validate log level
        match settings.log_level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => {
                return Err(anyhow!(
                    "Invalid log level: {}. Must be one of: trace, debug, info, warn, error",
                    settings.log_level
                ))
            }
        }

        url::Url::parse(&config.player_url)
            .map_err(|e| anyhow!("Invalid player URL {}: {}", config.player_url, e))?;

        if config.request_timeout_ms == 0 {
            return Err(anyhow!("Request timeout must be greater than zero"));
        }
        if config.key_cache_ttl_secs == 0 {
            return Err(anyhow!("Key cache TTL must be greater than zero"));
        }
        if config.player_timeout_ms == Some(0) {
            return Err(anyhow!("Player timeout must be greater than zero when set"));
        }

        if config.registration_secret.is_none() && config.query_secret.is_none() {
            return Err(anyhow!(
                "At least one of registration_secret or query_secret must be configured"
            ));
        }

        if !config.context_path.is_empty()
            && (!config.context_path.starts_with('/') || config.context_path.ends_with('/'))
        {
            return Err(anyhow!(
                "Context path must start with '/' and not end with one: {}",
                config.context_path
            ));
        }

        Ok(())
    }
}
