pub mod auth;
pub mod auth_middleware;
pub mod credentials;
pub mod key_cache;
pub mod player_client;
pub mod replay;
pub mod validator;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use axum::{Extension, Json, Router};
use serde::Deserialize;
use tokio::signal;
use tower_http::trace::TraceLayer;
use tracing::info;

use auth_middleware::{AuthLayer, AuthenticatedPlayer, FilterOptions};
use credentials::{CredentialIssuer, DEFAULT_AUDIENCE, DEFAULT_KEY_ID};
use key_cache::KeyCache;
use player_client::PlayerClient;
use replay::ReplayGuard;
use validator::{RequestValidator, SecretPolicy};

/// Gateway settings. Not `Debug`: it holds the shared secrets.
#[derive(Deserialize, Clone)]
pub struct Config {
    pub address: String,
    pub port: String,
    #[serde(default)]
    pub context_path: String,
    pub registration_secret: Option<String>,
    pub query_secret: Option<String>,
    /// Base URL of the player service account endpoint.
    pub player_url: String,
    pub jwt_key_path: String,
    #[serde(default = "default_key_id")]
    pub jwt_key_id: String,
    #[serde(default = "default_audience")]
    pub jwt_audience: String,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_key_cache_ttl_secs")]
    pub key_cache_ttl_secs: u64,
    #[serde(default)]
    pub player_timeout_ms: Option<u64>,
    #[serde(default = "default_expose_auth_trace")]
    pub expose_auth_trace: bool,
}

fn default_key_id() -> String {
    DEFAULT_KEY_ID.to_string()
}

fn default_audience() -> String {
    DEFAULT_AUDIENCE.to_string()
}

pub(crate) fn default_request_timeout_ms() -> u64 {
    5_000
}

pub(crate) fn default_key_cache_ttl_secs() -> u64 {
    24 * 60 * 60
}

fn default_expose_auth_trace() -> bool {
    true
}

/// Wires issuer, player client, caches and validator into the auth layer.
pub fn build_auth_layer(config: &Config) -> anyhow::Result<AuthLayer> {
    let issuer = Arc::new(CredentialIssuer::new(
        &config.jwt_key_path,
        config.jwt_key_id.clone(),
        config.jwt_audience.clone(),
    ));

    let player_client = PlayerClient::new(
        &config.player_url,
        issuer,
        config.player_timeout_ms.map(Duration::from_millis),
    )
    .context("Failed to build player service client")?;

    let key_cache = Arc::new(KeyCache::with_ttl(
        Arc::new(player_client),
        Duration::from_secs(config.key_cache_ttl_secs),
    ));

    let timeout = Duration::from_millis(config.request_timeout_ms);
    let replay = Arc::new(ReplayGuard::new(timeout));

    let policy = SecretPolicy {
        registration_secret: config.registration_secret.clone(),
        query_secret: config.query_secret.clone(),
    };
    if policy.registration_secret.is_none() {
        info!("No registration secret configured - room registration requires an id");
    }

    let validator = Arc::new(RequestValidator::new(policy, key_cache, replay, timeout));

    Ok(AuthLayer::new(
        validator,
        FilterOptions {
            context_path: config.context_path.clone(),
            expose_trace: config.expose_auth_trace,
        },
    ))
}

/// Puts `downstream` behind the auth layer.
pub fn router(auth_layer: AuthLayer, downstream: Router) -> Router {
    downstream
        .layer(auth_layer)
        .layer(TraceLayer::new_for_http())
}

/// Echoes the identity established by the auth layer.
pub async fn identity(
    Extension(player): Extension<AuthenticatedPlayer>,
) -> Json<AuthenticatedPlayer> {
    Json(player)
}

pub async fn run(config: Config) -> anyhow::Result<()> {
    let auth_layer = build_auth_layer(&config)?;

    let app = router(auth_layer, Router::new().fallback(identity));

    let bind = format!("{}:{}", &config.address, &config.port);
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("Failed to bind {}", bind))?;

    info!("running concierge gateway on {}", &bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received");
}
