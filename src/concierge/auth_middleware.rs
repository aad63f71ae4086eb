use std::sync::Arc;

use std::task::{Context, Poll};

use axum::body::Body;
use axum::extract::Request;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use tower::{Layer, Service};
use tracing::{debug, info};

use super::auth::{QueryParams, SERVICE_ID_PARAM};
use super::validator::{AuthOutcome, RequestValidator};

/// Player id recorded for requests signed with a static secret.
pub const DEFAULT_PLAYER_ID: &str = "GameOn!";

/// Identity attached to every request that passes authentication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticatedPlayer {
    pub player_id: String,
    pub service_id: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct FilterOptions {
    /// Prefix removed from the request path before secret selection.
    pub context_path: String,
    /// Send the validation trace as the 403 body.
    pub expose_trace: bool,
}

impl FilterOptions {
    fn route_path<'a>(&self, path: &'a str) -> &'a str {
        if self.context_path.is_empty() {
            return path;
        }
        match path.strip_prefix(self.context_path.as_str()) {
            Some("") => "/",
            Some(rest) if rest.starts_with('/') => rest,
            _ => path,
        }
    }
}

#[derive(Clone)]
pub struct AuthMiddleware<S> {
    inner: S,
    validator: Arc<RequestValidator>,
    options: Arc<FilterOptions>,
}

impl<S> AuthMiddleware<S> {
    pub fn new(inner: S, validator: Arc<RequestValidator>, options: Arc<FilterOptions>) -> Self {
        Self {
            inner,
            validator,
            options,
        }
    }
}

impl<S> Service<Request> for AuthMiddleware<S>
where
    S: Service<Request, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request) -> Self::Future {
        let validator = self.validator.clone();
        let options = self.options.clone();
        // keep the instance that was driven ready
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let uri = req.uri().clone();
            let path = options.route_path(uri.path());
            debug!("authenticating {} {}", req.method(), path);

            match validator.validate(path, uri.query()).await {
                AuthOutcome::Allowed { principal } => {
                    let service_id = uri
                        .query()
                        .and_then(|q| QueryParams::new(q).get(SERVICE_ID_PARAM));
                    let player = AuthenticatedPlayer {
                        player_id: principal.unwrap_or_else(|| DEFAULT_PLAYER_ID.to_string()),
                        service_id,
                    };
                    info!("Request authenticated for player {}", player.player_id);

                    req.extensions_mut().insert(player);
                    inner.call(req).await
                }
                AuthOutcome::Denied { trace, .. } => {
                    let body = if options.expose_trace {
                        trace
                    } else {
                        "Forbidden".to_string()
                    };
                    Ok(forbidden(body))
                }
            }
        })
    }
}

#[derive(Clone)]
pub struct AuthLayer {
    validator: Arc<RequestValidator>,
    options: Arc<FilterOptions>,
}

impl AuthLayer {
    pub fn new(validator: Arc<RequestValidator>, options: FilterOptions) -> Self {
        Self {
            validator,
            options: Arc::new(options),
        }
    }
}

impl<S> Layer<S> for AuthLayer {
    type Service = AuthMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AuthMiddleware::new(inner, self.validator.clone(), self.options.clone())
    }
}

fn forbidden(body: String) -> Response {
    (
        StatusCode::FORBIDDEN,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        Body::from(body),
    )
        .into_response()
}
