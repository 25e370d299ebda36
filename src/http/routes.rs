//! Route handlers.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use tracing::{debug, warn};

use super::{CLIENT_ID_HEADER, DEFAULT_CLIENT_KEY};
use crate::ratelimit::{Cancellation, Limiter, PrometheusObserver};

pub(crate) struct AppState<L: ?Sized> {
    pub(crate) limiter: Arc<L>,
    pub(crate) slow_timeout: Duration,
    pub(crate) metrics: Option<Arc<PrometheusObserver>>,
}

/// Optional `?tokens=N` query, defaulting to one token per request.
#[derive(Debug, Deserialize)]
pub(crate) struct AdmissionParams {
    tokens: Option<u32>,
}

impl AdmissionParams {
    fn tokens(&self) -> u32 {
        self.tokens.unwrap_or(1)
    }
}

pub(crate) fn router<L: Limiter + ?Sized + 'static>(state: Arc<AppState<L>>) -> Router {
    Router::new()
        .route("/ping", get(ping::<L>))
        .route("/slow", get(slow::<L>))
        .route("/health", get(|| async { "OK" }))
        .route("/metrics", get(metrics::<L>))
        .with_state(state)
}

fn client_key(headers: &HeaderMap) -> String {
    headers
        .get(CLIENT_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .unwrap_or(DEFAULT_CLIENT_KEY)
        .to_string()
}

async fn ping<L: Limiter + ?Sized + 'static>(
    State(state): State<Arc<AppState<L>>>,
    Query(params): Query<AdmissionParams>,
    headers: HeaderMap,
) -> (StatusCode, &'static str) {
    let key = client_key(&headers);

    if state.limiter.allow(&key, params.tokens()).await {
        (StatusCode::OK, "pong\n")
    } else {
        debug!(key = %key, "Rejected /ping");
        (StatusCode::TOO_MANY_REQUESTS, "Rate limited! Try again later.\n")
    }
}

async fn slow<L: Limiter + ?Sized + 'static>(
    State(state): State<Arc<AppState<L>>>,
    Query(params): Query<AdmissionParams>,
    headers: HeaderMap,
) -> (StatusCode, &'static str) {
    let key = client_key(&headers);
    let cancel = Cancellation::with_timeout(state.slow_timeout);

    match state.limiter.wait(&key, params.tokens(), &cancel).await {
        Ok(()) => (StatusCode::OK, "Completed slow operation!\n"),
        Err(e) if e.is_cancellation() => {
            debug!(key = %key, "Timed out on /slow");
            (StatusCode::TOO_MANY_REQUESTS, "Timed out waiting for rate limit.\n")
        }
        Err(e) => {
            warn!(key = %key, error = %e, "Request on /slow can never be admitted");
            (StatusCode::TOO_MANY_REQUESTS, "Request exceeds bucket capacity.\n")
        }
    }
}

async fn metrics<L: Limiter + ?Sized + 'static>(State(state): State<Arc<AppState<L>>>) -> Response {
    match &state.metrics {
        Some(observer) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            observer.export_prometheus(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
