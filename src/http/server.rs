//! HTTP server implementation.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tokio::net::TcpListener;
use tracing::{error, info};

use super::routes::{self, AppState};
use crate::error::Result;
use crate::ratelimit::{Limiter, PrometheusObserver};

const DEFAULT_SLOW_TIMEOUT: Duration = Duration::from_secs(2);

/// HTTP server fronting any [`Limiter`].
pub struct HttpServer<L: Limiter + ?Sized + 'static> {
    /// Address to bind to
    addr: SocketAddr,
    /// The limiter deciding admission
    limiter: Arc<L>,
    /// Upper bound on how long `/slow` waits
    slow_timeout: Duration,
    /// Exported on `/metrics` when present
    metrics: Option<Arc<PrometheusObserver>>,
}

impl<L: Limiter + ?Sized + 'static> HttpServer<L> {
    /// Create a new HTTP server in front of `limiter`.
    pub fn new(addr: SocketAddr, limiter: Arc<L>) -> Self {
        Self {
            addr,
            limiter,
            slow_timeout: DEFAULT_SLOW_TIMEOUT,
            metrics: None,
        }
    }

    /// Bound how long `/slow` waits for tokens.
    pub fn with_slow_timeout(mut self, timeout: Duration) -> Self {
        self.slow_timeout = timeout;
        self
    }

    /// Serve `observer`'s counters on `/metrics`.
    pub fn with_metrics(mut self, observer: Arc<PrometheusObserver>) -> Self {
        self.metrics = Some(observer);
        self
    }

    /// Build the router without binding a socket.
    pub fn router(&self) -> Router {
        routes::router(Arc::new(AppState {
            limiter: self.limiter.clone(),
            slow_timeout: self.slow_timeout,
            metrics: self.metrics.clone(),
        }))
    }

    /// Start the HTTP server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let router = self.router();
        let listener = TcpListener::bind(self.addr).await?;

        info!(addr = %self.addr, "Starting HTTP server");

        axum::serve(listener, router)
            .with_graceful_shutdown(signal)
            .await
            .map_err(|e| {
                error!(error = %e, "HTTP server failed");
                e.into()
            })
    }
}
