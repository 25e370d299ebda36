use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tollgate::clock::{SharedClock, SystemClock};
use tollgate::config::{LimiterMode, ObserverKind, StoreBackend, TollgateConfig};
use tollgate::http::HttpServer;
use tollgate::ratelimit::{
    FailureMode, KeyedLimiter, Limiter, LoggingObserver, NoopObserver, Observer,
    PrometheusObserver, SharedStoreLimiter, TokenBucket,
};
use tollgate::store::{AtomicStore, MemoryStore};

/// Token-bucket admission control over HTTP.
#[derive(Debug, Parser)]
#[command(name = "tollgate", version, about)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long, env = "TOLLGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Override the listen address
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Override the limiter mode (single, keyed, shared)
    #[arg(long)]
    mode: Option<LimiterMode>,

    /// Override the shared store failure mode (open, closed, degrade)
    #[arg(long)]
    failure_mode: Option<FailureMode>,

    /// Log level used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    if args.log_json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init();
    }

    info!("Starting Tollgate");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = TollgateConfig::load(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        config.server.listen_addr = listen;
    }
    if let Some(mode) = args.mode {
        config.limiter.mode = mode;
    }
    if let Some(failure_mode) = args.failure_mode {
        config.store.failure_mode = failure_mode;
    }
    config.validate()?;
    info!(
        listen_addr = %config.server.listen_addr,
        mode = %config.limiter.mode,
        capacity = config.limiter.capacity,
        refill_rate = config.limiter.refill_rate,
        "Configuration loaded"
    );

    let metrics = match config.server.observer {
        ObserverKind::Prometheus => Some(Arc::new(PrometheusObserver::new())),
        _ => None,
    };
    let limiter = build_limiter(&config, metrics.clone()).await?;

    let mut server = HttpServer::new(config.server.listen_addr, limiter)
        .with_slow_timeout(config.server.slow_timeout());
    if let Some(metrics) = metrics {
        server = server.with_metrics(metrics);
    }

    server.serve_with_shutdown(shutdown_signal()).await?;

    info!("Tollgate stopped");
    Ok(())
}

async fn build_limiter(
    config: &TollgateConfig,
    metrics: Option<Arc<PrometheusObserver>>,
) -> anyhow::Result<Arc<dyn Limiter>> {
    let clock: SharedClock = Arc::new(SystemClock);
    let capacity = config.limiter.capacity;
    let refill_rate = config.limiter.refill_rate;

    let limiter: Arc<dyn Limiter> = match config.limiter.mode {
        LimiterMode::Single => Arc::new(TokenBucket::new(capacity, refill_rate, clock)),
        LimiterMode::Keyed => Arc::new(KeyedLimiter::new(capacity, refill_rate, clock)),
        LimiterMode::Shared => {
            let observer: Arc<dyn Observer> = match (config.server.observer, metrics) {
                (_, Some(metrics)) => metrics,
                (ObserverKind::Logging, None) => Arc::new(LoggingObserver),
                _ => Arc::new(NoopObserver),
            };

            match config.store.backend {
                StoreBackend::Memory => {
                    warn!("Shared mode with the memory store only shares state within this process");
                    shared_limiter(MemoryStore::new(clock.clone()), config, observer, clock)
                }
                #[cfg(feature = "redis")]
                StoreBackend::Redis => {
                    let store = tollgate::store::RedisStore::connect(&config.store.redis_url).await?;
                    info!(url = %config.store.redis_url, "Connected to Redis");
                    shared_limiter(store, config, observer, clock)
                }
                #[cfg(not(feature = "redis"))]
                StoreBackend::Redis => {
                    anyhow::bail!("tollgate was built without the redis feature")
                }
            }
        }
    };

    info!(mode = %config.limiter.mode, "Limiter initialized");
    Ok(limiter)
}

fn shared_limiter<S: AtomicStore + 'static>(
    store: S,
    config: &TollgateConfig,
    observer: Arc<dyn Observer>,
    clock: SharedClock,
) -> Arc<dyn Limiter> {
    let mut builder = SharedStoreLimiter::builder(
        store,
        config.limiter.capacity,
        config.limiter.refill_rate,
        config.store.key_prefix.clone(),
    )
    .failure_mode(config.store.failure_mode)
    .observer(observer)
    .clock(clock)
    .poll_interval(config.store.poll_interval());

    if let Some(breaker) = &config.store.circuit_breaker {
        builder = builder.circuit_breaker(breaker.threshold, breaker.timeout());
    }

    Arc::new(builder.build())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
