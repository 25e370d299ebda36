//! Observation hooks for shared-store admission decisions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::store::StoreError;

/// Receives notifications about admission decisions.
///
/// Implementations must be cheap; they run on the request path.
pub trait Observer: Send + Sync {
    /// A request for `key` was admitted.
    fn on_allow(&self, key: &str);
    /// A request for `key` was rejected.
    fn on_deny(&self, key: &str);
    /// The store could not decide for `key`.
    fn on_error(&self, key: &str, error: &StoreError);
    /// A store round trip for `key` took `latency`.
    fn on_latency(&self, key: &str, latency: Duration);
}

/// Discards every notification.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl Observer for NoopObserver {
    fn on_allow(&self, _key: &str) {}
    fn on_deny(&self, _key: &str) {}
    fn on_error(&self, _key: &str, _error: &StoreError) {}
    fn on_latency(&self, _key: &str, _latency: Duration) {}
}

/// Emits every notification as a `tracing` event.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingObserver;

impl Observer for LoggingObserver {
    fn on_allow(&self, key: &str) {
        debug!(key = %key, "Request allowed");
    }

    fn on_deny(&self, key: &str) {
        debug!(key = %key, "Request denied");
    }

    fn on_error(&self, key: &str, error: &StoreError) {
        warn!(key = %key, error = %error, "Shared store error");
    }

    fn on_latency(&self, key: &str, latency: Duration) {
        debug!(key = %key, latency_us = latency.as_micros() as u64, "Store round trip");
    }
}

/// Upper bounds of the latency histogram buckets, in microseconds.
const LATENCY_BOUNDS_MICROS: [u64; 5] = [1_000, 5_000, 10_000, 50_000, 250_000];

/// Aggregates notifications into counters and renders them in the
/// Prometheus text exposition format.
///
/// Counters are not labelled by key, since keys are unbounded.
pub struct PrometheusObserver {
    start_time: Instant,
    pub requests_allowed: AtomicU64,
    pub requests_denied: AtomicU64,
    pub store_errors: AtomicU64,
    pub circuit_open_rejections: AtomicU64,
    /// Per-bucket counts; the last slot holds everything above the largest bound
    latency_buckets: [AtomicU64; LATENCY_BOUNDS_MICROS.len() + 1],
    latency_sum_micros: AtomicU64,
    latency_count: AtomicU64,
}

impl PrometheusObserver {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            requests_allowed: AtomicU64::new(0),
            requests_denied: AtomicU64::new(0),
            store_errors: AtomicU64::new(0),
            circuit_open_rejections: AtomicU64::new(0),
            latency_buckets: Default::default(),
            latency_sum_micros: AtomicU64::new(0),
            latency_count: AtomicU64::new(0),
        }
    }

    /// Get uptime in seconds
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Export metrics in Prometheus text format
    pub fn export_prometheus(&self) -> String {
        let mut output = String::with_capacity(1500);

        output.push_str("# HELP tollgate_uptime_seconds Time since the observer was created\n");
        output.push_str("# TYPE tollgate_uptime_seconds gauge\n");
        output.push_str(&format!(
            "tollgate_uptime_seconds {}\n\n",
            self.uptime_seconds()
        ));

        output.push_str("# HELP tollgate_requests_allowed Total requests allowed\n");
        output.push_str("# TYPE tollgate_requests_allowed counter\n");
        output.push_str(&format!(
            "tollgate_requests_allowed {}\n\n",
            self.requests_allowed.load(Ordering::Relaxed)
        ));

        output.push_str("# HELP tollgate_requests_denied Total requests denied\n");
        output.push_str("# TYPE tollgate_requests_denied counter\n");
        output.push_str(&format!(
            "tollgate_requests_denied {}\n\n",
            self.requests_denied.load(Ordering::Relaxed)
        ));

        output.push_str("# HELP tollgate_store_errors Shared store failures by reason\n");
        output.push_str("# TYPE tollgate_store_errors counter\n");
        output.push_str(&format!(
            "tollgate_store_errors{{reason=\"circuit_open\"}} {}\n",
            self.circuit_open_rejections.load(Ordering::Relaxed)
        ));
        output.push_str(&format!(
            "tollgate_store_errors{{reason=\"store\"}} {}\n\n",
            self.store_errors.load(Ordering::Relaxed)
        ));

        output.push_str("# HELP tollgate_store_latency_seconds Shared store round trip latency\n");
        output.push_str("# TYPE tollgate_store_latency_seconds histogram\n");
        let mut cumulative = 0;
        for (bound, bucket) in LATENCY_BOUNDS_MICROS.iter().zip(&self.latency_buckets) {
            cumulative += bucket.load(Ordering::Relaxed);
            output.push_str(&format!(
                "tollgate_store_latency_seconds_bucket{{le=\"{}\"}} {}\n",
                *bound as f64 / 1_000_000.0,
                cumulative
            ));
        }
        output.push_str(&format!(
            "tollgate_store_latency_seconds_bucket{{le=\"+Inf\"}} {}\n",
            self.latency_count.load(Ordering::Relaxed)
        ));

        let latency_sum_seconds =
            self.latency_sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0;
        output.push_str(&format!(
            "tollgate_store_latency_seconds_sum {latency_sum_seconds:.6}\n"
        ));
        output.push_str(&format!(
            "tollgate_store_latency_seconds_count {}\n",
            self.latency_count.load(Ordering::Relaxed)
        ));

        output
    }
}

impl Default for PrometheusObserver {
    fn default() -> Self {
        Self::new()
    }
}

impl Observer for PrometheusObserver {
    fn on_allow(&self, _key: &str) {
        self.requests_allowed.fetch_add(1, Ordering::Relaxed);
    }

    fn on_deny(&self, _key: &str) {
        self.requests_denied.fetch_add(1, Ordering::Relaxed);
    }

    fn on_error(&self, _key: &str, error: &StoreError) {
        match error {
            StoreError::CircuitOpen => self.circuit_open_rejections.fetch_add(1, Ordering::Relaxed),
            _ => self.store_errors.fetch_add(1, Ordering::Relaxed),
        };
    }

    fn on_latency(&self, _key: &str, latency: Duration) {
        let micros = latency.as_micros().min(u128::from(u64::MAX)) as u64;
        let slot = LATENCY_BOUNDS_MICROS
            .iter()
            .position(|bound| micros <= *bound)
            .unwrap_or(LATENCY_BOUNDS_MICROS.len());

        self.latency_buckets[slot].fetch_add(1, Ordering::Relaxed);
        self.latency_sum_micros.fetch_add(micros, Ordering::Relaxed);
        self.latency_count.fetch_add(1, Ordering::Relaxed);
    }
}
