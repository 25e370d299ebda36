//! Rate limiting logic and state management.

mod backend;
mod breaker;
mod bucket;
mod cancel;
mod keyed;
mod observer;
mod shared;

pub use backend::Limiter;
pub use breaker::{CircuitBreaker, CircuitState};
pub use bucket::TokenBucket;
pub use cancel::Cancellation;
pub use keyed::KeyedLimiter;
pub use observer::{LoggingObserver, NoopObserver, Observer, PrometheusObserver};
pub use shared::{FailureMode, SharedStoreLimiter, SharedStoreLimiterBuilder, DEFAULT_POLL_INTERVAL};
