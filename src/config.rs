//! Configuration management for Tollgate.
//!
//! Values come from an optional YAML file, overridden by environment
//! variables of the form `TOLLGATE__SECTION__FIELD` (for example
//! `TOLLGATE__LIMITER__CAPACITY=20`).

use std::fmt;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TollgateError};
use crate::ratelimit::FailureMode;

/// Main configuration for the Tollgate service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TollgateConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Bucket shape and deployment mode
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// Shared store configuration, used in shared mode
    #[serde(default)]
    pub store: StoreConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// How long `/slow` waits for tokens before giving up, in milliseconds
    #[serde(default = "default_slow_timeout_ms")]
    pub slow_timeout_ms: u64,

    /// Where admission decisions are reported
    #[serde(default)]
    pub observer: ObserverKind,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            slow_timeout_ms: default_slow_timeout_ms(),
            observer: ObserverKind::default(),
        }
    }
}

impl ServerConfig {
    pub fn slow_timeout(&self) -> Duration {
        Duration::from_millis(self.slow_timeout_ms)
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

fn default_slow_timeout_ms() -> u64 {
    2000
}

/// Which limiter serves requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LimiterMode {
    /// One bucket for every caller
    #[default]
    Single,
    /// One in-memory bucket per key
    Keyed,
    /// Buckets held in a shared store
    Shared,
}

impl fmt::Display for LimiterMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LimiterMode::Single => "single",
            LimiterMode::Keyed => "keyed",
            LimiterMode::Shared => "shared",
        };
        f.write_str(name)
    }
}

impl FromStr for LimiterMode {
    type Err = TollgateError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "single" => Ok(LimiterMode::Single),
            "keyed" => Ok(LimiterMode::Keyed),
            "shared" => Ok(LimiterMode::Shared),
            other => Err(TollgateError::Config(format!(
                "unknown limiter mode {other:?}, expected single, keyed or shared"
            ))),
        }
    }
}

/// Bucket configuration shared by every deployment mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    #[serde(default)]
    pub mode: LimiterMode,

    /// Maximum tokens per bucket
    #[serde(default = "default_capacity")]
    pub capacity: f64,

    /// Tokens added per second
    #[serde(default = "default_refill_rate")]
    pub refill_rate: f64,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            mode: LimiterMode::default(),
            capacity: default_capacity(),
            refill_rate: default_refill_rate(),
        }
    }
}

impl LimiterConfig {
    /// Reject capacities and refill rates that are negative or not finite.
    pub fn validate(&self) -> Result<()> {
        if !self.capacity.is_finite() || self.capacity < 0.0 {
            return Err(TollgateError::Config(format!(
                "capacity must be a non-negative number, got {}",
                self.capacity
            )));
        }
        if !self.refill_rate.is_finite() || self.refill_rate < 0.0 {
            return Err(TollgateError::Config(format!(
                "refill_rate must be a non-negative number, got {}",
                self.refill_rate
            )));
        }
        Ok(())
    }
}

fn default_capacity() -> f64 {
    5.0
}

fn default_refill_rate() -> f64 {
    1.0
}

/// Which shared store backs the shared limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process store, shared only by limiters in this process
    #[default]
    Memory,
    /// Redis server
    Redis,
}

/// Where admission decisions are reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObserverKind {
    #[default]
    Noop,
    Logging,
    Prometheus,
}

/// Circuit breaker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures before the breaker opens
    #[serde(default = "default_breaker_threshold")]
    pub threshold: u32,

    /// Seconds the breaker stays open before probing
    #[serde(default = "default_breaker_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            threshold: default_breaker_threshold(),
            timeout_secs: default_breaker_timeout_secs(),
        }
    }
}

impl BreakerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_breaker_threshold() -> u32 {
    5
}

fn default_breaker_timeout_secs() -> u64 {
    30
}

/// Shared store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Prefix prepended to every key in the store
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    #[serde(default)]
    pub failure_mode: FailureMode,

    /// Circuit breaker guarding the store; absent means no breaker
    #[serde(default)]
    pub circuit_breaker: Option<BreakerConfig>,

    /// Interval between attempts while waiting on the shared store
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            redis_url: default_redis_url(),
            key_prefix: default_key_prefix(),
            failure_mode: FailureMode::default(),
            circuit_breaker: None,
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl StoreConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_key_prefix() -> String {
    "ratelimit:".to_string()
}

fn default_poll_interval_ms() -> u64 {
    20
}

impl TollgateConfig {
    /// Load configuration from an optional YAML file and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("TOLLGATE")
                .separator("__")
                .try_parsing(true),
        );

        let config: TollgateConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| TollgateError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TollgateConfig =
            serde_yaml::from_str(yaml).map_err(|e| TollgateError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check every section for values the limiters cannot work with.
    pub fn validate(&self) -> Result<()> {
        self.limiter.validate()?;

        if self.server.slow_timeout_ms == 0 {
            return Err(TollgateError::Config(
                "server.slow_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.store.poll_interval_ms == 0 {
            return Err(TollgateError::Config(
                "store.poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        // Only the shared limiter reports to an observer
        if self.server.observer != ObserverKind::Noop && self.limiter.mode != LimiterMode::Shared {
            return Err(TollgateError::Config(format!(
                "server.observer {:?} requires limiter.mode shared, got {}",
                self.server.observer, self.limiter.mode
            )));
        }
        if let Some(breaker) = &self.store.circuit_breaker {
            if breaker.threshold == 0 {
                return Err(TollgateError::Config(
                    "store.circuit_breaker.threshold must be at least 1".to_string(),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TollgateConfig::default();

        assert_eq!(config.server.listen_addr, "127.0.0.1:8080".parse().unwrap());
        assert_eq!(config.server.slow_timeout(), Duration::from_secs(2));
        assert_eq!(config.limiter.mode, LimiterMode::Single);
        assert_eq!(config.limiter.capacity, 5.0);
        assert_eq!(config.limiter.refill_rate, 1.0);
        assert_eq!(config.store.key_prefix, "ratelimit:");
        assert_eq!(config.store.failure_mode, FailureMode::Open);
        assert_eq!(config.store.poll_interval(), Duration::from_millis(20));
        assert!(config.store.circuit_breaker.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_yaml() {
        let yaml = r#"
server:
  listen_addr: "0.0.0.0:9000"
  observer: prometheus
limiter:
  mode: shared
  capacity: 100
  refill_rate: 2.5
store:
  backend: redis
  key_prefix: "api:"
  failure_mode: degrade
  circuit_breaker:
    threshold: 3
"#;
        let config = TollgateConfig::from_yaml(yaml).unwrap();

        assert_eq!(config.server.listen_addr, "0.0.0.0:9000".parse().unwrap());
        assert_eq!(config.server.observer, ObserverKind::Prometheus);
        assert_eq!(config.limiter.mode, LimiterMode::Shared);
        assert_eq!(config.limiter.capacity, 100.0);
        assert_eq!(config.limiter.refill_rate, 2.5);
        assert_eq!(config.store.backend, StoreBackend::Redis);
        assert_eq!(config.store.key_prefix, "api:");
        assert_eq!(config.store.failure_mode, FailureMode::Degrade);

        let breaker = config.store.circuit_breaker.unwrap();
        assert_eq!(breaker.threshold, 3);
        assert_eq!(breaker.timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_rejects_negative_numbers() {
        let yaml = "limiter:\n  capacity: -1\n";
        assert!(matches!(
            TollgateConfig::from_yaml(yaml),
            Err(TollgateError::Config(_))
        ));

        let yaml = "limiter:\n  refill_rate: -0.5\n";
        assert!(TollgateConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_rejects_zero_breaker_threshold() {
        let yaml = "store:\n  circuit_breaker:\n    threshold: 0\n";
        assert!(TollgateConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_observer_requires_shared_mode() {
        for mode in ["single", "keyed"] {
            let yaml = format!("server:\n  observer: prometheus\nlimiter:\n  mode: {mode}\n");
            assert!(matches!(
                TollgateConfig::from_yaml(&yaml),
                Err(TollgateError::Config(_))
            ));
        }

        let yaml = "server:\n  observer: logging\nlimiter:\n  mode: keyed\n";
        assert!(TollgateConfig::from_yaml(yaml).is_err());

        let yaml = "server:\n  observer: prometheus\nlimiter:\n  mode: shared\n";
        assert!(TollgateConfig::from_yaml(yaml).is_ok());
    }

    #[test]
    fn test_rejects_unknown_failure_mode() {
        let yaml = "store:\n  failure_mode: sometimes\n";
        assert!(TollgateConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!("tollgate-config-{}.yaml", std::process::id()));
        std::fs::write(&path, "limiter:\n  mode: keyed\n  capacity: 7\n").unwrap();

        let config = TollgateConfig::load(Some(&path));
        std::fs::remove_file(&path).unwrap();

        let config = config.unwrap();
        assert_eq!(config.limiter.mode, LimiterMode::Keyed);
        assert_eq!(config.limiter.capacity, 7.0);
        assert_eq!(config.limiter.refill_rate, 1.0);
    }

    #[test]
    fn test_limiter_mode_parsing() {
        assert_eq!("Keyed".parse::<LimiterMode>().unwrap(), LimiterMode::Keyed);
        assert_eq!(LimiterMode::Shared.to_string(), "shared");
        assert!("global".parse::<LimiterMode>().is_err());
    }
}
