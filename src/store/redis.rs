//! Redis-backed shared store.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use tracing::{debug, info};

use super::{AtomicStore, StoreDecision, StoreError};

const TOKEN_BUCKET_SCRIPT: &str = include_str!("token_bucket.lua");

/// A store that runs the token bucket step as a Lua script inside Redis.
///
/// The script reads `TIME` on the server, so limiter instances with skewed
/// clocks still agree on refill.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    script: Script,
}

impl RedisStore {
    /// Connect to the Redis server at `url`.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        info!(url = %url, "Connected to redis");
        Ok(Self::new(conn))
    }

    /// Wrap an existing connection manager.
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            script: Script::new(TOKEN_BUCKET_SCRIPT),
        }
    }
}

#[async_trait]
impl AtomicStore for RedisStore {
    async fn check_and_decrement(
        &self,
        key: &str,
        requested: u32,
        capacity: f64,
        refill_rate: f64,
    ) -> Result<StoreDecision, StoreError> {
        let mut conn = self.conn.clone();

        let (allowed, remaining): (i64, String) = self
            .script
            .key(key)
            .arg(requested)
            .arg(capacity)
            .arg(refill_rate)
            .invoke_async(&mut conn)
            .await?;

        let remaining: f64 = remaining
            .parse()
            .map_err(|_| StoreError::Protocol(format!("token count {remaining:?}")))?;

        debug!(key = %key, allowed = allowed == 1, remaining, "Redis check-and-decrement");
        Ok(StoreDecision {
            allowed: allowed == 1,
            remaining,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn redis_url() -> String {
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
    }

    /// Returns `None` when no server is reachable, so the test is skipped.
    async fn test_store() -> Option<RedisStore> {
        let url = redis_url();
        match tokio::time::timeout(std::time::Duration::from_secs(2), RedisStore::connect(&url))
            .await
        {
            Ok(Ok(store)) => Some(store),
            _ => {
                eprintln!("Redis not available at {url}, skipping");
                None
            }
        }
    }

    async fn delete_key(store: &RedisStore, key: &str) {
        let mut conn = store.conn.clone();
        let _: Result<(), _> = redis::cmd("DEL").arg(key).query_async(&mut conn).await;
    }

    #[tokio::test]
    async fn test_redis_initial_bucket() {
        let Some(store) = test_store().await else {
            return;
        };
        let key = "tollgate-test:initial";
        delete_key(&store, key).await;

        for i in 0..5 {
            let decision = store.check_and_decrement(key, 1, 5.0, 1.0).await.unwrap();
            assert!(decision.allowed, "request {} should be allowed", i + 1);
        }
        let decision = store.check_and_decrement(key, 1, 5.0, 1.0).await.unwrap();
        assert!(!decision.allowed);
        assert!(decision.remaining < 1.0);

        delete_key(&store, key).await;
    }

    #[tokio::test]
    async fn test_redis_timestamp_keeps_microseconds() {
        let Some(store) = test_store().await else {
            return;
        };
        let key = "tollgate-test:timestamp";
        delete_key(&store, key).await;

        store.check_and_decrement(key, 1, 5.0, 1.0).await.unwrap();

        let mut conn = store.conn.clone();
        let ts: String = redis::cmd("HGET").arg(key).arg("ts_us").query_async(&mut conn).await.unwrap();
        assert!(ts.chars().all(|c| c.is_ascii_digit()), "timestamp {ts:?} is not an integer");
        assert!(ts.len() >= 16, "timestamp {ts:?} is not in microseconds");

        delete_key(&store, key).await;
    }

    #[tokio::test]
    async fn test_redis_concurrent_callers_never_overdraw() {
        let Some(store) = test_store().await else {
            return;
        };
        let store = Arc::new(store);
        let key = "tollgate-test:concurrent";
        delete_key(&store, key).await;

        let handles: Vec<_> = (0..50)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.check_and_decrement(key, 1, 10.0, 0.0).await })
            })
            .collect();

        let mut allowed = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap().allowed {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 10);

        delete_key(&store, key).await;
    }
}
