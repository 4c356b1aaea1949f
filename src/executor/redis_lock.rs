use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Result, WorkflowError};
use crate::executor::lock::LockService;

/// Cluster-wide advisory lock on Redis. Acquisition is `SET NX PX`; refresh
/// and release compare the holder under a Lua script so an expired lock
/// taken over by another worker is never touched.
pub struct RedisLockService {
    client: redis::Client,
    prefix: String,
}

impl RedisLockService {
    pub fn new(client: redis::Client) -> Self {
        Self {
            client,
            prefix: "procflow".to_string(),
        }
    }

    pub fn with_prefix(client: redis::Client, prefix: impl Into<String>) -> Self {
        Self {
            client,
            prefix: prefix.into(),
        }
    }

    fn key(&self, name: &str) -> String {
        format!("{}:lock:{}", self.prefix, name)
    }
}

fn store_err(e: redis::RedisError) -> WorkflowError {
    WorkflowError::Store(e.to_string())
}

#[async_trait]
impl LockService for RedisLockService {
    async fn try_acquire(&self, name: &str, holder: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(store_err)?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(self.key(name))
            .arg(holder)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(reply.is_some())
    }

    async fn refresh(&self, name: &str, holder: &str, ttl: Duration) -> Result<bool> {
        let script = redis::Script::new(
            r#"
            if redis.call("GET", KEYS[1]) == ARGV[1] then
                return redis.call("PEXPIRE", KEYS[1], ARGV[2])
            else
                return 0
            end
        "#,
        );
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(store_err)?;
        let extended: i64 = script
            .key(self.key(name))
            .arg(holder)
            .arg(ttl.as_millis() as u64)
            .invoke_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(extended == 1)
    }

    async fn release(&self, name: &str, holder: &str) -> Result<()> {
        let script = redis::Script::new(
            r#"
            if redis.call("GET", KEYS[1]) == ARGV[1] then
                return redis.call("DEL", KEYS[1])
            else
                return 0
            end
        "#,
        );
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(store_err)?;
        let _: i64 = script
            .key(self.key(name))
            .arg(holder)
            .invoke_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(())
    }
}
