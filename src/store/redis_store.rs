//! Redis-backed store implementation
//!
//! One multiplexed async connection shared by all tasks of a connection.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client};
use tokio::sync::RwLock;

use crate::error::{StoreError, StoreResult};
use crate::store::QueueStore;

/// [`QueueStore`] over a Redis server via redis-rs
pub struct RedisStore {
    connection: RwLock<MultiplexedConnection>,
}

impl RedisStore {
    /// Connect to the server at `url` (e.g. `redis://127.0.0.1:6379/0`)
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let client = Client::open(url).map_err(|e| StoreError::ConnectionFailed {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| StoreError::ConnectionFailed {
                url: url.to_string(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            connection: RwLock::new(connection),
        })
    }
}

#[async_trait]
impl QueueStore for RedisStore {
    async fn lpush(&self, key: &str, value: &str) -> StoreResult<i64> {
        let mut conn = self.connection.write().await;
        let len: i64 = conn.lpush(key, value).await?;
        Ok(len)
    }

    async fn rpoplpush(&self, source: &str, destination: &str) -> StoreResult<Option<String>> {
        let mut conn = self.connection.write().await;
        let value: Option<String> = conn.rpoplpush(source, destination).await?;
        Ok(value)
    }

    async fn lrem(&self, key: &str, count: i64, value: &str) -> StoreResult<i64> {
        let mut conn = self.connection.write().await;
        let removed: i64 = conn.lrem(key, count as isize, value).await?;
        Ok(removed)
    }

    async fn llen(&self, key: &str) -> StoreResult<i64> {
        let mut conn = self.connection.write().await;
        let len: i64 = conn.llen(key).await?;
        Ok(len)
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> StoreResult<Vec<String>> {
        let mut conn = self.connection.write().await;
        let values: Vec<String> = conn.lrange(key, start as isize, stop as isize).await?;
        Ok(values)
    }

    async fn del(&self, key: &str) -> StoreResult<i64> {
        let mut conn = self.connection.write().await;
        let removed: i64 = conn.del(key).await?;
        Ok(removed)
    }

    async fn sadd(&self, key: &str, member: &str) -> StoreResult<bool> {
        let mut conn = self.connection.write().await;
        let added: i64 = conn.sadd(key, member).await?;
        Ok(added == 1)
    }

    async fn srem(&self, key: &str, member: &str) -> StoreResult<bool> {
        let mut conn = self.connection.write().await;
        let removed: i64 = conn.srem(key, member).await?;
        Ok(removed == 1)
    }

    async fn smembers(&self, key: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.connection.write().await;
        let members: Vec<String> = conn.smembers(key).await?;
        Ok(members)
    }

    async fn scard(&self, key: &str) -> StoreResult<i64> {
        let mut conn = self.connection.write().await;
        let count: i64 = conn.scard(key).await?;
        Ok(count)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        let mut conn = self.connection.write().await;
        let seconds = ttl.as_secs().max(1);
        conn.set_ex::<_, _, ()>(key, value, seconds).await?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        let mut conn = self.connection.write().await;
        let exists: bool = conn.exists(key).await?;
        Ok(exists)
    }

    async fn ttl(&self, key: &str) -> StoreResult<i64> {
        let mut conn = self.connection.write().await;
        let ttl: i64 = conn.ttl(key).await?;
        Ok(ttl)
    }

    async fn flush_all(&self) -> StoreResult<()> {
        let mut conn = self.connection.write().await;
        redis::cmd("FLUSHDB").query_async::<()>(&mut *conn).await?;
        Ok(())
    }
}
