//! Backing-store abstraction
//!
//! The library speaks a small subset of the Redis command set. Anything
//! implementing [`QueueStore`] can back a connection; the crate ships a
//! redis-rs implementation and an in-process one for tests and embedded use.

mod memory;
mod redis_store;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreResult;

/// The store command surface the queue machinery relies on.
///
/// Mutual exclusion across processes comes entirely from the atomicity of
/// these individual commands; implementations must keep each call atomic.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Push a value onto the head of a list; returns the new length
    async fn lpush(&self, key: &str, value: &str) -> StoreResult<i64>;

    /// Atomically pop the tail of `source` and push it onto the head of
    /// `destination`; returns the moved value, or None when empty
    async fn rpoplpush(&self, source: &str, destination: &str) -> StoreResult<Option<String>>;

    /// Remove up to `count` occurrences of `value` (head-first for positive
    /// counts); returns the number removed
    async fn lrem(&self, key: &str, count: i64, value: &str) -> StoreResult<i64>;

    /// List length; zero for a missing key
    async fn llen(&self, key: &str) -> StoreResult<i64>;

    /// List slice with Redis index semantics (negative indices count from
    /// the tail)
    async fn lrange(&self, key: &str, start: i64, stop: i64) -> StoreResult<Vec<String>>;

    /// Delete a key; returns 1 when it existed
    async fn del(&self, key: &str) -> StoreResult<i64>;

    /// Add a member to a set; returns true when it was not already present
    async fn sadd(&self, key: &str, member: &str) -> StoreResult<bool>;

    /// Remove a member from a set; returns true when it was present
    async fn srem(&self, key: &str, member: &str) -> StoreResult<bool>;

    /// All members of a set; empty for a missing key
    async fn smembers(&self, key: &str) -> StoreResult<Vec<String>>;

    /// Set cardinality; zero for a missing key
    async fn scard(&self, key: &str) -> StoreResult<i64>;

    /// Set a string value with an expiry
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()>;

    /// Whether a key exists (expired keys count as absent)
    async fn exists(&self, key: &str) -> StoreResult<bool>;

    /// Remaining TTL in seconds; -1 without expiry, -2 for a missing key
    async fn ttl(&self, key: &str) -> StoreResult<i64>;

    /// Drop all keys. Test support; never called by the core machinery.
    async fn flush_all(&self) -> StoreResult<()>;
}
