//! The minimal KV contract Graphloom coordination needs: FIFO lists
//! for queues, sorted sets for delayed items and rate windows, and
//! expiring string values for broker job records.

use crate::error::Result;
use async_trait::async_trait;

#[async_trait]
pub trait Kv: Send + Sync {
    // Plain values -----------------------------------------------------------

    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
    /// Set a time-to-live on an existing key. No-op if the key is gone.
    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<()>;

    // FIFO lists -------------------------------------------------------------

    async fn push_back(&self, key: &str, value: &str) -> Result<()>;
    async fn pop_front(&self, key: &str) -> Result<Option<String>>;
    async fn list_len(&self, key: &str) -> Result<u64>;

    // Sorted sets ------------------------------------------------------------

    /// Insert or update a member with the given score.
    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()>;
    async fn zrem(&self, key: &str, member: &str) -> Result<()>;
    async fn zcard(&self, key: &str) -> Result<u64>;
    /// All members with their scores, ascending by score.
    async fn zrange_withscores(&self, key: &str) -> Result<Vec<(String, f64)>>;
    /// Members with score ≤ `max`, ascending by score.
    async fn zrangebyscore(&self, key: &str, max: f64) -> Result<Vec<String>>;
    /// Remove members with score ≤ `max`.
    async fn zremrangebyscore(&self, key: &str, max: f64) -> Result<()>;
}
