//! Redis `Kv` backend.
//!
//! One `ConnectionManager` shared by all clones; reconnects are
//! handled inside the manager.

use crate::error::Result;
use crate::kv::Kv;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::info;

#[derive(Clone)]
pub struct RedisKv {
    manager: ConnectionManager,
}

impl RedisKv {
    /// Connect to the KV store and verify the connection with a PING.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let mut manager = client.get_connection_manager().await?;
        let _: String = redis::cmd("PING").query_async(&mut manager).await?;
        info!("Connected to coordination store");
        Ok(Self { manager })
    }

    fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }
}

#[async_trait]
impl Kv for RedisKv {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.conn().get(key).await?)
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.conn().set::<_, _, ()>(key, value).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.conn().del::<_, ()>(key).await?;
        Ok(())
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<()> {
        self.conn().expire::<_, ()>(key, ttl_secs as i64).await?;
        Ok(())
    }

    async fn push_back(&self, key: &str, value: &str) -> Result<()> {
        self.conn().rpush::<_, _, ()>(key, value).await?;
        Ok(())
    }

    async fn pop_front(&self, key: &str) -> Result<Option<String>> {
        Ok(self.conn().lpop(key, None).await?)
    }

    async fn list_len(&self, key: &str) -> Result<u64> {
        Ok(self.conn().llen(key).await?)
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()> {
        self.conn().zadd::<_, _, _, ()>(key, member, score).await?;
        Ok(())
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<()> {
        self.conn().zrem::<_, _, ()>(key, member).await?;
        Ok(())
    }

    async fn zcard(&self, key: &str) -> Result<u64> {
        Ok(self.conn().zcard(key).await?)
    }

    async fn zrange_withscores(&self, key: &str) -> Result<Vec<(String, f64)>> {
        Ok(self.conn().zrange_withscores(key, 0, -1).await?)
    }

    async fn zrangebyscore(&self, key: &str, max: f64) -> Result<Vec<String>> {
        Ok(self.conn().zrangebyscore(key, "-inf", max).await?)
    }

    async fn zremrangebyscore(&self, key: &str, max: f64) -> Result<()> {
        self.conn()
            .zrembyscore::<_, _, _, ()>(key, "-inf", max)
            .await?;
        Ok(())
    }
}
