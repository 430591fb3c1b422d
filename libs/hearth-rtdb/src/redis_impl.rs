//! Redis implementation of the realtime store

use crate::traits::Rtdb;
use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamMaxlen, StreamRangeReply};
use redis::AsyncCommands;

/// Redis-backed realtime store
///
/// Connections are multiplexed and acquired per operation; the underlying
/// client reconnects transparently, so a broker hiccup surfaces as one
/// failed call rather than a poisoned handle.
pub struct RedisRtdb {
    client: redis::Client,
}

impl RedisRtdb {
    /// Create a new Redis store from a connection URL
    pub fn new(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).context("Invalid Redis URL")?;
        Ok(Self { client })
    }

    async fn conn(&self) -> Result<MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .context("Failed to acquire Redis connection")
    }
}

#[async_trait]
impl Rtdb for RedisRtdb {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let mut conn = self.conn().await?;
        let value: Option<Vec<u8>> = conn.get(key).await?;
        Ok(value.map(Bytes::from))
    }

    async fn set(&self, key: &str, value: Bytes) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: () = conn.set(key, value.as_ref()).await?;
        Ok(())
    }

    async fn set_ex(&self, key: &str, value: Bytes, ttl_seconds: u64) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: () = conn.set_ex(key, value.as_ref(), ttl_seconds).await?;
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn().await?;
        let count: usize = conn.del(key).await?;
        Ok(count > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn().await?;
        Ok(conn.exists(key).await?)
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.conn().await?;
        let added: usize = conn.sadd(key, member).await?;
        Ok(added > 0)
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.conn().await?;
        let removed: usize = conn.srem(key, member).await?;
        Ok(removed > 0)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.conn().await?;
        Ok(conn.smembers(key).await?)
    }

    async fn list_rpush(&self, key: &str, value: Bytes) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: () = conn.rpush(key, value.as_ref()).await?;
        Ok(())
    }

    async fn list_lpop(&self, key: &str) -> Result<Option<Bytes>> {
        let mut conn = self.conn().await?;
        let value: Option<Vec<u8>> = conn.lpop(key, None).await?;
        Ok(value.map(Bytes::from))
    }

    async fn list_blpop(
        &self,
        keys: &[&str],
        timeout_seconds: u64,
    ) -> Result<Option<(String, Bytes)>> {
        let mut conn = self.conn().await?;
        let popped: Option<(String, Vec<u8>)> =
            conn.blpop(keys, timeout_seconds as f64).await?;
        Ok(popped.map(|(key, value)| (key, Bytes::from(value))))
    }

    async fn list_len(&self, key: &str) -> Result<usize> {
        let mut conn = self.conn().await?;
        Ok(conn.llen(key).await?)
    }

    async fn stream_add(&self, key: &str, value: Bytes, maxlen: usize) -> Result<String> {
        let mut conn = self.conn().await?;
        let id: String = conn
            .xadd_maxlen(
                key,
                StreamMaxlen::Approx(maxlen),
                "*",
                &[("payload", value.as_ref())],
            )
            .await?;
        Ok(id)
    }

    async fn stream_last(&self, key: &str) -> Result<Option<(String, Bytes)>> {
        let mut conn = self.conn().await?;
        let reply: StreamRangeReply = conn.xrevrange_count(key, "+", "-", 1).await?;
        let Some(entry) = reply.ids.into_iter().next() else {
            return Ok(None);
        };
        let payload = match entry.map.get("payload") {
            Some(value) => redis::from_redis_value::<Vec<u8>>(value)
                .context("Malformed stream payload field")?,
            None => Vec::new(),
        };
        Ok(Some((entry.id, Bytes::from(payload))))
    }

    async fn stream_clear(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn().await?;
        let count: usize = conn.del(key).await?;
        Ok(count > 0)
    }

    async fn scan_match(&self, pattern: &str) -> Result<Vec<String>> {
        let mut conn = self.conn().await?;
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Ok(keys)
    }
}
