//! Trait definition for the realtime store abstraction

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;

/// Unified realtime store interface for Hearth services.
///
/// Covers the operations the automation core relies on:
/// - Plain key-value with optional expiry (device-state cache, memo entries)
/// - Sets (device→rule index)
/// - Lists (durable task queues)
/// - Bounded streams (per-device debounce buffers)
///
/// Implementations:
/// - `RedisRtdb`: production Redis backend
/// - `MemoryRtdb`: in-memory backend for tests and embedded use
#[async_trait]
pub trait Rtdb: Send + Sync + 'static {
    // ========== Key-Value Operations ==========

    /// Get value by key
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Set value for key
    async fn set(&self, key: &str, value: Bytes) -> Result<()>;

    /// Set value for key with a time-to-live in seconds (Redis SETEX)
    async fn set_ex(&self, key: &str, value: Bytes, ttl_seconds: u64) -> Result<()>;

    /// Delete key
    ///
    /// Returns true if the key existed.
    async fn del(&self, key: &str) -> Result<bool>;

    /// Check if key exists
    async fn exists(&self, key: &str) -> Result<bool>;

    // ========== Set Operations ==========

    /// Add member to set (Redis SADD)
    ///
    /// Returns true if the member was added, false if it already existed.
    async fn sadd(&self, key: &str, member: &str) -> Result<bool>;

    /// Remove member from set (Redis SREM)
    ///
    /// Returns true if the member was removed, false if it didn't exist.
    async fn srem(&self, key: &str, member: &str) -> Result<bool>;

    /// Get all members of a set (Redis SMEMBERS)
    async fn smembers(&self, key: &str) -> Result<Vec<String>>;

    // ========== List Operations ==========

    /// Push value to the right of a list (Redis RPUSH)
    async fn list_rpush(&self, key: &str, value: Bytes) -> Result<()>;

    /// Pop value from the left of a list (Redis LPOP)
    async fn list_lpop(&self, key: &str) -> Result<Option<Bytes>>;

    /// Block and pop a value from one of the given lists (Redis BLPOP)
    ///
    /// # Arguments
    /// * `keys` - List keys to wait on
    /// * `timeout_seconds` - Timeout in seconds (0 = block indefinitely)
    ///
    /// # Returns
    /// * `Some((key, value))` - The list that had data and the popped value
    /// * `None` - Timeout expired without data
    async fn list_blpop(&self, keys: &[&str], timeout_seconds: u64)
        -> Result<Option<(String, Bytes)>>;

    /// Get list length (Redis LLEN)
    async fn list_len(&self, key: &str) -> Result<usize>;

    // ========== Stream Operations ==========

    /// Append an entry to a bounded stream (Redis XADD with MAXLEN ~)
    ///
    /// Entry IDs are backend-assigned, opaque, and monotonic per stream.
    /// Returns the ID of the appended entry.
    async fn stream_add(&self, key: &str, value: Bytes, maxlen: usize) -> Result<String>;

    /// Read the newest entry of a stream, if any (Redis XREVRANGE + - COUNT 1)
    async fn stream_last(&self, key: &str) -> Result<Option<(String, Bytes)>>;

    /// Drop a stream and everything buffered in it
    ///
    /// Returns true if the stream existed.
    async fn stream_clear(&self, key: &str) -> Result<bool>;

    // ========== Key Scanning ==========

    /// Scan keys matching a glob pattern (Redis SCAN with MATCH)
    ///
    /// Spans all data types. Intended for maintenance paths (index rebuilds,
    /// stream discovery), not hot loops.
    async fn scan_match(&self, pattern: &str) -> Result<Vec<String>>;
}
