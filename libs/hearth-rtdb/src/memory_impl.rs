//! In-memory realtime store implementation
//!
//! Uses DashMap for lock-free concurrent access. Intended for unit tests and
//! single-process embedded deployments where Redis is not available.

use crate::traits::Rtdb;
use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::{DashMap, DashSet};
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Poll interval for emulated blocking pops.
const BLPOP_POLL_MS: u64 = 20;

/// In-memory store with concurrent access support
pub struct MemoryRtdb {
    kv_store: Arc<DashMap<String, (Bytes, Option<Instant>)>>,
    set_store: Arc<DashMap<String, DashSet<String>>>,
    list_store: Arc<DashMap<String, RwLock<VecDeque<Bytes>>>>,
    stream_store: Arc<DashMap<String, RwLock<VecDeque<(u64, Bytes)>>>>,
    stream_seq: AtomicU64,
}

impl MemoryRtdb {
    /// Create a new empty in-memory store
    pub fn new() -> Self {
        Self {
            kv_store: Arc::new(DashMap::new()),
            set_store: Arc::new(DashMap::new()),
            list_store: Arc::new(DashMap::new()),
            stream_store: Arc::new(DashMap::new()),
            stream_seq: AtomicU64::new(0),
        }
    }

    /// Clear all data (useful for testing)
    pub fn clear(&self) {
        self.kv_store.clear();
        self.set_store.clear();
        self.list_store.clear();
        self.stream_store.clear();
    }

    /// Get statistics about stored data
    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            kv_count: self.kv_store.len(),
            set_count: self.set_store.len(),
            list_count: self.list_store.len(),
            stream_count: self.stream_store.len(),
        }
    }

    fn live_value(&self, key: &str) -> Option<Bytes> {
        let expired = match self.kv_store.get(key) {
            Some(entry) => match entry.value().1 {
                Some(deadline) => Instant::now() >= deadline,
                None => return Some(entry.value().0.clone()),
            },
            None => return None,
        };
        if expired {
            self.kv_store.remove(key);
            return None;
        }
        self.kv_store.get(key).map(|e| e.value().0.clone())
    }
}

impl Default for MemoryRtdb {
    fn default() -> Self {
        Self::new()
    }
}

/// Statistics about in-memory store usage
#[derive(Debug, Clone)]
pub struct MemoryStats {
    pub kv_count: usize,
    pub set_count: usize,
    pub list_count: usize,
    pub stream_count: usize,
}

/// Minimal glob matcher supporting `*` (any run of characters).
///
/// Matches Redis MATCH semantics closely enough for the key shapes the
/// engine scans (`device:*:rules`, `stream:device:*`).
fn pattern_matches(pattern: &str, key: &str) -> bool {
    if !pattern.contains('*') {
        return pattern == key;
    }
    let parts: Vec<&str> = pattern.split('*').collect();
    let mut pos = 0usize;
    let last = parts.len() - 1;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if i == 0 {
            if !key.starts_with(part) {
                return false;
            }
            pos = part.len();
        } else if i == last {
            let rest = &key[pos..];
            if !rest.ends_with(part) {
                return false;
            }
        } else {
            match key[pos..].find(part) {
                Some(idx) => pos += idx + part.len(),
                None => return false,
            }
        }
    }
    true
}

#[async_trait]
impl Rtdb for MemoryRtdb {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        Ok(self.live_value(key))
    }

    async fn set(&self, key: &str, value: Bytes) -> Result<()> {
        self.kv_store.insert(key.to_string(), (value, None));
        Ok(())
    }

    async fn set_ex(&self, key: &str, value: Bytes, ttl_seconds: u64) -> Result<()> {
        let deadline = Instant::now() + Duration::from_secs(ttl_seconds);
        self.kv_store
            .insert(key.to_string(), (value, Some(deadline)));
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<bool> {
        let kv = self.kv_store.remove(key).is_some();
        let set = self.set_store.remove(key).is_some();
        let list = self.list_store.remove(key).is_some();
        Ok(kv || set || list)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.live_value(key).is_some()
            || self.set_store.contains_key(key)
            || self.list_store.contains_key(key))
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool> {
        Ok(self
            .set_store
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string()))
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool> {
        let removed = match self.set_store.get(key) {
            Some(set) => set.remove(member).is_some(),
            None => false,
        };
        // Drop empty sets so scans behave like Redis
        if removed {
            if let Some(set) = self.set_store.get(key) {
                if set.is_empty() {
                    drop(set);
                    self.set_store.remove(key);
                }
            }
        }
        Ok(removed)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        Ok(self
            .set_store
            .get(key)
            .map(|set| set.iter().map(|m| m.clone()).collect())
            .unwrap_or_default())
    }

    async fn list_rpush(&self, key: &str, value: Bytes) -> Result<()> {
        self.list_store
            .entry(key.to_string())
            .or_default()
            .write()
            .push_back(value);
        Ok(())
    }

    async fn list_lpop(&self, key: &str) -> Result<Option<Bytes>> {
        Ok(self
            .list_store
            .get(key)
            .and_then(|list| list.write().pop_front()))
    }

    async fn list_blpop(
        &self,
        keys: &[&str],
        timeout_seconds: u64,
    ) -> Result<Option<(String, Bytes)>> {
        let deadline = (timeout_seconds > 0)
            .then(|| Instant::now() + Duration::from_secs(timeout_seconds));
        loop {
            for key in keys {
                if let Some(value) = self.list_lpop(key).await? {
                    return Ok(Some((key.to_string(), value)));
                }
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Ok(None);
                }
            }
            tokio::time::sleep(Duration::from_millis(BLPOP_POLL_MS)).await;
        }
    }

    async fn list_len(&self, key: &str) -> Result<usize> {
        Ok(self.list_store.get(key).map(|l| l.read().len()).unwrap_or(0))
    }

    async fn stream_add(&self, key: &str, value: Bytes, maxlen: usize) -> Result<String> {
        let id = self.stream_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let stream = self.stream_store.entry(key.to_string()).or_default();
        let mut entries = stream.write();
        entries.push_back((id, value));
        while entries.len() > maxlen {
            entries.pop_front();
        }
        Ok(id.to_string())
    }

    async fn stream_last(&self, key: &str) -> Result<Option<(String, Bytes)>> {
        Ok(self.stream_store.get(key).and_then(|stream| {
            stream
                .read()
                .back()
                .map(|(id, value)| (id.to_string(), value.clone()))
        }))
    }

    async fn stream_clear(&self, key: &str) -> Result<bool> {
        Ok(self.stream_store.remove(key).is_some())
    }

    async fn scan_match(&self, pattern: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        for entry in self.kv_store.iter() {
            if pattern_matches(pattern, entry.key()) {
                keys.push(entry.key().clone());
            }
        }
        for entry in self.set_store.iter() {
            if pattern_matches(pattern, entry.key()) {
                keys.push(entry.key().clone());
            }
        }
        for entry in self.list_store.iter() {
            if pattern_matches(pattern, entry.key()) {
                keys.push(entry.key().clone());
            }
        }
        for entry in self.stream_store.iter() {
            if pattern_matches(pattern, entry.key()) {
                keys.push(entry.key().clone());
            }
        }
        Ok(keys)
    }
}
