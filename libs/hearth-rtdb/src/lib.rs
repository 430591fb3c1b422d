//! Hearth realtime store abstraction
//!
//! Shared storage layer for Hearth services: a small trait over the handful
//! of Redis shapes the automation core needs (key-value with TTL, sets,
//! lists, bounded streams), plus an injectable clock.
//!
//! # Key Components
//!
//! - **Rtdb trait**: storage operations, backend-agnostic
//! - **RedisRtdb**: production Redis backend (behind `redis-backend`, default)
//! - **MemoryRtdb**: in-memory backend for tests and embedded use
//! - **TimeProvider**: wall-clock injection for deterministic tests

pub mod traits;

#[cfg(feature = "redis-backend")]
pub mod redis_impl;

pub mod memory_impl;

pub mod time;

// Re-exports
pub use bytes::Bytes;
pub use traits::Rtdb;

#[cfg(feature = "redis-backend")]
pub use redis_impl::RedisRtdb;

pub use memory_impl::{MemoryRtdb, MemoryStats};

pub use time::{FixedTimeProvider, SystemTimeProvider, TimeProvider};

/// Helper functions for common operations
pub mod helpers {
    use super::{MemoryRtdb, Rtdb};
    use std::sync::Arc;

    /// Create an in-memory store for unit testing
    ///
    /// No external services required; suitable for tests that should not
    /// depend on a running Redis.
    pub fn create_test_rtdb() -> Arc<dyn Rtdb> {
        Arc::new(MemoryRtdb::new())
    }
}
