//! Shared history storage.
//!
//! A throttle's only side effect is reading and writing per-identity request
//! histories through a [`HistoryStore`]. The store is constructed by the
//! hosting application at startup and handed to every throttle that should
//! share state; nothing here opens connections behind the caller's back.

mod memory;
mod redis;

pub use self::memory::MemoryHistoryStore;
pub use self::redis::RedisHistoryStore;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by history store backends.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Redis connection or command failure
    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    /// The backend does not implement an optional operation
    #[error("Operation not supported by this store: {0}")]
    Unsupported(&'static str),
}

/// Key/value contract for request histories.
///
/// Values are request timestamps (seconds since the Unix epoch), newest first.
/// A missing, expired or unreadable key reads as an empty history.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Fetch the history stored under `key`.
    async fn get(&self, key: &str) -> Result<Vec<f64>, StoreError>;

    /// Replace the history under `key`. The key expires after `ttl` unless
    /// written again.
    async fn set(&self, key: &str, history: &[f64], ttl: Duration) -> Result<(), StoreError>;

    /// Replace the history under `key` only if it still equals `expected`
    /// (an absent key equals the empty history).
    ///
    /// Returns `Ok(false)` when another writer got there first.
    async fn compare_and_set(
        &self,
        _key: &str,
        _expected: &[f64],
        _history: &[f64],
        _ttl: Duration,
    ) -> Result<bool, StoreError> {
        Err(StoreError::Unsupported("compare_and_set"))
    }
}
