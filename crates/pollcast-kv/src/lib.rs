//! Shared key/value backing store used by the cache, lock service, membership
//! filter and vote queue.
//!
//! Every mutating operation is a single atomic primitive of the store. Callers
//! never read-modify-write keys from the application side.

mod glob;
mod memory;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub use glob::glob_match;
pub use memory::MemoryKv;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KvError {
    #[error("backing store unavailable")]
    Unavailable,
    #[error("key {0} holds a value of another type")]
    WrongType(String),
    #[error("value of field {0} is not an integer")]
    NotAnInteger(String),
}

pub type SharedKv = Arc<dyn KvStore>;

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError>;

    /// Unconditional set; `ttl = None` keeps the key until deleted.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), KvError>;

    /// Set only when the key is absent. Returns whether the value was written.
    async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>)
        -> Result<bool, KvError>;

    /// Delete keys, returning how many existed.
    async fn del(&self, keys: &[String]) -> Result<u64, KvError>;

    /// Delete `key` only when it still holds `expected`.
    async fn del_if_eq(&self, key: &str, expected: &str) -> Result<bool, KvError>;

    /// Keys matching a glob pattern (`*`, `?`).
    async fn keys(&self, pattern: &str) -> Result<Vec<String>, KvError>;

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, KvError>;

    /// Set every listed bit of a bitset to 1.
    async fn set_bits(&self, key: &str, offsets: &[u64]) -> Result<(), KvError>;

    /// Read the listed bits of a bitset; a missing key reads as all zeros.
    async fn get_bits(&self, key: &str, offsets: &[u64]) -> Result<Vec<bool>, KvError>;

    /// Add a set member. Returns `false` when it was already present.
    async fn sadd(&self, key: &str, member: &str) -> Result<bool, KvError>;

    async fn srem(&self, key: &str, member: &str) -> Result<bool, KvError>;

    async fn sismember(&self, key: &str, member: &str) -> Result<bool, KvError>;

    /// Push to the head of a list, returning the new length.
    async fn lpush(&self, key: &str, value: &str) -> Result<u64, KvError>;

    /// Atomically pop the tail of `src` and push it to the head of `dst`.
    async fn rpoplpush(&self, src: &str, dst: &str) -> Result<Option<String>, KvError>;

    /// Atomically remove one occurrence of `value` from `src` and push it to
    /// the head of `dst`. Returns `false` if `src` did not contain it.
    async fn lmove_value(&self, src: &str, dst: &str, value: &str) -> Result<bool, KvError>;

    /// Remove one occurrence of `value`.
    async fn lrem(&self, key: &str, value: &str) -> Result<bool, KvError>;

    /// Whole list, head first.
    async fn lrange(&self, key: &str) -> Result<Vec<String>, KvError>;

    async fn llen(&self, key: &str) -> Result<u64, KvError>;

    async fn hincr(&self, key: &str, field: &str, by: i64) -> Result<i64, KvError>;

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), KvError>;

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, KvError>;

    async fn hdel(&self, key: &str, field: &str) -> Result<bool, KvError>;
}
