pub mod bloom;
pub mod lock;
pub mod store;

use pollcast_kv::KvError;
use thiserror::Error;

pub use bloom::BloomFilter;
pub use lock::{LockConfig, LockError, LockHandle, LockService};
pub use store::{CacheConfig, CacheStore, PrewarmReport, NEGATIVE_MARKER};

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache store error: {0}")]
    Store(#[from] KvError),
    #[error("cache serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
