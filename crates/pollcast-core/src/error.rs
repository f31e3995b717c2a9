use pollcast_cache::{CacheError, LockError};
use pollcast_db::DbError;
use pollcast_kv::KvError;
use pollcast_mq::QueueError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("poll {0} not found")]
    NotFound(i64),
    #[error("poll {0} is closed")]
    Closed(i64),
    #[error("option {option_id} does not belong to poll {poll_id}")]
    InvalidOption { poll_id: i64, option_id: i64 },
    #[error("{0}")]
    Validation(String),
    #[error("already voted in this poll")]
    DuplicateSubmission,
    #[error("too many votes, slow down")]
    RateLimited,
    #[error("resource busy, try again shortly")]
    Contention,
    #[error("backing service unavailable: {0}")]
    Unavailable(String),
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Transient failures may succeed on retry; everything else is a
    /// definitive rejection.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CoreError::Contention | CoreError::Unavailable(_) | CoreError::Database(_)
        )
    }
}

impl From<KvError> for CoreError {
    fn from(err: KvError) -> Self {
        CoreError::Unavailable(err.to_string())
    }
}

impl From<CacheError> for CoreError {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::Store(err) => err.into(),
            CacheError::Serialization(err) => CoreError::Internal(err.to_string()),
        }
    }
}

impl From<LockError> for CoreError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::NotAcquired(_) => CoreError::Contention,
            LockError::Store(err) => err.into(),
            LockError::Cancelled => CoreError::Unavailable("operation cancelled".into()),
        }
    }
}

impl From<QueueError> for CoreError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::Store(err) => err.into(),
            QueueError::Payload(err) => CoreError::Internal(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contention_and_outages_are_transient_but_business_errors_are_not() {
        assert!(CoreError::from(LockError::NotAcquired("x".into())).is_transient());
        assert!(CoreError::from(KvError::Unavailable).is_transient());
        assert!(!CoreError::Closed(1).is_transient());
        assert!(!CoreError::DuplicateSubmission.is_transient());
        assert!(!CoreError::Validation("bad".into()).is_transient());
    }
}
