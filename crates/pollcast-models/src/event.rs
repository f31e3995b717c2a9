use chrono::Utc;
use serde::{Deserialize, Serialize};

/// A single vote travelling through the ingestion queue.
///
/// The serialized form is the queue payload; `message_id` is the dedup and
/// retry-tracking key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteEvent {
    pub poll_id: i64,
    pub option_id: i64,
    /// Unix epoch milliseconds at submission.
    pub created_at: i64,
    pub message_id: String,
}

impl VoteEvent {
    pub fn new(poll_id: i64, option_id: i64, message_id: impl Into<String>) -> Self {
        Self {
            poll_id,
            option_id,
            created_at: Utc::now().timestamp_millis(),
            message_id: message_id.into(),
        }
    }

    pub fn to_payload(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_payload(payload: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(payload)
    }
}
