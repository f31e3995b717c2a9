use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Whether a poll accepts exactly one option per submission or several.
///
/// Serialized as the integer `poll_type` used by existing clients
/// (`0` = single choice, `1` = multi choice).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "i16", try_from = "i16")]
pub enum PollKind {
    SingleChoice,
    MultiChoice,
}

#[derive(Debug, Error)]
#[error("unknown poll type {0}")]
pub struct UnknownPollKind(pub i16);

impl From<PollKind> for i16 {
    fn from(kind: PollKind) -> Self {
        match kind {
            PollKind::SingleChoice => 0,
            PollKind::MultiChoice => 1,
        }
    }
}

impl TryFrom<i16> for PollKind {
    type Error = UnknownPollKind;

    fn try_from(value: i16) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PollKind::SingleChoice),
            1 => Ok(PollKind::MultiChoice),
            other => Err(UnknownPollKind(other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Poll {
    pub id: i64,
    pub question: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "poll_type")]
    pub kind: PollKind,
    pub is_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    /// Options in presentation order.
    pub options: Vec<PollOption>,
}

impl Poll {
    /// A poll is closed when it was deactivated or its end time has passed.
    pub fn is_closed_at(&self, now: DateTime<Utc>) -> bool {
        if !self.is_active {
            return true;
        }
        matches!(self.end_time, Some(end) if end <= now)
    }

    pub fn is_closed(&self) -> bool {
        self.is_closed_at(Utc::now())
    }

    pub fn option(&self, option_id: i64) -> Option<&PollOption> {
        self.options.iter().find(|o| o.id == option_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollOption {
    pub id: i64,
    pub poll_id: i64,
    pub text: String,
    pub votes: i64,
}
