use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::poll::PollOption;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptionTally {
    pub id: i64,
    pub text: String,
    pub votes: i64,
    pub percentage: f64,
}

/// The one canonical shape every producer of tallies builds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultSnapshot {
    pub poll_id: i64,
    pub options: Vec<OptionTally>,
    pub total_votes: i64,
    /// Unix epoch milliseconds when the snapshot was taken.
    pub timestamp: i64,
}

impl ResultSnapshot {
    /// Build a snapshot from options in presentation order.
    pub fn from_options(poll_id: i64, options: &[PollOption]) -> Self {
        let total_votes: i64 = options.iter().map(|o| o.votes).sum();
        let options = options
            .iter()
            .map(|o| OptionTally {
                id: o.id,
                text: o.text.clone(),
                votes: o.votes,
                percentage: percentage(o.votes, total_votes),
            })
            .collect();
        Self {
            poll_id,
            options,
            total_votes,
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    pub fn votes_for(&self, option_id: i64) -> Option<i64> {
        self.options
            .iter()
            .find(|o| o.id == option_id)
            .map(|o| o.votes)
    }
}

fn percentage(votes: i64, total: i64) -> f64 {
    if total <= 0 {
        return 0.0;
    }
    votes as f64 / total as f64 * 100.0
}
