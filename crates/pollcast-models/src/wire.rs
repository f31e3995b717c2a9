//! JSON frames exchanged with live subscribers.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::results::ResultSnapshot;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoteUpdateOption {
    pub id: i64,
    pub text: String,
    pub votes: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoteUpdateData {
    pub poll_id: i64,
    pub options: Vec<VoteUpdateOption>,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerMessage {
    VoteUpdate { data: VoteUpdateData },
    ConnectSuccess { message: String },
    Ping { time: String },
    Pong { time: String },
}

impl ServerMessage {
    pub fn vote_update(snapshot: &ResultSnapshot) -> Self {
        ServerMessage::VoteUpdate {
            data: VoteUpdateData {
                poll_id: snapshot.poll_id,
                options: snapshot
                    .options
                    .iter()
                    .map(|o| VoteUpdateOption {
                        id: o.id,
                        text: o.text.clone(),
                        votes: o.votes,
                    })
                    .collect(),
                timestamp: snapshot.timestamp,
            },
        }
    }

    pub fn connect_success() -> Self {
        ServerMessage::ConnectSuccess {
            message: "connected, live updates will follow".to_string(),
        }
    }

    pub fn ping() -> Self {
        ServerMessage::Ping {
            time: Utc::now().to_rfc3339(),
        }
    }

    pub fn pong() -> Self {
        ServerMessage::Pong {
            time: Utc::now().to_rfc3339(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Control frames a subscriber may send. Anything unrecognised is ignored.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
    Ping {
        #[serde(default)]
        time: Option<String>,
    },
    Pong {
        #[serde(default)]
        time: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poll::PollOption;

    #[test]
    fn vote_update_matches_published_shape() {
        let snapshot = ResultSnapshot::from_options(
            7,
            &[PollOption {
                id: 1,
                poll_id: 7,
                text: "A".into(),
                votes: 2,
            }],
        );
        let value = serde_json::to_value(ServerMessage::vote_update(&snapshot)).unwrap();
        assert_eq!(value["type"], "VOTE_UPDATE");
        assert_eq!(value["data"]["poll_id"], 7);
        assert_eq!(value["data"]["options"][0]["votes"], 2);
        assert_eq!(value["data"]["options"][0]["text"], "A");
        assert!(value["data"]["options"][0].get("percentage").is_none());
        assert_eq!(value["data"]["timestamp"], snapshot.timestamp);
    }

    #[test]
    fn client_ping_tolerates_extra_fields() {
        let parsed: ClientMessage =
            serde_json::from_str(r#"{"type":"PING","time":"now","seq":3}"#).unwrap();
        assert!(matches!(parsed, ClientMessage::Ping { .. }));
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"HELLO"}"#).is_err());
    }
}
