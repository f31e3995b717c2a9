use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use pollcast_core::{Services, VoteAccepted, VoteRequest};
use serde::Deserialize;

use crate::error::ApiError;
use crate::middleware::ClientAddr;

/// Either `option_id` or `option_ids` (or both) may be given.
#[derive(Deserialize)]
pub struct VoteBody {
    pub option_id: Option<i64>,
    #[serde(default)]
    pub option_ids: Vec<i64>,
    pub message_id: Option<String>,
}

impl VoteBody {
    fn into_option_ids(self) -> Vec<i64> {
        let mut ids = self.option_ids;
        if let Some(id) = self.option_id {
            ids.insert(0, id);
        }
        ids
    }
}

/// Accepts the vote for asynchronous application and answers with the
/// tallies as they stand.
pub async fn submit_vote(
    State(services): State<Services>,
    ClientAddr(submitter): ClientAddr,
    Path(poll_id): Path<i64>,
    Json(body): Json<VoteBody>,
) -> Result<(StatusCode, Json<VoteAccepted>), ApiError> {
    let idempotency_key = body.message_id.clone();
    let accepted = services
        .votes
        .submit(VoteRequest {
            poll_id,
            option_ids: body.into_option_ids(),
            idempotency_key,
            submitter,
        })
        .await?;
    Ok((StatusCode::ACCEPTED, Json(accepted)))
}

#[cfg(test)]
mod tests {
    use super::VoteBody;

    #[test]
    fn single_and_list_forms_merge() {
        let body: VoteBody = serde_json::from_str(r#"{"option_id": 3}"#).unwrap();
        assert_eq!(body.into_option_ids(), vec![3]);

        let body: VoteBody =
            serde_json::from_str(r#"{"option_id": 3, "option_ids": [4, 5]}"#).unwrap();
        assert_eq!(body.into_option_ids(), vec![3, 4, 5]);

        let body: VoteBody = serde_json::from_str("{}").unwrap();
        assert!(body.into_option_ids().is_empty());
    }
}
