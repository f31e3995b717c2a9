use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use pollcast_core::{CreatePoll, Services};
use pollcast_models::{Poll, PollKind, ResultSnapshot};
use serde::Deserialize;

use crate::error::ApiError;

#[derive(Deserialize)]
pub struct ListQuery {
    #[serde(default = "default_page_size")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_page_size() -> i64 {
    20
}

pub async fn list_polls(
    State(services): State<Services>,
    Query(page): Query<ListQuery>,
) -> Result<Json<Vec<Poll>>, ApiError> {
    Ok(Json(services.polls.list_polls(page.limit, page.offset).await?))
}

#[derive(Deserialize)]
pub struct CreatePollRequest {
    pub question: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub poll_type: i16,
    pub end_time: Option<DateTime<Utc>>,
    pub options: Vec<String>,
}

pub async fn create_poll(
    State(services): State<Services>,
    Json(body): Json<CreatePollRequest>,
) -> Result<(StatusCode, Json<Poll>), ApiError> {
    let kind = PollKind::try_from(body.poll_type)
        .map_err(|err| ApiError::BadRequest(err.to_string()))?;

    let poll = services
        .polls
        .create_poll(CreatePoll {
            question: body.question,
            description: body.description,
            kind,
            end_time: body.end_time,
            options: body.options,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(poll)))
}

pub async fn get_poll(
    State(services): State<Services>,
    Path(poll_id): Path<i64>,
) -> Result<Json<Poll>, ApiError> {
    Ok(Json(services.polls.get_poll(poll_id).await?))
}

pub async fn get_results(
    State(services): State<Services>,
    Path(poll_id): Path<i64>,
) -> Result<Json<ResultSnapshot>, ApiError> {
    Ok(Json(services.polls.current_results(poll_id).await?))
}

pub async fn reset_votes(
    State(services): State<Services>,
    Path(poll_id): Path<i64>,
) -> Result<Json<ResultSnapshot>, ApiError> {
    Ok(Json(services.polls.reset_votes(poll_id).await?))
}
