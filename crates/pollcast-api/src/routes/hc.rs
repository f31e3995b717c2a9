//! Cache-path checks: the membership filter and the cached poll read.

use axum::{
    extract::{Path, State},
    Json,
};
use pollcast_core::Services;
use serde_json::{json, Value};

use crate::error::ApiError;

pub async fn poll_exists(
    State(services): State<Services>,
    Path(poll_id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    if !services.polls.may_exist(poll_id).await {
        return Err(ApiError::NotFound(format!("poll {poll_id} not found")));
    }
    Ok(Json(json!({ "poll_id": poll_id, "exists": true })))
}

pub async fn hot_poll(
    State(services): State<Services>,
    Path(poll_id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    let poll = services.polls.get_poll(poll_id).await?;
    Ok(Json(json!({ "data": poll })))
}
