use axum::{extract::State, Json};
use pollcast_core::Services;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::ApiError;

const MAX_PATTERNS: usize = 50;

pub async fn queue_stats(State(services): State<Services>) -> Result<Json<Value>, ApiError> {
    let queue = services.queue_stats().await?;
    Ok(Json(json!({
        "queue": queue,
        "subscribers": services.hub.subscriber_count(None),
        "metrics": services.metrics_snapshot(),
    })))
}

pub async fn retry_dead_letters(State(services): State<Services>) -> Result<Json<Value>, ApiError> {
    let requeued = services.retry_dead_letters().await?;
    tracing::info!(requeued, "dead letters requeued by operator");
    Ok(Json(json!({ "requeued": requeued })))
}

#[derive(Deserialize)]
pub struct InvalidateRequest {
    pub patterns: Vec<String>,
}

pub async fn invalidate_cache(
    State(services): State<Services>,
    Json(body): Json<InvalidateRequest>,
) -> Result<Json<Value>, ApiError> {
    let patterns: Vec<String> = body
        .patterns
        .into_iter()
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect();
    if patterns.is_empty() || patterns.len() > MAX_PATTERNS {
        return Err(ApiError::BadRequest(format!(
            "between 1 and {MAX_PATTERNS} patterns are required"
        )));
    }

    let deleted = services.invalidate_patterns(&patterns).await?;
    tracing::info!(deleted, patterns = patterns.len(), "cache invalidated by operator");
    Ok(Json(json!({ "deleted": deleted })))
}
