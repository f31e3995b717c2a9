pub mod error;
pub mod middleware;
pub mod routes;

use axum::{
    routing::{get, post},
    Router,
};
use pollcast_core::Services;
use tower_http::trace::TraceLayer;

pub use error::ApiError;

/// JSON API and the server-sent events transport.
pub fn router(services: Services) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route(
            "/api/polls",
            get(routes::polls::list_polls).post(routes::polls::create_poll),
        )
        .route("/api/polls/{poll_id}", get(routes::polls::get_poll))
        .route("/api/polls/{poll_id}/results", get(routes::polls::get_results))
        .route("/api/polls/{poll_id}/vote", post(routes::votes::submit_vote))
        .route("/api/polls/{poll_id}/reset", post(routes::polls::reset_votes))
        .route("/api/polls/{poll_id}/stream", get(routes::stream::stream_results))
        .route("/api/hc/poll/{poll_id}/exists", get(routes::hc::poll_exists))
        .route("/api/hc/poll/{poll_id}/hot", get(routes::hc::hot_poll))
        .route("/api/admin/queue/stats", get(routes::admin::queue_stats))
        .route(
            "/api/admin/queue/retry-dead-letters",
            post(routes::admin::retry_dead_letters),
        )
        .route(
            "/api/admin/cache/invalidate",
            post(routes::admin::invalidate_cache),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(services)
}
