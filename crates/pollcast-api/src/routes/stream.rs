use axum::{
    extract::{Path, State},
    response::sse::{Event, KeepAlive, Sse},
};
use futures_util::stream::{self, Stream, StreamExt};
use pollcast_core::Services;
use std::convert::Infallible;
use std::time::Duration;

use crate::error::ApiError;

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Server-sent events for one poll: a `results` event with the current
/// tallies, then one `vote_update` event per broadcast.
pub async fn stream_results(
    State(services): State<Services>,
    Path(poll_id): Path<i64>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let results = services.polls.current_results(poll_id).await?;
    let subscription = services
        .hub
        .subscribe(poll_id, true)
        .map_err(|err| ApiError::ServiceUnavailable(err.to_string()))?;
    let initial = Event::default()
        .event("results")
        .json_data(&results)
        .map_err(|err| ApiError::Internal(err.into()))?;

    tracing::debug!(poll_id, subscriber = subscription.id(), "event stream opened");
    let updates = stream::unfold(subscription, |mut subscription| async move {
        let payload = subscription.recv().await?;
        subscription.touch();
        let event = Event::default().event("vote_update").data(payload);
        Some((Ok::<_, Infallible>(event), subscription))
    });

    let events = stream::once(async move { Ok::<_, Infallible>(initial) }).chain(updates);
    Ok(Sse::new(events).keep_alive(KeepAlive::new().interval(KEEP_ALIVE_INTERVAL)))
}
