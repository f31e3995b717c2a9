mod session;

use axum::{
    extract::{ws::WebSocketUpgrade, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Router,
};
use pollcast_core::LiveHub;
use std::collections::HashMap;

const MAX_CLIENT_MESSAGE: usize = 4 * 1024;

/// WebSocket endpoint streaming `VOTE_UPDATE` frames for one poll.
pub fn router(hub: LiveHub) -> Router {
    Router::new()
        .route("/ws/polls/{poll_id}", get(ws_upgrade))
        .with_state(hub)
}

fn wants_keepalive(params: &HashMap<String, String>) -> bool {
    params
        .get("keepalive")
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false)
}

async fn ws_upgrade(
    State(hub): State<LiveHub>,
    Path(poll_id): Path<i64>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let keepalive = wants_keepalive(&params);

    // Registered before the upgrade so a full hub is refused with a status
    // the client can see.
    let subscription = match hub.subscribe(poll_id, keepalive) {
        Ok(subscription) => subscription,
        Err(err) => {
            tracing::warn!(poll_id, error = %err, "websocket subscription refused");
            return (StatusCode::SERVICE_UNAVAILABLE, err.to_string()).into_response();
        }
    };

    ws.max_message_size(MAX_CLIENT_MESSAGE)
        .max_frame_size(MAX_CLIENT_MESSAGE)
        .on_upgrade(move |socket| session::run(socket, subscription))
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use pollcast_core::{HubConfig, LivenessPolicy, Metrics};
    use pollcast_models::{PollOption, ResultSnapshot};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_tungstenite::tungstenite::Message;

    async fn serve(config: HubConfig) -> (LiveHub, String) {
        let hub = LiveHub::new(config, Arc::new(Metrics::default()));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(hub.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (hub, format!("ws://{addr}"))
    }

    fn snapshot(poll_id: i64) -> ResultSnapshot {
        ResultSnapshot::from_options(
            poll_id,
            &[PollOption {
                id: 1,
                poll_id,
                text: "A".into(),
                votes: 4,
            }],
        )
    }

    async fn next_json<S>(stream: &mut S) -> serde_json::Value
    where
        S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(2), stream.next())
                .await
                .expect("frame in time")
                .expect("stream open")
                .expect("valid frame");
            if let Message::Text(text) = msg {
                return serde_json::from_str(text.as_str()).unwrap();
            }
        }
    }

    async fn wait_for_subscribers(hub: &LiveHub, expected: usize) {
        for _ in 0..100 {
            if hub.subscriber_count(None) == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {expected} subscribers");
    }

    #[test]
    fn keepalive_flag_parsing() {
        let mut params = HashMap::new();
        assert!(!wants_keepalive(&params));
        params.insert("keepalive".to_string(), "true".to_string());
        assert!(wants_keepalive(&params));
        params.insert("keepalive".to_string(), "no".to_string());
        assert!(!wants_keepalive(&params));
    }

    #[tokio::test]
    async fn keepalive_connection_is_greeted_and_answers_ping() {
        let (hub, base) = serve(HubConfig::default()).await;
        let (mut socket, _) = tokio_tungstenite::connect_async(format!("{base}/ws/polls/3?keepalive=true"))
            .await
            .unwrap();

        let greeting = next_json(&mut socket).await;
        assert_eq!(greeting["type"], "CONNECT_SUCCESS");

        socket
            .send(Message::Text(r#"{"type":"PING"}"#.into()))
            .await
            .unwrap();
        let pong = next_json(&mut socket).await;
        assert_eq!(pong["type"], "PONG");
        assert!(pong["time"].is_string());

        wait_for_subscribers(&hub, 1).await;
        hub.publish(&snapshot(3));
        let update = next_json(&mut socket).await;
        assert_eq!(update["type"], "VOTE_UPDATE");
        assert_eq!(update["data"]["options"][0]["votes"], 4);
    }

    #[tokio::test]
    async fn standard_connection_receives_updates_without_greeting() {
        let (hub, base) = serve(HubConfig::default()).await;
        let (mut socket, _) = tokio_tungstenite::connect_async(format!("{base}/ws/polls/9"))
            .await
            .unwrap();
        wait_for_subscribers(&hub, 1).await;

        hub.publish(&snapshot(9));
        let update = next_json(&mut socket).await;
        assert_eq!(update["type"], "VOTE_UPDATE");

        socket.close(None).await.unwrap();
        wait_for_subscribers(&hub, 0).await;
    }

    #[tokio::test]
    async fn full_hub_refuses_upgrade() {
        let (hub, base) = serve(HubConfig {
            max_connections: 1,
            ..HubConfig::default()
        })
        .await;
        let (_first, _) = tokio_tungstenite::connect_async(format!("{base}/ws/polls/1"))
            .await
            .unwrap();
        wait_for_subscribers(&hub, 1).await;

        match tokio_tungstenite::connect_async(format!("{base}/ws/polls/1")).await {
            Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
                assert_eq!(response.status().as_u16(), 503);
            }
            Err(err) => panic!("expected 503, got {err}"),
            Ok(_) => panic!("expected 503, connection was accepted"),
        }
        assert_eq!(hub.subscriber_count(None), 1);
    }

    #[tokio::test]
    async fn silent_client_is_dropped_after_read_deadline() {
        let policy = LivenessPolicy {
            ping_interval: Duration::from_secs(60),
            read_deadline: Duration::from_millis(200),
        };
        let (hub, base) = serve(HubConfig {
            standard: policy,
            ..HubConfig::default()
        })
        .await;
        let (_socket, _) = tokio_tungstenite::connect_async(format!("{base}/ws/polls/5"))
            .await
            .unwrap();
        wait_for_subscribers(&hub, 1).await;

        tokio::time::sleep(Duration::from_millis(400)).await;
        wait_for_subscribers(&hub, 0).await;
    }
}
