use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use pollcast_core::hub::ActivityHandle;
use pollcast_core::Subscription;
use pollcast_models::{ClientMessage, ServerMessage};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

type Sink = SplitSink<WebSocket, Message>;

/// Drive one upgraded connection until either side gives up. The
/// subscription is dropped on return, which unregisters it from the hub.
pub(crate) async fn run(socket: WebSocket, mut subscription: Subscription) {
    let poll_id = subscription.poll_id();
    let subscriber = subscription.id();
    let keepalive = subscription.is_keepalive();
    let liveness = subscription.liveness();
    let activity = subscription.activity();

    let (sink, stream) = socket.split();
    let (control_tx, control_rx) = mpsc::channel(8);

    tracing::debug!(poll_id, subscriber, keepalive, "websocket session started");
    let reason = tokio::select! {
        reason = write_pump(sink, &mut subscription, control_rx, keepalive, liveness.ping_interval) => reason,
        reason = read_pump(stream, activity, control_tx, liveness.read_deadline) => reason,
    };
    tracing::debug!(poll_id, subscriber, reason, "websocket session ended");
}

async fn send_json(sink: &mut Sink, message: &ServerMessage) -> bool {
    match message.to_json() {
        Ok(json) => sink.send(Message::Text(json.into())).await.is_ok(),
        Err(err) => {
            tracing::error!(error = %err, "failed to serialize server message");
            true
        }
    }
}

async fn write_pump(
    mut sink: Sink,
    subscription: &mut Subscription,
    mut control: mpsc::Receiver<ServerMessage>,
    keepalive: bool,
    ping_interval: Duration,
) -> &'static str {
    if keepalive && !send_json(&mut sink, &ServerMessage::connect_success()).await {
        return "greeting failed";
    }

    let mut ticker = tokio::time::interval_at(Instant::now() + ping_interval, ping_interval);
    loop {
        tokio::select! {
            payload = subscription.recv() => {
                let Some(payload) = payload else {
                    let _ = sink.send(Message::Close(None)).await;
                    return "dropped by hub";
                };
                if sink.send(Message::Text(payload.to_string().into())).await.is_err() {
                    return "send failed";
                }
                subscription.touch();
            }
            Some(reply) = control.recv() => {
                if !send_json(&mut sink, &reply).await {
                    return "send failed";
                }
            }
            _ = ticker.tick() => {
                // Keep-alive subscribers get an application-level ping they
                // can see; everyone else a protocol ping.
                let sent = if keepalive {
                    send_json(&mut sink, &ServerMessage::ping()).await
                } else {
                    sink.send(Message::Ping(Bytes::new())).await.is_ok()
                };
                if !sent {
                    return "ping failed";
                }
            }
        }
    }
}

async fn read_pump(
    mut stream: SplitStream<WebSocket>,
    activity: ActivityHandle,
    control: mpsc::Sender<ServerMessage>,
    read_deadline: Duration,
) -> &'static str {
    loop {
        let frame = match tokio::time::timeout(read_deadline, stream.next()).await {
            Err(_) => return "read deadline passed",
            Ok(None) => return "client went away",
            Ok(Some(Err(err))) => {
                tracing::debug!(error = %err, "websocket read failed");
                return "read failed";
            }
            Ok(Some(Ok(frame))) => frame,
        };
        activity.touch();

        match frame {
            Message::Text(text) => match serde_json::from_str::<ClientMessage>(text.as_str()) {
                Ok(ClientMessage::Ping { .. }) => {
                    if control.send(ServerMessage::pong()).await.is_err() {
                        return "writer stopped";
                    }
                }
                Ok(ClientMessage::Pong { .. }) => {}
                Err(_) => tracing::debug!("ignoring unrecognised client frame"),
            },
            Message::Close(_) => return "client closed",
            _ => {}
        }
    }
}
