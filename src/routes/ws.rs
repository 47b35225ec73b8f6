use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::time::MissedTickBehavior;

use crate::routes::ApiState;
use crate::services::notifications::Listener;

/// GET /ws: live completion notifications.
pub async fn notifications(ws: WebSocketUpgrade, State(state): State<ApiState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Serve one connection until the client leaves or the server shuts down.
///
/// The notification stream is polled on a fixed interval and additionally
/// whenever the client sends a frame.
async fn handle_socket(socket: WebSocket, state: ApiState) {
    let conn_id = uuid::Uuid::new_v4().to_string();
    let settings = state.app.settings.clone();

    let listener = match state.app.streams.open(&settings.notification_stream).await {
        Ok(stream) => Listener::open(stream, conn_id.clone(), settings.listener_block).await,
        Err(e) => Err(e),
    };
    let mut listener = match listener {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(conn_id = %conn_id, error = %e, "Failed to open notification listener");
            return;
        }
    };

    tracing::info!(conn_id = %conn_id, cursor = %listener.cursor(), "WebSocket connected");
    metrics::gauge!("face_ws_connections").increment(1.0);

    let (mut sink, mut stream) = socket.split();
    let mut ticker = tokio::time::interval(settings.listener_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
            _ = ticker.tick() => {}
            received = stream.next() => match received {
                None | Some(Ok(Message::Close(_))) => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(conn_id = %conn_id, error = %e, "WebSocket receive error");
                    break;
                }
            },
        }

        if !drain(&mut listener, &mut sink).await {
            break;
        }
    }

    metrics::gauge!("face_ws_connections").decrement(1.0);
    tracing::info!(conn_id = %conn_id, "WebSocket disconnected");
}

/// Forward every notification available after the listener's cursor.
/// Returns `false` once the client can no longer be written to.
async fn drain(listener: &mut Listener, sink: &mut SplitSink<WebSocket, Message>) -> bool {
    loop {
        let notification = match listener.poll().await {
            Ok(Some(notification)) => notification,
            Ok(None) => return true,
            Err(e) => {
                tracing::warn!(conn_id = %listener.connection_id(), error = %e, "Notification poll failed");
                return true;
            }
        };

        let text = match serde_json::to_string(&notification) {
            Ok(text) => text,
            Err(e) => {
                tracing::error!(conn_id = %listener.connection_id(), error = %e, "Failed to encode notification");
                continue;
            }
        };
        if sink.send(Message::Text(text.into())).await.is_err() {
            tracing::debug!(conn_id = %listener.connection_id(), "WebSocket sink closed");
            return false;
        }
        tracing::debug!(
            conn_id = %listener.connection_id(),
            job_id = %notification.job_id,
            "Notification delivered"
        );
    }
}
