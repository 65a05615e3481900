//! WebSocket push-channel handler.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error};
use uuid::Uuid;

use crate::broadcast::Outbound;
use crate::handlers::AppState;

pub async fn push_channel_handler(
    ws: WebSocketUpgrade,
    State(app): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, app))
}

async fn handle_socket(socket: WebSocket, app: AppState) {
    let conn_id = Uuid::new_v4().to_string();
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();

    // Forward queued frames to the socket; the broadcaster never touches the
    // sink directly.
    let forward_id = conn_id.clone();
    let forwarder = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let result = match frame {
                Outbound::Snapshot(text) => sender.send(Message::Text(text)).await,
                Outbound::Probe => sender.send(Message::Ping(Vec::new())).await,
                Outbound::Terminate => {
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
            };
            if result.is_err() {
                break;
            }
        }
        debug!(conn = %forward_id, "outbound forwarder stopped");
    });

    app.broadcaster.register(&conn_id, tx);
    debug!(conn = %conn_id, "push channel connected");

    if let Err(err) = app.broadcaster.on_connect(&conn_id).await {
        error!(conn = %conn_id, error = %err, "failed to build connect snapshot");
        app.broadcaster.unregister(&conn_id);
        forwarder.abort();
        return;
    }

    while let Some(frame) = receiver.next().await {
        let msg = match frame {
            Ok(msg) => msg,
            Err(err) => {
                debug!(conn = %conn_id, error = %err, "push channel read error");
                break;
            }
        };
        match msg {
            Message::Text(text) => {
                if let Err(err) = app.broadcaster.on_command(&conn_id, &text).await {
                    error!(conn = %conn_id, error = %err, "command handling failed");
                }
            }
            Message::Pong(_) => app.broadcaster.mark_pong(&conn_id),
            Message::Close(_) => break,
            _ => {}
        }
    }

    app.broadcaster.unregister(&conn_id);
    debug!(conn = %conn_id, "push channel disconnected");
}
