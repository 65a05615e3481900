//! End-to-end push-channel behavior over a real WebSocket.

use std::net::SocketAddr;
use std::sync::Arc;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use marquee_control::broadcast::Broadcaster;
use marquee_control::handlers::{app_router, AppState};
use marquee_control::store::{MemoryStateStore, StateStore};
use marquee_proto::{PushMessage, ScreenState};

type WsClient = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

async fn spawn_control_plane() -> (SocketAddr, Arc<MemoryStateStore>) {
    let store = Arc::new(MemoryStateStore::default());
    store.seed_state(ScreenState {
        screen_id: "s1".into(),
        src: Some("/content/a.png".into()),
        scenario: None,
        slideshow: None,
        updated_at: Utc::now(),
    });
    let broadcaster = Arc::new(Broadcaster::new(store.clone()));
    let app = AppState {
        store: store.clone(),
        broadcaster,
    };
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app_router(app)).await.unwrap();
    });
    (addr, store)
}

async fn connect(addr: SocketAddr) -> WsClient {
    let url = format!("ws://{}/ws/state", addr);
    let (stream, _) = timeout(Duration::from_secs(5), connect_async(&url))
        .await
        .expect("connect timed out")
        .expect("connect failed");
    stream
}

async fn next_snapshot_text(client: &mut WsClient) -> String {
    timeout(Duration::from_secs(5), async {
        while let Some(frame) = client.next().await {
            if let Message::Text(text) = frame.expect("ws read failed") {
                return text.to_string();
            }
        }
        panic!("connection closed before a snapshot arrived");
    })
    .await
    .expect("timed out waiting for snapshot")
}

#[tokio::test]
async fn connect_snapshot_then_set_image_broadcasts_to_all() {
    let (addr, store) = spawn_control_plane().await;

    let mut first = connect(addr).await;
    let connect_snapshot = next_snapshot_text(&mut first).await;
    let PushMessage::State { screens } = serde_json::from_str(&connect_snapshot).unwrap();
    assert_eq!(screens["s1"].src.as_deref(), Some("/content/a.png"));

    let mut second = connect(addr).await;
    let _ = next_snapshot_text(&mut second).await;

    // the sender also receives the resulting broadcast
    first
        .send(Message::Text(
            r#"{"type":"setImage","screen":"s1","src":"/content/b.png"}"#.to_string().into(),
        ))
        .await
        .unwrap();

    let seen_by_sender = next_snapshot_text(&mut first).await;
    let seen_by_other = next_snapshot_text(&mut second).await;
    assert_eq!(seen_by_sender, seen_by_other);

    let PushMessage::State { screens } = serde_json::from_str(&seen_by_sender).unwrap();
    assert_eq!(screens["s1"].src.as_deref(), Some("/content/b.png"));

    let states = store.list_states().await.unwrap();
    assert_eq!(states[0].src.as_deref(), Some("/content/b.png"));
}

#[tokio::test]
async fn malformed_and_unknown_commands_leave_connection_open() {
    let (addr, _) = spawn_control_plane().await;

    let mut client = connect(addr).await;
    let _ = next_snapshot_text(&mut client).await;

    client
        .send(Message::Text("definitely not json".to_string().into()))
        .await
        .unwrap();
    client
        .send(Message::Text(r#"{"type":"reboot"}"#.to_string().into()))
        .await
        .unwrap();

    // a valid command still works afterwards, proving the connection survived
    client
        .send(Message::Text(
            r#"{"type":"setImage","screen":"s1","src":"/content/c.png"}"#.to_string().into(),
        ))
        .await
        .unwrap();
    let text = next_snapshot_text(&mut client).await;
    assert!(text.contains("/content/c.png"));
}
