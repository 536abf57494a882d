//! End-to-end tests: real router on a random port, tungstenite clients.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use aronachat::{
    config::Config,
    db::{MessageRecord, Store},
    rooms::{feed, ConnectionRegistry},
    AppState,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tempfile::TempDir;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{tungstenite::Message, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const PUBLIC_URL: &str = "http://chat.test";

struct TestServer {
    addr: SocketAddr,
    registry: ConnectionRegistry,
    store: Store,
    dir: TempDir,
}

async fn start_test_server() -> TestServer {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let store = Store::in_memory(64).await.expect("Failed to open store");
    let registry = ConnectionRegistry::new();
    feed::spawn(&store, registry.clone())
        .await
        .expect("Failed to subscribe to change feed");

    let config = Config {
        public_url: PUBLIC_URL.to_owned(),
        image_dir: dir.path().join("images"),
        public_dir: dir.path().join("public"),
        ..Config::default()
    };
    let state = AppState {
        store: store.clone(),
        registry: registry.clone(),
        config: Arc::new(config),
    };

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, aronachat::app(state)).await.unwrap();
    });

    TestServer { addr, registry, store, dir }
}

impl TestServer {
    /// Connects to `room` and waits until the server has registered the socket.
    async fn join(&self, room: &str) -> Client {
        let before = self.registry.broadcast_targets(room).len();
        let (client, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws?room={room}", self.addr))
            .await
            .expect("WebSocket connect failed");

        tokio::time::timeout(Duration::from_secs(5), async {
            while self.registry.broadcast_targets(room).len() <= before {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("connection was never registered");

        client
    }
}

async fn send(client: &mut Client, value: serde_json::Value) {
    client.send(Message::Text(value.to_string().into())).await.unwrap();
}

async fn next_record(client: &mut Client) -> Option<MessageRecord> {
    loop {
        match tokio::time::timeout(Duration::from_millis(2000), client.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => return Some(serde_json::from_str(text.as_str()).unwrap()),
            Ok(Some(Ok(Message::Ping(_) | Message::Pong(_)))) => continue,
            _ => return None,
        }
    }
}

async fn assert_silent(client: &mut Client) {
    let got = tokio::time::timeout(Duration::from_millis(300), client.next()).await;
    assert!(got.is_err(), "expected no message, got {got:?}");
}

fn hi(room: &str) -> MessageRecord {
    MessageRecord {
        username: "a".into(),
        message: "hi".into(),
        image: String::new(),
        room: room.into(),
    }
}

#[tokio::test]
async fn sender_and_roommate_both_receive() {
    let server = start_test_server().await;
    let mut a = server.join("lobby").await;
    let mut b = server.join("lobby").await;

    send(&mut a, json!({ "username": "a", "message": "hi", "image": "", "room": "" })).await;

    assert_eq!(next_record(&mut a).await, Some(hi("lobby")));
    assert_eq!(next_record(&mut b).await, Some(hi("lobby")));
}

#[tokio::test]
async fn other_rooms_hear_nothing() {
    let server = start_test_server().await;
    let mut a = server.join("lobby").await;
    let mut b = server.join("den").await;

    send(&mut a, json!({ "username": "a", "message": "hi", "image": "", "room": "den" })).await;

    assert_eq!(next_record(&mut a).await, Some(hi("lobby")));
    assert_silent(&mut b).await;
}

#[tokio::test]
async fn inline_image_is_delivered_as_url() {
    let server = start_test_server().await;
    let mut a = server.join("lobby").await;

    send(
        &mut a,
        json!({ "username": "a", "message": "pic", "image": "data:image/png;base64,aGVsbG8=", "room": "" }),
    )
    .await;

    let record = next_record(&mut a).await.expect("no broadcast");
    let file_name = record
        .image
        .strip_prefix(&format!("{PUBLIC_URL}/images/"))
        .unwrap_or_else(|| panic!("unexpected image field {}", record.image));
    assert!(file_name.starts_with("image_") && file_name.ends_with(".png"), "{file_name}");
    assert!(!record.image.contains("base64"));
    assert_eq!(std::fs::read(server.dir.path().join("images").join(file_name)).unwrap(), b"hello");
}

#[tokio::test]
async fn bad_image_keeps_text_and_connection() {
    let server = start_test_server().await;
    let mut a = server.join("lobby").await;

    send(&mut a, json!({ "username": "a", "message": "hi", "image": "data:image/png;base64", "room": "" })).await;
    assert_eq!(next_record(&mut a).await, Some(hi("lobby")));

    send(&mut a, json!({ "username": "a", "message": "hi", "image": "", "room": "" })).await;
    assert_eq!(next_record(&mut a).await, Some(hi("lobby")));
}

#[tokio::test]
async fn undecodable_frame_is_skipped() {
    let server = start_test_server().await;
    let mut a = server.join("lobby").await;

    a.send(Message::Text("{not json".into())).await.unwrap();
    send(&mut a, json!({ "username": "a", "message": "hi" })).await;

    assert_eq!(next_record(&mut a).await, Some(hi("lobby")));
    assert_eq!(server.store.find_by_room("lobby").await.unwrap(), [hi("lobby")]);
}

#[tokio::test]
async fn closed_client_is_unregistered() {
    let server = start_test_server().await;
    let mut a = server.join("lobby").await;
    let mut b = server.join("lobby").await;

    a.close(None).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while server.registry.broadcast_targets("lobby").len() > 1 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("closed connection stayed registered");

    send(&mut b, json!({ "username": "a", "message": "hi" })).await;
    assert_eq!(next_record(&mut b).await, Some(hi("lobby")));
}

#[tokio::test]
async fn missing_room_is_rejected() {
    let server = start_test_server().await;

    for url in [format!("ws://{}/ws", server.addr), format!("ws://{}/ws?room=", server.addr)] {
        match tokio_tungstenite::connect_async(url).await {
            Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
                assert_eq!(response.status(), 400);
            }
            other => panic!("expected 400, got {:?}", other.map(|(_, response)| response.status())),
        }
    }
    assert_eq!(server.registry.room_count(), 0);
}
