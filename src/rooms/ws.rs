use std::time::Duration;

use axum::{
    debug_handler,
    extract::{
        ws::{close_code, rejection::WebSocketUpgradeRejection, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::{IntoResponse, Response},
};
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::{appresult::RelayError, db::MessageRecord, AppResult, AppState};

use super::{msg, registry::CONNECTION_QUEUE, Connection, ConnectionRegistry};

// how long a closing socket gets to flush its close frame
const CLOSE_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
pub(crate) struct RoomQuery {
    room: Option<String>,
}

/// GET /ws?room=<id>
#[debug_handler]
pub(crate) async fn room_ws(
    State(state): State<AppState>,
    Query(RoomQuery { room }): Query<RoomQuery>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> AppResult<Response> {
    let Some(room) = room.filter(|room| !room.is_empty()) else {
        return Err(RelayError::BadRequest("Missing room parameter".to_owned()).into());
    };

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => {
            tracing::warn!(room = %room, error = %rejection, "websocket upgrade rejected");
            return Ok(rejection.into_response());
        }
    };

    let failed_room = room.clone();
    Ok(ws
        .on_failed_upgrade(move |err| {
            let err = RelayError::from(err);
            tracing::warn!(room = %failed_room, error = %err, "websocket handshake failed");
        })
        .on_upgrade(move |socket| run_connection(socket, state, room)))
}

/// Keeps a connection registered for as long as it is alive.
struct Registration {
    registry: ConnectionRegistry,
    room: String,
    connection: Connection,
}

impl Registration {
    fn new(registry: &ConnectionRegistry, room: &str, connection: Connection) -> Self {
        registry.register(room, connection.clone());
        Self {
            registry: registry.clone(),
            room: room.to_owned(),
            connection,
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.unregister(&self.room, self.connection.id());
    }
}

/// Receive loop for one client. Inbound messages are only persisted here; the change feed
/// delivers them, echo included.
async fn run_connection(socket: WebSocket, state: AppState, room: String) {
    let (ws_sender, mut ws_receiver) = socket.split();
    let (tx, rx) = mpsc::channel(CONNECTION_QUEUE);

    let registration = Registration::new(&state.registry, &room, Connection::new(tx));
    let id = registration.connection.id();
    tracing::info!(room = %room, connection = %id, "client connected");

    let mut writer = tokio::spawn(writer_task(ws_sender, rx));
    let mut writer_done = false;

    loop {
        let incoming = tokio::select! {
            incoming = ws_receiver.next() => incoming,
            _ = &mut writer => {
                writer_done = true;
                tracing::debug!(room = %room, connection = %id, "writer stopped");
                break;
            }
            _ = registration.connection.closed() => {
                tracing::info!(room = %room, connection = %id, "connection pruned");
                break;
            }
        };

        let decoded = match incoming {
            Some(Ok(Message::Text(text))) => serde_json::from_str::<MessageRecord>(text.as_str()),
            Some(Ok(Message::Binary(data))) => serde_json::from_slice::<MessageRecord>(&data),
            Some(Ok(Message::Close(frame))) => {
                tracing::info!(room = %room, connection = %id, ?frame, "client closed");
                break;
            }
            Some(Ok(_)) => continue,
            Some(Err(err)) => {
                tracing::info!(room = %room, connection = %id, error = %err, "receive failed");
                break;
            }
            None => break,
        };

        let record = match decoded {
            Ok(record) => record,
            Err(err) => {
                tracing::warn!(room = %room, connection = %id, error = %RelayError::from(err), "skipping undecodable message");
                continue;
            }
        };

        if let Err(err) = msg::ingest(&state, &room, record).await {
            tracing::error!(room = %room, connection = %id, error = %err, "closing connection after failed write");
            let _ = registration.connection.push(Message::Close(Some(CloseFrame {
                code: close_code::ERROR,
                reason: "message could not be stored".into(),
            })));
            break;
        }
    }

    drop(registration);

    if !writer_done && tokio::time::timeout(CLOSE_GRACE, &mut writer).await.is_err() {
        writer.abort();
    }

    tracing::info!(room = %room, connection = %id, "client disconnected");
}

/// Forwards queued frames to the socket. Stops after a close frame or on the first failed write.
async fn writer_task(
    mut ws_sender: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Message>,
) {
    while let Some(msg) = rx.recv().await {
        let closing = matches!(msg, Message::Close(_));
        if let Err(err) = ws_sender.send(msg).await {
            tracing::debug!(error = %err, "websocket write failed");
            break;
        }
        if closing {
            break;
        }
    }
}
