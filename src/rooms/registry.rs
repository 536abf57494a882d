use std::{collections::HashMap, sync::Arc};

use axum::extract::ws::Message;
use dashmap::DashMap;
use tokio::sync::{mpsc, Notify};
use uuid::Uuid;

use crate::appresult::RelayError;

/// Frames a connection may have queued before it counts as dead.
pub const CONNECTION_QUEUE: usize = 256;

/// Sender half feeding one socket's writer task.
pub type ConnectionSender = mpsc::Sender<Message>;

/// Handle to one live WebSocket connection.
#[derive(Debug, Clone)]
pub struct Connection {
    id: Uuid,
    tx: ConnectionSender,
    closing: Arc<Notify>,
}

impl Connection {
    pub fn new(tx: ConnectionSender) -> Self {
        Self {
            id: Uuid::now_v7(),
            tx,
            closing: Arc::new(Notify::new()),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Queues a frame without waiting. A full queue means the client stopped reading.
    pub fn push(&self, msg: Message) -> Result<(), RelayError> {
        self.tx.try_send(msg).map_err(|_| RelayError::Transport(self.id))
    }

    /// Asks the connection to shut down, with a close frame if there is room for one.
    pub fn close(&self) {
        let _ = self.tx.try_send(Message::Close(None));
        self.closing.notify_one();
    }

    /// Resolves once `close` has been called on any clone of this handle.
    pub async fn closed(&self) {
        self.closing.notified().await;
    }
}

/// Live connections grouped by room. Rooms exist exactly while they have members.
///
/// Locking is per shard of the underlying map; every mutation of a room's set happens
/// under that shard's write lock, so readers never see a half-updated set.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    rooms: Arc<DashMap<String, HashMap<Uuid, Connection>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, room: &str, connection: Connection) {
        let mut members = self.rooms.entry(room.to_owned()).or_default();
        members.insert(connection.id, connection);

        tracing::debug!(room, members = members.len(), "connection registered");
    }

    /// Returns whether the connection was present.
    pub fn unregister(&self, room: &str, id: Uuid) -> bool {
        let removed = match self.rooms.get_mut(room) {
            Some(mut members) => members.remove(&id).is_some(),
            None => false,
        };
        self.rooms.remove_if(room, |_, members| members.is_empty());

        if removed {
            tracing::debug!(room, connection = %id, "connection unregistered");
        }
        removed
    }

    /// Point-in-time copy of a room's members.
    pub fn broadcast_targets(&self, room: &str) -> Vec<Connection> {
        self.rooms
            .get(room)
            .map(|members| members.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}
