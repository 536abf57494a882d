use axum::extract::ws::Message;
use serde::Deserialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::{
    appresult::RelayError,
    db::{ChangeStream, MessageRecord, Store},
};

use super::ConnectionRegistry;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub operation_type: String,
    pub full_document: MessageRecord,
    pub document_key: DocumentKey,
    pub ns: Namespace,
}

#[derive(Debug, Deserialize)]
pub struct DocumentKey {
    #[serde(rename = "_id")]
    pub id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct Namespace {
    pub db: String,
    pub coll: String,
}

/// Subscribes to the store before returning, then drives broadcasts on a background task.
pub async fn spawn(store: &Store, registry: ConnectionRegistry) -> Result<JoinHandle<()>, sqlx::Error> {
    let stream = store.watch().await?;
    Ok(tokio::spawn(listen(stream, registry)))
}

/// Consumes the change stream until the store goes away. Nothing that happens to a single
/// event or connection stops it.
pub async fn listen(mut stream: ChangeStream, registry: ConnectionRegistry) {
    tracing::info!(resume_after = stream.resume_token(), "change feed listener started");

    while let Some(next) = stream.next().await {
        let document = match next {
            Ok(document) => document,
            Err(err) => {
                tracing::error!(error = %err, "change feed read failed");
                continue;
            }
        };

        if let Err(err) = dispatch(&registry, document) {
            tracing::warn!(error = %err, "skipping change event");
        }
    }

    tracing::info!("change feed closed, listener stopping");
}

/// Decodes one change document and broadcasts its record. Returns the number of connections
/// that accepted it.
pub fn dispatch(registry: &ConnectionRegistry, document: Value) -> Result<usize, RelayError> {
    let event: ChangeEvent = serde_json::from_value(document)?;

    if event.operation_type != "insert" {
        tracing::debug!(operation = %event.operation_type, "ignoring non-insert change");
        return Ok(0);
    }

    tracing::debug!(
        document = %event.document_key.id,
        db = %event.ns.db,
        coll = %event.ns.coll,
        room = %event.full_document.room,
        "change detected"
    );
    broadcast(registry, &event.full_document)
}

/// Pushes `record` to every member of its room. A dead connection is unregistered and closed
/// without affecting delivery to the rest.
pub fn broadcast(registry: &ConnectionRegistry, record: &MessageRecord) -> Result<usize, RelayError> {
    let msg = Message::Text(serde_json::to_string(record)?.into());
    let room = record.room.as_str();

    let mut delivered = 0;
    for connection in registry.broadcast_targets(room) {
        match connection.push(msg.clone()) {
            Ok(()) => delivered += 1,
            Err(err) => {
                tracing::info!(room, error = %err, "pruning dead connection");
                registry.unregister(room, connection.id());
                connection.close();
            }
        }
    }
    Ok(delivered)
}
