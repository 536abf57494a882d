use uuid::Uuid;

use crate::{appresult::RelayError, db::MessageRecord, res, AppState};

/// Prepares an inbound message for `room` and persists it. Delivery happens later, from the
/// change feed.
///
/// An image that fails to materialize is dropped from the record; the text is still stored.
pub(crate) async fn ingest(
    state: &AppState,
    room: &str,
    mut record: MessageRecord,
) -> Result<Uuid, RelayError> {
    if !record.image.is_empty() {
        record.image = match res::materialize(&state.config.image_dir, &record.image).await {
            Ok(path) => {
                let file_name = path.file_name().unwrap_or(path.as_os_str()).to_string_lossy();
                format!("{}/images/{file_name}", state.config.public_url)
            }
            Err(err) => {
                tracing::warn!(room, error = %err, "dropping image that failed to materialize");
                String::new()
            }
        };
    }

    record.room = room.to_owned();

    let id = state.store.insert(&record).await?;
    tracing::debug!(room, document = %id, username = %record.username, "message persisted");
    Ok(id)
}
