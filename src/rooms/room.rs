use axum::{debug_handler, extract::{Path, State}, Json};

use crate::{db::{MessageRecord, Store}, AppResult};

/// GET /get-chat/{room_id}: the room's history, oldest first.
#[debug_handler(state = crate::AppState)]
pub(crate) async fn get_chat(
    Path(room_id): Path<String>,
    State(store): State<Store>,
) -> AppResult<Json<Vec<MessageRecord>>> {
    let records = store.find_by_room(&room_id).await?;
    tracing::debug!(room = %room_id, count = records.len(), "history served");
    Ok(Json(records))
}
