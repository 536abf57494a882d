pub mod feed;
mod msg;
pub mod registry;
mod room;
mod ws;

use axum::{routing::get, Router};

use crate::AppState;

pub use registry::{Connection, ConnectionRegistry};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/ws", get(ws::room_ws))
        .route("/get-chat/{room_id}", get(room::get_chat))
}
