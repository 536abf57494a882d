pub mod appresult;
pub mod config;
pub mod db;
pub mod res;
pub mod rooms;

use std::sync::Arc;

use axum::{extract::FromRef, Router};
use tower_http::{cors::CorsLayer, services::ServeDir, trace::TraceLayer};

pub use appresult::{AppError, AppResult, RelayError};
use config::Config;
use db::Store;
use rooms::ConnectionRegistry;

#[derive(Clone, FromRef)]
pub struct AppState {
    pub store: Store,
    pub registry: ConnectionRegistry,
    pub config: Arc<Config>,
}

/// Relay routes plus the image and static file servers.
pub fn app(state: AppState) -> Router {
    let images = ServeDir::new(&state.config.image_dir);
    let public = ServeDir::new(&state.config.public_dir);

    Router::new()
        .merge(rooms::router())
        .nest_service("/images", images)
        .fallback_service(public)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
