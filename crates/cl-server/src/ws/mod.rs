//! WebSocket gateway for consultation chat sessions.

mod handler;

use crate::AppState;
use axum::Router;
use std::sync::Arc;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/chat", axum::routing::get(handler::chat_ws_handler))
        .with_state(state)
}
