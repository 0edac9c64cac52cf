//! API routes module.

mod chat;
mod health;

use crate::AppState;
use axum::Router;
use std::sync::Arc;

/// Build the API router with all sub-routes.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .nest("/chat", chat::router(state))
        .merge(health::router())
}
