//! WebSocket upgrade for chat clients.
//!
//! Extracts the (consultation, user) identity from query parameters and
//! hands the upgraded socket to the realtime core. Authentication and any
//! deeper parameter validation happen upstream of this service.

use std::sync::Arc;

use axum::{
    extract::{ws::WebSocketUpgrade, Query, State},
    response::IntoResponse,
};
use serde::Deserialize;

use crate::AppState;
use cl_realtime::{connection, ClientKey};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSocketParams {
    consultation_id: i64,
    user_id: i64,
}

/// Chat WebSocket upgrade.
pub async fn chat_ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ChatSocketParams>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let key = ClientKey {
        consultation_id: params.consultation_id,
        user_id: params.user_id,
    };

    tracing::info!(
        consultation_id = key.consultation_id,
        user_id = key.user_id,
        "Chat WebSocket upgrade requested"
    );

    ws.on_upgrade(move |socket| connection::serve(socket, state.hub.clone(), key))
}
