//! Chat API — the application-side boundary in front of the realtime core.
//!
//! Message bodies arrive here already encrypted and leave the same way;
//! this layer stores them, then hands the payload to the broadcast router.
//! Delivery to the receiver's socket is best-effort: the sender gets a
//! success response whether or not the receiver is currently connected,
//! and an offline receiver relies on the stored copy.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::AppState;
use cl_common::{AppError, AppResult};
use cl_realtime::frame;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/messages", post(send_message))
        .route("/typing", post(send_typing))
        .route("/online", get(online_status))
        .route("/unread", get(unread_count))
        .with_state(state)
}

// ─── Types ───────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendMessageRequest {
    consultation_id: i64,
    sender_id: i64,
    receiver_id: i64,
    /// Opaque, already-encrypted message body.
    content: String,
    /// 1: text, 2: image, 3: voice, 4: prescription, 5: system
    #[serde(default = "default_message_type")]
    message_type: i32,
}

fn default_message_type() -> i32 {
    1
}

#[derive(Debug, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
struct ChatMessage {
    id: i64,
    message_no: String,
    consultation_id: i64,
    sender_id: i64,
    receiver_id: i64,
    message_type: i32,
    content: String,
    is_read: bool,
    created_at: chrono::DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TypingRequest {
    consultation_id: i64,
    user_id: i64,
    #[serde(default)]
    typing: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OnlineQuery {
    consultation_id: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UnreadQuery {
    consultation_id: i64,
    user_id: i64,
}

// ─── Handlers ────────────────────────────────────────────────

/// Store a message, then push it to the receiver's live socket.
async fn send_message(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<SendMessageRequest>,
) -> AppResult<Json<ChatMessage>> {
    if payload.sender_id == payload.receiver_id {
        return Err(AppError::BadRequest(
            "sender and receiver must differ".to_string(),
        ));
    }

    let now = Utc::now();
    let message_no = format!(
        "MSG{}{:06}",
        now.timestamp(),
        now.timestamp_subsec_micros() % 1_000_000
    );

    let message: ChatMessage = sqlx::query_as(
        r#"
        INSERT INTO chat_messages
            (message_no, consultation_id, sender_id, receiver_id, message_type, content, is_read, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, FALSE, $7)
        RETURNING id, message_no, consultation_id, sender_id, receiver_id, message_type, content, is_read, created_at
        "#,
    )
    .bind(&message_no)
    .bind(payload.consultation_id)
    .bind(payload.sender_id)
    .bind(payload.receiver_id)
    .bind(payload.message_type)
    .bind(&payload.content)
    .bind(now)
    .fetch_one(&state.db)
    .await?;

    let unread: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM chat_messages
         WHERE consultation_id = $1 AND receiver_id = $2 AND is_read = FALSE",
    )
    .bind(payload.consultation_id)
    .bind(payload.receiver_id)
    .fetch_one(&state.db)
    .await?;

    state.hub.send_to_user(
        message.consultation_id,
        message.receiver_id,
        frame::KIND_CHAT,
        json!({ "message": &message, "unreadCount": unread }),
    );

    tracing::info!(
        message_id = message.id,
        consultation_id = message.consultation_id,
        sender_id = message.sender_id,
        receiver_id = message.receiver_id,
        "Chat message stored and routed"
    );

    Ok(Json(message))
}

/// Broadcast a typing indicator to the whole consultation.
async fn send_typing(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<TypingRequest>,
) -> Json<Value> {
    state.hub.send_to_consultation(
        payload.consultation_id,
        frame::KIND_TYPING,
        json!({ "userId": payload.user_id, "typing": payload.typing }),
    );

    Json(json!({ "status": "ok" }))
}

/// Who currently holds a live socket in this consultation.
async fn online_status(
    State(state): State<Arc<AppState>>,
    Query(query): Query<OnlineQuery>,
) -> Json<Value> {
    let users = state.hub.online_users(query.consultation_id);

    Json(json!({
        "consultationId": query.consultation_id,
        "onlineUsers": users,
    }))
}

async fn unread_count(
    State(state): State<Arc<AppState>>,
    Query(query): Query<UnreadQuery>,
) -> AppResult<Json<Value>> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM chat_messages
         WHERE consultation_id = $1 AND receiver_id = $2 AND is_read = FALSE",
    )
    .bind(query.consultation_id)
    .bind(query.user_id)
    .fetch_one(&state.db)
    .await?;

    Ok(Json(json!({
        "consultationId": query.consultation_id,
        "userId": query.user_id,
        "unreadCount": count,
    })))
}
