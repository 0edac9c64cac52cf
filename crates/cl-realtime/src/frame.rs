//! JSON wire envelopes exchanged with chat clients.
//!
//! Inbound frames are `{"type": ..., "data": ...}`; outbound frames carry
//! an additional unix-seconds `timestamp`. Unknown inbound types are
//! ignored by the read pump rather than treated as protocol errors.

use axum::extract::ws::Message;
use serde::Deserialize;
use serde_json::Value;

// Inbound frame types.
pub const KIND_PING: &str = "ping";
pub const KIND_TYPING: &str = "typing";

// Outbound frame types. Application-defined kinds pass through the router
// unchanged alongside these.
pub const KIND_CONNECTED: &str = "connected";
pub const KIND_STATUS: &str = "status";
pub const KIND_CHAT: &str = "chat";
pub const KIND_PONG: &str = "pong";

/// Envelope received from a chat client.
#[derive(Debug, Deserialize)]
pub struct ClientFrame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

/// Build and encode an outbound envelope once. Clones of the returned
/// message share the same underlying buffer, so a single encode serves an
/// entire consultation-wide fan-out.
pub fn encode(kind: &str, data: Value) -> Message {
    let envelope = serde_json::json!({
        "type": kind,
        "data": data,
        "timestamp": chrono::Utc::now().timestamp(),
    });
    Message::Text(envelope.to_string().into())
}
