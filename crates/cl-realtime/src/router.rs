//! Broadcast router — the delivery path from application code to live
//! connections.
//!
//! `send_to_user` / `send_to_consultation` enqueue onto a bounded work
//! queue and return immediately; a single task performs the fan-out. Per
//! recipient, delivery is a non-blocking push onto that connection's
//! outbound queue: a saturated queue drops the frame for that connection
//! only and never stalls delivery to the others.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;

use crate::frame;
use crate::registry::{ClientKey, Connection, Registry};

/// Capacity of the router's internal work queue.
const WORK_QUEUE: usize = 256;

/// A message accepted for fan-out. Transient — never persisted here.
#[derive(Debug)]
pub struct RoutedMessage {
    pub consultation_id: i64,
    /// `None` targets every current participant of the consultation.
    pub target_user_id: Option<i64>,
    pub kind: String,
    pub payload: Value,
}

/// Cloneable, non-blocking handle for enqueueing routed messages.
#[derive(Debug, Clone)]
pub struct Router {
    tx: mpsc::Sender<RoutedMessage>,
}

impl Router {
    /// Spawn the fan-out task over the given registry.
    pub(crate) fn spawn(registry: Arc<Registry>) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(WORK_QUEUE);
        let task = tokio::spawn(run(registry, rx));
        (Self { tx }, task)
    }

    /// Queue a message for one participant. Silently dropped if that user
    /// holds no live connection on the consultation.
    pub fn send_to_user(&self, consultation_id: i64, user_id: i64, kind: &str, payload: Value) {
        self.enqueue(RoutedMessage {
            consultation_id,
            target_user_id: Some(user_id),
            kind: kind.to_string(),
            payload,
        });
    }

    /// Queue a message for every current participant of a consultation.
    pub fn send_to_consultation(&self, consultation_id: i64, kind: &str, payload: Value) {
        self.enqueue(RoutedMessage {
            consultation_id,
            target_user_id: None,
            kind: kind.to_string(),
            payload,
        });
    }

    fn enqueue(&self, msg: RoutedMessage) {
        if let Err(err) = self.tx.try_send(msg) {
            let msg = match &err {
                TrySendError::Full(m) => m,
                TrySendError::Closed(m) => m,
            };
            tracing::warn!(
                consultation_id = msg.consultation_id,
                kind = %msg.kind,
                "Router work queue unavailable, dropping message"
            );
        }
    }
}

async fn run(registry: Arc<Registry>, mut rx: mpsc::Receiver<RoutedMessage>) {
    while let Some(msg) = rx.recv().await {
        dispatch(&registry, msg);
    }
}

fn dispatch(registry: &Registry, msg: RoutedMessage) {
    // Encode once; every target receives the same refcounted frame.
    let encoded = frame::encode(&msg.kind, msg.payload);

    match msg.target_user_id {
        Some(user_id) => {
            let key = ClientKey {
                consultation_id: msg.consultation_id,
                user_id,
            };
            // Offline target: delivery is best-effort, drop without error.
            if let Some(conn) = registry.lookup(&key) {
                deliver(&conn, encoded);
            }
        }
        None => {
            for conn in registry.connections(msg.consultation_id) {
                deliver(&conn, encoded.clone());
            }
        }
    }
}

fn deliver(conn: &Connection, frame: axum::extract::ws::Message) {
    match conn.push(frame) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) => {
            let key = conn.key();
            tracing::warn!(
                consultation_id = key.consultation_id,
                user_id = key.user_id,
                "Outbound queue full, dropping frame"
            );
        }
        // The connection is tearing down; its queue is gone.
        Err(TrySendError::Closed(_)) => {}
    }
}
