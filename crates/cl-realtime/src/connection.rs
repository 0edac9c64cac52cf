//! Per-connection read/write pumps.
//!
//! Each upgraded socket gets two loops coupled only through the
//! connection's bounded outbound queue and its cancellation token: the
//! read pump decodes inbound envelopes and is the sole peer-side teardown
//! trigger; the write pump services the queue, batches backlog into a
//! single transport write, and keeps the peer alive with periodic pings.

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::frame::{self, ClientFrame};
use crate::hub::ChatHub;
use crate::registry::{ClientKey, Connection, OUTBOUND_QUEUE};

/// Interval between keepalive pings while no application data flows.
const PING_PERIOD: Duration = Duration::from_secs(54);
/// Deadline for any single transport write. A peer that cannot absorb a
/// write within this window is treated as dead.
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Drive a freshly upgraded socket until either side tears it down.
///
/// Registers the connection, runs the read loop on the current task and
/// the write loop on a sibling task, and unregisters on the way out.
/// Whichever of {peer close, read error, write error, eviction, idle
/// reaping} fires first, teardown funnels through here exactly once —
/// the registry's identity check keeps a second unregister a no-op.
pub async fn serve(socket: WebSocket, hub: Arc<ChatHub>, key: ClientKey) {
    let (ws_tx, ws_rx) = socket.split();
    let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
    let conn = Connection::new(key, tx);

    hub.register(conn.clone());

    let write_task = tokio::spawn(write_pump(ws_tx, rx, conn.clone()));

    read_pump(ws_rx, &hub, &conn).await;

    hub.unregister(&conn);
    let _ = write_task.await;
}

// ─── Read side ───────────────────────────────────────────────

async fn read_pump(mut ws_rx: SplitStream<WebSocket>, hub: &Arc<ChatHub>, conn: &Arc<Connection>) {
    loop {
        let msg = tokio::select! {
            _ = conn.closed() => break,
            msg = ws_rx.next() => msg,
        };

        match msg {
            Some(Ok(Message::Text(text))) => {
                conn.touch();
                handle_frame(hub, conn, text.as_str());
            }
            // Control traffic still counts as liveness; axum answers
            // protocol pings on its own.
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => conn.touch(),
            Some(Ok(Message::Close(_))) | None => break,
            // Binary frames are not part of the chat protocol.
            Some(Ok(_)) => {}
            Some(Err(err)) => {
                let key = conn.key();
                tracing::debug!(
                    consultation_id = key.consultation_id,
                    user_id = key.user_id,
                    %err,
                    "WebSocket read error"
                );
                break;
            }
        }
    }
}

/// Dispatch one inbound envelope. Malformed or unrecognized frames are
/// dropped and the connection stays alive.
fn handle_frame(hub: &ChatHub, conn: &Connection, raw: &str) {
    let parsed: ClientFrame = match serde_json::from_str(raw) {
        Ok(f) => f,
        Err(err) => {
            tracing::debug!(%err, "Ignoring malformed client frame");
            return;
        }
    };

    let key = conn.key();
    match parsed.kind.as_str() {
        // Application-level heartbeat, answered to this connection only.
        frame::KIND_PING => {
            let _ = conn.push(frame::encode(frame::KIND_PONG, Value::Null));
        }

        // Typing indicator fans out to the whole consultation, tagged
        // with this connection's user.
        frame::KIND_TYPING => {
            hub.send_to_consultation(
                key.consultation_id,
                frame::KIND_TYPING,
                json!({ "userId": key.user_id, "typing": parsed.data }),
            );
        }

        other => {
            tracing::trace!(kind = other, "Ignoring unrecognized client frame type");
        }
    }
}

// ─── Write side ──────────────────────────────────────────────

async fn write_pump(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Message>,
    conn: Arc<Connection>,
) {
    let mut keepalive = tokio::time::interval(PING_PERIOD);
    keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    keepalive.tick().await; // first tick completes immediately

    loop {
        tokio::select! {
            _ = conn.closed() => {
                let _ = write(&mut ws_tx, Message::Close(None)).await;
                return;
            }

            maybe = rx.recv() => {
                let Some(first) = maybe else {
                    let _ = write(&mut ws_tx, Message::Close(None)).await;
                    return;
                };
                let batch = coalesce(first, &mut rx);
                if let Err(err) = write(&mut ws_tx, batch).await {
                    fail(&conn, err);
                    return;
                }
                keepalive.reset();
            }

            _ = keepalive.tick() => {
                if let Err(err) = write(&mut ws_tx, Message::Ping(Vec::new().into())).await {
                    fail(&conn, err);
                    return;
                }
            }
        }
    }
}

/// Merge everything currently queued into one newline-delimited text
/// frame, saving a transport write per backlogged message.
fn coalesce(first: Message, rx: &mut mpsc::Receiver<Message>) -> Message {
    let Message::Text(first_text) = first else {
        return first;
    };

    let mut batch: Option<String> = None;
    while let Ok(Message::Text(text)) = rx.try_recv() {
        let buf = batch.get_or_insert_with(|| String::from(first_text.as_str()));
        buf.push('\n');
        buf.push_str(text.as_str());
    }

    match batch {
        Some(buf) => Message::Text(buf.into()),
        None => Message::Text(first_text),
    }
}

async fn write(ws_tx: &mut SplitSink<WebSocket, Message>, msg: Message) -> anyhow::Result<()> {
    tokio::time::timeout(WRITE_TIMEOUT, ws_tx.send(msg))
        .await
        .map_err(|_| anyhow!("write deadline exceeded"))??;
    Ok(())
}

/// A failed or timed-out write means the peer is gone; cancel so the read
/// pump unwinds and unregisters.
fn fail(conn: &Connection, err: anyhow::Error) {
    let key = conn.key();
    tracing::debug!(
        consultation_id = key.consultation_id,
        user_id = key.user_id,
        %err,
        "WebSocket write failed, closing connection"
    );
    conn.close();
}
