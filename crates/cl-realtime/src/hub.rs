//! Chat hub — the registry/router pair handed to collaborators.
//!
//! Constructed explicitly at startup and passed around by dependency
//! injection; there is no process-wide instance. Registration is
//! last-writer-wins per `(consultation, user)` key, and unregistration is
//! idempotent: however many teardown triggers race, resources are released
//! once and at most one offline event is emitted.

use std::sync::Arc;

use serde_json::{json, Value};
use tokio::task::JoinHandle;

use crate::frame;
use crate::presence;
use crate::registry::{Connection, Registry};
use crate::router::Router;

pub struct ChatHub {
    registry: Arc<Registry>,
    router: Router,
}

impl ChatHub {
    /// Build the hub and spawn its router task. The task runs for the
    /// life of the process.
    pub fn new() -> (Arc<Self>, JoinHandle<()>) {
        let registry = Arc::new(Registry::default());
        let (router, task) = Router::spawn(registry.clone());
        (Arc::new(Self { registry, router }), task)
    }

    // ─── Delivery ────────────────────────────────────────────

    /// Queue a message for one participant. Non-blocking; silently dropped
    /// if that user holds no live connection on the consultation.
    pub fn send_to_user(&self, consultation_id: i64, user_id: i64, kind: &str, payload: Value) {
        self.router.send_to_user(consultation_id, user_id, kind, payload);
    }

    /// Queue a message for every current participant of a consultation.
    pub fn send_to_consultation(&self, consultation_id: i64, kind: &str, payload: Value) {
        self.router.send_to_consultation(consultation_id, kind, payload);
    }

    // ─── Presence queries ────────────────────────────────────

    pub fn is_online(&self, consultation_id: i64, user_id: i64) -> bool {
        self.registry.is_online(consultation_id, user_id)
    }

    pub fn online_users(&self, consultation_id: i64) -> Vec<i64> {
        self.registry.online_users(consultation_id)
    }

    pub fn connection_count(&self) -> usize {
        self.registry.connection_count()
    }

    // ─── Connection lifecycle ────────────────────────────────

    pub(crate) fn register(&self, conn: Arc<Connection>) {
        let key = conn.key();

        if let Some(evicted) = self.registry.insert(conn.clone()) {
            // Last-writer-wins: the newer socket owns the key. The evicted
            // connection is closed without an offline event, and its own
            // unregister later fails the identity check.
            tracing::info!(
                consultation_id = key.consultation_id,
                user_id = key.user_id,
                "Evicting previous connection for reconnecting client"
            );
            evicted.close();
        }

        tracing::info!(
            consultation_id = key.consultation_id,
            user_id = key.user_id,
            connections = self.registry.connection_count(),
            "Client connected"
        );

        // Greeting goes straight to this connection; presence fans out to
        // the whole consultation through the router.
        let greeting = frame::encode(
            frame::KIND_CONNECTED,
            json!({
                "userId": key.user_id,
                "consultationId": key.consultation_id,
            }),
        );
        let _ = conn.push(greeting);

        presence::notify_online(&self.router, key);
    }

    /// Remove a connection and shut it down. Only the connection currently
    /// holding its key is removed, and only that first removal emits the
    /// offline event.
    pub(crate) fn unregister(&self, conn: &Arc<Connection>) {
        let removed = self.registry.remove(conn);

        // Closed only after removal, so fan-out stops seeing the
        // connection before its queue goes away.
        conn.close();

        if removed {
            let key = conn.key();
            tracing::info!(
                consultation_id = key.consultation_id,
                user_id = key.user_id,
                connections = self.registry.connection_count(),
                "Client disconnected"
            );
            presence::notify_offline(&self.router, key);
        }
    }

    pub(crate) fn registry(&self) -> &Registry {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ClientKey;
    use axum::extract::ws::Message;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn connect(
        hub: &ChatHub,
        consultation_id: i64,
        user_id: i64,
        capacity: usize,
    ) -> (Arc<Connection>, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(capacity);
        let conn = Connection::new(
            ClientKey {
                consultation_id,
                user_id,
            },
            tx,
        );
        hub.register(conn.clone());
        (conn, rx)
    }

    async fn next_frame(rx: &mut mpsc::Receiver<Message>) -> Value {
        let msg = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("outbound queue closed");
        let Message::Text(text) = msg else {
            panic!("expected text frame, got {msg:?}");
        };
        serde_json::from_str(text.as_str()).expect("frame is not valid JSON")
    }

    #[tokio::test]
    async fn greeting_and_presence_on_register() {
        let (hub, _task) = ChatHub::new();
        let (_conn, mut rx) = connect(&hub, 1, 7, 8);

        let greeting = next_frame(&mut rx).await;
        assert_eq!(greeting["type"], "connected");
        assert_eq!(greeting["data"]["userId"], 7);
        assert_eq!(greeting["data"]["consultationId"], 1);
        assert!(greeting["timestamp"].is_i64());

        let status = next_frame(&mut rx).await;
        assert_eq!(status["type"], "status");
        assert_eq!(status["data"]["userId"], 7);
        assert_eq!(status["data"]["status"], "online");
    }

    #[tokio::test]
    async fn consultation_chat_flow() {
        let (hub, _task) = ChatHub::new();
        let (patient, mut rx_patient) = connect(&hub, 5, 10, 16);
        let (_doctor, mut rx_doctor) = connect(&hub, 5, 20, 16);

        // Patient sees its greeting, its own online event, then the
        // doctor coming online.
        assert_eq!(next_frame(&mut rx_patient).await["type"], "connected");
        assert_eq!(next_frame(&mut rx_patient).await["data"]["status"], "online");
        let doctor_online = next_frame(&mut rx_patient).await;
        assert_eq!(doctor_online["data"]["userId"], 20);
        assert_eq!(doctor_online["data"]["status"], "online");

        // Doctor registered second: greeting plus its own online event.
        assert_eq!(next_frame(&mut rx_doctor).await["type"], "connected");
        assert_eq!(next_frame(&mut rx_doctor).await["data"]["userId"], 20);

        // Consultation-wide broadcast reaches both participants.
        hub.send_to_consultation(5, frame::KIND_TYPING, json!({ "userId": 10, "typing": true }));
        let typing_patient = next_frame(&mut rx_patient).await;
        let typing_doctor = next_frame(&mut rx_doctor).await;
        assert_eq!(typing_patient["type"], "typing");
        assert_eq!(typing_doctor["data"]["typing"], true);

        // Patient disconnects.
        hub.unregister(&patient);
        assert_eq!(hub.online_users(5), vec![20]);
        assert!(!hub.is_online(5, 10));

        let offline = next_frame(&mut rx_doctor).await;
        assert_eq!(offline["type"], "status");
        assert_eq!(offline["data"]["userId"], 10);
        assert_eq!(offline["data"]["status"], "offline");

        // Targeting the departed patient is a silent no-op: the doctor's
        // next frame is the marker, not the chat push.
        hub.send_to_user(5, 10, frame::KIND_CHAT, json!({ "body": "anyone there?" }));
        hub.send_to_consultation(5, "marker", Value::Null);
        assert_eq!(next_frame(&mut rx_doctor).await["type"], "marker");
    }

    #[tokio::test]
    async fn targeted_send_skips_other_participants() {
        let (hub, _task) = ChatHub::new();
        let (_a, mut rx_a) = connect(&hub, 3, 1, 16);
        let (_b, mut rx_b) = connect(&hub, 3, 2, 16);

        for _ in 0..3 {
            next_frame(&mut rx_a).await; // greeting + both online events
        }
        for _ in 0..2 {
            next_frame(&mut rx_b).await;
        }

        hub.send_to_user(3, 2, frame::KIND_CHAT, json!({ "body": "hi" }));
        hub.send_to_consultation(3, "marker", Value::Null);

        let chat = next_frame(&mut rx_b).await;
        assert_eq!(chat["type"], "chat");
        assert_eq!(chat["data"]["body"], "hi");

        // The untargeted participant went straight to the marker.
        assert_eq!(next_frame(&mut rx_a).await["type"], "marker");
    }

    #[tokio::test]
    async fn duplicate_registration_evicts_prior_connection() {
        let (hub, _task) = ChatHub::new();
        let (first, mut rx_first) = connect(&hub, 9, 42, 8);
        next_frame(&mut rx_first).await;
        next_frame(&mut rx_first).await;

        let (_second, mut rx_second) = connect(&hub, 9, 42, 8);
        assert!(first.is_closed());
        assert_eq!(hub.connection_count(), 1);
        assert_eq!(next_frame(&mut rx_second).await["type"], "connected");
        assert_eq!(next_frame(&mut rx_second).await["data"]["status"], "online");

        // A stale unregister from the evicted socket must not kick out the
        // replacement, and must not emit an offline event.
        hub.unregister(&first);
        assert!(hub.is_online(9, 42));

        hub.send_to_consultation(9, "marker", Value::Null);
        assert_eq!(next_frame(&mut rx_second).await["type"], "marker");
    }

    #[tokio::test]
    async fn unregister_twice_emits_one_offline_event() {
        let (hub, _task) = ChatHub::new();
        let (a, _rx_a) = connect(&hub, 2, 1, 8);
        let (_b, mut rx_b) = connect(&hub, 2, 9, 8);
        for _ in 0..2 {
            next_frame(&mut rx_b).await;
        }

        hub.unregister(&a);
        hub.unregister(&a);

        let offline = next_frame(&mut rx_b).await;
        assert_eq!(offline["data"]["status"], "offline");
        assert_eq!(offline["data"]["userId"], 1);

        hub.send_to_consultation(2, "marker", Value::Null);
        assert_eq!(next_frame(&mut rx_b).await["type"], "marker");
    }

    #[tokio::test]
    async fn full_queue_drops_frames_for_that_connection_only() {
        let (hub, _task) = ChatHub::new();
        let (_a, mut rx_a) = connect(&hub, 4, 1, 16);
        let (_b, mut rx_b) = connect(&hub, 4, 2, 1);

        for _ in 0..3 {
            next_frame(&mut rx_a).await;
        }
        // B's capacity-1 queue held the greeting; its own online event was
        // already dropped on the floor.
        next_frame(&mut rx_b).await;

        for seq in 0..3 {
            hub.send_to_consultation(4, frame::KIND_CHAT, json!({ "seq": seq }));
        }
        hub.send_to_consultation(4, "marker", Value::Null);

        // A absorbs the whole burst.
        for seq in 0..3 {
            assert_eq!(next_frame(&mut rx_a).await["data"]["seq"], seq);
        }
        assert_eq!(next_frame(&mut rx_a).await["type"], "marker");

        // B kept exactly the first frame; the rest were dropped while its
        // queue was full. Both connections are still registered.
        assert_eq!(next_frame(&mut rx_b).await["data"]["seq"], 0);
        assert!(rx_b.try_recv().is_err());
        assert_eq!(hub.connection_count(), 2);
    }
}
