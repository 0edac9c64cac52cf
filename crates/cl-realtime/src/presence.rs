//! Presence notifier — translates registry transitions into `status`
//! broadcasts for the affected consultation.
//!
//! One event per effective register/unregister, no deduplication: rapid
//! connect/disconnect cycles produce one transition each, and consumers
//! treat presence as a stream of transitions rather than a snapshot.

use serde_json::json;

use crate::frame;
use crate::registry::ClientKey;
use crate::router::Router;

pub(crate) fn notify_online(router: &Router, key: ClientKey) {
    notify(router, key, "online");
}

pub(crate) fn notify_offline(router: &Router, key: ClientKey) {
    notify(router, key, "offline");
}

fn notify(router: &Router, key: ClientKey, status: &str) {
    router.send_to_consultation(
        key.consultation_id,
        frame::KIND_STATUS,
        json!({ "userId": key.user_id, "status": status }),
    );
}
