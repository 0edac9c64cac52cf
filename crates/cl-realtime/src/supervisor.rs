//! Liveness supervisor — reclaims connections that stopped talking.
//!
//! Keepalive pings go out from each connection's write pump; this worker
//! sweeps the registry and force-closes sockets with no inbound traffic
//! (frames or pong replies) for the full timeout window. Reclamation goes
//! through the normal unregister path, so presence consumers see exactly
//! one offline transition.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::hub::ChatHub;

const SWEEP_INTERVAL_SECS: u64 = 30;
const IDLE_TIMEOUT_SECS: i64 = 60;

pub fn start(hub: Arc<ChatHub>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(SWEEP_INTERVAL_SECS));

        tracing::info!(
            "Liveness supervisor started (every {}s, timeout {}s)",
            SWEEP_INTERVAL_SECS,
            IDLE_TIMEOUT_SECS
        );

        loop {
            interval.tick().await;

            let reaped = sweep(&hub);
            if reaped > 0 {
                tracing::info!(count = reaped, "Liveness supervisor: reclaimed dead connections");
            }
        }
    })
}

/// One sweep pass. Returns how many connections were reclaimed.
fn sweep(hub: &ChatHub) -> usize {
    let stale = hub.registry().idle_connections(IDLE_TIMEOUT_SECS);

    for conn in &stale {
        let key = conn.key();
        tracing::warn!(
            consultation_id = key.consultation_id,
            user_id = key.user_id,
            "Connection idle past timeout, closing"
        );
        hub.unregister(conn);
    }

    stale.len()
}
