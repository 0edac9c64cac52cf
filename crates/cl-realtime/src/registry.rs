//! In-memory registry for live chat connections.
//!
//! Tracks which `(consultation, user)` pairs hold a live WebSocket on this
//! server instance. Three indexes cover the lookup patterns of the router
//! and the presence queries; all three are mutated under a single lock so
//! a connection is observable in all of them or in none.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use axum::extract::ws::Message;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

/// Capacity of each connection's outbound queue.
pub const OUTBOUND_QUEUE: usize = 256;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of one addressable connection slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientKey {
    pub consultation_id: i64,
    pub user_id: i64,
}

/// Handle for one live client connection, shared between the registry,
/// the router, and the connection's own pumps.
#[derive(Debug)]
pub struct Connection {
    id: u64,
    key: ClientKey,
    tx: mpsc::Sender<Message>,
    cancel: CancellationToken,
    /// Unix seconds of the last inbound frame, updated by the read pump.
    last_seen: AtomicI64,
}

impl Connection {
    pub(crate) fn new(key: ClientKey, tx: mpsc::Sender<Message>) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
            key,
            tx,
            cancel: CancellationToken::new(),
            last_seen: AtomicI64::new(chrono::Utc::now().timestamp()),
        })
    }

    pub fn key(&self) -> ClientKey {
        self.key
    }

    /// Non-blocking enqueue onto this connection's outbound queue.
    pub(crate) fn push(&self, frame: Message) -> Result<(), TrySendError<Message>> {
        self.tx.try_send(frame)
    }

    /// Record inbound traffic for liveness accounting.
    pub(crate) fn touch(&self) {
        self.last_seen
            .store(chrono::Utc::now().timestamp(), Ordering::Relaxed);
    }

    pub(crate) fn idle_secs(&self, now: i64) -> i64 {
        now - self.last_seen.load(Ordering::Relaxed)
    }

    /// Signal teardown. Idempotent; both pumps watch this token.
    pub(crate) fn close(&self) {
        self.cancel.cancel();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the connection has been told to shut down.
    pub(crate) async fn closed(&self) {
        self.cancel.cancelled().await;
    }

    #[cfg(test)]
    pub(crate) fn set_last_seen(&self, unix_secs: i64) {
        self.last_seen.store(unix_secs, Ordering::Relaxed);
    }
}

#[derive(Debug, Default)]
struct Indexes {
    /// (consultation, user) → the one connection owning that slot
    by_key: HashMap<ClientKey, Arc<Connection>>,
    /// consultation → every live connection in that consultation
    by_consultation: HashMap<i64, Vec<Arc<Connection>>>,
    /// user → every live connection of that user, across consultations
    by_user: HashMap<i64, Vec<Arc<Connection>>>,
}

/// Connection registry with one serialization point for all three indexes.
#[derive(Debug, Default)]
pub struct Registry {
    inner: Mutex<Indexes>,
}

impl Registry {
    fn lock(&self) -> MutexGuard<'_, Indexes> {
        // A poisoned lock only means a holder panicked; the map operations
        // below never leave partial state behind.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert a connection under its key. If the key is already occupied,
    /// the previous holder is detached from every index and returned so
    /// the caller can force-close it (last-writer-wins).
    pub(crate) fn insert(&self, conn: Arc<Connection>) -> Option<Arc<Connection>> {
        let mut idx = self.lock();
        let key = conn.key();

        let evicted = idx.by_key.insert(key, conn.clone());
        if let Some(prev) = &evicted {
            detach(&mut idx, prev);
        }

        idx.by_consultation
            .entry(key.consultation_id)
            .or_default()
            .push(conn.clone());
        idx.by_user.entry(key.user_id).or_default().push(conn);

        evicted
    }

    /// Remove a connection, but only if it still owns its key. Returns
    /// whether anything was removed — a stale handle (evicted earlier, or
    /// already unregistered) is a no-op.
    pub(crate) fn remove(&self, conn: &Arc<Connection>) -> bool {
        let mut idx = self.lock();
        let key = conn.key();

        match idx.by_key.get(&key) {
            Some(current) if current.id == conn.id => {
                idx.by_key.remove(&key);
                detach(&mut idx, conn);
                true
            }
            _ => false,
        }
    }

    pub fn is_online(&self, consultation_id: i64, user_id: i64) -> bool {
        self.lock().by_key.contains_key(&ClientKey {
            consultation_id,
            user_id,
        })
    }

    /// User ids with a live connection in the given consultation.
    pub fn online_users(&self, consultation_id: i64) -> Vec<i64> {
        self.lock()
            .by_consultation
            .get(&consultation_id)
            .map(|list| list.iter().map(|c| c.key().user_id).collect())
            .unwrap_or_default()
    }

    pub fn connection_count(&self) -> usize {
        self.lock().by_key.len()
    }

    pub(crate) fn lookup(&self, key: &ClientKey) -> Option<Arc<Connection>> {
        self.lock().by_key.get(key).cloned()
    }

    /// Snapshot of a consultation's connections for fan-out.
    pub(crate) fn connections(&self, consultation_id: i64) -> Vec<Arc<Connection>> {
        self.lock()
            .by_consultation
            .get(&consultation_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Connections whose last inbound frame is at least `max_idle_secs` old.
    pub(crate) fn idle_connections(&self, max_idle_secs: i64) -> Vec<Arc<Connection>> {
        let now = chrono::Utc::now().timestamp();
        self.lock()
            .by_key
            .values()
            .filter(|c| c.idle_secs(now) >= max_idle_secs)
            .cloned()
            .collect()
    }
}

/// Remove a connection from the consultation and user indexes, dropping
/// buckets that become empty.
fn detach(idx: &mut Indexes, conn: &Connection) {
    let key = conn.key();

    if let Some(list) = idx.by_consultation.get_mut(&key.consultation_id) {
        list.retain(|c| c.id != conn.id);
        if list.is_empty() {
            idx.by_consultation.remove(&key.consultation_id);
        }
    }

    if let Some(list) = idx.by_user.get_mut(&key.user_id) {
        list.retain(|c| c.id != conn.id);
        if list.is_empty() {
            idx.by_user.remove(&key.user_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn(consultation_id: i64, user_id: i64) -> Arc<Connection> {
        let (tx, _rx) = mpsc::channel(4);
        Connection::new(
            ClientKey {
                consultation_id,
                user_id,
            },
            tx,
        )
    }

    fn assert_consistent(registry: &Registry) {
        let idx = registry.lock();

        let key_count = idx.by_key.len();
        let consultation_count: usize = idx.by_consultation.values().map(Vec::len).sum();
        let user_count: usize = idx.by_user.values().map(Vec::len).sum();
        assert_eq!(key_count, consultation_count);
        assert_eq!(key_count, user_count);

        for (key, conn) in &idx.by_key {
            assert!(idx.by_consultation[&key.consultation_id]
                .iter()
                .any(|c| c.id == conn.id));
            assert!(idx.by_user[&key.user_id].iter().any(|c| c.id == conn.id));
        }

        assert!(idx.by_consultation.values().all(|v| !v.is_empty()));
        assert!(idx.by_user.values().all(|v| !v.is_empty()));
    }

    #[test]
    fn indexes_stay_consistent_across_churn() {
        let registry = Registry::default();
        let a = conn(1, 10);
        let b = conn(1, 20);
        let c = conn(2, 10);

        registry.insert(a.clone());
        assert_consistent(&registry);
        registry.insert(b.clone());
        registry.insert(c.clone());
        assert_consistent(&registry);
        assert_eq!(registry.connection_count(), 3);

        assert!(registry.remove(&a));
        assert_consistent(&registry);
        assert!(registry.remove(&c));
        assert_consistent(&registry);
        assert_eq!(registry.online_users(1), vec![20]);

        assert!(registry.remove(&b));
        assert_consistent(&registry);
        assert_eq!(registry.connection_count(), 0);
    }

    #[test]
    fn remove_is_idempotent() {
        let registry = Registry::default();
        let a = conn(3, 30);

        registry.insert(a.clone());
        assert!(registry.remove(&a));
        assert!(!registry.remove(&a));
        assert_consistent(&registry);
    }

    #[test]
    fn insert_evicts_same_key() {
        let registry = Registry::default();
        let first = conn(7, 1);
        let second = conn(7, 1);

        assert!(registry.insert(first.clone()).is_none());
        let evicted = registry.insert(second.clone()).expect("first is evicted");
        assert_eq!(evicted.id, first.id);
        assert_consistent(&registry);
        assert_eq!(registry.connection_count(), 1);

        // The evicted handle no longer owns the key.
        assert!(!registry.remove(&first));
        assert!(registry.is_online(7, 1));
        assert_consistent(&registry);
    }

    #[test]
    fn online_users_scoped_to_consultation() {
        let registry = Registry::default();
        registry.insert(conn(5, 10));
        registry.insert(conn(5, 20));
        registry.insert(conn(6, 30));

        let mut users = registry.online_users(5);
        users.sort_unstable();
        assert_eq!(users, vec![10, 20]);
        assert_eq!(registry.online_users(6), vec![30]);
        assert!(registry.online_users(99).is_empty());
        assert!(!registry.is_online(6, 10));
    }
}
