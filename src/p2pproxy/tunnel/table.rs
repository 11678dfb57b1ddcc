use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use serde::Serialize;

use crate::p2pproxy::tunnel::session::Session;

#[derive(Debug, Clone, Serialize)]
pub struct ConnInfo {
    pub id: u32,
    pub peer: String,
    pub started_at_unix_ms: u64,
}

/// Connection id -> session map shared by the accept path and the
/// control-channel reader.
///
/// Lookups clone the `Arc` out of the map so no shard lock is ever held across
/// an await point.
#[derive(Debug, Default)]
pub struct ConnTable {
    conns: DashMap<u32, Arc<Session>>,
}

impl ConnTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `sess` under `id`, returning whatever was there before.
    pub fn insert(&self, id: u32, sess: Arc<Session>) -> Option<Arc<Session>> {
        let prev = self.conns.insert(id, sess);
        if prev.is_none() {
            metrics::gauge!("p2pproxy_active_connections").increment(1.0);
        }
        prev
    }

    pub fn get(&self, id: u32) -> Option<Arc<Session>> {
        self.conns.get(&id).map(|e| e.value().clone())
    }

    pub fn remove(&self, id: u32) -> Option<Arc<Session>> {
        let out = self.conns.remove(&id).map(|(_, s)| s);
        if out.is_some() {
            metrics::gauge!("p2pproxy_active_connections").decrement(1.0);
        }
        out
    }

    /// Removes `id` only if it still maps to `sess`.
    pub fn remove_if_same(&self, id: u32, sess: &Arc<Session>) -> bool {
        let removed = self
            .conns
            .remove_if(&id, |_, cur| Arc::ptr_eq(cur, sess))
            .is_some();
        if removed {
            metrics::gauge!("p2pproxy_active_connections").decrement(1.0);
        }
        removed
    }

    /// Queues `payload` on the session for `id`. Returns `false` if the id is
    /// gone or its session already stopped.
    pub fn forward(&self, id: u32, payload: Bytes) -> bool {
        match self.get(id) {
            Some(sess) => sess.write(payload),
            None => false,
        }
    }

    /// Removes and closes the session for `id`, if any.
    pub fn shutdown(&self, id: u32) -> bool {
        match self.remove(id) {
            Some(sess) => {
                sess.close();
                true
            }
            None => false,
        }
    }

    /// Removes and closes every session. Returns how many were closed.
    pub fn close_all(&self) -> usize {
        let ids: Vec<u32> = self.conns.iter().map(|e| *e.key()).collect();
        ids.into_iter().filter(|id| self.shutdown(*id)).count()
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    pub fn contains(&self, id: u32) -> bool {
        self.conns.contains_key(&id)
    }

    pub fn snapshot(&self) -> Vec<ConnInfo> {
        let mut out: Vec<ConnInfo> = self
            .conns
            .iter()
            .map(|e| ConnInfo {
                id: *e.key(),
                peer: e.value().peer().map(|a| a.to_string()).unwrap_or_default(),
                started_at_unix_ms: e.value().started_at_unix_ms(),
            })
            .collect();
        out.sort_by(|a, b| {
            a.started_at_unix_ms
                .cmp(&b.started_at_unix_ms)
                .then(a.id.cmp(&b.id))
        });
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::p2pproxy::tunnel::session::tests::socket_pair;

    async fn session() -> Arc<Session> {
        let (a, _b) = socket_pair().await;
        Arc::new(Session::new(a))
    }

    #[tokio::test]
    async fn remove_is_idempotent_and_closes_once() {
        let t = ConnTable::new();
        let s = session().await;
        t.insert(1, s.clone());

        assert!(t.shutdown(1));
        assert!(!t.shutdown(1));
        assert!(t.remove(1).is_none());
        assert!(!s.is_running());
        assert!(t.is_empty());
    }

    #[tokio::test]
    async fn remove_if_same_ignores_replaced_session() {
        let t = ConnTable::new();
        let old = session().await;
        let new = session().await;
        t.insert(7, old.clone());
        t.insert(7, new.clone());

        assert!(!t.remove_if_same(7, &old));
        assert!(t.contains(7));
        assert!(t.remove_if_same(7, &new));
        assert!(!t.contains(7));
    }

    #[tokio::test]
    async fn forward_to_missing_id_is_dropped() {
        let t = ConnTable::new();
        assert!(!t.forward(3, Bytes::from_static(b"x")));
    }

    #[tokio::test]
    async fn closing_one_id_leaves_others_running() {
        let t = ConnTable::new();
        let a = session().await;
        let b = session().await;
        t.insert(1, a.clone());
        t.insert(2, b.clone());

        t.shutdown(1);
        assert!(!a.is_running());
        assert!(b.is_running());
        assert!(t.forward(2, Bytes::from_static(b"still here")));

        assert_eq!(t.close_all(), 1);
        assert!(!b.is_running());
    }
}
