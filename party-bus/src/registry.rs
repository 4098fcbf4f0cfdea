use std::{collections::HashMap, sync::Arc};

use tokio::sync::Mutex;
use tracing::info;

use crate::session::{Peer, PeerSink, Session};

/// Process-wide map from session identifier to the live [`Session`].
///
/// Joining and leaving run under the registry lock, so a peer can never be
/// added to a session that is concurrently being deleted, and at most one
/// session exists per identifier.
#[derive(Default)]
pub struct Registry {
    sessions: Mutex<HashMap<String, Arc<Session>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the session registered under `session_id`, creating it if needed.
    pub async fn get_or_create(&self, session_id: &str) -> Arc<Session> {
        let mut sessions = self.sessions.lock().await;
        get_or_insert(&mut sessions, session_id)
    }

    pub async fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.lock().await.get(session_id).cloned()
    }

    pub async fn delete(&self, session_id: &str) {
        let mut sessions = self.sessions.lock().await;
        if sessions.remove(session_id).is_some() {
            info!(session_id, "session deleted");
        }
    }

    /// Adds an anonymous peer to the session, creating the session first when
    /// it does not exist yet.
    pub async fn join(&self, session_id: &str, sink: PeerSink) -> (Arc<Session>, Arc<Peer>) {
        let mut sessions = self.sessions.lock().await;
        let session = get_or_insert(&mut sessions, session_id);
        let peer = session.add_peer(sink).await;
        (session, peer)
    }

    /// Removes the peer and drops the session once it is empty. Returns the
    /// number of peers left in the session.
    pub async fn leave(&self, session: &Arc<Session>, peer: &Peer) -> usize {
        let mut sessions = self.sessions.lock().await;
        let remaining = session.remove_peer(peer).await;
        if remaining == 0 {
            let registered = sessions
                .get(session.id())
                .is_some_and(|current| Arc::ptr_eq(current, session));
            if registered {
                sessions.remove(session.id());
                info!(session_id = session.id(), "session deleted");
            }
        }
        remaining
    }

    pub async fn contains(&self, session_id: &str) -> bool {
        self.sessions.lock().await.contains_key(session_id)
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }

    /// Snapshot of the live sessions.
    pub async fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions.lock().await.values().cloned().collect()
    }
}

fn get_or_insert(sessions: &mut HashMap<String, Arc<Session>>, session_id: &str) -> Arc<Session> {
    if let Some(session) = sessions.get(session_id) {
        return Arc::clone(session);
    }

    let session = Arc::new(Session::new(session_id));
    sessions.insert(session_id.to_string(), Arc::clone(&session));
    info!(session_id, "session created");
    session
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::tests::test_sink;

    #[tokio::test]
    async fn concurrent_first_joins_share_one_session() {
        let registry = Arc::new(Registry::new());

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move { registry.get_or_create("blue-bus").await })
            })
            .collect();

        let mut sessions = Vec::new();
        for handle in handles {
            sessions.push(handle.await.expect("task"));
        }

        assert!(sessions
            .windows(2)
            .all(|pair| Arc::ptr_eq(&pair[0], &pair[1])));
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn sessions_are_independent() {
        let registry = Registry::new();
        let blue = registry.get_or_create("blue-bus").await;
        let red = registry.get_or_create("red-bus").await;

        assert!(!Arc::ptr_eq(&blue, &red));
        assert_eq!(registry.len().await, 2);
    }

    #[tokio::test]
    async fn last_leave_deletes_the_session() {
        let registry = Registry::new();
        let (first_sink, _rx_one) = test_sink();
        let (second_sink, _rx_two) = test_sink();
        let (session, alice) = registry.join("blue-bus", first_sink).await;
        let (same, bob) = registry.join("blue-bus", second_sink).await;
        assert!(Arc::ptr_eq(&session, &same));

        assert_eq!(registry.leave(&session, &alice).await, 1);
        assert!(registry.contains("blue-bus").await);

        assert_eq!(registry.leave(&session, &bob).await, 0);
        assert!(!registry.contains("blue-bus").await);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn rejoin_after_deletion_starts_fresh() {
        let registry = Registry::new();
        let (sink, _rx) = test_sink();
        let (old, peer) = registry.join("blue-bus", sink).await;
        old.identify(&peer, "alice").await.expect("identify");
        registry.leave(&old, &peer).await;

        let (sink, _rx) = test_sink();
        let (fresh, _peer) = registry.join("blue-bus", sink).await;

        assert!(!Arc::ptr_eq(&old, &fresh));
        assert_eq!(fresh.peer_count().await, 1);
        assert!(fresh.peer_ids().await.is_empty());
    }

    #[tokio::test]
    async fn stale_session_does_not_remove_its_successor() {
        let registry = Registry::new();
        let (sink, _rx) = test_sink();
        let (old, peer) = registry.join("blue-bus", sink).await;
        registry.delete("blue-bus").await;
        let fresh = registry.get_or_create("blue-bus").await;

        registry.leave(&old, &peer).await;

        let current = registry.get("blue-bus").await.expect("session present");
        assert!(Arc::ptr_eq(&current, &fresh));
    }
}
