//! Connection registry shared by every WebSocket and the task endpoint.
//!
//! The hub owns two collections behind a single lock: the set of admin
//! dashboards and the session → agent mapping. Connections are represented
//! by [`ConnectionHandle`], the sending half of a bounded channel drained by
//! the connection's writer task.

use crate::types::*;
use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::{mpsc, Mutex};

/// Outbound buffer per connection
pub const OUTBOUND_BUFFER: usize = 64;

/// Frame queued for a connection's writer task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
}

/// Why a frame did not make it into a connection's outbound buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SendFailure {
    #[error("connection outbound buffer is full")]
    Full,
    #[error("connection writer is gone")]
    Closed,
}

/// Opaque handle to a live connection
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnId,
    tx: mpsc::Sender<Outbound>,
}

impl ConnectionHandle {
    /// Create a handle plus the receiver its writer task drains
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                id: ulid::Ulid::new(),
                tx,
            },
            rx,
        )
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    /// Queue a frame without waiting for buffer space
    pub fn try_send(&self, frame: Outbound) -> Result<(), SendFailure> {
        self.tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendFailure::Full,
            mpsc::error::TrySendError::Closed(_) => SendFailure::Closed,
        })
    }

    /// Queue a frame, waiting for buffer space if the peer is slow
    pub async fn send(&self, frame: Outbound) -> Result<(), SendFailure> {
        self.tx.send(frame).await.map_err(|_| SendFailure::Closed)
    }
}

/// A registered agent
#[derive(Debug, Clone)]
pub struct AgentConnection {
    pub session_id: SessionId,
    pub app_id: AppId,
    pub conn: ConnectionHandle,
}

#[derive(Default)]
struct Registry {
    admins: HashMap<ConnId, ConnectionHandle>,
    agents: HashMap<SessionId, AgentConnection>,
}

/// Admin set and agent session map, guarded by one mutex
#[derive(Default)]
pub struct Hub {
    registry: Mutex<Registry>,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an admin dashboard. Returns the number of admins afterwards.
    pub async fn register_admin(&self, conn: ConnectionHandle) -> usize {
        let mut registry = self.registry.lock().await;
        registry.admins.insert(conn.id(), conn);
        registry.admins.len()
    }

    /// Remove an admin dashboard. Returns the number of admins afterwards.
    pub async fn unregister_admin(&self, id: ConnId) -> usize {
        let mut registry = self.registry.lock().await;
        registry.admins.remove(&id);
        registry.admins.len()
    }

    /// Insert or replace the agent for `session_id`.
    ///
    /// Last writer wins: a previous connection under the same session is
    /// dropped from the map (but left open) and returned.
    pub async fn register_agent(
        &self,
        session_id: SessionId,
        app_id: AppId,
        conn: ConnectionHandle,
    ) -> Option<AgentConnection> {
        let agent = AgentConnection {
            session_id: session_id.clone(),
            app_id,
            conn,
        };
        self.registry.lock().await.agents.insert(session_id, agent)
    }

    /// Remove the agent registered under `session_id` if it is still the
    /// connection `conn`.
    ///
    /// A connection that was replaced by a newer one for the same session
    /// leaves the newer mapping alone. Returns whether anything was removed.
    pub async fn unregister_agent(&self, session_id: &str, conn: ConnId) -> bool {
        let mut registry = self.registry.lock().await;
        match registry.agents.get(session_id) {
            Some(agent) if agent.conn.id() == conn => {
                registry.agents.remove(session_id);
                true
            }
            _ => false,
        }
    }

    pub async fn lookup_agent(&self, session_id: &str) -> Option<AgentConnection> {
        self.registry.lock().await.agents.get(session_id).cloned()
    }

    pub async fn admin_count(&self) -> usize {
        self.registry.lock().await.admins.len()
    }

    pub async fn agent_count(&self) -> usize {
        self.registry.lock().await.agents.len()
    }

    /// Serialize `message` once and fan it out to every admin.
    ///
    /// Returns how many admins accepted the frame.
    pub async fn broadcast<T: Serialize + ?Sized>(&self, message: &T) -> usize {
        match serde_json::to_string(message) {
            Ok(text) => self.broadcast_text(text).await,
            Err(e) => {
                tracing::error!("Failed to serialize broadcast: {}", e);
                0
            }
        }
    }

    /// Fan out an already serialized frame to every admin.
    ///
    /// The lock is held for the whole fan-out so every admin sees the same
    /// membership snapshot and broadcasts keep a single global order. Each
    /// delivery is a non-blocking `try_send`; a full or closed admin is
    /// skipped and stays registered until its own read loop ends.
    pub async fn broadcast_text(&self, text: String) -> usize {
        let registry = self.registry.lock().await;
        let mut delivered = 0;
        for (id, admin) in &registry.admins {
            match admin.try_send(Outbound::Text(text.clone())) {
                Ok(()) => delivered += 1,
                Err(e) => tracing::debug!(admin = %id, "Broadcast skipped admin: {}", e),
            }
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(frame: Option<Outbound>) -> String {
        match frame {
            Some(Outbound::Text(t)) => t,
            None => panic!("expected text frame, channel closed"),
        }
    }

    #[tokio::test]
    async fn test_register_and_unregister_admin() {
        let hub = Hub::new();
        let (a, _rx_a) = ConnectionHandle::channel(4);
        let (b, _rx_b) = ConnectionHandle::channel(4);

        assert_eq!(hub.register_admin(a.clone()).await, 1);
        assert_eq!(hub.register_admin(b.clone()).await, 2);
        assert_eq!(hub.unregister_admin(a.id()).await, 1);
        // Removing twice is harmless
        assert_eq!(hub.unregister_admin(a.id()).await, 1);
        assert_eq!(hub.admin_count().await, 1);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_admins_only() {
        let hub = Hub::new();
        let (admin1, mut rx1) = ConnectionHandle::channel(4);
        let (admin2, mut rx2) = ConnectionHandle::channel(4);
        let (agent1, mut agent_rx1) = ConnectionHandle::channel(4);
        let (agent2, mut agent_rx2) = ConnectionHandle::channel(4);

        hub.register_admin(admin1).await;
        hub.register_admin(admin2).await;
        hub.register_agent("s1".into(), "".into(), agent1).await;
        hub.register_agent("s2".into(), "".into(), agent2).await;

        let delivered = hub.broadcast(&serde_json::json!({"type": "ping"})).await;
        assert_eq!(delivered, 2);

        assert_eq!(text(rx1.recv().await), r#"{"type":"ping"}"#);
        assert_eq!(text(rx2.recv().await), r#"{"type":"ping"}"#);
        assert!(agent_rx1.try_recv().is_err());
        assert!(agent_rx2.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_broadcast_skips_dead_admin_without_removing_it() {
        let hub = Hub::new();
        let (dead, dead_rx) = ConnectionHandle::channel(4);
        let (live, mut live_rx) = ConnectionHandle::channel(4);
        hub.register_admin(dead).await;
        hub.register_admin(live).await;
        drop(dead_rx);

        assert_eq!(hub.broadcast_text("hello".to_string()).await, 1);
        assert_eq!(text(live_rx.recv().await), "hello");
        assert_eq!(hub.admin_count().await, 2);
    }

    #[tokio::test]
    async fn test_broadcast_skips_full_admin() {
        let hub = Hub::new();
        let (slow, mut slow_rx) = ConnectionHandle::channel(1);
        hub.register_admin(slow).await;

        assert_eq!(hub.broadcast_text("one".to_string()).await, 1);
        assert_eq!(hub.broadcast_text("two".to_string()).await, 0);
        assert_eq!(text(slow_rx.recv().await), "one");
        assert!(slow_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_same_session_last_writer_wins() {
        let hub = Hub::new();
        let (first, _rx1) = ConnectionHandle::channel(4);
        let (second, _rx2) = ConnectionHandle::channel(4);
        let first_id = first.id();
        let second_id = second.id();

        assert!(hub.register_agent("s1".into(), "a".into(), first).await.is_none());
        let replaced = hub
            .register_agent("s1".into(), "b".into(), second)
            .await
            .expect("first agent should be replaced");
        assert_eq!(replaced.conn.id(), first_id);

        let current = hub.lookup_agent("s1").await.unwrap();
        assert_eq!(current.conn.id(), second_id);
        assert_eq!(current.app_id, "b");
        assert_eq!(hub.agent_count().await, 1);
    }

    #[tokio::test]
    async fn test_replaced_agent_disconnect_keeps_successor() {
        let hub = Hub::new();
        let (first, _rx1) = ConnectionHandle::channel(4);
        let (second, _rx2) = ConnectionHandle::channel(4);
        let first_id = first.id();
        let second_id = second.id();
        hub.register_agent("s1".into(), "".into(), first).await;
        hub.register_agent("s1".into(), "".into(), second).await;

        assert!(!hub.unregister_agent("s1", first_id).await);
        assert!(hub.lookup_agent("s1").await.is_some());

        assert!(hub.unregister_agent("s1", second_id).await);
        assert!(hub.lookup_agent("s1").await.is_none());
        // Already gone
        assert!(!hub.unregister_agent("s1", second_id).await);
    }
}
