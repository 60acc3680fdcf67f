//! Connection Registry
//!
//! Tracks live connections per listener from accept to close, and which of
//! them have completed the handshake. Entries are added by the accept loop
//! and removed when the connection task finishes.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::connection::{ConnectionHandle, ConnectionId};
use super::protocol::TrustTier;

/// A live connection.
#[derive(Debug, Clone)]
pub struct ConnectionEntry {
    /// Handle for sending to or closing the connection.
    pub handle: ConnectionHandle,
    /// Tier the connection was accepted on.
    pub tier: TrustTier,
    /// Accept time.
    pub connected_at: DateTime<Utc>,
    /// Authenticated identity, once the handshake completes.
    pub identity: Option<String>,
}

/// All live connections of one server.
#[derive(Default)]
pub struct ConnectionRegistry {
    entries: RwLock<BTreeMap<ConnectionId, ConnectionEntry>>,
}

impl ConnectionRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a newly accepted connection.
    pub async fn insert(&self, handle: ConnectionHandle, tier: TrustTier) {
        let entry = ConnectionEntry {
            handle: handle.clone(),
            tier,
            connected_at: Utc::now(),
            identity: None,
        };
        self.entries.write().await.insert(handle.id(), entry);
    }

    /// Forget a connection. Returns the entry if it was tracked.
    pub async fn remove(&self, id: &ConnectionId) -> Option<ConnectionEntry> {
        self.entries.write().await.remove(id)
    }

    /// Record the authenticated identity. Returns `false` for unknown ids.
    pub async fn mark_authenticated(&self, id: &ConnectionId, identity: &str) -> bool {
        match self.entries.write().await.get_mut(id) {
            Some(entry) => {
                entry.identity = Some(identity.to_string());
                true
            }
            None => false,
        }
    }

    /// Look up a connection.
    pub async fn get(&self, id: &ConnectionId) -> Option<ConnectionEntry> {
        self.entries.read().await.get(id).cloned()
    }

    /// Snapshot of every live connection.
    pub async fn entries(&self) -> Vec<ConnectionEntry> {
        self.entries.read().await.values().cloned().collect()
    }

    /// Live connection count.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// `true` when nothing is connected.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Connections that completed the handshake.
    pub async fn authenticated_count(&self) -> usize {
        self.entries
            .read()
            .await
            .values()
            .filter(|e| e.identity.is_some())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::connection::{Connection, ConnectionSettings, SessionRole};
    use crate::network::protocol::ClientLoginProtocol;
    use tokio::sync::{broadcast, mpsc};

    struct Idle;

    impl SessionRole<ClientLoginProtocol> for Idle {
        fn on_open(_conn: &mut Connection<ClientLoginProtocol, Self>) {}

        fn is_authenticated(&self) -> bool {
            true
        }
    }

    fn spawn_idle() -> (ConnectionHandle, tokio::io::DuplexStream) {
        let (client, server) = tokio::io::duplex(64);
        let (events, _) = mpsc::unbounded_channel();
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let (handle, _task) = Connection::<ClientLoginProtocol, Idle>::spawn(
            server,
            "127.0.0.1:1".parse().unwrap(),
            Idle,
            ConnectionSettings::default(),
            events,
            shutdown_rx,
        );
        (handle, client)
    }

    #[tokio::test]
    async fn test_insert_authenticate_remove() {
        let registry = ConnectionRegistry::new();
        let (handle, _client) = spawn_idle();
        let id = handle.id();

        registry.insert(handle, TrustTier::ClientLogin).await;
        assert_eq!(registry.len().await, 1);
        assert_eq!(registry.authenticated_count().await, 0);

        assert!(registry.mark_authenticated(&id, "TESTUSER").await);
        assert_eq!(registry.authenticated_count().await, 1);
        assert_eq!(
            registry.get(&id).await.unwrap().identity.as_deref(),
            Some("TESTUSER")
        );

        assert!(registry.remove(&id).await.is_some());
        assert!(registry.is_empty().await);
        assert!(!registry.mark_authenticated(&id, "TESTUSER").await);
    }
}
