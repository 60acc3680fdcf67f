//! Initiator side of a tier: connect, authenticate, then exchange
//! application packets over the ciphered link.

use std::marker::PhantomData;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{info, instrument};

use super::connection::{
    CloseReason, Connection, ConnectionHandle, ConnectionSettings, SessionEvent,
};
use super::connector::Connector;
use super::protocol::{Packet, Protocol};
use super::NetError;
use crate::auth::SessionKey;
use crate::handshake::{HandshakeOutcome, Initiator};

/// Connects to a peer and runs the handshake as initiator.
#[derive(Debug, Clone)]
pub struct AuthClient<P: Protocol> {
    connector: Connector,
    settings: ConnectionSettings,
    _protocol: PhantomData<fn() -> P>,
}

impl<P: Protocol> AuthClient<P> {
    /// Client for `host:port`.
    pub fn new(host: impl Into<String>, port: u16, settings: ConnectionSettings) -> Self {
        Self {
            connector: Connector::new(host, port),
            settings,
            _protocol: PhantomData,
        }
    }

    /// Full SRP6 logon.
    #[instrument(skip(self, password), fields(tier = %P::TIER, target = %self.connector.target()))]
    pub async fn logon(
        &self,
        identity: &str,
        password: &str,
    ) -> Result<AuthenticatedLink<P>, NetError> {
        let (role, outcome) = Initiator::logon(identity, password)?;
        self.establish(role, outcome).await
    }

    /// Resume with the key from an earlier logon.
    #[instrument(
        skip(self, session_key),
        fields(tier = %P::TIER, target = %self.connector.target())
    )]
    pub async fn reconnect(
        &self,
        identity: &str,
        session_key: SessionKey,
    ) -> Result<AuthenticatedLink<P>, NetError> {
        let (role, outcome) = Initiator::reconnect(identity, session_key)?;
        self.establish(role, outcome).await
    }

    async fn establish(
        &self,
        role: Initiator,
        outcome: oneshot::Receiver<HandshakeOutcome>,
    ) -> Result<AuthenticatedLink<P>, NetError> {
        let (stream, peer) = self.connector.connect().await?;
        let (events_tx, events) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let (handle, task) = Connection::<P, Initiator>::spawn(
            stream,
            peer,
            role,
            self.settings,
            events_tx,
            shutdown_rx,
        );

        match outcome.await {
            Ok(Ok(session_key)) => {
                info!(%peer, "link established");
                Ok(AuthenticatedLink {
                    handle,
                    session_key,
                    events,
                    shutdown_tx,
                    task,
                    _protocol: PhantomData,
                })
            }
            Ok(Err(error)) => {
                handle.close();
                Err(error.into())
            }
            Err(_) => Err(NetError::Closed),
        }
    }
}

/// Authenticated connection held by the initiator.
pub struct AuthenticatedLink<P: Protocol> {
    handle: ConnectionHandle,
    session_key: SessionKey,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    shutdown_tx: broadcast::Sender<()>,
    task: JoinHandle<CloseReason>,
    _protocol: PhantomData<fn() -> P>,
}

impl<P: Protocol> AuthenticatedLink<P> {
    /// Handle to the underlying connection.
    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    /// Negotiated session key.
    pub fn session_key(&self) -> &SessionKey {
        &self.session_key
    }

    /// Send an application packet. Returns `false` once closed.
    pub fn send(&self, opcode: u16, body: Vec<u8>) -> bool {
        self.handle.send(Packet::new(opcode, body))
    }

    /// Next application packet, or `None` once the connection closed.
    pub async fn next_packet(&mut self) -> Option<Packet> {
        loop {
            match self.events.recv().await? {
                SessionEvent::Packet { packet, .. } => return Some(packet),
                SessionEvent::Closed { .. } => return None,
                _ => continue,
            }
        }
    }

    /// Close and wait for the connection task.
    pub async fn close(self) -> CloseReason {
        let _ = self.shutdown_tx.send(());
        self.task
            .await
            .unwrap_or_else(|e| CloseReason::Io(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AuthResult, HandshakeError};
    use crate::db::MemoryStore;
    use crate::network::protocol::{ClientWorldProtocol, RealmWorldProtocol};
    use crate::network::server::{AuthServer, ServerConfig};
    use std::sync::Arc;
    use std::time::Duration;

    async fn start<P: Protocol>(store: MemoryStore) -> (Arc<AuthServer<P>>, u16) {
        let config = ServerConfig {
            bind_addr: "127.0.0.1:0".into(),
            max_auth_attempts: 1,
            ..ServerConfig::for_protocol::<P>()
        };
        let server = Arc::new(AuthServer::<P>::new(config, Arc::new(store)));
        let listener = server.bind().await.unwrap();
        let port = listener.local_addr().port();
        let running = server.clone();
        tokio::spawn(async move { running.run(listener, None).await });
        (server, port)
    }

    #[tokio::test]
    async fn test_logon_then_application_traffic() {
        let store = MemoryStore::new();
        store.register("worldd", "pw").await;
        let (server, port) = start::<RealmWorldProtocol>(store).await;

        let client = AuthClient::<RealmWorldProtocol>::new(
            "127.0.0.1",
            port,
            ConnectionSettings::default(),
        );
        let mut link = client.logon("worldd", "pw").await.unwrap();

        // Push a packet from the server side to the authenticated client.
        let registry = server.registry();
        let entry = loop {
            let authenticated = registry
                .entries()
                .await
                .into_iter()
                .find(|e| e.identity.is_some());
            if let Some(entry) = authenticated {
                break entry;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        let opcode = RealmWorldProtocol::APPLICATION_OPCODES[0].0;
        assert!(entry.handle.send(Packet::new(opcode, b"hello".to_vec())));

        let packet = link.next_packet().await.unwrap();
        assert_eq!(packet.opcode, opcode);
        assert_eq!(packet.body, b"hello");

        assert_eq!(link.close().await, CloseReason::Shutdown);
        server.shutdown();
    }

    #[tokio::test]
    async fn test_wrong_password_is_handshake_error() {
        let store = MemoryStore::new();
        store.register("player", "right").await;
        let (server, port) = start::<ClientWorldProtocol>(store).await;

        let client = AuthClient::<ClientWorldProtocol>::new(
            "127.0.0.1",
            port,
            ConnectionSettings::default(),
        );
        let err = client.logon("player", "wrong").await.err().unwrap();
        assert!(matches!(
            err,
            NetError::Handshake(HandshakeError::Rejected(AuthResult::FailWrongCredentials))
        ));
        server.shutdown();
    }

    #[tokio::test]
    async fn test_unreachable_peer() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let client = AuthClient::<ClientWorldProtocol>::new(
            "127.0.0.1",
            port,
            ConnectionSettings::default(),
        );
        let err = client.logon("player", "pw").await.err().unwrap();
        assert!(matches!(err, NetError::Exhausted { .. }));
    }

    #[tokio::test]
    async fn test_oversized_identity_fails_before_connecting() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let client = AuthClient::<ClientWorldProtocol>::new(
            "127.0.0.1",
            port,
            ConnectionSettings::default(),
        );
        let err = client.logon(&"p".repeat(300), "pw").await.err().unwrap();
        assert!(matches!(
            err,
            NetError::Handshake(HandshakeError::InvalidIdentity(300))
        ));
    }
}
