//! Tier Server
//!
//! Binds one tier's listener and runs a [`Responder`] on every accepted
//! connection. Authenticated identities are recorded in the connection
//! registry; every session event is forwarded to an optional observer.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, instrument};

use super::connection::{ConnectionSettings, SessionEvent};
use super::listener::{Listener, ListenerConfig};
use super::protocol::{ClientLoginProtocol, Protocol};
use super::session::ConnectionRegistry;
use super::NetError;
use crate::db::CredentialStore;
use crate::handshake::Responder;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address.
    pub bind_addr: String,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Unauthenticated connections are closed after this long.
    pub handshake_timeout: Duration,
    /// Failed logon rounds allowed per connection.
    pub max_auth_attempts: u32,
}

impl ServerConfig {
    /// Defaults bound to the tier's conventional port.
    pub fn for_protocol<P: Protocol>() -> Self {
        Self {
            bind_addr: format!("0.0.0.0:{}", P::TIER.default_port()),
            ..Self::default()
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: format!("0.0.0.0:{}", ClientLoginProtocol::TIER.default_port()),
            max_connections: 1000,
            handshake_timeout: Duration::from_secs(30),
            max_auth_attempts: 3,
        }
    }
}

/// Responder side of one tier.
pub struct AuthServer<P: Protocol> {
    config: ServerConfig,
    store: Arc<dyn CredentialStore>,
    registry: Arc<ConnectionRegistry>,
    shutdown_tx: broadcast::Sender<()>,
    _protocol: PhantomData<fn() -> P>,
}

impl<P: Protocol> AuthServer<P> {
    /// Server authenticating against `store`.
    pub fn new(config: ServerConfig, store: Arc<dyn CredentialStore>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            store,
            registry: Arc::new(ConnectionRegistry::new()),
            shutdown_tx,
            _protocol: PhantomData,
        }
    }

    /// Live connections.
    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        self.registry.clone()
    }

    /// Stop accepting and close every connection.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Bind the configured address.
    pub async fn bind(&self) -> Result<Listener<P>, NetError> {
        Listener::bind(&self.config.bind_addr).await
    }

    /// Accept until [`AuthServer::shutdown`].
    #[instrument(skip_all, fields(tier = %P::TIER, addr = %listener.local_addr()))]
    pub async fn run(
        &self,
        listener: Listener<P>,
        observer: Option<mpsc::UnboundedSender<SessionEvent>>,
    ) {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let registry = self.registry.clone();

        let pump = tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                if let SessionEvent::Authenticated { id, identity, .. } = &event {
                    registry.mark_authenticated(id, identity).await;
                }
                if let Some(observer) = &observer {
                    let _ = observer.send(event);
                }
            }
            debug!("event pump finished");
        });

        let store = self.store.clone();
        let max_attempts = self.config.max_auth_attempts;
        let config = ListenerConfig {
            max_connections: self.config.max_connections,
            connection: ConnectionSettings {
                handshake_timeout: self.config.handshake_timeout,
            },
        };

        listener
            .run(
                move || Responder::new(store.clone(), max_attempts),
                config,
                self.registry.clone(),
                events_tx,
                self.shutdown_tx.clone(),
            )
            .await;

        // Connections saw the same signal; the pump ends once they are gone.
        let _ = pump.await;
        info!("server stopped");
    }
}
