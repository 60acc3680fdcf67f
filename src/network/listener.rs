//! Accept loop for one tier.

use std::marker::PhantomData;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use super::connection::{Connection, ConnectionSettings, SessionEvent, SessionRole};
use super::protocol::Protocol;
use super::session::ConnectionRegistry;
use super::NetError;

/// Accept loop limits.
#[derive(Debug, Clone, Copy)]
pub struct ListenerConfig {
    /// Further connections are dropped at accept while this many are live.
    pub max_connections: usize,
    /// Applied to each accepted connection.
    pub connection: ConnectionSettings,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            max_connections: 1000,
            connection: ConnectionSettings::default(),
        }
    }
}

/// Bound listening socket speaking protocol `P`.
pub struct Listener<P: Protocol> {
    socket: TcpListener,
    local_addr: SocketAddr,
    _protocol: PhantomData<fn() -> P>,
}

impl<P: Protocol> Listener<P> {
    /// Bind `addr`. Failure is fatal to the caller.
    pub async fn bind(addr: &str) -> Result<Self, NetError> {
        let socket = TcpListener::bind(addr).await.map_err(|source| NetError::Bind {
            addr: addr.to_string(),
            source,
        })?;
        let local_addr = socket.local_addr()?;
        info!(tier = %P::TIER, %local_addr, "listening");
        Ok(Self {
            socket,
            local_addr,
            _protocol: PhantomData,
        })
    }

    /// Address actually bound.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept until `shutdown` fires, running each connection with a fresh
    /// role from `make_role`.
    ///
    /// Accepted connections are tracked in `registry` until their task ends.
    pub async fn run<R, F>(
        self,
        mut make_role: F,
        config: ListenerConfig,
        registry: Arc<ConnectionRegistry>,
        events: mpsc::UnboundedSender<SessionEvent>,
        shutdown: broadcast::Sender<()>,
    ) where
        R: SessionRole<P>,
        F: FnMut() -> R,
    {
        let mut shutdown_rx = shutdown.subscribe();

        loop {
            tokio::select! {
                accepted = self.socket.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let live = registry.len().await;
                        if live >= config.max_connections {
                            warn!(%peer, live, "connection limit reached, rejecting");
                            continue;
                        }
                        let _ = stream.set_nodelay(true);

                        let (handle, task) = Connection::<P, R>::spawn(
                            stream,
                            peer,
                            make_role(),
                            config.connection,
                            events.clone(),
                            shutdown.subscribe(),
                        );
                        let id = handle.id();
                        registry.insert(handle, P::TIER).await;
                        debug!(%id, %peer, "accepted");

                        let reaper = registry.clone();
                        tokio::spawn(async move {
                            match task.await {
                                Ok(reason) => debug!(%id, %reason, "connection task finished"),
                                Err(e) => error!(%id, error = %e, "connection task failed"),
                            }
                            reaper.remove(&id).await;
                        });
                    }
                    Err(e) => error!(tier = %P::TIER, error = %e, "accept error"),
                },
                _ = shutdown_rx.recv() => {
                    info!(tier = %P::TIER, "listener shutting down");
                    break;
                }
            }
        }
    }
}
