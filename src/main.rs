//! Realm Auth Node
//!
//! Serves the configured trust tiers as responder and, optionally,
//! authenticates to an upstream tier as initiator.
//!
//! Usage: `realm-auth-node [config file]` (default `node.toml`).

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use realm_auth::config::{ListenerSection, NodeConfig, UpstreamSection};
use realm_auth::network::{
    AuthClient, AuthServer, ClientLoginProtocol, ClientWorldProtocol, ConnectionHandle,
    ConnectionId, LoginRealmProtocol, Packet, Protocol, RealmWorldProtocol, SessionEvent,
    TrustTier,
};
use realm_auth::{CredentialStore, MemoryStore, VERSION};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let path = std::env::args().nth(1).unwrap_or_else(|| "node.toml".to_string());
    let config = NodeConfig::load(&path).with_context(|| format!("loading {path}"))?;
    if config.listeners.is_empty() && config.upstream.is_none() {
        anyhow::bail!("{path} configures neither listeners nor an upstream");
    }

    info!("Realm Auth Node v{}", VERSION);
    info!(
        handshake_timeout_secs = config.limits.handshake_timeout_secs,
        max_auth_attempts = config.limits.max_auth_attempts,
        max_connections = config.limits.max_connections,
        "limits"
    );

    let store = MemoryStore::new();
    for account in &config.accounts {
        store.register(&account.identity, &account.password).await;
    }
    info!(accounts = config.accounts.len(), "credential store seeded");
    let store: Arc<dyn CredentialStore> = Arc::new(store);

    let (shutdown_tx, _) = broadcast::channel(1);
    let mut tasks = Vec::new();

    for section in &config.listeners {
        let task = match section.tier {
            TrustTier::ClientLogin => {
                serve::<ClientLoginProtocol>(&config, section, store.clone(), &shutdown_tx).await
            }
            TrustTier::LoginRealm => {
                serve::<LoginRealmProtocol>(&config, section, store.clone(), &shutdown_tx).await
            }
            TrustTier::RealmWorld => {
                serve::<RealmWorldProtocol>(&config, section, store.clone(), &shutdown_tx).await
            }
            TrustTier::ClientWorld => {
                serve::<ClientWorldProtocol>(&config, section, store.clone(), &shutdown_tx).await
            }
        }?;
        tasks.push(task);
    }

    if let Some(upstream) = &config.upstream {
        let task = match upstream.tier {
            TrustTier::ClientLogin => link::<ClientLoginProtocol>(&config, upstream, &shutdown_tx),
            TrustTier::LoginRealm => link::<LoginRealmProtocol>(&config, upstream, &shutdown_tx),
            TrustTier::RealmWorld => link::<RealmWorldProtocol>(&config, upstream, &shutdown_tx),
            TrustTier::ClientWorld => link::<ClientWorldProtocol>(&config, upstream, &shutdown_tx),
        };
        tasks.push(task);
    }

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("Shutdown signal received");
    let _ = shutdown_tx.send(());

    for task in tasks {
        if let Err(e) = task.await {
            error!(error = %e, "task failed during shutdown");
        }
    }
    info!("Node stopped");
    Ok(())
}

/// Bind one tier and run its server until shutdown.
async fn serve<P: Protocol>(
    config: &NodeConfig,
    section: &ListenerSection,
    store: Arc<dyn CredentialStore>,
    shutdown: &broadcast::Sender<()>,
) -> anyhow::Result<JoinHandle<()>> {
    let server = Arc::new(AuthServer::<P>::new(config.server_config(section), store));
    let listener = server
        .bind()
        .await
        .with_context(|| format!("starting {} listener", P::TIER))?;

    let stopper = server.clone();
    let mut shutdown_rx = shutdown.subscribe();
    tokio::spawn(async move {
        let _ = shutdown_rx.recv().await;
        stopper.shutdown();
    });

    let (observer, events) = mpsc::unbounded_channel();
    tokio::spawn(observe::<P>(events));

    Ok(tokio::spawn(async move {
        server.run(listener, Some(observer)).await;
    }))
}

/// Log session events and answer keep-alives where the tier has them.
async fn observe<P: Protocol>(mut events: mpsc::UnboundedReceiver<SessionEvent>) {
    let reply_opcode = |name: &str| {
        P::APPLICATION_OPCODES
            .iter()
            .find(|(_, n)| *n == name)
            .map(|(op, _)| *op)
    };
    let ping = reply_opcode("PING");
    let pong = reply_opcode("PONG");
    let mut handles: BTreeMap<ConnectionId, ConnectionHandle> = BTreeMap::new();

    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::Opened { handle } => {
                handles.insert(handle.id(), handle);
            }
            SessionEvent::Authenticated { id, identity, .. } => {
                info!(tier = %P::TIER, %id, %identity, "peer authenticated");
            }
            SessionEvent::Packet { id, packet } => {
                debug!(
                    tier = %P::TIER,
                    %id,
                    name = P::opcode_name(packet.opcode),
                    "application packet"
                );
                if let (Some(ping), Some(pong)) = (ping, pong) {
                    if packet.opcode == ping {
                        if let Some(handle) = handles.get(&id) {
                            handle.send(Packet::new(pong, packet.body));
                        }
                    }
                }
            }
            SessionEvent::Closed { id, .. } => {
                handles.remove(&id);
            }
        }
    }
}

/// Authenticate to the upstream tier and hold the link until shutdown.
fn link<P: Protocol>(
    config: &NodeConfig,
    upstream: &UpstreamSection,
    shutdown: &broadcast::Sender<()>,
) -> JoinHandle<()> {
    let client = AuthClient::<P>::new(
        upstream.host.clone(),
        upstream.port(),
        config.connection_settings(),
    );
    let identity = upstream.identity.clone();
    let password = upstream.password.clone();
    let mut shutdown_rx = shutdown.subscribe();

    tokio::spawn(async move {
        let mut link = tokio::select! {
            result = client.logon(&identity, &password) => match result {
                Ok(link) => link,
                Err(e) => {
                    error!(tier = %P::TIER, error = %e, "upstream authentication failed");
                    return;
                }
            },
            _ = shutdown_rx.recv() => return,
        };
        info!(tier = %P::TIER, %identity, "upstream link established");

        loop {
            tokio::select! {
                packet = link.next_packet() => match packet {
                    Some(packet) => {
                        debug!(
                            tier = %P::TIER,
                            name = P::opcode_name(packet.opcode),
                            "upstream packet"
                        );
                    }
                    None => {
                        warn!(tier = %P::TIER, "upstream link closed");
                        return;
                    }
                },
                _ = shutdown_rx.recv() => break,
            }
        }

        let reason = link.close().await;
        info!(tier = %P::TIER, %reason, "upstream link closed");
    })
}
