//! Network Layer
//!
//! Framing, dispatch and the per-connection actor shared by every trust
//! tier, plus the accept/connect wrappers and the tier server and client
//! built on them. Handshake logic lives in [`crate::handshake`]; this layer
//! only moves packets.

pub mod client;
pub mod connection;
pub mod connector;
pub mod dispatch;
pub mod listener;
pub mod protocol;
pub mod server;
pub mod session;
pub mod transport;

pub use client::{AuthClient, AuthenticatedLink};
pub use connection::{
    CloseReason, Connection, ConnectionHandle, ConnectionId, ConnectionSettings, SessionEvent,
    SessionRole,
};
pub use connector::Connector;
pub use dispatch::{DispatchTable, HandlerResult};
pub use listener::{Listener, ListenerConfig};
pub use protocol::{
    ClientLoginProtocol, ClientWorldProtocol, LoginRealmProtocol, Packet, Protocol,
    RealmWorldProtocol, TrustTier,
};
pub use server::{AuthServer, ServerConfig};
pub use session::{ConnectionEntry, ConnectionRegistry};
pub use transport::{FrameError, FramedTransport};

use thiserror::Error;

use crate::auth::HandshakeError;

/// Connection setup errors.
#[derive(Debug, Error)]
pub enum NetError {
    /// Listener could not bind. Not retried.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Requested address.
        addr: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Hostname resolution failed.
    #[error("failed to resolve {host}: {source}")]
    Resolve {
        /// Hostname.
        host: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Every resolved address refused or failed.
    #[error("could not connect to {host} ({attempts} addresses tried)")]
    Exhausted {
        /// Hostname.
        host: String,
        /// Addresses tried, zero if resolution returned none.
        attempts: usize,
    },

    /// Handshake failed after connecting.
    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    /// Connection task ended without reporting an outcome.
    #[error("connection closed")]
    Closed,

    /// Other socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
