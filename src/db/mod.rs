//! Credential Store
//!
//! The asynchronous database collaborator consulted by the responder role.
//! Futures are `'static` so a connection can hand them to a spawned task and
//! keep serving its own event loop while the lookup runs.

pub mod memory;

use std::net::SocketAddr;

use futures_util::future::BoxFuture;
use thiserror::Error;

use crate::auth::CredentialRecord;

pub use memory::MemoryStore;

/// Store failures. Always reported to the peer as temporarily unavailable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Backend unreachable or refused the request.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Write referenced a record that does not exist.
    #[error("no credential record with id {0}")]
    UnknownRecord(u32),
}

/// Database collaborator interface.
pub trait CredentialStore: Send + Sync + 'static {
    /// Stored `{id, salt, verifier}` for a normalized identity.
    fn lookup_credential(
        &self,
        identity: &str,
    ) -> BoxFuture<'static, Result<Option<CredentialRecord>, StoreError>>;

    /// Remember the session key of a freshly authenticated connection.
    fn persist_session_key(
        &self,
        id: u32,
        session_key_hex: String,
        peer: SocketAddr,
    ) -> BoxFuture<'static, Result<(), StoreError>>;

    /// Last persisted session key (hex) for a normalized identity.
    fn lookup_session_key(
        &self,
        identity: &str,
    ) -> BoxFuture<'static, Result<Option<String>, StoreError>>;
}
