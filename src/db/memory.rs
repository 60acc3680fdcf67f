//! In-memory credential store used by the node binary and tests.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::sync::RwLock;
use tracing::debug;

use super::{CredentialStore, StoreError};
use crate::auth::{normalize_identity, CredentialRecord};
use crate::core::rng::secure_rng;

/// A persisted session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    /// Session key, upper-case hex.
    pub session_key_hex: String,
    /// Peer the key was negotiated with.
    pub peer: SocketAddr,
    /// When it was persisted.
    pub persisted_at: DateTime<Utc>,
}

#[derive(Default)]
struct Tables {
    accounts: BTreeMap<String, CredentialRecord>,
    sessions: BTreeMap<u32, SessionRecord>,
}

#[derive(Default)]
struct Inner {
    tables: RwLock<Tables>,
    next_id: AtomicU32,
    fail_lookups: AtomicBool,
    fail_persists: AtomicBool,
    persist_calls: AtomicU64,
}

/// Thread-safe in-memory store. Clones share state.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an identity with a fresh salt. Returns the record id.
    pub async fn register(&self, identity: &str, password: &str) -> u32 {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let record = CredentialRecord::register(id, identity, password, &mut secure_rng());
        self.insert(record).await;
        id
    }

    /// Insert or replace a record.
    pub async fn insert(&self, record: CredentialRecord) {
        debug!(identity = %record.identity, id = record.id, "credential stored");
        self.inner
            .tables
            .write()
            .await
            .accounts
            .insert(record.identity.clone(), record);
    }

    /// Session persisted for a record id.
    pub async fn session(&self, id: u32) -> Option<SessionRecord> {
        self.inner.tables.read().await.sessions.get(&id).cloned()
    }

    /// Number of `persist_session_key` calls so far, failed ones included.
    pub fn persist_calls(&self) -> u64 {
        self.inner.persist_calls.load(Ordering::Relaxed)
    }

    /// Make every lookup fail with [`StoreError::Unavailable`].
    pub fn set_fail_lookups(&self, fail: bool) {
        self.inner.fail_lookups.store(fail, Ordering::Relaxed);
    }

    /// Make every persist fail with [`StoreError::Unavailable`].
    pub fn set_fail_persists(&self, fail: bool) {
        self.inner.fail_persists.store(fail, Ordering::Relaxed);
    }
}

impl CredentialStore for MemoryStore {
    fn lookup_credential(
        &self,
        identity: &str,
    ) -> BoxFuture<'static, Result<Option<CredentialRecord>, StoreError>> {
        let inner = self.inner.clone();
        let identity = normalize_identity(identity);
        async move {
            if inner.fail_lookups.load(Ordering::Relaxed) {
                return Err(StoreError::Unavailable("lookups disabled".into()));
            }
            Ok(inner.tables.read().await.accounts.get(&identity).cloned())
        }
        .boxed()
    }

    fn persist_session_key(
        &self,
        id: u32,
        session_key_hex: String,
        peer: SocketAddr,
    ) -> BoxFuture<'static, Result<(), StoreError>> {
        let inner = self.inner.clone();
        async move {
            inner.persist_calls.fetch_add(1, Ordering::Relaxed);
            if inner.fail_persists.load(Ordering::Relaxed) {
                return Err(StoreError::Unavailable("persists disabled".into()));
            }

            let mut tables = inner.tables.write().await;
            if !tables.accounts.values().any(|r| r.id == id) {
                return Err(StoreError::UnknownRecord(id));
            }
            tables.sessions.insert(
                id,
                SessionRecord {
                    session_key_hex,
                    peer,
                    persisted_at: Utc::now(),
                },
            );
            Ok(())
        }
        .boxed()
    }

    fn lookup_session_key(
        &self,
        identity: &str,
    ) -> BoxFuture<'static, Result<Option<String>, StoreError>> {
        let inner = self.inner.clone();
        let identity = normalize_identity(identity);
        async move {
            if inner.fail_lookups.load(Ordering::Relaxed) {
                return Err(StoreError::Unavailable("lookups disabled".into()));
            }
            let tables = inner.tables.read().await;
            let key = tables
                .accounts
                .get(&identity)
                .and_then(|record| tables.sessions.get(&record.id))
                .map(|session| session.session_key_hex.clone());
            Ok(key)
        }
        .boxed()
    }
}
