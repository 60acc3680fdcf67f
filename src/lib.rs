//! # Realm Auth
//!
//! SRP6 mutual authentication and header-ciphered packet transport for the
//! client, login, realm and world tiers of a game server cluster.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        REALM AUTH                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/           - Leaf primitives                           │
//! │  ├── bigint.rs   - Arbitrary precision unsigned integers     │
//! │  ├── hash.rs     - SHA1 / HMAC-SHA1 helpers                  │
//! │  ├── rng.rs      - OS and seeded randomness                  │
//! │  └── cipher.rs   - Packet header cipher                      │
//! │                                                              │
//! │  auth/           - SRP6 math                                 │
//! │  ├── constants.rs- Group parameters and sizes                │
//! │  ├── credential.rs- Salt/verifier records                    │
//! │  └── srp6.rs     - Proofs, session key, reconnect proof      │
//! │                                                              │
//! │  handshake/      - Per-connection state machines             │
//! │  ├── responder.rs- Server side                               │
//! │  └── initiator.rs- Client side                               │
//! │                                                              │
//! │  network/        - Framing, dispatch and connections         │
//! │  ├── protocol.rs - Tiers, opcodes, handshake messages        │
//! │  ├── transport.rs- Packet framing                            │
//! │  ├── dispatch.rs - Opcode dispatch table                     │
//! │  ├── connection.rs- Connection actor                         │
//! │  ├── listener.rs / connector.rs                              │
//! │  ├── session.rs  - Live connection registry                  │
//! │  └── server.rs / client.rs                                   │
//! │                                                              │
//! │  db/             - Credential store collaborator             │
//! │  config.rs       - TOML + environment configuration          │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Trust chain
//!
//! Every hop runs the same handshake: the connecting side is the initiator,
//! the accepting side the responder. After both proofs check out the 6-byte
//! packet headers are ciphered in both directions with keys derived from the
//! shared session key; bodies stay in the clear.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod auth;
pub mod config;
pub mod core;
pub mod db;
pub mod handshake;
pub mod network;

// Re-export commonly used types
pub use auth::{AuthResult, CredentialRecord, FailureKind, HandshakeError, SessionKey};
pub use config::NodeConfig;
pub use crate::core::bigint::BigInt;
pub use db::{CredentialStore, MemoryStore, StoreError};
pub use handshake::{Initiator, Responder};
pub use network::{AuthClient, AuthServer, NetError, TrustTier};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
