//! Core primitives.
//!
//! Leaf building blocks for the handshake and transport: big-integer
//! arithmetic, SHA1 helpers, randomness sources and the header cipher.

pub mod bigint;
pub mod cipher;
pub mod hash;
pub mod rng;

// Re-export core types
pub use bigint::{BigInt, BigIntError};
pub use cipher::{HeaderCipher, HEADER_CRYPT_LEN};
pub use hash::{hmac_sha1, sha1, Sha1Digest, Sha1Hasher, SHA1_DIGEST_LEN};
pub use rng::{secure_rng, DeterministicRng};
