//! Credential Records
//!
//! Stored `{salt, verifier}` pairs and the derivation of the verifier from a
//! password. Records are created at registration time and are read-only to
//! the handshake.

use rand::RngCore;

use super::constants::{SrpConstants, MAX_IDENTITY_LENGTH, SALT_LENGTH};
use super::HandshakeError;
use crate::core::bigint::BigInt;
use crate::core::hash::{Sha1Digest, Sha1Hasher};

/// Per-account (or per-peer) credential tuple owned by the database.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CredentialRecord {
    /// Database identifier.
    pub id: u32,
    /// Normalized identity.
    pub identity: String,
    /// Salt `s`.
    pub salt: Vec<u8>,
    /// Verifier `v = g^x mod N`.
    pub verifier: BigInt,
}

impl CredentialRecord {
    /// Register a new identity with a fresh random salt.
    ///
    /// The password is consumed into the verifier and not retained.
    pub fn register<R: RngCore + ?Sized>(
        id: u32,
        identity: &str,
        password: &str,
        rng: &mut R,
    ) -> Self {
        let mut salt = vec![0u8; SALT_LENGTH];
        rng.fill_bytes(&mut salt);
        Self::with_salt(id, identity, password, salt)
    }

    /// Build a record from a known salt.
    pub fn with_salt(id: u32, identity: &str, password: &str, salt: Vec<u8>) -> Self {
        let identity = normalize_identity(identity);
        let x = compute_x(&identity, password, &salt);
        let verifier = compute_verifier(&x);

        Self {
            id,
            identity,
            salt,
            verifier,
        }
    }
}

/// Identities and passwords are compared case-insensitively.
pub fn normalize_identity(identity: &str) -> String {
    identity.trim().to_ascii_uppercase()
}

/// Normalize `identity` and check it fits in a challenge.
pub fn validate_identity(identity: &str) -> Result<String, HandshakeError> {
    let normalized = normalize_identity(identity);
    if normalized.is_empty() || normalized.len() > MAX_IDENTITY_LENGTH {
        return Err(HandshakeError::InvalidIdentity(normalized.len()));
    }
    Ok(normalized)
}

/// `SHA1(identity ":" password)` over the normalized pair.
pub fn credentials_hash(identity: &str, password: &str) -> Sha1Digest {
    let mut hasher = Sha1Hasher::new();
    hasher
        .update_str(&normalize_identity(identity))
        .update_bytes(b":")
        .update_str(&password.to_ascii_uppercase());
    hasher.finalize()
}

/// Private key `x = SHA1(s ‖ SHA1(identity ":" password))`, read little-endian.
pub fn compute_x(identity: &str, password: &str, salt: &[u8]) -> BigInt {
    let inner = credentials_hash(identity, password);
    let mut hasher = Sha1Hasher::new();
    hasher.update_bytes(salt).update_bytes(&inner);
    BigInt::from_bytes_le(&hasher.finalize())
}

/// Verifier `v = g^x mod N`.
pub fn compute_verifier(x: &BigInt) -> BigInt {
    let c = SrpConstants::get();
    c.generator.mod_exp(x, &c.modulus)
}
