//! SRP6 Computations
//!
//! Both roles of the two-message exchange, written as consuming steps so a
//! stage cannot be repeated or skipped:
//!
//! ```text
//! Responder:  CredentialRecord -> ResponderChallenge --verify(A, M1)--> ResponderVerified
//! Initiator:  InitiatorChallenge --respond(B, g, N, s)--> InitiatorProof
//!             InitiatorProof --verify(M2)--> SessionKey
//! ```
//!
//! Hash inputs: `A`, `B`, `N`, `g` and `K` are fed as minimal little-endian
//! integers, `s` and `M1` as their raw bytes. Both roles must agree on this
//! exactly or their session keys and proofs diverge.

use std::fmt;

use rand::RngCore;

use super::constants::{
    SrpConstants, KEY_LENGTH, PRIVATE_EPHEMERAL_LENGTH, PROOF_LENGTH, SESSION_KEY_LENGTH,
};
use super::credential::{
    compute_verifier, compute_x, normalize_identity, validate_identity, CredentialRecord,
};
use super::HandshakeError;
use crate::core::bigint::BigInt;
use crate::core::hash::{sha1, Sha1Hasher};

/// SRP6 proof digest (`M1`, `M2`, reconnect proof).
pub type Proof = [u8; PROOF_LENGTH];

/// Interleaved session key `K`.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKey([u8; SESSION_KEY_LENGTH]);

impl SessionKey {
    /// Wrap raw key bytes.
    pub fn from_bytes(bytes: [u8; SESSION_KEY_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Parse the persisted hex form.
    pub fn from_hex(hex_str: &str) -> Option<Self> {
        let bytes = hex::decode(hex_str).ok()?;
        let bytes: [u8; SESSION_KEY_LENGTH] = bytes.try_into().ok()?;
        Some(Self(bytes))
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; SESSION_KEY_LENGTH] {
        &self.0
    }

    /// Hex form handed to the database for session recovery.
    pub fn to_hex(&self) -> String {
        hex::encode_upper(self.0)
    }

    fn as_bigint(&self) -> BigInt {
        BigInt::from_bytes_le(&self.0)
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

/// Scrambler `u = SHA1(A ‖ B)`.
pub fn compute_u(client_public: &BigInt, server_public: &BigInt) -> BigInt {
    let mut hasher = Sha1Hasher::new();
    hasher.update_bigint(client_public).update_bigint(server_public);
    BigInt::from_bytes_le(&hasher.finalize())
}

/// Derive `K` from the premaster secret `S`.
///
/// `S` is exported as 32 little-endian bytes, split into its even- and
/// odd-indexed halves, each half is hashed, and the two digests are
/// re-interleaved byte by byte.
pub fn interleave_session_key(premaster: &BigInt) -> SessionKey {
    let s = premaster.to_bytes_le(KEY_LENGTH);

    let even: Vec<u8> = s.iter().step_by(2).copied().collect();
    let odd: Vec<u8> = s.iter().skip(1).step_by(2).copied().collect();
    let even_hash = sha1(&even);
    let odd_hash = sha1(&odd);

    let mut key = [0u8; SESSION_KEY_LENGTH];
    for (i, (e, o)) in even_hash.iter().zip(odd_hash.iter()).enumerate() {
        key[i * 2] = *e;
        key[i * 2 + 1] = *o;
    }
    SessionKey(key)
}

/// `M1 = SHA1(SHA1(N) ^ SHA1(g) ‖ SHA1(identity) ‖ s ‖ A ‖ B ‖ K)`.
pub fn compute_client_proof(
    identity: &str,
    salt: &[u8],
    client_public: &BigInt,
    server_public: &BigInt,
    session_key: &SessionKey,
) -> Proof {
    let c = SrpConstants::get();

    let mut n_hash = Sha1Hasher::new();
    n_hash.update_bigint(&c.modulus);
    let n_hash = n_hash.finalize();

    let mut g_hash = Sha1Hasher::new();
    g_hash.update_bigint(&c.generator);
    let g_hash = g_hash.finalize();

    let mut group_hash = [0u8; PROOF_LENGTH];
    for (i, byte) in group_hash.iter_mut().enumerate() {
        *byte = n_hash[i] ^ g_hash[i];
    }

    let identity_hash = sha1(normalize_identity(identity).as_bytes());

    let mut hasher = Sha1Hasher::new();
    hasher
        .update_bytes(&group_hash)
        .update_bytes(&identity_hash)
        .update_bytes(salt)
        .update_bigint(client_public)
        .update_bigint(server_public)
        .update_bigint(&session_key.as_bigint());
    hasher.finalize()
}

/// `M2 = SHA1(A ‖ M1 ‖ K)`.
pub fn compute_server_proof(
    client_public: &BigInt,
    client_proof: &Proof,
    session_key: &SessionKey,
) -> Proof {
    let mut hasher = Sha1Hasher::new();
    hasher
        .update_bigint(client_public)
        .update_bytes(client_proof)
        .update_bigint(&session_key.as_bigint());
    hasher.finalize()
}

/// Reconnect proof `SHA1(identity ‖ client_data ‖ server_data ‖ K)`.
pub fn compute_reconnect_proof(
    identity: &str,
    client_data: &[u8],
    server_data: &[u8],
    session_key: &SessionKey,
) -> Proof {
    let mut hasher = Sha1Hasher::new();
    hasher
        .update_str(&normalize_identity(identity))
        .update_bytes(client_data)
        .update_bytes(server_data)
        .update_bytes(session_key.as_bytes());
    hasher.finalize()
}

fn to_wire(value: &BigInt) -> Result<[u8; KEY_LENGTH], HandshakeError> {
    value
        .to_array_le::<KEY_LENGTH>()
        .map_err(|e| HandshakeError::Malformed(e.to_string()))
}

// =============================================================================
// RESPONDER
// =============================================================================

/// Responder state after the challenge has been answered.
///
/// Holds the secret `b`; dropped (with `b`) once the proof is verified.
pub struct ResponderChallenge {
    record_id: u32,
    identity: String,
    salt: Vec<u8>,
    verifier: BigInt,
    private_ephemeral: BigInt,
    public_ephemeral: BigInt,
}

impl ResponderChallenge {
    /// Pick a random `b` and compute `B = (k·v + g^b mod N) mod N`.
    pub fn new<R: RngCore + ?Sized>(record: &CredentialRecord, rng: &mut R) -> Self {
        let c = SrpConstants::get();
        let private_ephemeral = BigInt::random(PRIVATE_EPHEMERAL_LENGTH, rng);
        let gb = c.generator.mod_exp(&private_ephemeral, &c.modulus);
        let public_ephemeral = (&(&c.multiplier * &record.verifier) + &gb) % c.modulus.clone();

        Self {
            record_id: record.id,
            identity: record.identity.clone(),
            salt: record.salt.clone(),
            verifier: record.verifier.clone(),
            private_ephemeral,
            public_ephemeral,
        }
    }

    /// `B` as transmitted.
    pub fn server_public(&self) -> Result<[u8; KEY_LENGTH], HandshakeError> {
        to_wire(&self.public_ephemeral)
    }

    /// Salt as transmitted.
    pub fn salt(&self) -> &[u8] {
        &self.salt
    }

    /// Identity the challenge was issued for.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Check the initiator's `{A, M1}`.
    ///
    /// `A ≡ 0 (mod N)` is rejected before any key material is derived.
    pub fn verify(
        self,
        client_public: &[u8; KEY_LENGTH],
        client_proof: &Proof,
    ) -> Result<ResponderVerified, HandshakeError> {
        let c = SrpConstants::get();
        let a = BigInt::from_bytes_le(client_public);

        if (&a % &c.modulus).is_zero() {
            return Err(HandshakeError::SafeguardViolation);
        }

        let u = compute_u(&a, &self.public_ephemeral);
        let vu = self.verifier.mod_exp(&u, &c.modulus);
        let avu = (&a * &vu) % c.modulus.clone();
        let premaster = avu.mod_exp(&self.private_ephemeral, &c.modulus);
        let session_key = interleave_session_key(&premaster);

        let expected = compute_client_proof(
            &self.identity,
            &self.salt,
            &a,
            &self.public_ephemeral,
            &session_key,
        );
        if expected != *client_proof {
            return Err(HandshakeError::ProofMismatch);
        }

        Ok(ResponderVerified {
            record_id: self.record_id,
            identity: self.identity,
            server_proof: compute_server_proof(&a, client_proof, &session_key),
            session_key,
        })
    }
}

/// Outcome of a verified proof.
#[derive(Debug)]
pub struct ResponderVerified {
    /// Database id of the authenticated record.
    pub record_id: u32,
    /// Authenticated identity.
    pub identity: String,
    /// `M2`, sent back to the initiator.
    pub server_proof: Proof,
    /// Shared session key.
    pub session_key: SessionKey,
}

// =============================================================================
// INITIATOR
// =============================================================================

/// Initiator credentials awaiting the responder's challenge.
pub struct InitiatorChallenge {
    identity: String,
    password: String,
}

impl InitiatorChallenge {
    /// Prepare to authenticate as `identity`.
    ///
    /// Fails with [`HandshakeError::InvalidIdentity`] when the identity would
    /// not fit in a challenge.
    pub fn new(identity: &str, password: &str) -> Result<Self, HandshakeError> {
        Ok(Self {
            identity: validate_identity(identity)?,
            password: password.to_string(),
        })
    }

    /// Normalized identity sent in the challenge.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Answer the responder's `{B, g, N, s}`.
    ///
    /// Rejects a group that differs from the compiled-in one and a `B`
    /// congruent to zero.
    pub fn respond<R: RngCore + ?Sized>(
        &self,
        server_public: &[u8; KEY_LENGTH],
        generator: u8,
        modulus: &[u8],
        salt: &[u8],
        rng: &mut R,
    ) -> Result<InitiatorProof, HandshakeError> {
        let c = SrpConstants::get();
        if !c.matches(generator, modulus) {
            return Err(HandshakeError::IncompatibleGroup);
        }

        let b = BigInt::from_bytes_le(server_public);
        let b_reduced = &b % &c.modulus;
        if b_reduced.is_zero() {
            return Err(HandshakeError::SafeguardViolation);
        }

        let private_ephemeral = BigInt::random(PRIVATE_EPHEMERAL_LENGTH, rng);
        let a = c.generator.mod_exp(&private_ephemeral, &c.modulus);

        let x = compute_x(&self.identity, &self.password, salt);
        let kv = (&c.multiplier * &compute_verifier(&x)) % c.modulus.clone();
        // (B - k·v) mod N without leaving the unsigned domain
        let base = (&(&b_reduced + &c.modulus) - &kv) % c.modulus.clone();

        let u = compute_u(&a, &b);
        let exponent = &private_ephemeral + &(&u * &x);
        let premaster = base.mod_exp(&exponent, &c.modulus);
        let session_key = interleave_session_key(&premaster);

        let client_proof = compute_client_proof(&self.identity, salt, &a, &b, &session_key);
        let expected_server_proof = compute_server_proof(&a, &client_proof, &session_key);

        Ok(InitiatorProof {
            client_public: to_wire(&a)?,
            client_proof,
            expected_server_proof,
            session_key,
        })
    }
}

/// Initiator state after sending `{A, M1}`.
pub struct InitiatorProof {
    client_public: [u8; KEY_LENGTH],
    client_proof: Proof,
    expected_server_proof: Proof,
    session_key: SessionKey,
}

impl InitiatorProof {
    /// `A` as transmitted.
    pub fn client_public(&self) -> &[u8; KEY_LENGTH] {
        &self.client_public
    }

    /// `M1` as transmitted.
    pub fn client_proof(&self) -> &Proof {
        &self.client_proof
    }

    /// Check the responder's `M2`.
    ///
    /// A mismatch is fatal even though the responder reported success.
    pub fn verify_server_proof(self, server_proof: &Proof) -> Result<SessionKey, HandshakeError> {
        if self.expected_server_proof != *server_proof {
            return Err(HandshakeError::ServerProofMismatch);
        }
        Ok(self.session_key)
    }
}
