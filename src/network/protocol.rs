//! Protocol Definitions
//!
//! Trust tiers, their opcode namespaces, and the binary codecs for the
//! handshake messages that every tier shares. Application payloads ride on
//! top of the same framing but are opaque at this layer.
//!
//! All multi-byte integers are little-endian. Replies reuse the opcode of the
//! request they answer.

use std::io::{Cursor, Read};

use byteorder::ReadBytesExt;
use serde::Deserialize;
use thiserror::Error;

use crate::auth::constants::{KEY_LENGTH, PROOF_LENGTH, RECONNECT_CHALLENGE_LENGTH};
pub use crate::auth::constants::MAX_IDENTITY_LENGTH;
use crate::auth::AuthResult;

// =============================================================================
// TRUST TIERS
// =============================================================================

/// One hop in the client -> login -> realm -> world chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum TrustTier {
    /// Game client to login server.
    ClientLogin = 1,
    /// Login server to realm server.
    LoginRealm = 2,
    /// Realm server to world server.
    RealmWorld = 3,
    /// Game client to realm/world server.
    ClientWorld = 4,
}

impl TrustTier {
    /// Decode the tier byte of a packet header.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(TrustTier::ClientLogin),
            2 => Some(TrustTier::LoginRealm),
            3 => Some(TrustTier::RealmWorld),
            4 => Some(TrustTier::ClientWorld),
            _ => None,
        }
    }

    /// Conventional listening port.
    pub fn default_port(self) -> u16 {
        match self {
            TrustTier::ClientLogin => 3724,
            TrustTier::LoginRealm => 6279,
            TrustTier::RealmWorld => 6280,
            TrustTier::ClientWorld => 8085,
        }
    }

    /// Short name for logs.
    pub fn name(self) -> &'static str {
        match self {
            TrustTier::ClientLogin => "client_login",
            TrustTier::LoginRealm => "login_realm",
            TrustTier::RealmWorld => "realm_world",
            TrustTier::ClientWorld => "client_world",
        }
    }
}

impl std::fmt::Display for TrustTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Opcodes of the handshake messages within one tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeOpcodes {
    /// `LogonChallenge` and its reply.
    pub logon_challenge: u16,
    /// `LogonProof` and its reply.
    pub logon_proof: u16,
    /// `ReconnectChallenge` and its reply.
    pub reconnect_challenge: u16,
    /// `ReconnectProof` and its reply.
    pub reconnect_proof: u16,
}

impl HandshakeOpcodes {
    /// Name of a handshake opcode, if it is one.
    pub fn name_of(&self, opcode: u16) -> Option<&'static str> {
        if opcode == self.logon_challenge {
            Some("LOGON_CHALLENGE")
        } else if opcode == self.logon_proof {
            Some("LOGON_PROOF")
        } else if opcode == self.reconnect_challenge {
            Some("RECONNECT_CHALLENGE")
        } else if opcode == self.reconnect_proof {
            Some("RECONNECT_PROOF")
        } else {
            None
        }
    }
}

/// A tier's packet vocabulary.
///
/// Transports and connections are generic over this trait, so each tier's
/// constants are resolved at compile time.
pub trait Protocol: Send + Sync + 'static {
    /// Tier byte carried in every header.
    const TIER: TrustTier;
    /// Largest body accepted or sent.
    const MAX_BODY_SIZE: usize;
    /// Handshake opcodes.
    const HANDSHAKE: HandshakeOpcodes;
    /// Opcodes opened once the connection is authenticated.
    const APPLICATION_OPCODES: &'static [(u16, &'static str)];

    /// Name of an opcode for logs.
    fn opcode_name(opcode: u16) -> &'static str {
        Self::HANDSHAKE
            .name_of(opcode)
            .or_else(|| {
                Self::APPLICATION_OPCODES
                    .iter()
                    .find(|(op, _)| *op == opcode)
                    .map(|(_, name)| *name)
            })
            .unwrap_or("UNKNOWN")
    }
}

const SHARED_HANDSHAKE: HandshakeOpcodes = HandshakeOpcodes {
    logon_challenge: 0x00,
    logon_proof: 0x01,
    reconnect_challenge: 0x02,
    reconnect_proof: 0x03,
};

/// Game client to login server.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClientLoginProtocol;

impl Protocol for ClientLoginProtocol {
    const TIER: TrustTier = TrustTier::ClientLogin;
    const MAX_BODY_SIZE: usize = 4096;
    const HANDSHAKE: HandshakeOpcodes = SHARED_HANDSHAKE;
    const APPLICATION_OPCODES: &'static [(u16, &'static str)] = &[(0x10, "REALM_LIST")];
}

/// Login server to realm server.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoginRealmProtocol;

impl Protocol for LoginRealmProtocol {
    const TIER: TrustTier = TrustTier::LoginRealm;
    const MAX_BODY_SIZE: usize = 8192;
    const HANDSHAKE: HandshakeOpcodes = SHARED_HANDSHAKE;
    const APPLICATION_OPCODES: &'static [(u16, &'static str)] =
        &[(0x20, "REALM_REGISTER"), (0x21, "REALM_STATUS")];
}

/// Realm server to world server.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealmWorldProtocol;

impl Protocol for RealmWorldProtocol {
    const TIER: TrustTier = TrustTier::RealmWorld;
    const MAX_BODY_SIZE: usize = 16384;
    const HANDSHAKE: HandshakeOpcodes = SHARED_HANDSHAKE;
    const APPLICATION_OPCODES: &'static [(u16, &'static str)] =
        &[(0x30, "WORLD_REGISTER"), (0x31, "WORLD_STATUS")];
}

/// Game client to realm/world server.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClientWorldProtocol;

impl Protocol for ClientWorldProtocol {
    const TIER: TrustTier = TrustTier::ClientWorld;
    const MAX_BODY_SIZE: usize = 32768;
    const HANDSHAKE: HandshakeOpcodes = HandshakeOpcodes {
        logon_challenge: 0x1EC,
        logon_proof: 0x1ED,
        reconnect_challenge: 0x1EE,
        reconnect_proof: 0x1EF,
    };
    const APPLICATION_OPCODES: &'static [(u16, &'static str)] =
        &[(0x1DC, "PING"), (0x1DD, "PONG")];
}

// =============================================================================
// PACKETS
// =============================================================================

/// A decoded frame: opcode plus opaque body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Tier-specific opcode.
    pub opcode: u16,
    /// Body bytes.
    pub body: Vec<u8>,
}

impl Packet {
    /// Create a packet.
    pub fn new(opcode: u16, body: Vec<u8>) -> Self {
        Self { opcode, body }
    }
}

// =============================================================================
// HANDSHAKE MESSAGES
// =============================================================================

/// Handshake body decode errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Body ended early.
    #[error("body truncated")]
    Truncated,
    /// Extra bytes after the message.
    #[error("{0} trailing bytes")]
    TrailingBytes(usize),
    /// Identity is empty, too long, or not printable ASCII.
    #[error("invalid identity")]
    InvalidIdentity,
    /// A length prefix holds an unexpected value.
    #[error("invalid {field} length {len}")]
    InvalidLength {
        /// Field name.
        field: &'static str,
        /// Length found.
        len: usize,
    },
    /// Unknown result byte.
    #[error("unknown result code {0:#04x}")]
    UnknownResult(u8),
}

impl From<std::io::Error> for DecodeError {
    fn from(_: std::io::Error) -> Self {
        DecodeError::Truncated
    }
}

/// A handshake message body.
pub trait HandshakeMessage: Sized {
    /// Serialize the body.
    fn encode(&self) -> Vec<u8>;

    /// Parse the body. Trailing bytes are rejected.
    fn decode(body: &[u8]) -> Result<Self, DecodeError> {
        let mut cursor = Cursor::new(body);
        let message = Self::read_from(&mut cursor)?;
        let remaining = body.len() - cursor.position() as usize;
        if remaining != 0 {
            return Err(DecodeError::TrailingBytes(remaining));
        }
        Ok(message)
    }

    /// Parse from a cursor positioned at the body start.
    fn read_from(cursor: &mut Cursor<&[u8]>) -> Result<Self, DecodeError>;
}

fn read_array<const N: usize>(cursor: &mut Cursor<&[u8]>) -> Result<[u8; N], DecodeError> {
    let mut out = [0u8; N];
    cursor.read_exact(&mut out)?;
    Ok(out)
}

fn read_result(cursor: &mut Cursor<&[u8]>) -> Result<AuthResult, DecodeError> {
    let code = cursor.read_u8()?;
    AuthResult::from_u8(code).ok_or(DecodeError::UnknownResult(code))
}

/// `LogonChallenge` / `ReconnectChallenge`: `[len u8][identity]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    /// Identity being authenticated.
    pub identity: String,
}

impl HandshakeMessage for Challenge {
    fn encode(&self) -> Vec<u8> {
        // Length prefix is one byte; callers validate against MAX_IDENTITY_LENGTH.
        let bytes = self.identity.as_bytes();
        let bytes = &bytes[..bytes.len().min(u8::MAX as usize)];
        let mut out = Vec::with_capacity(1 + bytes.len());
        out.push(bytes.len() as u8);
        out.extend_from_slice(bytes);
        out
    }

    fn read_from(cursor: &mut Cursor<&[u8]>) -> Result<Self, DecodeError> {
        let len = cursor.read_u8()? as usize;
        if len == 0 || len > MAX_IDENTITY_LENGTH {
            return Err(DecodeError::InvalidIdentity);
        }
        let mut raw = vec![0u8; len];
        cursor.read_exact(&mut raw)?;
        if !raw.iter().all(|b| b.is_ascii_graphic()) {
            return Err(DecodeError::InvalidIdentity);
        }
        let identity = String::from_utf8(raw).map_err(|_| DecodeError::InvalidIdentity)?;
        Ok(Self { identity })
    }
}

/// Group and ephemeral values in a successful challenge reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerValues {
    /// `B`.
    pub server_public: [u8; KEY_LENGTH],
    /// `g`.
    pub generator: u8,
    /// `N`.
    pub modulus: [u8; KEY_LENGTH],
    /// `s`.
    pub salt: Vec<u8>,
}

/// `LogonChallenge` reply:
/// `[result]` then on success `[B 32][1][g][32][N 32][salt_len][salt]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeReply {
    /// Outcome.
    pub result: AuthResult,
    /// Present only on success.
    pub values: Option<ServerValues>,
}

impl ChallengeReply {
    /// A failure reply.
    pub fn failure(result: AuthResult) -> Self {
        Self {
            result,
            values: None,
        }
    }
}

impl HandshakeMessage for ChallengeReply {
    fn encode(&self) -> Vec<u8> {
        let mut out = vec![self.result as u8];
        if let Some(values) = &self.values {
            out.extend_from_slice(&values.server_public);
            out.push(1);
            out.push(values.generator);
            out.push(KEY_LENGTH as u8);
            out.extend_from_slice(&values.modulus);
            out.push(values.salt.len() as u8);
            out.extend_from_slice(&values.salt);
        }
        out
    }

    fn read_from(cursor: &mut Cursor<&[u8]>) -> Result<Self, DecodeError> {
        let result = read_result(cursor)?;
        if result != AuthResult::Success {
            return Ok(Self::failure(result));
        }

        let server_public = read_array::<KEY_LENGTH>(cursor)?;
        let g_len = cursor.read_u8()? as usize;
        if g_len != 1 {
            return Err(DecodeError::InvalidLength {
                field: "g",
                len: g_len,
            });
        }
        let generator = cursor.read_u8()?;
        let n_len = cursor.read_u8()? as usize;
        if n_len != KEY_LENGTH {
            return Err(DecodeError::InvalidLength {
                field: "N",
                len: n_len,
            });
        }
        let modulus = read_array::<KEY_LENGTH>(cursor)?;
        let salt_len = cursor.read_u8()? as usize;
        let mut salt = vec![0u8; salt_len];
        cursor.read_exact(&mut salt)?;

        Ok(Self {
            result,
            values: Some(ServerValues {
                server_public,
                generator,
                modulus,
                salt,
            }),
        })
    }
}

/// `LogonProof`: `[A 32][M1 20]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogonProof {
    /// `A`.
    pub client_public: [u8; KEY_LENGTH],
    /// `M1`.
    pub client_proof: [u8; PROOF_LENGTH],
}

impl HandshakeMessage for LogonProof {
    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(KEY_LENGTH + PROOF_LENGTH);
        out.extend_from_slice(&self.client_public);
        out.extend_from_slice(&self.client_proof);
        out
    }

    fn read_from(cursor: &mut Cursor<&[u8]>) -> Result<Self, DecodeError> {
        Ok(Self {
            client_public: read_array(cursor)?,
            client_proof: read_array(cursor)?,
        })
    }
}

/// `LogonProof` reply: `[result]` then on success `[M2 20]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProofReply {
    /// Outcome.
    pub result: AuthResult,
    /// `M2`, present only on success.
    pub server_proof: Option<[u8; PROOF_LENGTH]>,
}

impl HandshakeMessage for ProofReply {
    fn encode(&self) -> Vec<u8> {
        let mut out = vec![self.result as u8];
        if let Some(proof) = &self.server_proof {
            out.extend_from_slice(proof);
        }
        out
    }

    fn read_from(cursor: &mut Cursor<&[u8]>) -> Result<Self, DecodeError> {
        let result = read_result(cursor)?;
        let server_proof = if result == AuthResult::Success {
            Some(read_array(cursor)?)
        } else {
            None
        };
        Ok(Self {
            result,
            server_proof,
        })
    }
}

/// `ReconnectChallenge` reply: `[result]` then on success `[data 16]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectChallengeReply {
    /// Outcome.
    pub result: AuthResult,
    /// Responder's random challenge data.
    pub server_data: Option<[u8; RECONNECT_CHALLENGE_LENGTH]>,
}

impl HandshakeMessage for ReconnectChallengeReply {
    fn encode(&self) -> Vec<u8> {
        let mut out = vec![self.result as u8];
        if let Some(data) = &self.server_data {
            out.extend_from_slice(data);
        }
        out
    }

    fn read_from(cursor: &mut Cursor<&[u8]>) -> Result<Self, DecodeError> {
        let result = read_result(cursor)?;
        let server_data = if result == AuthResult::Success {
            Some(read_array(cursor)?)
        } else {
            None
        };
        Ok(Self {
            result,
            server_data,
        })
    }
}

/// `ReconnectProof`: `[client_data 16][proof 20]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectProof {
    /// Initiator's random data.
    pub client_data: [u8; RECONNECT_CHALLENGE_LENGTH],
    /// `SHA1(identity ‖ client_data ‖ server_data ‖ K)`.
    pub proof: [u8; PROOF_LENGTH],
}

impl HandshakeMessage for ReconnectProof {
    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(RECONNECT_CHALLENGE_LENGTH + PROOF_LENGTH);
        out.extend_from_slice(&self.client_data);
        out.extend_from_slice(&self.proof);
        out
    }

    fn read_from(cursor: &mut Cursor<&[u8]>) -> Result<Self, DecodeError> {
        Ok(Self {
            client_data: read_array(cursor)?,
            proof: read_array(cursor)?,
        })
    }
}

/// `ReconnectProof` reply: `[result]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectProofReply {
    /// Outcome.
    pub result: AuthResult,
}

impl HandshakeMessage for ReconnectProofReply {
    fn encode(&self) -> Vec<u8> {
        vec![self.result as u8]
    }

    fn read_from(cursor: &mut Cursor<&[u8]>) -> Result<Self, DecodeError> {
        Ok(Self {
            result: read_result(cursor)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_codes() {
        for tier in [
            TrustTier::ClientLogin,
            TrustTier::LoginRealm,
            TrustTier::RealmWorld,
            TrustTier::ClientWorld,
        ] {
            assert_eq!(TrustTier::from_u8(tier as u8), Some(tier));
        }
        assert_eq!(TrustTier::from_u8(0), None);
        assert_eq!(TrustTier::ClientLogin.default_port(), 3724);
        assert_eq!(TrustTier::RealmWorld.default_port(), 6280);
    }

    #[test]
    fn test_opcode_names() {
        assert_eq!(ClientLoginProtocol::opcode_name(0x01), "LOGON_PROOF");
        assert_eq!(ClientLoginProtocol::opcode_name(0x10), "REALM_LIST");
        assert_eq!(ClientWorldProtocol::opcode_name(0x1EC), "LOGON_CHALLENGE");
        assert_eq!(ClientWorldProtocol::opcode_name(0x01), "UNKNOWN");
    }

    #[test]
    fn test_challenge_codec() {
        let msg = Challenge {
            identity: "TESTUSER".into(),
        };
        let bytes = msg.encode();
        assert_eq!(bytes[0], 8);
        assert_eq!(Challenge::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_challenge_rejects_bad_identity() {
        assert_eq!(Challenge::decode(&[0]), Err(DecodeError::InvalidIdentity));
        assert_eq!(
            Challenge::decode(&[2, b'A', b' ']),
            Err(DecodeError::InvalidIdentity)
        );

        let mut long = vec![33u8];
        long.extend(std::iter::repeat(b'A').take(33));
        assert_eq!(Challenge::decode(&long), Err(DecodeError::InvalidIdentity));

        assert_eq!(Challenge::decode(&[4, b'A', b'B']), Err(DecodeError::Truncated));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut bytes = Challenge {
            identity: "A".into(),
        }
        .encode();
        bytes.push(0);
        assert_eq!(Challenge::decode(&bytes), Err(DecodeError::TrailingBytes(1)));
    }

    #[test]
    fn test_challenge_reply_layout() {
        let reply = ChallengeReply {
            result: AuthResult::Success,
            values: Some(ServerValues {
                server_public: [1; KEY_LENGTH],
                generator: 7,
                modulus: [2; KEY_LENGTH],
                salt: vec![3; 32],
            }),
        };
        let bytes = reply.encode();
        assert_eq!(bytes.len(), 1 + 32 + 2 + 1 + 32 + 1 + 32);
        assert_eq!(bytes[33], 1);
        assert_eq!(bytes[34], 7);
        assert_eq!(bytes[35], 32);
        assert_eq!(ChallengeReply::decode(&bytes).unwrap(), reply);
    }

    #[test]
    fn test_failure_replies_are_one_byte() {
        let reply = ChallengeReply::failure(AuthResult::FailWrongCredentials);
        assert_eq!(reply.encode(), vec![0x04]);
        assert_eq!(ChallengeReply::decode(&[0x04]).unwrap(), reply);

        let proof = ProofReply {
            result: AuthResult::FailTemporarilyUnavailable,
            server_proof: None,
        };
        assert_eq!(ProofReply::decode(&proof.encode()).unwrap(), proof);
    }

    #[test]
    fn test_challenge_reply_rejects_wrong_lengths() {
        let mut bytes = vec![0x00];
        bytes.extend_from_slice(&[0; KEY_LENGTH]);
        bytes.push(2);
        assert_eq!(
            ChallengeReply::decode(&bytes),
            Err(DecodeError::InvalidLength { field: "g", len: 2 })
        );
        assert_eq!(
            ChallengeReply::decode(&[0x42]),
            Err(DecodeError::UnknownResult(0x42))
        );
    }

    #[test]
    fn test_proof_codecs() {
        let proof = LogonProof {
            client_public: [9; KEY_LENGTH],
            client_proof: [8; PROOF_LENGTH],
        };
        assert_eq!(proof.encode().len(), 52);
        assert_eq!(LogonProof::decode(&proof.encode()).unwrap(), proof);
        assert_eq!(LogonProof::decode(&[0; 51]), Err(DecodeError::Truncated));

        let reconnect = ReconnectProof {
            client_data: [1; RECONNECT_CHALLENGE_LENGTH],
            proof: [2; PROOF_LENGTH],
        };
        assert_eq!(ReconnectProof::decode(&reconnect.encode()).unwrap(), reconnect);
    }
}
