//! SRP6 Authentication
//!
//! Group parameters, credential records and the SRP6 math for both
//! handshake roles. Nothing in here touches the network; the handshake
//! state machines in [`crate::handshake`] drive these types over a
//! connection.

pub mod constants;
pub mod credential;
pub mod srp6;

pub use constants::SrpConstants;
pub use credential::{normalize_identity, validate_identity, CredentialRecord};
pub use srp6::{
    InitiatorChallenge, InitiatorProof, Proof, ResponderChallenge, ResponderVerified, SessionKey,
};

use thiserror::Error;

// =============================================================================
// RESULT CODES
// =============================================================================

/// Result byte carried in challenge and proof replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AuthResult {
    /// Authentication step succeeded.
    Success = 0x00,
    /// Unknown identity or wrong password. The two are not distinguished.
    FailWrongCredentials = 0x04,
    /// Responder could not reach its credential store.
    FailTemporarilyUnavailable = 0x08,
}

impl AuthResult {
    /// Decode a result byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(AuthResult::Success),
            0x04 => Some(AuthResult::FailWrongCredentials),
            0x08 => Some(AuthResult::FailTemporarilyUnavailable),
            _ => None,
        }
    }
}

// =============================================================================
// ERRORS
// =============================================================================

/// Coarse classification of handshake failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Malformed or out-of-sequence traffic. Connection closed, no reply.
    ProtocolViolation,
    /// Wrong credentials or a safeguard violation.
    AuthenticationFailure,
    /// Credential store or transport trouble. May be retried.
    TransientInfrastructureFailure,
    /// The peer proved it is not who it claims to be.
    PeerIntegrityFailure,
}

/// Handshake errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandshakeError {
    /// Payload failed to decode.
    #[error("malformed handshake message: {0}")]
    Malformed(String),

    /// Message arrived in a state that does not accept it.
    #[error("unexpected opcode {0:#06x}")]
    UnexpectedOpcode(u16),

    /// Public ephemeral congruent to zero modulo `N`.
    #[error("public ephemeral is zero modulo N")]
    SafeguardViolation,

    /// No credential record for the identity.
    #[error("unknown identity")]
    UnknownIdentity,

    /// `M1` did not match.
    #[error("client proof mismatch")]
    ProofMismatch,

    /// Responder sent a `g`/`N` different from ours.
    #[error("peer uses an incompatible SRP6 group")]
    IncompatibleGroup,

    /// `M2` did not match.
    #[error("server proof mismatch")]
    ServerProofMismatch,

    /// Responder replied with a failure result.
    #[error("rejected by peer: {0:?}")]
    Rejected(AuthResult),

    /// Credential store failed.
    #[error("credential store unavailable: {0}")]
    StoreUnavailable(String),

    /// Transport closed before the handshake finished.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// Handshake did not finish in time.
    #[error("handshake timed out")]
    Timeout,

    /// Identity is empty or longer than a challenge can carry.
    #[error("identity length {0} outside 1..={max}", max = constants::MAX_IDENTITY_LENGTH)]
    InvalidIdentity(usize),
}

impl HandshakeError {
    /// Classify the error.
    pub fn kind(&self) -> FailureKind {
        match self {
            HandshakeError::Malformed(_)
            | HandshakeError::UnexpectedOpcode(_)
            | HandshakeError::InvalidIdentity(_) => FailureKind::ProtocolViolation,
            HandshakeError::SafeguardViolation
            | HandshakeError::UnknownIdentity
            | HandshakeError::ProofMismatch => FailureKind::AuthenticationFailure,
            HandshakeError::Rejected(AuthResult::FailTemporarilyUnavailable) => {
                FailureKind::TransientInfrastructureFailure
            }
            HandshakeError::Rejected(_) => FailureKind::AuthenticationFailure,
            HandshakeError::IncompatibleGroup | HandshakeError::ServerProofMismatch => {
                FailureKind::PeerIntegrityFailure
            }
            HandshakeError::StoreUnavailable(_)
            | HandshakeError::ConnectionClosed(_)
            | HandshakeError::Timeout => FailureKind::TransientInfrastructureFailure,
        }
    }

    /// Result byte reported to the initiator, if any reply is sent at all.
    pub fn reply_code(&self) -> Option<AuthResult> {
        match self {
            HandshakeError::UnknownIdentity | HandshakeError::ProofMismatch => {
                Some(AuthResult::FailWrongCredentials)
            }
            HandshakeError::StoreUnavailable(_) => Some(AuthResult::FailTemporarilyUnavailable),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_result_codes() {
        for code in [
            AuthResult::Success,
            AuthResult::FailWrongCredentials,
            AuthResult::FailTemporarilyUnavailable,
        ] {
            assert_eq!(AuthResult::from_u8(code as u8), Some(code));
        }
        assert_eq!(AuthResult::from_u8(0x01), None);
    }

    #[test]
    fn test_failure_classification() {
        assert_eq!(
            HandshakeError::SafeguardViolation.kind(),
            FailureKind::AuthenticationFailure
        );
        assert_eq!(
            HandshakeError::ServerProofMismatch.kind(),
            FailureKind::PeerIntegrityFailure
        );
        assert_eq!(
            HandshakeError::StoreUnavailable("down".into()).kind(),
            FailureKind::TransientInfrastructureFailure
        );
        assert_eq!(
            HandshakeError::Rejected(AuthResult::FailTemporarilyUnavailable).kind(),
            FailureKind::TransientInfrastructureFailure
        );
        assert_eq!(
            HandshakeError::UnexpectedOpcode(0x01).kind(),
            FailureKind::ProtocolViolation
        );
    }

    #[test]
    fn test_unknown_identity_indistinguishable_from_bad_proof() {
        assert_eq!(
            HandshakeError::UnknownIdentity.reply_code(),
            HandshakeError::ProofMismatch.reply_code()
        );
        assert_eq!(HandshakeError::SafeguardViolation.reply_code(), None);
    }
}
