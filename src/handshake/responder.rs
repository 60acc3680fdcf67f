//! Responder Role
//!
//! Server side of the handshake. States and the opcodes registered in each:
//!
//! ```text
//! AwaitingChallenge    LOGON_CHALLENGE, RECONNECT_CHALLENGE
//!   | challenge              (store lookup; dispatch blocked)
//!   v
//! LookingUp            -
//!   |-- record found  --> AwaitingProof           LOGON_PROOF
//!   |-- session found --> AwaitingReconnectProof  RECONNECT_PROOF
//!   '-- not found / store error --> retry or Rejected
//!
//! AwaitingProof -- M1 ok --> Persisting (store write; blocked) --> Authenticated
//! AwaitingReconnectProof -- proof ok --> Authenticated
//! ```
//!
//! `Authenticated` has the tier's application opcodes registered and the
//! header cipher running. `Rejected` has nothing registered.

use std::sync::Arc;

use rand::RngCore;
use tracing::{debug, info, warn};

use crate::auth::constants::{GENERATOR, RECONNECT_CHALLENGE_LENGTH};
use crate::auth::srp6::compute_reconnect_proof;
use crate::auth::{
    AuthResult, CredentialRecord, FailureKind, HandshakeError, ResponderChallenge, SessionKey,
    SrpConstants,
};
use crate::core::rng::secure_rng;
use crate::db::{CredentialStore, StoreError};
use crate::network::connection::{CloseReason, Connection, SessionEvent, SessionRole};
use crate::network::dispatch::HandlerResult;
use crate::network::protocol::{
    Challenge, ChallengeReply, HandshakeMessage, LogonProof, Packet, ProofReply, Protocol,
    ReconnectChallengeReply, ReconnectProof, ReconnectProofReply, ServerValues,
};

/// Responder state.
enum ResponderState {
    AwaitingChallenge,
    LookingUp,
    AwaitingProof(Box<ResponderChallenge>),
    Persisting,
    AwaitingReconnectProof {
        identity: String,
        session_key: SessionKey,
        server_data: [u8; RECONNECT_CHALLENGE_LENGTH],
    },
    Authenticated {
        identity: String,
    },
    Rejected,
}

impl ResponderState {
    fn name(&self) -> &'static str {
        match self {
            ResponderState::AwaitingChallenge => "awaiting_challenge",
            ResponderState::LookingUp => "looking_up",
            ResponderState::AwaitingProof(_) => "awaiting_proof",
            ResponderState::Persisting => "persisting",
            ResponderState::AwaitingReconnectProof { .. } => "awaiting_reconnect_proof",
            ResponderState::Authenticated { .. } => "authenticated",
            ResponderState::Rejected => "rejected",
        }
    }
}

/// Server-side handshake for one connection.
pub struct Responder {
    state: ResponderState,
    store: Arc<dyn CredentialStore>,
    failed_attempts: u32,
    max_attempts: u32,
}

impl Responder {
    /// Responder backed by `store`, allowing `max_attempts` failed rounds.
    pub fn new(store: Arc<dyn CredentialStore>, max_attempts: u32) -> Self {
        Self {
            state: ResponderState::AwaitingChallenge,
            store,
            failed_attempts: 0,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Identity once authenticated.
    pub fn identity(&self) -> Option<&str> {
        match &self.state {
            ResponderState::Authenticated { identity } => Some(identity),
            _ => None,
        }
    }

    fn transition(&mut self, next: ResponderState) -> ResponderState {
        debug!(from = self.state.name(), to = next.name(), "responder transition");
        std::mem::replace(&mut self.state, next)
    }
}

impl<P: Protocol> SessionRole<P> for Responder {
    fn on_open(conn: &mut Connection<P, Self>) {
        arm_challenges(conn);
    }

    fn on_close(conn: &mut Connection<P, Self>, reason: &CloseReason) {
        if !matches!(conn.role().state, ResponderState::Authenticated { .. }) {
            debug!(
                id = %conn.id(),
                state = conn.role().state.name(),
                %reason,
                "closed before authentication"
            );
        }
    }

    fn is_authenticated(&self) -> bool {
        matches!(self.state, ResponderState::Authenticated { .. })
    }
}

fn arm_challenges<P: Protocol>(conn: &mut Connection<P, Responder>) {
    let table = conn.table();
    table.register(P::HANDSHAKE.logon_challenge, on_logon_challenge::<P>);
    table.register(P::HANDSHAKE.reconnect_challenge, on_reconnect_challenge::<P>);
}

fn disarm_challenges<P: Protocol>(conn: &mut Connection<P, Responder>) {
    let table = conn.table();
    table.clear(P::HANDSHAKE.logon_challenge);
    table.clear(P::HANDSHAKE.reconnect_challenge);
}

fn malformed<P: Protocol>(
    conn: &mut Connection<P, Responder>,
    opcode: u16,
    error: impl ToString,
) -> HandlerResult {
    let error = HandshakeError::Malformed(error.to_string());
    warn!(
        id = %conn.id(),
        peer = %conn.peer(),
        opcode = P::opcode_name(opcode),
        %error,
        "rejecting malformed handshake message"
    );
    conn.role_mut().transition(ResponderState::Rejected);
    conn.close(CloseReason::ProtocolViolation(error.to_string()));
    HandlerResult::Disconnect
}

/// Report a failed round and either re-arm the challenges or give up.
///
/// `reply` must already carry the result code matching `error`.
fn fail_round<P: Protocol>(
    conn: &mut Connection<P, Responder>,
    error: HandshakeError,
    reply_opcode: u16,
    reply: Vec<u8>,
) -> HandlerResult {
    conn.send_packet(reply_opcode, &reply);

    let kind = error.kind();
    let retry = match kind {
        FailureKind::TransientInfrastructureFailure => true,
        FailureKind::AuthenticationFailure => {
            let role = conn.role_mut();
            role.failed_attempts += 1;
            role.failed_attempts < role.max_attempts
        }
        FailureKind::ProtocolViolation | FailureKind::PeerIntegrityFailure => false,
    };

    let attempts = conn.role().failed_attempts;
    warn!(
        id = %conn.id(),
        peer = %conn.peer(),
        %error,
        ?kind,
        attempts,
        retry,
        "handshake round failed"
    );

    if retry {
        conn.role_mut().transition(ResponderState::AwaitingChallenge);
        arm_challenges(conn);
        HandlerResult::Pass
    } else {
        conn.role_mut().transition(ResponderState::Rejected);
        conn.close(CloseReason::AuthenticationFailed(error.to_string()));
        HandlerResult::Disconnect
    }
}

fn store_error(error: StoreError) -> HandshakeError {
    HandshakeError::StoreUnavailable(error.to_string())
}

/// Final step shared by full logon and reconnect.
///
/// The success reply is queued before the cipher starts so it goes out in
/// the clear; everything after it is ciphered.
fn authenticate<P: Protocol>(
    conn: &mut Connection<P, Responder>,
    identity: String,
    session_key: SessionKey,
) -> HandlerResult {
    conn.enable_cipher(&session_key);
    conn.role_mut().transition(ResponderState::Authenticated {
        identity: identity.clone(),
    });
    conn.open_application();
    info!(id = %conn.id(), peer = %conn.peer(), tier = %P::TIER, %identity, "peer authenticated");
    conn.emit(SessionEvent::Authenticated {
        id: conn.id(),
        identity,
        session_key,
    });
    HandlerResult::Pass
}

// =============================================================================
// FULL LOGON
// =============================================================================

fn on_logon_challenge<P: Protocol>(
    conn: &mut Connection<P, Responder>,
    packet: Packet,
) -> HandlerResult {
    disarm_challenges(conn);
    let challenge = match Challenge::decode(&packet.body) {
        Ok(c) => c,
        Err(e) => return malformed(conn, packet.opcode, e),
    };

    debug!(id = %conn.id(), identity = %challenge.identity, "logon challenge");
    conn.role_mut().transition(ResponderState::LookingUp);

    let lookup = conn.role().store.lookup_credential(&challenge.identity);
    conn.defer(lookup, on_credential::<P>);
    HandlerResult::Block
}

fn on_credential<P: Protocol>(
    conn: &mut Connection<P, Responder>,
    result: Result<Option<CredentialRecord>, StoreError>,
) -> HandlerResult {
    let opcode = P::HANDSHAKE.logon_challenge;
    let record = match result {
        Ok(Some(record)) => record,
        Ok(None) => {
            let reply = ChallengeReply::failure(AuthResult::FailWrongCredentials).encode();
            return fail_round(conn, HandshakeError::UnknownIdentity, opcode, reply);
        }
        Err(e) => {
            let reply = ChallengeReply::failure(AuthResult::FailTemporarilyUnavailable).encode();
            return fail_round(conn, store_error(e), opcode, reply);
        }
    };

    let challenge = ResponderChallenge::new(&record, &mut secure_rng());
    let server_public = match challenge.server_public() {
        Ok(b) => b,
        Err(e) => {
            let reply = ChallengeReply::failure(AuthResult::FailTemporarilyUnavailable).encode();
            return fail_round(conn, e, opcode, reply);
        }
    };

    let reply = ChallengeReply {
        result: AuthResult::Success,
        values: Some(ServerValues {
            server_public,
            generator: GENERATOR,
            modulus: SrpConstants::get().modulus_le,
            salt: challenge.salt().to_vec(),
        }),
    };
    conn.send(opcode, &reply);
    conn.role_mut()
        .transition(ResponderState::AwaitingProof(Box::new(challenge)));
    conn.table().register(P::HANDSHAKE.logon_proof, on_logon_proof::<P>);
    HandlerResult::Pass
}

fn on_logon_proof<P: Protocol>(
    conn: &mut Connection<P, Responder>,
    packet: Packet,
) -> HandlerResult {
    conn.table().clear(P::HANDSHAKE.logon_proof);

    let challenge = match conn.role_mut().transition(ResponderState::Persisting) {
        ResponderState::AwaitingProof(challenge) => challenge,
        other => {
            warn!(id = %conn.id(), state = other.name(), "logon proof out of sequence");
            conn.role_mut().transition(ResponderState::Rejected);
            return HandlerResult::Disconnect;
        }
    };
    let proof = match LogonProof::decode(&packet.body) {
        Ok(p) => p,
        Err(e) => return malformed(conn, packet.opcode, e),
    };

    let verified = match challenge.verify(&proof.client_public, &proof.client_proof) {
        Ok(v) => v,
        Err(HandshakeError::SafeguardViolation) => {
            warn!(id = %conn.id(), peer = %conn.peer(), "client public ephemeral is zero mod N");
            conn.role_mut().transition(ResponderState::Rejected);
            conn.close(CloseReason::AuthenticationFailed(
                HandshakeError::SafeguardViolation.to_string(),
            ));
            return HandlerResult::Disconnect;
        }
        Err(e) => {
            let reply = ProofReply {
                result: AuthResult::FailWrongCredentials,
                server_proof: None,
            };
            return fail_round(conn, e, packet.opcode, reply.encode());
        }
    };

    let persist = conn.role().store.persist_session_key(
        verified.record_id,
        verified.session_key.to_hex(),
        conn.peer(),
    );
    conn.defer(persist, move |conn, result: Result<(), StoreError>| {
        let opcode = P::HANDSHAKE.logon_proof;
        match result {
            Ok(()) => {
                let reply = ProofReply {
                    result: AuthResult::Success,
                    server_proof: Some(verified.server_proof),
                };
                conn.send(opcode, &reply);
                authenticate(conn, verified.identity, verified.session_key)
            }
            Err(e) => {
                let reply = ProofReply {
                    result: AuthResult::FailTemporarilyUnavailable,
                    server_proof: None,
                };
                fail_round(conn, store_error(e), opcode, reply.encode())
            }
        }
    });
    HandlerResult::Block
}

// =============================================================================
// RECONNECT
// =============================================================================

fn on_reconnect_challenge<P: Protocol>(
    conn: &mut Connection<P, Responder>,
    packet: Packet,
) -> HandlerResult {
    disarm_challenges(conn);
    let challenge = match Challenge::decode(&packet.body) {
        Ok(c) => c,
        Err(e) => return malformed(conn, packet.opcode, e),
    };

    debug!(id = %conn.id(), identity = %challenge.identity, "reconnect challenge");
    conn.role_mut().transition(ResponderState::LookingUp);

    let identity = crate::auth::normalize_identity(&challenge.identity);
    let lookup = conn.role().store.lookup_session_key(&identity);
    conn.defer(lookup, move |conn, result| on_stored_session::<P>(conn, identity, result));
    HandlerResult::Block
}

fn on_stored_session<P: Protocol>(
    conn: &mut Connection<P, Responder>,
    identity: String,
    result: Result<Option<String>, StoreError>,
) -> HandlerResult {
    let opcode = P::HANDSHAKE.reconnect_challenge;
    let failure = |result| {
        ReconnectChallengeReply {
            result,
            server_data: None,
        }
        .encode()
    };

    let session_key = match result {
        Ok(found) => match found.as_deref().and_then(SessionKey::from_hex) {
            Some(key) => key,
            None => {
                let reply = failure(AuthResult::FailWrongCredentials);
                return fail_round(conn, HandshakeError::UnknownIdentity, opcode, reply);
            }
        },
        Err(e) => {
            let reply = failure(AuthResult::FailTemporarilyUnavailable);
            return fail_round(conn, store_error(e), opcode, reply);
        }
    };

    let mut server_data = [0u8; RECONNECT_CHALLENGE_LENGTH];
    secure_rng().fill_bytes(&mut server_data);

    conn.send(
        opcode,
        &ReconnectChallengeReply {
            result: AuthResult::Success,
            server_data: Some(server_data),
        },
    );
    conn.role_mut()
        .transition(ResponderState::AwaitingReconnectProof {
            identity,
            session_key,
            server_data,
        });
    conn.table()
        .register(P::HANDSHAKE.reconnect_proof, on_reconnect_proof::<P>);
    HandlerResult::Pass
}

fn on_reconnect_proof<P: Protocol>(
    conn: &mut Connection<P, Responder>,
    packet: Packet,
) -> HandlerResult {
    conn.table().clear(P::HANDSHAKE.reconnect_proof);

    let (identity, session_key, server_data) =
        match conn.role_mut().transition(ResponderState::Rejected) {
            ResponderState::AwaitingReconnectProof {
                identity,
                session_key,
                server_data,
            } => (identity, session_key, server_data),
            other => {
                warn!(id = %conn.id(), state = other.name(), "reconnect proof out of sequence");
                return HandlerResult::Disconnect;
            }
        };
    let proof = match ReconnectProof::decode(&packet.body) {
        Ok(p) => p,
        Err(e) => return malformed(conn, packet.opcode, e),
    };

    let expected =
        compute_reconnect_proof(&identity, &proof.client_data, &server_data, &session_key);
    if expected != proof.proof {
        let error = HandshakeError::ProofMismatch;
        warn!(id = %conn.id(), peer = %conn.peer(), %identity, "reconnect proof mismatch");
        conn.send(
            packet.opcode,
            &ReconnectProofReply {
                result: AuthResult::FailWrongCredentials,
            },
        );
        conn.close(CloseReason::AuthenticationFailed(error.to_string()));
        return HandlerResult::Disconnect;
    }

    conn.send(
        packet.opcode,
        &ReconnectProofReply {
            result: AuthResult::Success,
        },
    );
    authenticate(conn, identity, session_key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::srp6::{compute_client_proof, interleave_session_key, InitiatorChallenge};
    use crate::core::bigint::BigInt;
    use crate::db::MemoryStore;
    use crate::network::connection::ConnectionSettings;
    use crate::network::protocol::ClientLoginProtocol;
    use crate::network::transport::FramedTransport;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::sync::{broadcast, mpsc};
    use tokio::task::JoinHandle;

    type P = ClientLoginProtocol;
    const OP: crate::network::protocol::HandshakeOpcodes = <P as Protocol>::HANDSHAKE;

    struct Peer {
        io: DuplexStream,
        transport: FramedTransport<P>,
        task: JoinHandle<CloseReason>,
        events: mpsc::UnboundedReceiver<SessionEvent>,
        _shutdown: broadcast::Sender<()>,
    }

    impl Peer {
        async fn send<M: HandshakeMessage>(&mut self, opcode: u16, msg: &M) {
            self.send_raw(opcode, &msg.encode()).await;
        }

        async fn send_raw(&mut self, opcode: u16, body: &[u8]) {
            self.transport.queue(opcode, body).unwrap();
            let bytes = self.transport.take_outbound();
            self.io.write_all(&bytes).await.unwrap();
        }

        async fn event(&mut self) -> Option<SessionEvent> {
            loop {
                match self.events.recv().await? {
                    SessionEvent::Opened { .. } => continue,
                    other => return Some(other),
                }
            }
        }

        async fn recv(&mut self) -> Option<Packet> {
            let mut buf = [0u8; 512];
            loop {
                if let Some(p) = self.transport.next_packet().unwrap() {
                    return Some(p);
                }
                let n = self.io.read(&mut buf).await.unwrap_or(0);
                if n == 0 {
                    return None;
                }
                self.transport.receive(&buf[..n]);
            }
        }
    }

    async fn start(store: &MemoryStore, max_attempts: u32) -> Peer {
        let (client, server) = tokio::io::duplex(8192);
        let (events_tx, events) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = broadcast::channel(1);
        let store: Arc<dyn CredentialStore> = Arc::new(store.clone());
        let (_handle, task) = Connection::<P, Responder>::spawn(
            server,
            "127.0.0.1:5000".parse().unwrap(),
            Responder::new(store, max_attempts),
            ConnectionSettings {
                handshake_timeout: Duration::from_secs(5),
            },
            events_tx,
            shutdown_rx,
        );
        Peer {
            io: client,
            transport: FramedTransport::new(),
            task,
            events,
            _shutdown: shutdown,
        }
    }

    fn challenge(identity: &str) -> Challenge {
        Challenge {
            identity: identity.into(),
        }
    }

    /// Drive a full logon; returns the initiator's key.
    async fn logon(peer: &mut Peer, identity: &str, password: &str) -> Option<SessionKey> {
        peer.send(OP.logon_challenge, &challenge(identity)).await;
        let reply = ChallengeReply::decode(&peer.recv().await?.body).unwrap();
        let values = reply.values?;

        let proof = InitiatorChallenge::new(identity, password)
            .unwrap()
            .respond(
                &values.server_public,
                values.generator,
                &values.modulus,
                &values.salt,
                &mut secure_rng(),
            )
            .unwrap();
        peer.send(
            OP.logon_proof,
            &LogonProof {
                client_public: *proof.client_public(),
                client_proof: *proof.client_proof(),
            },
        )
        .await;

        let reply = ProofReply::decode(&peer.recv().await?.body).unwrap();
        let key = proof.verify_server_proof(&reply.server_proof?).ok()?;
        peer.transport.enable_cipher(&key);
        Some(key)
    }

    #[tokio::test]
    async fn test_full_logon_persists_key() {
        let store = MemoryStore::new();
        let id = store.register("TESTUSER", "hunter2").await;
        let mut peer = start(&store, 3).await;

        let key = logon(&mut peer, "TESTUSER", "hunter2").await.unwrap();
        match peer.event().await {
            Some(SessionEvent::Authenticated {
                identity,
                session_key,
                ..
            }) => {
                assert_eq!(identity, "TESTUSER");
                assert_eq!(session_key, key);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(store.session(id).await.unwrap().session_key_hex, key.to_hex());

        // Application opcodes are open and forwarded; headers are ciphered.
        peer.send_raw(0x10, b"realms?").await;
        match peer.event().await {
            Some(SessionEvent::Packet { packet, .. }) => assert_eq!(packet.body, b"realms?"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_corrupted_proof_never_persists() {
        let store = MemoryStore::new();
        store.register("TESTUSER", "hunter2").await;
        let mut peer = start(&store, 3).await;

        peer.send(OP.logon_challenge, &challenge("TESTUSER")).await;
        let values = ChallengeReply::decode(&peer.recv().await.unwrap().body)
            .unwrap()
            .values
            .unwrap();
        let proof = InitiatorChallenge::new("TESTUSER", "hunter2")
            .unwrap()
            .respond(&values.server_public, 7, &values.modulus, &values.salt, &mut secure_rng())
            .unwrap();
        let mut m1 = *proof.client_proof();
        m1[3] ^= 0x01;
        peer.send(
            OP.logon_proof,
            &LogonProof {
                client_public: *proof.client_public(),
                client_proof: m1,
            },
        )
        .await;

        let reply = ProofReply::decode(&peer.recv().await.unwrap().body).unwrap();
        assert_eq!(reply.result, AuthResult::FailWrongCredentials);
        assert_eq!(store.persist_calls(), 0);
    }

    #[tokio::test]
    async fn test_unknown_identity_then_retry() {
        let store = MemoryStore::new();
        store.register("TESTUSER", "hunter2").await;
        let mut peer = start(&store, 3).await;

        peer.send(OP.logon_challenge, &challenge("NOBODY")).await;
        let reply = ChallengeReply::decode(&peer.recv().await.unwrap().body).unwrap();
        assert_eq!(reply.result, AuthResult::FailWrongCredentials);

        assert!(logon(&mut peer, "TESTUSER", "hunter2").await.is_some());
    }

    #[tokio::test]
    async fn test_attempts_are_bounded() {
        let store = MemoryStore::new();
        let mut peer = start(&store, 2).await;

        for _ in 0..2 {
            peer.send(OP.logon_challenge, &challenge("NOBODY")).await;
            let reply = ChallengeReply::decode(&peer.recv().await.unwrap().body).unwrap();
            assert_eq!(reply.result, AuthResult::FailWrongCredentials);
        }
        assert!(peer.recv().await.is_none());
        assert!(matches!(
            peer.task.await.unwrap(),
            CloseReason::AuthenticationFailed(_)
        ));
    }

    #[tokio::test]
    async fn test_store_outage_is_distinct_and_retryable() {
        let store = MemoryStore::new();
        store.register("TESTUSER", "hunter2").await;
        store.set_fail_lookups(true);
        let mut peer = start(&store, 1).await;

        for _ in 0..3 {
            peer.send(OP.logon_challenge, &challenge("TESTUSER")).await;
            let reply = ChallengeReply::decode(&peer.recv().await.unwrap().body).unwrap();
            assert_eq!(reply.result, AuthResult::FailTemporarilyUnavailable);
        }

        store.set_fail_lookups(false);
        assert!(logon(&mut peer, "TESTUSER", "hunter2").await.is_some());
    }

    #[tokio::test]
    async fn test_persist_failure_reports_unavailable() {
        let store = MemoryStore::new();
        store.register("TESTUSER", "hunter2").await;
        store.set_fail_persists(true);
        let mut peer = start(&store, 3).await;

        peer.send(OP.logon_challenge, &challenge("TESTUSER")).await;
        let values = ChallengeReply::decode(&peer.recv().await.unwrap().body)
            .unwrap()
            .values
            .unwrap();
        let proof = InitiatorChallenge::new("TESTUSER", "hunter2")
            .unwrap()
            .respond(&values.server_public, 7, &values.modulus, &values.salt, &mut secure_rng())
            .unwrap();
        peer.send(
            OP.logon_proof,
            &LogonProof {
                client_public: *proof.client_public(),
                client_proof: *proof.client_proof(),
            },
        )
        .await;

        let reply = ProofReply::decode(&peer.recv().await.unwrap().body).unwrap();
        assert_eq!(reply.result, AuthResult::FailTemporarilyUnavailable);
        assert_eq!(store.persist_calls(), 1);
    }

    #[tokio::test]
    async fn test_zero_client_public_disconnects_without_reply() {
        let store = MemoryStore::new();
        store.register("TESTUSER", "hunter2").await;
        let mut peer = start(&store, 3).await;

        peer.send(OP.logon_challenge, &challenge("TESTUSER")).await;
        peer.recv().await.unwrap();

        // A = N, so A mod N == 0.
        let n = SrpConstants::get().modulus_le;
        let fake_key = interleave_session_key(&BigInt::zero());
        let fake_m1 = compute_client_proof(
            "TESTUSER",
            &[],
            &BigInt::from_bytes_le(&n),
            &BigInt::zero(),
            &fake_key,
        );
        peer.send(
            OP.logon_proof,
            &LogonProof {
                client_public: n,
                client_proof: fake_m1,
            },
        )
        .await;

        assert!(peer.recv().await.is_none());
        assert!(matches!(
            peer.task.await.unwrap(),
            CloseReason::AuthenticationFailed(_)
        ));
        assert_eq!(store.persist_calls(), 0);
    }

    #[tokio::test]
    async fn test_second_challenge_disconnects() {
        let store = MemoryStore::new();
        store.register("TESTUSER", "hunter2").await;
        let mut peer = start(&store, 3).await;

        logon(&mut peer, "TESTUSER", "hunter2").await.unwrap();
        peer.send(OP.logon_challenge, &challenge("TESTUSER")).await;

        assert!(peer.recv().await.is_none());
        assert!(matches!(
            peer.task.await.unwrap(),
            CloseReason::ProtocolViolation(_)
        ));
    }

    #[tokio::test]
    async fn test_proof_before_challenge_disconnects() {
        let store = MemoryStore::new();
        let mut peer = start(&store, 3).await;
        peer.send(
            OP.logon_proof,
            &LogonProof {
                client_public: [1; 32],
                client_proof: [0; 20],
            },
        )
        .await;
        assert!(matches!(
            peer.task.await.unwrap(),
            CloseReason::ProtocolViolation(_)
        ));
    }

    #[tokio::test]
    async fn test_reconnect_with_stored_key() {
        let store = MemoryStore::new();
        store.register("TESTUSER", "hunter2").await;

        let mut first = start(&store, 3).await;
        let key = logon(&mut first, "TESTUSER", "hunter2").await.unwrap();

        let mut peer = start(&store, 3).await;
        peer.send(OP.reconnect_challenge, &challenge("testuser")).await;
        let reply = ReconnectChallengeReply::decode(&peer.recv().await.unwrap().body).unwrap();
        let server_data = reply.server_data.unwrap();

        let client_data = [0x44u8; RECONNECT_CHALLENGE_LENGTH];
        let proof = compute_reconnect_proof("TESTUSER", &client_data, &server_data, &key);
        peer.send(OP.reconnect_proof, &ReconnectProof { client_data, proof })
            .await;
        let reply = ReconnectProofReply::decode(&peer.recv().await.unwrap().body).unwrap();
        assert_eq!(reply.result, AuthResult::Success);

        match peer.event().await {
            Some(SessionEvent::Authenticated { session_key, .. }) => assert_eq!(session_key, key),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_reconnect_bad_proof_closes() {
        let store = MemoryStore::new();
        store.register("TESTUSER", "hunter2").await;
        let mut first = start(&store, 3).await;
        logon(&mut first, "TESTUSER", "hunter2").await.unwrap();

        let mut peer = start(&store, 3).await;
        peer.send(OP.reconnect_challenge, &challenge("TESTUSER")).await;
        peer.recv().await.unwrap();
        peer.send(
            OP.reconnect_proof,
            &ReconnectProof {
                client_data: [0; 16],
                proof: [0; 20],
            },
        )
        .await;

        let reply = ReconnectProofReply::decode(&peer.recv().await.unwrap().body).unwrap();
        assert_eq!(reply.result, AuthResult::FailWrongCredentials);
        assert!(matches!(
            peer.task.await.unwrap(),
            CloseReason::AuthenticationFailed(_)
        ));
    }

    /// Store whose credential lookups finish only after a fixed delay.
    struct SlowStore {
        inner: MemoryStore,
        delay: Duration,
        lookups_completed: Arc<std::sync::atomic::AtomicUsize>,
    }

    impl CredentialStore for SlowStore {
        fn lookup_credential(
            &self,
            identity: &str,
        ) -> futures_util::future::BoxFuture<'static, Result<Option<CredentialRecord>, StoreError>>
        {
            let lookup = self.inner.lookup_credential(identity);
            let delay = self.delay;
            let completed = self.lookups_completed.clone();
            Box::pin(async move {
                tokio::time::sleep(delay).await;
                let record = lookup.await;
                completed.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                record
            })
        }

        fn persist_session_key(
            &self,
            id: u32,
            session_key_hex: String,
            peer: std::net::SocketAddr,
        ) -> futures_util::future::BoxFuture<'static, Result<(), StoreError>> {
            self.inner.persist_session_key(id, session_key_hex, peer)
        }

        fn lookup_session_key(
            &self,
            identity: &str,
        ) -> futures_util::future::BoxFuture<'static, Result<Option<String>, StoreError>> {
            self.inner.lookup_session_key(identity)
        }
    }

    #[tokio::test]
    async fn test_lookup_finishing_after_close_is_dropped() {
        let inner = MemoryStore::new();
        inner.register("TESTUSER", "hunter2").await;
        let lookups_completed = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let store: Arc<dyn CredentialStore> = Arc::new(SlowStore {
            inner: inner.clone(),
            delay: Duration::from_millis(200),
            lookups_completed: lookups_completed.clone(),
        });

        let (mut client, server) = tokio::io::duplex(8192);
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let (_shutdown, shutdown_rx) = broadcast::channel(1);
        let (handle, task) = Connection::<P, Responder>::spawn(
            server,
            "127.0.0.1:5000".parse().unwrap(),
            Responder::new(store, 3),
            ConnectionSettings {
                handshake_timeout: Duration::from_secs(5),
            },
            events_tx,
            shutdown_rx,
        );

        let mut transport = FramedTransport::<P>::new();
        transport
            .queue(OP.logon_challenge, &challenge("TESTUSER").encode())
            .unwrap();
        client.write_all(&transport.take_outbound()).await.unwrap();

        // Peer goes away while the lookup is still pending.
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(client);
        assert_eq!(task.await.unwrap(), CloseReason::PeerClosed);
        assert_eq!(lookups_completed.load(std::sync::atomic::Ordering::SeqCst), 0);

        // Let the lookup land on the closed connection.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(lookups_completed.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert!(!handle.is_open());
        assert_eq!(inner.persist_calls(), 0);

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert!(matches!(seen.first(), Some(SessionEvent::Opened { .. })));
        assert!(matches!(seen.last(), Some(SessionEvent::Closed { .. })));
        assert!(!seen
            .iter()
            .any(|e| matches!(e, SessionEvent::Authenticated { .. })));
    }
}
