//! Initiator Role
//!
//! Client side of the handshake, used by game clients and by peer servers
//! authenticating to their upstream tier. The outcome is delivered once on a
//! oneshot channel; a connection that closes first resolves it with the
//! close reason.

use rand::RngCore;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::auth::constants::RECONNECT_CHALLENGE_LENGTH;
use crate::auth::srp6::compute_reconnect_proof;
use crate::auth::{
    validate_identity, AuthResult, HandshakeError, InitiatorChallenge, InitiatorProof, SessionKey,
};
use crate::core::rng::secure_rng;
use crate::network::connection::{CloseReason, Connection, SessionEvent, SessionRole};
use crate::network::dispatch::HandlerResult;
use crate::network::protocol::{
    Challenge, ChallengeReply, HandshakeMessage, LogonProof, Packet, ProofReply, Protocol,
    ReconnectChallengeReply, ReconnectProof, ReconnectProofReply,
};

/// Outcome of an initiator handshake.
pub type HandshakeOutcome = Result<SessionKey, HandshakeError>;

enum InitiatorState {
    Idle(Plan),
    ChallengeSent(InitiatorChallenge),
    ProofSent {
        identity: String,
        proof: Box<InitiatorProof>,
    },
    ReconnectSent { identity: String, session_key: SessionKey },
    ReconnectProofSent { identity: String, session_key: SessionKey },
    Authenticated,
    Rejected,
}

enum Plan {
    Logon(InitiatorChallenge),
    Reconnect { identity: String, session_key: SessionKey },
}

/// Client-side handshake for one connection.
pub struct Initiator {
    state: InitiatorState,
    outcome: Option<oneshot::Sender<HandshakeOutcome>>,
}

impl Initiator {
    /// Full SRP6 logon as `identity`.
    pub fn logon(
        identity: &str,
        password: &str,
    ) -> Result<(Self, oneshot::Receiver<HandshakeOutcome>), HandshakeError> {
        let challenge = InitiatorChallenge::new(identity, password)?;
        Ok(Self::with_plan(Plan::Logon(challenge)))
    }

    /// Session recovery with a key from an earlier logon.
    pub fn reconnect(
        identity: &str,
        session_key: SessionKey,
    ) -> Result<(Self, oneshot::Receiver<HandshakeOutcome>), HandshakeError> {
        Ok(Self::with_plan(Plan::Reconnect {
            identity: validate_identity(identity)?,
            session_key,
        }))
    }

    fn with_plan(plan: Plan) -> (Self, oneshot::Receiver<HandshakeOutcome>) {
        let (tx, rx) = oneshot::channel();
        let initiator = Self {
            state: InitiatorState::Idle(plan),
            outcome: Some(tx),
        };
        (initiator, rx)
    }

    fn finish(&mut self, outcome: HandshakeOutcome) {
        if let Some(tx) = self.outcome.take() {
            let _ = tx.send(outcome);
        }
    }
}

impl<P: Protocol> SessionRole<P> for Initiator {
    fn on_open(conn: &mut Connection<P, Self>) {
        let plan = match std::mem::replace(&mut conn.role_mut().state, InitiatorState::Rejected) {
            InitiatorState::Idle(plan) => plan,
            _ => return,
        };

        match plan {
            Plan::Logon(challenge) => {
                let message = Challenge {
                    identity: challenge.identity().to_string(),
                };
                conn.send(P::HANDSHAKE.logon_challenge, &message);
                conn.role_mut().state = InitiatorState::ChallengeSent(challenge);
                conn.table()
                    .register(P::HANDSHAKE.logon_challenge, on_challenge_reply::<P>);
            }
            Plan::Reconnect {
                identity,
                session_key,
            } => {
                let message = Challenge {
                    identity: identity.clone(),
                };
                conn.send(P::HANDSHAKE.reconnect_challenge, &message);
                conn.role_mut().state = InitiatorState::ReconnectSent {
                    identity,
                    session_key,
                };
                conn.table().register(
                    P::HANDSHAKE.reconnect_challenge,
                    on_reconnect_challenge_reply::<P>,
                );
            }
        }
        debug!(id = %conn.id(), peer = %conn.peer(), "handshake started");
    }

    fn on_close(conn: &mut Connection<P, Self>, reason: &CloseReason) {
        let error = match reason {
            CloseReason::HandshakeTimeout => HandshakeError::Timeout,
            other => HandshakeError::ConnectionClosed(other.to_string()),
        };
        conn.role_mut().finish(Err(error));
    }

    fn is_authenticated(&self) -> bool {
        matches!(self.state, InitiatorState::Authenticated)
    }
}

fn abort<P: Protocol>(conn: &mut Connection<P, Initiator>, error: HandshakeError) -> HandlerResult {
    warn!(id = %conn.id(), peer = %conn.peer(), %error, kind = ?error.kind(), "handshake aborted");
    conn.role_mut().state = InitiatorState::Rejected;
    conn.close(CloseReason::AuthenticationFailed(error.to_string()));
    conn.role_mut().finish(Err(error));
    HandlerResult::Disconnect
}

fn malformed<P: Protocol>(
    conn: &mut Connection<P, Initiator>,
    error: impl ToString,
) -> HandlerResult {
    let error = HandshakeError::Malformed(error.to_string());
    conn.close(CloseReason::ProtocolViolation(error.to_string()));
    abort(conn, error)
}

fn complete<P: Protocol>(
    conn: &mut Connection<P, Initiator>,
    identity: String,
    session_key: SessionKey,
) -> HandlerResult {
    conn.enable_cipher(&session_key);
    conn.role_mut().state = InitiatorState::Authenticated;
    conn.open_application();
    info!(
        id = %conn.id(),
        peer = %conn.peer(),
        tier = %P::TIER,
        %identity,
        "authenticated to peer"
    );
    conn.emit(SessionEvent::Authenticated {
        id: conn.id(),
        identity,
        session_key: session_key.clone(),
    });
    conn.role_mut().finish(Ok(session_key));
    HandlerResult::Pass
}

fn on_challenge_reply<P: Protocol>(
    conn: &mut Connection<P, Initiator>,
    packet: Packet,
) -> HandlerResult {
    conn.table().clear(P::HANDSHAKE.logon_challenge);

    let challenge = match std::mem::replace(&mut conn.role_mut().state, InitiatorState::Rejected) {
        InitiatorState::ChallengeSent(challenge) => challenge,
        _ => return HandlerResult::Disconnect,
    };
    let reply = match ChallengeReply::decode(&packet.body) {
        Ok(r) => r,
        Err(e) => return malformed(conn, e),
    };
    let values = match (reply.result, reply.values) {
        (AuthResult::Success, Some(values)) => values,
        (result, _) => return abort(conn, HandshakeError::Rejected(result)),
    };

    let proof = match challenge.respond(
        &values.server_public,
        values.generator,
        &values.modulus,
        &values.salt,
        &mut secure_rng(),
    ) {
        Ok(p) => p,
        Err(e) => return abort(conn, e),
    };

    conn.send(
        P::HANDSHAKE.logon_proof,
        &LogonProof {
            client_public: *proof.client_public(),
            client_proof: *proof.client_proof(),
        },
    );
    conn.role_mut().state = InitiatorState::ProofSent {
        identity: challenge.identity().to_string(),
        proof: Box::new(proof),
    };
    conn.table()
        .register(P::HANDSHAKE.logon_proof, on_proof_reply::<P>);
    HandlerResult::Pass
}

fn on_proof_reply<P: Protocol>(
    conn: &mut Connection<P, Initiator>,
    packet: Packet,
) -> HandlerResult {
    conn.table().clear(P::HANDSHAKE.logon_proof);

    let (identity, proof) =
        match std::mem::replace(&mut conn.role_mut().state, InitiatorState::Rejected) {
            InitiatorState::ProofSent { identity, proof } => (identity, proof),
            _ => return HandlerResult::Disconnect,
        };
    let reply = match ProofReply::decode(&packet.body) {
        Ok(r) => r,
        Err(e) => return malformed(conn, e),
    };
    let server_proof = match (reply.result, reply.server_proof) {
        (AuthResult::Success, Some(m2)) => m2,
        (result, _) => return abort(conn, HandshakeError::Rejected(result)),
    };

    // The responder claiming success is not enough: M2 must check out.
    match proof.verify_server_proof(&server_proof) {
        Ok(session_key) => complete(conn, identity, session_key),
        Err(e) => abort(conn, e),
    }
}

fn on_reconnect_challenge_reply<P: Protocol>(
    conn: &mut Connection<P, Initiator>,
    packet: Packet,
) -> HandlerResult {
    conn.table().clear(P::HANDSHAKE.reconnect_challenge);

    let (identity, session_key) =
        match std::mem::replace(&mut conn.role_mut().state, InitiatorState::Rejected) {
            InitiatorState::ReconnectSent {
                identity,
                session_key,
            } => (identity, session_key),
            _ => return HandlerResult::Disconnect,
        };
    let reply = match ReconnectChallengeReply::decode(&packet.body) {
        Ok(r) => r,
        Err(e) => return malformed(conn, e),
    };
    let server_data = match (reply.result, reply.server_data) {
        (AuthResult::Success, Some(data)) => data,
        (result, _) => return abort(conn, HandshakeError::Rejected(result)),
    };

    let mut client_data = [0u8; RECONNECT_CHALLENGE_LENGTH];
    secure_rng().fill_bytes(&mut client_data);
    let proof = compute_reconnect_proof(&identity, &client_data, &server_data, &session_key);

    conn.send(
        P::HANDSHAKE.reconnect_proof,
        &ReconnectProof { client_data, proof },
    );
    conn.role_mut().state = InitiatorState::ReconnectProofSent {
        identity,
        session_key,
    };
    conn.table()
        .register(P::HANDSHAKE.reconnect_proof, on_reconnect_proof_reply::<P>);
    HandlerResult::Pass
}

fn on_reconnect_proof_reply<P: Protocol>(
    conn: &mut Connection<P, Initiator>,
    packet: Packet,
) -> HandlerResult {
    conn.table().clear(P::HANDSHAKE.reconnect_proof);

    let (identity, session_key) =
        match std::mem::replace(&mut conn.role_mut().state, InitiatorState::Rejected) {
            InitiatorState::ReconnectProofSent {
                identity,
                session_key,
            } => (identity, session_key),
            _ => return HandlerResult::Disconnect,
        };
    match ReconnectProofReply::decode(&packet.body) {
        Ok(ReconnectProofReply {
            result: AuthResult::Success,
        }) => complete(conn, identity, session_key),
        Ok(ReconnectProofReply { result }) => abort(conn, HandshakeError::Rejected(result)),
        Err(e) => malformed(conn, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::sync::{broadcast, mpsc};

    use crate::auth::constants::{KEY_LENGTH, MAX_IDENTITY_LENGTH, PROOF_LENGTH};
    use crate::auth::{CredentialRecord, FailureKind, ResponderChallenge, SrpConstants};
    use crate::db::{CredentialStore, MemoryStore};
    use crate::handshake::Responder;
    use crate::network::connection::ConnectionSettings;
    use crate::network::protocol::{ClientLoginProtocol, ServerValues};
    use crate::network::transport::FramedTransport;

    type P = ClientLoginProtocol;

    fn settings() -> ConnectionSettings {
        ConnectionSettings {
            handshake_timeout: Duration::from_secs(5),
        }
    }

    fn spawn_initiator(
        io: DuplexStream,
        initiator: Initiator,
    ) -> (mpsc::UnboundedReceiver<SessionEvent>, broadcast::Sender<()>) {
        let (events_tx, events) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = broadcast::channel(1);
        Connection::<P, Initiator>::spawn(
            io,
            "127.0.0.1:3724".parse().unwrap(),
            initiator,
            settings(),
            events_tx,
            shutdown_rx,
        );
        (events, shutdown)
    }

    #[tokio::test]
    async fn test_initiator_against_responder() {
        let store = MemoryStore::new();
        store.register("TESTUSER", "hunter2").await;
        let (client_io, server_io) = tokio::io::duplex(8192);

        let (server_events_tx, mut server_events) = mpsc::unbounded_channel();
        let (_server_shutdown, server_shutdown_rx) = broadcast::channel(1);
        let shared: Arc<dyn CredentialStore> = Arc::new(store.clone());
        Connection::<P, Responder>::spawn(
            server_io,
            "127.0.0.1:50000".parse().unwrap(),
            Responder::new(shared, 3),
            settings(),
            server_events_tx,
            server_shutdown_rx,
        );

        let (initiator, outcome) = Initiator::logon("testuser", "hunter2").unwrap();
        let (_events, _shutdown) = spawn_initiator(client_io, initiator);

        let client_key = outcome.await.unwrap().unwrap();
        assert!(matches!(
            server_events.recv().await,
            Some(SessionEvent::Opened { .. })
        ));
        match server_events.recv().await {
            Some(SessionEvent::Authenticated { session_key, .. }) => {
                assert_eq!(session_key, client_key)
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_wrong_password_is_rejected() {
        let store = MemoryStore::new();
        store.register("TESTUSER", "hunter2").await;
        let (client_io, server_io) = tokio::io::duplex(8192);

        let (server_events_tx, _server_events) = mpsc::unbounded_channel();
        let (_server_shutdown, server_shutdown_rx) = broadcast::channel(1);
        Connection::<P, Responder>::spawn(
            server_io,
            "127.0.0.1:50001".parse().unwrap(),
            Responder::new(Arc::new(store), 3),
            settings(),
            server_events_tx,
            server_shutdown_rx,
        );

        let (initiator, outcome) = Initiator::logon("TESTUSER", "letmein").unwrap();
        let (_events, _shutdown) = spawn_initiator(client_io, initiator);

        assert_eq!(
            outcome.await.unwrap(),
            Err(HandshakeError::Rejected(AuthResult::FailWrongCredentials))
        );
    }

    /// Scripted responder that answers honestly up to the proof reply.
    async fn scripted_responder(
        mut io: DuplexStream,
        modulus: [u8; KEY_LENGTH],
        server_proof: Option<[u8; PROOF_LENGTH]>,
    ) {
        let record = CredentialRecord::register(1, "TESTUSER", "hunter2", &mut secure_rng());
        let mut transport = FramedTransport::<P>::new();
        let mut buf = [0u8; 512];

        loop {
            if transport.next_packet().unwrap().is_some() {
                break;
            }
            let n = io.read(&mut buf).await.unwrap();
            transport.receive(&buf[..n]);
        }

        let challenge = ResponderChallenge::new(&record, &mut secure_rng());
        let reply = ChallengeReply {
            result: AuthResult::Success,
            values: Some(ServerValues {
                server_public: challenge.server_public().unwrap(),
                generator: 7,
                modulus,
                salt: record.salt.clone(),
            }),
        };
        transport.queue(0x00, &reply.encode()).unwrap();
        io.write_all(&transport.take_outbound()).await.unwrap();

        let proof = loop {
            if let Some(p) = transport.next_packet().unwrap() {
                break LogonProof::decode(&p.body).unwrap();
            }
            let n = io.read(&mut buf).await.unwrap();
            if n == 0 {
                return;
            }
            transport.receive(&buf[..n]);
        };

        let verified = challenge
            .verify(&proof.client_public, &proof.client_proof)
            .unwrap();
        let reply = ProofReply {
            result: AuthResult::Success,
            server_proof: Some(server_proof.unwrap_or(verified.server_proof)),
        };
        transport.queue(0x01, &reply.encode()).unwrap();
        io.write_all(&transport.take_outbound()).await.unwrap();
        let _ = io.read(&mut buf).await;
    }

    #[tokio::test]
    async fn test_lying_responder_is_peer_integrity_failure() {
        let (client_io, server_io) = tokio::io::duplex(8192);
        let modulus = SrpConstants::get().modulus_le;
        tokio::spawn(scripted_responder(server_io, modulus, Some([0xEE; PROOF_LENGTH])));

        let (initiator, outcome) = Initiator::logon("TESTUSER", "hunter2").unwrap();
        let (_events, _shutdown) = spawn_initiator(client_io, initiator);

        let error = outcome.await.unwrap().unwrap_err();
        assert_eq!(error, HandshakeError::ServerProofMismatch);
        assert_eq!(error.kind(), FailureKind::PeerIntegrityFailure);
    }

    #[tokio::test]
    async fn test_honest_scripted_responder_succeeds() {
        let (client_io, server_io) = tokio::io::duplex(8192);
        let modulus = SrpConstants::get().modulus_le;
        tokio::spawn(scripted_responder(server_io, modulus, None));

        let (initiator, outcome) = Initiator::logon("TESTUSER", "hunter2").unwrap();
        let (_events, _shutdown) = spawn_initiator(client_io, initiator);
        assert!(outcome.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_foreign_group_aborts() {
        let (client_io, server_io) = tokio::io::duplex(8192);
        let mut modulus = SrpConstants::get().modulus_le;
        modulus[5] ^= 0x10;
        tokio::spawn(scripted_responder(server_io, modulus, None));

        let (initiator, outcome) = Initiator::logon("TESTUSER", "hunter2").unwrap();
        let (_events, _shutdown) = spawn_initiator(client_io, initiator);
        assert_eq!(
            outcome.await.unwrap(),
            Err(HandshakeError::IncompatibleGroup)
        );
    }

    #[tokio::test]
    async fn test_silent_peer_times_out() {
        let (client_io, _server_io) = tokio::io::duplex(8192);
        let (events_tx, _events) = mpsc::unbounded_channel();
        let (_shutdown, shutdown_rx) = broadcast::channel(1);
        let (initiator, outcome) = Initiator::logon("TESTUSER", "hunter2").unwrap();
        Connection::<P, Initiator>::spawn(
            client_io,
            "127.0.0.1:3724".parse().unwrap(),
            initiator,
            ConnectionSettings {
                handshake_timeout: Duration::from_millis(50),
            },
            events_tx,
            shutdown_rx,
        );
        assert_eq!(outcome.await.unwrap(), Err(HandshakeError::Timeout));
    }

    #[test]
    fn test_oversized_identity_is_refused_up_front() {
        let long = "X".repeat(MAX_IDENTITY_LENGTH + 1);
        assert_eq!(
            Initiator::logon(&long, "pw").err(),
            Some(HandshakeError::InvalidIdentity(MAX_IDENTITY_LENGTH + 1))
        );
        assert_eq!(
            Initiator::reconnect("   ", SessionKey::from_bytes([0; 40])).err(),
            Some(HandshakeError::InvalidIdentity(0))
        );
        assert!(Initiator::logon(&"x".repeat(MAX_IDENTITY_LENGTH), "pw").is_ok());
    }
}
