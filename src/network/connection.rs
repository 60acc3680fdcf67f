//! Connection Actor
//!
//! One task per socket. The task alone owns the transport, the dispatch
//! table and the handshake role; everything else talks to it through
//! channels:
//!
//! ```text
//!            +---------------------- Connection task -----------------------+
//!  socket -> | read -> FramedTransport -> DispatchTable -> role handlers     |
//!            |                                  |                           |
//!            |        deferred continuations <--+-- spawned store futures   |
//!            |                                                              |
//!            | queue -> send buffer -> writer task (one write in flight)    | -> socket
//!            +--------------------------------------------------------------+
//!                 ^ ConnectionHandle commands          | SessionEvent
//! ```
//!
//! A store call made by a handler runs in its own task and posts a
//! continuation back over a channel. Once the connection task has exited the
//! channel is closed, so a late result is dropped without touching any
//! connection state.

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::dispatch::{DispatchTable, HandlerResult};
use super::protocol::{HandshakeMessage, Packet, Protocol};
use super::transport::FramedTransport;
use crate::auth::SessionKey;

/// Read buffer size per socket read.
const READ_CHUNK: usize = 4096;

/// Upper bound on draining queued output after the loop exits.
const FLUSH_ON_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Unique connection identifier.
pub type ConnectionId = Uuid;

/// Why a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Peer closed the socket.
    PeerClosed,
    /// Closed through a [`ConnectionHandle`].
    Local,
    /// Server shutting down.
    Shutdown,
    /// Not authenticated within the handshake timeout.
    HandshakeTimeout,
    /// Malformed framing or an opcode the current state does not accept.
    ProtocolViolation(String),
    /// Handshake failed for good.
    AuthenticationFailed(String),
    /// Socket error.
    Io(String),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::PeerClosed => f.write_str("peer closed"),
            CloseReason::Local => f.write_str("closed locally"),
            CloseReason::Shutdown => f.write_str("shutdown"),
            CloseReason::HandshakeTimeout => f.write_str("handshake timeout"),
            CloseReason::ProtocolViolation(why) => write!(f, "protocol violation: {why}"),
            CloseReason::AuthenticationFailed(why) => write!(f, "authentication failed: {why}"),
            CloseReason::Io(why) => write!(f, "i/o error: {why}"),
        }
    }
}

/// Notifications delivered to the connection's observer.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A connection was accepted or established.
    Opened {
        /// Handle to the new connection.
        handle: ConnectionHandle,
    },
    /// Handshake completed.
    Authenticated {
        /// Connection id.
        id: ConnectionId,
        /// Authenticated identity.
        identity: String,
        /// Negotiated (or recovered) session key.
        session_key: SessionKey,
    },
    /// Application packet on an authenticated connection.
    Packet {
        /// Connection id.
        id: ConnectionId,
        /// The packet.
        packet: Packet,
    },
    /// Connection task finished.
    Closed {
        /// Connection id.
        id: ConnectionId,
        /// Why.
        reason: CloseReason,
    },
}

/// Per-connection handshake behaviour.
///
/// Roles are stored inside the connection and reach their own state through
/// [`Connection::role_mut`], which is why the hooks take the connection
/// rather than `self`.
pub trait SessionRole<P: Protocol>: Sized + Send + 'static {
    /// Install the initial handlers and queue any opening message.
    fn on_open(conn: &mut Connection<P, Self>);

    /// Connection is about to be dropped.
    fn on_close(_conn: &mut Connection<P, Self>, _reason: &CloseReason) {}

    /// `true` once the handshake has completed.
    fn is_authenticated(&self) -> bool;
}

/// Limits applied to every connection.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionSettings {
    /// Close connections that have not authenticated by then.
    pub handshake_timeout: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(30),
        }
    }
}

enum Command {
    Send(Packet),
    Close,
}

/// Cloneable handle for talking to a connection task.
#[derive(Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    peer: SocketAddr,
    commands: mpsc::UnboundedSender<Command>,
}

impl ConnectionHandle {
    /// Connection id.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Remote address.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Queue a packet. Returns `false` if the connection is gone.
    pub fn send(&self, packet: Packet) -> bool {
        self.commands.send(Command::Send(packet)).is_ok()
    }

    /// Ask the connection to flush and close.
    pub fn close(&self) {
        let _ = self.commands.send(Command::Close);
    }

    /// `true` while the connection task is running.
    pub fn is_open(&self) -> bool {
        !self.commands.is_closed()
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .finish()
    }
}

type Continuation<P, R> = Box<dyn FnOnce(&mut Connection<P, R>) -> HandlerResult + Send>;

/// State owned by one connection task.
pub struct Connection<P: Protocol, R: SessionRole<P>> {
    id: ConnectionId,
    peer: SocketAddr,
    transport: FramedTransport<P>,
    table: DispatchTable<Connection<P, R>>,
    role: R,
    events: mpsc::UnboundedSender<SessionEvent>,
    deferred_tx: mpsc::UnboundedSender<Continuation<P, R>>,
    blocked: bool,
    closing: Option<CloseReason>,
    write_in_flight: bool,
}

impl<P: Protocol, R: SessionRole<P>> Connection<P, R> {
    /// Start a connection task over `io`.
    ///
    /// `events` receives [`SessionEvent::Opened`] immediately and
    /// [`SessionEvent::Closed`] last. The task resolves to the close reason.
    pub fn spawn<IO>(
        io: IO,
        peer: SocketAddr,
        role: R,
        settings: ConnectionSettings,
        events: mpsc::UnboundedSender<SessionEvent>,
        shutdown: broadcast::Receiver<()>,
    ) -> (ConnectionHandle, JoinHandle<CloseReason>)
    where
        IO: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (deferred_tx, deferred_rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();

        let conn = Connection {
            id,
            peer,
            transport: FramedTransport::new(),
            table: DispatchTable::new(),
            role,
            events,
            deferred_tx,
            blocked: false,
            closing: None,
            write_in_flight: false,
        };

        let handle = ConnectionHandle {
            id,
            peer,
            commands: command_tx,
        };
        // Sent before the task starts so it always precedes the task's own events.
        conn.emit(SessionEvent::Opened {
            handle: handle.clone(),
        });
        let task = tokio::spawn(conn.run(io, settings, command_rx, deferred_rx, shutdown));
        (handle, task)
    }

    async fn run<IO>(
        mut self,
        io: IO,
        settings: ConnectionSettings,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut deferred_rx: mpsc::UnboundedReceiver<Continuation<P, R>>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> CloseReason
    where
        IO: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut reader, mut writer) = tokio::io::split(io);
        let (write_tx, mut write_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<std::io::Result<()>>();

        let writer_task = tokio::spawn(async move {
            while let Some(buf) = write_rx.recv().await {
                let result = writer.write_all(&buf).await;
                let failed = result.is_err();
                let _ = done_tx.send(result);
                if failed {
                    break;
                }
            }
            let _ = writer.shutdown().await;
        });

        debug!(id = %self.id, peer = %self.peer, tier = %P::TIER, "connection opened");
        R::on_open(&mut self);

        let deadline = tokio::time::sleep(settings.handshake_timeout);
        tokio::pin!(deadline);
        let mut buf = vec![0u8; READ_CHUNK];
        let mut commands_open = true;
        let mut shutdown_open = true;

        let reason = loop {
            if let Some(reason) = self.closing.take() {
                break reason;
            }
            self.flush(&write_tx);

            let authenticated = self.role.is_authenticated();
            tokio::select! {
                read = reader.read(&mut buf), if !self.blocked => match read {
                    Ok(0) => break CloseReason::PeerClosed,
                    Ok(n) => {
                        self.transport.receive(&buf[..n]);
                        self.process_inbound();
                    }
                    Err(e) => break CloseReason::Io(e.to_string()),
                },
                Some(continuation) = deferred_rx.recv() => {
                    self.blocked = false;
                    let result = continuation(&mut self);
                    self.apply(result);
                    self.process_inbound();
                }
                command = commands.recv(), if commands_open => match command {
                    Some(Command::Send(packet)) => self.send_packet(packet.opcode, &packet.body),
                    Some(Command::Close) => break CloseReason::Local,
                    None => commands_open = false,
                },
                Some(done) = done_rx.recv() => {
                    self.write_in_flight = false;
                    if let Err(e) = done {
                        break CloseReason::Io(e.to_string());
                    }
                }
                _ = &mut deadline, if !authenticated => {
                    break CloseReason::HandshakeTimeout;
                }
                signal = shutdown.recv(), if shutdown_open => match signal {
                    Err(broadcast::error::RecvError::Closed) => shutdown_open = false,
                    _ => break CloseReason::Shutdown,
                },
            }
        };

        R::on_close(&mut self, &reason);
        if self.transport.has_outbound() {
            let _ = write_tx.send(self.transport.take_outbound());
        }
        drop(write_tx);
        if tokio::time::timeout(FLUSH_ON_CLOSE_TIMEOUT, writer_task).await.is_err() {
            warn!(id = %self.id, "timed out flushing output on close");
        }

        match &reason {
            CloseReason::PeerClosed | CloseReason::Local | CloseReason::Shutdown => {
                info!(id = %self.id, peer = %self.peer, %reason, "connection closed")
            }
            _ => warn!(id = %self.id, peer = %self.peer, %reason, "connection closed"),
        }
        self.emit(SessionEvent::Closed {
            id: self.id,
            reason: reason.clone(),
        });
        reason
    }

    /// Hand queued output to the writer if it is idle.
    fn flush(&mut self, write_tx: &mpsc::UnboundedSender<Vec<u8>>) {
        if self.write_in_flight || !self.transport.has_outbound() {
            return;
        }
        if write_tx.send(self.transport.take_outbound()).is_ok() {
            self.write_in_flight = true;
        }
    }

    /// Dispatch buffered packets in arrival order until blocked, closing or
    /// out of complete packets.
    fn process_inbound(&mut self) {
        while !self.blocked && self.closing.is_none() {
            match self.transport.next_packet() {
                Ok(Some(packet)) => {
                    debug!(
                        id = %self.id,
                        opcode = packet.opcode,
                        name = P::opcode_name(packet.opcode),
                        size = packet.body.len(),
                        "packet received"
                    );
                    #[cfg(feature = "debug-tracing")]
                    tracing::trace!(
                        id = %self.id,
                        body = %hex::encode(&packet.body),
                        "packet body"
                    );
                    let opcode = packet.opcode;
                    let handler = self.table.dispatch(opcode);
                    let result = handler(self, packet);
                    if result == HandlerResult::Disconnect && self.closing.is_none() {
                        self.closing = Some(CloseReason::ProtocolViolation(format!(
                            "opcode {:#06x} ({}) not accepted",
                            opcode,
                            P::opcode_name(opcode)
                        )));
                    }
                    self.apply(result);
                }
                Ok(None) => break,
                Err(e) => {
                    self.closing = Some(CloseReason::ProtocolViolation(e.to_string()));
                }
            }
        }
    }

    fn apply(&mut self, result: HandlerResult) {
        match result {
            HandlerResult::Pass => {}
            HandlerResult::Block => self.blocked = true,
            HandlerResult::Disconnect => {
                if self.closing.is_none() {
                    self.closing = Some(CloseReason::ProtocolViolation("disconnected".into()));
                }
            }
        }
    }

    // =========================================================================
    // API FOR ROLES AND HANDLERS
    // =========================================================================

    /// Connection id.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Remote address.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// The handshake role.
    pub fn role(&self) -> &R {
        &self.role
    }

    /// The handshake role, mutably.
    pub fn role_mut(&mut self) -> &mut R {
        &mut self.role
    }

    /// This connection's dispatch table.
    pub fn table(&self) -> &DispatchTable<Self> {
        &self.table
    }

    /// Queue a raw packet.
    ///
    /// An oversized body is a local bug; the connection is closed rather
    /// than sending a truncated frame.
    pub fn send_packet(&mut self, opcode: u16, body: &[u8]) {
        if let Err(e) = self.transport.queue(opcode, body) {
            warn!(id = %self.id, opcode, error = %e, "dropping connection on outbound frame error");
            self.close(CloseReason::ProtocolViolation(e.to_string()));
        }
    }

    /// Queue a handshake message.
    pub fn send<M: HandshakeMessage>(&mut self, opcode: u16, message: &M) {
        self.send_packet(opcode, &message.encode());
    }

    /// Start ciphering headers. Queued output stays in the clear.
    pub fn enable_cipher(&mut self, session_key: &SessionKey) {
        self.transport.enable_cipher(session_key);
    }

    /// `true` once headers are ciphered.
    pub fn is_encrypted(&self) -> bool {
        self.transport.is_encrypted()
    }

    /// Close after the current handler returns. The first reason wins.
    pub fn close(&mut self, reason: CloseReason) {
        if self.closing.is_none() {
            self.closing = Some(reason);
        }
    }

    /// Notify the observer. A dropped observer is not an error.
    pub fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    /// Register the forwarding handler for every application opcode.
    pub fn open_application(&mut self) {
        for (opcode, _) in P::APPLICATION_OPCODES {
            self.table.register(*opcode, |conn: &mut Self, packet| {
                conn.emit(SessionEvent::Packet {
                    id: conn.id,
                    packet,
                });
                HandlerResult::Pass
            });
        }
    }

    /// Run `fut` off the connection task and feed its output to `cont` back
    /// on it.
    ///
    /// The calling handler should return [`HandlerResult::Block`] so no
    /// further packet is dispatched until `cont` has run.
    pub fn defer<F, T, K>(&self, fut: F, cont: K)
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
        K: FnOnce(&mut Self, T) -> HandlerResult + Send + 'static,
    {
        let tx = self.deferred_tx.clone();
        tokio::spawn(async move {
            let value = fut.await;
            let continuation: Continuation<P, R> = Box::new(move |conn| cont(conn, value));
            let _ = tx.send(continuation);
        });
    }
}
