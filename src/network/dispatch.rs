//! Opcode Dispatch
//!
//! Per-connection map from opcode to handler. The handshake state machines
//! express every transition as one register/clear pair on this table, so the
//! set of registered opcodes is always exactly what the current state
//! accepts. Anything else disconnects.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::warn;

use super::protocol::Packet;

/// What the dispatch loop does after a handler returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerResult {
    /// Keep parsing buffered packets.
    Pass,
    /// Stop parsing until a deferred continuation resumes the connection.
    Block,
    /// Tear the connection down.
    Disconnect,
}

/// Handler invoked with the owning connection and the packet.
pub type Handler<C> = Arc<dyn Fn(&mut C, Packet) -> HandlerResult + Send + Sync>;

/// Opcode to handler map guarded by a mutex.
pub struct DispatchTable<C> {
    handlers: Mutex<BTreeMap<u16, Handler<C>>>,
}

impl<C> Default for DispatchTable<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> DispatchTable<C> {
    /// Empty table. Every opcode disconnects.
    pub fn new() -> Self {
        Self {
            handlers: Mutex::new(BTreeMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<u16, Handler<C>>> {
        // A panicking handler cannot leave the map half-updated.
        self.handlers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Install `handler` for `opcode`, replacing any existing one.
    pub fn register<F>(&self, opcode: u16, handler: F)
    where
        F: Fn(&mut C, Packet) -> HandlerResult + Send + Sync + 'static,
    {
        self.lock().insert(opcode, Arc::new(handler));
    }

    /// Remove the handler for `opcode`.
    pub fn clear(&self, opcode: u16) {
        self.lock().remove(&opcode);
    }

    /// `true` if `opcode` currently has a handler.
    pub fn is_registered(&self, opcode: u16) -> bool {
        self.lock().contains_key(&opcode)
    }

    /// Registered opcodes in ascending order.
    pub fn opcodes(&self) -> Vec<u16> {
        self.lock().keys().copied().collect()
    }
}

impl<C: 'static> DispatchTable<C> {
    /// Handler for `opcode`, or a sentinel that disconnects.
    ///
    /// The lock is released before the handler runs, so handlers are free to
    /// register and clear opcodes.
    pub fn dispatch(&self, opcode: u16) -> Handler<C> {
        match self.lock().get(&opcode) {
            Some(handler) => handler.clone(),
            None => {
                let sentinel: Handler<C> = Arc::new(unregistered::<C>);
                sentinel
            }
        }
    }
}

fn unregistered<C>(_: &mut C, packet: Packet) -> HandlerResult {
    warn!(
        opcode = packet.opcode,
        "no handler registered for opcode in current state"
    );
    HandlerResult::Disconnect
}
