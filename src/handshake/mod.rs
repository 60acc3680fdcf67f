//! Handshake Roles
//!
//! Per-connection SRP6 state machines. Each role keeps its state as an enum
//! and mirrors every transition onto the connection's dispatch table, so an
//! opcode the current state does not expect is never dispatched to role
//! code at all.

pub mod initiator;
pub mod responder;

pub use initiator::{HandshakeOutcome, Initiator};
pub use responder::Responder;
