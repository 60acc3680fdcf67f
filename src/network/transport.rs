//! Framed Transport
//!
//! Turns a byte stream into packets and back. Knows nothing about sockets:
//! the connection feeds it whatever each read returned and drains its send
//! buffer when the socket is free.
//!
//! ```text
//! +--------+------+-----------+-----------+----------------+
//! | 0xA7   | tier | opcode LE | size LE   | body (size)    |
//! | 1 byte | 1    | 2         | 2         | 0..=MAX_BODY   |
//! +--------+------+-----------+-----------+----------------+
//!  \_______ header, ciphered once authenticated _______/
//! ```

use std::marker::PhantomData;

use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

use super::protocol::{Packet, Protocol};
use crate::auth::SessionKey;
use crate::core::cipher::HeaderCipher;

/// Header length in bytes.
pub const HEADER_SIZE: usize = 6;

/// First byte of every header.
pub const PACKET_MARKER: u8 = 0xA7;

/// Consumed prefix length above which the inbound buffer is compacted.
const COMPACT_THRESHOLD: usize = 8192;

/// Framing violations. All of them are fatal to the connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Header does not start with the packet marker.
    #[error("bad packet marker {0:#04x}")]
    BadMarker(u8),

    /// Header names a different trust tier.
    #[error("packet for tier {got}, expected {expected}")]
    WrongTier {
        /// Tier this transport speaks.
        expected: u8,
        /// Tier byte found.
        got: u8,
    },

    /// Declared body exceeds the protocol maximum.
    #[error("body of {size} bytes exceeds limit of {max}")]
    Oversized {
        /// Declared size.
        size: usize,
        /// Protocol maximum.
        max: usize,
    },
}

/// Header fields after decryption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Header {
    opcode: u16,
    size: usize,
}

/// Packet framing over a byte stream for protocol `P`.
pub struct FramedTransport<P: Protocol> {
    inbound: Vec<u8>,
    /// Bytes of `inbound` already handed out as packets.
    consumed: usize,
    /// Bytes of `inbound` whose header has been decrypted.
    decrypted_until: usize,
    outbound: Vec<u8>,
    cipher: Option<HeaderCipher>,
    _protocol: PhantomData<P>,
}

impl<P: Protocol> Default for FramedTransport<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Protocol> FramedTransport<P> {
    /// Empty transport with no cipher.
    pub fn new() -> Self {
        Self {
            inbound: Vec::new(),
            consumed: 0,
            decrypted_until: 0,
            outbound: Vec::new(),
            cipher: None,
            _protocol: PhantomData,
        }
    }

    /// Append bytes from a read.
    pub fn receive(&mut self, bytes: &[u8]) {
        self.inbound.extend_from_slice(bytes);
    }

    /// Bytes received but not yet consumed.
    pub fn buffered(&self) -> usize {
        self.inbound.len() - self.consumed
    }

    /// Extract the next complete packet.
    ///
    /// `Ok(None)` means more bytes are needed. An error leaves the transport
    /// unusable; the caller must drop the connection.
    pub fn next_packet(&mut self) -> Result<Option<Packet>, FrameError> {
        let start = self.consumed;
        if self.buffered() < HEADER_SIZE {
            return Ok(None);
        }

        let header_end = start + HEADER_SIZE;
        if self.decrypted_until < header_end {
            if let Some(cipher) = self.cipher.as_mut() {
                cipher.decrypt_recv(&mut self.inbound[start..header_end]);
            }
            self.decrypted_until = header_end;
        }

        let header = Self::parse_header(&self.inbound[start..header_end])?;
        let packet_end = header_end + header.size;
        if self.inbound.len() < packet_end {
            return Ok(None);
        }

        let packet = Packet::new(header.opcode, self.inbound[header_end..packet_end].to_vec());
        self.consumed = packet_end;
        self.reclaim();
        Ok(Some(packet))
    }

    fn parse_header(bytes: &[u8]) -> Result<Header, FrameError> {
        if bytes[0] != PACKET_MARKER {
            return Err(FrameError::BadMarker(bytes[0]));
        }
        if bytes[1] != P::TIER as u8 {
            return Err(FrameError::WrongTier {
                expected: P::TIER as u8,
                got: bytes[1],
            });
        }
        let opcode = LittleEndian::read_u16(&bytes[2..4]);
        let size = LittleEndian::read_u16(&bytes[4..6]) as usize;
        if size > P::MAX_BODY_SIZE {
            return Err(FrameError::Oversized {
                size,
                max: P::MAX_BODY_SIZE,
            });
        }
        Ok(Header { opcode, size })
    }

    fn reclaim(&mut self) {
        if self.consumed == self.inbound.len() {
            self.inbound.clear();
            self.consumed = 0;
            self.decrypted_until = 0;
        } else if self.consumed > COMPACT_THRESHOLD {
            self.inbound.drain(..self.consumed);
            self.decrypted_until = self.decrypted_until.saturating_sub(self.consumed);
            self.consumed = 0;
        }
    }

    /// Serialize a packet onto the send buffer.
    ///
    /// The header is enciphered now, so packets queued before
    /// [`enable_cipher`](Self::enable_cipher) go out in the clear.
    pub fn queue(&mut self, opcode: u16, body: &[u8]) -> Result<(), FrameError> {
        if body.len() > P::MAX_BODY_SIZE {
            return Err(FrameError::Oversized {
                size: body.len(),
                max: P::MAX_BODY_SIZE,
            });
        }

        let mut header = [0u8; HEADER_SIZE];
        header[0] = PACKET_MARKER;
        header[1] = P::TIER as u8;
        LittleEndian::write_u16(&mut header[2..4], opcode);
        LittleEndian::write_u16(&mut header[4..6], body.len() as u16);
        if let Some(cipher) = self.cipher.as_mut() {
            cipher.encrypt_send(&mut header);
        }

        self.outbound.extend_from_slice(&header);
        self.outbound.extend_from_slice(body);
        Ok(())
    }

    /// `true` if queued bytes are waiting to be written.
    pub fn has_outbound(&self) -> bool {
        !self.outbound.is_empty()
    }

    /// Take everything queued since the last call.
    pub fn take_outbound(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.outbound)
    }

    /// Start ciphering headers in both directions.
    ///
    /// Called once per connection; a second call is ignored so the rolling
    /// state is never reset mid-stream.
    pub fn enable_cipher(&mut self, session_key: &SessionKey) {
        if self.cipher.is_none() {
            self.cipher = Some(HeaderCipher::from_session_key(session_key.as_bytes()));
        }
    }

    /// `true` once [`enable_cipher`](Self::enable_cipher) has run.
    pub fn is_encrypted(&self) -> bool {
        self.cipher.is_some()
    }
}

impl<P: Protocol> std::fmt::Debug for FramedTransport<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramedTransport")
            .field("tier", &P::TIER)
            .field("buffered", &self.buffered())
            .field("outbound", &self.outbound.len())
            .field("encrypted", &self.is_encrypted())
            .finish()
    }
}
