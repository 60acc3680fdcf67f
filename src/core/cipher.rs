//! Packet Header Cipher
//!
//! Keyed byte-substitution stream cipher applied to the fixed-size packet
//! header once a connection has authenticated. Bodies are never enciphered:
//! this only obfuscates opcodes and lengths against casual tampering and
//! scanning, it is not a payload cipher.
//!
//! Per byte, with rolling index `i` and accumulator `j` kept per direction:
//!
//! ```text
//! encrypt:  x = (data ^ key[i]) + j;   j = x;      data = x
//! decrypt:  x = (data - j) ^ key[i];   j = data;   data = x
//! ```

use super::hash::hmac_sha1;

/// Number of bytes processed per header.
pub const HEADER_CRYPT_LEN: usize = 6;

/// Fixed HMAC key under which the session key is compressed into the
/// cipher key.
const HEADER_KEY_SEED: [u8; 16] = [
    0x38, 0xA7, 0x83, 0x15, 0xF8, 0x92, 0x25, 0x30, 0x71, 0x98, 0x67, 0xB1, 0x8C, 0x04, 0xE2, 0xAA,
];

/// Rolling `(i, j)` accumulator pair for one direction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct Accumulator {
    i: usize,
    j: u8,
}

/// Stateful header cipher with independent send and receive state.
#[derive(Clone)]
pub struct HeaderCipher {
    key: Vec<u8>,
    send: Accumulator,
    recv: Accumulator,
}

impl HeaderCipher {
    /// Cipher keyed with `HMAC-SHA1(seed, session_key)`.
    pub fn from_session_key(session_key: &[u8]) -> Self {
        let mut cipher = Self::with_key(&hmac_sha1(&HEADER_KEY_SEED, session_key));
        cipher.init();
        cipher
    }

    /// Cipher with an explicit key of any non-zero length.
    pub fn with_key(key: &[u8]) -> Self {
        let mut cipher = Self {
            key: Vec::new(),
            send: Accumulator::default(),
            recv: Accumulator::default(),
        };
        cipher.set_key(key);
        cipher
    }

    /// Reset both directions' accumulators.
    pub fn init(&mut self) {
        self.send = Accumulator::default();
        self.recv = Accumulator::default();
    }

    /// Replace the key. Accumulators are left untouched.
    pub fn set_key(&mut self, key: &[u8]) {
        self.key = key.to_vec();
    }

    /// Encrypt an outgoing header in place.
    ///
    /// Processes at most [`HEADER_CRYPT_LEN`] bytes.
    pub fn encrypt_send(&mut self, header: &mut [u8]) {
        if self.key.is_empty() {
            return;
        }
        let len = self.key.len();
        for byte in header.iter_mut().take(HEADER_CRYPT_LEN) {
            let idx = self.send.i % len;
            let x = (*byte ^ self.key[idx]).wrapping_add(self.send.j);
            self.send.i = (idx + 1) % len;
            self.send.j = x;
            *byte = x;
        }
    }

    /// Decrypt an incoming header in place.
    ///
    /// Processes at most [`HEADER_CRYPT_LEN`] bytes.
    pub fn decrypt_recv(&mut self, header: &mut [u8]) {
        if self.key.is_empty() {
            return;
        }
        let len = self.key.len();
        for byte in header.iter_mut().take(HEADER_CRYPT_LEN) {
            let idx = self.recv.i % len;
            let x = byte.wrapping_sub(self.recv.j) ^ self.key[idx];
            self.recv.i = (idx + 1) % len;
            self.recv.j = *byte;
            *byte = x;
        }
    }
}

impl std::fmt::Debug for HeaderCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material stays out of logs.
        f.debug_struct("HeaderCipher")
            .field("key_len", &self.key.len())
            .finish()
    }
}
