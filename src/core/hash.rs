//! SHA1 Hashing Helpers
//!
//! Every digest in the SRP6 exchange is SHA1 over a concatenation of byte
//! strings and big integers. [`Sha1Hasher`] wraps the `sha1` crate with
//! helpers that feed [`BigInt`] values in their minimal little-endian form,
//! so both handshake roles hash identical byte strings.

use hmac::{Hmac, Mac};
use sha1::{Digest, Sha1};

use super::bigint::BigInt;

/// SHA1 digest length in bytes.
pub const SHA1_DIGEST_LEN: usize = 20;

/// SHA1 digest.
pub type Sha1Digest = [u8; SHA1_DIGEST_LEN];

/// Incremental SHA1 hasher.
///
/// Order of updates is significant.
#[derive(Clone, Default)]
pub struct Sha1Hasher {
    hasher: Sha1,
}

impl Sha1Hasher {
    /// Create an empty hasher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Update with raw bytes.
    #[inline]
    pub fn update_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.hasher.update(bytes);
        self
    }

    /// Update with the UTF-8 bytes of a string.
    #[inline]
    pub fn update_str(&mut self, s: &str) -> &mut Self {
        self.update_bytes(s.as_bytes())
    }

    /// Update with a big integer's minimal little-endian bytes.
    #[inline]
    pub fn update_bigint(&mut self, value: &BigInt) -> &mut Self {
        self.hasher.update(value.to_bytes_le(0));
        self
    }

    /// Finalize and return the digest.
    pub fn finalize(self) -> Sha1Digest {
        self.hasher.finalize().into()
    }
}

/// One-shot SHA1.
pub fn sha1(data: &[u8]) -> Sha1Digest {
    Sha1::digest(data).into()
}

/// HMAC-SHA1 of `data` under `key`.
pub fn hmac_sha1(key: &[u8], data: &[u8]) -> Sha1Digest {
    let mut mac = match <Hmac<Sha1> as Mac>::new_from_slice(key) {
        Ok(mac) => mac,
        Err(_) => unreachable!("HMAC accepts keys of any length"),
    };
    mac.update(data);
    mac.finalize().into_bytes().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha1_known_vector() {
        assert_eq!(
            hex::encode(sha1(b"abc")),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
    }

    #[test]
    fn test_incremental_matches_one_shot() {
        let mut hasher = Sha1Hasher::new();
        hasher.update_str("TESTUSER").update_bytes(b":").update_str("HUNTER2");
        assert_eq!(hasher.finalize(), sha1(b"TESTUSER:HUNTER2"));
    }

    #[test]
    fn test_bigint_feeds_minimal_le_bytes() {
        let mut a = Sha1Hasher::new();
        a.update_bigint(&BigInt::from_u32(0x0102));

        let mut b = Sha1Hasher::new();
        b.update_bytes(&[0x02, 0x01]);

        assert_eq!(a.finalize(), b.finalize());
    }

    #[test]
    fn test_hmac_sha1_rfc2202_case_2() {
        let mac = hmac_sha1(b"Jefe", b"what do ya want for nothing?");
        assert_eq!(hex::encode(mac), "effcdf6ae5eb2fa2d27416d5f184df9c259a7c79");
    }
}
