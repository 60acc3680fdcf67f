//! SRP6 Group Parameters
//!
//! The safe prime `N` and generator `g` are fixed process-wide and shared by
//! every participant in every tier. Changing either invalidates every stored
//! password verifier.

use std::sync::OnceLock;

use crate::core::bigint::BigInt;

/// Big-endian hex of the 256-bit safe prime `N`.
pub const MODULUS_HEX: &str = "894B645E89E1535BBDAD5B8B290650530801B18EBFBF5E8FAB3C82872A3E9BB7";

/// Generator `g`.
pub const GENERATOR: u8 = 7;

/// SRP6 multiplier `k`.
pub const MULTIPLIER: u32 = 3;

/// Wire size of `A`, `B` and `N`.
pub const KEY_LENGTH: usize = 32;

/// Salt length generated at registration.
pub const SALT_LENGTH: usize = 32;

/// Length of `M1` / `M2`.
pub const PROOF_LENGTH: usize = 20;

/// Length of the interleaved session key `K`.
pub const SESSION_KEY_LENGTH: usize = 40;

/// Bytes of entropy in the private ephemerals `a` and `b` (152 bits).
pub const PRIVATE_EPHEMERAL_LENGTH: usize = 19;

/// Longest identity carried in a challenge.
pub const MAX_IDENTITY_LENGTH: usize = 32;

/// Length of the random challenge data in the reconnect exchange.
pub const RECONNECT_CHALLENGE_LENGTH: usize = 16;

/// The shared group parameters.
#[derive(Clone, Debug)]
pub struct SrpConstants {
    /// Safe prime `N`.
    pub modulus: BigInt,
    /// Generator `g`.
    pub generator: BigInt,
    /// Multiplier `k`.
    pub multiplier: BigInt,
    /// `N` as transmitted (32 bytes, little-endian).
    pub modulus_le: [u8; KEY_LENGTH],
}

impl SrpConstants {
    /// The process-wide parameters.
    pub fn get() -> &'static SrpConstants {
        static CONSTANTS: OnceLock<SrpConstants> = OnceLock::new();
        CONSTANTS.get_or_init(SrpConstants::build)
    }

    fn build() -> Self {
        let modulus = match BigInt::from_hex_str(MODULUS_HEX) {
            Ok(n) => n,
            Err(e) => unreachable!("compiled-in modulus is valid hex: {e}"),
        };
        let mut modulus_le = [0u8; KEY_LENGTH];
        modulus_le.copy_from_slice(&modulus.to_bytes_le(KEY_LENGTH));

        Self {
            modulus,
            generator: BigInt::from_u32(GENERATOR as u32),
            multiplier: BigInt::from_u32(MULTIPLIER),
            modulus_le,
        }
    }

    /// `true` if a peer-supplied `g`/`N` pair matches the compiled-in one.
    pub fn matches(&self, generator: u8, modulus_le: &[u8]) -> bool {
        generator == GENERATOR && modulus_le == self.modulus_le
    }
}
