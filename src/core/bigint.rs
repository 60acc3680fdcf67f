//! Arbitrary-Precision Unsigned Integers
//!
//! Thin value type over `num_bigint::BigUint` exposing exactly the operations
//! the SRP6 handshake needs, with the byte-order conventions of the wire
//! format (little-endian, zero-padded to a minimum length).
//!
//! ## Timing
//!
//! `mod_exp` is **not** constant-time. Secret exponents (`a`, `b`, `x`) leak
//! through timing to a sufficiently close observer. This is an inherited
//! property of the handshake, not something this type attempts to hide.

use std::fmt;
use std::ops::{Add, Div, Mul, Rem, Sub};

use num_bigint::BigUint;
use num_traits::{One, Zero};
use rand::RngCore;
use thiserror::Error;

/// Errors produced when constructing or exporting a [`BigInt`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BigIntError {
    /// The string is not a valid number in the requested radix.
    #[error("invalid {radix}-radix digits in {input:?}")]
    Parse {
        /// Radix that was requested.
        radix: u32,
        /// Offending input.
        input: String,
    },
    /// The value needs more bytes than the fixed-width export allows.
    #[error("value needs {needed} bytes, only {max} available")]
    TooLarge {
        /// Bytes the value occupies.
        needed: usize,
        /// Bytes the caller asked for.
        max: usize,
    },
}

/// Non-negative arbitrary-precision integer.
///
/// Every operator returns a new normalized value. Subtraction that would go
/// below zero is a caller error and panics, like `BigUint`; use
/// [`BigInt::checked_sub`] where the ordering is not already known.
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BigInt(BigUint);

impl BigInt {
    /// The value zero.
    pub fn zero() -> Self {
        Self(BigUint::zero())
    }

    /// The value one.
    pub fn one() -> Self {
        Self(BigUint::one())
    }

    /// From an unsigned 32-bit value.
    pub fn from_u32(value: u32) -> Self {
        Self(BigUint::from(value))
    }

    /// From an unsigned 64-bit value.
    pub fn from_u64(value: u64) -> Self {
        Self(BigUint::from(value))
    }

    /// Parse a big-endian hexadecimal string (case-insensitive, no prefix).
    pub fn from_hex_str(hex: &str) -> Result<Self, BigIntError> {
        Self::parse_radix(hex, 16)
    }

    /// Parse a decimal string.
    pub fn from_dec_str(dec: &str) -> Result<Self, BigIntError> {
        Self::parse_radix(dec, 10)
    }

    fn parse_radix(input: &str, radix: u32) -> Result<Self, BigIntError> {
        BigUint::parse_bytes(input.trim().as_bytes(), radix)
            .map(Self)
            .ok_or_else(|| BigIntError::Parse {
                radix,
                input: input.to_string(),
            })
    }

    /// From little-endian bytes. An empty slice is zero.
    pub fn from_bytes_le(bytes: &[u8]) -> Self {
        Self(BigUint::from_bytes_le(bytes))
    }

    /// From big-endian bytes. An empty slice is zero.
    pub fn from_bytes_be(bytes: &[u8]) -> Self {
        Self(BigUint::from_bytes_be(bytes))
    }

    /// Uniformly random value of `num_bytes` bytes drawn from `rng`.
    pub fn random<R: RngCore + ?Sized>(num_bytes: usize, rng: &mut R) -> Self {
        let mut bytes = vec![0u8; num_bytes];
        rng.fill_bytes(&mut bytes);
        Self::from_bytes_le(&bytes)
    }

    /// `true` if the value is zero.
    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    /// Subtraction that returns `None` instead of going negative.
    pub fn checked_sub(&self, rhs: &BigInt) -> Option<BigInt> {
        if self.0 < rhs.0 {
            None
        } else {
            Some(Self(&self.0 - &rhs.0))
        }
    }

    /// Division that returns `None` on a zero divisor.
    pub fn checked_div(&self, rhs: &BigInt) -> Option<BigInt> {
        if rhs.is_zero() {
            None
        } else {
            Some(Self(&self.0 / &rhs.0))
        }
    }

    /// `self^exp mod modulus`.
    ///
    /// # Panics
    ///
    /// Panics if `modulus` is zero.
    pub fn mod_exp(&self, exp: &BigInt, modulus: &BigInt) -> BigInt {
        Self(self.0.modpow(&exp.0, &modulus.0))
    }

    /// `self^exp` without reduction.
    pub fn exp(&self, exp: u32) -> BigInt {
        Self(self.0.pow(exp))
    }

    /// Number of bytes in the minimal little-endian representation.
    pub fn num_bytes(&self) -> usize {
        ((self.0.bits() + 7) / 8) as usize
    }

    /// Low 32 bits, truncating.
    pub fn as_u32(&self) -> u32 {
        self.0.iter_u32_digits().next().unwrap_or(0)
    }

    /// Little-endian bytes, zero-padded at the high end to at least `min_len`.
    ///
    /// Zero exports as `min_len` zero bytes (an empty vector for `min_len == 0`).
    /// A value longer than `min_len` is never truncated.
    pub fn to_bytes_le(&self, min_len: usize) -> Vec<u8> {
        let mut bytes = if self.is_zero() {
            Vec::new()
        } else {
            self.0.to_bytes_le()
        };
        if bytes.len() < min_len {
            bytes.resize(min_len, 0);
        }
        bytes
    }

    /// Fixed-width little-endian export.
    pub fn to_array_le<const N: usize>(&self) -> Result<[u8; N], BigIntError> {
        let needed = self.num_bytes();
        if needed > N {
            return Err(BigIntError::TooLarge { needed, max: N });
        }
        let mut out = [0u8; N];
        out[..needed].copy_from_slice(&self.to_bytes_le(0));
        Ok(out)
    }

    /// Upper-case big-endian hexadecimal. Zero renders as `"0"`.
    pub fn to_hex_str(&self) -> String {
        self.0.to_str_radix(16).to_uppercase()
    }

    /// Decimal rendering.
    pub fn to_dec_str(&self) -> String {
        self.0.to_str_radix(10)
    }
}

impl fmt::Debug for BigInt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BigInt(0x{})", self.to_hex_str())
    }
}

impl fmt::Display for BigInt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_dec_str())
    }
}

impl From<u32> for BigInt {
    fn from(value: u32) -> Self {
        Self::from_u32(value)
    }
}

impl From<u64> for BigInt {
    fn from(value: u64) -> Self {
        Self::from_u64(value)
    }
}

macro_rules! forward_binop {
    ($trait:ident, $method:ident) => {
        impl<'a> $trait<&'a BigInt> for &'a BigInt {
            type Output = BigInt;

            fn $method(self, rhs: &'a BigInt) -> BigInt {
                BigInt((&self.0).$method(&rhs.0))
            }
        }

        impl $trait<BigInt> for BigInt {
            type Output = BigInt;

            fn $method(self, rhs: BigInt) -> BigInt {
                BigInt(self.0.$method(rhs.0))
            }
        }

        impl $trait<u32> for &BigInt {
            type Output = BigInt;

            fn $method(self, rhs: u32) -> BigInt {
                BigInt((&self.0).$method(rhs))
            }
        }
    };
}

forward_binop!(Add, add);
forward_binop!(Sub, sub);
forward_binop!(Mul, mul);
forward_binop!(Div, div);
forward_binop!(Rem, rem);
