//! Prize Codec
//!
//! Reed-Solomon encodes a 256-bit prize into 48 bytes (`RS(48,32)`, 16 parity
//! bytes, symbol size 8 bits) and protects it with a password-derived XOR
//! keystream so that the bytes carried on the wire reveal nothing about the
//! prize to a party that has not derived the correct password sequence.
//!
//! Rationale for 8-bit chunks: the homomorphic plaintext modulus is 65537, so
//! each re-encrypted chunk must fit in 16 bits; 8-bit chunks leave margin
//! after the keystream XOR.

use reed_solomon::{Decoder, Encoder};
use sha2::{Digest, Sha256};

use crate::{PRIZE_BLOCK_LEN, PRIZE_DATA_LEN, RS_PARITY_BYTES};

/// Errors raised by the prize codec.
#[derive(Debug, thiserror::Error)]
pub enum PrizeError {
    /// RS decoding could not correct the observed byte errors (more than 8
    /// corrupted bytes in the 48-byte block).
    #[error("prize block unrecoverable: too many byte errors to correct")]
    PrizeUnrecoverable,
}

/// A uniformly random 256-bit prize, carried as big-endian bytes.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Prize(pub [u8; PRIZE_DATA_LEN]);

impl std::fmt::Debug for Prize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Prize").field(&hex::encode(self.0)).finish()
    }
}

impl Prize {
    /// Draw a fresh uniformly random prize from the platform CSPRNG.
    pub fn random() -> Self {
        let mut bytes = [0u8; PRIZE_DATA_LEN];
        rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut bytes);
        Self(bytes)
    }

    /// Render the prize as a base-10 string, for `prize_value` in the
    /// external wire response. Implemented directly over the big-endian byte
    /// representation (base-256 → base-10 long division) rather than pulling
    /// in a bignum crate for a single call site.
    pub fn to_decimal_string(&self) -> String {
        let mut digits = self.0.to_vec();
        let mut out = Vec::new();
        loop {
            let mut remainder: u32 = 0;
            let mut any_nonzero = false;
            for byte in digits.iter_mut() {
                let acc = remainder * 256 + *byte as u32;
                *byte = (acc / 10) as u8;
                remainder = acc % 10;
                if *byte != 0 {
                    any_nonzero = true;
                }
            }
            out.push(b'0' + remainder as u8);
            if !any_nonzero {
                break;
            }
        }
        out.reverse();
        String::from_utf8(out).expect("ASCII digits are valid UTF-8")
    }
}

/// A 48-byte RS(48,32)-encoded, XOR-protected prize block, as it sits between
/// `owner_finalize`'s plaintext staging and per-byte re-encryption, and again
/// between `verifier_verify`'s decryption and RS decode.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ProtectedPrize(pub [u8; PRIZE_BLOCK_LEN]);

impl std::fmt::Debug for ProtectedPrize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ProtectedPrize")
            .field(&hex::encode(self.0))
            .finish()
    }
}

/// RS(48,32)-encode the prize: big-endian 32-byte message, 16 parity bytes.
pub fn encode(prize: &Prize) -> [u8; PRIZE_BLOCK_LEN] {
    let encoder = Encoder::new(RS_PARITY_BYTES);
    let encoded = encoder.encode(&prize.0);
    let mut out = [0u8; PRIZE_BLOCK_LEN];
    out.copy_from_slice(&encoded[..PRIZE_BLOCK_LEN]);
    out
}

/// RS-decode a 48-byte block, tolerating up to 8 byte errors.
pub fn decode(block: &[u8; PRIZE_BLOCK_LEN]) -> Result<Prize, PrizeError> {
    let decoder = Decoder::new(RS_PARITY_BYTES);
    let corrected = decoder
        .correct(block, None)
        .map_err(|_| PrizeError::PrizeUnrecoverable)?;
    let data = corrected.data();
    let mut out = [0u8; PRIZE_DATA_LEN];
    out.copy_from_slice(&data[..PRIZE_DATA_LEN]);
    Ok(Prize(out))
}

/// Derive the password-dependent keystream `H = SHA-256(salt ‖ joined
/// sequence)`, used both to protect the prize in `owner_finalize` and to
/// unprotect it in `verifier_verify`.
pub fn keystream(password_hash_salt: &[u8], sequence: &[u64]) -> [u8; 32] {
    let joined = sequence
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(",");
    let mut hasher = Sha256::new();
    hasher.update(password_hash_salt);
    hasher.update(joined.as_bytes());
    hasher.finalize().into()
}

/// XOR `block` byte `i` with `h[i mod 32]`. Self-inverse: the same call
/// protects and unprotects.
pub fn protect(block: &[u8; PRIZE_BLOCK_LEN], h: &[u8; 32]) -> ProtectedPrize {
    let mut out = [0u8; PRIZE_BLOCK_LEN];
    for i in 0..PRIZE_BLOCK_LEN {
        out[i] = block[i] ^ h[i % 32];
    }
    ProtectedPrize(out)
}

/// Identical to [`protect`]; named separately at call sites for readability.
pub fn unprotect(block: &ProtectedPrize, h: &[u8; 32]) -> [u8; PRIZE_BLOCK_LEN] {
    let mut out = [0u8; PRIZE_BLOCK_LEN];
    for i in 0..PRIZE_BLOCK_LEN {
        out[i] = block.0[i] ^ h[i % 32];
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trip() {
        let prize = Prize::random();
        let encoded = encode(&prize);
        let decoded = decode(&encoded).unwrap();
        assert_eq!(prize, decoded);
    }

    #[test]
    fn decode_tolerates_up_to_eight_byte_errors() {
        let prize = Prize::random();
        let mut encoded = encode(&prize);
        for i in 0..8 {
            encoded[i] ^= 0xFF;
        }
        let decoded = decode(&encoded).unwrap();
        assert_eq!(prize, decoded);
    }

    #[test]
    fn protect_is_self_inverse() {
        let prize = Prize::random();
        let encoded = encode(&prize);
        let h = keystream(b"some-salt", &[1, 2, 3, 4]);
        let protected = protect(&encoded, &h);
        let recovered = unprotect(&protected, &h);
        assert_eq!(encoded, recovered);
    }

    #[test]
    fn decimal_string_matches_known_value() {
        let mut bytes = [0u8; 32];
        bytes[31] = 255;
        let prize = Prize(bytes);
        assert_eq!(prize.to_decimal_string(), "255");
    }
}
