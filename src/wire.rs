//! Wire Format & HTTP Façade support (C6)
//!
//! Owns the boundary between the in-memory protocol types and the two
//! serialized forms the rest of the world sees: the canonical-JSON +
//! bz2-compressed challenge blob, and (via `src/bin/mystery_api.rs`) the
//! JSON request/response bodies of the HTTP surface.
//!
//! Parsing is deliberately two-tier. [`decompress_and_parse`] only
//! decompresses, parses JSON, and checks the fixed-field shape — it needs no
//! homomorphic-encryption context, so `store::submit` can call it to
//! "confirm well-formedness" without ever touching a key. [`to_final_package`]
//! does the expensive part — binding every ciphertext to a `SealContext` —
//! and is only called once the Verifier's context is actually in hand.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::he::{Ciphertext, HeError};
use crate::protocol::FinalPackage;

/// Errors raised while (de)serializing a challenge package.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// bz2 (de)compression failed.
    #[error("failed to compress/decompress challenge package: {0}")]
    Compression(#[from] std::io::Error),
    /// The decompressed bytes are not valid JSON.
    #[error("challenge package is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    /// The JSON parsed but violated the fixed-field shape (§6): wrong
    /// `chunk_bits`/`num_chunks`/`rs_parity_bytes`, a malformed base64
    /// field, or a length mismatch between `prize_chunks` and `num_chunks`.
    #[error("challenge package has the wrong shape: {0}")]
    InvalidShape(String),
    /// A ciphertext failed to deserialize against the supplied context.
    #[error(transparent)]
    He(#[from] HeError),
}

#[derive(Debug, Serialize, Deserialize)]
struct WirePrizeData {
    prize_chunks: Vec<String>,
    password_hash_salt: String,
    chunk_bits: u8,
    num_chunks: u16,
    rs_parity_bytes: u8,
}

#[derive(Debug, Serialize, Deserialize)]
struct WirePackage {
    sequence_data: Vec<String>,
    prize_data: WirePrizeData,
}

/// A shape-validated but not-yet-context-bound challenge package: every
/// ciphertext field is still raw bytes. Produced by
/// [`decompress_and_parse`]; consumed by [`to_final_package`].
#[derive(Debug, Clone)]
pub struct ParsedPackage {
    pub sequence_data: Vec<Vec<u8>>,
    pub prize_chunks: Vec<Vec<u8>>,
    pub password_hash_salt: [u8; 32],
    pub chunk_bits: u8,
    pub num_chunks: u16,
    pub rs_parity_bytes: u8,
}

/// Serialize a finalized challenge package to the wire format: canonical
/// JSON per §6's field layout, then bz2-compressed.
pub fn package_to_wire(package: &FinalPackage) -> Result<Vec<u8>, WireError> {
    let sequence_data = package
        .sequence_data
        .iter()
        .map(|ct| ct.to_bytes().map(|b| BASE64.encode(b)))
        .collect::<Result<Vec<_>, HeError>>()?;
    let prize_chunks = package
        .prize_chunks
        .iter()
        .map(|ct| ct.to_bytes().map(|b| BASE64.encode(b)))
        .collect::<Result<Vec<_>, HeError>>()?;

    let wire = WirePackage {
        sequence_data,
        prize_data: WirePrizeData {
            prize_chunks,
            password_hash_salt: BASE64.encode(package.password_hash_salt),
            chunk_bits: package.chunk_bits,
            num_chunks: package.num_chunks,
            rs_parity_bytes: package.rs_parity_bytes,
        },
    };
    let json = serde_json::to_vec(&wire)?;

    use bzip2::write::BzEncoder;
    use bzip2::Compression;
    use std::io::Write;
    let mut encoder = BzEncoder::new(Vec::new(), Compression::best());
    encoder.write_all(&json)?;
    Ok(encoder.finish()?)
}

/// Decompress and shape-validate a challenge blob, without binding any
/// ciphertext to a context. This is all `store::submit` needs to "confirm
/// well-formedness" (§4.5 step 1).
pub fn decompress_and_parse(bytes: &[u8]) -> Result<ParsedPackage, WireError> {
    use bzip2::read::BzDecoder;
    use std::io::Read;
    let mut decoder = BzDecoder::new(bytes);
    let mut json = Vec::new();
    decoder.read_to_end(&mut json)?;

    let wire: WirePackage = serde_json::from_slice(&json)?;

    if wire.prize_data.chunk_bits != 8 {
        return Err(WireError::InvalidShape(format!(
            "chunk_bits must be 8, got {}",
            wire.prize_data.chunk_bits
        )));
    }
    if wire.prize_data.num_chunks != 48 {
        return Err(WireError::InvalidShape(format!(
            "num_chunks must be 48, got {}",
            wire.prize_data.num_chunks
        )));
    }
    if wire.prize_data.rs_parity_bytes != 16 {
        return Err(WireError::InvalidShape(format!(
            "rs_parity_bytes must be 16, got {}",
            wire.prize_data.rs_parity_bytes
        )));
    }
    if wire.prize_data.prize_chunks.len() != wire.prize_data.num_chunks as usize {
        return Err(WireError::InvalidShape(format!(
            "prize_chunks has {} entries, expected {}",
            wire.prize_data.prize_chunks.len(),
            wire.prize_data.num_chunks
        )));
    }

    let sequence_data = wire
        .sequence_data
        .iter()
        .map(|s| {
            BASE64
                .decode(s)
                .map_err(|e| WireError::InvalidShape(format!("sequence_data: {e}")))
        })
        .collect::<Result<Vec<_>, WireError>>()?;
    let prize_chunks = wire
        .prize_data
        .prize_chunks
        .iter()
        .map(|s| {
            BASE64
                .decode(s)
                .map_err(|e| WireError::InvalidShape(format!("prize_chunks: {e}")))
        })
        .collect::<Result<Vec<_>, WireError>>()?;
    let salt_bytes = BASE64
        .decode(&wire.prize_data.password_hash_salt)
        .map_err(|e| WireError::InvalidShape(format!("password_hash_salt: {e}")))?;
    let password_hash_salt: [u8; 32] = salt_bytes
        .try_into()
        .map_err(|_| WireError::InvalidShape("password_hash_salt must be 32 bytes".into()))?;

    Ok(ParsedPackage {
        sequence_data,
        prize_chunks,
        password_hash_salt,
        chunk_bits: wire.prize_data.chunk_bits,
        num_chunks: wire.prize_data.num_chunks,
        rs_parity_bytes: wire.prize_data.rs_parity_bytes,
    })
}

/// Bind every ciphertext in a [`ParsedPackage`] to `ctx`, producing a
/// [`FinalPackage`] ready for `protocol::verifier_verify`. This is the
/// expensive half of parsing; callers should only reach it once the
/// Verifier's context has been loaded.
pub fn to_final_package(
    parsed: &ParsedPackage,
    ctx: &sealy::Context,
) -> Result<FinalPackage, WireError> {
    let sequence_data = parsed
        .sequence_data
        .iter()
        .map(|b| Ciphertext::from_bytes(ctx, b))
        .collect::<Result<Vec<_>, HeError>>()?;
    let prize_chunks = parsed
        .prize_chunks
        .iter()
        .map(|b| Ciphertext::from_bytes(ctx, b))
        .collect::<Result<Vec<_>, HeError>>()?;

    Ok(FinalPackage {
        sequence_data,
        prize_chunks,
        password_hash_salt: parsed.password_hash_salt,
        chunk_bits: parsed.chunk_bits,
        num_chunks: parsed.num_chunks,
        rs_parity_bytes: parsed.rs_parity_bytes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alphabet;
    use crate::he::HeContext;
    use crate::prize::Prize;
    use crate::protocol::{owner_finalize, owner_register, verifier_commit, verifier_transform};

    #[test]
    fn round_trips_through_compression_and_parsing() {
        let s = "hi!";
        let mappings = alphabet::generate(s.chars().count(), 4).unwrap();
        let (owner_priv, owner_pub) = HeContext::provision().unwrap();
        let (_verifier_priv, verifier_pub) = HeContext::provision().unwrap();

        let registered = owner_register(&owner_priv, s).unwrap();
        let commit_pkg = verifier_commit(&mappings);
        let reveal = verifier_transform(&owner_pub, &registered, &commit_pkg).unwrap();
        let prize = Prize::random();
        let final_pkg = owner_finalize(
            &owner_priv,
            &verifier_pub,
            &reveal,
            &commit_pkg.commitment,
            &prize,
        )
        .unwrap();

        let wire_bytes = package_to_wire(&final_pkg).unwrap();
        let parsed = decompress_and_parse(&wire_bytes).unwrap();
        assert_eq!(parsed.num_chunks, 48);
        assert_eq!(parsed.prize_chunks.len(), 48);

        let rebuilt = to_final_package(&parsed, verifier_pub.seal_context()).unwrap();
        assert_eq!(rebuilt.sequence_data.len(), final_pkg.sequence_data.len());
    }

    #[test]
    fn rejects_bad_shape() {
        let bad_json = br#"{"sequence_data":[],"prize_data":{"prize_chunks":[],"password_hash_salt":"AAAA","chunk_bits":7,"num_chunks":48,"rs_parity_bytes":16}}"#;
        use bzip2::write::BzEncoder;
        use bzip2::Compression;
        use std::io::Write;
        let mut encoder = BzEncoder::new(Vec::new(), Compression::best());
        encoder.write_all(bad_json).unwrap();
        let compressed = encoder.finish().unwrap();
        let err = decompress_and_parse(&compressed).unwrap_err();
        assert!(matches!(err, WireError::InvalidShape(_)));
    }
}
