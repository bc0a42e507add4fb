//! Protocol Engine
//!
//! The six named rounds of the Mystery Protocol. Packages flow strictly
//! forward — `owner_register` and `verifier_commit` are independent and
//! produce the inputs to `verifier_transform`, whose output together with
//! the prize feeds `owner_finalize`, whose output `verifier_verify`
//! consumes. `correct_sequence` is a pure utility used by test harnesses and
//! the session store's dedup hashing, not part of the live round sequence.
//!
//! Cross-context re-encryption (`owner_finalize` steps 4–5) is unavoidable:
//! BFV ciphertexts are context-bound, and the Owner and Verifier hold
//! distinct keys. The decrypt-then-encrypt bridge stays inside this module
//! and never exposes the intermediate plaintext password sequence or prize
//! bytes through any public return value.

use sha2::{Digest, Sha256};

use crate::alphabet::{Alphabet, Mapping};
use crate::he::{Ciphertext, HeError, PrivateContext, PublicContext};
use crate::prize::{self, Prize, PrizeError, ProtectedPrize};
use crate::{BFV_PLAIN_MODULUS, PRIZE_BLOCK_LEN};

/// Errors raised by the protocol engine.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// `verifier_transform` received a registered-character vector whose
    /// length does not match the mapping sequence length.
    #[error("registered vector length {registered} does not match mapping length {mapping}")]
    LengthMismatch { registered: usize, mapping: usize },
    /// `owner_finalize` recomputed the commitment and it did not match the
    /// value published in the earlier commit round.
    #[error("commitment mismatch: the revealed mapping/salt do not hash to the published commitment")]
    CommitmentMismatch,
    /// The homomorphic-encryption backend failed.
    #[error(transparent)]
    He(#[from] HeError),
    /// The prize codec failed (RS-decode unrecoverable).
    #[error(transparent)]
    Prize(#[from] PrizeError),
}

/// Canonicalize `mappings` to bytes with sorted keys, no extraneous
/// whitespace, UTF-8 — the representation the commitment hashes.
/// `serde_json::to_vec` over a `Vec<Mapping>` (itself backed by
/// `BTreeMap<String, u16>`) already satisfies sorted-key, no-whitespace
/// output, so no separate canonicalization pass is needed.
pub(crate) fn canonical_json(mappings: &[Mapping]) -> Vec<u8> {
    serde_json::to_vec(mappings).expect("Mapping serialization is infallible")
}

/// The Owner's commit-round output: the commitment hash plus the material
/// that binds it. In a networked deployment only `commitment` would be sent
/// in the first leg of the round; the rest is revealed in the next message.
/// The HTTP façade (`wire` module) is responsible for that split — this
/// type models the full round output.
#[derive(Debug, Clone)]
pub struct CommitPackage {
    /// `SHA-256(salt ‖ canonical_json(mappings))`.
    pub commitment: [u8; 32],
    /// 32 fresh random bytes bound into the commitment.
    pub salt: [u8; 32],
    /// The mapping sequence being committed to.
    pub mappings: Vec<Mapping>,
    /// 32 fresh random bytes used later to derive the password-dependent
    /// keystream.
    pub pw_salt: [u8; 32],
}

/// `verifier_transform`'s output: one ciphertext per position, each
/// encrypting the mapped segment for the Owner's (still secret) character,
/// plus the commitment material carried forward for `owner_finalize` to
/// re-check.
#[derive(Clone)]
pub struct RevealPackage {
    /// `T_i`, a ciphertext under the Owner's public context encrypting
    /// `M_i[s[i]]`.
    pub transforms: Vec<Ciphertext>,
    /// Carried forward from the commit round.
    pub salt: [u8; 32],
    /// Carried forward from the commit round.
    pub mappings: Vec<Mapping>,
    /// Carried forward from the commit round.
    pub pw_salt: [u8; 32],
}

/// The Owner's finalize-round output: everything the Verifier needs to run
/// `verifier_verify`, all re-encrypted under the Verifier's public context.
#[derive(Clone)]
pub struct FinalPackage {
    /// `F_i`, the password sequence re-encrypted under the Verifier's
    /// public context. Length `L` (not padded to `L'`; see the padding
    /// design note).
    pub sequence_data: Vec<Ciphertext>,
    /// The 48 RS-encoded, XOR-protected prize bytes, one ciphertext per
    /// byte, re-encrypted under the Verifier's public context.
    pub prize_chunks: Vec<Ciphertext>,
    /// Salt used to derive the password-dependent keystream.
    pub password_hash_salt: [u8; 32],
    /// Bits per prize chunk (always 8).
    pub chunk_bits: u8,
    /// Number of prize chunks (always 48).
    pub num_chunks: u16,
    /// Reed-Solomon parity bytes (always 16).
    pub rs_parity_bytes: u8,
}

/// The result of `verifier_verify`.
#[derive(Debug, Clone)]
pub struct VerifyOutcome {
    /// Whether the candidate sequence matched the committed one.
    pub is_match: bool,
    /// The unlocked prize, if `is_match` and the prize was recoverable.
    /// `is_match = true` with `prize = None` means the match was genuine but
    /// the RS decode failed — a packaging bug, not an authentication
    /// failure; callers should log this as [`PrizeError::PrizeUnrecoverable`].
    pub prize: Option<Prize>,
}

/// `owner_register(Opriv, s) → R[]` — one-hot encrypt each character of `s`
/// under the Owner's private context.
pub fn owner_register(opriv: &PrivateContext, s: &str) -> Result<Vec<Ciphertext>, ProtocolError> {
    let alphabet = Alphabet::default();
    let mut out = Vec::with_capacity(s.chars().count());
    for c in s.chars() {
        let mut one_hot = vec![0u64; alphabet.len()];
        if let Some(i) = alphabet.idx(c) {
            one_hot[i] = 1;
        }
        out.push(opriv.encrypt_vec(&one_hot)?);
    }
    Ok(out)
}

/// `verifier_commit(M[]) → (c, salt, M, pw_salt)`.
pub fn verifier_commit(mappings: &[Mapping]) -> CommitPackage {
    let salt = random_32();
    let pw_salt = random_32();
    let commitment = commit_hash(&salt, mappings);
    CommitPackage {
        commitment,
        salt,
        mappings: mappings.to_vec(),
        pw_salt,
    }
}

fn commit_hash(salt: &[u8; 32], mappings: &[Mapping]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(canonical_json(mappings));
    hasher.finalize().into()
}

fn random_32() -> [u8; 32] {
    let mut bytes = [0u8; 32];
    rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut bytes);
    bytes
}

/// `verifier_transform(Opub, R[], commit_pkg) → reveal_pkg`.
pub fn verifier_transform(
    opub: &PublicContext,
    registered: &[Ciphertext],
    commit_pkg: &CommitPackage,
) -> Result<RevealPackage, ProtocolError> {
    if registered.len() != commit_pkg.mappings.len() {
        return Err(ProtocolError::LengthMismatch {
            registered: registered.len(),
            mapping: commit_pkg.mappings.len(),
        });
    }
    let alphabet = Alphabet::default();
    let mut transforms = Vec::with_capacity(registered.len());
    for (r_i, m_i) in registered.iter().zip(commit_pkg.mappings.iter()) {
        let w_i: Vec<u64> = alphabet
            .iter()
            .map(|c| m_i.get(c).expect("mapping is total over the alphabet") as u64)
            .collect();
        transforms.push(opub.dot(r_i, &w_i)?);
    }
    Ok(RevealPackage {
        transforms,
        salt: commit_pkg.salt,
        mappings: commit_pkg.mappings.clone(),
        pw_salt: commit_pkg.pw_salt,
    })
}

/// `owner_finalize(Opriv, Vpub, reveal_pkg, expected_c, prize) → final_pkg`.
pub fn owner_finalize(
    opriv: &PrivateContext,
    vpub: &PublicContext,
    reveal: &RevealPackage,
    expected_commitment: &[u8; 32],
    prize: &Prize,
) -> Result<FinalPackage, ProtocolError> {
    let recomputed = commit_hash(&reveal.salt, &reveal.mappings);
    if &recomputed != expected_commitment {
        return Err(ProtocolError::CommitmentMismatch);
    }

    let mut password_sequence = Vec::with_capacity(reveal.transforms.len());
    for t_i in &reveal.transforms {
        password_sequence.push(opriv.decrypt_scalar(t_i)?);
    }

    let h = prize::keystream(&reveal.pw_salt, &password_sequence);

    let encoded = prize::encode(prize);
    let protected = prize::protect(&encoded, &h);

    let mut prize_chunks = Vec::with_capacity(PRIZE_BLOCK_LEN);
    for &byte in protected.0.iter() {
        prize_chunks.push(vpub.encrypt_scalar(byte as u64)?);
    }

    let mut sequence_data = Vec::with_capacity(password_sequence.len());
    for &m_i in &password_sequence {
        sequence_data.push(vpub.encrypt_scalar(m_i)?);
    }

    Ok(FinalPackage {
        sequence_data,
        prize_chunks,
        password_hash_salt: reveal.pw_salt,
        chunk_bits: 8,
        num_chunks: PRIZE_BLOCK_LEN as u16,
        rs_parity_bytes: 16,
    })
}

/// `verifier_verify(Vpriv, final_pkg, target[]) → (is_match, prize_or_0)`.
///
/// `target` may be shorter or longer than `final_pkg.sequence_data`; missing
/// positions on either side are treated as 0 in the squared-distance sum.
pub fn verifier_verify(
    vpriv: &PrivateContext,
    final_pkg: &FinalPackage,
    target: &[u64],
) -> Result<VerifyOutcome, ProtocolError> {
    let len = final_pkg.sequence_data.len().max(target.len());

    let mut sum: Option<Ciphertext> = None;
    for i in 0..len {
        let diff = match (final_pkg.sequence_data.get(i), target.get(i).copied()) {
            (Some(f_i), t_i) => vpriv.sub_plain(f_i, t_i)?,
            (None, t_i) => vpriv.encrypt_scalar(plain_modulus_complement(t_i))?,
        };
        let squared = vpriv.mul(&diff, &diff)?;
        sum = Some(match sum {
            Some(acc) => vpriv.add(&acc, &squared)?,
            None => squared,
        });
    }
    let sum = sum.expect("sequence_data and target are never both empty in practice");

    let blinder = random_nonzero_blinder();
    let blinded = vpriv.mul_plain(&sum, blinder)?;
    let sigma = vpriv.decrypt_scalar(&blinded)?;

    let is_match = sigma % BFV_PLAIN_MODULUS == 0;
    if !is_match {
        return Ok(VerifyOutcome {
            is_match: false,
            prize: None,
        });
    }

    let h_prime = prize::keystream(&final_pkg.password_hash_salt, target);
    let mut protected_bytes = [0u8; PRIZE_BLOCK_LEN];
    for (i, ct) in final_pkg.prize_chunks.iter().enumerate() {
        protected_bytes[i] = vpriv.decrypt_scalar(ct)? as u8;
    }
    let protected = ProtectedPrize(protected_bytes);
    let rs_encoded = prize::unprotect(&protected, &h_prime);

    match prize::decode(&rs_encoded) {
        Ok(prize) => Ok(VerifyOutcome {
            is_match: true,
            prize: Some(prize),
        }),
        Err(PrizeError::PrizeUnrecoverable) => Ok(VerifyOutcome {
            is_match: true,
            prize: None,
        }),
    }
}

/// A position present in `target` but absent from `sequence_data` (or vice
/// versa) is treated as 0; this encrypts that implicit 0 as a plaintext
/// scalar so the squared-distance term is still `(0 - t_i)^2` under
/// ciphertext arithmetic matching the in-bounds case.
fn plain_modulus_complement(t_i: Option<u64>) -> u64 {
    match t_i {
        Some(t) => (BFV_PLAIN_MODULUS - (t % BFV_PLAIN_MODULUS)) % BFV_PLAIN_MODULUS,
        None => 0,
    }
}

fn random_nonzero_blinder() -> u64 {
    use rand::Rng;
    rand::thread_rng().gen_range(1..BFV_PLAIN_MODULUS)
}

/// `correct_sequence(M[], s) → int[]` — utility used by test harnesses and
/// the session store's dedup hashing.
pub fn correct_sequence(mappings: &[Mapping], s: &str) -> Vec<u16> {
    let chars: Vec<char> = s.chars().collect();
    let n = mappings.len().min(chars.len());
    (0..n)
        .map(|i| mappings[i].get(chars[i]).unwrap_or(0))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alphabet;
    use crate::he::HeContext;

    fn run_round(s: &str, segments: usize) -> (VerifyOutcome, Prize, Vec<u16>) {
        let mappings = alphabet::generate(s.chars().count(), segments).unwrap();
        let (owner_priv, owner_pub) = HeContext::provision().unwrap();
        let (verifier_priv, verifier_pub) = HeContext::provision().unwrap();

        let registered = owner_register(&owner_priv, s).unwrap();
        let commit_pkg = verifier_commit(&mappings);
        let reveal = verifier_transform(&owner_pub, &registered, &commit_pkg).unwrap();

        let prize = Prize::random();
        let final_pkg =
            owner_finalize(&owner_priv, &verifier_pub, &reveal, &commit_pkg.commitment, &prize)
                .unwrap();

        let target: Vec<u64> = correct_sequence(&mappings, s).into_iter().map(|v| v as u64).collect();
        let outcome = verifier_verify(&verifier_priv, &final_pkg, &target).unwrap();
        (outcome, prize, target)
    }

    #[test]
    fn p1_round_trip_correctness() {
        let (outcome, prize, _target) = run_round("Demo123!", 4);
        assert!(outcome.is_match);
        assert_eq!(outcome.prize.unwrap(), prize);
    }

    #[test]
    fn p2_mismatch_rejection() {
        let s = "Demo123!";
        let mappings = alphabet::generate(s.chars().count(), 4).unwrap();
        let (owner_priv, owner_pub) = HeContext::provision().unwrap();
        let (verifier_priv, verifier_pub) = HeContext::provision().unwrap();

        let registered = owner_register(&owner_priv, s).unwrap();
        let commit_pkg = verifier_commit(&mappings);
        let reveal = verifier_transform(&owner_pub, &registered, &commit_pkg).unwrap();
        let prize = Prize::random();
        let final_pkg =
            owner_finalize(&owner_priv, &verifier_pub, &reveal, &commit_pkg.commitment, &prize)
                .unwrap();

        let wrong_target = vec![1u64; s.chars().count()];
        let outcome = verifier_verify(&verifier_priv, &final_pkg, &wrong_target).unwrap();
        assert!(!outcome.is_match);
        assert!(outcome.prize.is_none());
    }

    #[test]
    fn p3_commitment_binding() {
        let s = "hunter2";
        let mappings = alphabet::generate(s.chars().count(), 5).unwrap();
        let (owner_priv, owner_pub) = HeContext::provision().unwrap();
        let (_verifier_priv, verifier_pub) = HeContext::provision().unwrap();

        let registered = owner_register(&owner_priv, s).unwrap();
        let commit_pkg = verifier_commit(&mappings);
        let mut reveal = verifier_transform(&owner_pub, &registered, &commit_pkg).unwrap();
        reveal.salt[0] ^= 0xFF;

        let prize = Prize::random();
        let err = owner_finalize(&owner_priv, &verifier_pub, &reveal, &commit_pkg.commitment, &prize)
            .unwrap_err();
        assert!(matches!(err, ProtocolError::CommitmentMismatch));
    }

    #[test]
    fn length_mismatch_is_rejected() {
        let s = "ab";
        let mappings = alphabet::generate(3, 4).unwrap();
        let (owner_priv, owner_pub) = HeContext::provision().unwrap();
        let registered = owner_register(&owner_priv, s).unwrap();
        let commit_pkg = verifier_commit(&mappings);
        let err = verifier_transform(&owner_pub, &registered, &commit_pkg).unwrap_err();
        assert!(matches!(err, ProtocolError::LengthMismatch { .. }));
    }
}
