//! HE Context Manager
//!
//! Wraps the BFV homomorphic-encryption scheme (fixed parameters:
//! polynomial modulus degree 8192, plaintext modulus 65537, Galois keys
//! always generated) behind the small operation set the protocol engine
//! needs: provisioning a keypair, (de)serializing contexts, encrypting
//! vectors/scalars, decrypting scalars, the ciphertext-plaintext inner
//! product (`dot`, via Galois-key rotations), and the handful of ciphertext
//! arithmetic operations the six rounds use.
//!
//! Multiplicative depth stays at or below 2 across the whole protocol (one
//! multiplication for the squared-distance term, none for the blinder), so
//! no relinearization/bootstrapping chain deeper than the parameters below
//! support is ever required.

use std::sync::Arc;

use sealy::{
    BFVEncoder, BFVEvaluator, BfvEncryptionParametersBuilder, CoefficientModulusFactory,
    Context as SealContext, Decryptor, Encryptor, GaloisKeys, KeyGenerator, Modulus, Plaintext,
    PublicKey, SecretKey, SecurityLevel,
};

use crate::{BFV_PLAIN_MODULUS, BFV_POLY_MODULUS_DEGREE};

/// Errors raised by the HE context manager.
#[derive(Debug, thiserror::Error)]
pub enum HeError {
    /// The underlying SEAL parameter/key/ciphertext operation failed.
    #[error("homomorphic-encryption backend error: {0}")]
    Backend(String),
    /// A serialized context or ciphertext could not be parsed.
    #[error("malformed homomorphic-encryption payload")]
    MalformedPayload,
    /// Vector length did not match the alphabet/slot-count the context expects.
    #[error("vector length {got} does not match expected length {expected}")]
    LengthMismatch { got: usize, expected: usize },
}

impl From<sealy::Error> for HeError {
    fn from(e: sealy::Error) -> Self {
        HeError::Backend(e.to_string())
    }
}

/// Length-prefix each part so a concatenated blob can be split back apart
/// unambiguously on load (parameters, keys, and ciphertexts otherwise have
/// no self-describing length).
fn write_framed(parts: &[&[u8]]) -> Vec<u8> {
    let mut out = Vec::new();
    for part in parts {
        out.extend_from_slice(&(part.len() as u32).to_be_bytes());
        out.extend_from_slice(part);
    }
    out
}

fn read_framed(bytes: &[u8], count: usize) -> Result<Vec<Vec<u8>>, HeError> {
    let mut out = Vec::with_capacity(count);
    let mut cursor = bytes;
    for _ in 0..count {
        if cursor.len() < 4 {
            return Err(HeError::MalformedPayload);
        }
        let (len_bytes, rest) = cursor.split_at(4);
        let len = u32::from_be_bytes(len_bytes.try_into().unwrap()) as usize;
        if rest.len() < len {
            return Err(HeError::MalformedPayload);
        }
        let (part, rest) = rest.split_at(len);
        out.push(part.to_vec());
        cursor = rest;
    }
    Ok(out)
}

fn bfv_params() -> Result<sealy::BfvEncryptionParameters, HeError> {
    let coeff_modulus =
        CoefficientModulusFactory::build(BFV_POLY_MODULUS_DEGREE as u64, &[60, 40, 40, 60])
            .map_err(|e| HeError::Backend(e.to_string()))?;
    let plain_modulus = Modulus::new(BFV_PLAIN_MODULUS).map_err(|e| HeError::Backend(e.to_string()))?;
    BfvEncryptionParametersBuilder::new()
        .set_poly_modulus_degree(BFV_POLY_MODULUS_DEGREE as u64)
        .set_coefficient_modulus(coeff_modulus)
        .set_plain_modulus(plain_modulus)
        .build()
        .map_err(|e| HeError::Backend(e.to_string()))
}

/// A BFV ciphertext, context-bound: it can only be meaningfully combined with
/// other ciphertexts/plaintexts produced under the same context.
#[derive(Clone)]
pub struct Ciphertext(pub(crate) sealy::Ciphertext);

impl Ciphertext {
    /// Serialize for storage in a challenge package.
    pub fn to_bytes(&self) -> Result<Vec<u8>, HeError> {
        self.0.as_bytes().map_err(|e| HeError::Backend(e.to_string()))
    }

    /// Deserialize a ciphertext bound to `ctx`.
    pub fn from_bytes(ctx: &SealContext, bytes: &[u8]) -> Result<Self, HeError> {
        sealy::Ciphertext::from_bytes(ctx, bytes)
            .map(Ciphertext)
            .map_err(|_| HeError::MalformedPayload)
    }
}

/// Shared machinery every context (public or private) needs: the SEAL
/// context object, the batching encoder, and an evaluator for ciphertext
/// arithmetic.
struct Shared {
    ctx: SealContext,
    encoder: BFVEncoder,
    evaluator: BFVEvaluator,
    galois_keys: GaloisKeys,
}

fn build_shared(ctx: SealContext, galois_keys: GaloisKeys) -> Result<Shared, HeError> {
    let encoder = BFVEncoder::new(&ctx)?;
    let evaluator = BFVEvaluator::new(&ctx)?;
    Ok(Shared {
        ctx,
        encoder,
        evaluator,
        galois_keys,
    })
}

/// The Owner's (or Verifier's) private context: can decrypt, and can do
/// everything a [`PublicContext`] can.
pub struct PrivateContext {
    shared: Arc<Shared>,
    secret_key: SecretKey,
    decryptor: Decryptor,
    public_key: PublicKey,
    encryptor: Encryptor,
}

/// A public-only sibling of a [`PrivateContext`]: can encrypt and evaluate,
/// never decrypt. This is what gets handed to the other party.
pub struct PublicContext {
    shared: Arc<Shared>,
    public_key: PublicKey,
    encryptor: Encryptor,
}

/// A provisioned BFV keypair: a private context and its public sibling.
pub struct HeContext;

impl HeContext {
    /// Generate a fresh keypair and export a public-only sibling context.
    /// Galois keys are generated unconditionally — `dot` requires them.
    pub fn provision() -> Result<(PrivateContext, PublicContext), HeError> {
        let params = bfv_params()?;
        let ctx = SealContext::new(&params, true, SecurityLevel::TC128)?;
        let key_gen = KeyGenerator::new(&ctx)?;
        let secret_key = key_gen.secret_key();
        let public_key = key_gen.create_public_key();
        let galois_keys = key_gen.create_galois_keys()?;

        let shared = Arc::new(build_shared(ctx, galois_keys)?);

        let decryptor = Decryptor::new(&shared.ctx, &secret_key)?;
        let encryptor = Encryptor::with_public_key(&shared.ctx, &public_key)?;
        let pub_encryptor = Encryptor::with_public_key(&shared.ctx, &public_key)?;

        let private_ctx = PrivateContext {
            shared: shared.clone(),
            secret_key,
            decryptor,
            public_key: public_key.clone(),
            encryptor,
        };
        let public_ctx = PublicContext {
            shared,
            public_key,
            encryptor: pub_encryptor,
        };
        Ok((private_ctx, public_ctx))
    }
}

impl PrivateContext {
    /// Serialize this private context (parameters + secret key + public key
    /// + Galois keys) for storage or transport within the Owner's trusted
    /// boundary.
    pub fn serialize(&self) -> Result<Vec<u8>, HeError> {
        Ok(write_framed(&[
            &self.shared.ctx.as_bytes()?,
            &self.secret_key.as_bytes()?,
            &self.public_key.as_bytes()?,
            &self.shared.galois_keys.as_bytes()?,
        ]))
    }

    /// Load a private context from bytes produced by [`Self::serialize`].
    /// Used by the HTTP façade to decode a base64-carried
    /// `verifier_private_key` at the point the protocol's check ordering
    /// calls for it (after the precondition checks, before the protocol
    /// round runs); a malformed blob yields [`HeError::MalformedPayload`].
    pub fn load(bytes: &[u8]) -> Result<Self, HeError> {
        let parts = read_framed(bytes, 4)?;
        let params = sealy::BfvEncryptionParameters::from_bytes(&parts[0])
            .map_err(|_| HeError::MalformedPayload)?;
        let ctx = SealContext::new(&params, true, SecurityLevel::TC128)?;
        let secret_key =
            SecretKey::from_bytes(&ctx, &parts[1]).map_err(|_| HeError::MalformedPayload)?;
        let public_key =
            PublicKey::from_bytes(&ctx, &parts[2]).map_err(|_| HeError::MalformedPayload)?;
        let galois_keys =
            GaloisKeys::from_bytes(&ctx, &parts[3]).map_err(|_| HeError::MalformedPayload)?;

        let shared = Arc::new(build_shared(ctx, galois_keys)?);
        let decryptor = Decryptor::new(&shared.ctx, &secret_key)?;
        let encryptor = Encryptor::with_public_key(&shared.ctx, &public_key)?;

        Ok(Self {
            shared,
            secret_key,
            decryptor,
            public_key,
            encryptor,
        })
    }

    /// Export a public-only sibling context, usable by the other party.
    pub fn to_public(&self) -> Result<PublicContext, HeError> {
        let encryptor = Encryptor::with_public_key(&self.shared.ctx, &self.public_key)?;
        Ok(PublicContext {
            shared: self.shared.clone(),
            public_key: self.public_key.clone(),
            encryptor,
        })
    }

    /// Encrypt an integer vector (e.g. a one-hot character encoding).
    pub fn encrypt_vec(&self, v: &[u64]) -> Result<Ciphertext, HeError> {
        encrypt_vec_with(&self.shared, &self.encryptor, v)
    }

    /// Encrypt a single scalar as a length-1 plaintext vector.
    pub fn encrypt_scalar(&self, x: u64) -> Result<Ciphertext, HeError> {
        encrypt_vec_with(&self.shared, &self.encryptor, &[x])
    }

    /// Decrypt a ciphertext and read back slot 0.
    pub fn decrypt_scalar(&self, ct: &Ciphertext) -> Result<u64, HeError> {
        let mut plain = Plaintext::new()?;
        self.decryptor.decrypt(&ct.0, &mut plain)?;
        let values = self.shared.encoder.decode_unsigned(&plain)?;
        values
            .first()
            .copied()
            .ok_or(HeError::LengthMismatch { got: 0, expected: 1 })
    }

    /// Ciphertext-plaintext inner product, via the shared evaluator.
    pub fn dot(&self, ct: &Ciphertext, plain_w: &[u64]) -> Result<Ciphertext, HeError> {
        dot_with(&self.shared, ct, plain_w)
    }

    /// Ciphertext addition.
    pub fn add(&self, a: &Ciphertext, b: &Ciphertext) -> Result<Ciphertext, HeError> {
        add_with(&self.shared, a, b)
    }

    /// Subtract plaintext scalar `y` from ciphertext `a`.
    pub fn sub_plain(&self, a: &Ciphertext, y: u64) -> Result<Ciphertext, HeError> {
        sub_plain_with(&self.shared, a, y)
    }

    /// Multiply ciphertext `a` by plaintext scalar `y`.
    pub fn mul_plain(&self, a: &Ciphertext, y: u64) -> Result<Ciphertext, HeError> {
        mul_plain_with(&self.shared, a, y)
    }

    /// Multiply two ciphertexts (one multiplicative-depth level).
    pub fn mul(&self, a: &Ciphertext, b: &Ciphertext) -> Result<Ciphertext, HeError> {
        mul_with(&self.shared, a, b)
    }

    /// Ciphertext this context's serialized form deserializes against, for
    /// loading ciphertexts produced by the counterpart's matching public
    /// context.
    pub fn seal_context(&self) -> &SealContext {
        &self.shared.ctx
    }
}

impl PublicContext {
    /// Serialize this public context (parameters + public key + Galois
    /// keys) for transport to the counterpart.
    pub fn serialize(&self) -> Result<Vec<u8>, HeError> {
        Ok(write_framed(&[
            &self.shared.ctx.as_bytes()?,
            &self.public_key.as_bytes()?,
            &self.shared.galois_keys.as_bytes()?,
        ]))
    }

    /// Load a public context from bytes produced by [`Self::serialize`].
    pub fn load(bytes: &[u8]) -> Result<Self, HeError> {
        let parts = read_framed(bytes, 3)?;
        let params = sealy::BfvEncryptionParameters::from_bytes(&parts[0])
            .map_err(|_| HeError::MalformedPayload)?;
        let ctx = SealContext::new(&params, true, SecurityLevel::TC128)?;
        let public_key =
            PublicKey::from_bytes(&ctx, &parts[1]).map_err(|_| HeError::MalformedPayload)?;
        let galois_keys =
            GaloisKeys::from_bytes(&ctx, &parts[2]).map_err(|_| HeError::MalformedPayload)?;

        let shared = Arc::new(build_shared(ctx, galois_keys)?);
        let encryptor = Encryptor::with_public_key(&shared.ctx, &public_key)?;
        Ok(Self {
            shared,
            public_key,
            encryptor,
        })
    }

    /// Encrypt an integer vector under this public context.
    pub fn encrypt_vec(&self, v: &[u64]) -> Result<Ciphertext, HeError> {
        encrypt_vec_with(&self.shared, &self.encryptor, v)
    }

    /// Encrypt a single scalar under this public context.
    pub fn encrypt_scalar(&self, x: u64) -> Result<Ciphertext, HeError> {
        encrypt_vec_with(&self.shared, &self.encryptor, &[x])
    }

    /// Ciphertext-plaintext inner product under this public context.
    pub fn dot(&self, ct: &Ciphertext, plain_w: &[u64]) -> Result<Ciphertext, HeError> {
        dot_with(&self.shared, ct, plain_w)
    }

    /// Ciphertext addition under this public context.
    pub fn add(&self, a: &Ciphertext, b: &Ciphertext) -> Result<Ciphertext, HeError> {
        add_with(&self.shared, a, b)
    }

    /// Subtract plaintext scalar `y` from ciphertext `a`.
    pub fn sub_plain(&self, a: &Ciphertext, y: u64) -> Result<Ciphertext, HeError> {
        sub_plain_with(&self.shared, a, y)
    }

    /// Multiply ciphertext `a` by plaintext scalar `y`.
    pub fn mul_plain(&self, a: &Ciphertext, y: u64) -> Result<Ciphertext, HeError> {
        mul_plain_with(&self.shared, a, y)
    }

    /// Multiply two ciphertexts.
    pub fn mul(&self, a: &Ciphertext, b: &Ciphertext) -> Result<Ciphertext, HeError> {
        mul_with(&self.shared, a, b)
    }

    /// The underlying SEAL context, for deserializing ciphertexts bound to
    /// this context.
    pub fn seal_context(&self) -> &SealContext {
        &self.shared.ctx
    }
}

fn encrypt_vec_with(shared: &Shared, encryptor: &Encryptor, v: &[u64]) -> Result<Ciphertext, HeError> {
    let mut plain = Plaintext::new()?;
    shared.encoder.encode_unsigned(v, &mut plain)?;
    let ct = encryptor.encrypt(&plain)?;
    Ok(Ciphertext(ct))
}

fn dot_with(shared: &Shared, ct: &Ciphertext, plain_w: &[u64]) -> Result<Ciphertext, HeError> {
    let mut plain = Plaintext::new()?;
    shared.encoder.encode_unsigned(plain_w, &mut plain)?;
    let mut prod = shared.evaluator.multiply_plain(&ct.0, &plain)?;

    // Rotate-and-sum within one row so the inner product lands in slot 0.
    // `rotate_rows` wraps cyclically within each row of `row_size = slot_count/2`
    // slots, so the doubling sum only needs shifts up to `row_size/2`.
    let row_size = shared.encoder.slot_count() / 2;
    let mut shift = 1usize;
    while shift < row_size {
        let rotated = shared
            .evaluator
            .rotate_rows(&prod, shift as i32, &shared.galois_keys)?;
        prod = shared.evaluator.add(&prod, &rotated)?;
        shift *= 2;
    }
    Ok(Ciphertext(prod))
}

fn add_with(shared: &Shared, a: &Ciphertext, b: &Ciphertext) -> Result<Ciphertext, HeError> {
    Ok(Ciphertext(shared.evaluator.add(&a.0, &b.0)?))
}

fn sub_plain_with(shared: &Shared, a: &Ciphertext, y: u64) -> Result<Ciphertext, HeError> {
    let mut plain = Plaintext::new()?;
    shared.encoder.encode_unsigned(&[y], &mut plain)?;
    Ok(Ciphertext(shared.evaluator.sub_plain(&a.0, &plain)?))
}

fn mul_plain_with(shared: &Shared, a: &Ciphertext, y: u64) -> Result<Ciphertext, HeError> {
    let mut plain = Plaintext::new()?;
    shared.encoder.encode_unsigned(&[y], &mut plain)?;
    Ok(Ciphertext(shared.evaluator.multiply_plain(&a.0, &plain)?))
}

fn mul_with(shared: &Shared, a: &Ciphertext, b: &Ciphertext) -> Result<Ciphertext, HeError> {
    let product = shared.evaluator.multiply(&a.0, &b.0)?;
    Ok(Ciphertext(shared.evaluator.relinearize(&product)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt_scalar_round_trip() {
        let (priv_ctx, pub_ctx) = HeContext::provision().unwrap();
        let ct = pub_ctx.encrypt_scalar(42).unwrap();
        let x = priv_ctx.decrypt_scalar(&ct).unwrap();
        assert_eq!(x, 42);
    }

    #[test]
    fn dot_product_matches_plaintext_computation() {
        let (priv_ctx, pub_ctx) = HeContext::provision().unwrap();
        let mut one_hot = vec![0u64; 95];
        one_hot[3] = 1;
        let ct = pub_ctx.encrypt_vec(&one_hot).unwrap();

        let mut weights = vec![0u64; 95];
        weights[3] = 7;
        let dotted = pub_ctx.dot(&ct, &weights).unwrap();

        let x = priv_ctx.decrypt_scalar(&dotted).unwrap();
        assert_eq!(x, 7);
    }

    #[test]
    fn serialized_public_context_round_trips_ciphertexts() {
        let (priv_ctx, pub_ctx) = HeContext::provision().unwrap();
        let ct = pub_ctx.encrypt_scalar(9).unwrap();
        let bytes = ct.to_bytes().unwrap();
        let reloaded = Ciphertext::from_bytes(pub_ctx.seal_context(), &bytes).unwrap();
        assert_eq!(priv_ctx.decrypt_scalar(&reloaded).unwrap(), 9);
    }
}
