//! Crate root: public surface, shared aliases, and protocol-wide invariants
//!
//! This module is the **single canonical entry-point** for downstream users of
//! the library. It centralizes the alphabet/ciphertext aliases, re-exports the
//! per-round package types, and wires together the five core components plus
//! the session store.
//!
//! ## Invariants
//!
//! - **Scheme & parameters.** Unless explicitly reconfigured, the homomorphic
//!   scheme is BFV with polynomial modulus degree 8192 and plaintext modulus
//!   65537 (`bfv_plain_modulus` in [`config::Config`]). We **forbid unsafe**
//!   throughout the crate.
//!
//! - **Context boundaries.** Private key material never crosses a component
//!   boundary except into the specific round that needs it: `commit`,
//!   `register`, and `finalize` hold the Owner's key; `transform` is
//!   pure-public; `verify` holds the Verifier's key. See [`protocol`].
//!
//! - **Session store.** The only shared mutable state in the crate is the
//!   [`store::Store`] handle. It is constructed explicitly by the caller and
//!   passed around — there is no process-wide singleton.
//!
//! These invariants are enforced by design across the submodules. If any
//! invariant is violated at runtime, the failure mode is a **precise,
//! typed error** (never a panic or UB).

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

/// 95-character alphabet and per-position segment mappings (C1).
pub mod alphabet;
/// BFV homomorphic-encryption context management (C2).
pub mod he;
/// Reed-Solomon prize encoding and password-derived XOR protection (C3).
pub mod prize;
/// The six named protocol rounds (C4).
pub mod protocol;
/// In-process session store and rate limiter (C5).
pub mod store;
/// Canonical-JSON + bz2 challenge-blob wire format (C6).
pub mod wire;
/// Typed runtime configuration for the tunable parameters table (C7).
pub mod config;

// ============================================================================
// Canonical aliases and root-level re-exports
// ============================================================================

/// Security parameter: plaintext modulus for the BFV scheme (`p = 65537`).
///
/// Prime, so the blinded equality check in [`protocol::verifier_verify`] has no
/// non-trivial zero divisors: a non-zero blinder can never turn a non-zero
/// residue into zero.
pub const BFV_PLAIN_MODULUS: u64 = 65_537;

/// BFV polynomial modulus degree.
pub const BFV_POLY_MODULUS_DEGREE: usize = 8192;

/// Padded mapping-sequence length `L'` exposed to clients.
pub const EXTENDED_MAPPING_LENGTH: usize = 64;

/// Default segment count `S` used when a submission does not override it.
pub const DEFAULT_SEGMENTS: usize = 10;

/// Maximum verification attempts before a session is closed.
pub const MAX_ATTEMPTS_PER_SESSION: u32 = 3;

/// Failed-attempt budget per user per rolling hour.
pub const FAILED_ATTEMPTS_PER_HOUR_PER_USER: usize = 20;

/// Size in bytes of the RS-encoded, XOR-protected prize blob (`32 + 16`).
pub const PRIZE_BLOCK_LEN: usize = 48;

/// Size in bytes of the raw 256-bit prize before RS encoding.
pub const PRIZE_DATA_LEN: usize = 32;

/// Reed-Solomon parity bytes appended to the prize message.
pub const RS_PARITY_BYTES: usize = 16;

pub use crate::alphabet::{Alphabet, AlphabetError, Mapping};
pub use crate::he::{HeContext, HeError, PrivateContext, PublicContext};
pub use crate::prize::{PrizeError, ProtectedPrize};
pub use crate::protocol::{
    CommitPackage, FinalPackage, ProtocolError, RevealPackage, VerifyOutcome,
};
pub use crate::store::{Store, StoreError};
