//! Session Store & Rate Limiter (C5)
//!
//! The only shared mutable state in the crate. A [`Store`] is a cheap-to-clone
//! handle (`Arc<Mutex<StoreInner>>`) constructed explicitly by the caller —
//! never a process-wide singleton — and passed into every request handler
//! that needs it. Every public method takes the lock for its entire critical
//! section, so the check-then-mutate sequences in §4.5 (dedup, issuance,
//! verification) observe a consistent snapshot.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::alphabet::{self, AlphabetError, Mapping};
use crate::he::PrivateContext;
use crate::protocol::{self, FinalPackage, ProtocolError, VerifyOutcome};
use crate::wire::{self, WireError};
use crate::{EXTENDED_MAPPING_LENGTH, FAILED_ATTEMPTS_PER_HOUR_PER_USER, MAX_ATTEMPTS_PER_SESSION};

/// Errors raised by the session store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The submitted package failed to decompress, parse, or shape-validate.
    #[error("challenge package is invalid: {0}")]
    InvalidPackage(#[from] WireError),
    /// `segments < 1` while extending the submitted mapping.
    #[error(transparent)]
    Alphabet(#[from] AlphabetError),
    /// A file with this exact compressed-byte hash already exists.
    #[error("duplicate challenge package (existing id {existing_id})")]
    DuplicateFile { existing_id: Uuid },
    /// A file with this exact mapping hash already exists.
    #[error("duplicate mapping (existing id {existing_id})")]
    DuplicateMapping { existing_id: Uuid },
    /// No unused package exists for the requested `(user_id, key_name)`.
    #[error("no unused challenge package for this user and key")]
    NoPackage,
    /// `session_token` does not name a live session.
    #[error("unknown session token")]
    UnknownSession,
    /// The session exists but is no longer open.
    #[error("session is closed: {0:?}")]
    SessionClosed(SessionCloseReason),
    /// More than `failed_attempts_per_hour_per_user` failures in the
    /// trailing hour for this user.
    #[error("rate limit exceeded")]
    RateLimited,
    /// A successful attempt already exists for this mapping sequence (I3).
    #[error("this challenge has already been unlocked")]
    AlreadyUnlocked,
    /// `verifier_private_key` did not base64-decode or load as a private
    /// context.
    #[error("verifier private key is invalid")]
    InvalidKey,
    /// The protocol engine itself raised an error while verifying.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Why a session transitioned out of `Open`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCloseReason {
    Expired,
    Exhausted,
    Verified,
}

/// A persisted challenge artifact (§3 `ChallengeDataFile`). Immutable except
/// for `is_used`, which flips exactly once, atomically with the owning
/// session's `is_verified` (I5).
#[derive(Debug, Clone)]
struct ChallengeDataFile {
    id: Uuid,
    user_id: Uuid,
    key_name: String,
    key_index: i64,
    file_hash: [u8; 32],
    mapping_hash: [u8; 32],
    compressed_package: Vec<u8>,
    extended_mapping: Vec<Mapping>,
    secret_length: Option<u32>,
    #[allow(dead_code)]
    created_at: DateTime<Utc>,
    is_used: bool,
}

/// A live verification handle over one challenge package (§3 `Session`).
#[derive(Debug, Clone)]
struct AuthenticationSession {
    #[allow(dead_code)]
    id: Uuid,
    data_file_id: Uuid,
    user_id: Uuid,
    mapping_sequence_hash: [u8; 32],
    #[allow(dead_code)]
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    is_verified: bool,
    attempts: u32,
    max_attempts: u32,
}

/// One verification attempt row (§3 `VerificationAttempt`). Append-only.
#[derive(Debug, Clone)]
struct VerificationAttempt {
    #[allow(dead_code)]
    session_id: Uuid,
    user_id: Uuid,
    was_successful: bool,
    attempted_at: DateTime<Utc>,
    mapping_sequence_hash: [u8; 32],
}

struct StoreInner {
    files: Vec<ChallengeDataFile>,
    sessions: HashMap<String, AuthenticationSession>,
    attempts: Vec<VerificationAttempt>,
}

/// A challenge newly issued by [`Store::issue_challenge`].
#[derive(Debug, Clone)]
pub struct ChallengeIssued {
    pub session_token: String,
    /// The padded mapping sequence, length `extended_mapping_length`.
    pub mapping: Vec<Mapping>,
    pub expires_at: DateTime<Utc>,
    /// `Some(L)` if the Owner chose to disclose the secret length at
    /// submission time; `None` if the client must supply it out-of-band.
    pub secret_length: Option<u32>,
}

/// Read-only view of a session's state, for the `/session_status` endpoint.
#[derive(Debug, Clone)]
pub struct SessionStatus {
    pub is_verified: bool,
    pub attempts: u32,
    pub max_attempts: u32,
    pub expires_at: DateTime<Utc>,
    pub closed: Option<SessionCloseReason>,
}

/// Read-only view of a user's rate-limit budget, for the
/// `/rate_limit_status` endpoint.
#[derive(Debug, Clone)]
pub struct RateLimitStatus {
    pub failed_attempts_last_hour: usize,
    pub limit: usize,
    pub remaining: usize,
}

/// Aggregate counters, for the `/stats` endpoint.
#[derive(Debug, Clone)]
pub struct StoreStats {
    pub total_files: usize,
    pub used_files: usize,
    pub total_sessions: usize,
    pub verified_sessions: usize,
    pub total_attempts: usize,
}

/// A cheap-to-clone handle onto the session store. Construct one with
/// [`Store::new`] and share it across request handlers — never reach for a
/// `static`/`OnceLock` singleton (see crate-level docs and DESIGN.md).
#[derive(Clone)]
pub struct Store {
    inner: Arc<Mutex<StoreInner>>,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(StoreInner {
                files: Vec::new(),
                sessions: HashMap::new(),
                attempts: Vec::new(),
            })),
        }
    }

    /// `submit` (§4.5): validate, dedup, pad, and persist a challenge
    /// package. Decompression/shape-validation, the two dedup lookups, and
    /// the insert all happen under one held lock.
    #[allow(clippy::too_many_arguments)]
    #[tracing::instrument(skip(self, compressed_package, mapping), fields(user_id = %user_id, key_name = %key_name, key_index))]
    pub fn submit(
        &self,
        compressed_package: Vec<u8>,
        mapping: Vec<Mapping>,
        user_id: Uuid,
        key_name: String,
        key_index: i64,
        segments: usize,
        secret_length: Option<u32>,
    ) -> Result<Uuid, StoreError> {
        // Step 1: decompress once to confirm well-formedness. The parsed
        // value itself is discarded — `submit` never needs a SealContext.
        wire::decompress_and_parse(&compressed_package)?;

        let file_hash = sha256(&compressed_package);
        let mapping_hash = sha256(&protocol::canonical_json(&mapping));

        let mut inner = self.inner.lock().expect("store mutex poisoned");

        if let Some(existing) = inner.files.iter().find(|f| f.file_hash == file_hash) {
            tracing::warn!(existing_id = %existing.id, "duplicate challenge package rejected");
            return Err(StoreError::DuplicateFile {
                existing_id: existing.id,
            });
        }
        if let Some(existing) = inner.files.iter().find(|f| f.mapping_hash == mapping_hash) {
            tracing::warn!(existing_id = %existing.id, "duplicate mapping rejected");
            return Err(StoreError::DuplicateMapping {
                existing_id: existing.id,
            });
        }

        let extended_mapping = alphabet::extend(&mapping, EXTENDED_MAPPING_LENGTH, segments)?;

        let id = Uuid::new_v4();
        inner.files.push(ChallengeDataFile {
            id,
            user_id,
            key_name,
            key_index,
            file_hash,
            mapping_hash,
            compressed_package,
            extended_mapping,
            secret_length,
            created_at: Utc::now(),
            is_used: false,
        });
        tracing::info!(file_id = %id, "challenge package submitted");
        Ok(id)
    }

    /// `issue_challenge` (§4.5): select the lowest-`key_index` unused
    /// package for `(user_id, key_name)` and open a session over it.
    #[tracing::instrument(skip(self), fields(user_id = %user_id, key_name))]
    pub fn issue_challenge(
        &self,
        user_id: Uuid,
        key_name: &str,
        timeout_minutes: i64,
    ) -> Result<ChallengeIssued, StoreError> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");

        let file = inner
            .files
            .iter()
            .filter(|f| f.user_id == user_id && f.key_name == key_name && !f.is_used)
            .min_by_key(|f| f.key_index)
            .ok_or(StoreError::NoPackage)?
            .clone();

        let now = Utc::now();
        let expires_at = now + Duration::minutes(timeout_minutes);
        let session_token = random_token();

        let mapping_sequence_hash = file.mapping_hash;

        inner.sessions.insert(
            session_token.clone(),
            AuthenticationSession {
                id: Uuid::new_v4(),
                data_file_id: file.id,
                user_id,
                mapping_sequence_hash,
                created_at: now,
                expires_at,
                is_verified: false,
                attempts: 0,
                max_attempts: MAX_ATTEMPTS_PER_SESSION,
            },
        );
        tracing::info!(file_id = %file.id, "challenge issued");

        Ok(ChallengeIssued {
            session_token,
            mapping: file.extended_mapping,
            expires_at,
            secret_length: file.secret_length,
        })
    }

    /// `verify` (§4.5). Preconditions are checked in the order the
    /// specification names them; the private key is decoded and loaded only
    /// after every cheaper, non-cryptographic check has passed, and the
    /// attempt row plus session/file mutation commit inside the same
    /// critical section as the outcome they record.
    #[tracing::instrument(skip(self, target, verifier_private_key_b64), fields(session_token))]
    pub fn verify(
        &self,
        session_token: &str,
        target: &[u64],
        verifier_private_key_b64: &str,
    ) -> Result<VerifyOutcome, StoreError> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");

        let now = Utc::now();

        let session = inner
            .sessions
            .get(session_token)
            .ok_or(StoreError::UnknownSession)?
            .clone();

        if session.is_verified {
            return Err(StoreError::SessionClosed(SessionCloseReason::Verified));
        }
        if session.expires_at <= now {
            return Err(StoreError::SessionClosed(SessionCloseReason::Expired));
        }
        if session.attempts >= session.max_attempts {
            return Err(StoreError::SessionClosed(SessionCloseReason::Exhausted));
        }

        let hour_ago = now - Duration::hours(1);
        let failed_in_window = inner
            .attempts
            .iter()
            .filter(|a| a.user_id == session.user_id && a.attempted_at >= hour_ago && !a.was_successful)
            .count();
        if failed_in_window >= FAILED_ATTEMPTS_PER_HOUR_PER_USER {
            tracing::warn!(user_id = %session.user_id, "rate limit exceeded");
            return Err(StoreError::RateLimited);
        }

        let already_unlocked = inner.attempts.iter().any(|a| {
            a.mapping_sequence_hash == session.mapping_sequence_hash && a.was_successful
        });
        if already_unlocked {
            tracing::warn!("attempt against an already-unlocked mapping sequence");
            return Err(StoreError::AlreadyUnlocked);
        }

        let key_bytes = BASE64
            .decode(verifier_private_key_b64)
            .map_err(|_| StoreError::InvalidKey)?;
        let vpriv = PrivateContext::load(&key_bytes).map_err(|_| StoreError::InvalidKey)?;

        let file = inner
            .files
            .iter()
            .find(|f| f.id == session.data_file_id)
            .expect("session always references a live file");
        let parsed = wire::decompress_and_parse(&file.compressed_package)?;
        let final_pkg: FinalPackage = wire::to_final_package(&parsed, vpriv.seal_context())?;

        let outcome = protocol::verifier_verify(&vpriv, &final_pkg, target)?;

        inner.attempts.push(VerificationAttempt {
            session_id: session.id,
            user_id: session.user_id,
            was_successful: outcome.is_match,
            attempted_at: now,
            mapping_sequence_hash: session.mapping_sequence_hash,
        });

        let session_mut = inner
            .sessions
            .get_mut(session_token)
            .expect("session looked up above still exists");
        session_mut.attempts += 1;
        if outcome.is_match {
            session_mut.is_verified = true;
            if let Some(f) = inner.files.iter_mut().find(|f| f.id == session.data_file_id) {
                f.is_used = true;
            }
            tracing::info!(session_token, "verification succeeded");
        } else {
            tracing::info!(session_token, "verification failed");
        }

        Ok(outcome)
    }

    /// Read-only session state, for `GET /session_status/{token}`.
    pub fn session_status(&self, session_token: &str) -> Result<SessionStatus, StoreError> {
        let inner = self.inner.lock().expect("store mutex poisoned");
        let session = inner
            .sessions
            .get(session_token)
            .ok_or(StoreError::UnknownSession)?;
        let now = Utc::now();
        let closed = if session.is_verified {
            Some(SessionCloseReason::Verified)
        } else if session.expires_at <= now {
            Some(SessionCloseReason::Expired)
        } else if session.attempts >= session.max_attempts {
            Some(SessionCloseReason::Exhausted)
        } else {
            None
        };
        Ok(SessionStatus {
            is_verified: session.is_verified,
            attempts: session.attempts,
            max_attempts: session.max_attempts,
            expires_at: session.expires_at,
            closed,
        })
    }

    /// Read-only rate-limit budget for the user owning `session_token`, for
    /// `GET /rate_limit_status/{token}`.
    pub fn rate_limit_status(&self, session_token: &str) -> Result<RateLimitStatus, StoreError> {
        let inner = self.inner.lock().expect("store mutex poisoned");
        let session = inner
            .sessions
            .get(session_token)
            .ok_or(StoreError::UnknownSession)?;
        let hour_ago = Utc::now() - Duration::hours(1);
        let failed_attempts_last_hour = inner
            .attempts
            .iter()
            .filter(|a| a.user_id == session.user_id && a.attempted_at >= hour_ago && !a.was_successful)
            .count();
        let limit = FAILED_ATTEMPTS_PER_HOUR_PER_USER;
        Ok(RateLimitStatus {
            failed_attempts_last_hour,
            limit,
            remaining: limit.saturating_sub(failed_attempts_last_hour),
        })
    }

    /// Aggregate counters for `GET /stats`.
    pub fn stats(&self) -> StoreStats {
        let inner = self.inner.lock().expect("store mutex poisoned");
        StoreStats {
            total_files: inner.files.len(),
            used_files: inner.files.iter().filter(|f| f.is_used).count(),
            total_sessions: inner.sessions.len(),
            verified_sessions: inner.sessions.values().filter(|s| s.is_verified).count(),
            total_attempts: inner.attempts.len(),
        }
    }
}

fn sha256(bytes: &[u8]) -> [u8; 32] {
    Sha256::digest(bytes).into()
}

fn random_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::he::HeContext;
    use crate::prize::Prize;
    use crate::protocol::{owner_finalize, owner_register, verifier_commit, verifier_transform};

    struct Built {
        wire_bytes: Vec<u8>,
        mappings: Vec<Mapping>,
        prize: Prize,
        verifier_priv_b64: String,
    }

    fn build_package(s: &str, segments: usize) -> Built {
        let mappings = alphabet::generate(s.chars().count(), segments).unwrap();
        let (owner_priv, owner_pub) = HeContext::provision().unwrap();
        let (verifier_priv, verifier_pub) = HeContext::provision().unwrap();

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
        let wire_bytes = wire::package_to_wire(&final_pkg).unwrap();
        let verifier_priv_b64 = BASE64.encode(verifier_priv.serialize().unwrap());
        Built {
            wire_bytes,
            mappings,
            prize,
            verifier_priv_b64,
        }
    }

    /// P5: consecutive issuances for one user/key yield packages in
    /// ascending `key_index` order. P7: resubmission dedup.
    #[test]
    fn p5_ordering_and_p7_dedup() {
        let store = Store::new();
        let user = Uuid::new_v4();
        let x = build_package("aa", 3);
        let y = build_package("bb", 3);

        let id_x = store
            .submit(x.wire_bytes.clone(), x.mappings.clone(), user, "k".into(), 1, 3, None)
            .unwrap();
        let id_y = store
            .submit(y.wire_bytes, y.mappings, user, "k".into(), 2, 3, None)
            .unwrap();
        assert_ne!(id_x, id_y);

        let err = store
            .submit(
                x.wire_bytes,
                alphabet::generate(2, 3).unwrap(),
                user,
                "k".into(),
                3,
                3,
                None,
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateFile { .. }));

        let first = store.issue_challenge(user, "k", 30).unwrap();
        let second = store.issue_challenge(user, "k", 30).unwrap();
        assert_ne!(first.session_token, second.session_token);
    }

    #[test]
    fn p4_single_unlock() {
        let store = Store::new();
        let user = Uuid::new_v4();
        let s = "z9";
        let segments = 3;
        let built = build_package(s, segments);

        store
            .submit(
                built.wire_bytes,
                built.mappings.clone(),
                user,
                "k".into(),
                1,
                segments,
                None,
            )
            .unwrap();
        let first_session = store.issue_challenge(user, "k", 30).unwrap();
        let second_session = store.issue_challenge(user, "k", 30).unwrap();

        let target: Vec<u64> = protocol::correct_sequence(&built.mappings, s)
            .into_iter()
            .map(|v| v as u64)
            .collect();

        let outcome = store
            .verify(&first_session.session_token, &target, &built.verifier_priv_b64)
            .unwrap();
        assert!(outcome.is_match);
        assert_eq!(outcome.prize.unwrap(), built.prize);

        let status = store.session_status(&first_session.session_token).unwrap();
        assert!(status.is_verified);

        // Any session over the same mapping sequence hash is now unlockable
        // only once; the second session observes AlreadyUnlocked.
        let err = store
            .verify(&second_session.session_token, &target, &built.verifier_priv_b64)
            .unwrap_err();
        assert!(matches!(err, StoreError::AlreadyUnlocked));
    }

    #[test]
    fn p6_rate_limit() {
        let store = Store::new();
        let user = Uuid::new_v4();
        let s = "ab";
        let segments = 3;
        let built = build_package(s, segments);
        store
            .submit(
                built.wire_bytes,
                built.mappings.clone(),
                user,
                "k".into(),
                1,
                segments,
                None,
            )
            .unwrap();

        let wrong_target = vec![9999u64; s.chars().count()];

        for _ in 0..FAILED_ATTEMPTS_PER_HOUR_PER_USER {
            let session = store.issue_challenge(user, "k", 30).unwrap();
            let _ = store.verify(&session.session_token, &wrong_target, &built.verifier_priv_b64);
        }

        let final_session = store.issue_challenge(user, "k", 30).unwrap();
        let err = store
            .verify(&final_session.session_token, &wrong_target, &built.verifier_priv_b64)
            .unwrap_err();
        assert!(matches!(err, StoreError::RateLimited));
    }

    #[test]
    fn session_closes_after_max_attempts() {
        let store = Store::new();
        let user = Uuid::new_v4();
        let s = "ab";
        let segments = 3;
        let built = build_package(s, segments);
        store
            .submit(built.wire_bytes, built.mappings, user, "k".into(), 1, segments, None)
            .unwrap();
        let session = store.issue_challenge(user, "k", 30).unwrap();
        let wrong_target = vec![9999u64; s.chars().count()];

        for _ in 0..MAX_ATTEMPTS_PER_SESSION {
            let _ = store.verify(&session.session_token, &wrong_target, &built.verifier_priv_b64);
        }
        let err = store
            .verify(&session.session_token, &wrong_target, &built.verifier_priv_b64)
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::SessionClosed(SessionCloseReason::Exhausted)
        ));
    }

    #[test]
    fn unknown_session_is_rejected() {
        let store = Store::new();
        let err = store.verify("does-not-exist", &[1, 2], "AAAA").unwrap_err();
        assert!(matches!(err, StoreError::UnknownSession));
    }

    #[test]
    fn no_package_when_nothing_submitted() {
        let store = Store::new();
        let err = store.issue_challenge(Uuid::new_v4(), "k", 30).unwrap_err();
        assert!(matches!(err, StoreError::NoPackage));
    }
}
