//! Alphabet & Mapping Generator
//!
//! Produces the per-position character→segment mappings that the commitment
//! round (`protocol::verifier_commit`) binds to and the transform round
//! (`protocol::verifier_transform`) reads from. Construction: shuffle the
//! alphabet, shuffle the segment labels, partition the shuffled alphabet into
//! `S` contiguous chunks of size `⌈|A|/S⌉` (last chunk short), and assign the
//! *k*-th shuffled segment label to every character in chunk *k*. Every
//! character maps to exactly one segment; segment cardinalities differ by at
//! most one (Testable Property P8).

use std::collections::BTreeMap;

use rand::seq::SliceRandom;
use rand::thread_rng;
use serde::{Deserialize, Serialize};

/// The fixed ordered set of 95 printable characters shared by both parties:
/// uppercase letters, lowercase letters, decimal digits, ASCII punctuation,
/// and the space character.
pub const ALPHABET: &str =
    "ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789!\"#$%&'()*+,-./:;<=>?@[\\]^_`{|}~ ";

/// Errors raised by the alphabet & mapping generator.
#[derive(Debug, thiserror::Error)]
pub enum AlphabetError {
    /// `segments` must be at least 1.
    #[error("segments must be >= 1 (got {0})")]
    InvalidParameter(i64),
}

/// The shared alphabet, exposed as a lookup table rather than a bare string
/// constant so callers get a stable, owned character list and an `idx`
/// lookup without re-deriving it at every call site.
#[derive(Debug, Clone)]
pub struct Alphabet {
    chars: Vec<char>,
}

impl Default for Alphabet {
    fn default() -> Self {
        Self {
            chars: ALPHABET.chars().collect(),
        }
    }
}

impl Alphabet {
    /// Number of characters in the alphabet (95).
    pub fn len(&self) -> usize {
        self.chars.len()
    }

    /// The alphabet is fixed and non-empty.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Index of `c` within the alphabet, or `None` if `c` is not a member.
    /// Out-of-alphabet characters encode as the all-zero one-hot vector at
    /// the protocol layer, never as a negative index in Rust.
    pub fn idx(&self, c: char) -> Option<usize> {
        self.chars.iter().position(|&a| a == c)
    }

    /// Iterate the alphabet in its canonical order.
    pub fn iter(&self) -> impl Iterator<Item = char> + '_ {
        self.chars.iter().copied()
    }
}

/// A single position's character→segment mapping, `A → {1..S}`.
///
/// Backed by a `BTreeMap<String, u16>` (single-character string keys,
/// rather than `char`) so that serialization (and therefore the
/// commitment's canonical JSON) iterates keys in a fixed, sorted order
/// regardless of construction order. `serde_json` requires string map keys;
/// `char` keys would fail to serialize.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Mapping(BTreeMap<String, u16>);

impl Mapping {
    /// Segment assigned to `c`, if `c` is a member of the alphabet this
    /// mapping was built over.
    pub fn get(&self, c: char) -> Option<u16> {
        let mut buf = [0u8; 4];
        self.0.get(c.encode_utf8(&mut buf) as &str).copied()
    }

    /// Segment sizes, largest-chunk-first is not guaranteed; callers that
    /// need the partition shape (Testable Property P8) should look at the
    /// multiset of counts, not their order.
    pub fn segment_sizes(&self) -> Vec<usize> {
        let mut counts: BTreeMap<u16, usize> = BTreeMap::new();
        for &seg in self.0.values() {
            *counts.entry(seg).or_insert(0) += 1;
        }
        counts.into_values().collect()
    }

    /// Raw key/value view, for callers building the `w_i` plaintext weight
    /// vector in `protocol::verifier_transform`.
    pub fn entries(&self) -> impl Iterator<Item = (char, u16)> + '_ {
        self.0
            .iter()
            .map(|(c, &s)| (c.chars().next().expect("single-char key"), s))
    }
}

fn build_one(alphabet: &Alphabet, segments: usize) -> Mapping {
    let mut rng = thread_rng();

    let mut shuffled_chars: Vec<char> = alphabet.iter().collect();
    shuffled_chars.shuffle(&mut rng);

    let mut labels: Vec<u16> = (1..=segments as u16).collect();
    labels.shuffle(&mut rng);

    // Balanced partition into exactly `segments` groups: the first
    // `remainder` groups get one extra element so cardinalities differ by
    // at most one, instead of `.chunks(ceil(len/segments))`, which can
    // silently yield fewer than `segments` groups.
    let base = shuffled_chars.len() / segments;
    let remainder = shuffled_chars.len() % segments;

    let mut map = BTreeMap::new();
    let mut pos = 0;
    for (k, label) in labels.into_iter().enumerate() {
        let size = if k < remainder { base + 1 } else { base };
        for &c in &shuffled_chars[pos..pos + size] {
            map.insert(c.to_string(), label);
        }
        pos += size;
    }
    Mapping(map)
}

/// Generate a fresh mapping sequence `[M_0 .. M_{length-1}]`.
///
/// `segments < 1` fails with [`AlphabetError::InvalidParameter`].
pub fn generate(length: usize, segments: usize) -> Result<Vec<Mapping>, AlphabetError> {
    if segments < 1 {
        return Err(AlphabetError::InvalidParameter(segments as i64));
    }
    let alphabet = Alphabet::default();
    Ok((0..length).map(|_| build_one(&alphabet, segments)).collect())
}

/// Extend `mappings` with freshly generated entries until it reaches
/// `max(target, mappings.len())` positions. Existing positions are
/// untouched.
pub fn extend(
    mappings: &[Mapping],
    target: usize,
    segments: usize,
) -> Result<Vec<Mapping>, AlphabetError> {
    if segments < 1 {
        return Err(AlphabetError::InvalidParameter(segments as i64));
    }
    let final_len = target.max(mappings.len());
    let alphabet = Alphabet::default();
    let mut out = mappings.to_vec();
    while out.len() < final_len {
        out.push(build_one(&alphabet, segments));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alphabet_has_95_distinct_characters() {
        let a = Alphabet::default();
        assert_eq!(a.len(), 95);
        let unique: std::collections::HashSet<char> = a.iter().collect();
        assert_eq!(unique.len(), 95);
    }

    #[test]
    fn invalid_segments_rejected() {
        assert!(matches!(
            generate(4, 0),
            Err(AlphabetError::InvalidParameter(0))
        ));
    }

    #[test]
    fn partition_shape_p8() {
        for segments in [2usize, 3, 7, 10, 61, 62] {
            let mappings = generate(5, segments).unwrap();
            for m in &mappings {
                assert_eq!(m.entries().count(), 95);
                let sizes = m.segment_sizes();
                let min = *sizes.iter().min().unwrap();
                let max = *sizes.iter().max().unwrap();
                assert!(max - min <= 1, "segments {segments}: sizes {sizes:?}");
            }
        }
    }

    #[test]
    fn extend_keeps_prefix_and_reaches_target() {
        let base = generate(3, 10).unwrap();
        let extended = extend(&base, 8, 10).unwrap();
        assert_eq!(extended.len(), 8);
        assert_eq!(&extended[..3], &base[..]);
    }

    #[test]
    fn extend_is_noop_when_already_longer_than_target() {
        let base = generate(10, 10).unwrap();
        let extended = extend(&base, 4, 10).unwrap();
        assert_eq!(extended.len(), 10);
    }
}
