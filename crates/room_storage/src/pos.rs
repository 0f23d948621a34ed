//! Fractional index positions for list ordering.
//!
//! A `Position` is a string over a base-62 digit alphabet whose
//! lexicographic order is the list order. `Position::between` generates a
//! key strictly between two neighbors, extending the key with an extra
//! digit when the neighbors are adjacent, so the key space never runs out.
//! Identical inputs always produce identical outputs.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Digit alphabet, in ASCII order so that byte comparison is digit order.
const ALPHABET: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
const BASE: usize = ALPHABET.len();

/// A dense, totally ordered list position.
///
/// Positions sort lexicographically. They are generated, never computed
/// from indices, so concurrent inserts at the same index produce distinct
/// keys that interleave deterministically on every replica.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Position(String);

/// Error produced when a position key cannot be generated.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PositionError {
    /// The lower bound was not strictly below the upper bound.
    #[error("position bounds out of order: {lo:?} >= {hi:?}")]
    BoundsOutOfOrder { lo: String, hi: String },

    /// A bound contained a byte outside the digit alphabet.
    #[error("invalid digit {digit:?} in position {key:?}")]
    InvalidDigit { key: String, digit: char },

    /// A bound ended in the minimal digit. Such keys are never generated
    /// because no key can be produced directly below them.
    #[error("position {key:?} ends in the minimal digit")]
    TrailingMinimalDigit { key: String },
}

impl Position {
    /// Wraps a raw key. The caller is responsible for digit validity;
    /// `between` re-validates its inputs before arithmetic.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Returns the raw key.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Generates a position strictly between `lo` and `hi`.
    ///
    /// `None` means unbounded on that side. For any valid `lo < hi` the
    /// result `p` satisfies `lo < p < hi`, and repeated calls with the
    /// same bounds return the same key.
    pub fn between(lo: Option<&Position>, hi: Option<&Position>) -> Result<Position, PositionError> {
        let a = lo.map(|p| p.0.as_str()).unwrap_or("");
        if let Some(hi) = hi {
            if a >= hi.0.as_str() {
                return Err(PositionError::BoundsOutOfOrder {
                    lo: a.to_string(),
                    hi: hi.0.clone(),
                });
            }
        }
        validate(a)?;
        if let Some(hi) = hi {
            validate(&hi.0)?;
        }

        let mid = midpoint(a.as_bytes(), hi.map(|p| p.0.as_bytes()));
        Ok(Position(String::from_utf8(mid).expect("alphabet is ASCII")))
    }

    /// Like `between`, with a replica-discriminating final digit.
    ///
    /// Two replicas generating a key between the same neighbors would
    /// otherwise produce the same key, and the second insert would be
    /// discarded as a duplicate. The actor digit keeps concurrent inserts
    /// distinct while staying deterministic per replica; the digit also
    /// decides their relative order, identically everywhere.
    pub fn between_with_actor(
        lo: Option<&Position>,
        hi: Option<&Position>,
        actor: u8,
    ) -> Result<Position, PositionError> {
        let mut key = Self::between(lo, hi)?;
        // Skip the minimal digit so the key stays a valid upper bound.
        key.0.push(ALPHABET[1 + (actor as usize) % (BASE - 1)] as char);
        Ok(key)
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn validate(key: &str) -> Result<(), PositionError> {
    for b in key.bytes() {
        if digit_index(b).is_none() {
            return Err(PositionError::InvalidDigit {
                key: key.to_string(),
                digit: b as char,
            });
        }
    }
    if key.as_bytes().last() == Some(&ALPHABET[0]) {
        return Err(PositionError::TrailingMinimalDigit {
            key: key.to_string(),
        });
    }
    Ok(())
}

fn digit_index(digit: u8) -> Option<usize> {
    ALPHABET.iter().position(|&d| d == digit)
}

/// Midpoint of the digit strings `a < b`, where the empty `a` is the
/// lower bound of the key space and `b = None` is the upper bound.
///
/// Invariants maintained: the result is non-empty, strictly between the
/// bounds, and never ends in the minimal digit (so a key can always be
/// generated below it later).
fn midpoint(a: &[u8], b: Option<&[u8]>) -> Vec<u8> {
    if let Some(b) = b {
        // Shared prefix, reading `a` as padded with virtual minimal
        // digits. After this loop the leading digits of the remainders
        // are guaranteed to differ, with a's below b's.
        let mut n = 0;
        while n < b.len() && a.get(n).copied().unwrap_or(ALPHABET[0]) == b[n] {
            n += 1;
        }
        if n > 0 {
            let a_rest = if n <= a.len() { &a[n..] } else { &[] };
            let mut out = b[..n].to_vec();
            out.extend(midpoint(a_rest, Some(&b[n..])));
            return out;
        }

        let da = a.first().and_then(|&d| digit_index(d)).unwrap_or(0);
        let db = digit_index(b[0]).unwrap_or(BASE - 1);
        if db.saturating_sub(da) > 1 {
            return vec![ALPHABET[da + (db - da + 1) / 2]];
        }
        // Adjacent digits: keep a's digit, move toward the top of its
        // sub-range.
        let a_rest = if a.is_empty() { &[][..] } else { &a[1..] };
        let mut out = vec![ALPHABET[da]];
        out.extend(midpoint(a_rest, None));
        out
    } else if let Some((&first, rest)) = a.split_first() {
        let da = digit_index(first).unwrap_or(0);
        if da == BASE - 1 {
            let mut out = vec![ALPHABET[BASE - 1]];
            out.extend(midpoint(rest, None));
            out
        } else {
            vec![ALPHABET[da + (BASE - da + 1) / 2]]
        }
    } else {
        vec![ALPHABET[BASE / 2]]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn between(lo: Option<&str>, hi: Option<&str>) -> String {
        let lo = lo.map(Position::new);
        let hi = hi.map(Position::new);
        Position::between(lo.as_ref(), hi.as_ref())
            .unwrap()
            .as_str()
            .to_string()
    }

    #[test]
    fn test_between_unbounded() {
        let p = between(None, None);
        assert!(!p.is_empty());
    }

    #[test]
    fn test_between_is_strictly_ordered() {
        let p = between(Some("1"), Some("2"));
        assert!("1" < p.as_str() && p.as_str() < "2");
    }

    #[test]
    fn test_adjacent_digits_extend_the_key() {
        let p = between(Some("1"), Some("2"));
        let q = between(Some("1"), Some(&p));
        assert!("1" < q.as_str() && q.as_str() < p.as_str());
    }

    #[test]
    fn test_prefix_neighbors() {
        let p = between(Some("X"), Some("X5"));
        assert!("X" < p.as_str() && p.as_str() < "X5");
    }

    #[test]
    fn test_stable_for_identical_inputs() {
        assert_eq!(between(Some("A"), Some("C")), between(Some("A"), Some("C")));
        assert_eq!(between(None, None), between(None, None));
    }

    #[test]
    fn test_repeated_append_stays_ordered() {
        let mut last = between(None, None);
        for _ in 0..100 {
            let next = between(Some(&last), None);
            assert!(last < next, "{last} !< {next}");
            last = next;
        }
    }

    #[test]
    fn test_repeated_prepend_stays_ordered() {
        let mut first = between(None, None);
        for _ in 0..100 {
            let next = between(None, Some(&first));
            assert!(next < first, "{next} !< {first}");
            first = next;
        }
    }

    #[test]
    fn test_repeated_bisection_never_runs_out() {
        let mut lo = between(None, None);
        let mut hi = between(Some(&lo), None);
        for i in 0..200 {
            let mid = between(Some(&lo), Some(&hi));
            assert!(lo < mid && mid < hi, "step {i}: {lo} / {mid} / {hi}");
            if i % 2 == 0 {
                lo = mid;
            } else {
                hi = mid;
            }
        }
    }

    #[test]
    fn test_bounds_out_of_order_is_an_error() {
        let a = Position::new("B");
        let b = Position::new("A");
        assert!(matches!(
            Position::between(Some(&a), Some(&b)),
            Err(PositionError::BoundsOutOfOrder { .. })
        ));
        assert!(matches!(
            Position::between(Some(&a), Some(&a)),
            Err(PositionError::BoundsOutOfOrder { .. })
        ));
    }

    #[test]
    fn test_actor_digit_keeps_keys_between_bounds() {
        let lo = Position::new("1");
        let hi = Position::new("2");
        let a = Position::between_with_actor(Some(&lo), Some(&hi), 4).unwrap();
        let b = Position::between_with_actor(Some(&lo), Some(&hi), 9).unwrap();
        assert_ne!(a, b);
        assert!(lo < a && a < hi);
        assert!(lo < b && b < hi);

        // Also between a prefix pair, where the appended digit must not
        // push the key past the upper bound.
        let lo = Position::new("X");
        let hi = Position::new("X5");
        let k = Position::between_with_actor(Some(&lo), Some(&hi), 60).unwrap();
        assert!(lo < k && k < hi);
    }

    #[test]
    fn test_invalid_digit_is_an_error() {
        let a = Position::new("a!b");
        assert!(matches!(
            Position::between(Some(&a), None),
            Err(PositionError::InvalidDigit { .. })
        ));
    }

    proptest! {
        /// For any two generated keys `a < b`, the midpoint lies strictly
        /// between them.
        #[test]
        fn prop_between_is_dense(ops in proptest::collection::vec(0usize..1000, 1..64)) {
            // Build a pool of keys by random insertion, then check every
            // adjacent pair.
            let mut keys = vec![between(None, None)];
            for op in ops {
                let i = op % keys.len();
                let lo = if i == 0 { None } else { Some(keys[i - 1].clone()) };
                let hi = Some(keys[i].clone());
                let k = between(lo.as_deref(), hi.as_deref());
                prop_assert!(lo.as_deref().map_or(true, |l| l < k.as_str()));
                prop_assert!(k < keys[i]);
                keys.insert(i, k);
            }
            for w in keys.windows(2) {
                prop_assert!(w[0] < w[1]);
            }
        }
    }
}
