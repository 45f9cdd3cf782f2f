//! monwatch Core - display fingerprinting engine
//!
//! Computes a fixed-width digest over the identity blocks of all
//! attached displays and decides when that digest has changed.
//! No I/O happens here; callers hand in raw identity bytes.

use std::fmt;

/// Fixed-width digest summarizing all currently attached displays'
/// identity blocks.
///
/// Two snapshots with the same identity blocks in the same enumeration
/// order always produce the same fingerprint. A snapshot exposing no
/// identity data at all hashes the empty buffer, so "nothing attached"
/// is a stable, comparable value rather than a sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fingerprint(blake3::Hash);

impl Fingerprint {
    /// Hash the concatenation of `blocks` in iteration order.
    ///
    /// Blocks are typically EDID byte strings; a display without one
    /// simply contributes no bytes. Never fails.
    pub fn of_blocks<'a, I>(blocks: I) -> Self
    where
        I: IntoIterator<Item = &'a [u8]>,
    {
        let mut hasher = blake3::Hasher::new();
        for block in blocks {
            hasher.update(block);
        }
        Fingerprint(hasher.finalize())
    }

    /// Lowercase hex rendering, as passed to the action script.
    pub fn to_hex(&self) -> String {
        self.0.to_hex().to_string()
    }

    /// Raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.to_hex())
    }
}

/// Outcome of comparing a freshly computed fingerprint against the
/// last-accepted one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeDecision {
    /// Same digest as before; nothing to do.
    Unchanged,
    /// The digest differs (or there was no prior digest at all).
    /// `previous` is `None` exactly on the first-ever detection.
    Changed { previous: Option<Fingerprint> },
}

impl ChangeDecision {
    pub fn is_changed(&self) -> bool {
        matches!(self, ChangeDecision::Changed { .. })
    }
}

/// Compare `new` against the last-accepted fingerprint.
///
/// Pure byte-equality; no state is mutated here. The caller owns the
/// "current fingerprint" value and must update it after acting on a
/// `Changed` result, or the same change keeps re-triggering.
///
/// A missing prior fingerprint is a forced `Changed` regardless of
/// `new` - this seeds the baseline on the daemon's first computation.
pub fn detect(last: Option<&Fingerprint>, new: &Fingerprint) -> ChangeDecision {
    match last {
        None => ChangeDecision::Changed { previous: None },
        Some(prev) if prev == new => ChangeDecision::Unchanged,
        Some(prev) => ChangeDecision::Changed {
            previous: Some(*prev),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// BLAKE3 of the empty buffer.
    const EMPTY_HEX: &str = "af1349b9f5f9a1a6a0404dee36dcc9499bcb25c9adc112b7cc9a93cae41f3262";

    #[test]
    fn identical_blocks_hash_identically() {
        let a = Fingerprint::of_blocks([b"edid-one".as_slice(), b"edid-two".as_slice()]);
        let b = Fingerprint::of_blocks([b"edid-one".as_slice(), b"edid-two".as_slice()]);
        assert_eq!(a, b);
        assert_eq!(a.to_hex(), b.to_hex());
    }

    #[test]
    fn differing_blocks_hash_differently() {
        let a = Fingerprint::of_blocks([b"edid-one".as_slice()]);
        let b = Fingerprint::of_blocks([b"edid-two".as_slice()]);
        assert_ne!(a, b);
    }

    #[test]
    fn order_is_significant() {
        let ab = Fingerprint::of_blocks([b"aa".as_slice(), b"bb".as_slice()]);
        let ba = Fingerprint::of_blocks([b"bb".as_slice(), b"aa".as_slice()]);
        assert_ne!(ab, ba);
    }

    #[test]
    fn empty_input_law() {
        let none = Fingerprint::of_blocks(std::iter::empty());
        assert_eq!(none.to_hex(), EMPTY_HEX);

        // Displays present but none exposing identity data is the same
        // value as no displays at all.
        let blanks = Fingerprint::of_blocks([b"".as_slice(), b"".as_slice()]);
        assert_eq!(blanks, none);
    }

    #[test]
    fn hex_is_lowercase_and_fixed_width() {
        let fp = Fingerprint::of_blocks([b"display".as_slice()]);
        let hex = fp.to_hex();
        assert_eq!(hex.len(), 64);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn baseline_is_forced_changed() {
        let fp = Fingerprint::of_blocks([b"anything".as_slice()]);
        assert_eq!(detect(None, &fp), ChangeDecision::Changed { previous: None });

        // Even the degenerate empty digest seeds as a change.
        let empty = Fingerprint::of_blocks(std::iter::empty());
        assert!(detect(None, &empty).is_changed());
    }

    #[test]
    fn detector_is_pure() {
        let old = Fingerprint::of_blocks([b"old".as_slice()]);
        let new = Fingerprint::of_blocks([b"new".as_slice()]);

        // Without a state update the same comparison repeats verbatim.
        assert!(detect(Some(&old), &new).is_changed());
        assert!(detect(Some(&old), &new).is_changed());

        // Once the driver adopts the new value, the change is spent.
        assert_eq!(detect(Some(&new), &new), ChangeDecision::Unchanged);
    }

    #[test]
    fn changed_reports_previous() {
        let old = Fingerprint::of_blocks([b"old".as_slice()]);
        let new = Fingerprint::of_blocks([b"new".as_slice()]);
        match detect(Some(&old), &new) {
            ChangeDecision::Changed { previous: Some(p) } => assert_eq!(p, old),
            other => panic!("expected changed with previous, got {other:?}"),
        }
    }
}
