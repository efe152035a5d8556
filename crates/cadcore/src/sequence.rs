//! Positions in the durable log.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::SequenceError;

/// Position of an entry in the durable log.
///
/// Always positive. [`SequenceNumber::start`] is the empty-log position:
/// the first durable entry is `start().next()`, and a snapshot of the empty
/// state is tagged `start()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u64", into = "u64")]
pub struct SequenceNumber(u64);

impl SequenceNumber {
    pub const START: SequenceNumber = SequenceNumber(1);

    pub fn new(value: u64) -> Result<Self, SequenceError> {
        if value == 0 {
            return Err(SequenceError::NotPositive { value });
        }
        Ok(Self(value))
    }

    pub fn start() -> Self {
        Self::START
    }

    /// Returns the following position. Never mutates `self`.
    ///
    /// # Panics
    ///
    /// At `u64::MAX`. Log writers use [`checked_next`](Self::checked_next).
    #[must_use]
    pub fn next(self) -> Self {
        self.advance(1)
    }

    /// Returns the position `count` entries after this one.
    ///
    /// # Panics
    ///
    /// If the result does not fit in a `u64`.
    #[must_use]
    pub fn advance(self, count: u64) -> Self {
        match self.checked_advance(count) {
            Ok(seq) => seq,
            Err(err) => panic!("{err}"),
        }
    }

    pub fn checked_next(self) -> Result<Self, SequenceError> {
        self.checked_advance(1)
    }

    pub fn checked_advance(self, count: u64) -> Result<Self, SequenceError> {
        self.0
            .checked_add(count)
            .map(Self)
            .ok_or(SequenceError::Exhausted { from: self.0, count })
    }

    pub fn value(self) -> u64 {
        self.0
    }

    pub fn is_before(self, other: SequenceNumber) -> bool {
        self.0 < other.0
    }

    pub fn is_after(self, other: SequenceNumber) -> bool {
        self.0 > other.0
    }
}

impl Default for SequenceNumber {
    fn default() -> Self {
        Self::START
    }
}

impl TryFrom<u64> for SequenceNumber {
    type Error = SequenceError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<SequenceNumber> for u64 {
    fn from(seq: SequenceNumber) -> Self {
        seq.0
    }
}

impl fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_is_one() {
        assert_eq!(SequenceNumber::start().value(), 1);
    }

    #[test]
    fn next_increments_without_mutating() {
        let seq = SequenceNumber::new(41).unwrap();
        let next = seq.next();
        assert_eq!(seq.value(), 41);
        assert_eq!(next.value(), 42);
    }

    #[test]
    fn advancing_past_the_end_is_an_error() {
        let last = SequenceNumber::new(u64::MAX).unwrap();
        assert!(matches!(
            last.checked_next(),
            Err(SequenceError::Exhausted { count: 1, .. })
        ));
        assert_eq!(
            SequenceNumber::new(u64::MAX - 2).unwrap().checked_advance(2).unwrap(),
            last
        );
    }

    #[test]
    #[should_panic(expected = "exhausted")]
    fn next_panics_at_the_end() {
        let _ = SequenceNumber::new(u64::MAX).unwrap().next();
    }

    #[test]
    fn zero_is_rejected() {
        assert!(matches!(
            SequenceNumber::new(0),
            Err(SequenceError::NotPositive { value: 0 })
        ));
    }

    #[test]
    fn before_and_after_agree_with_value_order() {
        for _ in 0..500 {
            let a = SequenceNumber::new(fastrand::u64(1..1_000)).unwrap();
            let b = SequenceNumber::new(fastrand::u64(1..1_000)).unwrap();

            assert_eq!(a.is_before(b), a.value() < b.value());
            assert_eq!(a.is_after(b), a.value() > b.value());
            // Exactly one of before / after / equal holds.
            let relations = [a.is_before(b), a.is_after(b), a == b];
            assert_eq!(relations.iter().filter(|r| **r).count(), 1);
        }
    }

    #[test]
    fn deserialize_rejects_zero() {
        assert!(serde_json::from_str::<SequenceNumber>("0").is_err());
        let seq: SequenceNumber = serde_json::from_str("7").unwrap();
        assert_eq!(seq.value(), 7);
    }
}
