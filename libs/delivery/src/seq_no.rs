//! Wraparound-aware sequence numbers
//!
//! The numeric space is circular: `SeqNo::MAX.inc() == SeqNo::MIN`. Two
//! values compare by the sign of their wrapping difference, so ordering is
//! only meaningful while the true distance between compared values stays
//! below half the representable range. Flow-control windows keep every value
//! a controller holds far inside that bound, which is also what keeps the
//! `Ord` impl consistent for the ordered collections the buffers use.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct SeqNo(i64);

impl SeqNo {
    pub const ZERO: SeqNo = SeqNo(0);
    pub const MIN: SeqNo = SeqNo(i64::MIN);
    pub const MAX: SeqNo = SeqNo(i64::MAX);

    pub const fn new(value: i64) -> Self {
        Self(value)
    }

    pub const fn value(self) -> i64 {
        self.0
    }

    /// Next sequence number, wrapping from `MAX` to `MIN`
    pub const fn inc(self) -> Self {
        Self(self.0.wrapping_add(1))
    }

    /// Previous sequence number, wrapping from `MIN` to `MAX`
    pub const fn dec(self) -> Self {
        Self(self.0.wrapping_sub(1))
    }

    pub const fn wrapping_add(self, n: i64) -> Self {
        Self(self.0.wrapping_add(n))
    }

    /// True if `self` directly follows `other`
    pub const fn is_successor(self, other: SeqNo) -> bool {
        self.0.wrapping_sub(other.0) == 1
    }

    /// Signed wrapping distance from `self` to `later`
    ///
    /// ```
    /// # use reliable_delivery::SeqNo;
    /// assert_eq!(SeqNo::new(1).distance_to(SeqNo::new(4)), 3);
    /// assert_eq!(SeqNo::MAX.distance_to(SeqNo::MIN), 1);
    /// assert_eq!(SeqNo::MIN.distance_to(SeqNo::MAX), -1);
    /// ```
    pub const fn distance_to(self, later: SeqNo) -> i64 {
        later.0.wrapping_sub(self.0)
    }
}

impl Ord for SeqNo {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.wrapping_sub(other.0).cmp(&0)
    }
}

impl PartialOrd for SeqNo {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for SeqNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for SeqNo {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

/// Anything positioned in a sequence
pub trait HasSeqNo {
    fn seq_no(&self) -> SeqNo;
}

/// A payload with the sequence number it was assigned
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sequenced<T> {
    pub seq_no: SeqNo,
    pub payload: T,
}

impl<T> Sequenced<T> {
    pub fn new(seq_no: impl Into<SeqNo>, payload: T) -> Self {
        Self {
            seq_no: seq_no.into(),
            payload,
        }
    }
}

impl<T> HasSeqNo for Sequenced<T> {
    fn seq_no(&self) -> SeqNo {
        self.seq_no
    }
}
