// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! 16-bit wrap-safe stream sequence numbers.
//!
//! Every stream lane numbers its messages with a `SeqNum`. The counter wraps
//! at 2^16, so ordering is defined by the signed half-range rule: `a < b` iff
//! the signed difference `a - b` (mod 2^16) is negative. The ordering is only
//! meaningful for numbers less than 2^15 apart; a live window is always far
//! narrower than that, so the limit is a documented boundary rather than a
//! runtime check.

use std::fmt;
use std::ops::Add;

/// Wrap-safe 16-bit sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SeqNum(pub u16);

impl SeqNum {
    /// Sentinel for "nothing sent yet": its successor is 0, the first
    /// sequence number a fresh stream assigns.
    pub const SENTINEL: SeqNum = SeqNum(u16::MAX);

    /// Successor, wrapping at 2^16.
    #[inline]
    pub fn next(self) -> SeqNum {
        SeqNum(self.0.wrapping_add(1))
    }

    /// Signed modular difference `self - other`, in `[-2^15, 2^15)`.
    #[inline]
    pub fn diff(self, other: SeqNum) -> i32 {
        i32::from(self.0.wrapping_sub(other.0) as i16)
    }

    /// Raw wire value.
    #[inline]
    pub fn raw(self) -> u16 {
        self.0
    }
}

impl From<u16> for SeqNum {
    fn from(v: u16) -> Self {
        SeqNum(v)
    }
}

impl Add<u16> for SeqNum {
    type Output = SeqNum;

    fn add(self, rhs: u16) -> SeqNum {
        SeqNum(self.0.wrapping_add(rhs))
    }
}

impl PartialOrd for SeqNum {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.diff(*other).cmp(&0))
    }
}

impl fmt::Display for SeqNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
