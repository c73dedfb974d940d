// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Fixed-capacity bit-sets over small integer identifiers (ports, cores).
//!
//! Two flavours are provided: [`Bitmask`], a plain value type used on the
//! control plane, and [`SharedBitmask`], an atomically readable variant for
//! masks the data-plane workers consult every iteration (poll / link-up /
//! active port masks).

#![deny(clippy::all, clippy::pedantic)]

use std::fmt::{self, Display};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use static_assertions::const_assert_eq;

/// Number of bits a mask can hold. Covers both the port-id space and the
/// core-id space.
pub const BITMASK_BITS: usize = 256;

const WORD_BITS: usize = u64::BITS as usize;
const WORDS: usize = BITMASK_BITS / WORD_BITS;

const_assert_eq!(BITMASK_BITS % WORD_BITS, 0);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BitmaskError {
    #[error("bit {0} out of range (max {max})", max = BITMASK_BITS - 1)]
    OutOfRange(usize),
    #[error("invalid mask string: {0}")]
    BadParse(String),
}

/// A plain, copyable bit-set.
#[derive(Copy, Clone, Default, PartialEq, Eq)]
pub struct Bitmask {
    words: [u64; WORDS],
}

impl Bitmask {
    #[must_use]
    pub const fn new() -> Self {
        Self { words: [0; WORDS] }
    }

    /// Mask with bits `0..n` set.
    #[must_use]
    pub fn first_n(n: usize) -> Self {
        let mut mask = Self::new();
        for bit in 0..n.min(BITMASK_BITS) {
            mask.set(bit);
        }
        mask
    }

    #[inline]
    #[must_use]
    pub const fn is_set(&self, bit: usize) -> bool {
        bit < BITMASK_BITS && self.words[bit / WORD_BITS] & (1u64 << (bit % WORD_BITS)) != 0
    }

    /// Set `bit`. Out-of-range bits are ignored; ids are validated where they
    /// are created, not here.
    #[inline]
    pub const fn set(&mut self, bit: usize) {
        if bit < BITMASK_BITS {
            self.words[bit / WORD_BITS] |= 1u64 << (bit % WORD_BITS);
        }
    }

    #[inline]
    pub const fn clear(&mut self, bit: usize) {
        if bit < BITMASK_BITS {
            self.words[bit / WORD_BITS] &= !(1u64 << (bit % WORD_BITS));
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    /// Number of set bits.
    #[must_use]
    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    #[must_use]
    pub fn and(&self, other: &Self) -> Self {
        let mut out = Self::new();
        for (i, w) in out.words.iter_mut().enumerate() {
            *w = self.words[i] & other.words[i];
        }
        out
    }

    #[must_use]
    pub fn or(&self, other: &Self) -> Self {
        let mut out = Self::new();
        for (i, w) in out.words.iter_mut().enumerate() {
            *w = self.words[i] | other.words[i];
        }
        out
    }

    /// Iterate over set bit positions in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        (0..BITMASK_BITS).filter(|bit| self.is_set(*bit))
    }

    /// First set bit at position `>= from`, wrapping to zero, or `None` for an
    /// empty mask. Used by round-robin candidate walks.
    #[must_use]
    pub fn next_set_wrapping(&self, from: usize) -> Option<usize> {
        if self.is_empty() {
            return None;
        }
        let start = from % BITMASK_BITS;
        (0..BITMASK_BITS)
            .map(|off| (start + off) % BITMASK_BITS)
            .find(|bit| self.is_set(*bit))
    }
}

impl Display for Bitmask {
    /// Hex rendering, least significant word last, leading zero words elided.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut started = false;
        for word in self.words.iter().rev() {
            if started {
                write!(f, "{word:016x}")?;
            } else if *word != 0 {
                write!(f, "{word:x}")?;
                started = true;
            }
        }
        if !started {
            write!(f, "0")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Bitmask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Bitmask({self})")
    }
}

impl FromStr for Bitmask {
    type Err = BitmaskError;

    /// Parse a hex mask string such as `"c"` or `"0xff00"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex = s.strip_prefix("0x").unwrap_or(s);
        if hex.is_empty() || hex.len() > WORDS * 16 {
            return Err(BitmaskError::BadParse(s.to_string()));
        }
        let mut mask = Bitmask::new();
        for (i, c) in hex.chars().rev().enumerate() {
            let nibble = c
                .to_digit(16)
                .ok_or_else(|| BitmaskError::BadParse(s.to_string()))?;
            let base = i * 4;
            for b in 0..4 {
                if nibble & (1 << b) != 0 {
                    mask.set(base + b);
                }
            }
        }
        Ok(mask)
    }
}

impl FromIterator<usize> for Bitmask {
    fn from_iter<T: IntoIterator<Item = usize>>(iter: T) -> Self {
        let mut mask = Bitmask::new();
        for bit in iter {
            mask.set(bit);
        }
        mask
    }
}

/// A bit-set with atomic word storage.
///
/// Writers (the control plane) update it under their own serialization; the
/// point of this type is that workers may test bits lock-free every iteration
/// and always observe the most recent committed store.
#[derive(Debug, Default)]
pub struct SharedBitmask {
    words: [AtomicU64; WORDS],
}

impl SharedBitmask {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            words: [const { AtomicU64::new(0) }; WORDS],
        }
    }

    #[inline]
    #[must_use]
    pub fn is_set(&self, bit: usize) -> bool {
        bit < BITMASK_BITS
            && self.words[bit / WORD_BITS].load(Ordering::Relaxed) & (1u64 << (bit % WORD_BITS))
                != 0
    }

    pub fn set(&self, bit: usize) {
        if bit < BITMASK_BITS {
            self.words[bit / WORD_BITS].fetch_or(1u64 << (bit % WORD_BITS), Ordering::Relaxed);
        }
    }

    pub fn clear(&self, bit: usize) {
        if bit < BITMASK_BITS {
            self.words[bit / WORD_BITS].fetch_and(!(1u64 << (bit % WORD_BITS)), Ordering::Relaxed);
        }
    }

    /// Replace the whole mask. Word stores are individually atomic; readers
    /// racing with a multi-word store may see a mix of old and new words,
    /// which the callers tolerate (mask updates are monotone per event).
    pub fn store(&self, value: Bitmask) {
        for (i, word) in self.words.iter().enumerate() {
            word.store(value.words[i], Ordering::Relaxed);
        }
    }

    #[must_use]
    pub fn load(&self) -> Bitmask {
        let mut out = Bitmask::new();
        for (i, word) in self.words.iter().enumerate() {
            out.words[i] = word.load(Ordering::Relaxed);
        }
        out
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| w.load(Ordering::Relaxed) == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_clear_test() {
        let mut m = Bitmask::new();
        assert!(m.is_empty());
        m.set(0);
        m.set(63);
        m.set(64);
        m.set(255);
        assert!(m.is_set(0));
        assert!(m.is_set(63));
        assert!(m.is_set(64));
        assert!(m.is_set(255));
        assert!(!m.is_set(1));
        assert_eq!(m.count(), 4);
        m.clear(63);
        assert!(!m.is_set(63));
        assert_eq!(m.count(), 3);
    }

    #[test]
    fn out_of_range_ignored() {
        let mut m = Bitmask::new();
        m.set(BITMASK_BITS);
        m.set(usize::MAX);
        assert!(m.is_empty());
        assert!(!m.is_set(BITMASK_BITS + 7));
    }

    #[test]
    fn and_or() {
        let a: Bitmask = [1usize, 2, 100].into_iter().collect();
        let b: Bitmask = [2usize, 100, 200].into_iter().collect();
        let both = a.and(&b);
        assert_eq!(both.iter().collect::<Vec<_>>(), vec![2, 100]);
        let either = a.or(&b);
        assert_eq!(either.iter().collect::<Vec<_>>(), vec![1, 2, 100, 200]);
    }

    #[test]
    fn first_n() {
        let m = Bitmask::first_n(5);
        assert_eq!(m.iter().collect::<Vec<_>>(), vec![0, 1, 2, 3, 4]);
        assert_eq!(Bitmask::first_n(0), Bitmask::new());
    }

    #[test]
    fn wrapping_search() {
        let m: Bitmask = [3usize, 10].into_iter().collect();
        assert_eq!(m.next_set_wrapping(0), Some(3));
        assert_eq!(m.next_set_wrapping(4), Some(10));
        assert_eq!(m.next_set_wrapping(11), Some(3));
        assert_eq!(Bitmask::new().next_set_wrapping(0), None);
    }

    #[test]
    fn hex_round_trip() {
        let m: Bitmask = [0usize, 1, 8, 65].into_iter().collect();
        let s = m.to_string();
        let parsed: Bitmask = s.parse().unwrap();
        assert_eq!(parsed, m);
    }

    #[test]
    fn parse_forms() {
        let m: Bitmask = "0xc".parse().unwrap();
        assert_eq!(m.iter().collect::<Vec<_>>(), vec![2, 3]);
        let m: Bitmask = "c".parse().unwrap();
        assert_eq!(m.count(), 2);
        assert_eq!(Bitmask::new().to_string(), "0");
        assert!("".parse::<Bitmask>().is_err());
        assert!("zz".parse::<Bitmask>().is_err());
    }

    #[test]
    fn shared_mirror() {
        let shared = SharedBitmask::new();
        let value: Bitmask = [7usize, 70, 250].into_iter().collect();
        shared.store(value);
        assert!(shared.is_set(7));
        assert!(shared.is_set(70));
        assert!(!shared.is_set(8));
        assert_eq!(shared.load(), value);
        shared.clear(70);
        shared.set(71);
        let reloaded = shared.load();
        assert!(!reloaded.is_set(70));
        assert!(reloaded.is_set(71));
    }
}
