//! Fixed-capacity bit set used for slot, CU busy and CU eligibility masks.
//!
//! Storage is 32-bit words so masks can be copied straight out of command
//! packets. Bit `i` lives in word `i / 32` at position `i % 32`.

use kds_core::config::MAX_SLOTS;

const WORD_BITS: usize = 32;
const WORDS: usize = MAX_SLOTS / WORD_BITS;

/// Bit set of up to 128 entries with a logical length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BitSet {
    words: [u32; WORDS],
    len: usize,
}

/// Number of 32-bit words needed for `bits` entries.
pub fn words_for(bits: usize) -> usize {
    bits.div_ceil(WORD_BITS)
}

impl BitSet {
    pub const CAPACITY: usize = WORDS * WORD_BITS;

    /// Empty set of `len` bits (clamped to capacity).
    pub fn new(len: usize) -> Self {
        Self {
            words: [0; WORDS],
            len: len.min(Self::CAPACITY),
        }
    }

    /// Set with the first `len` bits set.
    pub fn full(len: usize) -> Self {
        let mut set = Self::new(len);
        for i in 0..set.len {
            set.set(i);
        }
        set
    }

    /// Build from packet mask words; length covers every supplied word.
    pub fn from_words(words: &[u32]) -> Self {
        let mut set = Self::new(words.len() * WORD_BITS);
        for (dst, src) in set.words.iter_mut().zip(words) {
            *dst = *src;
        }
        set
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    pub fn words(&self) -> &[u32] {
        &self.words[..words_for(self.len)]
    }

    pub fn test(&self, idx: usize) -> bool {
        idx < self.len && self.words[idx / WORD_BITS] & (1 << (idx % WORD_BITS)) != 0
    }

    pub fn set(&mut self, idx: usize) {
        if idx < self.len {
            self.words[idx / WORD_BITS] |= 1 << (idx % WORD_BITS);
        }
    }

    pub fn clear(&mut self, idx: usize) {
        if idx < self.len {
            self.words[idx / WORD_BITS] &= !(1 << (idx % WORD_BITS));
        }
    }

    pub fn clear_all(&mut self) {
        self.words = [0; WORDS];
    }

    pub fn count_ones(&self) -> usize {
        self.words().iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Lowest clear bit below `len`.
    pub fn first_zero(&self) -> Option<usize> {
        self.words
            .iter()
            .enumerate()
            .find(|(_, w)| **w != u32::MAX)
            .map(|(i, w)| i * WORD_BITS + w.trailing_ones() as usize)
            .filter(|idx| *idx < self.len)
    }

    /// Lowest set bit.
    pub fn first_set(&self) -> Option<usize> {
        self.words
            .iter()
            .enumerate()
            .find(|(_, w)| **w != 0)
            .map(|(i, w)| i * WORD_BITS + w.trailing_zeros() as usize)
            .filter(|idx| *idx < self.len)
    }

    pub fn iter_ones(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.len).filter(move |i| self.test(*i))
    }

    /// `self & other`, keeping the shorter length.
    pub fn and(&self, other: &Self) -> Self {
        let mut out = Self::new(self.len.min(other.len));
        for i in 0..WORDS {
            out.words[i] = self.words[i] & other.words[i];
        }
        out.trim();
        out
    }

    /// `self & !other`, keeping `self`'s length.
    pub fn and_not(&self, other: &Self) -> Self {
        let mut out = *self;
        for i in 0..WORDS {
            out.words[i] &= !other.words[i];
        }
        out
    }

    /// Change the logical length, dropping bits past the new end.
    pub fn resize(&mut self, len: usize) {
        self.len = len.min(Self::CAPACITY);
        self.trim();
    }

    fn trim(&mut self) {
        for i in 0..WORDS {
            let lo = i * WORD_BITS;
            if lo >= self.len {
                self.words[i] = 0;
            } else if self.len - lo < WORD_BITS {
                self.words[i] &= (1u32 << (self.len - lo)) - 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_zero_scans_lowest_index() {
        let mut set = BitSet::new(16);
        assert_eq!(set.first_zero(), Some(0));
        set.set(0);
        set.set(1);
        set.set(3);
        assert_eq!(set.first_zero(), Some(2));
    }

    #[test]
    fn test_first_zero_respects_len() {
        let mut set = BitSet::full(3);
        assert_eq!(set.first_zero(), None);
        set.clear(1);
        assert_eq!(set.first_zero(), Some(1));
    }

    #[test]
    fn test_first_zero_crosses_word_boundary() {
        let mut set = BitSet::full(40);
        set.clear(35);
        assert_eq!(set.first_zero(), Some(35));
        assert_eq!(BitSet::full(128).first_zero(), None);
    }

    #[test]
    fn test_first_set_and_mask_ops() {
        let eligible = BitSet::from_words(&[0b1110]);
        let mut busy = BitSet::new(32);
        busy.set(1);
        let free = eligible.and_not(&busy);
        assert_eq!(free.first_set(), Some(2));
        assert_eq!(free.count_ones(), 2);

        let valid = BitSet::full(3);
        assert_eq!(free.and(&valid).iter_ones().collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn test_out_of_range_is_ignored() {
        let mut set = BitSet::new(4);
        set.set(9);
        assert!(!set.test(9));
        assert!(set.is_empty());
    }

    #[test]
    fn test_resize_drops_high_bits() {
        let mut set = BitSet::full(64);
        set.resize(33);
        assert_eq!(set.count_ones(), 33);
        assert_eq!(set.words().len(), 2);
        assert_eq!(words_for(33), 2);
    }
}
