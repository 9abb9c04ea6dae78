//! Pointer Bitmap - Tracking Relocatable Slots
//!
//! One bit per 8-byte slot. A set bit means the slot holds a pointer that
//! must be rewritten whenever the bytes are moved to another base.
//!
//! ```text
//! buffer offset 0x48 -> bit 0x48 / 8 = 9 -> word 0, bit 9
//! ```
//!
//! The map grows while regions grow and is compacted exactly once, after
//! which it is immutable: its length is cut down to the highest set bit so
//! the persisted form carries no trailing zero words.

use crate::error::{ArchiveError, Result};
use farc_util::WORD_SIZE;

/// Bitmap over pointer-sized slots
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PtrMap {
    words: Vec<u64>,
    size_in_bits: usize,
    compacted: bool,
}

impl PtrMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bitmap covering `size_in_bits` slots, all clear
    pub fn with_size(size_in_bits: usize) -> Self {
        Self {
            words: vec![0; words_for(size_in_bits)],
            size_in_bits,
            compacted: false,
        }
    }

    /// Decode a persisted bitmap; the result is already compacted
    pub fn from_bytes(bytes: &[u8], size_in_bits: usize) -> Result<Self> {
        let word_count = words_for(size_in_bits);
        if bytes.len() < word_count * WORD_SIZE {
            return Err(ArchiveError::BadHeader(format!(
                "bitmap of {size_in_bits} bits needs {} bytes, got {}",
                word_count * WORD_SIZE,
                bytes.len()
            )));
        }
        let words = bytes[..word_count * WORD_SIZE]
            .chunks_exact(WORD_SIZE)
            .map(|chunk| {
                let mut word = [0u8; WORD_SIZE];
                word.copy_from_slice(chunk);
                u64::from_le_bytes(word)
            })
            .collect();
        Ok(Self {
            words,
            size_in_bits,
            compacted: true,
        })
    }

    /// Little-endian words covering `size_in_bits`
    pub fn to_bytes(&self) -> Vec<u8> {
        self.words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    /// Grow the committed range to `size_in_bits`; never shrinks
    pub fn resize(&mut self, size_in_bits: usize) -> Result<()> {
        self.check_mutable()?;
        if size_in_bits > self.size_in_bits {
            self.size_in_bits = size_in_bits;
            self.words.resize(words_for(size_in_bits), 0);
        }
        Ok(())
    }

    /// Append `count` clear bits, returning the index of the first one
    pub fn append(&mut self, count: usize) -> Result<usize> {
        let start = self.size_in_bits;
        self.resize(start + count)?;
        Ok(start)
    }

    pub fn mark(&mut self, bit: usize) -> Result<()> {
        self.check_mutable()?;
        let (word, mask) = self.locate(bit)?;
        self.words[word] |= mask;
        Ok(())
    }

    pub fn clear(&mut self, bit: usize) -> Result<()> {
        self.check_mutable()?;
        let (word, mask) = self.locate(bit)?;
        self.words[word] &= !mask;
        Ok(())
    }

    pub fn is_set(&self, bit: usize) -> bool {
        bit < self.size_in_bits && self.words[bit / 64] & (1u64 << (bit % 64)) != 0
    }

    /// Iterate set bits in ascending order
    pub fn iter_set(&self) -> SetBits<'_> {
        self.iter_set_in(0, self.size_in_bits)
    }

    /// Iterate set bits in `[start, end)` in ascending order
    pub fn iter_set_in(&self, start: usize, end: usize) -> SetBits<'_> {
        SetBits {
            words: &self.words,
            next: start,
            end: end.min(self.size_in_bits),
        }
    }

    pub fn count_set(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn highest_set(&self) -> Option<usize> {
        self.words
            .iter()
            .enumerate()
            .rev()
            .find(|(_, w)| **w != 0)
            .map(|(i, w)| i * 64 + 63 - w.leading_zeros() as usize)
    }

    /// Truncate to the highest set bit and freeze
    ///
    /// Returns the compacted size in bits. Any later `mark`/`clear` is an
    /// [`ArchiveError::InvalidState`].
    pub fn compact(&mut self) -> Result<usize> {
        self.check_mutable()?;
        self.size_in_bits = self.highest_set().map_or(0, |bit| bit + 1);
        self.words.truncate(words_for(self.size_in_bits));
        self.compacted = true;
        Ok(self.size_in_bits)
    }

    pub fn size_in_bits(&self) -> usize {
        self.size_in_bits
    }

    pub fn size_in_bytes(&self) -> usize {
        self.words.len() * WORD_SIZE
    }

    pub fn is_compacted(&self) -> bool {
        self.compacted
    }

    fn check_mutable(&self) -> Result<()> {
        if self.compacted {
            return Err(ArchiveError::InvalidState {
                expected: "mutable pointer bitmap".to_string(),
                actual: "compacted".to_string(),
            });
        }
        Ok(())
    }

    fn locate(&self, bit: usize) -> Result<(usize, u64)> {
        if bit >= self.size_in_bits {
            return Err(ArchiveError::Internal(format!(
                "slot {bit} outside the committed bitmap range of {} slots",
                self.size_in_bits
            )));
        }
        Ok((bit / 64, 1u64 << (bit % 64)))
    }
}

/// Iterator over set bits, scanning a word at a time
pub struct SetBits<'a> {
    words: &'a [u64],
    next: usize,
    end: usize,
}

impl Iterator for SetBits<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        while self.next < self.end {
            let word_index = self.next / 64;
            let shift = self.next % 64;
            let word = self.words[word_index] >> shift;
            if word == 0 {
                self.next = (word_index + 1) * 64;
                continue;
            }
            let bit = self.next + word.trailing_zeros() as usize;
            if bit >= self.end {
                self.next = self.end;
                return None;
            }
            self.next = bit + 1;
            return Some(bit);
        }
        None
    }
}

fn words_for(bits: usize) -> usize {
    bits.div_ceil(64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    #[test]
    fn test_mark_and_iterate() {
        let mut map = PtrMap::with_size(200);
        for bit in [3, 64, 65, 199] {
            map.mark(bit).unwrap();
        }
        map.clear(65).unwrap();
        assert_eq!(map.iter_set().collect::<Vec<_>>(), vec![3, 64, 199]);
        assert_eq!(map.iter_set_in(4, 199).collect::<Vec<_>>(), vec![64]);
        assert_eq!(map.count_set(), 3);
        assert!(map.mark(200).is_err());
    }

    #[test]
    fn test_compact_truncates_and_freezes() {
        let mut map = PtrMap::with_size(1000);
        map.mark(70).unwrap();
        assert_eq!(map.compact().unwrap(), 71);
        assert_eq!(map.size_in_bytes(), 16);
        assert!(matches!(map.mark(1), Err(ArchiveError::InvalidState { .. })));
        assert!(map.is_set(70));
    }

    #[test]
    fn test_empty_map_compacts_to_zero() {
        let mut map = PtrMap::with_size(64);
        assert_eq!(map.compact().unwrap(), 0);
        assert!(map.to_bytes().is_empty());
    }

    #[test]
    fn test_append_reserves_fresh_range() {
        let mut map = PtrMap::new();
        assert_eq!(map.append(4).unwrap(), 0);
        assert_eq!(map.append(3).unwrap(), 4);
        map.mark(6).unwrap();
        assert_eq!(map.iter_set_in(4, 7).collect::<Vec<_>>(), vec![6]);
    }

    #[quickcheck]
    fn prop_bytes_round_trip(bits: Vec<u16>) -> bool {
        let mut map = PtrMap::with_size(1 << 16);
        for &bit in &bits {
            map.mark(bit as usize).unwrap();
        }
        let size = map.compact().unwrap();
        let decoded = PtrMap::from_bytes(&map.to_bytes(), size).unwrap();
        decoded.iter_set().eq(map.iter_set())
    }
}
