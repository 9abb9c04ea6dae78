//! Serialized lookup tables
//!
//! The last block of the ro region. All words, every pointer marked in the
//! relocation bitmap:
//!
//! ```text
//! [class_count][symbol_count][subgraph_count]
//! class_count    x [class ptr][name ptr]
//! symbol_count   x [symbol ptr]
//! subgraph_count x [record ptr]
//! ```
//!
//! A name is `[len][utf-8 bytes, zero padded to a word]`. A subgraph
//! record is
//!
//! ```text
//! [holder ptr][entry_count][class_count]
//! entry_count x [field_offset << 32 | root_index]
//! class_count x [class ptr]
//! ```

use crate::address::read_word;
use crate::error::{ArchiveError, Result};
use farc_util::align::align_up;
use farc_util::WORD_SIZE;

/// Words before the class entries
pub const TABLE_HEADER_WORDS: usize = 3;

/// Words before the entries of a subgraph record
pub const RECORD_HEADER_WORDS: usize = 3;

/// Bytes of a serialized name
pub fn name_size(name: &str) -> usize {
    WORD_SIZE + align_up(name.len(), WORD_SIZE)
}

pub fn encode_name(name: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(name_size(name));
    bytes.extend_from_slice(&(name.len() as u64).to_le_bytes());
    bytes.extend_from_slice(name.as_bytes());
    bytes.resize(name_size(name), 0);
    bytes
}

/// Decode the name starting at `offset` of `bytes`
pub fn decode_name(bytes: &[u8], offset: usize) -> Result<String> {
    let len = bytes
        .get(offset..offset + WORD_SIZE)
        .map(|word| read_word(word, 0) as usize)
        .ok_or_else(|| ArchiveError::BadHeader(format!("name at {offset:#x} is truncated")))?;
    let start = offset + WORD_SIZE;
    let text = start
        .checked_add(len)
        .and_then(|end| bytes.get(start..end))
        .ok_or_else(|| ArchiveError::BadHeader(format!("name at {offset:#x} is truncated")))?;
    String::from_utf8(text.to_vec())
        .map_err(|_| ArchiveError::BadHeader(format!("name at {offset:#x} is not utf-8")))
}

/// Pack a subgraph entry word
pub fn encode_entry(field_offset: u32, root_index: u32) -> u64 {
    (u64::from(field_offset) << 32) | u64::from(root_index)
}

/// Unpack a subgraph entry word into `(field_offset, root_index)`
pub fn decode_entry(word: u64) -> (u32, u32) {
    ((word >> 32) as u32, word as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_padding() {
        let bytes = encode_name("java/lang/Object");
        assert_eq!(bytes.len(), 24);
        assert_eq!(decode_name(&bytes, 0).unwrap(), "java/lang/Object");

        let odd = encode_name("A");
        assert_eq!(odd.len(), 16);
        assert_eq!(decode_name(&odd, 0).unwrap(), "A");
    }

    #[test]
    fn test_truncated_name_rejected() {
        let mut bytes = encode_name("abcdefgh");
        bytes.truncate(12);
        assert!(decode_name(&bytes, 0).is_err());
    }

    #[test]
    fn test_entry_word() {
        let word = encode_entry(0x18, 3);
        assert_eq!(decode_entry(word), (0x18, 3));
    }
}
