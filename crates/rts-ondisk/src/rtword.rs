//! Counter codec for realtime bitmap and summary words.
//!
//! Two encodings exist. Legacy volumes store 32-bit words in host byte
//! order with no per-block header. Volumes with a metadata directory store
//! big-endian words after a [`RTBUF_HEADER_SIZE`](crate::RTBUF_HEADER_SIZE)
//! byte header. The choice is made once from the superblock and carried in
//! the geometry.

use crate::rtbuf::RTBUF_HEADER_SIZE;
use rts_types::{ParseError, RT_WORD_SIZE, read_fixed, write_fixed};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RtWordCodec {
    /// Host-order words, headerless blocks.
    Legacy,
    /// Big-endian words behind a self-describing block header.
    BigEndian,
}

impl RtWordCodec {
    /// Bytes at the start of each bitmap/summary block before the first word.
    #[must_use]
    pub fn header_len(self) -> usize {
        match self {
            Self::Legacy => 0,
            Self::BigEndian => RTBUF_HEADER_SIZE,
        }
    }

    #[must_use]
    pub fn has_header(self) -> bool {
        self.header_len() != 0
    }

    #[must_use]
    pub fn decode(self, raw: [u8; RT_WORD_SIZE]) -> u32 {
        match self {
            Self::Legacy => u32::from_ne_bytes(raw),
            Self::BigEndian => u32::from_be_bytes(raw),
        }
    }

    #[must_use]
    pub fn encode(self, value: u32) -> [u8; RT_WORD_SIZE] {
        match self {
            Self::Legacy => value.to_ne_bytes(),
            Self::BigEndian => value.to_be_bytes(),
        }
    }

    /// Add one to an encoded counter, wrapping at 32 bits.
    ///
    /// Returns the new decoded value.
    pub fn increment(self, raw: &mut [u8; RT_WORD_SIZE]) -> u32 {
        let value = self.decode(*raw).wrapping_add(1);
        *raw = self.encode(value);
        value
    }

    /// Decode the word at byte offset `offset` of `buf`.
    pub fn load(self, buf: &[u8], offset: usize) -> Result<u32, ParseError> {
        read_fixed::<RT_WORD_SIZE>(buf, offset).map(|raw| self.decode(raw))
    }

    /// Encode `value` at byte offset `offset` of `buf`.
    pub fn store(self, buf: &mut [u8], offset: usize, value: u32) -> Result<(), ParseError> {
        write_fixed(buf, offset, &self.encode(value))
    }

    /// Decode word `index` of a bitmap/summary block, skipping the header.
    pub fn block_word(self, block: &[u8], index: usize) -> Result<u32, ParseError> {
        let offset = index
            .checked_mul(RT_WORD_SIZE)
            .and_then(|o| o.checked_add(self.header_len()))
            .ok_or(ParseError::IntegerConversion {
                field: "word index",
            })?;
        self.load(block, offset)
    }

    /// The word payload of a block, without its header.
    pub fn block_payload(self, block: &[u8]) -> Result<&[u8], ParseError> {
        let header = self.header_len();
        if block.len() < header {
            return Err(ParseError::InsufficientData {
                needed: header,
                offset: 0,
                actual: block.len(),
            });
        }
        Ok(&block[header..])
    }
}
