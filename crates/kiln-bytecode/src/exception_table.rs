//! Exception table encoding
//!
//! The table is a sequence of entries, each made of four variable-length
//! integers: start, length, target and `depth << 1 | lasti`. All offsets are
//! in code units. Integers are written as big-endian 6-bit groups; bit 6
//! (0x40) marks a continuation and bit 7 (0x80) marks the first byte of an
//! entry.

use serde::{Deserialize, Serialize};
use thiserror::Error;

const CONTINUE_BIT: u8 = 0x40;
const ENTRY_START_BIT: u8 = 0x80;
const PAYLOAD_MASK: u8 = 0x3F;

/// Errors produced when decoding an exception table
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExceptionTableError {
    /// Table ended in the middle of an entry
    #[error("exception table truncated at byte {0}")]
    Truncated(usize),

    /// An entry did not begin with the start marker
    #[error("exception table entry at byte {0} is missing its start marker")]
    MissingStartMarker(usize),

    /// A field other than the first carried the start marker
    #[error("unexpected entry start marker at byte {0}")]
    UnexpectedStartMarker(usize),

    /// A varint did not fit in 32 bits
    #[error("exception table value at byte {0} overflows")]
    Overflow(usize),
}

/// One protected range of a function
///
/// `end` is exclusive. Offsets are in code units, as stored in the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionTableEntry {
    /// First protected code unit
    pub start: u32,
    /// One past the last protected code unit
    pub end: u32,
    /// Handler code unit
    pub target: u32,
    /// Operand-stack depth the handler expects beneath its pushed values
    pub depth: u32,
    /// Whether the failing offset is pushed before the exception
    pub lasti: bool,
}

impl ExceptionTableEntry {
    /// Whether code unit `unit` is protected by this entry
    pub fn covers(&self, unit: u32) -> bool {
        self.start <= unit && unit < self.end
    }
}

fn write_varint(out: &mut Vec<u8>, value: u32, entry_start: bool) {
    let mut groups = vec![(value as u8) & PAYLOAD_MASK];
    let mut rest = value >> 6;
    while rest > 0 {
        groups.push((rest as u8) & PAYLOAD_MASK);
        rest >>= 6;
    }
    let last = groups.len() - 1;
    for (i, group) in groups.iter().rev().enumerate() {
        let mut byte = *group;
        if i != last {
            byte |= CONTINUE_BIT;
        }
        if i == 0 && entry_start {
            byte |= ENTRY_START_BIT;
        }
        out.push(byte);
    }
}

/// Encode entries into the compact table form
pub fn encode(entries: &[ExceptionTableEntry]) -> Vec<u8> {
    let mut out = Vec::new();
    for entry in entries {
        write_varint(&mut out, entry.start, true);
        write_varint(&mut out, entry.end.saturating_sub(entry.start), false);
        write_varint(&mut out, entry.target, false);
        write_varint(&mut out, entry.depth << 1 | entry.lasti as u32, false);
    }
    out
}

struct TableReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl TableReader<'_> {
    fn read_varint(&mut self, entry_start: bool) -> Result<u32, ExceptionTableError> {
        let first_pos = self.pos;
        let first = *self
            .bytes
            .get(self.pos)
            .ok_or(ExceptionTableError::Truncated(self.pos))?;
        if entry_start && first & ENTRY_START_BIT == 0 {
            return Err(ExceptionTableError::MissingStartMarker(first_pos));
        }
        if !entry_start && first & ENTRY_START_BIT != 0 {
            return Err(ExceptionTableError::UnexpectedStartMarker(first_pos));
        }
        self.pos += 1;
        let mut value = (first & PAYLOAD_MASK) as u64;
        let mut byte = first;
        while byte & CONTINUE_BIT != 0 {
            byte = *self
                .bytes
                .get(self.pos)
                .ok_or(ExceptionTableError::Truncated(self.pos))?;
            if byte & ENTRY_START_BIT != 0 {
                return Err(ExceptionTableError::UnexpectedStartMarker(self.pos));
            }
            self.pos += 1;
            value = (value << 6) | (byte & PAYLOAD_MASK) as u64;
            if value > u32::MAX as u64 {
                return Err(ExceptionTableError::Overflow(first_pos));
            }
        }
        Ok(value as u32)
    }
}

/// Decode the compact table form
pub fn decode(bytes: &[u8]) -> Result<Vec<ExceptionTableEntry>, ExceptionTableError> {
    let mut reader = TableReader { bytes, pos: 0 };
    let mut entries = Vec::new();
    while reader.pos < bytes.len() {
        let start = reader.read_varint(true)?;
        let length = reader.read_varint(false)?;
        let target = reader.read_varint(false)?;
        let depth_lasti = reader.read_varint(false)?;
        let end = start
            .checked_add(length)
            .ok_or(ExceptionTableError::Overflow(reader.pos))?;
        entries.push(ExceptionTableEntry {
            start,
            end,
            target,
            depth: depth_lasti >> 1,
            lasti: depth_lasti & 1 != 0,
        });
    }
    Ok(entries)
}
