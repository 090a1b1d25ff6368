//! Segmented memory for one execution context.
//!
//! Every segment is a full 64KB buffer keyed by its 16-bit ordinal, the way
//! real-mode x86 sees memory. Code segments are decoded once at
//! registration and carry an immutable instruction index; segments loaded
//! from a module image also carry their relocation records.

use crate::cpu::decode::{self, DecodeError, Instruction};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tracing::debug;

/// Size of every segment buffer.
pub const SEGMENT_SIZE: usize = 0x10000;

/// Segment backing SS.
pub const STACK_SEGMENT: u16 = 0xFF;

/// Segment backing ES at startup.
pub const EXTRA_SEGMENT: u16 = 0xFE;

/// Host-owned scratch segment served by [`Memory::allocate_host_memory`].
pub const HOST_MEMORY_SEGMENT: u16 = 0xFD;

/// Immediate value the linker leaves in place of a relocated word.
pub const RELOCATION_SENTINEL: u16 = 0xFFFF;

/// An imported function, as (imported module ordinal, function ordinal).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImportOrdinal {
    pub module: u16,
    pub function: u16,
}

/// What a relocated word resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RelocationTarget {
    /// Resolved by calling into the host.
    Import(ImportOrdinal),
    /// Substituted literally (typically a segment number).
    Internal { value: u16 },
}

/// A patch location recorded by the loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelocationRecord {
    /// Offset of the patched word within its segment.
    pub offset: u16,
    #[serde(flatten)]
    pub target: RelocationTarget,
}

/// One registered segment.
pub struct Segment {
    ordinal: u16,
    data: Box<[u8]>,
    is_code: bool,
    relocations: Vec<RelocationRecord>,
    instructions: Vec<Instruction>,
}

impl Segment {
    pub fn ordinal(&self) -> u16 {
        self.ordinal
    }

    pub fn is_code(&self) -> bool {
        self.is_code
    }

    /// The full 64KB buffer.
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn relocations(&self) -> &[RelocationRecord] {
        &self.relocations
    }

    /// Decoded instructions ordered by offset. Empty for data segments.
    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    fn instruction_at(&self, ip: u16) -> Option<&Instruction> {
        self.instructions
            .binary_search_by_key(&ip, |instr| instr.offset)
            .ok()
            .map(|index| &self.instructions[index])
    }
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("ordinal", &self.ordinal)
            .field("is_code", &self.is_code)
            .field("instructions", &self.instructions.len())
            .field("relocations", &self.relocations.len())
            .finish()
    }
}

/// The segment store.
#[derive(Default)]
pub struct Memory {
    segments: HashMap<u16, Segment>,
    host_memory_offset: usize,
}

impl Memory {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an empty, zero-filled data segment.
    pub fn reserve_segment(&mut self, ordinal: u16) -> Result<(), MemoryError> {
        self.register_segment(ordinal, &[], false, Vec::new())
    }

    /// Register a segment loaded from a module image.
    ///
    /// `data` is copied into a zero-filled 64KB buffer. Code segments are
    /// decoded from offset 0 across the supplied image; a decode failure
    /// rejects the whole segment.
    pub fn register_segment(
        &mut self,
        ordinal: u16,
        data: &[u8],
        is_code: bool,
        relocations: Vec<RelocationRecord>,
    ) -> Result<(), MemoryError> {
        if self.segments.contains_key(&ordinal) {
            return Err(MemoryError::DuplicateSegment(ordinal));
        }
        if data.len() > SEGMENT_SIZE {
            return Err(MemoryError::SegmentFault {
                segment: ordinal,
                offset: 0,
                len: data.len(),
            });
        }

        let mut buffer = vec![0u8; SEGMENT_SIZE].into_boxed_slice();
        buffer[..data.len()].copy_from_slice(data);

        let instructions = if is_code {
            decode::decode_segment(data).map_err(|source| MemoryError::MalformedCode {
                segment: ordinal,
                source,
            })?
        } else {
            Vec::new()
        };

        debug!(
            segment = ordinal,
            is_code,
            bytes = data.len(),
            instructions = instructions.len(),
            relocations = relocations.len(),
            "registered segment"
        );

        self.segments.insert(
            ordinal,
            Segment {
                ordinal,
                data: buffer,
                is_code,
                relocations,
                instructions,
            },
        );
        Ok(())
    }

    pub fn has_segment(&self, ordinal: u16) -> bool {
        self.segments.contains_key(&ordinal)
    }

    pub fn segment(&self, ordinal: u16) -> Option<&Segment> {
        self.segments.get(&ordinal)
    }

    /// Ordinals of every registered segment, ascending.
    pub fn segment_ordinals(&self) -> Vec<u16> {
        let mut ordinals: Vec<u16> = self.segments.keys().copied().collect();
        ordinals.sort_unstable();
        ordinals
    }

    fn span(&self, segment: u16, offset: u16, len: usize) -> Result<&[u8], MemoryError> {
        let fault = MemoryError::SegmentFault {
            segment,
            offset,
            len,
        };
        let start = offset as usize;
        let end = start + len;
        match self.segments.get(&segment) {
            Some(seg) if end <= SEGMENT_SIZE => Ok(&seg.data[start..end]),
            _ => Err(fault),
        }
    }

    fn span_mut(&mut self, segment: u16, offset: u16, len: usize) -> Result<&mut [u8], MemoryError> {
        let start = offset as usize;
        let end = start + len;
        match self.segments.get_mut(&segment) {
            Some(seg) if end <= SEGMENT_SIZE => Ok(&mut seg.data[start..end]),
            _ => Err(MemoryError::SegmentFault {
                segment,
                offset,
                len,
            }),
        }
    }

    pub fn read_byte(&self, segment: u16, offset: u16) -> Result<u8, MemoryError> {
        Ok(self.span(segment, offset, 1)?[0])
    }

    /// Read a little-endian word.
    pub fn read_word(&self, segment: u16, offset: u16) -> Result<u16, MemoryError> {
        let bytes = self.span(segment, offset, 2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    pub fn read_bytes(&self, segment: u16, offset: u16, count: usize) -> Result<&[u8], MemoryError> {
        self.span(segment, offset, count)
    }

    pub fn write_byte(&mut self, segment: u16, offset: u16, value: u8) -> Result<(), MemoryError> {
        self.span_mut(segment, offset, 1)?[0] = value;
        Ok(())
    }

    /// Write a little-endian word.
    pub fn write_word(&mut self, segment: u16, offset: u16, value: u16) -> Result<(), MemoryError> {
        self.span_mut(segment, offset, 2)?
            .copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    pub fn write_bytes(&mut self, segment: u16, offset: u16, bytes: &[u8]) -> Result<(), MemoryError> {
        self.span_mut(segment, offset, bytes.len())?
            .copy_from_slice(bytes);
        Ok(())
    }

    /// Read a NUL-terminated string, terminator included.
    pub fn read_string(&self, segment: u16, offset: u16) -> Result<&[u8], MemoryError> {
        // Offset 0xFFFF is the ceiling, never part of a string.
        let tail = self.span(segment, offset, 0xFFFF - offset as usize)?;
        match tail.iter().position(|&byte| byte == 0) {
            Some(nul) => Ok(&tail[..=nul]),
            None => Err(MemoryError::UnterminatedString { segment, offset }),
        }
    }

    /// The decoded instruction starting exactly at `segment:ip`.
    pub fn fetch(&self, segment: u16, ip: u16) -> Result<&Instruction, MemoryError> {
        let seg = self
            .segments
            .get(&segment)
            .ok_or(MemoryError::SegmentFault {
                segment,
                offset: ip,
                len: 1,
            })?;
        seg.instruction_at(ip)
            .ok_or(MemoryError::InvalidControlFlow { segment, ip })
    }

    /// First relocation record of `segment` patching `offset`.
    pub fn find_relocation(&self, segment: u16, offset: u16) -> Option<&RelocationRecord> {
        self.segments
            .get(&segment)?
            .relocations
            .iter()
            .find(|record| record.offset == offset)
    }

    /// Reserve `size` bytes in [`HOST_MEMORY_SEGMENT`].
    ///
    /// Returns the offset of the reservation. Space is never reclaimed.
    pub fn allocate_host_memory(&mut self, size: u16) -> Result<u16, MemoryError> {
        let offset = self.host_memory_offset;
        if offset >= SEGMENT_SIZE || offset + size as usize > SEGMENT_SIZE {
            return Err(MemoryError::SegmentFault {
                segment: HOST_MEMORY_SEGMENT,
                offset: offset.min(SEGMENT_SIZE - 1) as u16,
                len: size as usize,
            });
        }
        self.host_memory_offset += size as usize;

        debug!(size, offset, "allocated host memory");
        Ok(offset as u16)
    }

    /// Bytes handed out by [`Memory::allocate_host_memory`] so far.
    pub fn host_memory_used(&self) -> usize {
        self.host_memory_offset
    }
}

impl std::fmt::Debug for Memory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Memory")
            .field("segments", &self.segment_ordinals())
            .field("host_memory_used", &self.host_memory_offset)
            .finish()
    }
}

/// Errors that can occur during memory operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MemoryError {
    #[error("segment {0:#06x} is already registered")]
    DuplicateSegment(u16),

    #[error("segment fault: {len} byte(s) at {segment:04X}:{offset:04X}")]
    SegmentFault { segment: u16, offset: u16, len: usize },

    #[error("unterminated string at {segment:04X}:{offset:04X}")]
    UnterminatedString { segment: u16, offset: u16 },

    #[error("no instruction starts at {segment:04X}:{ip:04X}")]
    InvalidControlFlow { segment: u16, ip: u16 },

    #[error("malformed code in segment {segment:#06x}: {source}")]
    MalformedCode {
        segment: u16,
        #[source]
        source: DecodeError,
    },
}
