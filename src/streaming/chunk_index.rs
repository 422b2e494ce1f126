//! Chunk Index
//!
//! Describes how one generation's data blob is partitioned into
//! independently decodable chunks. The index is serialized as compact JSON:
//!
//! ```text
//! {"chunks":[{"first_record_offset":N,"num_records":N,"byte_offset":N,"byte_length":N}, ...]}
//! ```
//!
//! ## Invariants
//!
//! - Every chunk holds at least one record and at least one byte
//! - `chunk[i].first_record_offset + chunk[i].num_records == chunk[i+1].first_record_offset`
//! - Byte ranges tile `[0, total_bytes)` with no gaps or overlaps

use crate::streaming::SinkError;
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Location and record span of one chunk within a data blob
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMeta {
    /// Absolute offset of the first record in this chunk
    pub first_record_offset: u64,
    /// Number of records in this chunk
    pub num_records: u32,
    /// Position of the chunk's compressed bytes within the blob
    pub byte_offset: u64,
    /// Length of the chunk's compressed bytes
    pub byte_length: u32,
}

impl ChunkMeta {
    /// Offset of the record following this chunk
    pub fn next_record_offset(&self) -> u64 {
        self.first_record_offset + self.num_records as u64
    }

    /// End of this chunk's byte range (exclusive)
    pub fn byte_end(&self) -> u64 {
        self.byte_offset + self.byte_length as u64
    }

    pub fn byte_range(&self) -> Range<u64> {
        self.byte_offset..self.byte_end()
    }

    /// True if `offset` falls within this chunk's records
    pub fn contains_offset(&self, offset: u64) -> bool {
        offset >= self.first_record_offset && offset < self.next_record_offset()
    }
}

/// Ways a chunk list can violate the index invariants
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexViolation {
    /// Chunk holds no records
    NoRecords { chunk: usize },
    /// Chunk holds no bytes
    NoBytes { chunk: usize },
    /// First chunk does not start at byte 0
    NotAtOrigin { byte_offset: u64 },
    /// Record offsets are not contiguous
    OffsetGap {
        chunk: usize,
        expected: u64,
        actual: u64,
    },
    /// Byte ranges are not contiguous
    ByteGap {
        chunk: usize,
        expected: u64,
        actual: u64,
    },
    /// Offset or byte arithmetic overflows u64
    Overflow { chunk: usize },
}

impl std::fmt::Display for IndexViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IndexViolation::NoRecords { chunk } => write!(f, "chunk {} has no records", chunk),
            IndexViolation::NoBytes { chunk } => write!(f, "chunk {} has no bytes", chunk),
            IndexViolation::NotAtOrigin { byte_offset } => {
                write!(f, "first chunk starts at byte {}, not 0", byte_offset)
            }
            IndexViolation::OffsetGap {
                chunk,
                expected,
                actual,
            } => write!(
                f,
                "chunk {} starts at record {}, expected {}",
                chunk, actual, expected
            ),
            IndexViolation::ByteGap {
                chunk,
                expected,
                actual,
            } => write!(
                f,
                "chunk {} starts at byte {}, expected {}",
                chunk, actual, expected
            ),
            IndexViolation::Overflow { chunk } => write!(f, "chunk {} overflows u64", chunk),
        }
    }
}

/// Ordered chunk list for one generation's data blob
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkIndex {
    chunks: Vec<ChunkMeta>,
}

impl ChunkIndex {
    pub fn new() -> Self {
        ChunkIndex { chunks: Vec::new() }
    }

    /// Build an index from a chunk list, checking every invariant
    pub fn from_chunks(chunks: Vec<ChunkMeta>) -> Result<Self, IndexViolation> {
        let index = ChunkIndex { chunks };
        index.validate()?;
        Ok(index)
    }

    /// Append a chunk, rejecting it if it does not continue the index
    pub fn push(&mut self, meta: ChunkMeta) -> Result<(), IndexViolation> {
        let position = self.chunks.len();
        Self::check_chunk(self.chunks.last(), position, &meta)?;
        self.chunks.push(meta);

        #[cfg(debug_assertions)]
        self.verify_invariants();

        Ok(())
    }

    fn check_chunk(
        prev: Option<&ChunkMeta>,
        position: usize,
        meta: &ChunkMeta,
    ) -> Result<(), IndexViolation> {
        if meta.num_records == 0 {
            return Err(IndexViolation::NoRecords { chunk: position });
        }
        if meta.byte_length == 0 {
            return Err(IndexViolation::NoBytes { chunk: position });
        }
        if meta
            .first_record_offset
            .checked_add(meta.num_records as u64)
            .is_none()
            || meta.byte_offset.checked_add(meta.byte_length as u64).is_none()
        {
            return Err(IndexViolation::Overflow { chunk: position });
        }

        match prev {
            None => {
                if meta.byte_offset != 0 {
                    return Err(IndexViolation::NotAtOrigin {
                        byte_offset: meta.byte_offset,
                    });
                }
            }
            Some(prev) => {
                if meta.first_record_offset != prev.next_record_offset() {
                    return Err(IndexViolation::OffsetGap {
                        chunk: position,
                        expected: prev.next_record_offset(),
                        actual: meta.first_record_offset,
                    });
                }
                if meta.byte_offset != prev.byte_end() {
                    return Err(IndexViolation::ByteGap {
                        chunk: position,
                        expected: prev.byte_end(),
                        actual: meta.byte_offset,
                    });
                }
            }
        }
        Ok(())
    }

    /// Check ordering, contiguity and tiling of the whole chunk list
    pub fn validate(&self) -> Result<(), IndexViolation> {
        let mut prev = None;
        for (position, meta) in self.chunks.iter().enumerate() {
            Self::check_chunk(prev, position, meta)?;
            prev = Some(meta);
        }
        Ok(())
    }

    #[cfg(debug_assertions)]
    fn verify_invariants(&self) {
        debug_assert!(
            self.validate().is_ok(),
            "Invariant violated: chunk index must be contiguous: {:?}",
            self.validate()
        );
    }

    pub fn chunks(&self) -> &[ChunkMeta] {
        &self.chunks
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn first(&self) -> Option<&ChunkMeta> {
        self.chunks.first()
    }

    pub fn last(&self) -> Option<&ChunkMeta> {
        self.chunks.last()
    }

    /// Offset of the first record covered by the index
    pub fn start_offset(&self) -> Option<u64> {
        self.first().map(|c| c.first_record_offset)
    }

    /// Offset to resume from after this index
    pub fn next_offset(&self) -> Option<u64> {
        self.last().map(|c| c.next_record_offset())
    }

    /// Total records across all chunks
    pub fn total_records(&self) -> u64 {
        self.chunks.iter().map(|c| c.num_records as u64).sum()
    }

    /// Size of the data blob the index describes
    pub fn total_bytes(&self) -> u64 {
        self.last().map_or(0, |c| c.byte_end())
    }

    /// Find the chunk holding the record at `offset`
    pub fn chunk_containing(&self, offset: u64) -> Option<usize> {
        let pos = self
            .chunks
            .partition_point(|c| c.next_record_offset() <= offset);
        self.chunks
            .get(pos)
            .filter(|c| c.contains_offset(offset))
            .map(|_| pos)
    }

    /// Serialize to the compact JSON index artifact
    pub fn to_json(&self) -> Result<Vec<u8>, SinkError> {
        serde_json::to_vec(self)
            .map_err(|e| SinkError::SequenceInvariant(format!("index serialization: {}", e)))
    }

    /// Parse an index artifact, rejecting malformed JSON and invariant violations
    pub fn from_json(data: &[u8]) -> Result<Self, SinkError> {
        let index: ChunkIndex = serde_json::from_slice(data)
            .map_err(|e| SinkError::CorruptIndex(format!("unparseable index: {}", e)))?;
        index
            .validate()
            .map_err(|v| SinkError::CorruptIndex(v.to_string()))?;
        Ok(index)
    }
}
