//! Block Reader
//!
//! Decodes chunks of a data blob back into records. Each chunk is a single
//! gzip member, so any chunk can be read on its own given its byte range
//! from the `ChunkIndex`; `read_from_offset` uses this to skip every chunk
//! before the target offset without decompressing it.

use crate::streaming::chunk_index::{ChunkIndex, ChunkMeta};
use crate::streaming::config::RecordFraming;
use crate::streaming::source::SourceRecord;
use crate::streaming::SinkError;
use flate2::bufread::GzDecoder;
use std::io::Read;

/// Decodes chunks written by `BlockWriter`
#[derive(Debug, Clone, Copy)]
pub struct BlockReader {
    framing: RecordFraming,
}

impl BlockReader {
    pub fn new(framing: RecordFraming) -> Self {
        BlockReader { framing }
    }

    /// Decode the chunk described by `meta` from `blob`
    pub fn read_chunk(&self, blob: &[u8], meta: &ChunkMeta) -> Result<Vec<SourceRecord>, SinkError> {
        let start = usize::try_from(meta.byte_offset)
            .map_err(|_| SinkError::CorruptChunk("byte_offset out of range".to_string()))?;
        let end = start
            .checked_add(meta.byte_length as usize)
            .ok_or_else(|| SinkError::CorruptChunk("byte range overflows".to_string()))?;
        let bytes = blob.get(start..end).ok_or_else(|| {
            SinkError::CorruptChunk(format!(
                "chunk [{}, {}) outside blob of {} bytes",
                start,
                end,
                blob.len()
            ))
        })?;

        let payloads = self.decode_member(bytes)?;
        if payloads.len() as u64 != meta.num_records as u64 {
            return Err(SinkError::CorruptChunk(format!(
                "chunk at {} holds {} records, index says {}",
                meta.first_record_offset,
                payloads.len(),
                meta.num_records
            )));
        }

        Ok(payloads
            .into_iter()
            .enumerate()
            .map(|(i, payload)| SourceRecord {
                offset: meta.first_record_offset + i as u64,
                payload,
            })
            .collect())
    }

    /// Decode every chunk in index order
    pub fn read_all(&self, blob: &[u8], index: &ChunkIndex) -> Result<Vec<SourceRecord>, SinkError> {
        // Counts come from the index, which may be corrupt; grow as chunks decode
        let mut records = Vec::new();
        for meta in index.chunks() {
            records.extend(self.read_chunk(blob, meta)?);
        }
        Ok(records)
    }

    /// Decode records at or after `offset`, skipping whole chunks before it
    pub fn read_from_offset(
        &self,
        blob: &[u8],
        index: &ChunkIndex,
        offset: u64,
    ) -> Result<Vec<SourceRecord>, SinkError> {
        let first = match index.chunk_containing(offset) {
            Some(i) => i,
            None if index.start_offset().is_some_and(|s| offset < s) => 0,
            None => return Ok(Vec::new()),
        };

        let mut records = Vec::new();
        for meta in &index.chunks()[first..] {
            records.extend(
                self.read_chunk(blob, meta)?
                    .into_iter()
                    .filter(|r| r.offset >= offset),
            );
        }
        Ok(records)
    }

    /// Decompress exactly one gzip member and split it into records
    fn decode_member(&self, bytes: &[u8]) -> Result<Vec<Vec<u8>>, SinkError> {
        let mut decoder = GzDecoder::new(bytes);
        let mut raw = Vec::new();
        decoder
            .read_to_end(&mut raw)
            .map_err(|e| SinkError::CorruptChunk(format!("gzip decode failed: {}", e)))?;
        if !decoder.into_inner().is_empty() {
            return Err(SinkError::CorruptChunk(
                "trailing bytes after gzip member".to_string(),
            ));
        }

        match self.framing {
            RecordFraming::Newline => split_lines(&raw),
            RecordFraming::LengthPrefixed => split_length_prefixed(&raw),
        }
    }
}

fn split_lines(raw: &[u8]) -> Result<Vec<Vec<u8>>, SinkError> {
    if raw.is_empty() {
        return Ok(Vec::new());
    }
    let body = raw
        .strip_suffix(b"\n")
        .ok_or_else(|| SinkError::CorruptChunk("last record is not terminated".to_string()))?;
    Ok(body.split(|b| *b == b'\n').map(|r| r.to_vec()).collect())
}

fn split_length_prefixed(mut raw: &[u8]) -> Result<Vec<Vec<u8>>, SinkError> {
    let mut records = Vec::new();
    while !raw.is_empty() {
        let (len_bytes, rest) = raw
            .split_first_chunk::<4>()
            .ok_or_else(|| SinkError::CorruptChunk("truncated length prefix".to_string()))?;
        let len = u32::from_le_bytes(*len_bytes) as usize;
        if rest.len() < len {
            return Err(SinkError::CorruptChunk(format!(
                "record of {} bytes truncated at {}",
                len,
                rest.len()
            )));
        }
        records.push(rest[..len].to_vec());
        raw = &rest[len..];
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::block_writer::BlockWriter;
    use crate::streaming::config::WriterConfig;
    use crate::streaming::keys::PartitionKey;

    fn stage(records: &[&[u8]], start: u64, config: WriterConfig) -> (Vec<u8>, ChunkIndex) {
        let dir = tempfile::tempdir().unwrap();
        let mut writer =
            BlockWriter::open(dir.path(), PartitionKey::new("bar", 1), start, config).unwrap();
        for r in records {
            writer.write(r).unwrap();
        }
        let staged = writer.close().unwrap();
        (std::fs::read(&staged.data_path).unwrap(), staged.index)
    }

    #[test]
    fn test_read_all_reconstructs_records() {
        let input: Vec<Vec<u8>> = (0..200)
            .map(|i| format!("payload {} {}", i, "z".repeat(i % 40)).into_bytes())
            .collect();
        let refs: Vec<&[u8]> = input.iter().map(|r| r.as_slice()).collect();
        let (blob, index) = stage(&refs, 500, WriterConfig::test().with_threshold(1));
        assert!(index.len() > 1);

        let records = BlockReader::new(RecordFraming::Newline)
            .read_all(&blob, &index)
            .unwrap();
        assert_eq!(records.len(), 200);
        for (i, r) in records.iter().enumerate() {
            assert_eq!(r.offset, 500 + i as u64);
            assert_eq!(r.payload, input[i]);
        }
    }

    #[test]
    fn test_empty_records_survive_newline_framing() {
        let (blob, index) = stage(&[b"", b"x", b""], 0, WriterConfig::test());
        let records = BlockReader::new(RecordFraming::Newline)
            .read_all(&blob, &index)
            .unwrap();
        let payloads: Vec<&[u8]> = records.iter().map(|r| r.payload.as_slice()).collect();
        assert_eq!(payloads, vec![&b""[..], &b"x"[..], &b""[..]]);
    }

    #[test]
    fn test_read_from_offset_skips_chunks() {
        let input: Vec<Vec<u8>> = (0..100).map(|i| format!("r{:03}", i).into_bytes()).collect();
        let refs: Vec<&[u8]> = input.iter().map(|r| r.as_slice()).collect();
        let (blob, index) = stage(&refs, 1000, WriterConfig::test().with_threshold(1));
        let reader = BlockReader::new(RecordFraming::Newline);

        let tail = reader.read_from_offset(&blob, &index, 1042).unwrap();
        assert_eq!(tail.len(), 58);
        assert_eq!(tail[0].offset, 1042);
        assert_eq!(tail[0].payload, b"r042");

        assert_eq!(reader.read_from_offset(&blob, &index, 0).unwrap().len(), 100);
        assert!(reader.read_from_offset(&blob, &index, 1100).unwrap().is_empty());
    }

    #[test]
    fn test_skipped_chunks_are_not_decoded() {
        let input: Vec<Vec<u8>> = (0..40).map(|i| format!("r{:03}", i).into_bytes()).collect();
        let refs: Vec<&[u8]> = input.iter().map(|r| r.as_slice()).collect();
        let (mut blob, index) = stage(&refs, 0, WriterConfig::test().with_threshold(1));
        let first = *index.first().unwrap();
        let last = *index.last().unwrap();

        // Corrupt the first chunk; reading the tail must not touch it
        blob[first.byte_offset as usize + 12] ^= 0xff;
        let reader = BlockReader::new(RecordFraming::Newline);
        let tail = reader
            .read_from_offset(&blob, &index, last.first_record_offset)
            .unwrap();
        assert_eq!(tail.len(), last.num_records as usize);
        assert!(reader.read_all(&blob, &index).is_err());
    }

    #[test]
    fn test_count_mismatch_is_corrupt() {
        let (blob, index) = stage(&[b"a", b"b"], 0, WriterConfig::test());
        let mut meta = *index.first().unwrap();
        meta.num_records = 3;
        assert!(matches!(
            BlockReader::new(RecordFraming::Newline).read_chunk(&blob, &meta),
            Err(SinkError::CorruptChunk(_))
        ));
    }

    #[test]
    fn test_forged_record_counts_are_corrupt() {
        // Four copies of a two-record member, each claiming u32::MAX records
        let (member, _) = stage(&[b"a", b"b"], 0, WriterConfig::test());
        let blob = member.repeat(4);
        let mut index = ChunkIndex::new();
        for i in 0..4u64 {
            index
                .push(ChunkMeta {
                    first_record_offset: i * u32::MAX as u64,
                    num_records: u32::MAX,
                    byte_offset: i * member.len() as u64,
                    byte_length: member.len() as u32,
                })
                .unwrap();
        }
        assert_eq!(index.total_records(), 4 * u32::MAX as u64);
        assert!(matches!(
            BlockReader::new(RecordFraming::Newline).read_all(&blob, &index),
            Err(SinkError::CorruptChunk(_))
        ));
    }

    #[test]
    fn test_range_outside_blob_is_corrupt() {
        let (blob, index) = stage(&[b"a"], 0, WriterConfig::test());
        let mut meta = *index.first().unwrap();
        meta.byte_length += 10;
        assert!(matches!(
            BlockReader::new(RecordFraming::Newline).read_chunk(&blob, &meta),
            Err(SinkError::CorruptChunk(_))
        ));
    }

    #[test]
    fn test_split_length_prefixed_truncated() {
        assert!(split_length_prefixed(&[1, 0]).is_err());
        assert!(split_length_prefixed(&[5, 0, 0, 0, b'a']).is_err());
        assert_eq!(
            split_length_prefixed(&[1, 0, 0, 0, b'a']).unwrap(),
            vec![b"a".to_vec()]
        );
    }
}
