//! Block Writer
//!
//! Buffers one generation of records for a partition into a staged data file
//! made of independently decodable gzip members ("chunks"), and builds the
//! `ChunkIndex` describing where each chunk lives.
//!
//! ## Layout
//!
//! ```text
//! data file:  [gzip member 0][gzip member 1]...[gzip member N-1]
//! index file: {"chunks":[{chunk 0 meta}, ..., {chunk N-1 meta}]}
//! ```
//!
//! A chunk is finished once the compressed bytes it has flushed to the data
//! file reach `chunk_threshold_bytes`. The deflate stream emits output a block
//! at a time, so the flushed count trails the member's final size and every
//! finished chunk ends up at least as large as the threshold. The gzip header
//! is flushed as soon as a member opens, so a threshold at or below its ten
//! bytes closes every chunk after a single record.
//!
//! The check runs after each complete record, so a record is never split
//! across chunks; an oversized record simply makes its chunk larger.

use crate::streaming::chunk_index::{ChunkIndex, ChunkMeta};
use crate::streaming::config::{RecordFraming, WriterConfig};
use crate::streaming::keys::{staging_paths, PartitionKey};
use crate::streaming::SinkError;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Writer adapter that counts bytes passed through to the inner writer
#[derive(Debug)]
struct CountingWriter<W> {
    inner: W,
    count: u64,
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.count += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

type DataSink = CountingWriter<BufWriter<File>>;

/// Compressor state for the current chunk
enum ChunkState {
    /// Between chunks; the next record opens a new gzip member
    Idle(DataSink),
    /// A gzip member is open
    Open(GzEncoder<DataSink>),
    /// A previous I/O failure left the file in an unknown state
    Poisoned,
}

/// A closed generation waiting to be uploaded
#[derive(Debug, Clone)]
pub struct StagedGeneration {
    pub data_path: PathBuf,
    pub index_path: PathBuf,
    pub partition: PartitionKey,
    pub start_offset: u64,
    pub index: ChunkIndex,
}

impl StagedGeneration {
    /// Number of records in the generation
    pub fn records(&self) -> u64 {
        self.index.total_records()
    }

    /// Offset following the generation's last record
    pub fn next_offset(&self) -> u64 {
        self.start_offset + self.records()
    }

    /// Remove both staged files. Missing files are not an error.
    pub fn cleanup(&self) -> Result<(), SinkError> {
        remove_if_exists(&self.data_path)?;
        remove_if_exists(&self.index_path)
    }
}

fn remove_if_exists(path: &Path) -> Result<(), SinkError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(SinkError::staging(e)),
    }
}

/// Builds one generation's staged data file and chunk index
pub struct BlockWriter {
    partition: PartitionKey,
    start_offset: u64,
    config: WriterConfig,
    data_path: PathBuf,
    index_path: PathBuf,
    state: ChunkState,
    index: ChunkIndex,
    /// Records written in this generation, including the open chunk
    records_written: u64,
    /// Records in the open chunk
    chunk_records: u32,
    /// Uncompressed bytes (with framing) in the open chunk
    chunk_raw_bytes: u64,
    /// Uncompressed bytes (with framing) in this generation
    raw_bytes_written: u64,
    /// Data file position where the open chunk began
    chunk_start_byte: u64,
}

impl BlockWriter {
    /// Begin a generation at `start_offset`. Stale staging files with the
    /// same name are truncated.
    pub fn open(
        staging_dir: &Path,
        partition: PartitionKey,
        start_offset: u64,
        config: WriterConfig,
    ) -> Result<Self, SinkError> {
        std::fs::create_dir_all(staging_dir).map_err(SinkError::staging)?;
        let (data_path, index_path) = staging_paths(staging_dir, &partition, start_offset);
        let file = File::create(&data_path).map_err(SinkError::staging)?;

        debug!(
            stream = %partition.stream,
            partition = partition.partition,
            start_offset,
            path = %data_path.display(),
            "Opened block writer"
        );

        Ok(BlockWriter {
            partition,
            start_offset,
            config,
            data_path,
            index_path,
            state: ChunkState::Idle(CountingWriter {
                inner: BufWriter::new(file),
                count: 0,
            }),
            index: ChunkIndex::new(),
            records_written: 0,
            chunk_records: 0,
            chunk_raw_bytes: 0,
            raw_bytes_written: 0,
            chunk_start_byte: 0,
        })
    }

    /// TigerStyle: Verify all invariants hold
    ///
    /// # Invariants
    /// - finished chunks plus the open chunk account for every record
    /// - finished chunks tile the data file up to the open chunk's start
    /// - an idle writer has no pending chunk records
    #[cfg(debug_assertions)]
    fn verify_invariants(&self) {
        debug_assert_eq!(
            self.index.total_records() + self.chunk_records as u64,
            self.records_written,
            "Invariant violated: chunk records must sum to records written"
        );
        debug_assert_eq!(
            self.index.total_bytes(),
            self.chunk_start_byte,
            "Invariant violated: finished chunks must end where the open chunk starts"
        );
        if matches!(self.state, ChunkState::Idle(_)) {
            debug_assert_eq!(
                self.chunk_records, 0,
                "Invariant violated: idle writer has pending records"
            );
        }
    }

    /// Append one record to the current chunk
    pub fn write(&mut self, record: &[u8]) -> Result<(), SinkError> {
        self.check_record(record)?;

        let mut encoder = match std::mem::replace(&mut self.state, ChunkState::Poisoned) {
            ChunkState::Open(encoder) => encoder,
            ChunkState::Idle(sink) => {
                GzEncoder::new(sink, Compression::new(self.config.compression_level))
            }
            ChunkState::Poisoned => return Err(poisoned()),
        };

        let framed_len = match self.config.framing {
            RecordFraming::Newline => {
                encoder.write_all(record).map_err(SinkError::staging)?;
                encoder.write_all(b"\n").map_err(SinkError::staging)?;
                record.len() as u64 + 1
            }
            RecordFraming::LengthPrefixed => {
                // Length checked in check_record
                let len = record.len() as u32;
                encoder
                    .write_all(&len.to_le_bytes())
                    .map_err(SinkError::staging)?;
                encoder.write_all(record).map_err(SinkError::staging)?;
                record.len() as u64 + 4
            }
        };
        // Compressed bytes of this member already handed to the data file
        let flushed = encoder.get_ref().count - self.chunk_start_byte;
        self.state = ChunkState::Open(encoder);

        self.records_written += 1;
        self.chunk_records += 1;
        self.chunk_raw_bytes += framed_len;
        self.raw_bytes_written += framed_len;

        if flushed >= self.config.chunk_threshold_bytes || self.chunk_records == u32::MAX {
            self.finish_chunk()?;
        }

        #[cfg(debug_assertions)]
        self.verify_invariants();

        Ok(())
    }

    fn check_record(&self, record: &[u8]) -> Result<(), SinkError> {
        match self.config.framing {
            RecordFraming::Newline => {
                if record.contains(&b'\n') {
                    return Err(SinkError::InvalidRecord(
                        "record contains a newline".to_string(),
                    ));
                }
            }
            RecordFraming::LengthPrefixed => {
                if u32::try_from(record.len()).is_err() {
                    return Err(SinkError::InvalidRecord(format!(
                        "record of {} bytes exceeds u32 length prefix",
                        record.len()
                    )));
                }
            }
        }
        Ok(())
    }

    /// Finish the open gzip member and record its ChunkMeta
    fn finish_chunk(&mut self) -> Result<(), SinkError> {
        let encoder = match std::mem::replace(&mut self.state, ChunkState::Poisoned) {
            ChunkState::Open(encoder) => encoder,
            idle @ ChunkState::Idle(_) => {
                self.state = idle;
                return Ok(());
            }
            ChunkState::Poisoned => return Err(poisoned()),
        };
        let sink = encoder.finish().map_err(SinkError::staging)?;

        let byte_length = u32::try_from(sink.count - self.chunk_start_byte).map_err(|_| {
            SinkError::SequenceInvariant(format!(
                "chunk of {} bytes exceeds u32 byte_length",
                sink.count - self.chunk_start_byte
            ))
        })?;
        let meta = ChunkMeta {
            first_record_offset: self.start_offset + self.records_written
                - self.chunk_records as u64,
            num_records: self.chunk_records,
            byte_offset: self.chunk_start_byte,
            byte_length,
        };
        self.index
            .push(meta)
            .map_err(|v| SinkError::SequenceInvariant(v.to_string()))?;

        debug!(
            stream = %self.partition.stream,
            partition = self.partition.partition,
            first_record_offset = meta.first_record_offset,
            num_records = meta.num_records,
            byte_offset = meta.byte_offset,
            byte_length = meta.byte_length,
            raw_bytes = self.chunk_raw_bytes,
            "Finished chunk"
        );

        self.chunk_start_byte = sink.count;
        self.chunk_records = 0;
        self.chunk_raw_bytes = 0;
        self.state = ChunkState::Idle(sink);
        Ok(())
    }

    /// Finish any open chunk, write and fsync both artifacts.
    ///
    /// On failure the staged files are removed and the generation is lost.
    pub fn close(mut self) -> Result<StagedGeneration, SinkError> {
        match self.finish_files() {
            Ok(()) => Ok(StagedGeneration {
                data_path: self.data_path,
                index_path: self.index_path,
                partition: self.partition,
                start_offset: self.start_offset,
                index: self.index,
            }),
            Err(e) => {
                warn!(
                    stream = %self.partition.stream,
                    partition = self.partition.partition,
                    start_offset = self.start_offset,
                    error = %e,
                    "Failed to close generation, discarding staging files"
                );
                self.remove_files();
                Err(e)
            }
        }
    }

    fn finish_files(&mut self) -> Result<(), SinkError> {
        self.finish_chunk()?;

        let sink = match std::mem::replace(&mut self.state, ChunkState::Poisoned) {
            ChunkState::Idle(sink) => sink,
            // finish_chunk leaves the writer idle or returns an error
            ChunkState::Open(_) | ChunkState::Poisoned => return Err(poisoned()),
        };
        let file = sink
            .inner
            .into_inner()
            .map_err(|e| SinkError::staging(e.into_error()))?;
        file.sync_all().map_err(SinkError::staging)?;

        if sink.count != self.index.total_bytes() {
            return Err(SinkError::SequenceInvariant(format!(
                "data file holds {} bytes, index covers {}",
                sink.count,
                self.index.total_bytes()
            )));
        }
        self.index
            .validate()
            .map_err(|v| SinkError::SequenceInvariant(v.to_string()))?;

        let json = self.index.to_json()?;
        let mut index_file = File::create(&self.index_path).map_err(SinkError::staging)?;
        index_file.write_all(&json).map_err(SinkError::staging)?;
        index_file.sync_all().map_err(SinkError::staging)?;
        Ok(())
    }

    /// Abandon the generation and remove its staging files
    pub fn discard(mut self) {
        debug!(
            stream = %self.partition.stream,
            partition = self.partition.partition,
            start_offset = self.start_offset,
            records = self.records_written,
            "Discarding generation"
        );
        // Drop the file handle before unlinking
        self.state = ChunkState::Poisoned;
        self.remove_files();
    }

    fn remove_files(&self) {
        for path in [&self.data_path, &self.index_path] {
            if let Err(e) = remove_if_exists(path) {
                warn!(path = %path.display(), error = %e, "Failed to remove staging file");
            }
        }
    }

    pub fn partition(&self) -> &PartitionKey {
        &self.partition
    }

    pub fn start_offset(&self) -> u64 {
        self.start_offset
    }

    /// Records written so far in this generation
    pub fn records_written(&self) -> u64 {
        self.records_written
    }

    /// Offset the next record must carry
    pub fn next_offset(&self) -> u64 {
        self.start_offset + self.records_written
    }

    /// Uncompressed bytes (with framing) written so far
    pub fn raw_bytes_written(&self) -> u64 {
        self.raw_bytes_written
    }

    /// Chunks finished so far (the open chunk is not included)
    pub fn index(&self) -> &ChunkIndex {
        &self.index
    }

    pub fn data_path(&self) -> &Path {
        &self.data_path
    }

    pub fn index_path(&self) -> &Path {
        &self.index_path
    }
}

fn poisoned() -> SinkError {
    SinkError::staging(std::io::Error::new(
        ErrorKind::Other,
        "block writer unusable after an earlier I/O failure",
    ))
}
