//! Partition Pipeline
//!
//! Per-partition state machine wiring the block writer, uploader and offset
//! resolver together.
//!
//! ```text
//! Unopened ─open→ Idle ─write→ Writing ─commit→ Closing → Uploading → Pointing → Idle
//!                  ↑                                  │          │           │
//!                  └────────── failure: discard staging, rewind ─┴───────────┘
//! ```
//!
//! Only one generation per partition exists at a time; every method takes
//! `&mut self`. Resume state comes from the store, never from local files,
//! so a crash anywhere before the pointer update replays the whole pending
//! generation (at-least-once).

use crate::streaming::block_writer::{BlockWriter, StagedGeneration};
use crate::streaming::clock::{SinkClock, SystemClock};
use crate::streaming::config::{GenerationConfig, SinkConfig, WriterConfig};
use crate::streaming::keys::{PartitionKey, DATA_SUFFIX, INDEX_SUFFIX};
use crate::streaming::object_store::ObjectStore;
use crate::streaming::offset_resolver::OffsetResolver;
use crate::streaming::source::SourceRecord;
use crate::streaming::uploader::Uploader;
use crate::streaming::SinkError;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Pipeline lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// Resume offset not yet resolved
    Unopened,
    /// No generation in progress
    Idle,
    /// A generation is accepting records
    Writing,
    /// Finishing chunks and writing staged artifacts
    Closing,
    /// Transferring artifacts to the store
    Uploading,
    /// Publishing the resume pointer
    Pointing,
}

impl PipelineState {
    pub fn name(&self) -> &'static str {
        match self {
            PipelineState::Unopened => "Unopened",
            PipelineState::Idle => "Idle",
            PipelineState::Writing => "Writing",
            PipelineState::Closing => "Closing",
            PipelineState::Uploading => "Uploading",
            PipelineState::Pointing => "Pointing",
        }
    }
}

/// Result of a successful commit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitOutcome {
    pub start_offset: u64,
    pub next_offset: u64,
    pub records: u64,
    pub chunks: usize,
    pub index_key: String,
}

/// Write/commit state machine for one partition
pub struct PartitionPipeline<S: ObjectStore + Clone, C: SinkClock = SystemClock> {
    partition: PartitionKey,
    staging_dir: PathBuf,
    writer_config: WriterConfig,
    generation_config: GenerationConfig,
    uploader: Uploader<S, C>,
    resolver: OffsetResolver<S>,
    state: PipelineState,
    writer: Option<BlockWriter>,
    /// Offset following the last committed record
    committed_offset: u64,
    /// Set when pending records were discarded and must be re-delivered
    needs_rewind: bool,
}

impl<S: ObjectStore + Clone> PartitionPipeline<S, SystemClock> {
    pub fn new(partition: PartitionKey, store: S, config: &SinkConfig) -> Self {
        PartitionPipeline {
            partition,
            staging_dir: config.staging_dir.clone(),
            writer_config: config.writer.clone(),
            generation_config: config.generation.clone(),
            uploader: Uploader::new(store.clone(), &config.prefix),
            resolver: OffsetResolver::new(store, &config.prefix),
            state: PipelineState::Unopened,
            writer: None,
            committed_offset: 0,
            needs_rewind: false,
        }
    }
}

impl<S: ObjectStore + Clone, C: SinkClock> PartitionPipeline<S, C> {
    /// Replace the clock used to date uploaded keys
    pub fn with_clock<C2: SinkClock>(self, clock: C2) -> PartitionPipeline<S, C2> {
        PartitionPipeline {
            partition: self.partition,
            staging_dir: self.staging_dir,
            writer_config: self.writer_config,
            generation_config: self.generation_config,
            uploader: self.uploader.with_clock(clock),
            resolver: self.resolver,
            state: self.state,
            writer: self.writer,
            committed_offset: self.committed_offset,
            needs_rewind: self.needs_rewind,
        }
    }

    fn expect_state(&self, expected: &'static str, ok: bool) -> Result<(), SinkError> {
        if ok {
            Ok(())
        } else {
            Err(SinkError::InvalidState {
                expected,
                actual: self.state.name(),
            })
        }
    }

    /// Resolve the resume offset from the store and clear stale staging
    /// files left by a previous run. Returns the resume offset.
    pub async fn open(&mut self) -> Result<u64, SinkError> {
        self.expect_state(
            "Unopened or Idle",
            matches!(self.state, PipelineState::Unopened | PipelineState::Idle),
        )?;
        if let Some(writer) = self.writer.take() {
            writer.discard();
        }
        remove_stale_staging(&self.staging_dir, &self.partition)?;

        let offset = self.resolver.fetch_offset(&self.partition).await?;
        self.committed_offset = offset;
        self.needs_rewind = false;
        self.state = PipelineState::Idle;
        Ok(offset)
    }

    /// Append one record.
    ///
    /// Records below the next expected offset are already covered and are
    /// skipped (`Ok(false)`). A record past it is a `SequenceGap`.
    pub fn write(&mut self, record: &SourceRecord) -> Result<bool, SinkError> {
        self.expect_state(
            "Idle or Writing",
            matches!(self.state, PipelineState::Idle | PipelineState::Writing),
        )?;

        let expected = self.next_offset();
        if record.offset < expected {
            return Ok(false);
        }
        if record.offset > expected {
            return Err(SinkError::SequenceGap {
                expected,
                actual: record.offset,
            });
        }

        if self.writer.is_none() {
            self.writer = Some(BlockWriter::open(
                &self.staging_dir,
                self.partition.clone(),
                self.committed_offset,
                self.writer_config.clone(),
            )?);
            self.state = PipelineState::Writing;
        }
        let Some(writer) = self.writer.as_mut() else {
            return Err(SinkError::InvalidState {
                expected: "Writing",
                actual: self.state.name(),
            });
        };

        match writer.write(&record.payload) {
            Ok(()) => {
                self.needs_rewind = false;
                Ok(true)
            }
            Err(e @ SinkError::Staging(_)) => {
                self.fail_generation(&e);
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// True once the pending generation reached a commit threshold
    pub fn should_commit(&self) -> bool {
        self.writer.as_ref().is_some_and(|w| {
            w.records_written() >= self.generation_config.max_records
                || w.raw_bytes_written() >= self.generation_config.max_bytes
        })
    }

    /// Records written but not yet committed
    pub fn pending_records(&self) -> u64 {
        self.writer.as_ref().map_or(0, |w| w.records_written())
    }

    /// Close, upload and point at the pending generation.
    ///
    /// Returns `Ok(None)` if nothing is pending. On failure the generation is
    /// discarded and the pipeline rewinds to the last committed offset.
    pub async fn commit(&mut self) -> Result<Option<CommitOutcome>, SinkError> {
        self.expect_state(
            "Idle or Writing",
            matches!(self.state, PipelineState::Idle | PipelineState::Writing),
        )?;
        let Some(writer) = self.writer.take() else {
            return Ok(None);
        };
        if writer.records_written() == 0 {
            writer.discard();
            self.state = PipelineState::Idle;
            return Ok(None);
        }

        self.state = PipelineState::Closing;
        let staged = match writer.close() {
            Ok(staged) => staged,
            Err(e) => {
                self.fail_generation(&e);
                return Err(e);
            }
        };

        self.state = PipelineState::Uploading;
        let as_of = self.uploader.as_of();
        let uploaded = match self
            .uploader
            .upload_artifacts(&staged.data_path, &staged.index_path, &self.partition, as_of)
            .await
        {
            Ok(uploaded) => uploaded,
            Err(e) => {
                discard_staged(&staged);
                self.fail_generation(&e);
                return Err(e);
            }
        };

        self.state = PipelineState::Pointing;
        let committed = match self.uploader.publish_pointer(&uploaded).await {
            Ok(committed) => committed,
            Err(e) => {
                discard_staged(&staged);
                self.fail_generation(&e);
                return Err(e);
            }
        };

        if let Err(e) = staged.cleanup() {
            // Already durable; a leftover file is removed by the next open()
            warn!(
                stream = %self.partition.stream,
                partition = self.partition.partition,
                error = %e,
                "Failed to remove committed staging files"
            );
        }

        self.committed_offset = committed.next_offset;
        self.state = PipelineState::Idle;
        Ok(Some(CommitOutcome {
            start_offset: committed.start_offset,
            next_offset: committed.next_offset,
            records: committed.records,
            chunks: committed.chunks,
            index_key: committed.index_key,
        }))
    }

    /// Drop the pending generation without uploading it
    pub fn abort_generation(&mut self) {
        if let Some(writer) = self.writer.take() {
            if writer.records_written() > 0 {
                self.needs_rewind = true;
            }
            writer.discard();
        }
        if self.state != PipelineState::Unopened {
            self.state = PipelineState::Idle;
        }
    }

    fn fail_generation(&mut self, cause: &SinkError) {
        warn!(
            stream = %self.partition.stream,
            partition = self.partition.partition,
            state = self.state.name(),
            committed_offset = self.committed_offset,
            error = %cause,
            "Generation failed, rewinding to last committed offset"
        );
        if let Some(writer) = self.writer.take() {
            writer.discard();
        }
        self.needs_rewind = true;
        self.state = PipelineState::Idle;
    }

    /// If pending records were discarded, clear the flag and return the
    /// offset the source must be re-polled from
    pub fn take_rewind(&mut self) -> Option<u64> {
        if self.needs_rewind {
            self.needs_rewind = false;
            Some(self.committed_offset)
        } else {
            None
        }
    }

    pub fn needs_rewind(&self) -> bool {
        self.needs_rewind
    }

    /// Offset the next written record must carry
    pub fn next_offset(&self) -> u64 {
        self.writer
            .as_ref()
            .map_or(self.committed_offset, |w| w.next_offset())
    }

    pub fn committed_offset(&self) -> u64 {
        self.committed_offset
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn partition(&self) -> &PartitionKey {
        &self.partition
    }

    pub fn generation_config(&self) -> &GenerationConfig {
        &self.generation_config
    }
}

fn discard_staged(staged: &StagedGeneration) {
    if let Err(e) = staged.cleanup() {
        warn!(
            path = %staged.data_path.display(),
            error = %e,
            "Failed to remove staging files"
        );
    }
}

/// True for `<stem>-<12 digit start offset>` followed by a staging suffix.
///
/// Matching the exact shape keeps `bar`/0 away from `bar-00000`/1, whose
/// files also begin with `bar-00000-`.
fn is_staging_name(stem: &str, name: &str) -> bool {
    let Some(rest) = name
        .strip_suffix(DATA_SUFFIX)
        .or_else(|| name.strip_suffix(INDEX_SUFFIX))
    else {
        return false;
    };
    let Some(offset) = rest
        .strip_prefix(stem)
        .and_then(|r| r.strip_prefix('-'))
    else {
        return false;
    };
    offset.len() == 12 && offset.bytes().all(|b| b.is_ascii_digit())
}

/// Remove staged generations of `partition` left behind by a crash
fn remove_stale_staging(staging_dir: &Path, partition: &PartitionKey) -> Result<(), SinkError> {
    let entries = match std::fs::read_dir(staging_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(SinkError::staging(e)),
    };
    let stem = partition.file_stem();
    for entry in entries {
        let entry = entry.map_err(SinkError::staging)?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if is_staging_name(&stem, name) {
            debug!(path = %entry.path().display(), "Removing stale staging file");
            std::fs::remove_file(entry.path()).map_err(SinkError::staging)?;
        }
    }
    info!(
        stream = %partition.stream,
        partition = partition.partition,
        dir = %staging_dir.display(),
        "Cleared stale staging files"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::SimulatedRng;
    use crate::streaming::block_reader::BlockReader;
    use crate::streaming::chunk_index::ChunkIndex;
    use crate::streaming::keys::data_key_for_index;
    use crate::streaming::simulated_store::{
        ScriptedFault, SimulatedObjectStore, SimulatedStoreConfig, StoreOp,
    };
    use crate::streaming::InMemoryObjectStore;

    fn tp() -> PartitionKey {
        PartitionKey::new("bar", 0)
    }

    fn rec(offset: u64) -> SourceRecord {
        SourceRecord::new(offset, format!("record-{}", offset))
    }

    #[tokio::test]
    async fn test_write_commit_resume() {
        let dir = tempfile::tempdir().unwrap();
        let store = InMemoryObjectStore::new();
        let config = SinkConfig::test(dir.path().to_path_buf());

        let mut pipeline = PartitionPipeline::new(tp(), store.clone(), &config);
        assert_eq!(pipeline.open().await.unwrap(), 0);
        for i in 0..30 {
            assert!(pipeline.write(&rec(i)).unwrap());
        }
        assert_eq!(pipeline.state(), PipelineState::Writing);

        let outcome = pipeline.commit().await.unwrap().unwrap();
        assert_eq!(outcome.start_offset, 0);
        assert_eq!(outcome.next_offset, 30);
        assert_eq!(outcome.records, 30);
        assert_eq!(pipeline.state(), PipelineState::Idle);

        // Staging is cleaned up
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);

        // Stored blob decodes to what was written
        let index = ChunkIndex::from_json(&store.get(&outcome.index_key).await.unwrap()).unwrap();
        let blob = store
            .get(&data_key_for_index(&outcome.index_key).unwrap())
            .await
            .unwrap();
        let records = BlockReader::new(config.writer.framing)
            .read_all(&blob, &index)
            .unwrap();
        assert_eq!(records, (0..30).map(rec).collect::<Vec<_>>());

        // A fresh pipeline resumes after the commit
        let mut restarted = PartitionPipeline::new(tp(), store, &config);
        assert_eq!(restarted.open().await.unwrap(), 30);
    }

    #[tokio::test]
    async fn test_skips_replayed_and_rejects_gaps() {
        let dir = tempfile::tempdir().unwrap();
        let config = SinkConfig::test(dir.path().to_path_buf());
        let mut pipeline = PartitionPipeline::new(tp(), InMemoryObjectStore::new(), &config);
        pipeline.open().await.unwrap();

        assert!(pipeline.write(&rec(0)).unwrap());
        assert!(!pipeline.write(&rec(0)).unwrap());
        assert!(matches!(
            pipeline.write(&rec(5)),
            Err(SinkError::SequenceGap { expected: 1, actual: 5 })
        ));
        assert!(pipeline.write(&rec(1)).unwrap());
        assert_eq!(pipeline.pending_records(), 2);
    }

    #[tokio::test]
    async fn test_write_before_open_is_invalid_state() {
        let dir = tempfile::tempdir().unwrap();
        let config = SinkConfig::test(dir.path().to_path_buf());
        let mut pipeline = PartitionPipeline::new(tp(), InMemoryObjectStore::new(), &config);
        assert!(matches!(
            pipeline.write(&rec(0)),
            Err(SinkError::InvalidState { actual: "Unopened", .. })
        ));
    }

    #[tokio::test]
    async fn test_should_commit_thresholds() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = SinkConfig::test(dir.path().to_path_buf());
        config.generation.max_records = 5;
        let mut pipeline = PartitionPipeline::new(tp(), InMemoryObjectStore::new(), &config);
        pipeline.open().await.unwrap();

        for i in 0..4 {
            pipeline.write(&rec(i)).unwrap();
            assert!(!pipeline.should_commit());
        }
        pipeline.write(&rec(4)).unwrap();
        assert!(pipeline.should_commit());
    }

    #[tokio::test]
    async fn test_commit_with_nothing_pending() {
        let dir = tempfile::tempdir().unwrap();
        let config = SinkConfig::test(dir.path().to_path_buf());
        let store = SimulatedObjectStore::new(
            InMemoryObjectStore::new(),
            SimulatedRng::new(1),
            SimulatedStoreConfig::no_faults(),
        );
        let mut pipeline = PartitionPipeline::new(tp(), store.clone(), &config);
        pipeline.open().await.unwrap();
        store.reset_stats();

        assert_eq!(pipeline.commit().await.unwrap(), None);
        assert!(store.calls().is_empty());
    }

    #[tokio::test]
    async fn test_failed_commit_rewinds() {
        let dir = tempfile::tempdir().unwrap();
        let config = SinkConfig::test(dir.path().to_path_buf());
        let inner = InMemoryObjectStore::new();
        let store = SimulatedObjectStore::new(
            inner.clone(),
            SimulatedRng::new(1),
            // Completes 0 and 1 belong to the first commit; fail the second
            // commit's index completion
            SimulatedStoreConfig::scripted(vec![ScriptedFault {
                op: StoreOp::Complete,
                nth: 3,
            }]),
        );

        let mut pipeline = PartitionPipeline::new(tp(), store, &config);
        pipeline.open().await.unwrap();
        for i in 0..10 {
            pipeline.write(&rec(i)).unwrap();
        }
        pipeline.commit().await.unwrap();
        for i in 10..20 {
            pipeline.write(&rec(i)).unwrap();
        }
        assert!(pipeline.commit().await.is_err());

        assert_eq!(pipeline.state(), PipelineState::Idle);
        assert_eq!(pipeline.next_offset(), 10);
        assert_eq!(pipeline.take_rewind(), Some(10));
        assert_eq!(pipeline.take_rewind(), None);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);

        // Re-delivered records commit on retry
        for i in 10..20 {
            assert!(pipeline.write(&rec(i)).unwrap());
        }
        let outcome = pipeline.commit().await.unwrap().unwrap();
        assert_eq!(outcome.start_offset, 10);
        assert_eq!(outcome.next_offset, 20);
        assert_eq!(inner.pending_uploads(), 0);
    }

    #[tokio::test]
    async fn test_abort_generation() {
        let dir = tempfile::tempdir().unwrap();
        let config = SinkConfig::test(dir.path().to_path_buf());
        let mut pipeline = PartitionPipeline::new(tp(), InMemoryObjectStore::new(), &config);
        pipeline.open().await.unwrap();
        pipeline.write(&rec(0)).unwrap();

        pipeline.abort_generation();
        assert_eq!(pipeline.state(), PipelineState::Idle);
        assert_eq!(pipeline.next_offset(), 0);
        assert!(pipeline.needs_rewind());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_open_clears_stale_staging() {
        let dir = tempfile::tempdir().unwrap();
        let config = SinkConfig::test(dir.path().to_path_buf());
        std::fs::write(dir.path().join("bar-00000-000000000007.gz"), b"junk").unwrap();
        std::fs::write(dir.path().join("bar-00000-000000000007.index.json"), b"{}").unwrap();
        std::fs::write(dir.path().join("bar-00001-000000000000.gz"), b"other").unwrap();

        let mut pipeline = PartitionPipeline::new(tp(), InMemoryObjectStore::new(), &config);
        pipeline.open().await.unwrap();

        let mut left: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        left.sort();
        assert_eq!(left, vec!["bar-00001-000000000000.gz".to_string()]);
    }

    #[tokio::test]
    async fn test_open_keeps_prefix_sharing_partition_staging() {
        let dir = tempfile::tempdir().unwrap();
        let config = SinkConfig::test(dir.path().to_path_buf());
        let store = InMemoryObjectStore::new();

        // "bar-00000"/1 stages as bar-00000-00001-<offset>, which starts with
        // "bar"/0's file stem
        let other = PartitionKey::new("bar-00000", 1);
        let mut first = PartitionPipeline::new(other.clone(), store.clone(), &config);
        first.open().await.unwrap();
        for i in 0..5 {
            first.write(&rec(i)).unwrap();
        }
        let staged = dir.path().join("bar-00000-00001-000000000000.gz");
        assert!(staged.exists());

        let mut second = PartitionPipeline::new(tp(), store.clone(), &config);
        second.open().await.unwrap();
        assert!(staged.exists());

        let outcome = first.commit().await.unwrap().unwrap();
        assert_eq!(outcome.next_offset, 5);
        let mut restarted = PartitionPipeline::new(other, store, &config);
        assert_eq!(restarted.open().await.unwrap(), 5);
    }

    #[test]
    fn test_staging_name_shape() {
        assert!(is_staging_name("bar-00000", "bar-00000-000000000007.gz"));
        assert!(is_staging_name("bar-00000", "bar-00000-000000000007.index.json"));
        assert!(!is_staging_name("bar-00000", "bar-00000-00001-000000000000.gz"));
        assert!(!is_staging_name("bar-00000", "bar-00000-00001-000000000000.index.json"));
        assert!(!is_staging_name("bar-00000", "bar-00000-00000000000x.gz"));
        assert!(!is_staging_name("bar-00000", "bar-00000-000000000007.txt"));
        assert!(!is_staging_name("bar-00000", "bar-00001-000000000007.gz"));
    }
}
