//! Deterministic Simulation Testing for the sink
//!
//! Shadow-state harness driving one partition pipeline against a
//! fault-injecting store:
//! - Deterministic random workload generation
//! - Fault injection at the object store layer
//! - Crash/restart at arbitrary points
//! - Invariant checking against the shadow source log
//! - Seed-based reproducibility for debugging
//!
//! ```text
//! for seed in 0..N {
//!     let mut harness = SinkDSTHarness::new(SinkDSTConfig::moderate(seed), dir);
//!     harness.run(200).await;
//!     harness.check_invariants().await;  // violations carry the seed
//! }
//! ```

use crate::io::{Rng, SimulatedRng};
use crate::streaming::block_reader::BlockReader;
use crate::streaming::chunk_index::ChunkIndex;
use crate::streaming::clock::SimulatedClock;
use crate::streaming::config::{GenerationConfig, SinkConfig, WriterConfig};
use crate::streaming::keys::{data_key_for_index, KeyBuilder, PartitionKey};
use crate::streaming::object_store::{InMemoryObjectStore, ObjectStore};
use crate::streaming::pipeline::{CommitOutcome, PartitionPipeline};
use crate::streaming::simulated_store::{
    SimulatedObjectStore, SimulatedStoreConfig, SimulatedStoreStats,
};
use crate::streaming::source::SourceRecord;
use chrono::NaiveDate;
use std::path::{Path, PathBuf};

const OPEN_ATTEMPTS: usize = 20;
const FINAL_COMMIT_ATTEMPTS: usize = 20;

/// Configuration for sink DST
#[derive(Debug, Clone)]
pub struct SinkDSTConfig {
    /// Random seed for reproducibility
    pub seed: u64,
    /// Object store fault configuration
    pub store_config: SimulatedStoreConfig,
    pub writer_config: WriterConfig,
    pub generation_config: GenerationConfig,
    /// Prefix for object keys
    pub prefix: String,
    /// Probability of an explicit commit (vs write)
    pub commit_probability: f64,
    /// Probability of crash/restart
    pub crash_probability: f64,
    /// Probability the simulated date moves forward a day
    pub day_advance_probability: f64,
    /// Upper bound on records appended per write operation
    pub max_batch: u64,
    /// Upper bound on payload filler length
    pub max_payload_len: u64,
}

impl Default for SinkDSTConfig {
    fn default() -> Self {
        SinkDSTConfig {
            seed: 0,
            store_config: SimulatedStoreConfig::default(),
            // Below the gzip header size: one record per chunk, many parts per upload
            writer_config: WriterConfig::test().with_threshold(8),
            generation_config: GenerationConfig {
                max_records: 40,
                max_bytes: 4 * 1024,
                poll_batch_size: 16,
            },
            prefix: "dst".to_string(),
            commit_probability: 0.1,
            crash_probability: 0.05,
            day_advance_probability: 0.02,
            max_batch: 12,
            max_payload_len: 64,
        }
    }
}

impl SinkDSTConfig {
    pub fn new(seed: u64) -> Self {
        SinkDSTConfig {
            seed,
            ..Default::default()
        }
    }

    /// No faults
    pub fn calm(seed: u64) -> Self {
        SinkDSTConfig {
            seed,
            store_config: SimulatedStoreConfig::no_faults(),
            crash_probability: 0.0,
            ..Default::default()
        }
    }

    /// Frequent store faults and crashes
    pub fn chaos(seed: u64) -> Self {
        SinkDSTConfig {
            seed,
            store_config: SimulatedStoreConfig::high_chaos(),
            // One chunk per generation, or part failures sink nearly every commit
            writer_config: WriterConfig::test().with_threshold(64 * 1024),
            crash_probability: 0.1,
            ..Default::default()
        }
    }

    pub fn moderate(seed: u64) -> Self {
        SinkDSTConfig {
            seed,
            store_config: SimulatedStoreConfig::default(),
            crash_probability: 0.05,
            ..Default::default()
        }
    }
}

/// Operations the workload can issue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkOperation {
    /// Append records to the source and feed them to the pipeline
    Write { count: u64 },
    /// Commit whatever is pending
    Commit,
    /// Drop the pipeline without cleanup and start a fresh one
    CrashRestart,
    /// Move the simulated date forward
    AdvanceDay,
}

/// Result of a DST run
#[derive(Debug, Clone)]
pub struct SinkDSTResult {
    pub seed: u64,
    pub total_operations: u64,
    pub successful_operations: u64,
    /// Failed operations (expected under faults)
    pub failed_operations: u64,
    pub commits: u64,
    pub failed_commits: u64,
    pub crashes: u64,
    /// Records appended to the shadow source
    pub records_produced: u64,
    /// Offset covered by the last successful commit
    pub committed_offset: u64,
    pub store_stats: SimulatedStoreStats,
    pub invariant_violations: Vec<String>,
}

impl SinkDSTResult {
    pub fn new(seed: u64) -> Self {
        SinkDSTResult {
            seed,
            total_operations: 0,
            successful_operations: 0,
            failed_operations: 0,
            commits: 0,
            failed_commits: 0,
            crashes: 0,
            records_produced: 0,
            committed_offset: 0,
            store_stats: SimulatedStoreStats::default(),
            invariant_violations: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.invariant_violations.is_empty()
    }

    pub fn summary(&self) -> String {
        format!(
            "Seed {}: {} ops ({} ok, {} failed), {} commits ({} failed), {} crashes, {}/{} records committed, {} violations",
            self.seed,
            self.total_operations,
            self.successful_operations,
            self.failed_operations,
            self.commits,
            self.failed_commits,
            self.crashes,
            self.committed_offset,
            self.records_produced,
            self.invariant_violations.len()
        )
    }
}

type DSTStore = SimulatedObjectStore<InMemoryObjectStore, SimulatedRng>;

/// DST harness for a single partition
pub struct SinkDSTHarness {
    config: SinkDSTConfig,
    sink_config: SinkConfig,
    partition: PartitionKey,
    rng: SimulatedRng,
    store: DSTStore,
    inner_store: InMemoryObjectStore,
    clock: SimulatedClock,
    pipeline: PartitionPipeline<DSTStore, SimulatedClock>,
    opened: bool,
    /// Shadow source log; offset == index
    source: Vec<Vec<u8>>,
    /// Successful commits in order
    committed: Vec<CommitOutcome>,
    result: SinkDSTResult,
}

impl SinkDSTHarness {
    /// Create a harness staging under `staging_dir`
    pub fn new(config: SinkDSTConfig, staging_dir: PathBuf) -> Self {
        let inner_store = InMemoryObjectStore::new();
        let store = SimulatedObjectStore::new(
            inner_store.clone(),
            SimulatedRng::new(config.seed.wrapping_add(1)), // Different seed for store
            config.store_config.clone(),
        );
        let sink_config = SinkConfig {
            prefix: config.prefix.clone(),
            writer: config.writer_config.clone(),
            generation: config.generation_config.clone(),
            ..SinkConfig::test(staging_dir)
        };
        let clock = SimulatedClock::new(
            NaiveDate::from_ymd_opt(2026, 3, 7).unwrap_or(NaiveDate::MIN),
        );
        let partition = PartitionKey::new("dst", (config.seed % 8) as u32);
        let pipeline = PartitionPipeline::new(partition.clone(), store.clone(), &sink_config)
            .with_clock(clock.clone());

        SinkDSTHarness {
            rng: SimulatedRng::new(config.seed),
            result: SinkDSTResult::new(config.seed),
            config,
            sink_config,
            partition,
            store,
            inner_store,
            clock,
            pipeline,
            opened: false,
            source: Vec::new(),
            committed: Vec::new(),
        }
    }

    /// Run the workload for a number of operations
    pub async fn run(&mut self, operations: usize) {
        for _ in 0..operations {
            let op = self.next_operation();
            self.execute_operation(op).await;
        }
    }

    fn next_operation(&mut self) -> SinkOperation {
        if self.rng.gen_bool(self.config.crash_probability) {
            SinkOperation::CrashRestart
        } else if self.rng.gen_bool(self.config.commit_probability) {
            SinkOperation::Commit
        } else if self.rng.gen_bool(self.config.day_advance_probability) {
            SinkOperation::AdvanceDay
        } else {
            SinkOperation::Write {
                count: self.rng.gen_range(1, self.config.max_batch.max(2)),
            }
        }
    }

    async fn execute_operation(&mut self, op: SinkOperation) {
        self.result.total_operations += 1;
        let ok = match op {
            SinkOperation::Write { count } => self.execute_write(count).await,
            SinkOperation::Commit => self.execute_commit().await,
            SinkOperation::CrashRestart => self.execute_crash_restart().await,
            SinkOperation::AdvanceDay => {
                self.clock.advance_days(1);
                true
            }
        };
        if ok {
            self.result.successful_operations += 1;
        } else {
            self.result.failed_operations += 1;
        }
    }

    async fn execute_write(&mut self, count: u64) -> bool {
        for _ in 0..count {
            let offset = self.source.len() as u64;
            let filler = self.rng.gen_range(0, self.config.max_payload_len.max(1));
            let mut payload = format!("seed{}-rec{}-", self.config.seed, offset).into_bytes();
            payload.extend(std::iter::repeat(b'x').take(filler as usize));
            self.source.push(payload);
            self.result.records_produced += 1;
        }

        if !self.feed().await {
            return false;
        }
        if self.pipeline.should_commit() {
            return self.execute_commit().await;
        }
        true
    }

    async fn execute_commit(&mut self) -> bool {
        if !self.ensure_open().await {
            return false;
        }
        match self.pipeline.commit().await {
            Ok(Some(outcome)) => {
                self.result.commits += 1;
                self.result.committed_offset = outcome.next_offset;
                self.committed.push(outcome);
                true
            }
            Ok(None) => true,
            Err(_) => {
                self.result.failed_commits += 1;
                match self.pipeline.take_rewind() {
                    Some(offset) if offset != self.result.committed_offset => {
                        self.violation(format!(
                            "rewind to {} after failed commit, last commit covers {}",
                            offset, self.result.committed_offset
                        ));
                    }
                    Some(_) => {}
                    None => self.violation("failed commit did not request a rewind".into()),
                }
                false
            }
        }
    }

    async fn execute_crash_restart(&mut self) -> bool {
        self.result.crashes += 1;
        // Dropping the old pipeline leaves its staging files behind
        let fresh = PartitionPipeline::new(
            self.partition.clone(),
            self.store.clone(),
            &self.sink_config,
        )
        .with_clock(self.clock.clone());
        self.pipeline = fresh;
        self.opened = false;
        self.ensure_open().await
    }

    /// Open the pipeline if needed, retrying transient store faults
    async fn ensure_open(&mut self) -> bool {
        if self.opened {
            return true;
        }
        for _ in 0..OPEN_ATTEMPTS {
            if let Ok(offset) = self.pipeline.open().await {
                if offset != self.result.committed_offset {
                    self.violation(format!(
                        "resumed at {}, last commit covers {}",
                        offset, self.result.committed_offset
                    ));
                }
                self.opened = true;
                return true;
            }
        }
        false
    }

    /// Write every source record from the pipeline's next offset onward
    async fn feed(&mut self) -> bool {
        if !self.ensure_open().await {
            return false;
        }
        let start = self.pipeline.next_offset();
        for offset in start..self.source.len() as u64 {
            let record = SourceRecord::new(offset, self.source[offset as usize].clone());
            match self.pipeline.write(&record) {
                Ok(true) => {}
                Ok(false) => {
                    self.violation(format!("record {} skipped at its own offset", offset));
                    return false;
                }
                Err(e) => {
                    self.violation(format!("write of record {} failed: {}", offset, e));
                    return false;
                }
            }
        }
        true
    }

    fn violation(&mut self, message: String) {
        self.result
            .invariant_violations
            .push(format!("seed {}: {}", self.config.seed, message));
    }

    /// Drain pending records, restart, then check store state
    pub async fn check_invariants(&mut self) {
        for _ in 0..FINAL_COMMIT_ATTEMPTS {
            if self.feed().await && self.execute_commit().await {
                break;
            }
        }

        // Invariant 1: a restart resumes exactly after the last commit
        self.execute_crash_restart().await;

        // Invariant 2: the pointer names the last committed index
        self.check_pointer().await;

        // Invariant 3: committed generations tile the log and read back intact
        self.check_generations().await;

        // Invariant 4: no multipart upload outlives its commit attempt
        let pending = self.inner_store.pending_uploads();
        if pending > 0 {
            self.violation(format!("{} multipart uploads left open", pending));
        }

        self.result.store_stats = self.store.stats();
    }

    async fn check_pointer(&mut self) {
        let pointer_key = KeyBuilder::new(&self.config.prefix).pointer_key(&self.partition);
        let pointer = self.inner_store.get(&pointer_key).await.ok();
        let expected = self.committed.last().map(|c| c.index_key.clone());
        match (expected, pointer) {
            (None, None) => {}
            (None, Some(_)) => self.violation("pointer exists without a commit".into()),
            (Some(expected), None) => {
                self.violation(format!("pointer missing, expected {}", expected))
            }
            (Some(expected), Some(bytes)) => {
                if bytes != expected.as_bytes() {
                    let actual = String::from_utf8_lossy(&bytes).into_owned();
                    self.violation(format!("pointer names {}, expected {}", actual, expected));
                }
            }
        }
    }

    async fn check_generations(&mut self) {
        let reader = BlockReader::new(self.config.writer_config.framing);
        let mut expected_start = 0;
        let committed = self.committed.clone();

        for outcome in &committed {
            if outcome.start_offset != expected_start {
                self.violation(format!(
                    "generation {} starts at {}, expected {}",
                    outcome.index_key, outcome.start_offset, expected_start
                ));
            }
            expected_start = outcome.next_offset;

            if let Err(message) = self.read_generation(&reader, outcome).await {
                self.violation(message);
            }
        }
    }

    async fn read_generation(
        &self,
        reader: &BlockReader,
        outcome: &CommitOutcome,
    ) -> Result<(), String> {
        let index_bytes = self
            .inner_store
            .get(&outcome.index_key)
            .await
            .map_err(|e| format!("index {} unreadable: {}", outcome.index_key, e))?;
        let index = ChunkIndex::from_json(&index_bytes)
            .map_err(|e| format!("index {} invalid: {}", outcome.index_key, e))?;
        let data_key = data_key_for_index(&outcome.index_key)
            .ok_or_else(|| format!("{} is not an index key", outcome.index_key))?;
        let blob = self
            .inner_store
            .get(&data_key)
            .await
            .map_err(|e| format!("data {} unreadable: {}", data_key, e))?;

        let records = reader
            .read_all(&blob, &index)
            .map_err(|e| format!("data {} undecodable: {}", data_key, e))?;
        if records.len() as u64 != outcome.records {
            return Err(format!(
                "{} holds {} records, commit reported {}",
                data_key,
                records.len(),
                outcome.records
            ));
        }
        for (i, record) in records.iter().enumerate() {
            let offset = outcome.start_offset + i as u64;
            if record.offset != offset {
                return Err(format!(
                    "{} record {} carries offset {}",
                    data_key, offset, record.offset
                ));
            }
            if self.source.get(offset as usize) != Some(&record.payload) {
                return Err(format!("{} record {} payload differs", data_key, offset));
            }
        }
        Ok(())
    }

    pub fn result(&self) -> &SinkDSTResult {
        &self.result
    }

    pub fn into_result(self) -> SinkDSTResult {
        self.result
    }
}

/// Run a batch of DST runs with consecutive seeds, each staging in its own
/// directory under `staging_root`
pub async fn run_dst_batch(
    base_seed: u64,
    count: usize,
    ops_per_run: usize,
    staging_root: &Path,
    config_fn: impl Fn(u64) -> SinkDSTConfig,
) -> Vec<SinkDSTResult> {
    let mut results = Vec::with_capacity(count);

    for i in 0..count {
        let seed = base_seed + i as u64;
        let staging_dir = staging_root.join(format!("seed-{}", seed));

        let mut harness = SinkDSTHarness::new(config_fn(seed), staging_dir);
        harness.run(ops_per_run).await;
        harness.check_invariants().await;

        results.push(harness.into_result());
    }

    results
}

/// Summary of batch results
pub fn summarize_batch(results: &[SinkDSTResult]) -> String {
    let total = results.len();
    let passed = results.iter().filter(|r| r.is_success()).count();
    let failed_seeds: Vec<u64> = results
        .iter()
        .filter(|r| !r.is_success())
        .map(|r| r.seed)
        .collect();

    let total_ops: u64 = results.iter().map(|r| r.total_operations).sum();
    let total_commits: u64 = results.iter().map(|r| r.commits).sum();
    let total_failed_commits: u64 = results.iter().map(|r| r.failed_commits).sum();
    let total_crashes: u64 = results.iter().map(|r| r.crashes).sum();

    let mut summary = format!(
        "Batch: {}/{} passed, {} total ops, {} commits ({} failed), {} crashes",
        passed, total, total_ops, total_commits, total_failed_commits, total_crashes
    );

    if !failed_seeds.is_empty() {
        summary.push_str(&format!("\nFailed seeds: {:?}", failed_seeds));
    }

    summary
}
