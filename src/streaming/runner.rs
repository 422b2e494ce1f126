//! Sink Runner
//!
//! Drives one `PartitionPipeline` per partition, each on its own tokio task.
//! Partitions share the store and the record source but no mutable state.
//!
//! ```text
//!            ┌─ task(bar-0): poll → write → commit? ─┐
//! source ────┼─ task(bar-1): poll → write → commit? ─┼──→ object store
//!            └─ task(bar-2): poll → write → commit? ─┘
//! ```
//!
//! Generations are committed when a `GenerationConfig` threshold is reached
//! and once more on shutdown. A failed commit rewinds the partition to its
//! last committed offset and the source is re-polled from there.

use crate::streaming::clock::{SinkClock, SystemClock};
use crate::streaming::config::SinkConfig;
use crate::streaming::keys::PartitionKey;
use crate::streaming::object_store::ObjectStore;
use crate::streaming::pipeline::PartitionPipeline;
use crate::streaming::source::RecordSource;
use crate::streaming::SinkError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// What one partition task did before it stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionReport {
    pub partition: PartitionKey,
    /// Resume offset at exit
    pub committed_offset: u64,
    /// Generations committed
    pub generations: u64,
    /// Records committed
    pub records: u64,
    /// Commits that failed and were rewound
    pub failed_commits: u64,
    /// Set if the task stopped on an unrecoverable error
    pub error: Option<String>,
}

impl PartitionReport {
    fn new(partition: PartitionKey) -> Self {
        PartitionReport {
            partition,
            committed_offset: 0,
            generations: 0,
            records: 0,
            failed_commits: 0,
            error: None,
        }
    }
}

/// Builder for a set of partition tasks
pub struct SinkRunner<S: ObjectStore + Clone, R: RecordSource, C: SinkClock = SystemClock> {
    store: S,
    source: Arc<R>,
    config: SinkConfig,
    clock: C,
    poll_interval: Duration,
}

impl<S: ObjectStore + Clone, R: RecordSource> SinkRunner<S, R, SystemClock> {
    pub fn new(store: S, source: Arc<R>, config: SinkConfig) -> Self {
        SinkRunner {
            store,
            source,
            config,
            clock: SystemClock,
            poll_interval: Duration::from_millis(100),
        }
    }
}

impl<S: ObjectStore + Clone, R: RecordSource, C: SinkClock> SinkRunner<S, R, C> {
    pub fn with_clock<C2: SinkClock>(self, clock: C2) -> SinkRunner<S, R, C2> {
        SinkRunner {
            store: self.store,
            source: self.source,
            config: self.config,
            clock,
            poll_interval: self.poll_interval,
        }
    }

    /// Wait between polls when the source has nothing new (default 100ms)
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Spawn one task per partition
    pub fn spawn(self, partitions: Vec<PartitionKey>) -> SinkRunnerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::with_capacity(partitions.len());

        for partition in partitions {
            let pipeline = PartitionPipeline::new(partition.clone(), self.store.clone(), &self.config)
                .with_clock(self.clock.clone());
            let task = tokio::spawn(run_partition(
                pipeline,
                self.source.clone(),
                shutdown_rx.clone(),
                self.poll_interval,
            ));
            tasks.push((partition, task));
        }

        info!(partitions = tasks.len(), "Sink runner started");
        SinkRunnerHandle { shutdown_tx, tasks }
    }
}

/// Handle to running partition tasks
pub struct SinkRunnerHandle {
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<(PartitionKey, JoinHandle<PartitionReport>)>,
}

impl SinkRunnerHandle {
    /// Signal shutdown, let every partition commit what it holds, and collect reports
    pub async fn shutdown(self) -> Vec<PartitionReport> {
        let _ = self.shutdown_tx.send(true);
        let (partitions, tasks): (Vec<_>, Vec<_>) = self.tasks.into_iter().unzip();
        let joined = futures::future::join_all(tasks).await;

        let mut reports = Vec::with_capacity(partitions.len());
        for (partition, joined) in partitions.into_iter().zip(joined) {
            match joined {
                Ok(report) => reports.push(report),
                Err(e) => {
                    error!(%partition, error = %e, "Partition task failed");
                    let mut report = PartitionReport::new(partition);
                    report.error = Some(format!("task failed: {}", e));
                    reports.push(report);
                }
            }
        }
        info!(partitions = reports.len(), "Sink runner stopped");
        reports
    }

    pub fn partitions(&self) -> impl Iterator<Item = &PartitionKey> {
        self.tasks.iter().map(|(p, _)| p)
    }
}

/// Sleep for `period` unless shutdown is signalled first. Returns true on shutdown.
async fn wait_or_shutdown(shutdown: &mut watch::Receiver<bool>, period: Duration) -> bool {
    if *shutdown.borrow() {
        return true;
    }
    let sender_gone = tokio::select! {
        _ = tokio::time::sleep(period) => false,
        changed = shutdown.changed() => changed.is_err(),
    };
    sender_gone || *shutdown.borrow()
}

/// Commit the pending generation, recording the outcome. Returns false on failure.
async fn commit<S: ObjectStore + Clone, C: SinkClock>(
    pipeline: &mut PartitionPipeline<S, C>,
    report: &mut PartitionReport,
) -> bool {
    match pipeline.commit().await {
        Ok(Some(outcome)) => {
            report.generations += 1;
            report.records += outcome.records;
            true
        }
        Ok(None) => true,
        Err(e) => {
            report.failed_commits += 1;
            warn!(
                partition = %pipeline.partition(),
                error = %e,
                "Commit failed"
            );
            false
        }
    }
}

async fn run_partition<S: ObjectStore + Clone, R: RecordSource, C: SinkClock>(
    mut pipeline: PartitionPipeline<S, C>,
    source: Arc<R>,
    mut shutdown: watch::Receiver<bool>,
    poll_interval: Duration,
) -> PartitionReport {
    let partition = pipeline.partition().clone();
    let mut report = PartitionReport::new(partition.clone());
    let batch_size = pipeline.generation_config().poll_batch_size;

    // Resolve the resume offset, retrying transient store failures
    let mut cursor = loop {
        match pipeline.open().await {
            Ok(offset) => break offset,
            Err(e @ SinkError::CorruptIndex(_)) => {
                error!(%partition, error = %e, "Cannot resume partition");
                report.error = Some(e.to_string());
                return report;
            }
            Err(e) => {
                warn!(%partition, error = %e, "Failed to resolve resume offset, retrying");
                if wait_or_shutdown(&mut shutdown, poll_interval).await {
                    report.error = Some(e.to_string());
                    return report;
                }
            }
        }
    };
    report.committed_offset = cursor;

    loop {
        if *shutdown.borrow() {
            break;
        }

        let batch = match source.poll_batch(&partition, cursor, batch_size).await {
            Ok(batch) => batch,
            Err(e) => {
                warn!(%partition, error = %e, "Source poll failed");
                if wait_or_shutdown(&mut shutdown, poll_interval).await {
                    break;
                }
                continue;
            }
        };

        if batch.is_empty() {
            if wait_or_shutdown(&mut shutdown, poll_interval).await {
                break;
            }
            continue;
        }

        for record in &batch {
            match pipeline.write(record) {
                Ok(_) => {}
                // Generation already discarded; re-poll from the committed offset
                Err(SinkError::Staging(_)) => break,
                Err(e) => {
                    error!(%partition, offset = record.offset, error = %e, "Stopping partition");
                    pipeline.abort_generation();
                    report.committed_offset = pipeline.committed_offset();
                    report.error = Some(e.to_string());
                    return report;
                }
            }
            if pipeline.should_commit() && !commit(&mut pipeline, &mut report).await {
                break;
            }
        }

        if let Some(offset) = pipeline.take_rewind() {
            info!(%partition, offset, "Rewinding source");
        }
        cursor = pipeline.next_offset();
    }

    commit(&mut pipeline, &mut report).await;
    pipeline.abort_generation();
    report.committed_offset = pipeline.committed_offset();
    info!(
        %partition,
        committed_offset = report.committed_offset,
        generations = report.generations,
        records = report.records,
        "Partition stopped"
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::SimulatedRng;
    use crate::streaming::offset_resolver::OffsetResolver;
    use crate::streaming::simulated_store::{SimulatedObjectStore, SimulatedStoreConfig};
    use crate::streaming::source::InMemoryRecordSource;
    use crate::streaming::InMemoryObjectStore;

    async fn wait_for_commits(store: &InMemoryObjectStore, partitions: &[PartitionKey], target: u64) {
        let resolver = OffsetResolver::new(store.clone(), "test");
        for _ in 0..500 {
            let mut done = true;
            for p in partitions {
                if resolver.fetch_offset(p).await.unwrap_or(0) < target {
                    done = false;
                }
            }
            if done {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_runner_commits_all_partitions() {
        let dir = tempfile::tempdir().unwrap();
        let store = InMemoryObjectStore::new();
        let source = Arc::new(InMemoryRecordSource::new());
        let partitions: Vec<PartitionKey> = (0..3).map(|p| PartitionKey::new("bar", p)).collect();
        for p in &partitions {
            for i in 0..250 {
                source.append(p, format!("{}-{}", p, i));
            }
        }

        let mut config = SinkConfig::test(dir.path().to_path_buf());
        config.generation.max_records = 125;
        let handle = SinkRunner::new(store.clone(), source.clone(), config)
            .with_poll_interval(Duration::from_millis(5))
            .spawn(partitions.clone());
        wait_for_commits(&store, &partitions, 250).await;
        let mut reports = handle.shutdown().await;
        reports.sort_by(|a, b| a.partition.cmp(&b.partition));

        for (report, p) in reports.iter().zip(&partitions) {
            assert_eq!(&report.partition, p);
            assert_eq!(report.error, None);
            assert_eq!(report.committed_offset, 250);
            assert_eq!(report.records, 250);
            assert_eq!(report.generations, 2);
        }

        let resolver = OffsetResolver::new(store, "test");
        for p in &partitions {
            assert_eq!(resolver.fetch_offset(p).await.unwrap(), 250);
        }
    }

    #[tokio::test]
    async fn test_runner_resumes_from_committed_offset() {
        let dir = tempfile::tempdir().unwrap();
        let store = InMemoryObjectStore::new();
        let source = Arc::new(InMemoryRecordSource::new());
        let p = PartitionKey::new("bar", 0);
        for i in 0..40 {
            source.append(&p, format!("r{}", i));
        }
        let mut config = SinkConfig::test(dir.path().to_path_buf());
        config.generation.max_records = 20;

        let handle = SinkRunner::new(store.clone(), source.clone(), config.clone())
            .with_poll_interval(Duration::from_millis(5))
            .spawn(vec![p.clone()]);
        wait_for_commits(&store, &[p.clone()], 40).await;
        let reports = handle.shutdown().await;
        assert_eq!(reports[0].committed_offset, 40);

        for i in 40..60 {
            source.append(&p, format!("r{}", i));
        }
        let handle = SinkRunner::new(store.clone(), source, config)
            .with_poll_interval(Duration::from_millis(5))
            .spawn(vec![p.clone()]);
        wait_for_commits(&store, &[p.clone()], 60).await;
        let reports = handle.shutdown().await;

        assert_eq!(reports[0].committed_offset, 60);
        assert_eq!(reports[0].records, 20, "only new records are committed");
    }

    #[tokio::test]
    async fn test_runner_survives_commit_failures() {
        let dir = tempfile::tempdir().unwrap();
        let inner = InMemoryObjectStore::new();
        let store = SimulatedObjectStore::new(
            inner.clone(),
            SimulatedRng::new(2024),
            SimulatedStoreConfig {
                upload_part_fail_prob: 0.2,
                ..SimulatedStoreConfig::no_faults()
            },
        );
        let source = Arc::new(InMemoryRecordSource::new());
        let p = PartitionKey::new("bar", 0);
        for i in 0..300 {
            source.append(&p, format!("r{}", i));
        }

        let mut config = SinkConfig::test(dir.path().to_path_buf());
        config.generation.max_records = 50;
        let handle = SinkRunner::new(store.clone(), source, config)
            .with_poll_interval(Duration::from_millis(1))
            .spawn(vec![p.clone()]);
        wait_for_commits(&inner, &[p.clone()], 300).await;
        let reports = handle.shutdown().await;

        // Every record was eventually committed despite failed attempts
        assert_eq!(reports[0].error, None);
        assert_eq!(reports[0].committed_offset, 300);
        assert_eq!(
            OffsetResolver::new(inner.clone(), "test")
                .fetch_offset(&p)
                .await
                .unwrap(),
            reports[0].committed_offset
        );
        assert_eq!(inner.pending_uploads(), 0);
    }
}
