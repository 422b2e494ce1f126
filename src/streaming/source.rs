//! Record Sources
//!
//! The stream consumer client is external; the sink only needs to pull
//! ordered batches of records for one partition starting at a given offset.

use crate::streaming::keys::PartitionKey;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::io::Result as IoResult;
use std::pin::Pin;
use std::sync::Arc;

/// One record with its absolute offset in the partition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRecord {
    pub offset: u64,
    pub payload: Vec<u8>,
}

impl SourceRecord {
    pub fn new(offset: u64, payload: impl Into<Vec<u8>>) -> Self {
        SourceRecord {
            offset,
            payload: payload.into(),
        }
    }
}

/// Boxed future returned by `RecordSource::poll_batch`
pub type PollFuture<'a> = Pin<Box<dyn Future<Output = IoResult<Vec<SourceRecord>>> + Send + 'a>>;

/// Ordered supplier of records per partition
///
/// `poll_batch` returns up to `max_records` records with offsets at or after
/// `from_offset`, in ascending offset order. An empty batch means nothing is
/// available yet.
pub trait RecordSource: Send + Sync + 'static {
    fn poll_batch<'a>(
        &'a self,
        partition: &'a PartitionKey,
        from_offset: u64,
        max_records: usize,
    ) -> PollFuture<'a>;
}

impl<S: RecordSource + ?Sized> RecordSource for Arc<S> {
    fn poll_batch<'a>(
        &'a self,
        partition: &'a PartitionKey,
        from_offset: u64,
        max_records: usize,
    ) -> PollFuture<'a> {
        (**self).poll_batch(partition, from_offset, max_records)
    }
}

/// In-memory append-only log per partition, for tests and DST
#[derive(Debug, Clone, Default)]
pub struct InMemoryRecordSource {
    logs: Arc<RwLock<HashMap<PartitionKey, Vec<Vec<u8>>>>>,
}

impl InMemoryRecordSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record; returns its offset
    pub fn append(&self, partition: &PartitionKey, payload: impl Into<Vec<u8>>) -> u64 {
        let mut logs = self.logs.write();
        let log = logs.entry(partition.clone()).or_default();
        log.push(payload.into());
        log.len() as u64 - 1
    }

    /// Offset the next appended record will get
    pub fn end_offset(&self, partition: &PartitionKey) -> u64 {
        self.logs
            .read()
            .get(partition)
            .map(|log| log.len() as u64)
            .unwrap_or(0)
    }

    /// Payload at `offset`, if present
    pub fn record(&self, partition: &PartitionKey, offset: u64) -> Option<Vec<u8>> {
        let index = usize::try_from(offset).ok()?;
        self.logs.read().get(partition)?.get(index).cloned()
    }
}

impl RecordSource for InMemoryRecordSource {
    fn poll_batch<'a>(
        &'a self,
        partition: &'a PartitionKey,
        from_offset: u64,
        max_records: usize,
    ) -> PollFuture<'a> {
        Box::pin(async move {
            let logs = self.logs.read();
            let Some(log) = logs.get(partition) else {
                return Ok(Vec::new());
            };
            let start = usize::try_from(from_offset).unwrap_or(usize::MAX).min(log.len());
            let end = start.saturating_add(max_records).min(log.len());
            Ok(log[start..end]
                .iter()
                .enumerate()
                .map(|(i, payload)| SourceRecord::new(from_offset + i as u64, payload.clone()))
                .collect())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_poll_batch_windows() {
        let source = InMemoryRecordSource::new();
        let tp = PartitionKey::new("bar", 0);
        for i in 0..10 {
            assert_eq!(source.append(&tp, format!("r{}", i)), i);
        }

        let batch = source.poll_batch(&tp, 3, 4).await.unwrap();
        assert_eq!(batch.len(), 4);
        assert_eq!(batch[0], SourceRecord::new(3, "r3"));
        assert_eq!(batch[3].offset, 6);

        assert_eq!(source.poll_batch(&tp, 8, 100).await.unwrap().len(), 2);
        assert!(source.poll_batch(&tp, 10, 5).await.unwrap().is_empty());
        assert!(source.poll_batch(&tp, 99, 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_partitions_are_independent() {
        let source = InMemoryRecordSource::new();
        let a = PartitionKey::new("bar", 0);
        let b = PartitionKey::new("bar", 1);
        source.append(&a, "a0");

        assert_eq!(source.end_offset(&a), 1);
        assert_eq!(source.end_offset(&b), 0);
        assert!(source.poll_batch(&b, 0, 10).await.unwrap().is_empty());
        assert_eq!(source.record(&a, 0), Some(b"a0".to_vec()));
    }
}
