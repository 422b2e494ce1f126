//! Offset Resolver
//!
//! Determines where a partition resumes after a restart, from committed
//! store state only:
//!
//! ```text
//! get(pointer) ── NotFound ──→ 0
//!      │
//!      └─ index key ─→ get(index) ─→ last.first_record_offset + last.num_records
//! ```
//!
//! At most two lookups regardless of how many generations exist. NotFound is
//! only meaningful for the pointer; every other failure propagates.

use crate::streaming::chunk_index::ChunkIndex;
use crate::streaming::error::TransportError;
use crate::streaming::keys::{KeyBuilder, PartitionKey};
use crate::streaming::object_store::ObjectStore;
use crate::streaming::SinkError;
use tracing::{debug, info};

/// The index a partition's pointer currently references
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedPointer {
    pub index_key: String,
    pub index: ChunkIndex,
}

impl CommittedPointer {
    /// Offset following the last committed record
    pub fn next_offset(&self) -> Result<u64, SinkError> {
        self.index.next_offset().ok_or_else(|| {
            SinkError::CorruptIndex(format!("index {} has no chunks", self.index_key))
        })
    }
}

/// Resolves resume offsets from pointers and indexes
pub struct OffsetResolver<S: ObjectStore> {
    store: S,
    keys: KeyBuilder,
}

impl<S: ObjectStore> OffsetResolver<S> {
    pub fn new(store: S, prefix: &str) -> Self {
        OffsetResolver {
            store,
            keys: KeyBuilder::new(prefix),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Next record offset to consume for `partition`
    pub async fn fetch_offset(&self, partition: &PartitionKey) -> Result<u64, SinkError> {
        let offset = match self.fetch_committed(partition).await? {
            Some(pointer) => pointer.next_offset()?,
            None => 0,
        };
        info!(
            stream = %partition.stream,
            partition = partition.partition,
            offset,
            "Resolved resume offset"
        );
        Ok(offset)
    }

    /// The committed pointer and its index, or `None` if the partition has
    /// never committed
    pub async fn fetch_committed(
        &self,
        partition: &PartitionKey,
    ) -> Result<Option<CommittedPointer>, SinkError> {
        let pointer_key = self.keys.pointer_key(partition);
        let pointer = match self.store.get(&pointer_key).await {
            Ok(bytes) => bytes,
            Err(e) if self.store.is_not_found(&e) => {
                debug!(key = %pointer_key, "No pointer, partition starts at 0");
                return Ok(None);
            }
            Err(e) => {
                return Err(TransportError::from_io("get", &pointer_key, e, false).into());
            }
        };

        let index_key = String::from_utf8(pointer)
            .map_err(|_| SinkError::CorruptIndex(format!("pointer {} is not UTF-8", pointer_key)))?;
        if index_key.is_empty() {
            return Err(SinkError::CorruptIndex(format!(
                "pointer {} is empty",
                pointer_key
            )));
        }

        let index_bytes = self.store.get(&index_key).await.map_err(|e| {
            let not_found = self.store.is_not_found(&e);
            SinkError::from(TransportError::from_io("get", &index_key, e, not_found))
        })?;
        let index = ChunkIndex::from_json(&index_bytes)?;
        if index.is_empty() {
            return Err(SinkError::CorruptIndex(format!(
                "index {} has no chunks",
                index_key
            )));
        }

        Ok(Some(CommittedPointer { index_key, index }))
    }
}
