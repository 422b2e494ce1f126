//! Uploader
//!
//! Transfers a staged generation to the object store and publishes the
//! partition's resume pointer.
//!
//! ## Protocol
//!
//! ```text
//! data blob:  initiate → upload_part × N (one per chunk) → complete
//! index:      initiate → upload_part × 1                 → complete
//! pointer:    put(<pointer key>, <index key>)
//! ```
//!
//! Each step only starts after the previous one succeeded. A failed multipart
//! step aborts that upload and the pointer is left untouched, so the last
//! committed generation stays the resume point. Objects from an abandoned
//! attempt may remain in the store; they are never referenced by a pointer.

use crate::streaming::chunk_index::ChunkIndex;
use crate::streaming::clock::{SinkClock, SystemClock};
use crate::streaming::error::TransportError;
use crate::streaming::keys::{KeyBuilder, PartitionKey};
use crate::streaming::object_store::{MultipartUpload, ObjectStore};
use crate::streaming::SinkError;
use chrono::NaiveDate;
use std::io::{Error as IoError, SeekFrom};
use std::ops::Range;
use std::path::Path;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, error, info, warn};

/// Both artifacts are durable; the pointer is not yet updated
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedGeneration {
    pub partition: PartitionKey,
    pub start_offset: u64,
    pub data_key: String,
    pub index_key: String,
    pub index: ChunkIndex,
}

/// A generation whose pointer has been published
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedGeneration {
    pub partition: PartitionKey,
    pub start_offset: u64,
    /// Resume offset after this generation
    pub next_offset: u64,
    pub data_key: String,
    pub index_key: String,
    pub chunks: usize,
    pub records: u64,
    /// Compressed size of the data blob
    pub bytes: u64,
}

/// Uploads staged generations through an `ObjectStore`
pub struct Uploader<S: ObjectStore, C: SinkClock = SystemClock> {
    store: S,
    keys: KeyBuilder,
    clock: C,
}

impl<S: ObjectStore> Uploader<S, SystemClock> {
    /// Create an uploader that dates keys with the UTC wall clock
    pub fn new(store: S, prefix: &str) -> Self {
        Uploader {
            store,
            keys: KeyBuilder::new(prefix),
            clock: SystemClock,
        }
    }
}

impl<S: ObjectStore, C: SinkClock> Uploader<S, C> {
    /// Replace the clock used to date keys
    pub fn with_clock<C2: SinkClock>(self, clock: C2) -> Uploader<S, C2> {
        Uploader {
            store: self.store,
            keys: self.keys,
            clock,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn keys(&self) -> &KeyBuilder {
        &self.keys
    }

    /// Date the next upload will be filed under
    pub fn as_of(&self) -> NaiveDate {
        self.clock.today()
    }

    /// Upload a staged generation dated today and publish its pointer
    pub async fn put_chunk(
        &self,
        data_path: &Path,
        index_path: &Path,
        partition: &PartitionKey,
    ) -> Result<CommittedGeneration, SinkError> {
        let as_of = self.as_of();
        self.put_chunk_as_of(data_path, index_path, partition, as_of)
            .await
    }

    /// Upload a staged generation under the given date and publish its pointer
    pub async fn put_chunk_as_of(
        &self,
        data_path: &Path,
        index_path: &Path,
        partition: &PartitionKey,
        as_of: NaiveDate,
    ) -> Result<CommittedGeneration, SinkError> {
        let uploaded = self
            .upload_artifacts(data_path, index_path, partition, as_of)
            .await?;
        self.publish_pointer(&uploaded).await
    }

    /// Transfer the data blob and index. Does not touch the pointer.
    pub async fn upload_artifacts(
        &self,
        data_path: &Path,
        index_path: &Path,
        partition: &PartitionKey,
        as_of: NaiveDate,
    ) -> Result<UploadedGeneration, SinkError> {
        let index_bytes = tokio::fs::read(index_path)
            .await
            .map_err(SinkError::staging)?;
        let index = ChunkIndex::from_json(&index_bytes)?;
        let start_offset = index
            .start_offset()
            .ok_or(SinkError::EmptyGeneration)?;

        let data_len = tokio::fs::metadata(data_path)
            .await
            .map_err(SinkError::staging)?
            .len();
        if data_len != index.total_bytes() {
            return Err(SinkError::CorruptIndex(format!(
                "data file holds {} bytes, index covers {}",
                data_len,
                index.total_bytes()
            )));
        }

        let data_key = self.keys.data_key(as_of, partition, start_offset);
        let index_key = self.keys.index_key(as_of, partition, start_offset);

        let data_parts: Vec<Range<u64>> = index.chunks().iter().map(|c| c.byte_range()).collect();
        self.transfer(&data_key, data_path, &data_parts).await?;
        self.transfer(&index_key, index_path, &[0..index_bytes.len() as u64])
            .await?;

        debug!(
            stream = %partition.stream,
            partition = partition.partition,
            start_offset,
            data_key = %data_key,
            index_key = %index_key,
            chunks = index.len(),
            "Uploaded generation artifacts"
        );

        Ok(UploadedGeneration {
            partition: partition.clone(),
            start_offset,
            data_key,
            index_key,
            index,
        })
    }

    /// Point the partition's resume pointer at an uploaded index
    pub async fn publish_pointer(
        &self,
        uploaded: &UploadedGeneration,
    ) -> Result<CommittedGeneration, SinkError> {
        let pointer_key = self.keys.pointer_key(&uploaded.partition);
        self.store
            .put(&pointer_key, uploaded.index_key.as_bytes())
            .await
            .map_err(|e| self.transport("put", &pointer_key, e))?;

        let committed = CommittedGeneration {
            partition: uploaded.partition.clone(),
            start_offset: uploaded.start_offset,
            next_offset: uploaded.start_offset + uploaded.index.total_records(),
            data_key: uploaded.data_key.clone(),
            index_key: uploaded.index_key.clone(),
            chunks: uploaded.index.len(),
            records: uploaded.index.total_records(),
            bytes: uploaded.index.total_bytes(),
        };

        info!(
            stream = %committed.partition.stream,
            partition = committed.partition.partition,
            start_offset = committed.start_offset,
            next_offset = committed.next_offset,
            chunks = committed.chunks,
            bytes = committed.bytes,
            key = %committed.index_key,
            "Committed generation"
        );
        Ok(committed)
    }

    /// Multipart-upload `parts` of the file at `path` to `key`, one part per range
    async fn transfer(&self, key: &str, path: &Path, parts: &[Range<u64>]) -> Result<(), SinkError> {
        let upload = self
            .store
            .initiate_multipart(key)
            .await
            .map_err(|e| self.transport("initiate_multipart", key, e))?;

        match self.transfer_parts(&upload, path, parts).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.abort(&upload, &e).await;
                Err(e)
            }
        }
    }

    async fn transfer_parts(
        &self,
        upload: &MultipartUpload,
        path: &Path,
        parts: &[Range<u64>],
    ) -> Result<(), SinkError> {
        let mut file = tokio::fs::File::open(path)
            .await
            .map_err(SinkError::staging)?;
        let mut tags = Vec::with_capacity(parts.len());
        let mut buf = Vec::new();

        for (part_index, range) in parts.iter().enumerate() {
            buf.resize((range.end - range.start) as usize, 0);
            file.seek(SeekFrom::Start(range.start))
                .await
                .map_err(SinkError::staging)?;
            file.read_exact(&mut buf)
                .await
                .map_err(SinkError::staging)?;

            let tag = self
                .store
                .upload_part(upload, part_index, &buf)
                .await
                .map_err(|e| self.transport("upload_part", &upload.key, e))?;
            debug!(
                key = %upload.key,
                upload_id = %upload.upload_id,
                part_index,
                bytes = buf.len(),
                "Uploaded part"
            );
            tags.push(tag);
        }

        self.store
            .complete_multipart(upload, &tags)
            .await
            .map_err(|e| self.transport("complete_multipart", &upload.key, e))
    }

    async fn abort(&self, upload: &MultipartUpload, cause: &SinkError) {
        warn!(
            key = %upload.key,
            upload_id = %upload.upload_id,
            error = %cause,
            "Aborting multipart upload"
        );
        if let Err(e) = self.store.abort_multipart(upload).await {
            error!(
                key = %upload.key,
                upload_id = %upload.upload_id,
                error = %e,
                "Failed to abort multipart upload"
            );
        }
    }

    fn transport(&self, op: &'static str, key: &str, err: IoError) -> SinkError {
        let not_found = self.store.is_not_found(&err);
        TransportError::from_io(op, key, err, not_found).into()
    }
}
