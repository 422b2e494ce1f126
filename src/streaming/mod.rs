//! Streaming Record Sink
//!
//! Consumes an ordered record stream per partition and persists it to
//! object storage as gzip-chunked generations, each described by a JSON
//! chunk index. A per-partition pointer names the latest committed index;
//! it is the only state consulted on restart.
//!
//! ## Architecture
//!
//! ```text
//! RecordSource → PartitionPipeline → BlockWriter (staging dir)
//!                       │                  │ close
//!                       │                  ↓
//!                       │              Uploader ─ multipart ─→ ObjectStore
//!                       │                  │ pointer put
//!                       └── open ← OffsetResolver ←─────────────┘
//! ```
//!
//! ## Key Features
//!
//! - **Independent chunks**: each chunk is a standalone gzip member
//! - **Two-lookup resume**: pointer, then index
//! - **Atomic generations**: data and index become visible on multipart
//!   completion; the pointer moves last
//! - **At-least-once**: a crash before the pointer replays the generation

pub mod error;
pub mod chunk_index;
pub mod keys;
pub mod clock;
pub mod object_store;
pub mod simulated_store;
pub mod config;
pub mod block_writer;
pub mod block_reader;
pub mod source;
pub mod uploader;
pub mod offset_resolver;
pub mod pipeline;
pub mod runner;
pub mod dst;
#[cfg(feature = "s3")]
pub mod s3_store;

pub use error::{SinkError, TransportError};
pub use chunk_index::{ChunkIndex, ChunkMeta, IndexViolation};
pub use keys::{data_key_for_index, staging_paths, KeyBuilder, PartitionKey, DATA_SUFFIX, INDEX_SUFFIX};
pub use clock::{SimulatedClock, SinkClock, SystemClock};
pub use object_store::{
    DynObjectStore, InMemoryObjectStore, LocalFsObjectStore, MultipartUpload, ObjectStore,
    PartTag, StoreFuture,
};
pub use simulated_store::{
    ScriptedFault, SimulatedObjectStore, SimulatedStoreConfig, SimulatedStoreStats, StoreCall,
    StoreOp,
};
pub use config::{
    build_store, GenerationConfig, ObjectStoreType, RecordFraming, SinkConfig, WriterConfig,
};
#[cfg(feature = "s3")]
pub use config::S3Config;
pub use block_writer::{BlockWriter, StagedGeneration};
pub use block_reader::BlockReader;
pub use source::{InMemoryRecordSource, PollFuture, RecordSource, SourceRecord};
pub use uploader::{CommittedGeneration, UploadedGeneration, Uploader};
pub use offset_resolver::{CommittedPointer, OffsetResolver};
pub use pipeline::{CommitOutcome, PartitionPipeline, PipelineState};
pub use runner::{PartitionReport, SinkRunner, SinkRunnerHandle};
pub use dst::{run_dst_batch, summarize_batch, SinkDSTConfig, SinkDSTHarness, SinkDSTResult, SinkOperation};
#[cfg(feature = "s3")]
pub use s3_store::S3ObjectStore;
