//! Stream sink: durable, resumable persistence of partitioned record
//! streams to object storage.

pub mod io;
pub mod observability;
pub mod streaming;

pub use observability::{init_tracing, LogFormat};
pub use streaming::{
    PartitionKey, PartitionPipeline, SinkConfig, SinkError, SinkRunner, SourceRecord,
};
