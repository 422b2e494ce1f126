//! Configuration for the Stream Sink
//!
//! Defines configuration structs, TOML loading and environment overrides.
//!
//! ## Environment Overrides
//!
//! | Variable | Field |
//! |----------|-------|
//! | `SINK_PREFIX` | `prefix` |
//! | `SINK_STAGING_DIR` | `staging_dir` |
//! | `SINK_STORE_TYPE` | `store_type` (`inmemory`, `localfs`, `s3`) |
//! | `SINK_LOCAL_PATH` | `local_path` |
//! | `SINK_S3_BUCKET` | `s3.bucket` |
//! | `SINK_S3_REGION` | `s3.region` |
//! | `SINK_S3_ENDPOINT` | `s3.endpoint` |
//! | `SINK_CHUNK_THRESHOLD_BYTES` | `writer.chunk_threshold_bytes` |

use crate::streaming::object_store::{DynObjectStore, InMemoryObjectStore, LocalFsObjectStore};
use crate::streaming::SinkError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Main configuration for the sink
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    /// Key prefix for all durable objects
    pub prefix: String,
    /// Local directory for staged generations
    pub staging_dir: PathBuf,
    /// Object store type
    pub store_type: ObjectStoreType,
    /// Local filesystem path (for LocalFs store)
    pub local_path: Option<PathBuf>,
    /// S3 configuration (for S3 store)
    #[cfg(feature = "s3")]
    pub s3: Option<S3Config>,
    /// Block writer settings
    pub writer: WriterConfig,
    /// Generation commit thresholds
    pub generation: GenerationConfig,
}

impl Default for SinkConfig {
    fn default() -> Self {
        SinkConfig {
            prefix: "stream-sink".to_string(),
            staging_dir: std::env::temp_dir().join("stream-sink"),
            store_type: ObjectStoreType::InMemory,
            local_path: None,
            #[cfg(feature = "s3")]
            s3: None,
            writer: WriterConfig::default(),
            generation: GenerationConfig::default(),
        }
    }
}

impl SinkConfig {
    /// Create config for local development
    pub fn local(path: PathBuf) -> Self {
        SinkConfig {
            staging_dir: path.join("staging"),
            store_type: ObjectStoreType::LocalFs,
            local_path: Some(path.join("store")),
            ..Self::default()
        }
    }

    /// Create config for testing (in-memory store, small chunks)
    pub fn test(staging_dir: PathBuf) -> Self {
        SinkConfig {
            prefix: "test".to_string(),
            staging_dir,
            store_type: ObjectStoreType::InMemory,
            writer: WriterConfig::test(),
            generation: GenerationConfig::test(),
            ..Self::default()
        }
    }

    /// Parse a TOML document; missing fields take their defaults
    pub fn from_toml_str(s: &str) -> Result<Self, SinkError> {
        let config: SinkConfig =
            toml::from_str(s).map_err(|e| SinkError::Config(format!("invalid TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, SinkError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            SinkError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&text)
    }

    /// Apply `SINK_*` environment variables on top of this config
    pub fn apply_env_overrides(&mut self) -> Result<(), SinkError> {
        self.apply_overrides(|name| std::env::var(name).ok())?;
        self.validate()
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), SinkError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("SINK_PREFIX") {
            self.prefix = v;
        }
        if let Some(v) = lookup("SINK_STAGING_DIR") {
            self.staging_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("SINK_STORE_TYPE") {
            self.store_type = v.parse()?;
        }
        if let Some(v) = lookup("SINK_LOCAL_PATH") {
            self.local_path = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("SINK_CHUNK_THRESHOLD_BYTES") {
            self.writer.chunk_threshold_bytes = v.parse().map_err(|_| {
                SinkError::Config(format!("SINK_CHUNK_THRESHOLD_BYTES: not a number: {}", v))
            })?;
        }
        #[cfg(feature = "s3")]
        {
            let bucket = lookup("SINK_S3_BUCKET");
            let region = lookup("SINK_S3_REGION");
            let endpoint = lookup("SINK_S3_ENDPOINT");
            if bucket.is_some() || region.is_some() || endpoint.is_some() {
                let s3 = self.s3.get_or_insert_with(S3Config::default);
                if let Some(v) = bucket {
                    s3.bucket = v;
                }
                if let Some(v) = region {
                    s3.region = v;
                }
                if endpoint.is_some() {
                    s3.endpoint = endpoint;
                }
            }
        }
        Ok(())
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<(), SinkError> {
        if self.writer.chunk_threshold_bytes == 0 {
            return Err(SinkError::Config(
                "writer.chunk_threshold_bytes must be positive".to_string(),
            ));
        }
        if self.writer.compression_level > 9 {
            return Err(SinkError::Config(format!(
                "writer.compression_level must be 0-9, got {}",
                self.writer.compression_level
            )));
        }
        if self.generation.max_records == 0 || self.generation.max_bytes == 0 {
            return Err(SinkError::Config(
                "generation thresholds must be positive".to_string(),
            ));
        }
        if self.generation.poll_batch_size == 0 {
            return Err(SinkError::Config(
                "generation.poll_batch_size must be positive".to_string(),
            ));
        }
        match self.store_type {
            ObjectStoreType::InMemory => {}
            ObjectStoreType::LocalFs => {
                if self.local_path.is_none() {
                    return Err(SinkError::Config(
                        "store_type LocalFs requires local_path".to_string(),
                    ));
                }
            }
            #[cfg(feature = "s3")]
            ObjectStoreType::S3 => match &self.s3 {
                Some(s3) if !s3.bucket.is_empty() => {}
                _ => {
                    return Err(SinkError::Config(
                        "store_type S3 requires s3.bucket".to_string(),
                    ))
                }
            },
        }
        Ok(())
    }
}

/// Type of object store backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectStoreType {
    /// In-memory store (for tests)
    InMemory,
    /// Local filesystem
    LocalFs,
    /// Amazon S3 or compatible
    #[cfg(feature = "s3")]
    S3,
}

impl std::str::FromStr for ObjectStoreType {
    type Err = SinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "inmemory" | "memory" => Ok(ObjectStoreType::InMemory),
            "localfs" | "local" => Ok(ObjectStoreType::LocalFs),
            #[cfg(feature = "s3")]
            "s3" => Ok(ObjectStoreType::S3),
            other => Err(SinkError::Config(format!("unknown store type: {}", other))),
        }
    }
}

/// S3 configuration
#[cfg(feature = "s3")]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct S3Config {
    /// S3 bucket name
    pub bucket: String,
    /// AWS region
    pub region: String,
    /// Custom endpoint (for S3-compatible services like MinIO)
    pub endpoint: Option<String>,
}

/// How records are delimited inside a chunk's decompressed bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RecordFraming {
    /// Each record followed by `\n`; records may not contain `\n`
    #[default]
    Newline,
    /// Each record preceded by its length as a little-endian u32
    LengthPrefixed,
}

/// Block writer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    /// Compressed bytes after which the current chunk is finished (default: 64MB)
    pub chunk_threshold_bytes: u64,
    /// gzip level 0-9 (default: 6)
    pub compression_level: u32,
    /// Record delimiting
    pub framing: RecordFraming,
}

impl Default for WriterConfig {
    fn default() -> Self {
        WriterConfig {
            chunk_threshold_bytes: 64 * 1024 * 1024, // 64MB
            compression_level: 6,
            framing: RecordFraming::Newline,
        }
    }
}

impl WriterConfig {
    /// Configuration for tests (tiny chunks, fast compression)
    pub fn test() -> Self {
        WriterConfig {
            chunk_threshold_bytes: 1024, // 1KB
            compression_level: 1,
            framing: RecordFraming::Newline,
        }
    }

    pub fn with_threshold(mut self, chunk_threshold_bytes: u64) -> Self {
        self.chunk_threshold_bytes = chunk_threshold_bytes;
        self
    }

    pub fn with_framing(mut self, framing: RecordFraming) -> Self {
        self.framing = framing;
        self
    }
}

/// When a partition pipeline commits its pending generation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Commit after this many records (default: 100,000)
    pub max_records: u64,
    /// Commit after this many uncompressed bytes (default: 256MB)
    pub max_bytes: u64,
    /// Records requested from the source per poll (default: 500)
    pub poll_batch_size: usize,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        GenerationConfig {
            max_records: 100_000,
            max_bytes: 256 * 1024 * 1024, // 256MB
            poll_batch_size: 500,
        }
    }
}

impl GenerationConfig {
    /// Configuration for tests (small generations)
    pub fn test() -> Self {
        GenerationConfig {
            max_records: 100,
            max_bytes: 16 * 1024, // 16KB
            poll_batch_size: 25,
        }
    }
}

/// Construct the configured object store
pub async fn build_store(config: &SinkConfig) -> Result<DynObjectStore, SinkError> {
    config.validate()?;
    match config.store_type {
        ObjectStoreType::InMemory => Ok(Arc::new(InMemoryObjectStore::new())),
        ObjectStoreType::LocalFs => {
            let path = config.local_path.clone().ok_or_else(|| {
                SinkError::Config("store_type LocalFs requires local_path".to_string())
            })?;
            Ok(Arc::new(LocalFsObjectStore::new(path)))
        }
        #[cfg(feature = "s3")]
        ObjectStoreType::S3 => {
            let s3 = config
                .s3
                .clone()
                .ok_or_else(|| SinkError::Config("store_type S3 requires s3".to_string()))?;
            let store = crate::streaming::s3_store::S3ObjectStore::new(s3)
                .await
                .map_err(|e| SinkError::Config(e.to_string()))?;
            Ok(Arc::new(store))
        }
    }
}
