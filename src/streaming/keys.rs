//! Partition keys and deterministic object naming
//!
//! ```text
//! data    <prefix>/<YYYY-MM-DD>/<stream>-<partition:05>-<start:012>.gz
//! index   <prefix>/<YYYY-MM-DD>/<stream>-<partition:05>-<start:012>.index.json
//! pointer <prefix>/last_chunk_index.<stream>-<partition:05>.txt
//! ```
//!
//! The date is always passed in explicitly so that naming never depends on
//! ambient process state.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DATA_SUFFIX: &str = ".gz";
pub const INDEX_SUFFIX: &str = ".index.json";
const POINTER_PREFIX: &str = "last_chunk_index.";
const POINTER_SUFFIX: &str = ".txt";

/// Identifies one independent ordered stream
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionKey {
    pub stream: String,
    pub partition: u32,
}

impl PartitionKey {
    pub fn new(stream: impl Into<String>, partition: u32) -> Self {
        PartitionKey {
            stream: stream.into(),
            partition,
        }
    }

    /// `<stream>-<partition:05>`
    pub fn file_stem(&self) -> String {
        format!("{}-{:05}", self.stream, self.partition)
    }

    /// `<stream>-<partition:05>-<start:012>`
    pub fn generation_stem(&self, start_offset: u64) -> String {
        format!("{}-{:012}", self.file_stem(), start_offset)
    }
}

impl std::fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.stream, self.partition)
    }
}

/// Builds durable object keys under a fixed prefix
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyBuilder {
    prefix: String,
}

impl KeyBuilder {
    pub fn new(prefix: &str) -> Self {
        KeyBuilder {
            prefix: prefix.trim_end_matches('/').to_string(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn join(&self, rest: &str) -> String {
        if self.prefix.is_empty() {
            rest.to_string()
        } else {
            format!("{}/{}", self.prefix, rest)
        }
    }

    pub fn data_key(&self, as_of: NaiveDate, partition: &PartitionKey, start_offset: u64) -> String {
        self.join(&format!(
            "{}/{}{}",
            as_of.format("%Y-%m-%d"),
            partition.generation_stem(start_offset),
            DATA_SUFFIX
        ))
    }

    pub fn index_key(&self, as_of: NaiveDate, partition: &PartitionKey, start_offset: u64) -> String {
        self.join(&format!(
            "{}/{}{}",
            as_of.format("%Y-%m-%d"),
            partition.generation_stem(start_offset),
            INDEX_SUFFIX
        ))
    }

    pub fn pointer_key(&self, partition: &PartitionKey) -> String {
        self.join(&format!(
            "{}{}{}",
            POINTER_PREFIX,
            partition.file_stem(),
            POINTER_SUFFIX
        ))
    }
}

/// Data key belonging to an index key, or `None` if `index_key` is not one
pub fn data_key_for_index(index_key: &str) -> Option<String> {
    index_key
        .strip_suffix(INDEX_SUFFIX)
        .map(|stem| format!("{}{}", stem, DATA_SUFFIX))
}

/// Local staging paths for a generation: (data file, index file)
pub fn staging_paths(
    staging_dir: &Path,
    partition: &PartitionKey,
    start_offset: u64,
) -> (PathBuf, PathBuf) {
    let stem = partition.generation_stem(start_offset);
    (
        staging_dir.join(format!("{}{}", stem, DATA_SUFFIX)),
        staging_dir.join(format!("{}{}", stem, INDEX_SUFFIX)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 7).unwrap()
    }

    #[test]
    fn test_data_and_index_keys() {
        let keys = KeyBuilder::new("pfx");
        let tp = PartitionKey::new("bar", 0);

        assert_eq!(
            keys.data_key(date(), &tp, 0),
            "pfx/2026-03-07/bar-00000-000000000000.gz"
        );
        assert_eq!(
            keys.index_key(date(), &tp, 10042),
            "pfx/2026-03-07/bar-00000-000000010042.index.json"
        );
    }

    #[test]
    fn test_pointer_key() {
        let keys = KeyBuilder::new("pfx");
        assert_eq!(
            keys.pointer_key(&PartitionKey::new("new_topic", 0)),
            "pfx/last_chunk_index.new_topic-00000.txt"
        );
        assert_eq!(
            keys.pointer_key(&PartitionKey::new("bar", 12)),
            "pfx/last_chunk_index.bar-00012.txt"
        );
    }

    #[test]
    fn test_prefix_normalization() {
        let tp = PartitionKey::new("bar", 3);
        assert_eq!(
            KeyBuilder::new("pfx/").pointer_key(&tp),
            "pfx/last_chunk_index.bar-00003.txt"
        );
        assert_eq!(
            KeyBuilder::new("").data_key(date(), &tp, 7),
            "2026-03-07/bar-00003-000000000007.gz"
        );
    }

    #[test]
    fn test_data_key_for_index() {
        let keys = KeyBuilder::new("pfx");
        let tp = PartitionKey::new("bar", 0);
        assert_eq!(
            data_key_for_index(&keys.index_key(date(), &tp, 42)),
            Some(keys.data_key(date(), &tp, 42))
        );
        assert_eq!(data_key_for_index("pfx/whatever.txt"), None);
    }

    #[test]
    fn test_staging_paths() {
        let tp = PartitionKey::new("bar", 0);
        let (data, index) = staging_paths(Path::new("/tmp/stage"), &tp, 42);
        assert_eq!(data, PathBuf::from("/tmp/stage/bar-00000-000000000042.gz"));
        assert_eq!(
            index,
            PathBuf::from("/tmp/stage/bar-00000-000000000042.index.json")
        );
    }
}
