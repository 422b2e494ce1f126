//! Stream Sink
//!
//! Pipes newline-delimited records from stdin into one partition of the
//! configured object store. Lines are numbered from the partition's resume
//! offset, so a rerun appends after the last committed record. Line bytes
//! are stored as read; input need not be UTF-8.
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | SINK_STREAM | - | Stream name (required) |
//! | SINK_PARTITION | 0 | Partition number |
//! | SINK_CONFIG | - | TOML config file |
//! | SINK_MODE | write | `write`, or `offset` to print the resume offset |
//! | SINK_LOG_FORMAT | plain | `plain` or `json` |
//! | SINK_* | - | Config overrides, see `SinkConfig::apply_env_overrides` |
//! | RUST_LOG | info | Log filter |

use std::path::PathBuf;
use stream_sink::observability::{init_tracing, LogFormat};
use stream_sink::streaming::{
    build_store, OffsetResolver, PartitionKey, PartitionPipeline, SinkConfig, SinkError,
    SourceRecord,
};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Split};
use tokio::signal;
use tracing::{info, warn};

const DEFAULT_PARTITION: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Write,
    Offset,
}

fn env_mode() -> Result<Mode, SinkError> {
    match std::env::var("SINK_MODE").ok().as_deref() {
        None | Some("write") => Ok(Mode::Write),
        Some("offset") => Ok(Mode::Offset),
        Some(other) => Err(SinkError::Config(format!("SINK_MODE: unknown mode {}", other))),
    }
}

fn env_partition() -> Result<PartitionKey, SinkError> {
    let stream = std::env::var("SINK_STREAM")
        .map_err(|_| SinkError::Config("SINK_STREAM is required".to_string()))?;
    let partition = match std::env::var("SINK_PARTITION") {
        Ok(v) => v
            .parse()
            .map_err(|_| SinkError::Config(format!("SINK_PARTITION: not a number: {}", v)))?,
        Err(_) => DEFAULT_PARTITION,
    };
    Ok(PartitionKey::new(stream, partition))
}

fn load_config() -> Result<SinkConfig, SinkError> {
    let mut config = match std::env::var("SINK_CONFIG") {
        Ok(path) => SinkConfig::from_file(&PathBuf::from(path))?,
        Err(_) => SinkConfig::default(),
    };
    config.apply_env_overrides()?;
    Ok(config)
}

/// Newline-delimited records from `input`, delimiter stripped
fn input_records<R: AsyncBufRead + Unpin>(input: R) -> Split<R> {
    input.split(b'\n')
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let format = std::env::var("SINK_LOG_FORMAT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(LogFormat::Plain);
    init_tracing(format);

    let mode = env_mode()?;
    let partition = env_partition()?;
    let config = load_config()?;
    let store = build_store(&config).await?;

    if mode == Mode::Offset {
        let offset = OffsetResolver::new(store, &config.prefix)
            .fetch_offset(&partition)
            .await?;
        println!("{}", offset);
        return Ok(());
    }

    let mut pipeline = PartitionPipeline::new(partition.clone(), store, &config);
    let mut offset = pipeline.open().await?;
    info!(%partition, offset, prefix = %config.prefix, "Reading records from stdin");

    let mut lines = input_records(BufReader::new(tokio::io::stdin()));
    loop {
        let line = tokio::select! {
            line = lines.next_segment() => line?,
            _ = signal::ctrl_c() => {
                warn!("Interrupted, committing pending records");
                break;
            }
        };
        let Some(line) = line else {
            break;
        };

        pipeline.write(&SourceRecord::new(offset, line))?;
        offset += 1;

        if pipeline.should_commit() {
            if let Some(outcome) = pipeline.commit().await? {
                info!(
                    index_key = %outcome.index_key,
                    records = outcome.records,
                    next_offset = outcome.next_offset,
                    "Committed generation"
                );
            }
        }
    }

    if let Some(outcome) = pipeline.commit().await? {
        info!(
            index_key = %outcome.index_key,
            records = outcome.records,
            next_offset = outcome.next_offset,
            "Committed generation"
        );
    }
    println!("{}", pipeline.committed_offset());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use stream_sink::streaming::{
        data_key_for_index, BlockReader, ChunkIndex, InMemoryObjectStore, ObjectStore,
    };

    #[tokio::test]
    async fn test_non_utf8_lines_pass_through() {
        let input: &[u8] = b"caf\xe9\n\xff\xfe\x00\n\nplain";
        let mut lines = input_records(input);
        let mut records = Vec::new();
        while let Some(line) = lines.next_segment().await.unwrap() {
            records.push(line);
        }
        assert_eq!(
            records,
            vec![
                b"caf\xe9".to_vec(),
                b"\xff\xfe\x00".to_vec(),
                Vec::new(),
                b"plain".to_vec(),
            ]
        );

        let dir = tempfile::tempdir().unwrap();
        let config = SinkConfig::test(dir.path().to_path_buf());
        let store = InMemoryObjectStore::new();
        let partition = PartitionKey::new("bar", 0);
        let mut pipeline = PartitionPipeline::new(partition, store.clone(), &config);
        pipeline.open().await.unwrap();
        for (offset, line) in records.iter().enumerate() {
            pipeline
                .write(&SourceRecord::new(offset as u64, line.clone()))
                .unwrap();
        }
        let outcome = pipeline.commit().await.unwrap().unwrap();

        let index = ChunkIndex::from_json(&store.get(&outcome.index_key).await.unwrap()).unwrap();
        let blob = store
            .get(&data_key_for_index(&outcome.index_key).unwrap())
            .await
            .unwrap();
        let stored: Vec<Vec<u8>> = BlockReader::new(config.writer.framing)
            .read_all(&blob, &index)
            .unwrap()
            .into_iter()
            .map(|r| r.payload)
            .collect();
        assert_eq!(stored, records);
    }
}
