//! Error taxonomy for the sink write/resume path
//!
//! Local staging failures, transport failures and index corruption are kept
//! apart so callers can decide what is retryable. `TransportError::NotFound`
//! is only ever treated as success when fetching a partition's pointer.

use std::io::Error as IoError;

/// Error returned by an object store operation
#[derive(Debug)]
pub enum TransportError {
    /// The store reported that the key does not exist
    NotFound { key: String },
    /// Any other store failure
    Other {
        op: &'static str,
        key: String,
        source: IoError,
    },
}

impl TransportError {
    /// Classify an I/O error from the store using the store's NotFound predicate
    pub fn from_io(op: &'static str, key: &str, err: IoError, not_found: bool) -> Self {
        if not_found {
            TransportError::NotFound {
                key: key.to_string(),
            }
        } else {
            TransportError::Other {
                op,
                key: key.to_string(),
                source: err,
            }
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, TransportError::NotFound { .. })
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::NotFound { key } => write!(f, "Object not found: {}", key),
            TransportError::Other { op, key, source } => {
                write!(f, "{} failed for {}: {}", op, key, source)
            }
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TransportError::NotFound { .. } => None,
            TransportError::Other { source, .. } => Some(source),
        }
    }
}

/// Error type for the sink
#[derive(Debug)]
pub enum SinkError {
    /// Local staging storage failure; the current generation must be discarded
    Staging(IoError),
    /// Object store failure
    Transport(TransportError),
    /// Index artifact failed to parse or violates chunk invariants
    CorruptIndex(String),
    /// A chunk's bytes could not be decoded
    CorruptChunk(String),
    /// Chunk list was built out of order (internal bug)
    SequenceInvariant(String),
    /// Attempted to upload a generation with no chunks
    EmptyGeneration,
    /// Record cannot be framed with the configured framing
    InvalidRecord(String),
    /// Source delivered an offset past the next expected one
    SequenceGap { expected: u64, actual: u64 },
    /// Configuration failed to load or validate
    Config(String),
    /// Pipeline operation called in the wrong state
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },
}

impl SinkError {
    pub fn staging(err: IoError) -> Self {
        SinkError::Staging(err)
    }

    /// True if this is a NotFound from the store
    pub fn is_not_found(&self) -> bool {
        matches!(self, SinkError::Transport(t) if t.is_not_found())
    }
}

impl std::fmt::Display for SinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SinkError::Staging(e) => write!(f, "Staging I/O error: {}", e),
            SinkError::Transport(e) => write!(f, "Transport error: {}", e),
            SinkError::CorruptIndex(msg) => write!(f, "Corrupt chunk index: {}", msg),
            SinkError::CorruptChunk(msg) => write!(f, "Corrupt chunk: {}", msg),
            SinkError::SequenceInvariant(msg) => {
                write!(f, "Chunk sequence invariant violated: {}", msg)
            }
            SinkError::EmptyGeneration => write!(f, "Generation has no chunks to upload"),
            SinkError::InvalidRecord(msg) => write!(f, "Invalid record: {}", msg),
            SinkError::SequenceGap { expected, actual } => write!(
                f,
                "Offset gap: expected record {}, source delivered {}",
                expected, actual
            ),
            SinkError::Config(msg) => write!(f, "Configuration error: {}", msg),
            SinkError::InvalidState { expected, actual } => {
                write!(f, "Invalid pipeline state: expected {}, was {}", expected, actual)
            }
        }
    }
}

impl std::error::Error for SinkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SinkError::Staging(e) => Some(e),
            SinkError::Transport(e) => Some(e),
            _ => None,
        }
    }
}

impl From<TransportError> for SinkError {
    fn from(e: TransportError) -> Self {
        SinkError::Transport(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::ErrorKind;

    #[test]
    fn test_transport_classification() {
        let err = TransportError::from_io(
            "get",
            "pfx/key",
            IoError::new(ErrorKind::NotFound, "missing"),
            true,
        );
        assert!(err.is_not_found());

        let err = TransportError::from_io(
            "get",
            "pfx/key",
            IoError::new(ErrorKind::PermissionDenied, "denied"),
            false,
        );
        assert!(!err.is_not_found());
        assert!(err.to_string().contains("get failed for pfx/key"));
    }

    #[test]
    fn test_sink_error_not_found() {
        let err: SinkError = TransportError::NotFound {
            key: "k".to_string(),
        }
        .into();
        assert!(err.is_not_found());
        assert!(!SinkError::EmptyGeneration.is_not_found());
        assert!(!SinkError::CorruptIndex("bad".to_string()).is_not_found());
    }
}
