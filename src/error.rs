//! Engine error kinds.
//!
//! All public APIs return [`Result<T>`]. Recoverable conditions (BM25
//! persistence, reranker failures, archive batch failures) are handled at
//! the call site and logged; everything that affects the correctness of an
//! `add`, `delete`, or `search` surfaces as an [`EngineError`].

use thiserror::Error;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Top-level error enum for all engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Input vector dimension does not match the configured dimension.
    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    /// Hot tier is full and a synchronous archive pass could not make room.
    #[error("hot index capacity exceeded: {size} + {incoming} > {max_size}")]
    CapacityExceeded {
        size: usize,
        incoming: usize,
        max_size: usize,
    },

    /// A doc_id or file_id has no routing record.
    #[error("not found: {0}")]
    NotFound(String),

    /// ANN backend returned an internal error or was mid-swap.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Embedding provider failure.
    #[error("embedding failed: {0}")]
    Embed(String),

    /// Cross-encoder failure.
    #[error("reranker failed: {0}")]
    Rerank(String),

    /// Text generator failure (HyDE / Query2Doc / decomposition).
    #[error("generation failed: {0}")]
    Generation(String),

    /// Routing or backend persistence failed; the in-memory mutation that
    /// caused it has been rolled back.
    #[error("persistence failed: {0}")]
    Persist(String),

    /// Request exceeded its deadline.
    #[error("request timed out after {0} ms")]
    Timeout(u64),

    /// A migration is already in progress for the tier.
    #[error("migration already in progress for {0} tier")]
    MigrationConflict(String),

    /// Invalid configuration. Fatal at open.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// I/O error from the storage layer.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Snapshot serialization error.
    #[error("serialization error: {0}")]
    Codec(#[from] bincode::Error),
}

impl EngineError {
    /// Short machine-readable kind tag, stable across message changes.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::DimensionMismatch { .. } => "dimension_mismatch",
            EngineError::CapacityExceeded { .. } => "capacity_exceeded",
            EngineError::NotFound(_) => "not_found",
            EngineError::BackendUnavailable(_) => "backend_unavailable",
            EngineError::Embed(_) => "embed_error",
            EngineError::Rerank(_) => "reranker_error",
            EngineError::Generation(_) => "generation_error",
            EngineError::Persist(_) => "persist_error",
            EngineError::Timeout(_) => "timeout",
            EngineError::MigrationConflict(_) => "migration_conflict",
            EngineError::Config(_) => "config_error",
            EngineError::Io(_) => "io_error",
            EngineError::Codec(_) => "codec_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_tags() {
        let e = EngineError::DimensionMismatch {
            expected: 4,
            got: 8,
        };
        assert_eq!(e.kind(), "dimension_mismatch");
        assert!(e.to_string().contains("expected 4"));

        let e = EngineError::MigrationConflict("hot".into());
        assert_eq!(e.kind(), "migration_conflict");
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let e: EngineError = io.into();
        assert_eq!(e.kind(), "io_error");
    }
}
