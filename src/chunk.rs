//! Core chunk types.
//!
//! A [`Chunk`] is the atomic indexed unit: a piece of extracted document
//! text with its embedding, metadata, and provenance (`file_id`). Many
//! chunks share one `file_id`. [`MetadataValue`] restricts metadata to
//! primitives so that exact-match filtering stays decidable.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// A typed metadata value attached to a chunk.
///
/// Used for exact-match filtering in search queries. Uses the default
/// externally-tagged serde representation for bincode compatibility.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MetadataValue {
    /// Boolean value (`true` / `false`).
    Boolean(bool),
    /// 64-bit signed integer.
    Integer(i64),
    /// 64-bit floating-point number.
    Float(f64),
    /// UTF-8 string.
    String(String),
}

impl From<&str> for MetadataValue {
    fn from(s: &str) -> Self {
        MetadataValue::String(s.to_string())
    }
}

impl From<i64> for MetadataValue {
    fn from(v: i64) -> Self {
        MetadataValue::Integer(v)
    }
}

impl From<bool> for MetadataValue {
    fn from(v: bool) -> Self {
        MetadataValue::Boolean(v)
    }
}

/// Caller-supplied input for one chunk: content plus metadata.
///
/// The store assigns the `doc_id`, `created_at` timestamp, and embedding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkInput {
    /// UTF-8 text content, at most
    /// [`MAX_CONTENT_LEN`](crate::config::MAX_CONTENT_LEN) bytes.
    pub content: String,
    /// Arbitrary key-value metadata for filtering.
    pub metadata: HashMap<String, MetadataValue>,
}

impl ChunkInput {
    /// Creates an input chunk with empty metadata.
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            metadata: HashMap::new(),
        }
    }

    /// Adds one metadata entry, builder-style.
    pub fn with_metadata(mut self, key: impl Into<String>, value: MetadataValue) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// A stored chunk: the persisted unit inside a tier.
///
/// The embedding vector lives in the tier's ANN backend; the chunk record
/// holds everything else needed to serve results and archive batches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    /// Globally unique identifier, assigned at insert.
    pub doc_id: Uuid,
    /// External correlation id supplied by the caller; many chunks per file.
    pub file_id: String,
    /// UTF-8 text content.
    pub content: String,
    /// Key-value metadata for filtering.
    pub metadata: HashMap<String, MetadataValue>,
    /// Insert timestamp in milliseconds since the Unix epoch.
    pub created_at_ms: u64,
}

impl Chunk {
    /// Returns true if every `(key, value)` pair in `filter` matches this
    /// chunk's metadata exactly. Chunks lacking a filtered key never match.
    pub fn matches_filter(&self, filter: &HashMap<String, MetadataValue>) -> bool {
        filter
            .iter()
            .all(|(k, v)| self.metadata.get(k) == Some(v))
    }
}

/// One search hit returned to the caller.
#[derive(Debug, Clone)]
pub struct SearchResult {
    /// The matched chunk's id.
    pub doc_id: Uuid,
    /// Source file id.
    pub file_id: String,
    /// Chunk text.
    pub content: String,
    /// Chunk metadata.
    pub metadata: HashMap<String, MetadataValue>,
    /// Ranking score. Fused RRF score, or the cross-encoder score when
    /// reranking ran (higher = more relevant).
    pub score: f32,
    /// Raw L2 distance from the winning vector list, when the hit came
    /// from a vector tier. `None` for BM25-only hits.
    pub distance: Option<f32>,
    /// Derived display similarity `1 − distance` for vector hits.
    /// Ranking display only; never used internally.
    pub similarity: Option<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matches_filter_exact() {
        let mut metadata = HashMap::new();
        metadata.insert("lang".to_string(), MetadataValue::from("en"));
        metadata.insert("page".to_string(), MetadataValue::Integer(3));
        let chunk = Chunk {
            doc_id: Uuid::new_v4(),
            file_id: "f1".into(),
            content: "hello".into(),
            metadata,
            created_at_ms: 0,
        };

        let mut filter = HashMap::new();
        filter.insert("lang".to_string(), MetadataValue::from("en"));
        assert!(chunk.matches_filter(&filter));

        filter.insert("page".to_string(), MetadataValue::Integer(4));
        assert!(!chunk.matches_filter(&filter));
    }

    #[test]
    fn test_missing_key_excludes() {
        let chunk = Chunk {
            doc_id: Uuid::new_v4(),
            file_id: "f1".into(),
            content: "hello".into(),
            metadata: HashMap::new(),
            created_at_ms: 0,
        };
        let mut filter = HashMap::new();
        filter.insert("lang".to_string(), MetadataValue::from("en"));
        assert!(!chunk.matches_filter(&filter));
    }

    #[test]
    fn test_empty_filter_matches_all() {
        let chunk = Chunk {
            doc_id: Uuid::new_v4(),
            file_id: "f1".into(),
            content: "hello".into(),
            metadata: HashMap::new(),
            created_at_ms: 0,
        };
        assert!(chunk.matches_filter(&HashMap::new()));
    }

    #[test]
    fn test_chunk_input_builder() {
        let input = ChunkInput::new("text").with_metadata("k", MetadataValue::Boolean(true));
        assert_eq!(input.content, "text");
        assert_eq!(
            input.metadata.get("k"),
            Some(&MetadataValue::Boolean(true))
        );
    }
}
