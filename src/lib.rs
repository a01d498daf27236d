//! # stratadb
//!
//! A generational vector retrieval engine for document RAG workloads:
//! embedded chunks flow into a churnable **Hot** tier, age into a
//! read-optimised **Cold** tier, and are searched through both with
//! reciprocal rank fusion, optional BM25 hybrid retrieval, and optional
//! cross-encoder reranking.
//!
//! ## Features
//!
//! - **Two-tier ANN store**: Hot absorbs inserts and physical deletes;
//!   Cold holds archived data with soft deletion and batch rebuilds
//! - **Four index backends** (Flat, IVF, IVF-PQ, HNSW) behind one tagged
//!   enum, picked by an adaptive selector from corpus size and memory budget
//! - **Online migration** between backends with write journaling, recall
//!   validation, and an atomic swap
//! - **Hybrid retrieval**: BM25 inverted index kept in sync with the
//!   vector tiers, fused via weighted RRF
//! - **Durable routing table**: append-only framed log with periodic
//!   compaction; the linearisation point for document existence
//! - **Archive scheduler**: cron-style background migration of aged chunks
//!
//! ## Architecture
//!
//! ```text
//! add_documents → Embedder → Hot tier → Routing table → BM25
//! search        → Embedder → { Hot ∥ Cold ∥ BM25 } → RRF → Reranker → top-k
//! archive       → Routing (age scan) → Cold.add → Routing.set_tier → Hot.remove
//! ```

/// ANN index backends: Flat, IVF, IVF-PQ, and HNSW behind a tagged enum.
pub mod ann;
/// BM25 full-text search: inverted index, Okapi BM25 scoring, and tokenization.
pub mod bm25;
/// Core chunk types: `Chunk`, `MetadataValue`, and search result types.
pub mod chunk;
/// Injected clock for testable time-based behaviour.
pub mod clock;
/// Engine configuration: recognised options, defaults, and open-time validation.
pub mod config;
/// Embedder trait and memoising cache wrapper.
pub mod embed;
/// Engine error kinds.
pub mod error;
/// Rolling latency samples used for upgrade advice.
pub mod metrics;
/// Online index migration with journaled writes and atomic swap.
pub mod migrate;
/// Atomic snapshot writes with CRC32 footers.
pub mod persist;
/// Cross-encoder reranking with lazy initialisation and failure fallback.
pub mod rerank;
/// Durable routing table: `doc_id → {tier, file_id, created_at}`.
pub mod routing;
/// Archive scheduler: timed Hot → Cold migration.
pub mod scheduler;
/// Adaptive index selection by corpus size, memory budget, and latency.
pub mod select;
/// Generational store orchestrator and RRF fusion.
pub mod store;
/// Query-side retrieval strategies: vector, hybrid, HyDE, Query2Doc,
/// decomposition, parent-child.
pub mod strategy;
/// Hot and Cold index tiers.
pub mod tier;

pub use chunk::{Chunk, ChunkInput, MetadataValue, SearchResult};
pub use config::EngineConfig;
pub use error::{EngineError, Result};
pub use store::GenerationalStore;
