//! Engine configuration: tuning defaults and the runtime [`EngineConfig`].
//!
//! Compile-time defaults live here as constants; per-store settings are
//! carried by `EngineConfig`, validated once at open. Invalid settings are
//! fatal ([`EngineError::Config`](crate::error::EngineError::Config)).

use crate::ann::IndexKind;
use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};

/// Default embedding dimension (matches common hosted embedding models).
pub const DEFAULT_DIMENSION: usize = 1536;

/// Maximum allowed embedding dimension.
pub const MAX_DIMENSION: usize = 8192;

/// Maximum length of chunk content in bytes.
pub const MAX_CONTENT_LEN: usize = 1_000_000;

/// Default capacity of the Hot tier in vectors.
pub const DEFAULT_HOT_MAX_SIZE: usize = 1_000_000;

/// Default document age, in days, before a chunk is archived to Cold.
pub const DEFAULT_ARCHIVE_AGE_DAYS: u32 = 30;

/// Default cron-style archive schedule: daily at 02:00 local time.
pub const DEFAULT_ARCHIVE_SCHEDULE: &str = "0 2 * * *";

/// Number of routing records migrated per archive batch.
pub const ARCHIVE_BATCH_SIZE: usize = 1_000;

/// Wall-clock budget for a single archive run, in seconds.
pub const ARCHIVE_RUN_BUDGET_SECS: u64 = 30 * 60;

/// Reciprocal Rank Fusion constant `C` in `w / (rank + C)`.
pub const RRF_C: f32 = 60.0;

/// Default RRF weight of the Hot tier list.
pub const DEFAULT_W_HOT: f32 = 0.7;

/// Default RRF weight of the Cold tier list.
pub const DEFAULT_W_COLD: f32 = 0.3;

/// Default RRF weight of the BM25 list when hybrid retrieval is enabled.
pub const DEFAULT_W_BM25: f32 = 0.3;

/// Share of the fused weight budget given to the vector lists when BM25
/// participates; BM25 takes the rest via `W_bm25`.
pub const HYBRID_VECTOR_SHARE: f32 = 0.7;

/// Hot tier share of the global oversample factor.
pub const DEFAULT_HOT_OVERSAMPLE: f32 = 0.7;

/// Cold tier share of the global oversample factor.
pub const DEFAULT_COLD_OVERSAMPLE: f32 = 0.5;

/// Global oversample factor when reranking is enabled.
pub const OVERSAMPLE_WITH_RERANK: f32 = 3.0;

/// Global oversample factor when reranking is disabled.
pub const OVERSAMPLE_WITHOUT_RERANK: f32 = 1.5;

/// BM25 Okapi term frequency saturation parameter.
pub const DEFAULT_BM25_K1: f32 = 1.2;

/// BM25 Okapi document length normalization parameter.
pub const DEFAULT_BM25_B: f32 = 0.75;

/// Seconds between batched BM25 snapshot writes.
pub const BM25_FLUSH_INTERVAL_SECS: u64 = 30;

/// Number of fused candidates handed to the cross-encoder.
pub const DEFAULT_RERANK_POOL_SIZE: usize = 20;

/// Cross-encoder batch size.
pub const RERANK_BATCH_SIZE: usize = 32;

/// Cold search oversampling multiplier applied to `k` before the
/// soft-delete filter.
pub const COLD_OVERSAMPLE_FLOOR: usize = 3;

/// Cold rebuild trigger: minimum soft-deletion rate.
pub const COLD_REBUILD_DELETION_RATE: f32 = 0.3;

/// Cold rebuild trigger: minimum absolute soft-deleted count.
pub const COLD_REBUILD_MIN_DELETED: usize = 1_000;

/// Hot utilisation ratio above which `stats()` reports `needs_archive`.
pub const HOT_ARCHIVE_PRESSURE: f32 = 0.8;

/// Vectors streamed per migration batch.
pub const MIGRATION_BATCH_SIZE: usize = 10_000;

/// Validation queries sampled from the recent query log during migration.
pub const MIGRATION_VALIDATION_QUERIES: usize = 100;

/// Minimum recall@k required for a migration to commit.
pub const MIGRATION_RECALL_THRESHOLD: f32 = 0.9;

/// Training sample multiplier: IVF-family backends train on
/// `64 * nlist` vectors (capped at the corpus size).
pub const TRAIN_SAMPLES_PER_LIST: usize = 64;

/// Per-request timeout in milliseconds.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;

/// Default memory budget for the adaptive selector, in megabytes.
pub const DEFAULT_MEMORY_BUDGET_MB: usize = 4_096;

/// Default target search latency for the adaptive selector, in milliseconds.
pub const DEFAULT_TARGET_LATENCY_MS: u64 = 100;

/// Capacity of the recent-query ring buffer used for migration validation.
pub const QUERY_LOG_CAPACITY: usize = 256;

/// Capacity of the embedding memo-cache (entries).
pub const EMBED_CACHE_CAPACITY: u64 = 10_000;

/// Runtime configuration for a [`GenerationalStore`](crate::GenerationalStore).
///
/// Construct with [`EngineConfig::new`] and adjust fields before `open`;
/// `validate` runs automatically at open and rejects inconsistent settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// State directory. Layout: `hot/*`, `cold/*`, `bm25.bin`, `routing.db`.
    pub root_dir: String,
    /// Embedding dimension; must equal the injected embedder's dimension.
    pub dimension: usize,
    /// When false, only the Hot tier is created and archiving is disabled.
    pub enable_generational_index: bool,
    /// Hot tier capacity in vectors.
    pub hot_index_max_size: usize,
    /// Backend for the Hot tier. `None` defers to the adaptive selector.
    pub hot_index_type: Option<IndexKind>,
    /// Backend for the Cold tier. `None` defers to the adaptive selector.
    pub cold_index_type: Option<IndexKind>,
    /// Age in days before a Hot chunk becomes eligible for archiving.
    pub archive_age_days: u32,
    /// Cron-style schedule (`minute hour * * *`) for the archive task.
    pub archive_schedule: String,
    /// Hot share of the global oversample factor.
    pub hot_search_oversample: f32,
    /// Cold share of the global oversample factor.
    pub cold_search_oversample: f32,
    /// RRF weight of the Hot list. Must be non-negative.
    pub w_hot: f32,
    /// RRF weight of the Cold list. Must be non-negative.
    pub w_cold: f32,
    /// RRF weight of the BM25 list. Must be non-negative.
    pub w_bm25: f32,
    /// Enables BM25 hybrid retrieval.
    pub enable_bm25: bool,
    /// BM25 k1 parameter.
    pub bm25_k1: f32,
    /// BM25 b parameter.
    pub bm25_b: f32,
    /// Enables cross-encoder reranking when a cross encoder is injected.
    pub enable_reranker: bool,
    /// Number of fused candidates rescored by the cross-encoder.
    pub rerank_pool_size: usize,
    /// Lets the selector pick backends from corpus size at open.
    pub index_auto_select: bool,
    /// Advisory memory budget consulted by the selector, in MB.
    pub memory_budget_mb: usize,
    /// Target search latency consulted for upgrade advice, in ms.
    pub target_latency_ms: u64,
    /// Per-request deadline in milliseconds.
    pub request_timeout_ms: u64,
}

impl EngineConfig {
    /// Creates a configuration with defaults rooted at `root_dir`.
    pub fn new(root_dir: impl Into<String>) -> Self {
        Self {
            root_dir: root_dir.into(),
            dimension: DEFAULT_DIMENSION,
            enable_generational_index: true,
            hot_index_max_size: DEFAULT_HOT_MAX_SIZE,
            hot_index_type: None,
            cold_index_type: None,
            archive_age_days: DEFAULT_ARCHIVE_AGE_DAYS,
            archive_schedule: DEFAULT_ARCHIVE_SCHEDULE.to_string(),
            hot_search_oversample: DEFAULT_HOT_OVERSAMPLE,
            cold_search_oversample: DEFAULT_COLD_OVERSAMPLE,
            w_hot: DEFAULT_W_HOT,
            w_cold: DEFAULT_W_COLD,
            w_bm25: DEFAULT_W_BM25,
            enable_bm25: true,
            bm25_k1: DEFAULT_BM25_K1,
            bm25_b: DEFAULT_BM25_B,
            enable_reranker: false,
            rerank_pool_size: DEFAULT_RERANK_POOL_SIZE,
            index_auto_select: true,
            memory_budget_mb: DEFAULT_MEMORY_BUDGET_MB,
            target_latency_ms: DEFAULT_TARGET_LATENCY_MS,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
        }
    }

    /// Validates the configuration. Fatal at open.
    pub fn validate(&self) -> Result<()> {
        if self.root_dir.is_empty() {
            return Err(EngineError::Config("root_dir must not be empty".into()));
        }
        if self.dimension == 0 || self.dimension > MAX_DIMENSION {
            return Err(EngineError::Config(format!(
                "dimension {} out of range (1..={MAX_DIMENSION})",
                self.dimension
            )));
        }
        if self.hot_index_max_size == 0 {
            return Err(EngineError::Config(
                "hot_index_max_size must be positive".into(),
            ));
        }
        for (name, w) in [
            ("w_hot", self.w_hot),
            ("w_cold", self.w_cold),
            ("w_bm25", self.w_bm25),
        ] {
            if !w.is_finite() || w < 0.0 {
                return Err(EngineError::Config(format!(
                    "{name} must be a non-negative finite number, got {w}"
                )));
            }
        }
        for (name, v) in [
            ("hot_search_oversample", self.hot_search_oversample),
            ("cold_search_oversample", self.cold_search_oversample),
        ] {
            if !v.is_finite() || v <= 0.0 {
                return Err(EngineError::Config(format!(
                    "{name} must be positive, got {v}"
                )));
            }
        }
        if !(0.0..=1.0).contains(&self.bm25_b) {
            return Err(EngineError::Config(format!(
                "bm25_b must be in [0, 1], got {}",
                self.bm25_b
            )));
        }
        if self.bm25_k1 <= 0.0 {
            return Err(EngineError::Config(format!(
                "bm25_k1 must be positive, got {}",
                self.bm25_k1
            )));
        }
        if self.rerank_pool_size == 0 {
            return Err(EngineError::Config(
                "rerank_pool_size must be positive".into(),
            ));
        }
        parse_schedule(&self.archive_schedule)?;
        Ok(())
    }

    /// Global oversample factor for tier fan-out.
    pub fn oversample_factor(&self) -> f32 {
        if self.enable_reranker {
            OVERSAMPLE_WITH_RERANK
        } else {
            OVERSAMPLE_WITHOUT_RERANK
        }
    }
}

/// A parsed daily schedule: fire at `hour:minute` local time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DailySchedule {
    pub minute: u32,
    pub hour: u32,
}

/// Parses the `minute hour * * *` subset of cron used by the archive task.
///
/// Day-of-month, month, and day-of-week fields are accepted but must be `*`;
/// the scheduler fires daily.
pub fn parse_schedule(expr: &str) -> Result<DailySchedule> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(EngineError::Config(format!(
            "archive_schedule must have 5 cron fields, got {} in {expr:?}",
            fields.len()
        )));
    }
    let minute: u32 = fields[0]
        .parse()
        .map_err(|_| EngineError::Config(format!("invalid cron minute {:?}", fields[0])))?;
    let hour: u32 = fields[1]
        .parse()
        .map_err(|_| EngineError::Config(format!("invalid cron hour {:?}", fields[1])))?;
    if minute > 59 || hour > 23 {
        return Err(EngineError::Config(format!(
            "cron time {hour:02}:{minute:02} out of range"
        )));
    }
    for f in &fields[2..] {
        if *f != "*" {
            return Err(EngineError::Config(format!(
                "only daily schedules are supported, got field {f:?}"
            )));
        }
    }
    Ok(DailySchedule { minute, hour })
}
