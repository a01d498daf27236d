//! Generational store orchestrator.
//!
//! Owns both tiers, the routing table, the BM25 manager, and the
//! reranker; every public operation goes through here. The routing table
//! is the linearisation point: a doc_id exists iff it has a routing
//! record, and ANN presence is an optimisation reconciled at open.

pub mod fusion;

use crate::ann::distance::display_similarity;
use crate::ann::{self, IndexKind};
use crate::bm25::{Bm25Manager, Bm25Stats};
use crate::chunk::{Chunk, ChunkInput, MetadataValue, SearchResult};
use crate::clock::{Clock, SystemClock};
use crate::config::{self, EngineConfig};
use crate::embed::{CachedEmbedder, Embedder};
use crate::error::{EngineError, Result};
use crate::metrics::LatencyTracker;
use crate::migrate::{self, MigrationJob, MigrationRegistry};
use crate::rerank::{CrossEncoder, Reranker, RerankOutcome};
use crate::routing::{RoutingRecord, RoutingStats, RoutingTable, Tier};
use crate::select::{self, SelectorInputs, UpgradeAdvice};
use crate::strategy::{self, RetrievalStrategy, TextGenerator};
use crate::tier::{ColdIndex, ColdStats, HotIndex, HotStats, RebuildReport};
use fusion::{rrf_fuse, FusedHit, RankedList};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// A search request against the store.
#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub query: String,
    pub k: usize,
    /// Query-side composition; defaults to plain vector search (or hybrid
    /// when BM25 is enabled).
    pub strategy: Option<RetrievalStrategy>,
    /// Exact-match metadata filter; docs lacking a filtered key are
    /// excluded.
    pub filters: Option<HashMap<String, MetadataValue>>,
    /// Per-request reranker override.
    pub use_rerank: Option<bool>,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>, k: usize) -> Self {
        Self {
            query: query.into(),
            k,
            strategy: None,
            filters: None,
            use_rerank: None,
        }
    }
}

/// Search results plus how they were produced.
#[derive(Debug)]
pub struct SearchResponse {
    pub results: Vec<SearchResult>,
    pub strategy_used: RetrievalStrategy,
    /// Degradation notes: skipped reranker, unavailable cold tier, etc.
    pub advisories: Vec<String>,
}

/// Report from one archive run.
#[derive(Debug, Clone, Serialize)]
pub struct ArchiveReport {
    pub archived: usize,
    pub hot_size_before: usize,
    pub hot_size_after: usize,
    pub cold_size_before: usize,
    pub cold_size_after: usize,
    /// True when the run stopped on its time budget with work remaining.
    pub budget_exhausted: bool,
}

/// Aggregate store statistics.
#[derive(Debug, Serialize)]
pub struct StoreStats {
    pub hot: HotStats,
    pub cold: Option<ColdStats>,
    pub routing: RoutingStats,
    pub bm25: Option<Bm25Stats>,
    pub needs_archive: bool,
    pub needs_cold_rebuild: bool,
    pub reranker_available: bool,
    pub generator_available: bool,
    pub pending_advisories: usize,
}

/// Builder for [`GenerationalStore::open`].
pub struct StoreBuilder {
    config: EngineConfig,
    embedder: Option<Arc<dyn Embedder>>,
    tokenizer: Option<Arc<dyn crate::bm25::tokenizer::Tokenizer>>,
    generator: Option<Arc<dyn TextGenerator>>,
    cross_encoder: Option<Arc<dyn CrossEncoder>>,
    clock: Option<Arc<dyn Clock>>,
}

impl StoreBuilder {
    pub fn embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn tokenizer(mut self, tokenizer: Arc<dyn crate::bm25::tokenizer::Tokenizer>) -> Self {
        self.tokenizer = Some(tokenizer);
        self
    }

    pub fn generator(mut self, generator: Arc<dyn TextGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }

    pub fn cross_encoder(mut self, encoder: Arc<dyn CrossEncoder>) -> Self {
        self.cross_encoder = Some(encoder);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Validate configuration, load persisted state, reconcile, and
    /// return the opened store.
    pub async fn open(self) -> Result<Arc<GenerationalStore>> {
        let embedder = self
            .embedder
            .ok_or_else(|| EngineError::Config("an embedder must be injected".into()))?;
        GenerationalStore::open_inner(
            self.config,
            embedder,
            self.tokenizer
                .unwrap_or_else(|| Arc::new(crate::bm25::tokenizer::DefaultTokenizer)),
            self.generator,
            self.cross_encoder,
            self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
        )
        .await
    }
}

/// The unified two-tier vector store.
pub struct GenerationalStore {
    pub(crate) config: EngineConfig,
    pub(crate) embedder: CachedEmbedder,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) hot: HotIndex,
    pub(crate) cold: Option<ColdIndex>,
    pub(crate) routing: Arc<RoutingTable>,
    pub(crate) bm25: Option<Arc<Bm25Manager>>,
    pub(crate) reranker: Reranker,
    pub(crate) generator: Option<Arc<dyn TextGenerator>>,
    pub(crate) migrations: Arc<MigrationRegistry>,
    search_latency: LatencyTracker,
    query_log: Mutex<VecDeque<Vec<f32>>>,
    advisories: Mutex<Vec<UpgradeAdvice>>,
    bm25_flush: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl GenerationalStore {
    pub fn builder(config: EngineConfig) -> StoreBuilder {
        StoreBuilder {
            config,
            embedder: None,
            tokenizer: None,
            generator: None,
            cross_encoder: None,
            clock: None,
        }
    }

    async fn open_inner(
        config: EngineConfig,
        embedder: Arc<dyn Embedder>,
        tokenizer: Arc<dyn crate::bm25::tokenizer::Tokenizer>,
        generator: Option<Arc<dyn TextGenerator>>,
        cross_encoder: Option<Arc<dyn CrossEncoder>>,
        clock: Arc<dyn Clock>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        if embedder.dimension() != config.dimension {
            return Err(EngineError::Config(format!(
                "configured dimension {} does not match embedder dimension {}",
                config.dimension,
                embedder.dimension()
            )));
        }

        let root = Path::new(&config.root_dir);
        std::fs::create_dir_all(root)?;
        let routing = Arc::new(RoutingTable::open(&root.join("routing.db"))?);
        let stats = routing.stats();

        // Backend choice: saved structure wins; otherwise explicit config,
        // otherwise the selector's rule on the current corpus size.
        let hot_dir = root.join("hot");
        let hot_choice = select::select_index(
            SelectorInputs {
                vector_count: stats.hot,
                dimension: config.dimension,
                memory_budget_bytes: config.memory_budget_mb * 1024 * 1024,
                target_latency_ms: config.target_latency_ms,
            },
            config.hot_index_type,
        );
        let hot = HotIndex::open(
            &hot_dir,
            hot_choice.kind,
            config.dimension,
            hot_choice.params.clone(),
            config.hot_index_max_size,
        )?;

        let cold = if config.enable_generational_index {
            let cold_choice = select::select_index(
                SelectorInputs {
                    vector_count: stats.cold,
                    dimension: config.dimension,
                    memory_budget_bytes: config.memory_budget_mb * 1024 * 1024,
                    target_latency_ms: config.target_latency_ms,
                },
                config.cold_index_type,
            );
            Some(ColdIndex::open(
                &root.join("cold"),
                cold_choice.kind,
                config.dimension,
                cold_choice.params,
            )?)
        } else {
            None
        };

        // Persisted dimension is invariant for the life of the store
        for (name, dim) in [
            ("hot", hot.data.read().overlay.backend.dimension()),
            (
                "cold",
                cold.as_ref()
                    .map(|c| c.data.read().overlay.backend.dimension())
                    .unwrap_or(config.dimension),
            ),
        ] {
            if dim != config.dimension {
                return Err(EngineError::Config(format!(
                    "{name} tier was persisted with dimension {dim}, configured {}",
                    config.dimension
                )));
            }
        }

        let mut advisories = Vec::new();
        if config.index_auto_select {
            let current = hot.kind();
            if current != hot_choice.kind {
                advisories.push(UpgradeAdvice {
                    current,
                    recommended: hot_choice.kind,
                    reason: format!(
                        "saved hot backend is {current} but the selector now suggests {} ({})",
                        hot_choice.kind, hot_choice.reason
                    ),
                });
            }
        }

        let bm25 = if config.enable_bm25 {
            Some(Arc::new(Bm25Manager::open(
                &root.join("bm25.bin"),
                tokenizer,
                config.bm25_k1,
                config.bm25_b,
            )?))
        } else {
            None
        };

        let store = Arc::new(Self {
            reranker: Reranker::new(if config.enable_reranker {
                cross_encoder
            } else {
                None
            }),
            config,
            embedder: CachedEmbedder::new(embedder, config::EMBED_CACHE_CAPACITY),
            clock,
            hot,
            cold,
            routing,
            bm25,
            generator,
            migrations: Arc::new(MigrationRegistry::default()),
            search_latency: LatencyTracker::new(),
            query_log: Mutex::new(VecDeque::with_capacity(config::QUERY_LOG_CAPACITY)),
            advisories: Mutex::new(advisories),
            bm25_flush: Mutex::new(None),
        });

        store.reconcile()?;
        store.sync_bm25()?;
        store.spawn_bm25_flush();
        Ok(store)
    }

    /// Repair divergence between the routing table and the tiers after a
    /// crash. Routing is authoritative: tier content without a routing
    /// record is removed, and routing records whose tier lost the doc are
    /// dropped.
    fn reconcile(&self) -> Result<()> {
        let mut hot_changed = false;
        let mut cold_changed = false;

        let hot_docs: Vec<Uuid> = self.hot.data.read().overlay.chunks.keys().copied().collect();
        for doc_id in hot_docs {
            match self.routing.get(&doc_id) {
                None => {
                    tracing::warn!(%doc_id, "hot doc has no routing record, removing");
                    self.hot.remove_docs(&[doc_id]);
                    hot_changed = true;
                }
                Some(r) if r.tier == Tier::Cold => {
                    tracing::warn!(%doc_id, "doc archived but still in hot, removing from hot");
                    self.hot.remove_docs(&[doc_id]);
                    hot_changed = true;
                }
                Some(_) => {}
            }
        }

        if let Some(cold) = &self.cold {
            let cold_docs: Vec<Uuid> =
                cold.data.read().overlay.chunks.keys().copied().collect();
            for doc_id in cold_docs {
                match self.routing.get(&doc_id) {
                    None => {
                        tracing::warn!(%doc_id, "cold doc has no routing record, soft-deleting");
                        cold.soft_delete(&doc_id);
                        cold_changed = true;
                    }
                    Some(r) if r.tier == Tier::Hot && self.hot.contains(&doc_id) => {
                        tracing::warn!(%doc_id, "doc present in both tiers, keeping hot copy");
                        cold.soft_delete(&doc_id);
                        cold_changed = true;
                    }
                    Some(_) => {}
                }
            }
        }

        let mut dangling = Vec::new();
        for (doc_id, record) in self
            .routing
            .iter_by_tier(Tier::Hot)
            .into_iter()
            .chain(self.routing.iter_by_tier(Tier::Cold))
        {
            let present = match record.tier {
                Tier::Hot => self.hot.contains(&doc_id),
                Tier::Cold => self
                    .cold
                    .as_ref()
                    .map(|c| c.contains(&doc_id))
                    .unwrap_or(false),
            };
            if !present {
                tracing::warn!(%doc_id, tier = record.tier.as_str(), "routing record without stored doc, dropping");
                dangling.push(doc_id);
            }
        }
        if !dangling.is_empty() {
            self.routing.delete_many(&dangling)?;
            if let Some(bm25) = &self.bm25 {
                for doc_id in &dangling {
                    bm25.remove_document(doc_id);
                }
            }
        }

        if hot_changed {
            self.hot.persist()?;
        }
        if cold_changed {
            if let Some(cold) = &self.cold {
                cold.persist()?;
            }
        }
        Ok(())
    }

    /// Catch the BM25 index up with routing: index missing docs, drop
    /// stale ones.
    fn sync_bm25(&self) -> Result<()> {
        let Some(bm25) = &self.bm25 else {
            return Ok(());
        };
        let total = self.routing.len() as u64;
        if bm25.last_synced_vector_count() == total {
            return Ok(());
        }
        tracing::info!(
            indexed = bm25.last_synced_vector_count(),
            routing = total,
            "BM25 catch-up sync"
        );
        let mut added = 0usize;
        for (doc_id, record) in self
            .routing
            .iter_by_tier(Tier::Hot)
            .into_iter()
            .chain(self.routing.iter_by_tier(Tier::Cold))
        {
            if bm25.contains(&doc_id) {
                continue;
            }
            let chunk = match record.tier {
                Tier::Hot => self.hot.chunk_of(&doc_id),
                Tier::Cold => self.cold.as_ref().and_then(|c| c.chunk_of(&doc_id)),
            };
            if let Some(chunk) = chunk {
                bm25.add_document(doc_id, &chunk.content);
                added += 1;
            }
        }
        if added > 0 {
            tracing::info!(added, "BM25 incremental catch-up complete");
        }
        bm25.flush()?;
        Ok(())
    }

    /// Background task that persists BM25 snapshots on an interval when
    /// dirty. Persistence failures are recoverable and retried next tick.
    fn spawn_bm25_flush(self: &Arc<Self>) {
        let Some(bm25) = self.bm25.clone() else {
            return;
        };
        let handle = tokio::spawn(async move {
            let mut tick =
                tokio::time::interval(Duration::from_secs(config::BM25_FLUSH_INTERVAL_SECS));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                let bm25 = Arc::clone(&bm25);
                let result =
                    tokio::task::spawn_blocking(move || bm25.flush()).await;
                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => tracing::warn!("BM25 flush failed, will retry: {e}"),
                    Err(e) => tracing::warn!("BM25 flush task panicked: {e}"),
                }
            }
        });
        *self.bm25_flush.lock() = Some(handle);
    }

    /// Flush pending state and stop background work. The store stays
    /// usable; this is for orderly shutdown.
    pub async fn close(&self) -> Result<()> {
        if let Some(handle) = self.bm25_flush.lock().take() {
            handle.abort();
        }
        if let Some(bm25) = &self.bm25 {
            bm25.flush()?;
        }
        self.hot.persist()?;
        if let Some(cold) = &self.cold {
            cold.persist()?;
        }
        Ok(())
    }

    // ── Write path ─────────────────────────────────────────────────────

    /// Embed and insert chunks for one file. Returns the assigned
    /// doc_ids, contiguous and ordered as the inputs.
    pub async fn add_documents(
        &self,
        file_id: &str,
        inputs: Vec<ChunkInput>,
    ) -> Result<Vec<Uuid>> {
        if inputs.is_empty() {
            return Ok(Vec::new());
        }
        for input in &inputs {
            if input.content.len() > config::MAX_CONTENT_LEN {
                return Err(EngineError::Config(format!(
                    "chunk content of {} bytes exceeds the {} byte limit",
                    input.content.len(),
                    config::MAX_CONTENT_LEN
                )));
            }
        }

        let texts: Vec<String> = inputs.iter().map(|c| c.content.clone()).collect();
        let vectors = self.embedder.embed_batch(&texts).await?;
        for vector in &vectors {
            if vector.len() != self.config.dimension {
                return Err(EngineError::DimensionMismatch {
                    expected: self.config.dimension,
                    got: vector.len(),
                });
            }
        }

        // Capacity: one synchronous archive pass before giving up
        let incoming = inputs.len();
        if self.hot.size() + incoming > self.config.hot_index_max_size {
            if self.cold.is_some() {
                tracing::warn!(
                    size = self.hot.size(),
                    incoming,
                    "hot tier at capacity, attempting synchronous archive"
                );
                self.archive_pass(false).await?;
            }
            if self.hot.size() + incoming > self.config.hot_index_max_size {
                return Err(EngineError::CapacityExceeded {
                    size: self.hot.size(),
                    incoming,
                    max_size: self.config.hot_index_max_size,
                });
            }
        }

        let now = self.clock.now_ms();
        let mut doc_ids = Vec::with_capacity(inputs.len());
        let mut entries = Vec::with_capacity(inputs.len());
        let mut records = Vec::with_capacity(inputs.len());
        for (input, vector) in inputs.into_iter().zip(vectors) {
            let doc_id = Uuid::new_v4();
            doc_ids.push(doc_id);
            records.push((
                doc_id,
                RoutingRecord {
                    tier: Tier::Hot,
                    file_id: file_id.to_string(),
                    created_at_ms: now,
                },
            ));
            entries.push((
                Chunk {
                    doc_id,
                    file_id: file_id.to_string(),
                    content: input.content,
                    metadata: input.metadata,
                    created_at_ms: now,
                },
                vector,
            ));
        }

        self.hot.insert_batch(entries)?;
        if let Err(e) = self.hot.persist() {
            self.hot.remove_docs(&doc_ids);
            return Err(EngineError::Persist(format!(
                "hot tier persistence failed, insert rolled back: {e}"
            )));
        }
        if let Err(e) = self.routing.put_many(&records) {
            // Undo the ANN mutation so memory matches the durable state
            self.hot.remove_docs(&doc_ids);
            let _ = self.hot.persist();
            return Err(EngineError::Persist(format!(
                "routing write failed, insert rolled back: {e}"
            )));
        }

        if let Some(bm25) = &self.bm25 {
            for doc_id in &doc_ids {
                if let Some(chunk) = self.hot.chunk_of(doc_id) {
                    bm25.add_document(*doc_id, &chunk.content);
                }
            }
        }

        tracing::info!(file_id, count = doc_ids.len(), "documents added to hot tier");
        Ok(doc_ids)
    }

    /// Delete every chunk of a file: physical removal from Hot,
    /// soft-deletion in Cold. Returns the number of chunks removed.
    pub async fn delete_by_file(&self, file_id: &str) -> Result<usize> {
        let located = self.routing.by_file_id(file_id);
        if located.is_empty() {
            tracing::warn!(file_id, "delete_by_file found no documents");
            return Ok(0);
        }

        let mut hot_ids = Vec::new();
        let mut cold_ids = Vec::new();
        for (doc_id, record) in &located {
            match record.tier {
                Tier::Hot => hot_ids.push(*doc_id),
                Tier::Cold => cold_ids.push(*doc_id),
            }
        }

        let mut removed = 0usize;
        if !hot_ids.is_empty() {
            removed += self.hot.remove_docs(&hot_ids).len();
            self.hot.persist()?;
        }
        if let Some(cold) = &self.cold {
            for doc_id in &cold_ids {
                if cold.soft_delete(doc_id) {
                    removed += 1;
                }
            }
            if !cold_ids.is_empty() {
                cold.persist()?;
            }
        }

        let all_ids: Vec<Uuid> = located.iter().map(|(id, _)| *id).collect();
        self.routing.delete_many(&all_ids)?;
        if let Some(bm25) = &self.bm25 {
            for doc_id in &all_ids {
                bm25.remove_document(doc_id);
            }
        }

        tracing::info!(file_id, removed, "file deleted");
        Ok(removed)
    }

    // ── Read path ──────────────────────────────────────────────────────

    /// Execute a search under the per-request deadline.
    pub async fn search(&self, request: SearchRequest) -> Result<SearchResponse> {
        let deadline = Duration::from_millis(self.config.request_timeout_ms);
        match tokio::time::timeout(deadline, strategy::execute(self, request)).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::Timeout(self.config.request_timeout_ms)),
        }
    }

    /// Core fused retrieval: embed-free entry point used by every
    /// strategy once it has a query vector.
    pub(crate) async fn fused_search(
        &self,
        query_vector: &[f32],
        bm25_query: Option<&str>,
        rerank_query: Option<&str>,
        k: usize,
        filters: Option<&HashMap<String, MetadataValue>>,
    ) -> Result<(Vec<SearchResult>, Vec<String>)> {
        if k == 0 {
            return Ok((Vec::new(), Vec::new()));
        }
        if query_vector.len() != self.config.dimension {
            return Err(EngineError::DimensionMismatch {
                expected: self.config.dimension,
                got: query_vector.len(),
            });
        }

        let started = Instant::now();
        let mut advisories = Vec::new();
        let oversample = self.config.oversample_factor();
        let hot_k = (k as f32 * self.config.hot_search_oversample * oversample).ceil() as usize;
        let cold_k = (k as f32 * self.config.cold_search_oversample * oversample).ceil() as usize;

        // Hot and Cold ANN scans are CPU-bound: dispatch both to the
        // blocking pool and await them together.
        let hot = self.hot.clone();
        let hot_query = query_vector.to_vec();
        let hot_task =
            tokio::task::spawn_blocking(move || hot.search(&hot_query, hot_k.max(1)));
        let cold_task = self.cold.as_ref().map(|cold| {
            let cold = cold.clone();
            let cold_query = query_vector.to_vec();
            tokio::task::spawn_blocking(move || cold.search(&cold_query, cold_k.max(1)))
        });

        let hot_results = match hot_task.await {
            Ok(results) => results,
            Err(e) => {
                // One retry before surfacing
                tracing::warn!("hot search task failed, retrying once: {e}");
                let hot = self.hot.clone();
                let hot_query = query_vector.to_vec();
                tokio::task::spawn_blocking(move || hot.search(&hot_query, hot_k.max(1)))
                    .await
                    .map_err(|e| {
                        EngineError::BackendUnavailable(format!("hot search failed twice: {e}"))
                    })?
            }
        };
        let cold_results = match cold_task {
            Some(task) => match task.await {
                Ok(results) => results,
                Err(e) => {
                    tracing::warn!("cold search unavailable, serving hot-only results: {e}");
                    advisories.push("cold tier unavailable, results are hot-only".to_string());
                    Vec::new()
                }
            },
            None => Vec::new(),
        };

        let keep = |doc_id: &Uuid| -> bool {
            match filters {
                None => true,
                Some(filter) => self
                    .chunk_for(doc_id)
                    .map(|c| c.matches_filter(filter))
                    .unwrap_or(false),
            }
        };
        let hot_results: Vec<(Uuid, f32)> =
            hot_results.into_iter().filter(|(id, _)| keep(id)).collect();
        let cold_results: Vec<(Uuid, f32)> =
            cold_results.into_iter().filter(|(id, _)| keep(id)).collect();

        let bm25_results: Vec<(Uuid, f32)> = match (bm25_query, &self.bm25) {
            (Some(text), Some(bm25)) => {
                let bm25_k = (k as f32 * oversample).ceil() as usize;
                bm25.search(text, bm25_k)
                    .into_iter()
                    .filter(|(id, _)| keep(id))
                    .collect()
            }
            _ => Vec::new(),
        };

        // When BM25 participates, the vector lists share a fixed budget
        // proportionally to their configured weights.
        let (w_hot, w_cold) = if bm25_results.is_empty() {
            (self.config.w_hot, self.config.w_cold)
        } else {
            let vector_sum = self.config.w_hot + self.config.w_cold;
            if vector_sum > 0.0 {
                let share = config::HYBRID_VECTOR_SHARE / vector_sum;
                (self.config.w_hot * share, self.config.w_cold * share)
            } else {
                (0.0, 0.0)
            }
        };

        let mut lists = vec![
            RankedList {
                entries: &hot_results,
                weight: w_hot,
                carries_distance: true,
            },
            RankedList {
                entries: &cold_results,
                weight: w_cold,
                carries_distance: true,
            },
        ];
        if !bm25_results.is_empty() {
            lists.push(RankedList {
                entries: &bm25_results,
                weight: self.config.w_bm25,
                carries_distance: false,
            });
        }
        let fused = rrf_fuse(&lists);

        // Routing is the source of truth for existence
        let fused: Vec<FusedHit> = fused
            .into_iter()
            .filter(|hit| self.routing.get(&hit.doc_id).is_some())
            .collect();

        let mut results = self.materialize(&fused);

        if let Some(query) = rerank_query {
            if self.config.enable_reranker {
                let (reordered, notes) = self.rerank_results(query, results).await;
                results = reordered;
                advisories.extend(notes);
            }
        }

        results.truncate(k);

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        self.search_latency
            .record(elapsed_ms, k, self.clock.now_ms());
        self.log_query(query_vector);
        self.maybe_advise();

        Ok((results, advisories))
    }

    /// Embed one query text through the memoising cache, checking the
    /// dimension invariant.
    pub(crate) async fn embedder_embed(&self, text: &str) -> Result<Vec<f32>> {
        let vector = self.embedder.embed(text).await?;
        if vector.len() != self.config.dimension {
            return Err(EngineError::DimensionMismatch {
                expected: self.config.dimension,
                got: vector.len(),
            });
        }
        Ok(vector)
    }

    /// Rescore an already-materialized result list with the cross-encoder.
    /// Returns the (possibly reordered) results plus advisory notes.
    pub(crate) async fn rerank_results(
        &self,
        query: &str,
        results: Vec<SearchResult>,
    ) -> (Vec<SearchResult>, Vec<String>) {
        let pool = self.config.rerank_pool_size.min(results.len());
        if pool == 0 {
            return (results, Vec::new());
        }
        let passages: Vec<String> = results[..pool].iter().map(|r| r.content.clone()).collect();
        match self.reranker.rerank(query, &passages).await {
            RerankOutcome::Reranked(order) => {
                let mut reordered = Vec::with_capacity(results.len());
                for (idx, score) in order {
                    let mut hit = results[idx].clone();
                    hit.score = score;
                    reordered.push(hit);
                }
                reordered.extend(results.into_iter().skip(pool));
                (reordered, Vec::new())
            }
            RerankOutcome::Skipped { reason } => {
                (results, vec![format!("reranker skipped: {reason}")])
            }
        }
    }

    fn materialize(&self, fused: &[FusedHit]) -> Vec<SearchResult> {
        fused
            .iter()
            .filter_map(|hit| {
                let chunk = self.chunk_for(&hit.doc_id)?;
                Some(SearchResult {
                    doc_id: hit.doc_id,
                    file_id: chunk.file_id,
                    content: chunk.content,
                    metadata: chunk.metadata,
                    score: hit.score,
                    distance: hit.distance,
                    similarity: hit.distance.map(display_similarity),
                })
            })
            .collect()
    }

    pub(crate) fn chunk_for(&self, doc_id: &Uuid) -> Option<Chunk> {
        self.hot
            .chunk_of(doc_id)
            .or_else(|| self.cold.as_ref().and_then(|c| c.chunk_of(doc_id)))
    }

    fn log_query(&self, query_vector: &[f32]) {
        let mut log = self.query_log.lock();
        if log.len() == config::QUERY_LOG_CAPACITY {
            log.pop_front();
        }
        log.push_back(query_vector.to_vec());
    }

    /// Recent query vectors, newest last. Feeds migration validation.
    pub(crate) fn recent_queries(&self, limit: usize) -> Vec<Vec<f32>> {
        let log = self.query_log.lock();
        log.iter().rev().take(limit).cloned().collect()
    }

    fn maybe_advise(&self) {
        let stats = self.search_latency.stats();
        if stats.count < 8 {
            return;
        }
        let advice = select::upgrade_advice(
            self.hot.kind(),
            stats.avg_ms,
            SelectorInputs {
                vector_count: self.hot.size(),
                dimension: self.config.dimension,
                memory_budget_bytes: self.config.memory_budget_mb * 1024 * 1024,
                target_latency_ms: self.config.target_latency_ms,
            },
        );
        if let Some(advice) = advice {
            let mut advisories = self.advisories.lock();
            let duplicate = advisories
                .iter()
                .any(|a| a.current == advice.current && a.recommended == advice.recommended);
            if !duplicate {
                tracing::info!(
                    current = %advice.current,
                    recommended = %advice.recommended,
                    "upgrade advisory recorded"
                );
                advisories.push(advice);
            }
        }
    }

    /// Drain pending upgrade advisories (maintenance surface).
    pub fn take_advisories(&self) -> Vec<UpgradeAdvice> {
        std::mem::take(&mut *self.advisories.lock())
    }

    // ── Archive path ───────────────────────────────────────────────────

    /// Move aged docs from Hot to Cold. `force` archives everything
    /// regardless of age.
    pub async fn archive_old(&self, force: bool) -> Result<ArchiveReport> {
        if self.cold.is_none() {
            return Err(EngineError::Config(
                "archiving requires the generational index".into(),
            ));
        }
        self.archive_pass(force).await
    }

    async fn archive_pass(&self, force: bool) -> Result<ArchiveReport> {
        let cold = self.cold.as_ref().expect("checked by caller");
        let cutoff = if force {
            u64::MAX
        } else {
            let age_ms = self.config.archive_age_days as u64 * 24 * 60 * 60 * 1000;
            self.clock.now_ms().saturating_sub(age_ms)
        };

        let hot_before = self.hot.size();
        let cold_before = cold.size();
        let budget = Duration::from_secs(config::ARCHIVE_RUN_BUDGET_SECS);
        let started = Instant::now();
        let mut archived = 0usize;
        let mut budget_exhausted = false;

        loop {
            // Oldest first, so a crash mid-run leaves newer data in Hot
            let entries = self.hot.iter_older_than(cutoff, config::ARCHIVE_BATCH_SIZE);
            if entries.is_empty() {
                break;
            }
            let moved: Vec<Uuid> = entries.iter().map(|(id, _, _)| *id).collect();
            let batch_entries: Vec<(Chunk, Vec<f32>)> = entries
                .into_iter()
                .map(|(_, vector, chunk)| (chunk, vector))
                .collect();

            // Order matters for crash safety: cold gains the docs, the
            // routing batch commits the tier flip, then hot drops them.
            cold.add_batch(batch_entries)?;
            cold.persist()?;
            self.routing.set_tier_many(&moved, Tier::Cold)?;
            self.hot.remove_docs(&moved);
            self.hot.persist()?;
            archived += moved.len();

            if started.elapsed() > budget {
                tracing::warn!(
                    archived,
                    "archive run stopped on its time budget; remaining docs wait for the next run"
                );
                budget_exhausted = true;
                break;
            }
        }

        let report = ArchiveReport {
            archived,
            hot_size_before: hot_before,
            hot_size_after: self.hot.size(),
            cold_size_before: cold_before,
            cold_size_after: cold.size(),
            budget_exhausted,
        };
        tracing::info!(
            archived = report.archived,
            hot_after = report.hot_size_after,
            cold_after = report.cold_size_after,
            "archive run complete"
        );
        Ok(report)
    }

    /// Rebuild the Cold tier, dropping soft-deleted entries.
    pub async fn rebuild_cold(&self) -> Result<RebuildReport> {
        let cold = self
            .cold
            .as_ref()
            .ok_or_else(|| EngineError::Config("cold tier is disabled".into()))?
            .clone();
        let (triggered, reason) = cold.should_rebuild();
        let reason = if triggered {
            reason
        } else {
            "manual maintenance request".to_string()
        };
        let report =
            tokio::task::spawn_blocking(move || -> Result<RebuildReport> {
                let report = cold.rebuild(&reason)?;
                cold.persist()?;
                Ok(report)
            })
            .await
            .map_err(|e| EngineError::BackendUnavailable(format!("rebuild task failed: {e}")))??;
        Ok(report)
    }

    // ── Maintenance surface ────────────────────────────────────────────

    pub fn stats(&self) -> StoreStats {
        let hot = self.hot.stats();
        let cold = self.cold.as_ref().map(|c| c.stats());
        let needs_archive =
            hot.size as f32 > self.config.hot_index_max_size as f32 * config::HOT_ARCHIVE_PRESSURE;
        let needs_cold_rebuild = cold.as_ref().map(|c| c.needs_rebuild).unwrap_or(false);
        StoreStats {
            hot,
            cold,
            routing: self.routing.stats(),
            bm25: self.bm25.as_ref().map(|b| b.stats()),
            needs_archive,
            needs_cold_rebuild,
            reranker_available: self.reranker.is_available(),
            generator_available: self.generator.is_some(),
            pending_advisories: self.advisories.lock().len(),
        }
    }

    /// Start an online migration of a tier's backend. Returns the job id.
    pub fn migrate(
        self: &Arc<Self>,
        tier: Tier,
        to_kind: IndexKind,
        params: Option<ann::IndexParams>,
    ) -> Result<Uuid> {
        migrate::spawn_migration(Arc::clone(self), tier, to_kind, params)
    }

    /// Snapshot of a migration job.
    pub fn migration_status(&self, job_id: &Uuid) -> Option<MigrationJob> {
        self.migrations.get(job_id)
    }

    /// The engine configuration this store was opened with.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}
