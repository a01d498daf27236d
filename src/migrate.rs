//! Online index migration.
//!
//! Switches a tier's ANN backend without blocking queries: the new
//! structure is built on the side from a planning snapshot while writes
//! keep flowing to the old backend and into a journal; after recall
//! validation the journal is replayed and the store's reference swaps
//! atomically under a brief write lock.

use crate::ann::{IndexKind, IndexParams};
use crate::chunk::Chunk;
use crate::config::{
    MIGRATION_BATCH_SIZE, MIGRATION_RECALL_THRESHOLD, MIGRATION_VALIDATION_QUERIES,
};
use crate::error::{EngineError, Result};
use crate::routing::Tier;
use crate::select::{self, SelectorInputs};
use crate::store::GenerationalStore;
use crate::tier::overlay::{JournalOp, VectorOverlay};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use uuid::Uuid;

/// Phases of a migration, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MigrationPhase {
    Planning,
    Building,
    Validating,
    Swapping,
    Cleaning,
    Done,
    Failed,
}

/// Snapshot of a migration job.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationJob {
    pub job_id: Uuid,
    pub tier: Tier,
    pub from_kind: IndexKind,
    pub to_kind: IndexKind,
    pub phase: MigrationPhase,
    /// 0.0 – 1.0 across the whole job.
    pub progress: f32,
    pub total_vectors: usize,
    pub migrated_vectors: usize,
    pub started_at_ms: u64,
    pub estimated_secs: u64,
    pub error: Option<String>,
}

/// Job book-keeping. One active migration per tier.
#[derive(Default)]
pub struct MigrationRegistry {
    jobs: Mutex<HashMap<Uuid, MigrationJob>>,
    active: Mutex<HashSet<Tier>>,
}

impl MigrationRegistry {
    pub fn get(&self, job_id: &Uuid) -> Option<MigrationJob> {
        self.jobs.lock().get(job_id).cloned()
    }

    fn try_claim(&self, tier: Tier) -> bool {
        self.active.lock().insert(tier)
    }

    fn release(&self, tier: Tier) {
        self.active.lock().remove(&tier);
    }

    fn update<F: FnOnce(&mut MigrationJob)>(&self, job_id: &Uuid, f: F) {
        if let Some(job) = self.jobs.lock().get_mut(job_id) {
            f(job);
        }
    }
}

/// Rough build-time estimate per target type (seconds).
pub fn estimate_migration_secs(vector_count: usize, to_kind: IndexKind) -> u64 {
    let per_vector = 0.000_02f64;
    let overhead = match to_kind {
        IndexKind::Flat => 1.0,
        IndexKind::Ivf => 1.5,
        IndexKind::IvfPq => 2.0,
        IndexKind::Hnsw => 3.0,
    };
    (vector_count as f64 * per_vector * overhead).ceil() as u64
}

/// Kick off a migration task. Returns the job id immediately.
pub(crate) fn spawn_migration(
    store: Arc<GenerationalStore>,
    tier: Tier,
    to_kind: IndexKind,
    params: Option<IndexParams>,
) -> Result<Uuid> {
    if tier == Tier::Cold && store.cold.is_none() {
        return Err(EngineError::Config("cold tier is disabled".into()));
    }
    if !store.migrations.try_claim(tier) {
        return Err(EngineError::MigrationConflict(tier.as_str().to_string()));
    }

    let (from_kind, total_vectors) = match tier {
        Tier::Hot => (store.hot.kind(), store.hot.size()),
        Tier::Cold => {
            let cold = store.cold.as_ref().expect("checked above");
            (cold.kind(), cold.total_size())
        }
    };
    let params = params.unwrap_or_else(|| {
        select::params_for(
            to_kind,
            SelectorInputs {
                vector_count: total_vectors,
                dimension: store.config.dimension,
                memory_budget_bytes: store.config.memory_budget_mb * 1024 * 1024,
                target_latency_ms: store.config.target_latency_ms,
            },
        )
    });

    let job_id = Uuid::new_v4();
    let job = MigrationJob {
        job_id,
        tier,
        from_kind,
        to_kind,
        phase: MigrationPhase::Planning,
        progress: 0.0,
        total_vectors,
        migrated_vectors: 0,
        started_at_ms: store.clock.now_ms(),
        estimated_secs: estimate_migration_secs(total_vectors, to_kind),
        error: None,
    };
    store.migrations.jobs.lock().insert(job_id, job);
    tracing::info!(
        %job_id,
        tier = tier.as_str(),
        from = %from_kind,
        to = %to_kind,
        total_vectors,
        "migration started"
    );

    tokio::spawn(async move {
        let registry = Arc::clone(&store.migrations);
        let result = tokio::task::spawn_blocking(move || run_migration(&store, job_id, tier, to_kind, params))
            .await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(%job_id, "migration failed: {e}");
                registry.update(&job_id, |job| {
                    job.phase = MigrationPhase::Failed;
                    job.error = Some(e.to_string());
                });
            }
            Err(e) => {
                tracing::error!(%job_id, "migration task panicked: {e}");
                registry.update(&job_id, |job| {
                    job.phase = MigrationPhase::Failed;
                    job.error = Some(format!("task failure: {e}"));
                });
            }
        }
        registry.release(tier);
    });

    Ok(job_id)
}

fn run_migration(
    store: &GenerationalStore,
    job_id: Uuid,
    tier: Tier,
    to_kind: IndexKind,
    params: IndexParams,
) -> Result<()> {
    let registry = &store.migrations;
    let from_kind;

    // Planning: open the journal and snapshot the current doc set under
    // one write lock, so every later write is either in the snapshot or
    // in the journal, never both.
    let snapshot_ids: Vec<Uuid> = match tier {
        Tier::Hot => {
            let mut state = store.hot.data.write();
            from_kind = state.overlay.backend.kind();
            state.overlay.begin_journal();
            state.overlay.chunks.keys().copied().collect()
        }
        Tier::Cold => {
            let cold = store.cold.as_ref().expect("validated by spawn");
            let mut state = cold.data.write();
            from_kind = state.overlay.backend.kind();
            state.overlay.begin_journal();
            state.overlay.chunks.keys().copied().collect()
        }
    };
    registry.update(&job_id, |job| {
        job.phase = MigrationPhase::Building;
        job.progress = 0.1;
    });

    // Guard: on any error below, close the journal before returning.
    let close_journal = || match tier {
        Tier::Hot => {
            store.hot.data.write().overlay.take_journal();
        }
        Tier::Cold => {
            if let Some(cold) = &store.cold {
                cold.data.write().overlay.take_journal();
            }
        }
    };

    let outcome = build_validate_swap(
        store, job_id, tier, from_kind, to_kind, params, &snapshot_ids,
    );
    if outcome.is_err() {
        close_journal();
    }
    outcome
}

fn build_validate_swap(
    store: &GenerationalStore,
    job_id: Uuid,
    tier: Tier,
    from_kind: IndexKind,
    to_kind: IndexKind,
    params: IndexParams,
    snapshot_ids: &[Uuid],
) -> Result<()> {
    let registry = &store.migrations;
    let dimension = store.config.dimension;
    let mut fresh = VectorOverlay::new(to_kind, dimension, params);

    // Building: stream snapshot vectors in batches from the old backend
    let mut migrated = 0usize;
    for batch_ids in snapshot_ids.chunks(MIGRATION_BATCH_SIZE) {
        let entries: Vec<(Chunk, Vec<f32>)> = {
            match tier {
                Tier::Hot => {
                    let state = store.hot.data.read();
                    batch_ids
                        .iter()
                        .filter_map(|id| {
                            let chunk = state.overlay.chunk_of(id)?.clone();
                            let vector = state.overlay.vector_of(id)?;
                            Some((chunk, vector))
                        })
                        .collect()
                }
                Tier::Cold => {
                    let cold = store.cold.as_ref().expect("validated by spawn");
                    let state = cold.data.read();
                    batch_ids
                        .iter()
                        .filter_map(|id| {
                            let chunk = state.overlay.chunk_of(id)?.clone();
                            let vector = state.overlay.vector_of(id)?;
                            Some((chunk, vector))
                        })
                        .collect()
                }
            }
        };
        migrated += entries.len();
        fresh.insert_batch(entries)?;
        registry.update(&job_id, |job| {
            job.migrated_vectors = migrated;
            if !snapshot_ids.is_empty() {
                job.progress = 0.1 + 0.7 * migrated as f32 / snapshot_ids.len() as f32;
            }
        });
    }

    // Validating: recall of the new structure against the old on recent
    // queries. Flat→Flat is exact-to-exact and skips the check.
    registry.update(&job_id, |job| {
        job.phase = MigrationPhase::Validating;
        job.progress = 0.85;
    });
    let exact_pair = from_kind == IndexKind::Flat && to_kind == IndexKind::Flat;
    if !exact_pair && !snapshot_ids.is_empty() {
        let queries = store.recent_queries(MIGRATION_VALIDATION_QUERIES);
        if !queries.is_empty() {
            let snapshot_set: HashSet<Uuid> = snapshot_ids.iter().copied().collect();
            let recall = validation_recall(store, tier, &fresh, &queries, &snapshot_set);
            tracing::info!(%job_id, recall, "migration validation");
            if recall < MIGRATION_RECALL_THRESHOLD {
                return Err(EngineError::BackendUnavailable(format!(
                    "migration validation failed: recall {recall:.3} below {MIGRATION_RECALL_THRESHOLD}"
                )));
            }
        }
    }

    // Swapping: replay the journal into the new structure and swap the
    // reference, all under one brief write lock.
    registry.update(&job_id, |job| {
        job.phase = MigrationPhase::Swapping;
        job.progress = 0.92;
    });
    match tier {
        Tier::Hot => {
            let mut state = store.hot.data.write();
            replay_journal(&mut fresh, state.overlay.take_journal())?;
            state.overlay = fresh;
            state.tombstones.clear();
        }
        Tier::Cold => {
            let cold = store.cold.as_ref().expect("validated by spawn");
            let mut state = cold.data.write();
            replay_journal(&mut fresh, state.overlay.take_journal())?;
            let purged: Vec<Uuid> = state.soft_deleted.iter().copied().collect();
            state.overlay = fresh;
            // Soft-deleted docs were carried into the rebuild snapshot;
            // drop them from the new structure too.
            state.overlay.remove(&purged);
            state.soft_deleted.clear();
        }
    }

    // Cleaning: persist the new structure over the old files
    registry.update(&job_id, |job| {
        job.phase = MigrationPhase::Cleaning;
        job.progress = 0.97;
    });
    match tier {
        Tier::Hot => store.hot.persist()?,
        Tier::Cold => store.cold.as_ref().expect("validated by spawn").persist()?,
    }

    registry.update(&job_id, |job| {
        job.phase = MigrationPhase::Done;
        job.progress = 1.0;
    });
    tracing::info!(%job_id, to = %to_kind, "migration committed");
    Ok(())
}

fn replay_journal(fresh: &mut VectorOverlay, journal: Vec<JournalOp>) -> Result<()> {
    for op in journal {
        match op {
            JournalOp::Add { chunk, vector } => {
                fresh.insert_batch(vec![(chunk, vector)])?;
            }
            JournalOp::Remove { doc_id } => {
                fresh.remove(&[doc_id]);
            }
        }
    }
    Ok(())
}

fn validation_recall(
    store: &GenerationalStore,
    tier: Tier,
    fresh: &VectorOverlay,
    queries: &[Vec<f32>],
    snapshot_set: &HashSet<Uuid>,
) -> f32 {
    let k = 10;
    let mut hit = 0usize;
    let mut want = 0usize;
    for query in queries {
        let old_top: Vec<Uuid> = match tier {
            Tier::Hot => {
                let state = store.hot.data.read();
                state
                    .overlay
                    .search(query, k)
                    .into_iter()
                    .map(|(id, _)| id)
                    .collect()
            }
            Tier::Cold => {
                let cold = store.cold.as_ref().expect("validated by spawn");
                let state = cold.data.read();
                state
                    .overlay
                    .search(query, k)
                    .into_iter()
                    .map(|(id, _)| id)
                    .collect()
            }
        };
        // Docs written after planning live in the journal, not the new
        // structure yet; only the snapshot is comparable.
        let old_top: Vec<Uuid> = old_top
            .into_iter()
            .filter(|id| snapshot_set.contains(id))
            .collect();
        let new_top: HashSet<Uuid> = fresh
            .search(query, k)
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        want += old_top.len();
        hit += old_top.iter().filter(|id| new_top.contains(id)).count();
    }
    if want == 0 {
        1.0
    } else {
        hit as f32 / want as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_scales_with_target_cost() {
        let flat = estimate_migration_secs(1_000_000, IndexKind::Flat);
        let hnsw = estimate_migration_secs(1_000_000, IndexKind::Hnsw);
        assert!(hnsw > flat);
        assert!(flat >= 1);
    }

    #[test]
    fn test_registry_single_active_per_tier() {
        let registry = MigrationRegistry::default();
        assert!(registry.try_claim(Tier::Hot));
        assert!(!registry.try_claim(Tier::Hot));
        assert!(registry.try_claim(Tier::Cold));
        registry.release(Tier::Hot);
        assert!(registry.try_claim(Tier::Hot));
    }

    #[test]
    fn test_registry_update_and_get() {
        let registry = MigrationRegistry::default();
        let job_id = Uuid::new_v4();
        registry.jobs.lock().insert(
            job_id,
            MigrationJob {
                job_id,
                tier: Tier::Hot,
                from_kind: IndexKind::Flat,
                to_kind: IndexKind::Ivf,
                phase: MigrationPhase::Planning,
                progress: 0.0,
                total_vectors: 10,
                migrated_vectors: 0,
                started_at_ms: 0,
                estimated_secs: 1,
                error: None,
            },
        );
        registry.update(&job_id, |job| {
            job.phase = MigrationPhase::Building;
            job.progress = 0.5;
        });
        let job = registry.get(&job_id).unwrap();
        assert_eq!(job.phase, MigrationPhase::Building);
        assert!(registry.get(&Uuid::new_v4()).is_none());
    }
}
