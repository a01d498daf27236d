//! Cold tier: read-optimised archive store.
//!
//! Receives batches only from the archive flow, never from callers.
//! Deletion is always soft; soft-deleted docs are filtered at query time
//! and physically dropped by [`ColdIndex::rebuild`], triggered manually or
//! when the deletion rate crosses the threshold.

use crate::ann::{self, IndexKind, IndexParams};
use crate::chunk::Chunk;
use crate::config::{COLD_OVERSAMPLE_FLOOR, COLD_REBUILD_DELETION_RATE, COLD_REBUILD_MIN_DELETED};
use crate::error::{EngineError, Result};
use crate::persist;
use crate::tier::overlay::{OverlaySnapshot, VectorOverlay};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

/// Mutable Cold tier state, guarded by the tier rwlock.
#[derive(Debug)]
pub struct ColdState {
    pub overlay: VectorOverlay,
    pub soft_deleted: HashSet<Uuid>,
    pub total_added: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct ColdSnapshot {
    overlay: OverlaySnapshot,
    soft_deleted: HashSet<Uuid>,
    total_added: u64,
}

/// Snapshot stats for the Cold tier.
#[derive(Debug, Clone, Serialize)]
pub struct ColdStats {
    pub kind: String,
    pub size: usize,
    pub soft_deleted: usize,
    pub deletion_rate: f32,
    pub needs_rebuild: bool,
    /// Resident bytes of the live backend structure.
    pub memory_bytes: usize,
    pub total_added: u64,
}

/// Outcome of a Cold rebuild.
#[derive(Debug, Clone, Serialize)]
pub struct RebuildReport {
    pub reason: String,
    pub dropped: usize,
    pub surviving: usize,
}

/// The archive tier.
#[derive(Debug, Clone)]
pub struct ColdIndex {
    dir: PathBuf,
    pub data: Arc<RwLock<ColdState>>,
}

impl ColdIndex {
    /// Open the Cold tier under `dir`.
    pub fn open(dir: &Path, kind: IndexKind, dimension: usize, params: IndexParams) -> Result<Self> {
        let state = match ann::load_backend(dir)? {
            Some((backend, meta)) => {
                let snapshot: ColdSnapshot = persist::load_snapshot(&dir.join("ids.bin"))?;
                let overlay = VectorOverlay::from_parts(backend, meta.params, snapshot.overlay);
                overlay.validate().map_err(|e| {
                    EngineError::Persist(format!("cold tier snapshot failed validation: {e}"))
                })?;
                tracing::info!(
                    kind = %meta.kind,
                    size = overlay.size(),
                    soft_deleted = snapshot.soft_deleted.len(),
                    "loaded cold tier"
                );
                ColdState {
                    overlay,
                    soft_deleted: snapshot.soft_deleted,
                    total_added: snapshot.total_added,
                }
            }
            None => {
                tracing::info!(kind = %kind, "creating new cold tier");
                ColdState {
                    overlay: VectorOverlay::new(kind, dimension, params),
                    soft_deleted: HashSet::new(),
                    total_added: 0,
                }
            }
        };
        Ok(Self {
            dir: dir.to_path_buf(),
            data: Arc::new(RwLock::new(state)),
        })
    }

    /// Docs currently stored, including soft-deleted ones awaiting rebuild.
    pub fn total_size(&self) -> usize {
        self.data.read().overlay.size()
    }

    /// Live (not soft-deleted) docs.
    pub fn size(&self) -> usize {
        let state = self.data.read();
        state.overlay.size() - state.soft_deleted.len()
    }

    /// Insert an archive batch. Called only by the archive/migration flow.
    pub fn add_batch(&self, entries: Vec<(Chunk, Vec<f32>)>) -> Result<()> {
        let mut state = self.data.write();
        let n = entries.len() as u64;
        state.overlay.insert_batch(entries)?;
        state.total_added += n;
        Ok(())
    }

    /// Soft-delete a doc. Idempotent; unknown ids return false.
    pub fn soft_delete(&self, doc_id: &Uuid) -> bool {
        let mut state = self.data.write();
        if !state.overlay.contains(doc_id) {
            return false;
        }
        state.soft_deleted.insert(*doc_id)
    }

    /// Top-k search. Oversamples internally so that soft-deleted filtering
    /// still leaves `k` candidates; the oversample widens with the
    /// deletion rate.
    pub fn search(&self, query: &[f32], k: usize) -> Vec<(Uuid, f32)> {
        if k == 0 {
            return Vec::new();
        }
        let state = self.data.read();
        let rate = deletion_rate(&state);
        let widened = (k as f32 * (1.0 + 2.0 * rate)).ceil() as usize;
        let fetch = widened.max(k * COLD_OVERSAMPLE_FLOOR);
        state
            .overlay
            .search(query, fetch)
            .into_iter()
            .filter(|(doc_id, _)| !state.soft_deleted.contains(doc_id))
            .take(k)
            .collect()
    }

    pub fn chunk_of(&self, doc_id: &Uuid) -> Option<Chunk> {
        let state = self.data.read();
        if state.soft_deleted.contains(doc_id) {
            return None;
        }
        state.overlay.chunk_of(doc_id).cloned()
    }

    /// Whether the doc is present and live.
    pub fn contains(&self, doc_id: &Uuid) -> bool {
        let state = self.data.read();
        state.overlay.contains(doc_id) && !state.soft_deleted.contains(doc_id)
    }

    pub fn deletion_rate(&self) -> f32 {
        deletion_rate(&self.data.read())
    }

    /// Rebuild trigger check: `(should_rebuild, reason)`.
    pub fn should_rebuild(&self) -> (bool, String) {
        let state = self.data.read();
        let rate = deletion_rate(&state);
        let deleted = state.soft_deleted.len();
        if rate > COLD_REBUILD_DELETION_RATE && deleted > COLD_REBUILD_MIN_DELETED {
            (
                true,
                format!("deletion rate {:.1}% across {deleted} soft-deleted docs", rate * 100.0),
            )
        } else {
            (false, "below rebuild thresholds".to_string())
        }
    }

    /// Drain soft-deleted entries by reconstructing the backend from the
    /// survivors. The write lock is held for the duration; Cold rebuilds
    /// are infrequent, batch-scheduled work.
    pub fn rebuild(&self, reason: &str) -> Result<RebuildReport> {
        let mut state = self.data.write();
        let dropped = state.soft_deleted.len();

        let survivors: Vec<(Chunk, Vec<f32>)> = {
            let mut ids: Vec<&Chunk> = state
                .overlay
                .chunks
                .values()
                .filter(|c| !state.soft_deleted.contains(&c.doc_id))
                .collect();
            ids.sort_by(|a, b| {
                a.created_at_ms
                    .cmp(&b.created_at_ms)
                    .then(a.doc_id.cmp(&b.doc_id))
            });
            ids.into_iter()
                .filter_map(|c| state.overlay.vector_of(&c.doc_id).map(|v| (c.clone(), v)))
                .collect()
        };

        let dimension = state.overlay.backend.dimension();
        let kind = state.overlay.backend.kind();
        let params = state.overlay.params.clone();
        let mut fresh = VectorOverlay::new(kind, dimension, params);
        let surviving = survivors.len();
        fresh.insert_batch(survivors)?;

        state.overlay = fresh;
        state.soft_deleted.clear();
        tracing::info!(reason, dropped, surviving, "cold tier rebuilt");
        Ok(RebuildReport {
            reason: reason.to_string(),
            dropped,
            surviving,
        })
    }

    /// Persist the backend and bookkeeping under the tier dir.
    pub fn persist(&self) -> Result<()> {
        let state = self.data.read();
        ann::save_backend(&state.overlay.backend, &state.overlay.params, &self.dir)?;
        let snapshot = ColdSnapshot {
            overlay: state.overlay.snapshot(),
            soft_deleted: state.soft_deleted.clone(),
            total_added: state.total_added,
        };
        persist::save_snapshot(&snapshot, &self.dir.join("ids.bin"))?;
        Ok(())
    }

    pub fn stats(&self) -> ColdStats {
        let state = self.data.read();
        let rate = deletion_rate(&state);
        let deleted = state.soft_deleted.len();
        ColdStats {
            kind: state.overlay.backend.kind().to_string(),
            size: state.overlay.size() - deleted,
            soft_deleted: deleted,
            deletion_rate: rate,
            needs_rebuild: rate > COLD_REBUILD_DELETION_RATE && deleted > COLD_REBUILD_MIN_DELETED,
            memory_bytes: state.overlay.backend.memory_bytes(),
            total_added: state.total_added,
        }
    }

    pub fn kind(&self) -> IndexKind {
        self.data.read().overlay.backend.kind()
    }
}

fn deletion_rate(state: &ColdState) -> f32 {
    let total = state.overlay.size();
    if total == 0 {
        return 0.0;
    }
    state.soft_deleted.len() as f32 / total as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn chunk() -> Chunk {
        Chunk {
            doc_id: Uuid::new_v4(),
            file_id: "f".into(),
            content: "archived".into(),
            metadata: HashMap::new(),
            created_at_ms: 0,
        }
    }

    fn open_cold(dir: &Path) -> ColdIndex {
        ColdIndex::open(dir, IndexKind::Flat, 4, IndexParams::default()).unwrap()
    }

    #[test]
    fn test_add_and_search() {
        let dir = tempfile::tempdir().unwrap();
        let cold = open_cold(dir.path());
        let c = chunk();
        let d = c.doc_id;
        cold.add_batch(vec![(c, vec![1.0, 0.0, 0.0, 0.0])]).unwrap();
        let hits = cold.search(&[1.0, 0.0, 0.0, 0.0], 3);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, d);
    }

    #[test]
    fn test_soft_delete_idempotent_and_filtered() {
        let dir = tempfile::tempdir().unwrap();
        let cold = open_cold(dir.path());
        let c = chunk();
        let d = c.doc_id;
        cold.add_batch(vec![(c, vec![1.0, 0.0, 0.0, 0.0])]).unwrap();

        assert!(cold.soft_delete(&d));
        assert!(!cold.soft_delete(&d));
        assert!(!cold.soft_delete(&Uuid::new_v4()));

        assert!(cold.search(&[1.0, 0.0, 0.0, 0.0], 3).is_empty());
        assert_eq!(cold.size(), 0);
        assert_eq!(cold.total_size(), 1);
        assert!(cold.chunk_of(&d).is_none());
    }

    #[test]
    fn test_rebuild_drains_soft_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let cold = open_cold(dir.path());
        let keep = chunk();
        let drop_me = chunk();
        let keep_id = keep.doc_id;
        let drop_id = drop_me.doc_id;
        cold.add_batch(vec![
            (keep, vec![1.0, 0.0, 0.0, 0.0]),
            (drop_me, vec![0.0, 1.0, 0.0, 0.0]),
        ])
        .unwrap();
        cold.soft_delete(&drop_id);

        let report = cold.rebuild("manual").unwrap();
        assert_eq!(report.dropped, 1);
        assert_eq!(report.surviving, 1);
        assert_eq!(cold.total_size(), 1);
        assert!(cold.contains(&keep_id));
        assert!(!cold.contains(&drop_id));
        // Second soft-delete of a purged doc is a no-op
        assert!(!cold.soft_delete(&drop_id));
    }

    #[test]
    fn test_rebuild_to_empty_is_valid() {
        let dir = tempfile::tempdir().unwrap();
        let cold = open_cold(dir.path());
        let c = chunk();
        let d = c.doc_id;
        cold.add_batch(vec![(c, vec![1.0, 0.0, 0.0, 0.0])]).unwrap();
        cold.soft_delete(&d);
        let report = cold.rebuild("manual").unwrap();
        assert_eq!(report.surviving, 0);
        assert_eq!(cold.total_size(), 0);
        assert!(cold.search(&[1.0, 0.0, 0.0, 0.0], 3).is_empty());
    }

    #[test]
    fn test_should_rebuild_thresholds() {
        let dir = tempfile::tempdir().unwrap();
        let cold = open_cold(dir.path());
        // High rate but tiny absolute count: no rebuild
        let c = chunk();
        let d = c.doc_id;
        cold.add_batch(vec![(c, vec![0.0; 4])]).unwrap();
        cold.soft_delete(&d);
        assert_eq!(cold.deletion_rate(), 1.0);
        let (needed, _) = cold.should_rebuild();
        assert!(!needed, "1 soft-deleted doc must not trigger a rebuild");
    }

    #[test]
    fn test_persist_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let keep;
        let gone;
        {
            let cold = open_cold(dir.path());
            let c1 = chunk();
            let c2 = chunk();
            keep = c1.doc_id;
            gone = c2.doc_id;
            cold.add_batch(vec![
                (c1, vec![1.0, 0.0, 0.0, 0.0]),
                (c2, vec![0.0, 1.0, 0.0, 0.0]),
            ])
            .unwrap();
            cold.soft_delete(&gone);
            cold.persist().unwrap();
        }
        let cold = open_cold(dir.path());
        assert!(cold.contains(&keep));
        assert!(!cold.contains(&gone));
        assert_eq!(cold.stats().soft_deleted, 1);
    }
}
