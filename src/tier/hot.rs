//! Hot tier: absorbs all new inserts, serves low-latency search on recent
//! data, and permits per-doc deletion.
//!
//! Deletion is physical whenever the backend supports it; otherwise the
//! doc is tombstoned and eliminated at the next migration or rebuild.
//! Capacity is bounded by `max_size`; the store runs one synchronous
//! archive pass before failing an insert with `CapacityExceeded`.

use crate::ann::{self, IndexKind, IndexParams, RemoveOutcome};
use crate::chunk::Chunk;
use crate::error::{EngineError, Result};
use crate::persist;
use crate::tier::overlay::{OverlaySnapshot, VectorOverlay};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

/// Mutable Hot tier state, guarded by the tier rwlock.
#[derive(Debug)]
pub struct HotState {
    pub overlay: VectorOverlay,
    /// Docs the backend could not physically remove; eliminated at the
    /// next migration or rebuild.
    pub tombstones: HashSet<Uuid>,
    pub total_added: u64,
    pub total_removed: u64,
}

/// Extra Hot bookkeeping persisted alongside the overlay in `ids.bin`.
#[derive(Debug, Serialize, Deserialize)]
struct HotSnapshot {
    overlay: OverlaySnapshot,
    tombstones: HashSet<Uuid>,
    total_added: u64,
    total_removed: u64,
}

/// Snapshot stats for the Hot tier.
#[derive(Debug, Clone, Serialize)]
pub struct HotStats {
    pub kind: String,
    pub size: usize,
    pub max_size: usize,
    pub utilization: f32,
    pub tombstones: usize,
    pub is_trained: bool,
    /// Resident bytes of the live backend structure.
    pub memory_bytes: usize,
    pub total_added: u64,
    pub total_removed: u64,
}

/// The churnable tier.
#[derive(Debug, Clone)]
pub struct HotIndex {
    pub max_size: usize,
    dir: PathBuf,
    pub data: Arc<RwLock<HotState>>,
}

impl HotIndex {
    /// Open the Hot tier under `dir`, loading a persisted backend when
    /// one exists, otherwise creating an empty backend of `kind`.
    pub fn open(
        dir: &Path,
        kind: IndexKind,
        dimension: usize,
        params: IndexParams,
        max_size: usize,
    ) -> Result<Self> {
        let state = match ann::load_backend(dir)? {
            Some((backend, meta)) => {
                let snapshot: HotSnapshot = persist::load_snapshot(&dir.join("ids.bin"))?;
                let overlay = VectorOverlay::from_parts(backend, meta.params, snapshot.overlay);
                overlay.validate().map_err(|e| {
                    EngineError::Persist(format!("hot tier snapshot failed validation: {e}"))
                })?;
                tracing::info!(
                    kind = %meta.kind,
                    size = overlay.size(),
                    "loaded hot tier"
                );
                HotState {
                    overlay,
                    tombstones: snapshot.tombstones,
                    total_added: snapshot.total_added,
                    total_removed: snapshot.total_removed,
                }
            }
            None => {
                tracing::info!(kind = %kind, "creating new hot tier");
                HotState {
                    overlay: VectorOverlay::new(kind, dimension, params),
                    tombstones: HashSet::new(),
                    total_added: 0,
                    total_removed: 0,
                }
            }
        };
        Ok(Self {
            max_size,
            dir: dir.to_path_buf(),
            data: Arc::new(RwLock::new(state)),
        })
    }

    /// Live document count.
    pub fn size(&self) -> usize {
        self.data.read().overlay.size()
    }

    /// Insert a batch of embedded chunks. The caller has already enforced
    /// capacity. Increments the add counter.
    pub fn insert_batch(&self, entries: Vec<(Chunk, Vec<f32>)>) -> Result<()> {
        let mut state = self.data.write();
        let n = entries.len() as u64;
        state.overlay.insert_batch(entries)?;
        state.total_added += n;
        Ok(())
    }

    /// Remove docs, physically when possible. Returns the doc_ids that
    /// existed and were removed.
    pub fn remove_docs(&self, doc_ids: &[Uuid]) -> Vec<Uuid> {
        let mut state = self.data.write();
        let (existing, outcome) = state.overlay.remove(doc_ids);
        match outcome {
            RemoveOutcome::Removed(n) => {
                tracing::debug!(removed = n, "hot physical removal");
            }
            RemoveOutcome::Unsupported => {
                for doc_id in &existing {
                    state.tombstones.insert(*doc_id);
                }
                tracing::debug!(
                    tombstoned = existing.len(),
                    "hot backend cannot remove physically, tombstoned"
                );
            }
        }
        state.total_removed += existing.len() as u64;
        existing
    }

    /// Top-k search with tombstoned doc_ids filtered.
    pub fn search(&self, query: &[f32], k: usize) -> Vec<(Uuid, f32)> {
        let state = self.data.read();
        state
            .overlay
            .search(query, k)
            .into_iter()
            .filter(|(doc_id, _)| !state.tombstones.contains(doc_id))
            .collect()
    }

    /// Chunks older than `cutoff_ms` with their vectors, oldest first.
    /// Used by the archive flow.
    pub fn iter_older_than(&self, cutoff_ms: u64, limit: usize) -> Vec<(Uuid, Vec<f32>, Chunk)> {
        let state = self.data.read();
        let mut aged: Vec<&Chunk> = state
            .overlay
            .chunks
            .values()
            .filter(|c| c.created_at_ms < cutoff_ms)
            .collect();
        aged.sort_by(|a, b| {
            a.created_at_ms
                .cmp(&b.created_at_ms)
                .then(a.doc_id.cmp(&b.doc_id))
        });
        aged.into_iter()
            .take(limit)
            .filter_map(|c| {
                state
                    .overlay
                    .vector_of(&c.doc_id)
                    .map(|v| (c.doc_id, v, c.clone()))
            })
            .collect()
    }

    pub fn chunk_of(&self, doc_id: &Uuid) -> Option<Chunk> {
        self.data.read().overlay.chunk_of(doc_id).cloned()
    }

    pub fn contains(&self, doc_id: &Uuid) -> bool {
        self.data.read().overlay.contains(doc_id)
    }

    /// Persist the backend and overlay bookkeeping under the tier dir.
    pub fn persist(&self) -> Result<()> {
        let state = self.data.read();
        ann::save_backend(&state.overlay.backend, &state.overlay.params, &self.dir)?;
        let snapshot = HotSnapshot {
            overlay: state.overlay.snapshot(),
            tombstones: state.tombstones.clone(),
            total_added: state.total_added,
            total_removed: state.total_removed,
        };
        persist::save_snapshot(&snapshot, &self.dir.join("ids.bin"))?;
        Ok(())
    }

    pub fn stats(&self) -> HotStats {
        let state = self.data.read();
        let size = state.overlay.size();
        HotStats {
            kind: state.overlay.backend.kind().to_string(),
            size,
            max_size: self.max_size,
            utilization: size as f32 / self.max_size as f32,
            tombstones: state.tombstones.len(),
            is_trained: state.overlay.backend.is_trained(),
            memory_bytes: state.overlay.backend.memory_bytes(),
            total_added: state.total_added,
            total_removed: state.total_removed,
        }
    }

    /// Current backend kind.
    pub fn kind(&self) -> IndexKind {
        self.data.read().overlay.backend.kind()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn chunk_at(ts: u64) -> Chunk {
        Chunk {
            doc_id: Uuid::new_v4(),
            file_id: "f".into(),
            content: "text".into(),
            metadata: HashMap::new(),
            created_at_ms: ts,
        }
    }

    fn open_flat(dir: &Path) -> HotIndex {
        HotIndex::open(dir, IndexKind::Flat, 4, IndexParams::default(), 100).unwrap()
    }

    #[test]
    fn test_insert_search_remove_physical() {
        let dir = tempfile::tempdir().unwrap();
        let hot = open_flat(dir.path());
        let c = chunk_at(0);
        let d = c.doc_id;
        hot.insert_batch(vec![(c, vec![1.0, 0.0, 0.0, 0.0])]).unwrap();
        assert_eq!(hot.size(), 1);

        let hits = hot.search(&[1.0, 0.0, 0.0, 0.0], 5);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, d);

        let removed = hot.remove_docs(&[d]);
        assert_eq!(removed, vec![d]);
        assert_eq!(hot.size(), 0);
        assert!(hot.data.read().tombstones.is_empty());
        assert!(hot.search(&[1.0, 0.0, 0.0, 0.0], 5).is_empty());
    }

    #[test]
    fn test_hnsw_removal_tombstones() {
        let dir = tempfile::tempdir().unwrap();
        let hot =
            HotIndex::open(dir.path(), IndexKind::Hnsw, 4, IndexParams::default(), 100).unwrap();
        let c = chunk_at(0);
        let d = c.doc_id;
        hot.insert_batch(vec![(c, vec![1.0, 0.0, 0.0, 0.0])]).unwrap();
        hot.remove_docs(&[d]);
        assert_eq!(hot.size(), 0);
        assert!(hot.data.read().tombstones.contains(&d));
        assert!(hot.search(&[1.0, 0.0, 0.0, 0.0], 5).is_empty());
    }

    #[test]
    fn test_iter_older_than_oldest_first() {
        let dir = tempfile::tempdir().unwrap();
        let hot = open_flat(dir.path());
        let entries: Vec<(Chunk, Vec<f32>)> = [300u64, 100, 200]
            .iter()
            .map(|&ts| (chunk_at(ts), vec![ts as f32, 0.0, 0.0, 0.0]))
            .collect();
        hot.insert_batch(entries).unwrap();

        let aged = hot.iter_older_than(250, 10);
        assert_eq!(aged.len(), 2);
        assert_eq!(aged[0].2.created_at_ms, 100);
        assert_eq!(aged[1].2.created_at_ms, 200);
        assert_eq!(aged[0].1[0], 100.0);
    }

    #[test]
    fn test_persist_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let d;
        {
            let hot = open_flat(dir.path());
            let c = chunk_at(5);
            d = c.doc_id;
            hot.insert_batch(vec![(c, vec![0.0, 1.0, 0.0, 0.0])]).unwrap();
            hot.persist().unwrap();
        }
        let hot = open_flat(dir.path());
        assert_eq!(hot.size(), 1);
        assert!(hot.contains(&d));
        let hits = hot.search(&[0.0, 1.0, 0.0, 0.0], 1);
        assert_eq!(hits[0].0, d);
    }

    #[test]
    fn test_stats() {
        let dir = tempfile::tempdir().unwrap();
        let hot = open_flat(dir.path());
        hot.insert_batch(vec![(chunk_at(0), vec![0.0; 4])]).unwrap();
        let stats = hot.stats();
        assert_eq!(stats.size, 1);
        assert_eq!(stats.max_size, 100);
        assert_eq!(stats.kind, "flat");
        assert!(stats.is_trained);
        assert!((stats.utilization - 0.01).abs() < 1e-6);
        assert!(stats.memory_bytes > 0);
        assert_eq!(stats.total_added, 1);
    }
}
