//! ANN index abstraction.
//!
//! The backend type is a closed set of tagged variants rather than a
//! trait object: the selector and migrator decide at open/migration time
//! which variant is instantiated, per-operation dispatch stays a cheap
//! match, and the selection rule is exhaustively checkable.
//!
//! Internal integer labels are assigned by the owning tier; the tier's
//! overlay translates `label ↔ doc_id`.

pub mod distance;
pub mod flat;
pub mod hnsw;
pub mod ivf;
pub mod ivfpq;
pub mod kmeans;
pub mod pq;

use crate::error::{EngineError, Result};
use crate::persist;
use flat::FlatIndex;
use hnsw::{HnswGraph, HnswParams};
use ivf::IvfIndex;
use ivfpq::IvfPqIndex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// The four supported backend families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexKind {
    /// Exact L2² scan.
    Flat,
    /// Coarse quantizer + inverted lists of raw vectors.
    Ivf,
    /// IVF with product quantization of residuals.
    IvfPq,
    /// Multi-layer proximity graph.
    Hnsw,
}

impl IndexKind {
    /// Backends that require `train` before the first `add`.
    pub fn needs_training(&self) -> bool {
        matches!(self, IndexKind::Ivf | IndexKind::IvfPq)
    }

    /// Coarse ordering used by upgrade advice: a backend is a "lower
    /// tier" than another when it suits smaller corpora.
    pub fn scale_rank(&self) -> u8 {
        match self {
            IndexKind::Flat => 0,
            IndexKind::Ivf => 1,
            IndexKind::IvfPq => 2,
            IndexKind::Hnsw => 3,
        }
    }
}

impl fmt::Display for IndexKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IndexKind::Flat => "flat",
            IndexKind::Ivf => "ivf",
            IndexKind::IvfPq => "ivf_pq",
            IndexKind::Hnsw => "hnsw",
        };
        f.write_str(name)
    }
}

/// Backend parameters. Each variant reads the fields it cares about.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexParams {
    /// IVF family: number of inverted lists.
    pub nlist: usize,
    /// IVF family: lists scanned per query.
    pub nprobe: usize,
    /// IVF-PQ: subquantizer count (bytes per stored vector).
    pub m: usize,
    /// IVF-PQ: bits per code. Only 8 is supported.
    pub nbits: usize,
    /// HNSW: links per node.
    pub hnsw_m: usize,
    /// HNSW: construction candidate list size.
    pub ef_construction: usize,
    /// HNSW: search candidate list size.
    pub ef_search: usize,
}

impl Default for IndexParams {
    fn default() -> Self {
        Self {
            nlist: 100,
            nprobe: 10,
            m: 8,
            nbits: 8,
            hnsw_m: 32,
            ef_construction: 200,
            ef_search: 64,
        }
    }
}

/// Result of a physical-removal request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    /// Physically removed this many entries.
    Removed(usize),
    /// The backend cannot physically remove; the caller must tombstone.
    Unsupported,
}

/// A concrete ANN backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AnnIndex {
    Flat(FlatIndex),
    Ivf(IvfIndex),
    IvfPq(IvfPqIndex),
    Hnsw(HnswGraph),
}

impl AnnIndex {
    /// Instantiate an empty backend of the given kind.
    pub fn create(kind: IndexKind, dimension: usize, params: &IndexParams) -> Self {
        match kind {
            IndexKind::Flat => AnnIndex::Flat(FlatIndex::new(dimension)),
            IndexKind::Ivf => AnnIndex::Ivf(IvfIndex::new(dimension, params.nlist, params.nprobe)),
            IndexKind::IvfPq => AnnIndex::IvfPq(IvfPqIndex::new(
                dimension,
                params.nlist,
                params.nprobe,
                params.m,
            )),
            IndexKind::Hnsw => AnnIndex::Hnsw(HnswGraph::new(
                dimension,
                HnswParams {
                    m: params.hnsw_m,
                    m_max0: params.hnsw_m * 2,
                    ef_construction: params.ef_construction,
                    ef_search: params.ef_search,
                    ..HnswParams::default()
                },
            )),
        }
    }

    pub fn kind(&self) -> IndexKind {
        match self {
            AnnIndex::Flat(_) => IndexKind::Flat,
            AnnIndex::Ivf(_) => IndexKind::Ivf,
            AnnIndex::IvfPq(_) => IndexKind::IvfPq,
            AnnIndex::Hnsw(_) => IndexKind::Hnsw,
        }
    }

    pub fn dimension(&self) -> usize {
        match self {
            AnnIndex::Flat(idx) => idx.dimension,
            AnnIndex::Ivf(idx) => idx.dimension,
            AnnIndex::IvfPq(idx) => idx.dimension,
            AnnIndex::Hnsw(g) => g.dimension,
        }
    }

    /// Train on a sample arena. No-op for Flat and HNSW.
    pub fn train(&mut self, samples: &[f32]) {
        match self {
            AnnIndex::Flat(_) | AnnIndex::Hnsw(_) => {}
            AnnIndex::Ivf(idx) => idx.train(samples),
            AnnIndex::IvfPq(idx) => idx.train(samples),
        }
    }

    /// Whether the backend is ready to accept adds.
    pub fn is_trained(&self) -> bool {
        match self {
            AnnIndex::Flat(_) | AnnIndex::Hnsw(_) => true,
            AnnIndex::Ivf(idx) => idx.is_trained(),
            AnnIndex::IvfPq(idx) => idx.is_trained(),
        }
    }

    /// Add one vector under `label`.
    pub fn add(&mut self, label: u32, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dimension() {
            return Err(EngineError::DimensionMismatch {
                expected: self.dimension(),
                got: vector.len(),
            });
        }
        if !self.is_trained() {
            return Err(EngineError::BackendUnavailable(format!(
                "{} backend is untrained",
                self.kind()
            )));
        }
        match self {
            AnnIndex::Flat(idx) => idx.add(label, vector),
            AnnIndex::Ivf(idx) => idx.add(label, vector),
            AnnIndex::IvfPq(idx) => idx.add(label, vector),
            AnnIndex::Hnsw(g) => g.insert(label, vector),
        }
        Ok(())
    }

    /// Physically remove labels where the structure supports it.
    ///
    /// HNSW tombstones internally (so search skips the nodes) but reports
    /// `Unsupported`, leaving bookkeeping to the caller.
    pub fn remove(&mut self, labels: &[u32]) -> RemoveOutcome {
        match self {
            AnnIndex::Flat(idx) => RemoveOutcome::Removed(idx.remove(labels)),
            AnnIndex::Ivf(idx) => RemoveOutcome::Removed(idx.remove(labels)),
            AnnIndex::IvfPq(idx) => RemoveOutcome::Removed(idx.remove(labels)),
            AnnIndex::Hnsw(g) => {
                for &label in labels {
                    g.mark_deleted(label);
                }
                RemoveOutcome::Unsupported
            }
        }
    }

    /// Top-k search, `(label, distance)` ascending by distance.
    pub fn search(&self, query: &[f32], k: usize) -> Vec<(u32, f32)> {
        match self {
            AnnIndex::Flat(idx) => idx.search(query, k),
            AnnIndex::Ivf(idx) => idx.search(query, k),
            AnnIndex::IvfPq(idx) => idx.search(query, k),
            AnnIndex::Hnsw(g) => g.search(query, k),
        }
    }

    /// Number of stored (live) vectors.
    pub fn size(&self) -> usize {
        match self {
            AnnIndex::Flat(idx) => idx.size(),
            AnnIndex::Ivf(idx) => idx.size(),
            AnnIndex::IvfPq(idx) => idx.size(),
            AnnIndex::Hnsw(g) => g.live_count(),
        }
    }

    /// Reconstruct the stored vector for `label`. Lossy for IVF-PQ.
    pub fn reconstruct(&self, label: u32) -> Option<Vec<f32>> {
        match self {
            AnnIndex::Flat(idx) => idx.reconstruct(label),
            AnnIndex::Ivf(idx) => idx.reconstruct(label),
            AnnIndex::IvfPq(idx) => idx.reconstruct(label),
            AnnIndex::Hnsw(g) => g.reconstruct(label),
        }
    }

    /// All live labels.
    pub fn labels(&self) -> Vec<u32> {
        match self {
            AnnIndex::Flat(idx) => idx.labels().collect(),
            AnnIndex::Ivf(idx) => idx.labels().collect(),
            AnnIndex::IvfPq(idx) => idx.labels().collect(),
            AnnIndex::Hnsw(g) => g.labels().collect(),
        }
    }

    /// Estimated resident memory in bytes.
    pub fn memory_bytes(&self) -> usize {
        match self {
            AnnIndex::Flat(idx) => idx.memory_bytes(),
            AnnIndex::Ivf(idx) => idx.memory_bytes(),
            AnnIndex::IvfPq(idx) => idx.memory_bytes(),
            AnnIndex::Hnsw(g) => g.memory_bytes(),
        }
    }
}

/// Type tag and parameters persisted next to a backend snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendMeta {
    pub kind: IndexKind,
    pub dimension: usize,
    pub params: IndexParams,
}

/// Persist a backend under `dir` as `backend.meta` + `vectors.bin`.
pub fn save_backend(index: &AnnIndex, params: &IndexParams, dir: &Path) -> Result<()> {
    let meta = BackendMeta {
        kind: index.kind(),
        dimension: index.dimension(),
        params: params.clone(),
    };
    persist::save_snapshot(&meta, &dir.join("backend.meta"))?;
    persist::save_snapshot(index, &dir.join("vectors.bin"))?;
    Ok(())
}

/// Load a backend persisted by [`save_backend`]. Returns `None` when no
/// snapshot exists yet.
pub fn load_backend(dir: &Path) -> Result<Option<(AnnIndex, BackendMeta)>> {
    let meta_path = dir.join("backend.meta");
    if !meta_path.exists() {
        return Ok(None);
    }
    let meta: BackendMeta = persist::load_snapshot(&meta_path)?;
    let index: AnnIndex = persist::load_snapshot(&dir.join("vectors.bin"))?;
    if index.dimension() != meta.dimension {
        return Err(EngineError::Persist(format!(
            "backend snapshot dimension {} disagrees with meta {}",
            index.dimension(),
            meta.dimension
        )));
    }
    Ok(Some((index, meta)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(n: usize, dim: usize) -> Vec<f32> {
        let mut data = Vec::with_capacity(n * dim);
        for i in 0..n {
            for d in 0..dim {
                data.push(((i * 7 + d * 3) % 53) as f32 / 53.0);
            }
        }
        data
    }

    #[test]
    fn test_create_all_kinds() {
        let params = IndexParams::default();
        for kind in [
            IndexKind::Flat,
            IndexKind::Ivf,
            IndexKind::IvfPq,
            IndexKind::Hnsw,
        ] {
            let idx = AnnIndex::create(kind, 8, &params);
            assert_eq!(idx.kind(), kind);
            assert_eq!(idx.dimension(), 8);
            assert_eq!(idx.size(), 0);
        }
    }

    #[test]
    fn test_training_requirements() {
        let params = IndexParams::default();
        assert!(AnnIndex::create(IndexKind::Flat, 4, &params).is_trained());
        assert!(AnnIndex::create(IndexKind::Hnsw, 4, &params).is_trained());
        assert!(!AnnIndex::create(IndexKind::Ivf, 4, &params).is_trained());
        assert!(!AnnIndex::create(IndexKind::IvfPq, 4, &params).is_trained());
        assert!(IndexKind::Ivf.needs_training());
        assert!(!IndexKind::Hnsw.needs_training());
    }

    #[test]
    fn test_add_to_untrained_fails() {
        let mut idx = AnnIndex::create(IndexKind::Ivf, 4, &IndexParams::default());
        let err = idx.add(0, &[0.0; 4]).unwrap_err();
        assert_eq!(err.kind(), "backend_unavailable");
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let mut idx = AnnIndex::create(IndexKind::Flat, 4, &IndexParams::default());
        let err = idx.add(0, &[0.0; 8]).unwrap_err();
        assert_eq!(err.kind(), "dimension_mismatch");
    }

    #[test]
    fn test_hnsw_remove_unsupported_but_filters() {
        let mut idx = AnnIndex::create(IndexKind::Hnsw, 4, &IndexParams::default());
        idx.add(1, &[1.0, 0.0, 0.0, 0.0]).unwrap();
        idx.add(2, &[0.0, 1.0, 0.0, 0.0]).unwrap();
        assert_eq!(idx.remove(&[1]), RemoveOutcome::Unsupported);
        let results = idx.search(&[1.0, 0.0, 0.0, 0.0], 2);
        assert!(results.iter().all(|&(label, _)| label != 1));
    }

    #[test]
    fn test_flat_remove_supported() {
        let mut idx = AnnIndex::create(IndexKind::Flat, 4, &IndexParams::default());
        idx.add(1, &[1.0, 0.0, 0.0, 0.0]).unwrap();
        assert_eq!(idx.remove(&[1]), RemoveOutcome::Removed(1));
        assert_eq!(idx.size(), 0);
    }

    #[test]
    fn test_search_parity_across_backends() {
        // All backends should put an exact match first on a small corpus
        let dim = 8;
        let n = 200;
        let data = sample(n, dim);
        let mut params = IndexParams::default();
        params.nlist = 4;
        params.nprobe = 4;
        params.m = 2;

        for kind in [
            IndexKind::Flat,
            IndexKind::Ivf,
            IndexKind::IvfPq,
            IndexKind::Hnsw,
        ] {
            let mut idx = AnnIndex::create(kind, dim, &params);
            if kind.needs_training() {
                idx.train(&data);
            }
            for i in 0..n as u32 {
                idx.add(i, &data[i as usize * dim..(i as usize + 1) * dim])
                    .unwrap();
            }
            let query = &data[17 * dim..18 * dim];
            let results = idx.search(query, 5);
            assert!(
                results.iter().any(|&(label, _)| label == 17),
                "{kind}: exact match missing from top-5"
            );
        }
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let params = IndexParams::default();
        let mut idx = AnnIndex::create(IndexKind::Flat, 4, &params);
        idx.add(1, &[1.0, 0.0, 0.0, 0.0]).unwrap();
        idx.add(2, &[0.0, 1.0, 0.0, 0.0]).unwrap();

        save_backend(&idx, &params, dir.path()).unwrap();
        let (loaded, meta) = load_backend(dir.path()).unwrap().unwrap();
        assert_eq!(meta.kind, IndexKind::Flat);
        assert_eq!(loaded.size(), 2);
        let results = loaded.search(&[1.0, 0.0, 0.0, 0.0], 1);
        assert_eq!(results[0].0, 1);
    }

    #[test]
    fn test_load_missing_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_backend(dir.path()).unwrap().is_none());
    }
}
