//! Label overlay shared by the Hot and Cold tiers.
//!
//! An ANN backend stores at most an integer label per vector; the overlay
//! owns the `label ↔ doc_id` translation, the chunk records themselves,
//! and the migration write journal. Labels are assigned monotonically and
//! never reused within a backend's lifetime.

use crate::ann::{AnnIndex, IndexKind, IndexParams, RemoveOutcome};
use crate::chunk::Chunk;
use crate::config::TRAIN_SAMPLES_PER_LIST;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// A write recorded while a migration build is in flight, replayed into
/// the new backend right before the atomic swap.
#[derive(Debug, Clone)]
pub enum JournalOp {
    Add { chunk: Chunk, vector: Vec<f32> },
    Remove { doc_id: Uuid },
}

/// Backend plus id translation and chunk storage.
#[derive(Debug)]
pub struct VectorOverlay {
    pub backend: AnnIndex,
    pub params: IndexParams,
    pub next_label: u32,
    pub label_of: HashMap<Uuid, u32>,
    pub doc_of: HashMap<u32, Uuid>,
    pub chunks: HashMap<Uuid, Chunk>,
    /// Write journal, present only while a migration build is running.
    pub journal: Option<Vec<JournalOp>>,
}

/// Serialized overlay bookkeeping (`ids.bin`); the backend itself is
/// persisted separately (`vectors.bin`).
#[derive(Debug, Serialize, Deserialize)]
pub struct OverlaySnapshot {
    pub next_label: u32,
    pub label_of: HashMap<Uuid, u32>,
    pub chunks: HashMap<Uuid, Chunk>,
}

impl VectorOverlay {
    pub fn new(kind: IndexKind, dimension: usize, params: IndexParams) -> Self {
        let backend = AnnIndex::create(kind, dimension, &params);
        Self {
            backend,
            params,
            next_label: 0,
            label_of: HashMap::new(),
            doc_of: HashMap::new(),
            chunks: HashMap::new(),
            journal: None,
        }
    }

    /// Rebuild an overlay from a persisted backend plus snapshot.
    pub fn from_parts(backend: AnnIndex, params: IndexParams, snapshot: OverlaySnapshot) -> Self {
        let doc_of = snapshot
            .label_of
            .iter()
            .map(|(doc, &label)| (label, *doc))
            .collect();
        Self {
            backend,
            params,
            next_label: snapshot.next_label,
            label_of: snapshot.label_of,
            doc_of,
            chunks: snapshot.chunks,
            journal: None,
        }
    }

    pub fn snapshot(&self) -> OverlaySnapshot {
        OverlaySnapshot {
            next_label: self.next_label,
            label_of: self.label_of.clone(),
            chunks: self.chunks.clone(),
        }
    }

    /// Validate internal invariants after deserialization.
    ///
    /// Checks that the backend and the bookkeeping agree: equal sizes,
    /// symmetric id maps, and every live backend label mapped to a doc
    /// below the label watermark.
    pub fn validate(&self) -> std::result::Result<(), String> {
        let backend_size = self.backend.size();
        if backend_size != self.chunks.len() {
            return Err(format!(
                "backend holds {backend_size} vectors but {} chunk records exist",
                self.chunks.len()
            ));
        }
        if self.label_of.len() != self.doc_of.len() {
            return Err(format!(
                "label_of({}) != doc_of({})",
                self.label_of.len(),
                self.doc_of.len()
            ));
        }
        if self.label_of.len() != self.chunks.len() {
            return Err(format!(
                "label_of({}) != chunks({})",
                self.label_of.len(),
                self.chunks.len()
            ));
        }
        for label in self.backend.labels() {
            if label >= self.next_label {
                return Err(format!(
                    "backend label {label} >= next_label {}",
                    self.next_label
                ));
            }
            let Some(doc_id) = self.doc_of.get(&label) else {
                return Err(format!("backend label {label} has no doc mapping"));
            };
            if self.label_of.get(doc_id) != Some(&label) {
                return Err(format!("label {label} and doc {doc_id} maps are asymmetric"));
            }
            if !self.chunks.contains_key(doc_id) {
                return Err(format!("doc {doc_id} is mapped but has no chunk record"));
            }
        }
        Ok(())
    }

    /// Live chunk count.
    pub fn size(&self) -> usize {
        self.chunks.len()
    }

    /// Insert a batch, training an untrained IVF-family backend on the
    /// batch vectors first.
    pub fn insert_batch(&mut self, entries: Vec<(Chunk, Vec<f32>)>) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        self.train_if_needed(&entries);
        for (chunk, vector) in entries {
            let label = self.next_label;
            self.backend.add(label, &vector)?;
            self.next_label += 1;
            self.label_of.insert(chunk.doc_id, label);
            self.doc_of.insert(label, chunk.doc_id);
            if let Some(journal) = &mut self.journal {
                journal.push(JournalOp::Add {
                    chunk: chunk.clone(),
                    vector: vector.clone(),
                });
            }
            self.chunks.insert(chunk.doc_id, chunk);
        }
        Ok(())
    }

    fn train_if_needed(&mut self, entries: &[(Chunk, Vec<f32>)]) {
        if self.backend.is_trained() {
            return;
        }
        let dim = self.backend.dimension();
        let want = TRAIN_SAMPLES_PER_LIST * self.params.nlist;
        let take = entries.len().min(want.max(1));
        let mut sample = Vec::with_capacity(take * dim);
        for (_, vector) in entries.iter().take(take) {
            sample.extend_from_slice(vector);
        }
        tracing::info!(
            kind = %self.backend.kind(),
            vectors = take,
            "training backend before first add"
        );
        self.backend.train(&sample);
    }

    /// Remove docs. Returns `(docs_that_existed, physical_outcome)`.
    ///
    /// Bookkeeping (maps + chunk records) is dropped either way; when the
    /// backend reports `Unsupported` the caller owes a tombstone entry.
    pub fn remove(&mut self, doc_ids: &[Uuid]) -> (Vec<Uuid>, RemoveOutcome) {
        let mut labels = Vec::new();
        let mut existing = Vec::new();
        for doc_id in doc_ids {
            if let Some(&label) = self.label_of.get(doc_id) {
                labels.push(label);
                existing.push(*doc_id);
            }
        }
        let outcome = self.backend.remove(&labels);
        for (doc_id, label) in existing.iter().zip(&labels) {
            self.label_of.remove(doc_id);
            self.doc_of.remove(label);
            self.chunks.remove(doc_id);
            if let Some(journal) = &mut self.journal {
                journal.push(JournalOp::Remove { doc_id: *doc_id });
            }
        }
        (existing, outcome)
    }

    /// Top-k search mapped to doc_ids. Labels without a live mapping
    /// (physically present but logically removed) are filtered out.
    pub fn search(&self, query: &[f32], k: usize) -> Vec<(Uuid, f32)> {
        if k == 0 {
            return Vec::new();
        }
        self.backend
            .search(query, k)
            .into_iter()
            .filter_map(|(label, dist)| self.doc_of.get(&label).map(|doc| (*doc, dist)))
            .collect()
    }

    /// Reconstruct the stored vector for a doc. Lossy for IVF-PQ.
    pub fn vector_of(&self, doc_id: &Uuid) -> Option<Vec<f32>> {
        let &label = self.label_of.get(doc_id)?;
        self.backend.reconstruct(label)
    }

    pub fn chunk_of(&self, doc_id: &Uuid) -> Option<&Chunk> {
        self.chunks.get(doc_id)
    }

    pub fn contains(&self, doc_id: &Uuid) -> bool {
        self.chunks.contains_key(doc_id)
    }

    /// Begin journaling writes for a migration build.
    pub fn begin_journal(&mut self) {
        self.journal = Some(Vec::new());
    }

    /// Drain and stop the journal.
    pub fn take_journal(&mut self) -> Vec<JournalOp> {
        self.journal.take().unwrap_or_default()
    }
}
