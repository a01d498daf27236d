//! BM25 index manager.
//!
//! Keeps a tokenized inverted index in sync with the vector tiers and
//! serves keyword top-k queries for hybrid fusion. The manager owns its
//! own internal u32 id space with an overlay to `doc_id`s, tracks
//! `last_synced_vector_count` for incremental catch-up at open, and
//! persists snapshots with a dirty flag so writes can be batched.

pub mod inverted_index;
pub mod scorer;
pub mod tokenizer;

use crate::error::Result;
use crate::persist;
use inverted_index::InvertedIndex;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokenizer::Tokenizer;
use uuid::Uuid;

/// Serialized manager state.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct Bm25State {
    index: InvertedIndex,
    /// doc_id → internal id.
    id_of: HashMap<Uuid, u32>,
    /// internal id → doc_id. `None` after removal; ids are never reused.
    doc_of: Vec<Option<Uuid>>,
    /// Unique doc_ids indexed, for open-time incremental catch-up.
    last_synced_vector_count: u64,
}

/// Snapshot stats exposed through the store.
#[derive(Debug, Clone, Serialize)]
pub struct Bm25Stats {
    pub documents: u32,
    pub terms: usize,
    pub last_synced_vector_count: u64,
}

/// Thread-safe BM25 index manager.
///
/// Holds only a read-side relationship to the vector store: the store
/// pushes adds/removes in, the manager never mutates ANN state.
pub struct Bm25Manager {
    state: Mutex<Bm25State>,
    tokenizer: Arc<dyn Tokenizer>,
    path: PathBuf,
    k1: f32,
    b: f32,
    dirty: AtomicBool,
}

impl Bm25Manager {
    /// Load the persisted snapshot at `path` or start empty.
    pub fn open(
        path: &Path,
        tokenizer: Arc<dyn Tokenizer>,
        k1: f32,
        b: f32,
    ) -> Result<Self> {
        let state = if path.exists() {
            match persist::load_snapshot::<Bm25State>(path) {
                Ok(state) => {
                    tracing::info!(
                        documents = state.index.doc_count,
                        "loaded BM25 snapshot"
                    );
                    state
                }
                Err(e) => {
                    tracing::warn!("failed to load BM25 snapshot, rebuilding: {e}");
                    Bm25State::default()
                }
            }
        } else {
            Bm25State::default()
        };
        Ok(Self {
            state: Mutex::new(state),
            tokenizer,
            path: path.to_path_buf(),
            k1,
            b,
            dirty: AtomicBool::new(false),
        })
    }

    /// Index one document's content. Replaces any previous entry for the
    /// same `doc_id`.
    pub fn add_document(&self, doc_id: Uuid, content: &str) {
        let tokens = self.tokenizer.tokenize(content);
        let mut state = self.state.lock();
        if let Some(&old) = state.id_of.get(&doc_id) {
            state.index.remove_document(old);
            state.doc_of[old as usize] = None;
            state.last_synced_vector_count = state.last_synced_vector_count.saturating_sub(1);
        }
        let internal = state.doc_of.len() as u32;
        state.doc_of.push(Some(doc_id));
        state.id_of.insert(doc_id, internal);
        state.index.add_document(internal, &tokens);
        state.last_synced_vector_count += 1;
        self.dirty.store(true, Ordering::Release);
    }

    /// Remove a document. Idempotent; unknown ids are tolerated.
    pub fn remove_document(&self, doc_id: &Uuid) {
        let mut state = self.state.lock();
        if let Some(internal) = state.id_of.remove(doc_id) {
            state.index.remove_document(internal);
            state.doc_of[internal as usize] = None;
            state.last_synced_vector_count = state.last_synced_vector_count.saturating_sub(1);
            self.dirty.store(true, Ordering::Release);
        }
    }

    /// Whether `doc_id` is currently indexed.
    pub fn contains(&self, doc_id: &Uuid) -> bool {
        self.state.lock().id_of.contains_key(doc_id)
    }

    /// Keyword top-k. Returns `(doc_id, bm25_score)` descending by score.
    pub fn search(&self, query: &str, k: usize) -> Vec<(Uuid, f32)> {
        let tokens = self.tokenizer.tokenize(query);
        let state = self.state.lock();
        scorer::bm25_search(&state.index, &tokens, k, self.k1, self.b)
            .into_iter()
            .filter_map(|(internal, score)| {
                state.doc_of[internal as usize].map(|doc_id| (doc_id, score))
            })
            .collect()
    }

    /// Unique doc_ids indexed.
    pub fn last_synced_vector_count(&self) -> u64 {
        self.state.lock().last_synced_vector_count
    }

    pub fn stats(&self) -> Bm25Stats {
        let state = self.state.lock();
        Bm25Stats {
            documents: state.index.doc_count,
            terms: state.index.term_count(),
            last_synced_vector_count: state.last_synced_vector_count,
        }
    }

    /// Persist a snapshot if anything changed since the last write.
    ///
    /// Failures are recoverable: the dirty flag stays set and the next
    /// flush retries.
    pub fn flush(&self) -> Result<()> {
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let snapshot = self.state.lock().clone();
        if let Err(e) = persist::save_snapshot(&snapshot, &self.path) {
            self.dirty.store(true, Ordering::Release);
            return Err(e);
        }
        tracing::debug!(documents = snapshot.index.doc_count, "BM25 snapshot written");
        Ok(())
    }

    /// Whether unpersisted changes exist.
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Prime lazy state with a throwaway query.
    pub fn warmup(&self) {
        let _ = self.search("warmup", 1);
    }
}
