//! Embedder interface and memoising cache.
//!
//! The engine treats embedding as an opaque injected collaborator; real
//! deployments call a hosted embedding API. [`CachedEmbedder`] wraps any
//! embedder with an LRU memo-cache so repeated chunk texts and queries
//! skip the round trip.

use crate::error::Result;
use async_trait::async_trait;
use moka::sync::Cache;
use std::sync::Arc;

/// Text → vector provider.
///
/// Implementations must return vectors of exactly `dimension()` floats;
/// failures surface as [`EngineError::Embed`](crate::EngineError::Embed).
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a single text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed a batch of texts. The default embeds sequentially; providers
    /// with a batch endpoint should override.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }

    /// Embedding dimension, invariant for the life of the provider.
    fn dimension(&self) -> usize;
}

/// Memoising wrapper around any [`Embedder`].
///
/// Cache keys are the raw input texts; entries are evicted LRU-style once
/// the capacity is reached. Batch calls only forward the cache misses.
pub struct CachedEmbedder {
    inner: Arc<dyn Embedder>,
    cache: Cache<String, Arc<Vec<f32>>>,
}

impl CachedEmbedder {
    /// Wraps `inner` with a memo-cache of `capacity` entries.
    pub fn new(inner: Arc<dyn Embedder>, capacity: u64) -> Self {
        Self {
            inner,
            cache: Cache::new(capacity),
        }
    }

    /// Number of cached embeddings.
    pub fn cached_entries(&self) -> u64 {
        self.cache.run_pending_tasks();
        self.cache.entry_count()
    }
}

#[async_trait]
impl Embedder for CachedEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if let Some(hit) = self.cache.get(text) {
            return Ok(hit.as_ref().clone());
        }
        let vector = self.inner.embed(text).await?;
        self.cache
            .insert(text.to_string(), Arc::new(vector.clone()));
        Ok(vector)
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out: Vec<Option<Vec<f32>>> = Vec::with_capacity(texts.len());
        let mut misses: Vec<(usize, String)> = Vec::new();
        for (i, text) in texts.iter().enumerate() {
            match self.cache.get(text) {
                Some(hit) => out.push(Some(hit.as_ref().clone())),
                None => {
                    out.push(None);
                    misses.push((i, text.clone()));
                }
            }
        }

        if !misses.is_empty() {
            let miss_texts: Vec<String> = misses.iter().map(|(_, t)| t.clone()).collect();
            let vectors = self.inner.embed_batch(&miss_texts).await?;
            for ((i, text), vector) in misses.into_iter().zip(vectors) {
                self.cache.insert(text, Arc::new(vector.clone()));
                out[i] = Some(vector);
            }
        }

        Ok(out.into_iter().map(|v| v.expect("filled above")).collect())
    }

    fn dimension(&self) -> usize {
        self.inner.dimension()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Deterministic embedders shared by module and integration tests.

    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Maps exact texts to fixed vectors; unknown texts hash to an axis.
    pub struct StaticEmbedder {
        pub dimension: usize,
        pub table: HashMap<String, Vec<f32>>,
        pub calls: AtomicUsize,
    }

    impl StaticEmbedder {
        pub fn new(dimension: usize) -> Self {
            Self {
                dimension,
                table: HashMap::new(),
                calls: AtomicUsize::new(0),
            }
        }

        pub fn with_mapping(mut self, text: &str, vector: Vec<f32>) -> Self {
            assert_eq!(vector.len(), self.dimension);
            self.table.insert(text.to_string(), vector);
            self
        }

        fn fallback(&self, text: &str) -> Vec<f32> {
            let mut hash = 0usize;
            for b in text.bytes() {
                hash = hash.wrapping_mul(31).wrapping_add(b as usize);
            }
            let mut v = vec![0.0; self.dimension];
            v[hash % self.dimension] = 1.0;
            v[(hash / 7) % self.dimension] += 0.25;
            v
        }
    }

    #[async_trait]
    impl Embedder for StaticEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self
                .table
                .get(text)
                .cloned()
                .unwrap_or_else(|| self.fallback(text)))
        }

        fn dimension(&self) -> usize {
            self.dimension
        }
    }

}
