//! Cross-encoder reranking.
//!
//! A cross-encoder scores `(query, passage)` pairs jointly and rescores a
//! small fused candidate pool. The model is heavy, so initialisation is
//! deferred to first use; when scoring fails or no encoder is injected,
//! the fused ranking passes through unchanged with an advisory flag.

use crate::config::RERANK_BATCH_SIZE;
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::OnceCell;

/// Injected cross-encoder model.
#[async_trait]
pub trait CrossEncoder: Send + Sync {
    /// Relevance score per passage, higher = more relevant.
    async fn score(&self, query: &str, passages: &[String]) -> Result<Vec<f32>>;

    /// One-time heavyweight initialisation (model load). Default: no-op.
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }
}

/// Outcome of a rerank pass.
#[derive(Debug)]
pub enum RerankOutcome {
    /// Candidate indexes with scores, descending by score.
    Reranked(Vec<(usize, f32)>),
    /// Reranking was skipped; the fused order stands.
    Skipped { reason: String },
}

/// Lazy, failure-tolerant wrapper around an optional [`CrossEncoder`].
pub struct Reranker {
    encoder: Option<Arc<dyn CrossEncoder>>,
    init: OnceCell<bool>,
}

impl Reranker {
    pub fn new(encoder: Option<Arc<dyn CrossEncoder>>) -> Self {
        Self {
            encoder,
            init: OnceCell::new(),
        }
    }

    /// Whether an encoder is injected and its initialisation has not
    /// already failed.
    pub fn is_available(&self) -> bool {
        self.encoder.is_some() && self.init.get().copied() != Some(false)
    }

    /// Rescore `passages` against `query`, in encoder batches.
    ///
    /// Never fails the search: every error path degrades to
    /// [`RerankOutcome::Skipped`].
    pub async fn rerank(&self, query: &str, passages: &[String]) -> RerankOutcome {
        let Some(encoder) = &self.encoder else {
            return RerankOutcome::Skipped {
                reason: "no cross-encoder configured".to_string(),
            };
        };
        if passages.is_empty() {
            return RerankOutcome::Reranked(Vec::new());
        }

        let ready = *self
            .init
            .get_or_init(|| async {
                match encoder.initialize().await {
                    Ok(()) => true,
                    Err(e) => {
                        tracing::warn!("cross-encoder initialisation failed: {e}");
                        false
                    }
                }
            })
            .await;
        if !ready {
            return RerankOutcome::Skipped {
                reason: "cross-encoder failed to initialise".to_string(),
            };
        }

        let mut scores: Vec<f32> = Vec::with_capacity(passages.len());
        for batch in passages.chunks(RERANK_BATCH_SIZE) {
            match encoder.score(query, batch).await {
                Ok(batch_scores) if batch_scores.len() == batch.len() => {
                    scores.extend(batch_scores);
                }
                Ok(batch_scores) => {
                    tracing::warn!(
                        expected = batch.len(),
                        got = batch_scores.len(),
                        "cross-encoder returned a short batch, skipping rerank"
                    );
                    return RerankOutcome::Skipped {
                        reason: "cross-encoder returned malformed scores".to_string(),
                    };
                }
                Err(e) => {
                    tracing::warn!("cross-encoder scoring failed, skipping rerank: {e}");
                    return RerankOutcome::Skipped {
                        reason: format!("cross-encoder error: {e}"),
                    };
                }
            }
        }

        let mut order: Vec<(usize, f32)> = scores.into_iter().enumerate().collect();
        order.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        RerankOutcome::Reranked(order)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::error::EngineError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scores passages by length; fails from call N onward when configured.
    pub struct ScriptedEncoder {
        pub fail_from_call: Option<usize>,
        pub calls: AtomicUsize,
    }

    impl ScriptedEncoder {
        pub fn new() -> Self {
            Self {
                fail_from_call: None,
                calls: AtomicUsize::new(0),
            }
        }

        pub fn failing_from(call: usize) -> Self {
            Self {
                fail_from_call: Some(call),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl CrossEncoder for ScriptedEncoder {
        async fn score(&self, _query: &str, passages: &[String]) -> Result<Vec<f32>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some(from) = self.fail_from_call {
                if call >= from {
                    return Err(EngineError::Rerank("scripted failure".into()));
                }
            }
            Ok(passages.iter().map(|p| p.len() as f32).collect())
        }
    }
}
