//! Query-side retrieval strategies.
//!
//! Strategies compose the store's fused search differently: plain vector
//! search, hybrid with BM25, LLM-assisted query rewriting (HyDE,
//! Query2Doc, decomposition), and parent-child resolution. Strategies
//! that need the text generator degrade to vector search with an
//! advisory when no generator is injected or generation fails.

use crate::ann::distance::display_similarity;
use crate::chunk::{MetadataValue, SearchResult};
use crate::error::Result;
use crate::store::fusion::{rrf_fuse, RankedList};
use crate::store::{GenerationalStore, SearchRequest, SearchResponse};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Metadata key linking a child chunk to its parent chunk.
pub const PARENT_ID_KEY: &str = "parent_id";

/// Sub-queries generated per decomposition, beyond the original.
const MAX_SUB_QUERIES: usize = 3;

/// Optional LLM used by the rewriting strategies.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String>;
}

/// Available query-side compositions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetrievalStrategy {
    /// Dense retrieval over both tiers.
    Vector,
    /// Dense retrieval fused with BM25 keyword search.
    Hybrid,
    /// Hypothetical-document embedding: generate an answer passage and
    /// search with its embedding.
    Hyde,
    /// Query expansion: append a generated pseudo-document to the query
    /// before embedding.
    Query2Doc,
    /// Split a multi-part question into sub-queries and fuse their
    /// result lists.
    Decomposition,
    /// Search small child chunks, return their parent chunks.
    ParentChild,
}

/// Execute a request with its strategy (or the store default).
pub(crate) async fn execute(
    store: &GenerationalStore,
    request: SearchRequest,
) -> Result<SearchResponse> {
    let requested = request.strategy.unwrap_or({
        if store.bm25.is_some() {
            RetrievalStrategy::Hybrid
        } else {
            RetrievalStrategy::Vector
        }
    });
    if request.k == 0 {
        return Ok(SearchResponse {
            results: Vec::new(),
            strategy_used: requested,
            advisories: Vec::new(),
        });
    }

    let rerank = store.config().enable_reranker && request.use_rerank.unwrap_or(true);
    let rerank_query = if rerank {
        Some(request.query.as_str())
    } else {
        None
    };

    match requested {
        RetrievalStrategy::Vector => {
            let qv = store.embedder_embed(&request.query).await?;
            let (results, advisories) = store
                .fused_search(
                    &qv,
                    None,
                    rerank_query,
                    request.k,
                    request.filters.as_ref(),
                )
                .await?;
            Ok(SearchResponse {
                results,
                strategy_used: RetrievalStrategy::Vector,
                advisories,
            })
        }
        RetrievalStrategy::Hybrid => {
            let qv = store.embedder_embed(&request.query).await?;
            let (results, advisories) = store
                .fused_search(
                    &qv,
                    Some(&request.query),
                    rerank_query,
                    request.k,
                    request.filters.as_ref(),
                )
                .await?;
            Ok(SearchResponse {
                results,
                strategy_used: RetrievalStrategy::Hybrid,
                advisories,
            })
        }
        RetrievalStrategy::Hyde => hyde(store, &request, rerank_query).await,
        RetrievalStrategy::Query2Doc => query2doc(store, &request, rerank_query).await,
        RetrievalStrategy::Decomposition => decomposition(store, &request, rerank).await,
        RetrievalStrategy::ParentChild => parent_child(store, &request, rerank_query).await,
    }
}

/// Fall back to plain vector search, noting why.
async fn degrade_to_vector(
    store: &GenerationalStore,
    request: &SearchRequest,
    rerank_query: Option<&str>,
    note: String,
) -> Result<SearchResponse> {
    tracing::warn!("{note}; falling back to vector search");
    let qv = store.embedder_embed(&request.query).await?;
    let (results, mut advisories) = store
        .fused_search(&qv, None, rerank_query, request.k, request.filters.as_ref())
        .await?;
    advisories.push(note);
    Ok(SearchResponse {
        results,
        strategy_used: RetrievalStrategy::Vector,
        advisories,
    })
}

async fn hyde(
    store: &GenerationalStore,
    request: &SearchRequest,
    rerank_query: Option<&str>,
) -> Result<SearchResponse> {
    let Some(generator) = &store.generator else {
        return degrade_to_vector(
            store,
            request,
            rerank_query,
            "HyDE needs a text generator, none is configured".to_string(),
        )
        .await;
    };
    let prompt = format!(
        "Write a short hypothetical passage that could answer the question below. \
         Accuracy is not required; cover the key concepts and terminology.\n\n\
         Question: {}\n\nPassage:",
        request.query
    );
    let hypothetical = match generator.generate(&prompt).await {
        Ok(text) if !text.trim().is_empty() => text,
        Ok(_) => {
            return degrade_to_vector(
                store,
                request,
                rerank_query,
                "HyDE generation returned an empty passage".to_string(),
            )
            .await;
        }
        Err(e) => {
            return degrade_to_vector(
                store,
                request,
                rerank_query,
                format!("HyDE generation failed: {e}"),
            )
            .await;
        }
    };
    tracing::debug!(chars = hypothetical.len(), "HyDE passage generated");

    let qv = store.embedder_embed(&hypothetical).await?;
    let (results, advisories) = store
        .fused_search(&qv, None, rerank_query, request.k, request.filters.as_ref())
        .await?;
    Ok(SearchResponse {
        results,
        strategy_used: RetrievalStrategy::Hyde,
        advisories,
    })
}

async fn query2doc(
    store: &GenerationalStore,
    request: &SearchRequest,
    rerank_query: Option<&str>,
) -> Result<SearchResponse> {
    let Some(generator) = &store.generator else {
        return degrade_to_vector(
            store,
            request,
            rerank_query,
            "Query2Doc needs a text generator, none is configured".to_string(),
        )
        .await;
    };
    let prompt = format!(
        "Write a brief pseudo-document that expands the following search query \
         with related terminology and likely phrasing.\n\nQuery: {}\n\nDocument:",
        request.query
    );
    let pseudo = match generator.generate(&prompt).await {
        Ok(text) => text,
        Err(e) => {
            return degrade_to_vector(
                store,
                request,
                rerank_query,
                format!("Query2Doc generation failed: {e}"),
            )
            .await;
        }
    };

    // The original query stays in front so its terms dominate
    let expanded = format!("{}\n{}", request.query, pseudo.trim());
    let qv = store.embedder_embed(&expanded).await?;
    let (results, advisories) = store
        .fused_search(&qv, None, rerank_query, request.k, request.filters.as_ref())
        .await?;
    Ok(SearchResponse {
        results,
        strategy_used: RetrievalStrategy::Query2Doc,
        advisories,
    })
}

async fn decomposition(
    store: &GenerationalStore,
    request: &SearchRequest,
    rerank: bool,
) -> Result<SearchResponse> {
    let rerank_query = if rerank {
        Some(request.query.as_str())
    } else {
        None
    };
    let Some(generator) = &store.generator else {
        return degrade_to_vector(
            store,
            request,
            rerank_query,
            "decomposition needs a text generator, none is configured".to_string(),
        )
        .await;
    };
    let condensed = rewrite::strip_stopwords(&request.query);
    let prompt = format!(
        "Break the following question into at most {MAX_SUB_QUERIES} simpler, \
         self-contained search queries, one per line, no numbering.\n\n\
         Question: {condensed}\n\nQueries:"
    );
    let sub_queries = match generator.generate(&prompt).await {
        Ok(text) => rewrite::parse_query_lines(&text, MAX_SUB_QUERIES),
        Err(e) => {
            return degrade_to_vector(
                store,
                request,
                rerank_query,
                format!("decomposition generation failed: {e}"),
            )
            .await;
        }
    };
    if sub_queries.is_empty() {
        return degrade_to_vector(
            store,
            request,
            rerank_query,
            "decomposition produced no sub-queries".to_string(),
        )
        .await;
    }

    // Original query first, then sub-queries; each list gets equal weight
    let mut queries = vec![request.query.clone()];
    queries.extend(sub_queries);
    let mut per_query: Vec<Vec<(Uuid, f32)>> = Vec::with_capacity(queries.len());
    let mut advisories = Vec::new();
    for query in &queries {
        let qv = store.embedder_embed(query).await?;
        let (results, notes) = store
            .fused_search(&qv, None, None, request.k, request.filters.as_ref())
            .await?;
        advisories.extend(notes);
        per_query.push(
            results
                .into_iter()
                .map(|r| (r.doc_id, r.distance.unwrap_or(f32::MAX)))
                .collect(),
        );
    }

    let lists: Vec<RankedList<'_>> = per_query
        .iter()
        .map(|entries| RankedList {
            entries,
            weight: 1.0,
            carries_distance: true,
        })
        .collect();
    let fused = rrf_fuse(&lists);

    let mut results: Vec<SearchResult> = fused
        .iter()
        .filter_map(|hit| {
            let chunk = store.chunk_for(&hit.doc_id)?;
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
        .collect();

    if rerank {
        let (reranked, notes) = store.rerank_results(&request.query, results).await;
        results = reranked;
        advisories.extend(notes);
    }
    results.truncate(request.k);
    advisories.dedup();
    Ok(SearchResponse {
        results,
        strategy_used: RetrievalStrategy::Decomposition,
        advisories,
    })
}

async fn parent_child(
    store: &GenerationalStore,
    request: &SearchRequest,
    rerank_query: Option<&str>,
) -> Result<SearchResponse> {
    let qv = store.embedder_embed(&request.query).await?;
    // Over-fetch children: several usually share one parent
    let child_k = request.k * 3;
    let (children, advisories) = store
        .fused_search(&qv, None, rerank_query, child_k, request.filters.as_ref())
        .await?;

    let mut seen: HashMap<Uuid, ()> = HashMap::new();
    let mut results = Vec::with_capacity(request.k);
    for child in children {
        let parent_id = match child.metadata.get(PARENT_ID_KEY) {
            Some(MetadataValue::String(s)) => Uuid::parse_str(s).ok(),
            _ => None,
        };
        let (id, resolved) = match parent_id {
            Some(pid) => match store.chunk_for(&pid) {
                Some(parent) => (
                    pid,
                    SearchResult {
                        doc_id: pid,
                        file_id: parent.file_id,
                        content: parent.content,
                        metadata: parent.metadata,
                        score: child.score,
                        distance: child.distance,
                        similarity: child.similarity,
                    },
                ),
                // Parent chunk missing: serve the child itself
                None => (child.doc_id, child),
            },
            None => (child.doc_id, child),
        };
        if seen.insert(id, ()).is_none() {
            results.push(resolved);
            if results.len() == request.k {
                break;
            }
        }
    }
    Ok(SearchResponse {
        results,
        strategy_used: RetrievalStrategy::ParentChild,
        advisories,
    })
}

/// Query rewriting helpers used before prompting.
pub mod rewrite {
    use std::collections::HashSet;
    use std::sync::LazyLock;

    static QUERY_STOPWORDS: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
        [
            "a", "an", "and", "are", "can", "could", "do", "does", "how", "i", "is", "me", "of",
            "or", "please", "show", "tell", "the", "to", "what", "which", "why", "you",
        ]
        .into_iter()
        .collect()
    });

    /// Drop filler words so prompts focus on content terms. Returns the
    /// original query when stripping would empty it.
    pub fn strip_stopwords(query: &str) -> String {
        let kept: Vec<&str> = query
            .split_whitespace()
            .filter(|w| !QUERY_STOPWORDS.contains(w.to_lowercase().trim_matches('?')))
            .collect();
        if kept.is_empty() {
            query.to_string()
        } else {
            kept.join(" ")
        }
    }

    /// Parse generator output into clean sub-query lines: trims
    /// numbering and bullets, drops empties and duplicates.
    pub fn parse_query_lines(text: &str, max: usize) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut queries = Vec::new();
        for line in text.lines() {
            let cleaned = line
                .trim()
                .trim_start_matches(|c: char| {
                    c.is_ascii_digit() || c == '.' || c == ')' || c == '-' || c == '*'
                })
                .trim();
            if cleaned.is_empty() {
                continue;
            }
            if seen.insert(cleaned.to_lowercase()) {
                queries.push(cleaned.to_string());
                if queries.len() == max {
                    break;
                }
            }
        }
        queries
    }
}
