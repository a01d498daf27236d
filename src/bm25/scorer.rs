//! BM25 Okapi scoring.
//!
//! `score(d, t) = idf(t) · tf·(k1+1) / (tf + k1·(1 − b + b·|d|/avg|d|))`,
//! summed over query terms, with `idf(t) = ln((N − df + 0.5)/(df + 0.5) + 1)`.

use crate::bm25::inverted_index::InvertedIndex;
use ordered_float::OrderedFloat;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

/// Score tokenized query terms against the index.
///
/// Returns `(internal_id, score)` sorted by descending score, at most `k`.
pub fn bm25_search(
    index: &InvertedIndex,
    query_tokens: &[String],
    k: usize,
    k1: f32,
    b: f32,
) -> Vec<(u32, f32)> {
    if query_tokens.is_empty() || index.doc_count == 0 || k == 0 {
        return Vec::new();
    }

    let avgdl = index.average_doc_length();
    let n = index.doc_count as f32;
    let mut scores: HashMap<u32, f32> = HashMap::with_capacity(256.min(index.doc_count as usize));

    for token in query_tokens {
        if let Some(postings) = index.postings.get(token.as_str()) {
            let df = postings.len() as f32;
            let idf = ((n - df + 0.5) / (df + 0.5) + 1.0).ln();

            for posting in postings {
                let dl = index
                    .doc_lengths
                    .get(posting.doc as usize)
                    .copied()
                    .unwrap_or(0) as f32;
                let tf = posting.term_frequency as f32;
                let tf_norm = (tf * (k1 + 1.0)) / (tf + k1 * (1.0 - b + b * dl / avgdl));
                *scores.entry(posting.doc).or_insert(0.0) += idf * tf_norm;
            }
        }
    }

    // Partial sort via min-heap of size k
    let mut heap: BinaryHeap<Reverse<(OrderedFloat<f32>, u32)>> = BinaryHeap::with_capacity(k + 1);
    for (doc, score) in scores {
        heap.push(Reverse((OrderedFloat(score), doc)));
        if heap.len() > k {
            heap.pop();
        }
    }
    let mut results: Vec<(u32, f32)> = heap
        .into_iter()
        .map(|Reverse((s, doc))| (doc, s.0))
        .collect();
    results.sort_unstable_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bm25::tokenizer::{DefaultTokenizer, Tokenizer};

    fn build_corpus() -> InvertedIndex {
        let t = DefaultTokenizer;
        let mut idx = InvertedIndex::new();
        idx.add_document(0, &t.tokenize("rust programming systems language fast"));
        idx.add_document(1, &t.tokenize("python programming scripting easy"));
        idx.add_document(2, &t.tokenize("java enterprise programming verbose"));
        idx.add_document(3, &t.tokenize("rust memory safety zero cost abstractions"));
        idx
    }

    fn q(text: &str) -> Vec<String> {
        DefaultTokenizer.tokenize(text)
    }

    #[test]
    fn test_empty_query() {
        let idx = build_corpus();
        assert!(bm25_search(&idx, &[], 10, 1.2, 0.75).is_empty());
    }

    #[test]
    fn test_empty_index() {
        let idx = InvertedIndex::new();
        assert!(bm25_search(&idx, &q("rust"), 10, 1.2, 0.75).is_empty());
    }

    #[test]
    fn test_finds_matching_docs() {
        let idx = build_corpus();
        let results = bm25_search(&idx, &q("rust"), 10, 1.2, 0.75);
        let ids: Vec<u32> = results.iter().map(|&(id, _)| id).collect();
        assert!(ids.contains(&0));
        assert!(ids.contains(&3));
        assert!(!ids.contains(&1));
    }

    #[test]
    fn test_higher_tf_ranks_first() {
        let mut idx = InvertedIndex::new();
        idx.add_document(0, &q("rust rust rust"));
        idx.add_document(1, &q("rust programming"));
        let results = bm25_search(&idx, &q("rust"), 10, 1.2, 0.75);
        assert_eq!(results[0].0, 0);
    }

    #[test]
    fn test_k_truncation() {
        let idx = build_corpus();
        let results = bm25_search(&idx, &q("programming"), 2, 1.2, 0.75);
        assert!(results.len() <= 2);
    }

    #[test]
    fn test_scores_positive_and_descending() {
        let idx = build_corpus();
        let results = bm25_search(&idx, &q("rust programming"), 10, 1.2, 0.75);
        for &(_, score) in &results {
            assert!(score > 0.0);
        }
        for w in results.windows(2) {
            assert!(w[0].1 >= w[1].1);
        }
    }

    #[test]
    fn test_b_zero_ignores_length() {
        // With b = 0, document length must not influence the score
        let mut idx = InvertedIndex::new();
        idx.add_document(0, &q("term alpha beta gamma delta epsilon zeta eta theta"));
        idx.add_document(1, &q("term other"));
        let results = bm25_search(&idx, &q("term"), 10, 1.2, 0.0);
        assert_eq!(results.len(), 2);
        assert!((results[0].1 - results[1].1).abs() < 1e-6);
    }
}
