//! Inverted index for BM25 full-text search.
//!
//! Maps terms to postings lists (internal u32 doc id + term frequency).
//! Document lengths are tracked for BM25 length normalization. Supports
//! incremental addition and removal.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A single entry in a term's postings list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Posting {
    /// Internal u32 document id.
    pub doc: u32,
    /// Occurrences of the term in the document.
    pub term_frequency: u32,
}

/// Inverted index mapping terms to postings lists.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct InvertedIndex {
    /// term → postings
    pub postings: HashMap<String, Vec<Posting>>,
    /// internal id → token count. Indexed by internal id; 0 = absent.
    pub doc_lengths: Vec<u32>,
    /// Number of indexed documents.
    pub doc_count: u32,
    /// Sum of all document lengths.
    pub total_doc_length: u64,
}

impl InvertedIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index a tokenized document under `internal_id`.
    pub fn add_document(&mut self, internal_id: u32, tokens: &[String]) {
        let idx = internal_id as usize;
        if idx >= self.doc_lengths.len() {
            self.doc_lengths.resize(idx + 1, 0);
        }
        let doc_len = tokens.len() as u32;
        self.doc_lengths[idx] = doc_len;
        self.doc_count += 1;
        self.total_doc_length += doc_len as u64;

        let mut tf: HashMap<&str, u32> = HashMap::new();
        for token in tokens {
            *tf.entry(token.as_str()).or_insert(0) += 1;
        }
        for (term, term_frequency) in tf {
            self.postings.entry(term.to_string()).or_default().push(Posting {
                doc: internal_id,
                term_frequency,
            });
        }
    }

    /// Remove a document by internal id. Idempotent.
    pub fn remove_document(&mut self, internal_id: u32) {
        let idx = internal_id as usize;
        if idx < self.doc_lengths.len() && self.doc_lengths[idx] > 0 {
            let doc_len = self.doc_lengths[idx];
            self.doc_lengths[idx] = 0;
            self.doc_count -= 1;
            self.total_doc_length -= doc_len as u64;

            self.postings.retain(|_, list| {
                list.retain(|p| p.doc != internal_id);
                !list.is_empty()
            });
        }
    }

    /// Average document length across indexed documents.
    pub fn average_doc_length(&self) -> f32 {
        if self.doc_count == 0 {
            return 0.0;
        }
        self.total_doc_length as f32 / self.doc_count as f32
    }

    /// Vocabulary size.
    pub fn term_count(&self) -> usize {
        self.postings.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toks(words: &[&str]) -> Vec<String> {
        words.iter().map(|w| w.to_string()).collect()
    }

    #[test]
    fn test_add_document_updates_postings() {
        let mut idx = InvertedIndex::new();
        idx.add_document(0, &toks(&["quick", "brown", "fox"]));
        assert_eq!(idx.doc_count, 1);
        assert!(idx.postings.contains_key("quick"));
        assert!(idx.postings.contains_key("fox"));
        assert_eq!(idx.term_count(), 3);
    }

    #[test]
    fn test_term_frequency_counted() {
        let mut idx = InvertedIndex::new();
        idx.add_document(0, &toks(&["hello", "hello", "hello", "world"]));
        let postings = idx.postings.get("hello").unwrap();
        assert_eq!(postings.len(), 1);
        assert_eq!(postings[0].term_frequency, 3);
    }

    #[test]
    fn test_remove_document() {
        let mut idx = InvertedIndex::new();
        idx.add_document(0, &toks(&["hello", "world"]));
        idx.add_document(1, &toks(&["hello", "rust"]));
        idx.remove_document(0);
        assert_eq!(idx.doc_count, 1);
        assert!(!idx.postings.contains_key("world"));
        let postings = idx.postings.get("hello").unwrap();
        assert_eq!(postings.len(), 1);
        assert_eq!(postings[0].doc, 1);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let mut idx = InvertedIndex::new();
        idx.add_document(0, &toks(&["hello"]));
        idx.remove_document(0);
        idx.remove_document(0);
        idx.remove_document(42);
        assert_eq!(idx.doc_count, 0);
        assert_eq!(idx.total_doc_length, 0);
    }

    #[test]
    fn test_average_doc_length() {
        let mut idx = InvertedIndex::new();
        assert_eq!(idx.average_doc_length(), 0.0);
        idx.add_document(0, &toks(&["one", "two"]));
        idx.add_document(1, &toks(&["three", "four", "five", "six"]));
        assert!((idx.average_doc_length() - 3.0).abs() < 1e-6);
    }
}
