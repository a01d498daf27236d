//! Tokenization for BM25 indexing and queries.
//!
//! The segmenter is an injected collaborator so deployments can plug in a
//! dictionary-based CJK segmenter. The default implementation lowercases
//! ASCII, splits on non-alphanumeric boundaries, drops Latin stop words
//! and single-letter tokens, and emits CJK codepoints as unigram tokens
//! (deterministic, dictionary-free).

use std::collections::HashSet;
use std::sync::LazyLock;

static STOP_WORDS: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    [
        "a", "an", "and", "are", "as", "at", "be", "but", "by", "for", "if", "in", "into", "is",
        "it", "no", "not", "of", "on", "or", "such", "that", "the", "their", "then", "there",
        "these", "they", "this", "to", "was", "will", "with",
    ]
    .into_iter()
    .collect()
});

/// Word segmentation interface consumed by the BM25 manager.
pub trait Tokenizer: Send + Sync {
    fn tokenize(&self, text: &str) -> Vec<String>;
}

/// Default language-aware tokenizer: lowercased ASCII words plus CJK
/// unigrams.
#[derive(Debug, Default, Clone)]
pub struct DefaultTokenizer;

impl Tokenizer for DefaultTokenizer {
    fn tokenize(&self, text: &str) -> Vec<String> {
        let mut tokens = Vec::new();
        let mut word = String::new();
        for c in text.chars() {
            if is_cjk(c) {
                flush_word(&mut word, &mut tokens);
                tokens.push(c.to_string());
            } else if c.is_alphanumeric() {
                for lc in c.to_lowercase() {
                    word.push(lc);
                }
            } else {
                flush_word(&mut word, &mut tokens);
            }
        }
        flush_word(&mut word, &mut tokens);
        tokens
    }
}

fn flush_word(word: &mut String, tokens: &mut Vec<String>) {
    if word.chars().count() > 1 && !STOP_WORDS.contains(word.as_str()) {
        tokens.push(std::mem::take(word));
    } else {
        word.clear();
    }
}

/// CJK unified ideographs, hiragana, katakana, and hangul ranges.
fn is_cjk(c: char) -> bool {
    matches!(c,
        '\u{4E00}'..='\u{9FFF}'
        | '\u{3400}'..='\u{4DBF}'
        | '\u{3040}'..='\u{309F}'
        | '\u{30A0}'..='\u{30FF}'
        | '\u{AC00}'..='\u{D7AF}'
    )
}
