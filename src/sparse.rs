//! BM25-style sparse term-weighting engine.
//!
//! Builds a vocabulary and document-frequency table over the persona corpus
//! and converts queries into sparse term-weight vectors for the hybrid
//! retriever. Tokenization is bilingual: Latin tokens are lowercased and
//! stopword-filtered, Hangul tokens have common trailing particles stripped.
//!
//! An empty [`SparseVector`] is a legitimate zero-signal result (index not
//! built, or no query token in vocabulary), never an error.

use once_cell::sync::Lazy;
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use crate::models::Document;

/// Sparse query representation: parallel term indices and weights.
#[derive(Debug, Clone, Default)]
pub struct SparseVector {
    pub indices: Vec<usize>,
    pub values: Vec<f64>,
}

impl SparseVector {
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

static EN_STOPWORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "a", "an", "the", "is", "are", "was", "were", "be", "been", "am", "do", "does", "did",
        "have", "has", "had", "i", "you", "he", "she", "it", "we", "they", "me", "him", "her",
        "us", "them", "my", "your", "his", "its", "our", "their", "of", "in", "on", "at", "to",
        "for", "with", "by", "from", "about", "as", "and", "or", "but", "not", "no", "so", "if",
        "then", "than", "too", "very", "can", "will", "just", "what", "who", "how", "when",
        "where", "why", "which", "this", "that", "these", "those",
    ]
    .into_iter()
    .collect()
});

/// Korean postpositional particles stripped from the end of Hangul tokens.
/// Ordered longest-first so the most specific suffix wins.
static KO_PARTICLES: Lazy<Vec<&'static str>> = Lazy::new(|| {
    vec![
        "에서는", "에게서", "으로는", "이라는", "까지", "부터", "에서", "에게", "으로", "이란",
        "라는", "보다", "처럼", "한테", "마저", "조차", "은", "는", "이", "가", "을", "를",
        "의", "에", "로", "와", "과", "도", "만", "란",
    ]
});

fn is_hangul(c: char) -> bool {
    ('\u{AC00}'..='\u{D7A3}').contains(&c) || ('\u{1100}'..='\u{11FF}').contains(&c)
}

fn strip_particle(token: &str) -> &str {
    for particle in KO_PARTICLES.iter() {
        if let Some(stem) = token.strip_suffix(particle) {
            // Never strip a token down to nothing.
            if !stem.is_empty() {
                return stem;
            }
        }
    }
    token
}

/// Tokenize text for indexing and querying. Both sides of the index must
/// use this identical pipeline.
pub fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    for raw in text.split(|c: char| !(c.is_alphanumeric() || is_hangul(c))) {
        if raw.is_empty() {
            continue;
        }
        if raw.chars().any(is_hangul) {
            let stem = strip_particle(raw);
            if !stem.is_empty() {
                tokens.push(stem.to_string());
            }
        } else {
            let lower = raw.to_lowercase();
            if lower.len() < 2 || EN_STOPWORDS.contains(lower.as_str()) {
                continue;
            }
            tokens.push(lower);
        }
    }
    tokens
}

struct Index {
    vocab: HashMap<String, usize>,
    doc_freq: Vec<u32>,
    doc_count: usize,
    #[allow(dead_code)]
    avg_doc_len: f64,
}

/// Term-weighting engine over the persona corpus.
///
/// Built once at startup from the full document set; `build` atomically
/// swaps in the new index, so concurrent readers see either the old or the
/// new index, never a partial one.
#[derive(Default)]
pub struct SparseIndexer {
    index: RwLock<Option<Index>>,
}

impl SparseIndexer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the vocabulary and document-frequency table and swap it in.
    pub fn build(&self, documents: &[Document]) {
        let mut vocab: HashMap<String, usize> = HashMap::new();
        let mut doc_freq: Vec<u32> = Vec::new();
        let mut total_len = 0usize;

        for document in documents {
            let tokens = tokenize(&document.content);
            total_len += tokens.len();
            let unique: HashSet<&String> = tokens.iter().collect();
            for token in unique {
                let next_id = vocab.len();
                let id = *vocab.entry(token.clone()).or_insert(next_id);
                if id == doc_freq.len() {
                    doc_freq.push(0);
                }
                doc_freq[id] += 1;
            }
        }

        let doc_count = documents.len();
        let avg_doc_len = if doc_count > 0 {
            total_len as f64 / doc_count as f64
        } else {
            0.0
        };

        let mut guard = self.index.write().unwrap_or_else(|e| e.into_inner());
        *guard = Some(Index {
            vocab,
            doc_freq,
            doc_count,
            avg_doc_len,
        });
    }

    /// Number of distinct terms in the vocabulary (0 when unbuilt).
    pub fn vocab_size(&self) -> usize {
        self.index
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|i| i.vocab.len())
            .unwrap_or(0)
    }

    /// Convert a query into a sparse term-weight vector.
    ///
    /// Each in-vocabulary token is weighted `idf(token) * tf(token)` with
    /// `idf = ln((N - df + 0.5) / (df + 0.5) + 1)`. Out-of-vocabulary
    /// tokens are dropped; an unbuilt index yields an empty vector.
    pub fn score_query(&self, query: &str) -> SparseVector {
        let guard = self.index.read().unwrap_or_else(|e| e.into_inner());
        let Some(index) = guard.as_ref() else {
            return SparseVector::default();
        };

        let mut term_freq: HashMap<usize, f64> = HashMap::new();
        for token in tokenize(query) {
            if let Some(&id) = index.vocab.get(&token) {
                *term_freq.entry(id).or_insert(0.0) += 1.0;
            }
        }

        let n = index.doc_count as f64;
        let mut pairs: Vec<(usize, f64)> = term_freq
            .into_iter()
            .map(|(id, tf)| {
                let df = index.doc_freq[id] as f64;
                let idf = ((n - df + 0.5) / (df + 0.5) + 1.0).ln();
                (id, idf * tf)
            })
            .collect();
        pairs.sort_by_key(|(id, _)| *id);

        SparseVector {
            indices: pairs.iter().map(|(id, _)| *id).collect(),
            values: pairs.iter().map(|(_, w)| *w).collect(),
        }
    }

    /// Score each document against the query by summing matched term
    /// weights. Used by the hybrid retriever's sparse channel.
    pub fn score_documents(&self, query: &str, documents: &[Document]) -> Vec<f64> {
        let guard = self.index.read().unwrap_or_else(|e| e.into_inner());
        let Some(index) = guard.as_ref() else {
            return vec![0.0; documents.len()];
        };

        let mut query_weights: HashMap<String, f64> = HashMap::new();
        let n = index.doc_count as f64;
        for token in tokenize(query) {
            if let Some(&id) = index.vocab.get(&token) {
                let df = index.doc_freq[id] as f64;
                let idf = ((n - df + 0.5) / (df + 0.5) + 1.0).ln();
                *query_weights.entry(token).or_insert(0.0) += idf;
            }
        }

        documents
            .iter()
            .map(|document| {
                tokenize(&document.content)
                    .iter()
                    .filter_map(|t| query_weights.get(t))
                    .sum()
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DocMetadata;

    fn doc(id: &str, content: &str) -> Document {
        Document {
            id: id.to_string(),
            content: content.to_string(),
            metadata: DocMetadata::default(),
        }
    }

    #[test]
    fn tokenize_lowercases_and_drops_stopwords() {
        let tokens = tokenize("The Quick Brown Fox is running");
        assert_eq!(tokens, vec!["quick", "brown", "fox", "running"]);
    }

    #[test]
    fn tokenize_strips_korean_particles() {
        let tokens = tokenize("경력은 개발자의 프로젝트를");
        assert_eq!(tokens, vec!["경력", "개발자", "프로젝트"]);
    }

    #[test]
    fn unbuilt_index_yields_empty_vector() {
        let indexer = SparseIndexer::new();
        assert!(indexer.score_query("anything").is_empty());
    }

    #[test]
    fn oov_tokens_are_dropped() {
        let indexer = SparseIndexer::new();
        indexer.build(&[doc("a", "rust systems programming")]);
        let sparse = indexer.score_query("quantum chromodynamics");
        assert!(sparse.is_empty());
    }

    #[test]
    fn rare_terms_outweigh_common_terms() {
        let indexer = SparseIndexer::new();
        indexer.build(&[
            doc("a", "career overview career history"),
            doc("b", "career at a startup"),
            doc("c", "embedded firmware work"),
        ]);
        // "career" appears in 2 of 3 docs, "firmware" in 1 of 3.
        let common = indexer.score_query("career");
        let rare = indexer.score_query("firmware");
        assert_eq!(common.indices.len(), 1);
        assert_eq!(rare.indices.len(), 1);
        assert!(rare.values[0] > common.values[0]);
    }

    #[test]
    fn rebuild_swaps_vocabulary() {
        let indexer = SparseIndexer::new();
        indexer.build(&[doc("a", "alpha beta")]);
        assert_eq!(indexer.vocab_size(), 2);
        indexer.build(&[doc("b", "gamma")]);
        assert_eq!(indexer.vocab_size(), 1);
        assert!(indexer.score_query("alpha").is_empty());
    }

    #[test]
    fn score_documents_ranks_matching_doc_higher() {
        let indexer = SparseIndexer::new();
        let docs = vec![
            doc("a", "전자공학 학위와 경력"),
            doc("b", "취미로 등산을 한다"),
        ];
        indexer.build(&docs);
        let scores = indexer.score_documents("경력이 어떻게 되나요", &docs);
        assert!(scores[0] > scores[1]);
    }
}
