//! Hybrid dense + sparse retrieval with rank fusion and diversity dedup.
//!
//! The retriever runs two channels over the same query: dense similarity
//! search against the vector store (over-fetched to survive deduplication)
//! and sparse term-weight scoring over the in-memory corpus snapshot. The
//! two ranked lists are combined with reciprocal rank fusion — a document
//! ranked highly in either channel outranks one ranked poorly in both —
//! then deduplicated by source identity and truncated to `top_k`.
//!
//! Retrieval is never fatal to a turn: a vector store outage degrades to
//! the sparse channel, and a fully-empty result degrades to a clearly
//! labeled fallback document.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::warn;

use crate::config::RetrievalConfig;
use crate::embedding::Embedder;
use crate::models::{DocMetadata, Document, ScoredDocument};
use crate::sparse::SparseIndexer;
use crate::vector_store::VectorStore;

/// Document type tag for degraded, non-corpus results.
pub const FALLBACK_DOC_TYPE: &str = "fallback";

/// Outcome of one retrieval pass, with enough metadata for the `done`
/// event to distinguish degraded results (`result_count == 0`).
#[derive(Debug, Clone)]
pub struct RetrievalOutcome {
    pub documents: Vec<Document>,
    /// Number of real (non-fallback) results.
    pub result_count: usize,
    pub degraded: bool,
}

pub struct HybridRetriever {
    embedder: Arc<dyn Embedder>,
    vector_store: Arc<dyn VectorStore>,
    sparse: Arc<SparseIndexer>,
    /// Corpus snapshot scored by the sparse channel. Replaced wholesale on
    /// reindex, together with the sparse index.
    corpus: RwLock<Arc<Vec<Document>>>,
    config: RetrievalConfig,
}

impl HybridRetriever {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        vector_store: Arc<dyn VectorStore>,
        sparse: Arc<SparseIndexer>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            embedder,
            vector_store,
            sparse,
            corpus: RwLock::new(Arc::new(Vec::new())),
            config,
        }
    }

    /// Swap in a new corpus snapshot (paired with a sparse index rebuild).
    pub fn set_corpus(&self, documents: Vec<Document>) {
        self.sparse.build(&documents);
        let mut corpus = self.corpus.write().unwrap_or_else(|e| e.into_inner());
        *corpus = Arc::new(documents);
    }

    fn corpus_snapshot(&self) -> Arc<Vec<Document>> {
        self.corpus.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Retrieve the `top_k` most relevant documents for a query.
    pub async fn search(&self, query: &str, top_k: usize) -> RetrievalOutcome {
        let overfetch = top_k.max(1) * self.config.overfetch_factor.max(1);

        let dense = self.dense_channel(query, overfetch).await;
        let sparse = self.sparse_channel(query, overfetch);
        let degraded = dense.is_none();

        let dense = dense.unwrap_or_default();
        let fused = fuse_ranked_lists(
            &dense,
            &sparse,
            self.config.fusion_k,
            self.config.dense_weight,
            self.config.sparse_weight,
        );
        let deduped = dedup_by_source(fused);

        let documents: Vec<Document> = deduped
            .into_iter()
            .take(top_k)
            .map(|s| s.document)
            .collect();

        if documents.is_empty() {
            return RetrievalOutcome {
                documents: vec![fallback_document(query)],
                result_count: 0,
                degraded: true,
            };
        }

        RetrievalOutcome {
            result_count: documents.len(),
            documents,
            degraded,
        }
    }

    async fn dense_channel(&self, query: &str, fetch: usize) -> Option<Vec<ScoredDocument>> {
        let vector = match self.embedder.embed_query(query).await {
            Ok(v) => v,
            Err(e) => {
                warn!("query embedding failed, dense channel skipped: {:#}", e);
                return None;
            }
        };
        match self.vector_store.query(&vector, fetch, None).await {
            Ok(results) => Some(results),
            Err(e) => {
                warn!("vector store query failed, dense channel skipped: {:#}", e);
                None
            }
        }
    }

    fn sparse_channel(&self, query: &str, fetch: usize) -> Vec<ScoredDocument> {
        let corpus = self.corpus_snapshot();
        if corpus.is_empty() {
            return Vec::new();
        }
        let scores = self.sparse.score_documents(query, &corpus);
        let mut scored: Vec<ScoredDocument> = corpus
            .iter()
            .zip(scores)
            .filter(|(_, score)| *score > 0.0)
            .map(|(document, score)| ScoredDocument {
                document: document.clone(),
                score,
            })
            .collect();
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(fetch);
        scored
    }
}

/// Reciprocal rank fusion over two ranked lists.
///
/// `fused(d) = dense_weight / (k + rank_dense) + sparse_weight / (k +
/// rank_sparse)`, with a missing rank contributing nothing. The constant
/// `k` and the channel weights are tunables, not contracts.
pub fn fuse_ranked_lists(
    dense: &[ScoredDocument],
    sparse: &[ScoredDocument],
    k: f64,
    dense_weight: f64,
    sparse_weight: f64,
) -> Vec<ScoredDocument> {
    let mut fused: HashMap<String, (Document, f64)> = HashMap::new();

    for (rank, item) in dense.iter().enumerate() {
        let score = dense_weight / (k + rank as f64 + 1.0);
        fused
            .entry(item.document.id.clone())
            .and_modify(|(_, s)| *s += score)
            .or_insert((item.document.clone(), score));
    }
    for (rank, item) in sparse.iter().enumerate() {
        let score = sparse_weight / (k + rank as f64 + 1.0);
        fused
            .entry(item.document.id.clone())
            .and_modify(|(_, s)| *s += score)
            .or_insert((item.document.clone(), score));
    }

    let mut merged: Vec<ScoredDocument> = fused
        .into_values()
        .map(|(document, score)| ScoredDocument { document, score })
        .collect();
    merged.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    merged
}

/// Diversity pass: retain only the highest-fused chunk per source identity.
///
/// The stable key is the normalized title when present, otherwise the first
/// 50 characters of content.
pub fn dedup_by_source(ranked: Vec<ScoredDocument>) -> Vec<ScoredDocument> {
    let mut seen: HashMap<String, ()> = HashMap::new();
    let mut out = Vec::with_capacity(ranked.len());
    for item in ranked {
        let key = source_key(&item.document);
        if seen.insert(key, ()).is_none() {
            out.push(item);
        }
    }
    out
}

fn source_key(document: &Document) -> String {
    if let Some(title) = &document.metadata.title {
        let normalized = title.trim().to_lowercase();
        if !normalized.is_empty() {
            return normalized;
        }
    }
    document.content.chars().take(50).collect()
}

fn fallback_document(query: &str) -> Document {
    Document {
        id: "fallback".to_string(),
        content: format!(
            "No indexed documents were available for this query ({}). \
             The answer below is not grounded in the persona corpus.",
            query
        ),
        metadata: DocMetadata {
            doc_type: FALLBACK_DOC_TYPE.to_string(),
            title: Some("Degraded retrieval".to_string()),
            ..Default::default()
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetrievalConfig;
    use crate::vector_store::MemoryVectorStore;
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;

    fn doc(id: &str, content: &str, title: &str) -> Document {
        Document {
            id: id.to_string(),
            content: content.to_string(),
            metadata: DocMetadata {
                doc_type: "note".to_string(),
                title: Some(title.to_string()),
                ..Default::default()
            },
        }
    }

    fn scored(id: &str, title: &str, score: f64) -> ScoredDocument {
        ScoredDocument {
            document: doc(id, &format!("content of {}", id), title),
            score,
        }
    }

    struct StubEmbedder {
        fail: bool,
    }

    #[async_trait]
    impl Embedder for StubEmbedder {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            if self.fail {
                return Err(anyhow!("embedding offline"));
            }
            // Map text onto a 2d vector by crude keyword presence.
            Ok(texts
                .iter()
                .map(|t| {
                    let career = t.contains("경력") || t.contains("career");
                    if career {
                        vec![1.0, 0.0]
                    } else {
                        vec![0.0, 1.0]
                    }
                })
                .collect())
        }
        fn model_name(&self) -> &str {
            "stub"
        }
        fn dims(&self) -> usize {
            2
        }
    }

    #[test]
    fn fusion_prefers_document_ranked_high_in_either_list() {
        let dense = vec![scored("a", "A", 0.9), scored("b", "B", 0.5)];
        let sparse = vec![scored("c", "C", 3.0), scored("b", "B", 1.0)];
        let fused = fuse_ranked_lists(&dense, &sparse, 60.0, 1.0, 1.0);

        // "b" appears in both lists and must outrank anything appearing
        // only once at a worse-or-equal rank.
        let order: Vec<&str> = fused.iter().map(|s| s.document.id.as_str()).collect();
        assert_eq!(order[0], "b");
        assert_eq!(fused.len(), 3);
    }

    #[test]
    fn dedup_keeps_first_occurrence_per_title() {
        let ranked = vec![
            scored("a1", "Career", 0.9),
            scored("a2", "career ", 0.8),
            scored("b", "Hobbies", 0.7),
        ];
        let deduped = dedup_by_source(ranked);
        assert_eq!(deduped.len(), 2);
        assert_eq!(deduped[0].document.id, "a1");
        assert_eq!(deduped[1].document.id, "b");
    }

    #[test]
    fn dedup_falls_back_to_content_prefix() {
        let mut first = scored("x1", "", 0.9);
        first.document.metadata.title = None;
        first.document.content = "same prefix text".to_string();
        let mut second = scored("x2", "", 0.8);
        second.document.metadata.title = None;
        second.document.content = "same prefix text".to_string();

        let deduped = dedup_by_source(vec![first, second]);
        assert_eq!(deduped.len(), 1);
        assert_eq!(deduped[0].document.id, "x1");
    }

    async fn build_retriever(fail_embedding: bool) -> HybridRetriever {
        let store = Arc::new(MemoryVectorStore::new());
        let docs = vec![
            doc("career-0", "경력 백엔드 개발자 회사", "Career"),
            doc("hobby-0", "취미 등산 사진", "Hobbies"),
        ];
        store
            .upsert(&docs, &[vec![1.0, 0.0], vec![0.0, 1.0]])
            .await
            .unwrap();

        let retriever = HybridRetriever::new(
            Arc::new(StubEmbedder { fail: fail_embedding }),
            store,
            Arc::new(SparseIndexer::new()),
            RetrievalConfig::default(),
        );
        retriever.set_corpus(docs);
        retriever
    }

    #[tokio::test]
    async fn hybrid_search_ranks_relevant_doc_first() {
        let retriever = build_retriever(false).await;
        let outcome = retriever.search("경력이 궁금해요", 2).await;
        assert!(!outcome.degraded);
        assert_eq!(outcome.documents[0].id, "career-0");
        assert_eq!(outcome.result_count, outcome.documents.len());
    }

    #[tokio::test]
    async fn dense_outage_degrades_to_sparse_channel() {
        let retriever = build_retriever(true).await;
        let outcome = retriever.search("경력", 2).await;
        assert!(outcome.degraded);
        assert!(outcome.result_count > 0);
        assert_eq!(outcome.documents[0].id, "career-0");
    }

    #[tokio::test]
    async fn empty_everything_yields_labeled_fallback() {
        let retriever = HybridRetriever::new(
            Arc::new(StubEmbedder { fail: true }),
            Arc::new(MemoryVectorStore::new()),
            Arc::new(SparseIndexer::new()),
            RetrievalConfig::default(),
        );
        let outcome = retriever.search("anything", 3).await;
        assert!(outcome.degraded);
        assert_eq!(outcome.result_count, 0);
        assert_eq!(outcome.documents[0].metadata.doc_type, FALLBACK_DOC_TYPE);
    }
}
