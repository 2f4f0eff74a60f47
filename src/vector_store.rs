//! Vector store port: similarity search over the embedded corpus.
//!
//! Two implementations:
//! - **[`RestVectorStore`]** — a remote index speaking a Pinecone-style
//!   REST protocol (`/vectors/upsert`, `/query`, `/vectors/delete`).
//! - **[`MemoryVectorStore`]** — brute-force cosine similarity over an
//!   in-process `Vec`, used for tests and as the degraded fallback when no
//!   remote index is configured.
//!
//! Metadata filters are equality maps (`category = "work"`); the memory
//! implementation applies them post-hoc, the REST implementation forwards
//! them to the index.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use crate::config::{Config, VectorConfig};
use crate::embedding::cosine_similarity;
use crate::models::{DocMetadata, Document, ScoredDocument};

/// Equality filter over document metadata.
pub type MetadataFilter = HashMap<String, String>;

/// Similarity-search port over embedded documents.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Insert or replace documents with their embeddings. `documents` and
    /// `vectors` are parallel and must be the same length.
    async fn upsert(&self, documents: &[Document], vectors: &[Vec<f32>]) -> Result<()>;

    /// Delete every chunk whose metadata `source` equals `path`.
    async fn delete_by_path(&self, path: &str) -> Result<usize>;

    /// Nearest-neighbor query, most similar first.
    async fn query(
        &self,
        vector: &[f32],
        top_k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<ScoredDocument>>;

    /// List indexed documents matching a filter (admin/sync surface).
    async fn list(&self, filter: Option<&MetadataFilter>) -> Result<Vec<Document>>;

    /// Number of indexed chunks, when cheaply known.
    async fn count(&self) -> Result<usize>;
}

fn metadata_matches(metadata: &DocMetadata, filter: &MetadataFilter) -> bool {
    filter.iter().all(|(key, want)| match key.as_str() {
        "type" => metadata.doc_type == *want,
        "title" => metadata.title.as_deref() == Some(want),
        "category" => metadata.category.as_deref() == Some(want),
        "source" => metadata.source.as_deref() == Some(want),
        "keyword" => metadata.keywords.iter().any(|k| k == want),
        _ => false,
    })
}

// ═══════════════════════════════════════════════════════════════════════
// In-memory implementation
// ═══════════════════════════════════════════════════════════════════════

struct StoredVector {
    document: Document,
    vector: Vec<f32>,
}

/// In-memory vector store: brute-force cosine over all stored vectors.
#[derive(Default)]
pub struct MemoryVectorStore {
    entries: RwLock<Vec<StoredVector>>,
}

impl MemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    async fn upsert(&self, documents: &[Document], vectors: &[Vec<f32>]) -> Result<()> {
        if documents.len() != vectors.len() {
            return Err(anyhow!(
                "Upsert length mismatch: {} documents, {} vectors",
                documents.len(),
                vectors.len()
            ));
        }
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        for (document, vector) in documents.iter().zip(vectors.iter()) {
            entries.retain(|e| e.document.id != document.id);
            entries.push(StoredVector {
                document: document.clone(),
                vector: vector.clone(),
            });
        }
        Ok(())
    }

    async fn delete_by_path(&self, path: &str) -> Result<usize> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        entries.retain(|e| e.document.metadata.source.as_deref() != Some(path));
        Ok(before - entries.len())
    }

    async fn query(
        &self,
        vector: &[f32],
        top_k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<ScoredDocument>> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        let mut scored: Vec<ScoredDocument> = entries
            .iter()
            .filter(|e| filter.map_or(true, |f| metadata_matches(&e.document.metadata, f)))
            .map(|e| ScoredDocument {
                document: e.document.clone(),
                score: cosine_similarity(vector, &e.vector),
            })
            .collect();
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(top_k);
        Ok(scored)
    }

    async fn list(&self, filter: Option<&MetadataFilter>) -> Result<Vec<Document>> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        Ok(entries
            .iter()
            .filter(|e| filter.map_or(true, |f| metadata_matches(&e.document.metadata, f)))
            .map(|e| e.document.clone())
            .collect())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.entries.read().unwrap_or_else(|e| e.into_inner()).len())
    }
}

// ═══════════════════════════════════════════════════════════════════════
// REST implementation
// ═══════════════════════════════════════════════════════════════════════

/// Remote vector index speaking a Pinecone-style REST protocol.
pub struct RestVectorStore {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    namespace: String,
}

impl RestVectorStore {
    pub fn new(config: &VectorConfig) -> Result<Self> {
        let api_key = Config::env_key(&config.api_key_env)
            .ok_or_else(|| anyhow!("{} environment variable not set", config.api_key_env))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to build vector store HTTP client")?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            namespace: config.namespace.clone(),
        })
    }

    async fn post(&self, path: &str, body: serde_json::Value) -> Result<serde_json::Value> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .post(&url)
            .header("Api-Key", &self.api_key)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("Vector store request failed: {}", path))?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(anyhow!("Vector store error {}: {}", status, body_text));
        }
        response
            .json()
            .await
            .context("Vector store returned invalid JSON")
    }

    fn doc_from_match(m: &serde_json::Value) -> Option<ScoredDocument> {
        let id = m.get("id")?.as_str()?.to_string();
        let score = m.get("score").and_then(|s| s.as_f64()).unwrap_or(0.0);
        let metadata_value = m.get("metadata").cloned().unwrap_or(json!({}));
        let content = metadata_value
            .get("content")
            .and_then(|c| c.as_str())
            .unwrap_or_default()
            .to_string();
        let metadata: DocMetadata = serde_json::from_value(metadata_value).unwrap_or_default();
        Some(ScoredDocument {
            document: Document { id, content, metadata },
            score,
        })
    }
}

#[async_trait]
impl VectorStore for RestVectorStore {
    async fn upsert(&self, documents: &[Document], vectors: &[Vec<f32>]) -> Result<()> {
        if documents.len() != vectors.len() {
            return Err(anyhow!(
                "Upsert length mismatch: {} documents, {} vectors",
                documents.len(),
                vectors.len()
            ));
        }
        let items: Vec<serde_json::Value> = documents
            .iter()
            .zip(vectors.iter())
            .map(|(document, vector)| {
                // Content rides along in metadata so query results are
                // self-contained.
                let mut metadata = serde_json::to_value(&document.metadata).unwrap_or(json!({}));
                metadata["content"] = json!(document.content);
                json!({
                    "id": document.id,
                    "values": vector,
                    "metadata": metadata,
                })
            })
            .collect();
        self.post(
            "/vectors/upsert",
            json!({"vectors": items, "namespace": self.namespace}),
        )
        .await?;
        Ok(())
    }

    async fn delete_by_path(&self, path: &str) -> Result<usize> {
        self.post(
            "/vectors/delete",
            json!({
                "filter": {"source": {"$eq": path}},
                "namespace": self.namespace,
            }),
        )
        .await?;
        // The protocol does not report a deletion count.
        Ok(0)
    }

    async fn query(
        &self,
        vector: &[f32],
        top_k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<ScoredDocument>> {
        let mut body = json!({
            "vector": vector,
            "topK": top_k,
            "includeMetadata": true,
            "namespace": self.namespace,
        });
        if let Some(filter) = filter {
            let clauses: serde_json::Map<String, serde_json::Value> = filter
                .iter()
                .map(|(k, v)| (k.clone(), json!({"$eq": v})))
                .collect();
            body["filter"] = serde_json::Value::Object(clauses);
        }
        let response = self.post("/query", body).await?;
        let matches = response
            .get("matches")
            .and_then(|m| m.as_array())
            .ok_or_else(|| anyhow!("Invalid query response: missing matches"))?;
        Ok(matches.iter().filter_map(Self::doc_from_match).collect())
    }

    async fn list(&self, filter: Option<&MetadataFilter>) -> Result<Vec<Document>> {
        // Listing rides on a zero-vector query with a large topK; the
        // protocol has no dedicated scan endpoint.
        let zero = vec![0.0f32; 1];
        let scored = self.query(&zero, 1000, filter).await?;
        Ok(scored.into_iter().map(|s| s.document).collect())
    }

    async fn count(&self) -> Result<usize> {
        let response = self.post("/describe_index_stats", json!({})).await?;
        Ok(response
            .get("totalVectorCount")
            .and_then(|c| c.as_u64())
            .unwrap_or(0) as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(id: &str, content: &str, source: &str, category: &str) -> Document {
        Document {
            id: id.to_string(),
            content: content.to_string(),
            metadata: DocMetadata {
                doc_type: "note".to_string(),
                source: Some(source.to_string()),
                category: Some(category.to_string()),
                ..Default::default()
            },
        }
    }

    #[tokio::test]
    async fn memory_query_ranks_by_similarity() {
        let store = MemoryVectorStore::new();
        let docs = vec![
            doc("a", "about work", "notes/a.md", "work"),
            doc("b", "about hobbies", "notes/b.md", "life"),
        ];
        store
            .upsert(&docs, &[vec![1.0, 0.0], vec![0.0, 1.0]])
            .await
            .unwrap();

        let results = store.query(&[0.9, 0.1], 2, None).await.unwrap();
        assert_eq!(results[0].document.id, "a");
        assert!(results[0].score > results[1].score);
    }

    #[tokio::test]
    async fn memory_filter_and_delete_by_path() {
        let store = MemoryVectorStore::new();
        let docs = vec![
            doc("a", "x", "notes/a.md", "work"),
            doc("b", "y", "notes/b.md", "life"),
        ];
        store
            .upsert(&docs, &[vec![1.0, 0.0], vec![1.0, 0.0]])
            .await
            .unwrap();

        let mut filter = MetadataFilter::new();
        filter.insert("category".to_string(), "work".to_string());
        let results = store.query(&[1.0, 0.0], 5, Some(&filter)).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].document.id, "a");

        let deleted = store.delete_by_path("notes/a.md").await.unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn memory_upsert_replaces_same_id() {
        let store = MemoryVectorStore::new();
        let first = vec![doc("a", "old", "notes/a.md", "work")];
        store.upsert(&first, &[vec![1.0]]).await.unwrap();
        let second = vec![doc("a", "new", "notes/a.md", "work")];
        store.upsert(&second, &[vec![1.0]]).await.unwrap();

        assert_eq!(store.count().await.unwrap(), 1);
        let listed = store.list(None).await.unwrap();
        assert_eq!(listed[0].content, "new");
    }
}
