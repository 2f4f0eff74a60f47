//! Persona corpus ingestion: markdown notes → chunked, embedded documents.
//!
//! Notes live in a flat directory tree (`notes/<category>/<name>.md`).
//! Each note is split on paragraph boundaries into chunks respecting a
//! character budget, embedded, and upserted into the vector store; the
//! sparse index and the retriever's corpus snapshot are rebuilt from the
//! full document set afterwards. Chunk ids are deterministic (path, index,
//! content hash), so re-syncing an unchanged note is idempotent.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use crate::models::{DocMetadata, Document};
use crate::services::Services;
use crate::vector_store::MetadataFilter;

/// Approximate character budget per chunk (~500 tokens).
const MAX_CHUNK_CHARS: usize = 2000;

/// Document type tag for corpus notes.
pub const NOTE_DOC_TYPE: &str = "note";

/// A markdown note before chunking.
#[derive(Debug, Clone)]
pub struct Note {
    /// Path relative to the notes root, with forward slashes.
    pub path: String,
    pub title: String,
    pub category: Option<String>,
    pub body: String,
}

/// Outcome of one corpus sync.
#[derive(Debug, Clone)]
pub struct SyncReport {
    pub notes: usize,
    pub chunks: usize,
}

/// Read every `.md` file under `root` into notes.
pub fn load_notes(root: &Path) -> Result<Vec<Note>> {
    let mut notes = Vec::new();
    let mut stack = vec![root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        let entries = std::fs::read_dir(&dir)
            .with_context(|| format!("Failed to read notes directory: {}", dir.display()))?;
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if path.extension().and_then(|e| e.to_str()) == Some("md") {
                notes.push(read_note(root, &path)?);
            }
        }
    }

    notes.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(notes)
}

fn read_note(root: &Path, path: &PathBuf) -> Result<Note> {
    let body = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read note: {}", path.display()))?;

    let relative = path
        .strip_prefix(root)
        .unwrap_or(path)
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");

    // Title: first "# " heading, else the file stem.
    let title = body
        .lines()
        .find_map(|l| l.strip_prefix("# ").map(|t| t.trim().to_string()))
        .unwrap_or_else(|| {
            path.file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_else(|| relative.clone())
        });

    // Category: first path component, when nested.
    let category = relative
        .split('/')
        .next()
        .filter(|c| *c != relative)
        .map(|c| c.to_string());

    Ok(Note {
        path: relative,
        title,
        category,
        body,
    })
}

/// Split note body text into chunks on paragraph boundaries, hard-splitting
/// any single paragraph that exceeds the budget on its own.
pub fn chunk_text(text: &str) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();

    for para in text.split("\n\n") {
        let trimmed = para.trim();
        if trimmed.is_empty() {
            continue;
        }

        let would_be = if current.is_empty() {
            trimmed.len()
        } else {
            current.len() + 2 + trimmed.len()
        };

        if would_be > MAX_CHUNK_CHARS && !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
        }

        if trimmed.len() > MAX_CHUNK_CHARS {
            if !current.is_empty() {
                chunks.push(std::mem::take(&mut current));
            }
            let mut remaining = trimmed;
            while !remaining.is_empty() {
                let cut = floor_char_boundary(remaining, MAX_CHUNK_CHARS);
                chunks.push(remaining[..cut].to_string());
                remaining = &remaining[cut..];
            }
            continue;
        }

        if !current.is_empty() {
            current.push_str("\n\n");
        }
        current.push_str(trimmed);
    }

    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

fn floor_char_boundary(s: &str, mut index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    while index > 0 && !s.is_char_boundary(index) {
        index -= 1;
    }
    index.max(1)
}

/// Deterministic chunk id: path slug, index, content hash prefix.
fn chunk_id(path: &str, index: usize, text: &str) -> String {
    let hex = format!("{:x}", Sha256::digest(text.as_bytes()));
    let slug: String = path
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    format!("{}-{}-{}", slug, index, &hex[..12])
}

/// Turn one note into its chunk documents.
pub fn note_documents(note: &Note) -> Vec<Document> {
    let chunks = chunk_text(&note.body);
    let total = chunks.len();
    chunks
        .into_iter()
        .enumerate()
        .map(|(index, content)| Document {
            id: chunk_id(&note.path, index, &content),
            content,
            metadata: DocMetadata {
                doc_type: NOTE_DOC_TYPE.to_string(),
                title: Some(note.title.clone()),
                category: note.category.clone(),
                source: Some(note.path.clone()),
                pub_date: None,
                keywords: Vec::new(),
                chunk_index: Some(index),
                total_chunks: Some(total),
            },
        })
        .collect()
}

/// Ingest a notes directory: delete stale chunks per path, embed and
/// upsert the new ones, then rebuild the sparse index and corpus snapshot.
pub async fn sync_dir(services: &Arc<Services>, root: &Path) -> Result<SyncReport> {
    let notes = load_notes(root)?;
    let mut all_documents = Vec::new();

    for note in &notes {
        services
            .vector_store
            .delete_by_path(&note.path)
            .await
            .with_context(|| format!("Failed to clear stale chunks for {}", note.path))?;
        all_documents.extend(note_documents(note));
    }

    let texts: Vec<String> = all_documents.iter().map(|d| d.content.clone()).collect();
    let vectors = services
        .embedder
        .embed(&texts)
        .await
        .context("Failed to embed corpus")?;
    services
        .vector_store
        .upsert(&all_documents, &vectors)
        .await
        .context("Failed to upsert corpus")?;

    services.retriever.set_corpus(all_documents.clone());
    info!(
        notes = notes.len(),
        chunks = all_documents.len(),
        "corpus sync complete"
    );

    Ok(SyncReport {
        notes: notes.len(),
        chunks: all_documents.len(),
    })
}

/// Delete every chunk of one note and rebuild the corpus snapshot.
pub async fn delete_path(services: &Arc<Services>, path: &str) -> Result<usize> {
    let removed = services.vector_store.delete_by_path(path).await?;
    let remaining = services.vector_store.list(None).await?;
    services.retriever.set_corpus(remaining);
    Ok(removed)
}

/// Tag-filtered corpus listing.
pub async fn list_documents(
    services: &Arc<Services>,
    filter: Option<&MetadataFilter>,
) -> Result<Vec<Document>> {
    services.vector_store.list(filter).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunking_respects_paragraph_boundaries() {
        let body = "first paragraph\n\nsecond paragraph\n\nthird";
        let chunks = chunk_text(body);
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].contains("first paragraph"));
        assert!(chunks[0].contains("third"));
    }

    #[test]
    fn oversized_paragraph_is_hard_split() {
        let body = "y".repeat(MAX_CHUNK_CHARS * 2 + 10);
        let chunks = chunk_text(&body);
        assert!(chunks.len() >= 2);
        assert!(chunks.iter().all(|c| c.len() <= MAX_CHUNK_CHARS));
    }

    #[test]
    fn chunk_ids_are_deterministic_and_content_sensitive() {
        let a = chunk_id("work/career.md", 0, "some text");
        let b = chunk_id("work/career.md", 0, "some text");
        let c = chunk_id("work/career.md", 0, "other text");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn note_documents_carry_chunk_metadata() {
        let note = Note {
            path: "work/career.md".into(),
            title: "Career".into(),
            category: Some("work".into()),
            body: format!("{}\n\n{}", "a".repeat(1900), "b".repeat(1900)),
        };
        let docs = note_documents(&note);
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].metadata.chunk_index, Some(0));
        assert_eq!(docs[1].metadata.chunk_index, Some(1));
        assert_eq!(docs[0].metadata.total_chunks, Some(2));
        assert_eq!(docs[0].metadata.source.as_deref(), Some("work/career.md"));
    }

    #[test]
    fn load_notes_extracts_title_and_category() {
        let tmp = tempfile::tempdir().unwrap();
        let work = tmp.path().join("work");
        std::fs::create_dir_all(&work).unwrap();
        std::fs::write(work.join("career.md"), "# My Career\n\nBackend work.").unwrap();
        std::fs::write(tmp.path().join("about.md"), "No heading here.").unwrap();

        let notes = load_notes(tmp.path()).unwrap();
        assert_eq!(notes.len(), 2);

        let about = notes.iter().find(|n| n.path == "about.md").unwrap();
        assert_eq!(about.title, "about");
        assert_eq!(about.category, None);

        let career = notes.iter().find(|n| n.path == "work/career.md").unwrap();
        assert_eq!(career.title, "My Career");
        assert_eq!(career.category.as_deref(), Some("work"));
    }
}
