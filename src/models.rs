//! Core data models used throughout Persona Engine.
//!
//! These types represent the documents, conversation turns, and derived
//! analysis results that flow through the retrieval and chat pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A chunk of the persona corpus stored in the vector store.
///
/// Immutable once indexed; identity is `id`. One logical note maps to many
/// documents sharing a `source` path and `category` but distinct
/// `chunk_index` values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub content: String,
    pub metadata: DocMetadata,
}

/// Metadata attached to each indexed document chunk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocMetadata {
    #[serde(rename = "type")]
    pub doc_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pub_date: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keywords: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_index: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_chunks: Option<usize>,
}

/// A document paired with a retrieval score.
#[derive(Debug, Clone)]
pub struct ScoredDocument {
    pub document: Document,
    pub score: f64,
}

/// Speaker role for a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// A single turn in a conversation. Append-only inside a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Per-session conversation state persisted in the state store.
///
/// `message_count` counts only user turns and drives the escalation
/// thresholds in the conversation limiter. History is capped to the most
/// recent turns; see [`crate::conversation::HISTORY_CAP`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSession {
    pub id: String,
    pub history: Vec<ChatMessage>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub message_count: u32,
}

impl ConversationSession {
    pub fn new(id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            history: Vec::new(),
            created_at: now,
            updated_at: now,
            message_count: 0,
        }
    }
}

/// How a query was rewritten, if at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RewriteMethod {
    Rule,
    Llm,
    None,
}

/// Result of the query-rewriting pipeline. Derived per query, not persisted.
#[derive(Debug, Clone, Serialize)]
pub struct RewriteResult {
    pub original: String,
    pub rewritten: String,
    pub method: RewriteMethod,
    pub changes: Vec<String>,
    pub needs_clarification: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub suggested_questions: Vec<String>,
}

impl RewriteResult {
    /// A rewrite that left the query untouched, byte for byte.
    pub fn unchanged(query: &str) -> Self {
        Self {
            original: query.to_string(),
            rewritten: query.to_string(),
            method: RewriteMethod::None,
            changes: Vec::new(),
            needs_clarification: false,
            suggested_questions: Vec::new(),
        }
    }
}

/// Semantic embedding uncertainty measurement. Derived per query.
///
/// `uncertainty = 1 - mean pairwise cosine similarity` across the sampled
/// responses. `is_uncertain` triggers the clarification flow and
/// `should_escalate` the human-contact flow.
#[derive(Debug, Clone, Serialize)]
pub struct SeuResult {
    pub uncertainty: f64,
    pub avg_similarity: f64,
    pub responses: Vec<String>,
    pub is_uncertain: bool,
    pub should_escalate: bool,
}

impl SeuResult {
    /// The maximally-uncertain result returned on provider failure.
    ///
    /// Fails toward asking a clarifying question, never toward silently
    /// answering; infrastructure failure alone never auto-escalates.
    pub fn max_uncertainty() -> Self {
        Self {
            uncertainty: 1.0,
            avg_similarity: 0.0,
            responses: Vec::new(),
            is_uncertain: true,
            should_escalate: false,
        }
    }
}

/// Status of a progress item within one streaming turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    Pending,
    InProgress,
    Completed,
    Skipped,
}

/// Ephemeral progress marker; exists only within one streaming turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressItem {
    pub id: String,
    pub label: String,
    pub status: ProgressStatus,
}

impl ProgressItem {
    pub fn new(id: &str, label: &str, status: ProgressStatus) -> Self {
        Self {
            id: id.to_string(),
            label: label.to_string(),
            status,
        }
    }
}

/// Contact details captured when a conversation escalates to a human.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContactInfo {
    pub name: String,
    pub email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A single feedback submission. `rating` is one of `{1, 2, 3, null}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackData {
    pub rating: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A user-submitted correction: always pairs the original query and answer
/// with the correction message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrectionData {
    pub original_query: String,
    pub original_response: String,
    pub correction_message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub created_at: DateTime<Utc>,
}
