//! Chat orchestrator: composes guardrails, limits, rewriting, retrieval,
//! uncertainty estimation, and generation into one streaming turn.
//!
//! The orchestrator is the sole producer of [`StreamEvent`]s for a turn;
//! the wire adapter is the sole consumer. Event order per turn:
//!
//! `session` → (terminal `error` if blocked/invalid) → `progress`/
//! `thinking` → `sources` → zero or one `clarification` → `content`
//! deltas → zero or one `followup` → exactly one `done` or `error`.
//!
//! The assistant's concatenated text is persisted to the conversation
//! store once, after generation finishes — a client disconnect mid-stream
//! stops further provider calls but never corrupts stored history.

use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::guardrails;
use crate::llm::LlmRequest;
use crate::models::{
    ChatMessage, ConversationSession, Document, ProgressItem, ProgressStatus, SeuResult,
};
use crate::conversation::TurnVerdict;
use crate::retrieval::FALLBACK_DOC_TYPE;
use crate::rewrite::search_query;
use crate::services::Services;
use crate::stream::{DoneMeta, SourceInfo, StreamEvent};

/// Inbound chat request, matching the wire contract.
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub message: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub conversation_history: Option<Vec<ChatMessage>>,
    #[serde(default)]
    pub options: Option<ChatOptions>,
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatOptions {
    #[serde(default)]
    pub max_search_results: Option<usize>,
    #[serde(default)]
    pub include_sources: Option<bool>,
}

/// Generic rejection message. Deliberately does not reveal which guardrail
/// rule matched.
const SECURITY_REJECTION: &str =
    "This request cannot be processed. Please rephrase your question.";

pub struct ChatOrchestrator {
    services: Arc<Services>,
}

/// Event sender that tracks client liveness: once a send fails the client
/// is gone and no further provider work should start.
struct Emitter {
    tx: mpsc::Sender<StreamEvent>,
    alive: bool,
}

impl Emitter {
    async fn send(&mut self, event: StreamEvent) -> bool {
        if self.alive && self.tx.send(event).await.is_err() {
            self.alive = false;
        }
        self.alive
    }
}

impl ChatOrchestrator {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }

    /// Run one streaming chat turn. Events arrive on the returned channel;
    /// the channel closes after the terminal `done`/`error`.
    pub fn handle_stream_chat(
        &self,
        request: ChatRequest,
        client_ip: String,
    ) -> mpsc::Receiver<StreamEvent> {
        let (tx, rx) = mpsc::channel(64);
        let services = self.services.clone();
        tokio::spawn(async move {
            let mut emitter = Emitter { tx, alive: true };
            run_turn(services, request, client_ip, &mut emitter).await;
        });
        rx
    }
}

async fn run_turn(
    services: Arc<Services>,
    request: ChatRequest,
    client_ip: String,
    emitter: &mut Emitter,
) {
    let started = Instant::now();
    let session_id = request
        .session_id
        .clone()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    if !emitter
        .send(StreamEvent::Session {
            session_id: session_id.clone(),
        })
        .await
    {
        return;
    }

    // Validation and guardrails happen before any expensive work.
    let message = request.message.trim().to_string();
    if message.is_empty() {
        let _ = emitter
            .send(StreamEvent::Error {
                code: "bad_request".into(),
                message: "Message must not be empty".into(),
                retry_after_secs: None,
            })
            .await;
        return;
    }

    let verdict = guardrails::validate_input(&message);
    if !verdict.safe {
        // The matched rule stays internal; the client only learns that the
        // request was rejected.
        warn!(
            session = %session_id,
            rule = verdict.matched.unwrap_or("unknown"),
            "input rejected by guardrail"
        );
        let _ = emitter
            .send(StreamEvent::Error {
                code: "security".into(),
                message: SECURITY_REJECTION.into(),
                retry_after_secs: None,
            })
            .await;
        return;
    }

    // Session state and limiter short-circuit.
    let mut session = services.conversations.load(&session_id).await;
    if session.history.is_empty() {
        if let Some(history) = &request.conversation_history {
            session.history = history.clone();
        }
    }
    let turn_count = session.message_count + 1;

    match services.limiter.check_turn(&client_ip, turn_count).await {
        TurnVerdict::Rejected { retry_after_secs } => {
            let _ = emitter
                .send(StreamEvent::Error {
                    code: "rate_limited".into(),
                    message: "Too many messages. Please try again later or leave your contact."
                        .into(),
                    retry_after_secs: Some(retry_after_secs),
                })
                .await;
            return;
        }
        TurnVerdict::Allowed { suggest_contact } => {
            services.conversations.touch_device(&client_ip).await;
            let options = request.options.clone().unwrap_or_default();
            stream_answer(
                services,
                emitter,
                &mut session,
                &message,
                &options,
                suggest_contact,
                started,
            )
            .await;
        }
    }
}

async fn stream_answer(
    services: Arc<Services>,
    emitter: &mut Emitter,
    session: &mut ConversationSession,
    message: &str,
    options: &ChatOptions,
    suggest_contact: bool,
    started: Instant,
) {
    let mut progress = vec![
        ProgressItem::new("rewrite", "질문 분석", ProgressStatus::InProgress),
        ProgressItem::new("search", "문서 검색", ProgressStatus::Pending),
        ProgressItem::new("answer", "답변 생성", ProgressStatus::Pending),
    ];
    if !emitter
        .send(StreamEvent::Progress {
            items: progress.clone(),
        })
        .await
    {
        return;
    }

    // Query understanding.
    let rewrite = services.rewriter.rewrite(message, &session.history);
    if !rewrite.changes.is_empty()
        && !emitter
            .send(StreamEvent::Thinking {
                message: format!("검색어 보정: {}", rewrite.rewritten),
            })
            .await
    {
        return;
    }

    progress[0].status = ProgressStatus::Completed;
    progress[1].status = ProgressStatus::InProgress;
    if !emitter
        .send(StreamEvent::Progress {
            items: progress.clone(),
        })
        .await
    {
        return;
    }

    // Retrieval. Never fatal: a degraded outcome flows through with
    // result_count = 0.
    let top_k = options
        .max_search_results
        .unwrap_or(services.config.retrieval.top_k)
        .clamp(1, 20);
    let query = search_query(&rewrite).to_string();
    let outcome = services.retriever.search(&query, top_k).await;

    if options.include_sources.unwrap_or(true)
        && !emitter
            .send(StreamEvent::Sources {
                sources: outcome
                    .documents
                    .iter()
                    .filter(|d| d.metadata.doc_type != FALLBACK_DOC_TYPE)
                    .map(|d| SourceInfo {
                        title: d
                            .metadata
                            .title
                            .clone()
                            .unwrap_or_else(|| d.id.clone()),
                        category: d.metadata.category.clone(),
                        snippet: Some(d.content.chars().take(160).collect()),
                    })
                    .collect(),
            })
            .await
    {
        return;
    }

    progress[1].status = ProgressStatus::Completed;
    progress[2].status = ProgressStatus::InProgress;
    if !emitter
        .send(StreamEvent::Progress {
            items: progress.clone(),
        })
        .await
    {
        return;
    }

    // Uncertainty measurement decides between clarifying and escalating.
    let context = context_block(&outcome.documents);
    let seu = services.uncertainty.measure(message, &context).await;

    if rewrite.needs_clarification || seu.is_uncertain {
        let suggested = services
            .rewriter
            .generate_suggested_questions(message, Some(&context), Some(&seu))
            .await;
        if !emitter
            .send(StreamEvent::Clarification {
                question: "질문이 조금 더 구체적이면 정확히 답할 수 있어요.".into(),
                suggested_questions: suggested,
            })
            .await
        {
            return;
        }
    }

    if seu.should_escalate
        && !emitter
            .send(StreamEvent::Escalation {
                reason: "answer confidence is low; consider leaving contact details".into(),
                uncertainty: seu.uncertainty,
            })
            .await
    {
        return;
    }

    // Generation. Failure here is fatal to the turn.
    let llm_request = generation_request(&services, session, message, &context, &seu);
    let mut deltas = match services.language_model.stream(&llm_request).await {
        Ok(rx) => rx,
        Err(e) => {
            warn!("generation failed to start: {:#}", e);
            let _ = emitter
                .send(StreamEvent::Error {
                    code: "generation_failed".into(),
                    message: "Answer generation is temporarily unavailable.".into(),
                    retry_after_secs: None,
                })
                .await;
            return;
        }
    };

    let mut answer = String::new();
    while let Some(delta) = deltas.recv().await {
        match delta {
            Ok(text) => {
                let filtered = guardrails::filter_output(&text);
                if filtered.filtered {
                    warn!(patterns = ?filtered.detected_patterns, "outbound delta redacted");
                }
                answer.push_str(&filtered.sanitized);
                if !emitter
                    .send(StreamEvent::Content {
                        delta: filtered.sanitized,
                    })
                    .await
                {
                    // Client gone: stop consuming, skip persistence of the
                    // partial answer.
                    return;
                }
            }
            Err(e) => {
                warn!("generation stream failed: {:#}", e);
                let _ = emitter
                    .send(StreamEvent::Error {
                        code: "generation_failed".into(),
                        message: "Answer generation was interrupted.".into(),
                        retry_after_secs: None,
                    })
                    .await;
                return;
            }
        }
    }

    // Final outbound pass over the whole answer catches shapes split
    // across delta boundaries before anything is persisted.
    let final_filter = guardrails::filter_output(&answer);
    if final_filter.filtered {
        warn!(patterns = ?final_filter.detected_patterns, "final answer redacted");
    }
    let answer = final_filter.sanitized;

    if suggest_contact
        && !emitter
            .send(StreamEvent::Followup {
                question: "직접 연락을 원하시면 연락처를 남겨주세요.".into(),
            })
            .await
    {
        return;
    }

    // Persist once, after the generator finished.
    services
        .conversations
        .append_exchange(
            session,
            ChatMessage::user(message),
            ChatMessage::assistant(answer),
        )
        .await;

    info!(
        session = %session.id,
        result_count = outcome.result_count,
        uncertainty = seu.uncertainty,
        "turn completed"
    );

    let _ = emitter
        .send(StreamEvent::Done {
            meta: DoneMeta {
                search_query: query,
                result_count: outcome.result_count,
                elapsed_ms: started.elapsed().as_millis() as u64,
                suggest_contact,
                message_count: session.message_count,
            },
        })
        .await;
}

fn context_block(documents: &[Document]) -> String {
    documents
        .iter()
        .map(|d| {
            let title = d.metadata.title.as_deref().unwrap_or(&d.id);
            format!("[{}]\n{}", title, d.content)
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn generation_request(
    services: &Services,
    session: &ConversationSession,
    message: &str,
    context: &str,
    seu: &SeuResult,
) -> LlmRequest {
    let persona = &services.config.persona;
    let mut system = format!(
        "You answer questions about {} ({}) on their personal site. \
         Ground every claim in the context below; when the context does not \
         cover the question, say so instead of guessing. Answer in the \
         visitor's language.\n\nContext:\n{}",
        persona.name, persona.name_native, context
    );
    if seu.is_uncertain {
        system.push_str(
            "\n\nThe retrieved material may not fully cover this question; \
             be explicit about what is and is not known.",
        );
    }

    let mut messages: Vec<ChatMessage> = session
        .history
        .iter()
        .rev()
        .take(10)
        .rev()
        .cloned()
        .collect();
    messages.push(ChatMessage::user(message));

    LlmRequest {
        system: Some(system),
        messages,
        temperature: None,
        max_tokens: None,
    }
}
