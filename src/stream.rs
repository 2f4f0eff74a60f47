//! Streaming event protocol between the orchestrator and the wire.
//!
//! [`StreamEvent`] is a closed sum type so every consumer match is
//! exhaustively checked; the wire shape is an internally tagged JSON
//! object serialized into one SSE frame per event (`event: <type>` /
//! `data: <json>`). Exactly one `done` or `error` terminates a turn.
//!
//! Some event types are transient: informational only, never persisted in
//! a client-side transcript.

use serde::{Deserialize, Serialize};

use crate::models::ProgressItem;

/// A retrieved source as exposed to the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceInfo {
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
}

/// Aggregate metadata carried by the terminal `done` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DoneMeta {
    pub search_query: String,
    pub result_count: usize,
    pub elapsed_ms: u64,
    pub suggest_contact: bool,
    pub message_count: u32,
}

/// One event in a streaming chat turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Always first: announces the session id in effect for this turn.
    Session { session_id: String },
    Status { message: String },
    ToolCall { name: String, detail: String },
    Sources { sources: Vec<SourceInfo> },
    Content { delta: String },
    Clarification {
        question: String,
        suggested_questions: Vec<String>,
    },
    Thinking { message: String },
    Progress { items: Vec<ProgressItem> },
    Followup { question: String },
    Escalation { reason: String, uncertainty: f64 },
    Done { meta: DoneMeta },
    Error {
        code: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        retry_after_secs: Option<u64>,
    },
}

impl StreamEvent {
    /// Wire tag for the SSE `event:` field.
    pub fn event_name(&self) -> &'static str {
        match self {
            StreamEvent::Session { .. } => "session",
            StreamEvent::Status { .. } => "status",
            StreamEvent::ToolCall { .. } => "tool_call",
            StreamEvent::Sources { .. } => "sources",
            StreamEvent::Content { .. } => "content",
            StreamEvent::Clarification { .. } => "clarification",
            StreamEvent::Thinking { .. } => "thinking",
            StreamEvent::Progress { .. } => "progress",
            StreamEvent::Followup { .. } => "followup",
            StreamEvent::Escalation { .. } => "escalation",
            StreamEvent::Done { .. } => "done",
            StreamEvent::Error { .. } => "error",
        }
    }

    /// Transient events are informational and never persisted in a
    /// client-side transcript.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StreamEvent::Session { .. }
                | StreamEvent::Progress { .. }
                | StreamEvent::Escalation { .. }
                | StreamEvent::Done { .. }
        )
    }

    /// Whether this event terminates the turn.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Done { .. } | StreamEvent::Error { .. })
    }

    /// Serialize into one SSE frame.
    pub fn to_sse_frame(&self) -> String {
        let data = serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string());
        format!("event: {}\ndata: {}\n\n", self.event_name(), data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_are_internally_tagged() {
        let event = StreamEvent::Content {
            delta: "hello".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "content");
        assert_eq!(json["delta"], "hello");
    }

    #[test]
    fn sse_frame_shape() {
        let event = StreamEvent::Session {
            session_id: "abc".into(),
        };
        let frame = event.to_sse_frame();
        assert!(frame.starts_with("event: session\ndata: "));
        assert!(frame.ends_with("\n\n"));
    }

    #[test]
    fn transient_marking_matches_protocol() {
        let transient = [
            StreamEvent::Session { session_id: "s".into() },
            StreamEvent::Progress { items: vec![] },
            StreamEvent::Escalation { reason: "r".into(), uncertainty: 0.7 },
            StreamEvent::Done {
                meta: DoneMeta {
                    search_query: "q".into(),
                    result_count: 0,
                    elapsed_ms: 1,
                    suggest_contact: false,
                    message_count: 1,
                },
            },
        ];
        for event in transient {
            assert!(event.is_transient(), "{} not transient", event.event_name());
        }
        assert!(!StreamEvent::Content { delta: "x".into() }.is_transient());
        assert!(!StreamEvent::Sources { sources: vec![] }.is_transient());
    }

    #[test]
    fn terminal_events() {
        assert!(StreamEvent::Error {
            code: "security".into(),
            message: "rejected".into(),
            retry_after_secs: None,
        }
        .is_terminal());
        assert!(!StreamEvent::Thinking { message: "…".into() }.is_terminal());
    }

    #[test]
    fn roundtrip_through_wire_shape() {
        let event = StreamEvent::Clarification {
            question: "어떤 경력이 궁금하신가요?".into(),
            suggested_questions: vec!["회사 경력?".into()],
        };
        let json = serde_json::to_string(&event).unwrap();
        let back: StreamEvent = serde_json::from_str(&json).unwrap();
        match back {
            StreamEvent::Clarification { suggested_questions, .. } => {
                assert_eq!(suggested_questions.len(), 1)
            }
            other => panic!("wrong variant: {:?}", other),
        }
    }
}
