//! Conversation lifecycle: session history, escalation thresholds, and
//! per-identity throttling.
//!
//! Three concerns share the state store's namespaced key layout:
//!
//! - **[`ConversationStore`]** — per-session message history and user-turn
//!   counter, persisted as a JSON blob with a 24h TTL. Updates are
//!   read-modify-write without optimistic locking: concurrent turns in the
//!   same session are last-writer-wins (at-least-once, not exactly-once).
//! - **[`ConversationLimiter`]** — the threshold state machine
//!   `Normal → SuggestContact → Blocked`, plus the sliding-window request
//!   rate limit. Counters always go through atomic `incr`, never
//!   read-then-write.
//! - Device profiles — a per-identity last-seen record with a 90d TTL.
//!
//! Blocking is keyed by client identity (IP), not session: the block is a
//! cost control, and a captured contact lifts it immediately regardless of
//! remaining TTL.

use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::LimitsConfig;
use crate::models::{ChatMessage, ConversationSession};
use crate::state::StateHandle;

/// Most recent messages retained per session (user + assistant combined).
pub const HISTORY_CAP: usize = 20;

/// Session TTL in the state store.
pub const SESSION_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Device profile TTL.
pub const DEVICE_TTL: Duration = Duration::from_secs(90 * 24 * 60 * 60);

pub fn key_session(id: &str) -> String {
    format!("chat:session:{}", id)
}
pub fn key_ratelimit(ip: &str) -> String {
    format!("chat:ratelimit:{}", ip)
}
pub fn key_blocked(ip: &str) -> String {
    format!("chat:blocked:{}", ip)
}
pub fn key_device(ip: &str) -> String {
    format!("chat:device:{}", ip)
}

// ═══════════════════════════════════════════════════════════════════════
// Conversation store
// ═══════════════════════════════════════════════════════════════════════

pub struct ConversationStore {
    state: Arc<StateHandle>,
}

impl ConversationStore {
    pub fn new(state: Arc<StateHandle>) -> Self {
        Self { state }
    }

    /// Load a session, or create a fresh one if absent/corrupt. A cached
    /// blob that fails to parse is treated as absent, not as an error.
    pub async fn load(&self, session_id: &str) -> ConversationSession {
        match self.state.get(&key_session(session_id)).await {
            Some(raw) => match serde_json::from_str(&raw) {
                Ok(session) => session,
                Err(e) => {
                    debug!(session_id, "discarding unparseable session blob: {}", e);
                    ConversationSession::new(session_id)
                }
            },
            None => ConversationSession::new(session_id),
        }
    }

    /// Persist a session with the standard TTL.
    pub async fn save(&self, session: &ConversationSession) {
        match serde_json::to_string(session) {
            Ok(raw) => {
                self.state
                    .set(&key_session(&session.id), &raw, Some(SESSION_TTL))
                    .await;
            }
            Err(e) => debug!(session_id = %session.id, "session serialization failed: {}", e),
        }
    }

    /// Append a completed exchange and persist. The user-turn counter
    /// advances by one; history is capped to the most recent turns.
    pub async fn append_exchange(
        &self,
        session: &mut ConversationSession,
        user: ChatMessage,
        assistant: ChatMessage,
    ) {
        session.history.push(user);
        session.history.push(assistant);
        if session.history.len() > HISTORY_CAP {
            let excess = session.history.len() - HISTORY_CAP;
            session.history.drain(..excess);
        }
        session.message_count += 1;
        session.updated_at = Utc::now();
        self.save(session).await;
    }

    /// List live session keys (admin surface).
    pub async fn list_session_keys(&self) -> Vec<String> {
        self.state.scan_prefix("chat:session:").await
    }

    /// Record a last-seen profile for a client identity.
    pub async fn touch_device(&self, ip: &str) {
        let profile = json!({"last_seen": Utc::now().to_rfc3339()});
        self.state
            .set(&key_device(ip), &profile.to_string(), Some(DEVICE_TTL))
            .await;
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Conversation limiter
// ═══════════════════════════════════════════════════════════════════════

/// Verdict for one inbound turn, evaluated before any retrieval work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnVerdict {
    /// Proceed with the turn.
    Allowed { suggest_contact: bool },
    /// Rejected: the client identity is blocked or rate limited.
    Rejected { retry_after_secs: u64 },
}

/// Threshold state machine over message counts and per-identity blocks.
pub struct ConversationLimiter {
    state: Arc<StateHandle>,
    config: LimitsConfig,
}

impl ConversationLimiter {
    pub fn new(state: Arc<StateHandle>, config: LimitsConfig) -> Self {
        Self { state, config }
    }

    /// Evaluate one user turn. `message_count` is the count *including*
    /// this turn. Order of checks: existing block, request rate, block
    /// threshold, suggest threshold.
    pub async fn check_turn(&self, ip: &str, message_count: u32) -> TurnVerdict {
        if let Some(retry_after_secs) = self.blocked_retry_after(ip).await {
            return TurnVerdict::Rejected { retry_after_secs };
        }

        if let Some(retry_after_secs) = self.rate_limited(ip).await {
            return TurnVerdict::Rejected { retry_after_secs };
        }

        if message_count >= self.config.block_after {
            self.block(ip).await;
            info!(ip, message_count, "conversation block threshold reached");
            return TurnVerdict::Rejected {
                retry_after_secs: self.config.block_secs,
            };
        }

        TurnVerdict::Allowed {
            suggest_contact: message_count >= self.config.suggest_contact_after,
        }
    }

    /// Remaining block time for an identity, if blocked.
    pub async fn blocked_retry_after(&self, ip: &str) -> Option<u64> {
        let raw = self.state.get(&key_blocked(ip)).await?;
        let expires_at: i64 = raw.parse().ok()?;
        let remaining = expires_at - Utc::now().timestamp();
        if remaining > 0 {
            Some(remaining as u64)
        } else {
            // TTL race: the store kept an expired flag alive.
            None
        }
    }

    async fn block(&self, ip: &str) {
        let expires_at = Utc::now().timestamp() + self.config.block_secs as i64;
        self.state
            .set(
                &key_blocked(ip),
                &expires_at.to_string(),
                Some(Duration::from_secs(self.config.block_secs)),
            )
            .await;
    }

    /// Lift a block immediately. Called when a contact is captured: a
    /// delivered contact has already paid the engagement cost.
    pub async fn unblock(&self, ip: &str) {
        self.state.delete(&key_blocked(ip)).await;
        info!(ip, "block lifted after contact capture");
    }

    /// Sliding-window request throttle via atomic increment. The first
    /// hit in a window sets the window TTL.
    async fn rate_limited(&self, ip: &str) -> Option<u64> {
        let key = key_ratelimit(ip);
        let count = self.state.incr(&key).await;
        if count == 1 {
            self.state
                .expire(&key, Duration::from_secs(self.config.rate_window_secs))
                .await;
        }
        (count > self.config.rate_max_requests as i64).then_some(self.config.rate_window_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Role;

    fn limiter(config: LimitsConfig) -> ConversationLimiter {
        ConversationLimiter::new(Arc::new(StateHandle::memory_only()), config)
    }

    #[tokio::test]
    async fn session_roundtrip_and_history_cap() {
        let store = ConversationStore::new(Arc::new(StateHandle::memory_only()));
        let mut session = store.load("s1").await;
        assert_eq!(session.message_count, 0);

        for i in 0..15 {
            store
                .append_exchange(
                    &mut session,
                    ChatMessage::user(format!("q{}", i)),
                    ChatMessage::assistant(format!("a{}", i)),
                )
                .await;
        }

        let reloaded = store.load("s1").await;
        assert_eq!(reloaded.message_count, 15);
        assert_eq!(reloaded.history.len(), HISTORY_CAP);
        // Oldest turns dropped, newest retained.
        assert_eq!(reloaded.history.last().unwrap().content, "a14");
        assert_eq!(reloaded.history.last().unwrap().role, Role::Assistant);
    }

    #[tokio::test]
    async fn corrupt_session_blob_is_discarded() {
        let state = Arc::new(StateHandle::memory_only());
        state.set(&key_session("bad"), "{not json", None).await;
        let store = ConversationStore::new(state);
        let session = store.load("bad").await;
        assert_eq!(session.message_count, 0);
        assert!(session.history.is_empty());
    }

    #[tokio::test]
    async fn suggest_contact_starts_at_fifth_turn() {
        let l = limiter(LimitsConfig::default());
        for count in 1..=4u32 {
            match l.check_turn("1.2.3.4", count).await {
                TurnVerdict::Allowed { suggest_contact } => assert!(!suggest_contact),
                other => panic!("unexpected verdict: {:?}", other),
            }
        }
        match l.check_turn("1.2.3.4", 5).await {
            TurnVerdict::Allowed { suggest_contact } => assert!(suggest_contact),
            other => panic!("unexpected verdict: {:?}", other),
        }
    }

    #[tokio::test]
    async fn thirtieth_turn_blocks_identity() {
        let l = limiter(LimitsConfig {
            rate_max_requests: 100,
            ..Default::default()
        });
        match l.check_turn("5.6.7.8", 30).await {
            TurnVerdict::Rejected { retry_after_secs } => {
                assert!(retry_after_secs > 0);
            }
            other => panic!("expected rejection, got {:?}", other),
        }
        // The next request from the same identity is rejected up front,
        // even with a low message count (new session, same address).
        match l.check_turn("5.6.7.8", 1).await {
            TurnVerdict::Rejected { retry_after_secs } => {
                assert!(retry_after_secs <= 300);
            }
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn contact_capture_unblocks() {
        let l = limiter(LimitsConfig {
            rate_max_requests: 100,
            ..Default::default()
        });
        let _ = l.check_turn("9.9.9.9", 30).await;
        assert!(l.blocked_retry_after("9.9.9.9").await.is_some());

        l.unblock("9.9.9.9").await;
        assert!(l.blocked_retry_after("9.9.9.9").await.is_none());
        match l.check_turn("9.9.9.9", 6).await {
            TurnVerdict::Allowed { suggest_contact } => assert!(suggest_contact),
            other => panic!("unexpected verdict: {:?}", other),
        }
    }

    #[tokio::test]
    async fn request_rate_window_rejects_excess() {
        let l = limiter(LimitsConfig {
            rate_max_requests: 3,
            rate_window_secs: 60,
            ..Default::default()
        });
        for _ in 0..3 {
            assert!(matches!(
                l.check_turn("8.8.8.8", 1).await,
                TurnVerdict::Allowed { .. }
            ));
        }
        match l.check_turn("8.8.8.8", 1).await {
            TurnVerdict::Rejected { retry_after_secs } => assert_eq!(retry_after_secs, 60),
            other => panic!("expected rejection, got {:?}", other),
        }
    }
}
