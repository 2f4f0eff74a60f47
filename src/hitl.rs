//! Human-in-the-loop capture: contacts, feedback, corrections.
//!
//! Write-once records keyed by session. Contacts live 30 days; feedback
//! folds into per-rating counters; corrections append to a log a human
//! reviews later. Capturing a contact lifts any active block for the
//! submitting identity (see [`crate::conversation::ConversationLimiter`]).

use anyhow::{bail, Result};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::conversation::ConversationLimiter;
use crate::models::{ContactInfo, CorrectionData, FeedbackData};
use crate::state::StateHandle;

pub const CONTACT_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

pub fn key_contact(session_id: &str) -> String {
    format!("chat:contact:{}", session_id)
}
pub fn key_feedback(rating: &str) -> String {
    format!("chat:feedback:{}", rating)
}
pub const KEY_CORRECTIONS: &str = "chat:corrections";

pub struct HitlService {
    state: Arc<StateHandle>,
    limiter: Arc<ConversationLimiter>,
}

impl HitlService {
    pub fn new(state: Arc<StateHandle>, limiter: Arc<ConversationLimiter>) -> Self {
        Self { state, limiter }
    }

    /// Capture a contact and lift any block on the submitting identity.
    pub async fn submit_contact(&self, contact: &ContactInfo, ip: &str) -> Result<()> {
        if contact.email.trim().is_empty() || !contact.email.contains('@') {
            bail!("Contact email is required");
        }
        let session_key = contact
            .session_id
            .clone()
            .unwrap_or_else(|| format!("anon-{}", Utc::now().timestamp_millis()));
        let raw = serde_json::to_string(contact)?;
        self.state
            .set(&key_contact(&session_key), &raw, Some(CONTACT_TTL))
            .await;
        self.limiter.unblock(ip).await;
        info!(session = %session_key, "contact captured");
        Ok(())
    }

    /// Fold a feedback submission into the per-rating aggregate.
    pub async fn submit_feedback(&self, feedback: &FeedbackData) -> Result<()> {
        let bucket = match feedback.rating {
            None => "none".to_string(),
            Some(r @ 1..=3) => r.to_string(),
            Some(other) => bail!("Invalid rating: {} (expected 1, 2, 3, or null)", other),
        };
        self.state.incr(&key_feedback(&bucket)).await;
        Ok(())
    }

    /// Append a correction to the review log.
    pub async fn submit_correction(&self, correction: &CorrectionData) -> Result<()> {
        if correction.correction_message.trim().is_empty() {
            bail!("Correction message is required");
        }
        if correction.original_query.is_empty() || correction.original_response.is_empty() {
            bail!("A correction must reference the original query and response");
        }
        let raw = serde_json::to_string(correction)?;
        self.state.list_push(KEY_CORRECTIONS, &raw).await;
        Ok(())
    }

    /// Aggregate feedback counts per rating bucket, for the status surface.
    pub async fn feedback_totals(&self) -> Vec<(String, i64)> {
        let mut totals = Vec::new();
        for bucket in ["1", "2", "3", "none"] {
            let count = self
                .state
                .get(&key_feedback(bucket))
                .await
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
            totals.push((bucket.to_string(), count));
        }
        totals
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LimitsConfig;

    fn service() -> (HitlService, Arc<StateHandle>, Arc<ConversationLimiter>) {
        let state = Arc::new(StateHandle::memory_only());
        let limiter = Arc::new(ConversationLimiter::new(
            state.clone(),
            LimitsConfig::default(),
        ));
        (
            HitlService::new(state.clone(), limiter.clone()),
            state,
            limiter,
        )
    }

    fn contact(session: Option<&str>) -> ContactInfo {
        ContactInfo {
            name: "Visitor".into(),
            email: "visitor@example.com".into(),
            message: Some("Please reach out".into()),
            session_id: session.map(|s| s.to_string()),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn contact_capture_persists_and_unblocks() {
        let (service, state, limiter) = service();
        let _ = limiter.check_turn("1.1.1.1", 30).await;
        assert!(limiter.blocked_retry_after("1.1.1.1").await.is_some());

        service
            .submit_contact(&contact(Some("s1")), "1.1.1.1")
            .await
            .unwrap();

        assert!(limiter.blocked_retry_after("1.1.1.1").await.is_none());
        assert!(state.get(&key_contact("s1")).await.is_some());
    }

    #[tokio::test]
    async fn contact_requires_plausible_email() {
        let (service, _, _) = service();
        let mut bad = contact(None);
        bad.email = "not-an-email".into();
        assert!(service.submit_contact(&bad, "1.1.1.1").await.is_err());
    }

    #[tokio::test]
    async fn feedback_aggregates_by_rating() {
        let (service, _, _) = service();
        for rating in [Some(1), Some(1), Some(3), None] {
            service
                .submit_feedback(&FeedbackData {
                    rating,
                    session_id: None,
                    created_at: Utc::now(),
                })
                .await
                .unwrap();
        }
        let totals = service.feedback_totals().await;
        assert!(totals.contains(&("1".to_string(), 2)));
        assert!(totals.contains(&("3".to_string(), 1)));
        assert!(totals.contains(&("none".to_string(), 1)));
    }

    #[tokio::test]
    async fn out_of_range_rating_is_rejected() {
        let (service, _, _) = service();
        let result = service
            .submit_feedback(&FeedbackData {
                rating: Some(5),
                session_id: None,
                created_at: Utc::now(),
            })
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn corrections_append_to_log() {
        let (service, state, _) = service();
        service
            .submit_correction(&CorrectionData {
                original_query: "경력".into(),
                original_response: "10 years".into(),
                correction_message: "It is 12 years now".into(),
                session_id: Some("s1".into()),
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        let log = state.list_range(KEY_CORRECTIONS, 0, -1).await;
        assert_eq!(log.len(), 1);
        assert!(log[0].contains("12 years"));
    }
}
