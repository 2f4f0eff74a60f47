//! Semantic embedding uncertainty (SEU) estimation.
//!
//! Samples several independently-worded short answers to the same query at
//! high temperature, embeds them, and measures semantic disagreement as
//! `1 - mean pairwise cosine similarity`. Two structurally identical
//! answers score near 0; unrelated answers score near 1.
//!
//! Provider failure fails toward asking: the maximally-uncertain result is
//! returned (clarification triggered) but escalation is never driven by
//! infrastructure failure alone.

use futures_util::future::join_all;
use std::sync::Arc;
use tracing::warn;

use crate::config::UncertaintyConfig;
use crate::embedding::{cosine_similarity, Embedder};
use crate::llm::{LanguageModel, LlmRequest};
use crate::models::SeuResult;

/// Short instruction framings for the sampled answers. Worded differently
/// on purpose so agreement reflects the model's knowledge, not the prompt.
const SAMPLE_FRAMINGS: [&str; 3] = [
    "Answer in one short sentence.",
    "Reply with a single brief sentence.",
    "Give a one-sentence answer, nothing more.",
];

pub struct UncertaintyEstimator {
    language_model: Arc<dyn LanguageModel>,
    embedder: Arc<dyn Embedder>,
    config: UncertaintyConfig,
}

impl UncertaintyEstimator {
    pub fn new(
        language_model: Arc<dyn LanguageModel>,
        embedder: Arc<dyn Embedder>,
        config: UncertaintyConfig,
    ) -> Self {
        Self {
            language_model,
            embedder,
            config,
        }
    }

    /// Measure semantic disagreement across sampled answers to `query`.
    pub async fn measure(&self, query: &str, context: &str) -> SeuResult {
        let samples = self.config.samples.max(2);

        let requests: Vec<LlmRequest> = (0..samples)
            .map(|i| {
                let framing = SAMPLE_FRAMINGS[i % SAMPLE_FRAMINGS.len()];
                LlmRequest::user(format!("Context:\n{}\n\nQuestion: {}", context, query))
                    .with_system(framing.to_string())
                    .with_temperature(self.config.sample_temperature)
            })
            .collect();

        let completions =
            join_all(requests.iter().map(|r| self.language_model.complete(r))).await;

        let mut responses = Vec::with_capacity(samples);
        for completion in completions {
            match completion {
                Ok(text) => responses.push(text),
                Err(e) => {
                    warn!("uncertainty sample failed: {:#}", e);
                    return SeuResult::max_uncertainty();
                }
            }
        }

        let vectors = match self.embedder.embed(&responses).await {
            Ok(v) => v,
            Err(e) => {
                warn!("uncertainty embedding failed: {:#}", e);
                return SeuResult::max_uncertainty();
            }
        };

        let avg_similarity = mean_pairwise_similarity(&vectors);
        self.classify(avg_similarity, responses)
    }

    fn classify(&self, avg_similarity: f64, responses: Vec<String>) -> SeuResult {
        let uncertainty = (1.0 - avg_similarity).clamp(0.0, 1.0);
        SeuResult {
            uncertainty,
            avg_similarity: avg_similarity.clamp(0.0, 1.0),
            responses,
            is_uncertain: uncertainty > self.config.uncertain_threshold,
            should_escalate: uncertainty > self.config.escalate_threshold,
        }
    }
}

/// Mean cosine similarity over all N·(N−1)/2 vector pairs.
fn mean_pairwise_similarity(vectors: &[Vec<f32>]) -> f64 {
    if vectors.len() < 2 {
        return 0.0;
    }
    let mut total = 0.0;
    let mut pairs = 0u32;
    for i in 0..vectors.len() {
        for j in (i + 1)..vectors.len() {
            total += cosine_similarity(&vectors[i], &vectors[j]);
            pairs += 1;
        }
    }
    total / pairs as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    struct ScriptedModel {
        responses: Vec<&'static str>,
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl LanguageModel for ScriptedModel {
        async fn complete(&self, _request: &LlmRequest) -> Result<String> {
            if self.fail {
                return Err(anyhow!("model offline"));
            }
            let i = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.responses[i % self.responses.len()].to_string())
        }
        async fn stream(&self, _request: &LlmRequest) -> Result<mpsc::Receiver<Result<String>>> {
            Err(anyhow!("not used"))
        }
        fn model_name(&self) -> &str {
            "scripted"
        }
    }

    /// Maps each distinct text onto its own axis: identical texts agree
    /// perfectly, distinct texts are orthogonal.
    #[derive(Default)]
    struct AxisEmbedder {
        axes: std::sync::Mutex<std::collections::HashMap<String, usize>>,
    }

    #[async_trait]
    impl Embedder for AxisEmbedder {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            let mut axes = self.axes.lock().unwrap();
            Ok(texts
                .iter()
                .map(|t| {
                    let next = axes.len() % 8;
                    let axis = *axes.entry(t.clone()).or_insert(next);
                    let mut v = vec![0.0f32; 8];
                    v[axis] = 1.0;
                    v
                })
                .collect())
        }
        fn model_name(&self) -> &str {
            "axis"
        }
        fn dims(&self) -> usize {
            8
        }
    }

    fn estimator(model: ScriptedModel) -> UncertaintyEstimator {
        UncertaintyEstimator::new(
            Arc::new(model),
            Arc::new(AxisEmbedder::default()),
            UncertaintyConfig::default(),
        )
    }

    #[tokio::test]
    async fn identical_answers_are_certain() {
        let est = estimator(ScriptedModel {
            responses: vec!["He is a backend developer."],
            calls: AtomicUsize::new(0),
            fail: false,
        });
        let result = est.measure("직업", "context").await;
        assert!(result.uncertainty < 0.05);
        assert!(!result.is_uncertain);
        assert!(!result.should_escalate);
        assert_eq!(result.responses.len(), 3);
    }

    #[tokio::test]
    async fn disagreeing_answers_are_uncertain() {
        let est = estimator(ScriptedModel {
            responses: vec![
                "He studied electrical engineering",
                "He was born in Busan maybe?",
                "His favorite food is noodles!!",
            ],
            calls: AtomicUsize::new(0),
            fail: false,
        });
        let result = est.measure("나이", "context").await;
        assert!(result.uncertainty > 0.65);
        assert!(result.is_uncertain);
        assert!(result.should_escalate);
    }

    #[tokio::test]
    async fn provider_failure_fails_toward_asking() {
        let est = estimator(ScriptedModel {
            responses: vec![],
            calls: AtomicUsize::new(0),
            fail: true,
        });
        let result = est.measure("경력", "context").await;
        assert_eq!(result.uncertainty, 1.0);
        assert!(result.is_uncertain);
        assert!(!result.should_escalate);
    }
}
