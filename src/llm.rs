//! Language model service port and OpenAI-compatible implementation.
//!
//! The [`LanguageModel`] trait exposes two shapes of generation:
//! whole-response ([`complete`](LanguageModel::complete)) used by the
//! uncertainty estimator and suggested-question generation, and
//! token-streamed ([`stream`](LanguageModel::stream)) used by the chat
//! orchestrator. Streaming parses the provider's SSE `chat/completions`
//! frames into an `mpsc` channel of content deltas.
//!
//! Retries follow the same policy as [`crate::embedding`]: 429/5xx/network
//! errors back off exponentially, other 4xx fail immediately. Streamed
//! requests are never retried mid-stream; a failure after the first delta
//! surfaces as an error item on the channel.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::config::{Config, LlmConfig};
use crate::models::{ChatMessage, Role};

/// A single generation request.
#[derive(Debug, Clone, Default)]
pub struct LlmRequest {
    pub system: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
}

impl LlmRequest {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            messages: vec![ChatMessage::user(text)],
            ..Default::default()
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }
}

/// Messages → text port, whole or streamed.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete(&self, request: &LlmRequest) -> Result<String>;

    /// Start a streamed generation. Content deltas arrive on the returned
    /// channel; the stream ends when the channel closes, and a mid-stream
    /// provider failure arrives as a final `Err` item.
    async fn stream(&self, request: &LlmRequest) -> Result<mpsc::Receiver<Result<String>>>;

    fn model_name(&self) -> &str;
}

/// Language model speaking the OpenAI `POST /chat/completions` protocol.
pub struct RestLanguageModel {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    default_temperature: f64,
    default_max_tokens: u32,
    max_retries: u32,
}

impl RestLanguageModel {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let api_key = Config::env_key(&config.api_key_env)
            .ok_or_else(|| anyhow!("{} environment variable not set", config.api_key_env))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to build LLM HTTP client")?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            model: config.model.clone(),
            default_temperature: config.temperature,
            default_max_tokens: config.max_tokens,
            max_retries: config.max_retries,
        })
    }

    fn request_body(&self, request: &LlmRequest, stream: bool) -> serde_json::Value {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if let Some(system) = &request.system {
            messages.push(serde_json::json!({"role": "system", "content": system}));
        }
        for m in &request.messages {
            let role = match m.role {
                Role::User => "user",
                Role::Assistant => "assistant",
            };
            messages.push(serde_json::json!({"role": role, "content": m.content}));
        }
        serde_json::json!({
            "model": self.model,
            "messages": messages,
            "temperature": request.temperature.unwrap_or(self.default_temperature),
            "max_tokens": request.max_tokens.unwrap_or(self.default_max_tokens),
            "stream": stream,
        })
    }

    async fn send(&self, body: &serde_json::Value) -> Result<reqwest::Response> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .post(&url)
                .bearer_auth(&self.api_key)
                .json(body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response);
                    }
                    if status.as_u16() == 429 || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        last_err = Some(anyhow!("LLM API error {}: {}", status, body_text));
                        continue;
                    }
                    let body_text = response.text().await.unwrap_or_default();
                    bail!("LLM API error {}: {}", status, body_text);
                }
                Err(e) => {
                    last_err = Some(e.into());
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow!("LLM request failed after retries")))
    }
}

#[async_trait]
impl LanguageModel for RestLanguageModel {
    async fn complete(&self, request: &LlmRequest) -> Result<String> {
        let body = self.request_body(request, false);
        let response = self.send(&body).await?;
        let json: serde_json::Value = response.json().await?;
        json.get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| anyhow!("Invalid LLM response: missing choices[0].message.content"))
    }

    async fn stream(&self, request: &LlmRequest) -> Result<mpsc::Receiver<Result<String>>> {
        let body = self.request_body(request, true);
        let response = self.send(&body).await?;
        let (tx, rx) = mpsc::channel(32);

        tokio::spawn(async move {
            let mut bytes = response.bytes_stream();
            let mut buffer = String::new();

            while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        let _ = tx.send(Err(anyhow!("LLM stream error: {}", e))).await;
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&chunk));

                // SSE frames are newline-delimited; keep the trailing
                // partial line in the buffer.
                while let Some(pos) = buffer.find('\n') {
                    let line = buffer[..pos].trim().to_string();
                    buffer.drain(..=pos);

                    let Some(data) = line.strip_prefix("data: ") else {
                        continue;
                    };
                    if data == "[DONE]" {
                        return;
                    }
                    if let Some(delta) = parse_stream_delta(data) {
                        if tx.send(Ok(delta)).await.is_err() {
                            // Receiver dropped: client went away, stop reading.
                            return;
                        }
                    }
                }
            }
        });

        Ok(rx)
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

/// Extract `choices[0].delta.content` from one streamed frame.
/// Frames without content (role prelude, finish marker) yield `None`.
fn parse_stream_delta(data: &str) -> Option<String> {
    let json: serde_json::Value = serde_json::from_str(data).ok()?;
    json.get("choices")?
        .get(0)?
        .get("delta")?
        .get("content")?
        .as_str()
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_delta_extracts_content() {
        let data = r#"{"choices":[{"delta":{"content":"hello"}}]}"#;
        assert_eq!(parse_stream_delta(data), Some("hello".to_string()));
    }

    #[test]
    fn parse_delta_skips_role_prelude_and_finish() {
        assert_eq!(
            parse_stream_delta(r#"{"choices":[{"delta":{"role":"assistant"}}]}"#),
            None
        );
        assert_eq!(
            parse_stream_delta(r#"{"choices":[{"delta":{},"finish_reason":"stop"}]}"#),
            None
        );
        assert_eq!(parse_stream_delta("not json"), None);
    }
}
