use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub persona: PersonaConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub vector: VectorConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub uncertainty: UncertaintyConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

/// The single persona this engine answers questions about.
#[derive(Debug, Deserialize, Clone)]
pub struct PersonaConfig {
    /// Latin-script name (e.g. "Taejun Kim").
    pub name: String,
    /// Native-script name (e.g. "김태준"); used by the Korean rewrite rules.
    pub name_native: String,
    /// Possessive form used when substituting "his" (e.g. "Taejun Kim's").
    #[serde(default)]
    pub name_possessive: Option<String>,
    /// Short-query keyword → expansion terms, merged over the built-in table.
    #[serde(default)]
    pub expansions: HashMap<String, String>,
}

impl PersonaConfig {
    pub fn possessive(&self) -> String {
        self.name_possessive
            .clone()
            .unwrap_or_else(|| format!("{}'s", self.name))
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_base_url")]
    pub base_url: String,
    #[serde(default = "default_embedding_model")]
    pub model: String,
    /// Environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_dims")]
    pub dims: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            base_url: default_embedding_base_url(),
            model: default_embedding_model(),
            api_key_env: default_api_key_env(),
            dims: default_dims(),
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_embedding_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}
fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}
fn default_dims() -> usize {
    1536
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_embedding_base_url")]
    pub base_url: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_embedding_base_url(),
            model: default_llm_model(),
            api_key_env: default_api_key_env(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            max_retries: default_max_retries(),
            timeout_secs: default_llm_timeout_secs(),
        }
    }
}

fn default_llm_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_max_tokens() -> u32 {
    1024
}
fn default_temperature() -> f64 {
    0.7
}
fn default_llm_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct VectorConfig {
    /// Base URL of the vector store REST API. Empty ⇒ in-memory store.
    #[serde(default)]
    pub base_url: String,
    #[serde(default = "default_vector_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_vector_key_env() -> String {
    "VECTOR_STORE_API_KEY".to_string()
}
fn default_namespace() -> String {
    "persona".to_string()
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct StateConfig {
    /// Upstash-compatible REST URL. Empty ⇒ in-memory fallback only.
    #[serde(default)]
    pub rest_url: String,
    #[serde(default = "default_state_token_env")]
    pub rest_token_env: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_state_token_env() -> String {
    "STATE_STORE_TOKEN".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Dense candidates fetched per query, as a multiple of `top_k`.
    #[serde(default = "default_overfetch")]
    pub overfetch_factor: usize,
    #[serde(default = "default_fusion_k")]
    pub fusion_k: f64,
    #[serde(default = "default_weight")]
    pub dense_weight: f64,
    #[serde(default = "default_weight")]
    pub sparse_weight: f64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            overfetch_factor: default_overfetch(),
            fusion_k: default_fusion_k(),
            dense_weight: default_weight(),
            sparse_weight: default_weight(),
        }
    }
}

fn default_top_k() -> usize {
    5
}
fn default_overfetch() -> usize {
    4
}
fn default_fusion_k() -> f64 {
    60.0
}
fn default_weight() -> f64 {
    1.0
}

#[derive(Debug, Deserialize, Clone)]
pub struct LimitsConfig {
    /// User turns before every response suggests contacting the persona.
    #[serde(default = "default_suggest_threshold")]
    pub suggest_contact_after: u32,
    /// User turns before the client identity is blocked.
    #[serde(default = "default_block_threshold")]
    pub block_after: u32,
    #[serde(default = "default_block_secs")]
    pub block_secs: u64,
    /// Sliding-window request rate limit, per client identity.
    #[serde(default = "default_rate_window_secs")]
    pub rate_window_secs: u64,
    #[serde(default = "default_rate_max")]
    pub rate_max_requests: u32,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            suggest_contact_after: default_suggest_threshold(),
            block_after: default_block_threshold(),
            block_secs: default_block_secs(),
            rate_window_secs: default_rate_window_secs(),
            rate_max_requests: default_rate_max(),
        }
    }
}

fn default_suggest_threshold() -> u32 {
    5
}
fn default_block_threshold() -> u32 {
    30
}
fn default_block_secs() -> u64 {
    300
}
fn default_rate_window_secs() -> u64 {
    60
}
fn default_rate_max() -> u32 {
    20
}

#[derive(Debug, Deserialize, Clone)]
pub struct UncertaintyConfig {
    #[serde(default = "default_samples")]
    pub samples: usize,
    #[serde(default = "default_uncertain_threshold")]
    pub uncertain_threshold: f64,
    #[serde(default = "default_escalate_threshold")]
    pub escalate_threshold: f64,
    #[serde(default = "default_sample_temperature")]
    pub sample_temperature: f64,
}

impl Default for UncertaintyConfig {
    fn default() -> Self {
        Self {
            samples: default_samples(),
            uncertain_threshold: default_uncertain_threshold(),
            escalate_threshold: default_escalate_threshold(),
            sample_temperature: default_sample_temperature(),
        }
    }
}

fn default_samples() -> usize {
    3
}
fn default_uncertain_threshold() -> f64 {
    0.35
}
fn default_escalate_threshold() -> f64 {
    0.65
}
fn default_sample_temperature() -> f64 {
    1.0
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7410".to_string()
}

impl Config {
    /// Load and parse a TOML configuration file.
    pub fn load(path: &Path) -> Result<Config> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Config = toml::from_str(&raw)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// Resolve an API key from the environment variable named in config.
    /// Returns `None` when unset or empty, letting callers degrade.
    pub fn env_key(var: &str) -> Option<String> {
        std::env::var(var).ok().filter(|v| !v.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn minimal_config_fills_defaults() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(
            f,
            r#"
[persona]
name = "Taejun Kim"
name_native = "김태준"
"#
        )
        .unwrap();

        let config = Config::load(f.path()).unwrap();
        assert_eq!(config.persona.name, "Taejun Kim");
        assert_eq!(config.retrieval.top_k, 5);
        assert_eq!(config.limits.suggest_contact_after, 5);
        assert_eq!(config.limits.block_after, 30);
        assert_eq!(config.uncertainty.uncertain_threshold, 0.35);
        assert!(config.state.rest_url.is_empty());
    }

    #[test]
    fn possessive_defaults_to_apostrophe_s() {
        let persona = PersonaConfig {
            name: "Taejun Kim".into(),
            name_native: "김태준".into(),
            name_possessive: None,
            expansions: HashMap::new(),
        };
        assert_eq!(persona.possessive(), "Taejun Kim's");
    }
}
