//! Dependency-injected service registry.
//!
//! Everything the orchestrator needs is constructed once at process start
//! and passed down explicitly — no globals — so tests can assemble a
//! registry from fakes. [`Services::from_config`] wires the real
//! providers; [`Services::from_parts`] accepts arbitrary port
//! implementations.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::config::Config;
use crate::conversation::{ConversationLimiter, ConversationStore};
use crate::embedding::{Embedder, RestEmbedder};
use crate::hitl::HitlService;
use crate::llm::{LanguageModel, RestLanguageModel};
use crate::retrieval::HybridRetriever;
use crate::rewrite::QueryRewriter;
use crate::sparse::SparseIndexer;
use crate::state::{RestStateStore, StateHandle};
use crate::uncertainty::UncertaintyEstimator;
use crate::vector_store::{MemoryVectorStore, RestVectorStore, VectorStore};

/// Cooldown before the state-store circuit breaker admits a probe.
const BREAKER_COOLDOWN: Duration = Duration::from_secs(30);

pub struct Services {
    pub config: Config,
    pub embedder: Arc<dyn Embedder>,
    pub language_model: Arc<dyn LanguageModel>,
    pub vector_store: Arc<dyn VectorStore>,
    pub sparse: Arc<SparseIndexer>,
    pub retriever: Arc<HybridRetriever>,
    pub rewriter: Arc<QueryRewriter>,
    pub uncertainty: Arc<UncertaintyEstimator>,
    pub state: Arc<StateHandle>,
    pub conversations: Arc<ConversationStore>,
    pub limiter: Arc<ConversationLimiter>,
    pub hitl: Arc<HitlService>,
}

impl Services {
    /// Wire real providers from configuration.
    pub fn from_config(config: Config) -> Result<Arc<Self>> {
        let embedder: Arc<dyn Embedder> = Arc::new(
            RestEmbedder::new(&config.embedding).context("Failed to build embedding provider")?,
        );
        let language_model: Arc<dyn LanguageModel> = Arc::new(
            RestLanguageModel::new(&config.llm).context("Failed to build language model")?,
        );

        let vector_store: Arc<dyn VectorStore> = if config.vector.base_url.is_empty() {
            info!("no vector store configured, using in-memory index");
            Arc::new(MemoryVectorStore::new())
        } else {
            Arc::new(RestVectorStore::new(&config.vector)?)
        };

        let state = if config.state.rest_url.is_empty() {
            info!("no state store configured, sessions are process-local");
            Arc::new(StateHandle::memory_only())
        } else {
            let token = Config::env_key(&config.state.rest_token_env)
                .context("State store configured but its token env var is unset")?;
            let remote = RestStateStore::new(
                &config.state.rest_url,
                &token,
                Duration::from_secs(config.state.timeout_secs),
            )?;
            Arc::new(StateHandle::with_remote(Arc::new(remote), BREAKER_COOLDOWN))
        };

        Ok(Self::from_parts(config, embedder, language_model, vector_store, state))
    }

    /// Assemble a registry from explicit port implementations.
    pub fn from_parts(
        config: Config,
        embedder: Arc<dyn Embedder>,
        language_model: Arc<dyn LanguageModel>,
        vector_store: Arc<dyn VectorStore>,
        state: Arc<StateHandle>,
    ) -> Arc<Self> {
        let sparse = Arc::new(SparseIndexer::new());
        let retriever = Arc::new(HybridRetriever::new(
            embedder.clone(),
            vector_store.clone(),
            sparse.clone(),
            config.retrieval.clone(),
        ));
        let rewriter = Arc::new(QueryRewriter::new(
            &config.persona,
            Some(language_model.clone()),
        ));
        let uncertainty = Arc::new(UncertaintyEstimator::new(
            language_model.clone(),
            embedder.clone(),
            config.uncertainty.clone(),
        ));
        let conversations = Arc::new(ConversationStore::new(state.clone()));
        let limiter = Arc::new(ConversationLimiter::new(
            state.clone(),
            config.limits.clone(),
        ));
        let hitl = Arc::new(HitlService::new(state.clone(), limiter.clone()));

        Arc::new(Self {
            config,
            embedder,
            language_model,
            vector_store,
            sparse,
            retriever,
            rewriter,
            uncertainty,
            state,
            conversations,
            limiter,
            hitl,
        })
    }
}
