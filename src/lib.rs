//! # Persona Engine
//!
//! A conversational retrieval engine for a single persona.
//!
//! Persona Engine ingests a markdown corpus about one person, indexes it
//! for hybrid (sparse + dense) retrieval, and serves a streaming chat API
//! with rule-based query rewriting, uncertainty-aware clarification,
//! conversation limits, and human-in-the-loop capture.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌─────────────┐   ┌─────────────────┐
//! │ Markdown │──▶│  Pipeline    │──▶│  Vector store    │
//! │  notes   │   │ Chunk+Embed │   │  + sparse index  │
//! └──────────┘   └─────────────┘   └───────┬─────────┘
//!                                          │
//!            guardrails → rewrite → retrieve → SEU → generate
//!                                          │
//!                      ┌───────────────────┤
//!                      ▼                   ▼
//!                 ┌──────────┐       ┌──────────┐
//!                 │   CLI    │       │ HTTP/SSE │
//!                 │(pengine) │       │  (chat)  │
//!                 └──────────┘       └──────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`corpus`] | Markdown ingestion and chunking |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`llm`] | Language model provider abstraction |
//! | [`sparse`] | Bilingual tokenizer and BM25 index |
//! | [`retrieval`] | Hybrid retrieval with rank fusion |
//! | [`rewrite`] | Query rewriting and ambiguity detection |
//! | [`uncertainty`] | Sampled-answer uncertainty estimation |
//! | [`guardrails`] | Input validation and output redaction |
//! | [`conversation`] | Session state and conversation limits |
//! | [`hitl`] | Contact, feedback, and correction capture |
//! | [`stream`] | Streaming event protocol |
//! | [`orchestrator`] | One streaming chat turn, end to end |
//! | [`server`] | HTTP/SSE server |
//! | [`state`] | Key-value state store with circuit breaker |

pub mod config;
pub mod conversation;
pub mod corpus;
pub mod embedding;
pub mod guardrails;
pub mod hitl;
pub mod llm;
pub mod models;
pub mod orchestrator;
pub mod retrieval;
pub mod rewrite;
pub mod server;
pub mod services;
pub mod sparse;
pub mod state;
pub mod stream;
pub mod uncertainty;
pub mod vector_store;
