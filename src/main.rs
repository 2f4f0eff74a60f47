//! # Persona Engine CLI (`pengine`)
//!
//! The `pengine` binary runs the conversational retrieval engine for a
//! single persona: ingest a markdown corpus, query it from the command
//! line, and serve the streaming chat API.
//!
//! ## Usage
//!
//! ```bash
//! pengine --config ./config/pengine.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `pengine sync <dir>` | Ingest a directory of markdown notes into the index |
//! | `pengine delete <path>` | Remove every chunk of one note from the index |
//! | `pengine list` | List indexed documents, optionally filtered by tag |
//! | `pengine search "<query>"` | Run one hybrid retrieval against the index |
//! | `pengine sessions` | List active conversation sessions |
//! | `pengine serve` | Start the streaming chat HTTP server |
//!
//! ## Examples
//!
//! ```bash
//! # Ingest the persona's notes
//! pengine sync ./notes --config ./config/pengine.toml
//!
//! # Ask the index a question without starting the server
//! pengine search "경력이 어떻게 되나요?" --config ./config/pengine.toml
//!
//! # Serve the chat API
//! pengine serve --config ./config/pengine.toml
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use persona_engine::config::Config;
use persona_engine::services::Services;
use persona_engine::{corpus, server};

/// Persona Engine — a conversational retrieval engine for a single persona.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/pengine.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "pengine",
    about = "Persona Engine — conversational retrieval for a single persona",
    version,
    long_about = "Persona Engine ingests a markdown corpus about one person, indexes it for \
    hybrid (sparse + dense) retrieval, and serves a streaming chat API with query rewriting, \
    uncertainty-aware clarification, conversation limits, and human-in-the-loop capture."
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/pengine.toml`. Persona, provider, retrieval,
    /// and server settings are read from this file.
    #[arg(long, global = true, default_value = "./config/pengine.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Ingest a directory of markdown notes.
    ///
    /// Chunks every `.md` file under the directory, embeds the chunks, and
    /// upserts them into the vector store. Re-running on an unchanged
    /// directory is idempotent.
    Sync {
        /// Directory containing the persona's markdown notes.
        dir: PathBuf,
    },

    /// Remove every indexed chunk of one note.
    Delete {
        /// Note path as stored at sync time, e.g. `work/career.md`.
        path: String,
    },

    /// List indexed documents.
    List {
        /// Only show documents in this category.
        #[arg(long)]
        category: Option<String>,

        /// Only show chunks of this note path.
        #[arg(long)]
        source: Option<String>,
    },

    /// Run one hybrid retrieval against the index and print the results.
    Search {
        /// The search query string.
        query: String,

        /// Maximum number of results to return.
        #[arg(long)]
        top_k: Option<usize>,
    },

    /// List active conversation sessions.
    Sessions,

    /// Start the streaming chat HTTP server.
    ///
    /// Binds to the address configured in `[server].bind` and serves the
    /// chat SSE endpoint plus the contact/feedback/correction/health API.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;
    let services = Services::from_config(config)?;

    match cli.command {
        Commands::Sync { dir } => {
            let report = corpus::sync_dir(&services, &dir).await?;
            println!(
                "Synced {} notes into {} chunks.",
                report.notes, report.chunks
            );
        }
        Commands::Delete { path } => {
            let removed = corpus::delete_path(&services, &path).await?;
            println!("Removed {} chunks for {}.", removed, path);
        }
        Commands::List { category, source } => {
            let mut filter = persona_engine::vector_store::MetadataFilter::new();
            if let Some(category) = category {
                filter.insert("category".to_string(), category);
            }
            if let Some(source) = source {
                filter.insert("source".to_string(), source);
            }
            let filter = (!filter.is_empty()).then_some(filter);
            let documents = corpus::list_documents(&services, filter.as_ref()).await?;
            if documents.is_empty() {
                println!("No documents.");
            } else {
                for doc in documents {
                    let title = doc.metadata.title.as_deref().unwrap_or(&doc.id);
                    let source = doc.metadata.source.as_deref().unwrap_or("-");
                    println!("{}  {}  ({})", doc.id, title, source);
                }
            }
        }
        Commands::Search { query, top_k } => {
            run_search(&services, &query, top_k).await?;
        }
        Commands::Sessions => {
            let keys = services.conversations.list_session_keys().await;
            if keys.is_empty() {
                println!("No active sessions.");
            } else {
                for key in keys {
                    println!("{}", key);
                }
            }
        }
        Commands::Serve => {
            warm_index(&services).await?;
            server::serve(services).await?;
        }
    }

    Ok(())
}

/// Rebuild the in-process sparse index and corpus snapshot from whatever
/// the vector store already holds.
async fn warm_index(services: &Arc<Services>) -> Result<()> {
    let documents = corpus::list_documents(services, None).await?;
    if !documents.is_empty() {
        services.retriever.set_corpus(documents);
    }
    Ok(())
}

async fn run_search(services: &Arc<Services>, query: &str, top_k: Option<usize>) -> Result<()> {
    warm_index(services).await?;
    let top_k = top_k.unwrap_or(services.config.retrieval.top_k);
    let rewrite = services.rewriter.rewrite(query, &[]);
    if rewrite.rewritten != rewrite.original {
        println!("Query rewritten: {}", rewrite.rewritten);
    }
    let outcome = services.retriever.search(&rewrite.rewritten, top_k).await;
    if outcome.result_count == 0 {
        println!("No results.");
        return Ok(());
    }
    for (rank, doc) in outcome.documents.iter().enumerate() {
        let title = doc.metadata.title.as_deref().unwrap_or(&doc.id);
        println!("{}. {}", rank + 1, title);
        if let Some(category) = &doc.metadata.category {
            println!("   category: {}", category);
        }
        let snippet: String = doc.content.chars().take(200).collect();
        println!("   {}", snippet.replace('\n', " "));
    }
    Ok(())
}
