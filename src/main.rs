//! # convo-rag CLI (`crag`)
//!
//! Drives a [`RagService`] from the shell: ingest files into a scope,
//! search one or more scopes, and inspect or prune what is stored.
//!
//! ## Usage
//!
//! ```bash
//! crag --config ./config/rag.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `crag init` | Create the vector store database |
//! | `crag ingest <path>` | Chunk, embed and persist one file |
//! | `crag search "<query>"` | Search one or more scopes |
//! | `crag count --scope <s>` | Count rows in a scope |
//! | `crag forget --scope <s> --file-id <id>` | Delete a file's chunks |
//!
//! Logs go to stderr and honour `RUST_LOG`; results go to stdout.

use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

use convo_rag::config;
use convo_rag::events::RagEvent;
use convo_rag::pipeline::persist_stage::PERSIST_STAGE;
use convo_rag::progress::ProgressMode;
use convo_rag::service::RagService;
use convo_rag_core::models::{
    LocalFileMeta, RowFilter, ScopedConfig, SearchParam, SearchState, TaskState, DEFAULT_SCOPE,
};

/// convo-rag CLI: file ingestion into scoped vector tables and similarity
/// search over them.
#[derive(Parser)]
#[command(
    name = "crag",
    about = "Ingest local files into scoped vector tables and search them",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/rag.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the vector store database. Safe to run repeatedly.
    Init,

    /// Chunk, embed and persist one file.
    ///
    /// Re-ingesting a file id replaces its previous chunks.
    Ingest {
        /// File to ingest.
        path: PathBuf,

        /// File id; defaults to the path as given.
        #[arg(long)]
        id: Option<String>,

        /// Scope (table) to write into.
        #[arg(long)]
        scope: Option<String>,

        /// Progress output: off, human or json. Defaults to human on a TTY.
        #[arg(long, value_enum)]
        progress: Option<ProgressMode>,
    },

    /// Search one or more scopes with the configured embedding model.
    Search {
        /// The search query.
        query: String,

        /// Scopes to search. Repeatable.
        #[arg(long = "scope", default_value = DEFAULT_SCOPE)]
        scopes: Vec<String>,

        /// Session id for the search.
        #[arg(long, default_value = "cli")]
        session: String,
    },

    /// Count rows in a scope.
    Count {
        #[arg(long, default_value = DEFAULT_SCOPE)]
        scope: String,

        /// Only count rows of this file.
        #[arg(long)]
        file_id: Option<String>,
    },

    /// Delete every chunk of one file from a scope.
    Forget {
        #[arg(long, default_value = DEFAULT_SCOPE)]
        scope: String,

        #[arg(long)]
        file_id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    let service = RagService::from_config(&cfg)?;

    let outcome = run(&service, &cfg, cli.command).await;
    service.close().await?;
    outcome
}

async fn run(service: &RagService, cfg: &config::Config, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Init => {
            service.store().open().await?;
            println!("Vector store initialized at {}", cfg.store.path.display());
        }
        Commands::Ingest {
            path,
            id,
            scope,
            progress,
        } => {
            let id = id.unwrap_or_else(|| path.display().to_string());
            let mut meta = LocalFileMeta::new(id, path);
            if let Some(scope) = scope {
                meta = meta.with_scope(scope);
            }

            let reporter = progress.unwrap_or_else(ProgressMode::default_for_tty).reporter();
            let mut events = service.subscribe();
            let printer = tokio::spawn(async move {
                loop {
                    match events.recv().await {
                        Ok(event) => {
                            reporter.report(&event);
                            if matches!(&event, RagEvent::Ingest(e) if e.finished) {
                                break;
                            }
                        }
                        Err(RecvError::Lagged(_)) => continue,
                        Err(RecvError::Closed) => break,
                    }
                }
            });

            let info = service
                .ingest(meta, cfg.embedding.clone())
                .await
                .context("ingest task panicked")?;
            let _ = printer.await;

            match info.last_status() {
                Some(status) if status.state == TaskState::Success && status.stage_id == PERSIST_STAGE => {
                    println!(
                        "{}: {}",
                        info.file_id(),
                        status.message.as_deref().unwrap_or("done")
                    );
                }
                Some(status) => bail!(
                    "{} failed at {} ({}): {}",
                    info.file_id(),
                    status.stage_id,
                    status.code.unwrap_or(0),
                    status.message.as_deref().unwrap_or("")
                ),
                None => bail!("{} produced no status", info.file_id()),
            }
        }
        Commands::Search {
            query,
            scopes,
            session,
        } => {
            let param = SearchParam {
                session_id: session.clone(),
                content: query,
                configs: scopes
                    .into_iter()
                    .map(|scope| ScopedConfig {
                        scope,
                        config: cfg.embedding.clone(),
                    })
                    .collect(),
            };
            service.search(param)?;
            let task = service.get_result(&session).await?;
            if task.state != SearchState::Success {
                bail!(
                    "search {:?} ({}): {}",
                    task.state,
                    task.code.unwrap_or(0),
                    task.message.unwrap_or_default()
                );
            }

            if task.result.is_empty() {
                println!("No results.");
            }
            for (i, hit) in task.result.iter().enumerate() {
                let score = hit.relevance.or(hit.distance).unwrap_or(0.0);
                println!(
                    "{}. [{:.3}] {} #{} ({})",
                    i + 1,
                    score,
                    hit.file_name,
                    hit.chunk_index,
                    hit.scope.as_deref().unwrap_or(DEFAULT_SCOPE)
                );
                println!("    {}", snippet(&hit.content, 160));
            }
        }
        Commands::Count { scope, file_id } => {
            let store = service.store();
            store.open().await?;
            let filter = file_id.map(RowFilter::FileId);
            let rows = store.count_rows(&scope, filter.as_ref()).await?;
            println!("{}", rows);
        }
        Commands::Forget { scope, file_id } => {
            let store = service.store();
            store.open().await?;
            let deleted = store
                .delete_rows(&scope, &RowFilter::FileId(file_id.clone()))
                .await?;
            println!("Deleted {} rows of {} from {}", deleted, file_id, scope);
        }
    }
    Ok(())
}

fn snippet(text: &str, max_chars: usize) -> String {
    let flat: String = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max_chars {
        return flat;
    }
    let cut: String = flat.chars().take(max_chars).collect();
    format!("{}…", cut)
}
