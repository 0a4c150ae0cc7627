use anyhow::Result;
use clap::{Parser, Subcommand};
use ragkeep::config::load_config;
use ragkeep::embedder::Embedder;
use ragkeep::handlers::Handlers;
use ragkeep::server::run_stdio_server;
use ragkeep::store::VectorStore;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Parser)]
#[command(name = "ragkeep")]
#[command(version)]
#[command(about = "Single-user local hybrid RAG backend (Pure Rust MCP stdio server)")]
struct Cli {
    /// Override the root directory file ingests must stay within.
    #[arg(long, value_name = "PATH")]
    root: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the MCP stdio server.
    Mcp,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let mut config = load_config();
    if let Some(root) = cli.root {
        config.root_dir = root;
    }

    match cli.cmd {
        Command::Mcp => {
            let embedder = Embedder::new(
                config.model_id.clone(),
                config.model_cache_dir.clone(),
                config.embedding_dim,
                config.embed_batch_size,
            );
            let store = VectorStore::open(
                &config.db_dir,
                config.embedding_dim,
                config.hybrid_weight,
                config.max_distance,
                config.grouping_mode,
            )
            .await?;
            let handlers = Arc::new(Handlers::new(config, embedder, store));
            run_stdio_server(handlers).await
        }
    }
}
