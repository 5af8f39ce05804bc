//! Command line front-end for encrypted mailbox search
//!
//! Indexes a JSON mailbox export and searches it.
//!
//! # Usage
//!
//! ```bash
//! # Build (or refresh) the index of alice's mailbox
//! mail-search --user alice --mailbox alice.json build
//!
//! # Search it
//! mail-search --user alice --mailbox alice.json search "quarterly invoice"
//!
//! # Shrink the index to 10 MB, dropping the oldest messages
//! mail-search --user alice --mailbox alice.json resize 10000000
//! ```

use anyhow::Context;
use clap::{Parser, Subcommand};
use mail_search::config::SearchConfig;
use mail_search::crypto::FileKeyStorage;
use mail_search::engine::{Collaborators, EncryptedSearch};
use mail_search::remote::{MemoryTransport, PlaintextDecrypter};
use mail_search::search::SearchState;
use mail_search::state::IndexingState;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "mail-search")]
#[command(about = "Client-side encrypted mailbox search", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = "search.toml")]
    config: PathBuf,

    /// User whose index is used
    #[arg(short, long)]
    user: String,

    /// JSON export of the mailbox
    #[arg(short, long, default_value = "mailbox.json")]
    mailbox: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build or refresh the index
    Build,
    /// Search the index
    Search {
        query: String,
        /// Maximum number of result pages
        #[arg(long, default_value_t = 1)]
        pages: usize,
    },
    /// Show the index status
    Status,
    /// Evict the oldest messages until the index fits in `bytes`
    Resize { bytes: i64 },
    /// Delete the index
    Delete,
}

fn init_logging(config: &SearchConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    if config.logging.format == "json" {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(filter)
            .json()
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(filter)
            .pretty()
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = if cli.config.exists() {
        SearchConfig::from_file(&cli.config)
            .with_context(|| format!("loading {}", cli.config.display()))?
    } else {
        SearchConfig::default()
    };
    init_logging(&config)?;
    info!("Index directory: {}", config.index.directory.display());

    let transport = Arc::new(
        MemoryTransport::from_json_file(&cli.mailbox)
            .with_context(|| format!("loading mailbox {}", cli.mailbox.display()))?,
    );
    let keys = Arc::new(FileKeyStorage::new(config.index.directory.join("keys")));
    let search = EncryptedSearch::new(
        config,
        Collaborators::new(transport, Arc::new(PlaintextDecrypter), keys),
    )?;

    let status = search.open_user(&cli.user).await?;

    match cli.command {
        Commands::Build => {
            if status.state == IndexingState::Disabled {
                search.enable().await?;
            } else {
                search.build().await?;
            }

            let mut updates = search.subscribe();
            let progress = tokio::spawn(async move {
                while updates.changed().await.is_ok() {
                    let status = updates.borrow_and_update().clone();
                    if status.progress.is_some() {
                        println!("{}", status);
                    }
                }
            });

            let status = search.wait_for_build().await;
            progress.abort();
            println!("{}", status);
            if let Some(error) = status.last_error {
                eprintln!("Last error: {}", error);
            }
        }
        Commands::Search { query, pages } => {
            let mut state = SearchState::new(cli.user.clone(), &query);
            for _ in 0..pages.max(1) {
                let page = search.search(&mut state, None).await?;
                for hit in &page.hits {
                    println!(
                        "{}  {}  {} <{}>",
                        hit.message_id, hit.subject, hit.sender.name, hit.sender.address
                    );
                    if !hit.preview.is_empty() {
                        println!("    {}", hit.preview);
                    }
                }
                if page.exhausted {
                    break;
                }
            }
        }
        Commands::Status => {
            let status = search.status().await;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Resize { bytes } => {
            let removed = search.resize_index(bytes).await?;
            println!("Removed {} messages", removed);
        }
        Commands::Delete => {
            search.delete_index().await?;
            println!("Deleted search index of {}", cli.user);
        }
    }

    search.close().await;
    Ok(())
}
