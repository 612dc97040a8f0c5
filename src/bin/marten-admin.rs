use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use marten::config::Config;
use marten::journal::{self, JournalEntry};
use marten::{RedirectStore, Resolution};
use std::collections::HashMap;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "marten-admin")]
#[command(about = "Marten redirect store maintenance CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show where a short code points
    Resolve {
        code: String,
    },
    /// List the active redirects of an owner
    List {
        owner_id: String,
    },
    /// Delete redirects on behalf of their owner
    Delete {
        owner_id: String,
        #[arg(required = true)]
        codes: Vec<String>,
    },
    /// Check that the configured backend answers
    Ping,
    /// Summarize a journal file without starting the service
    InspectJournal {
        /// Defaults to FILE_STORAGE_PATH
        path: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;

    let command = match cli.command {
        Commands::InspectJournal { path } => {
            let path = path
                .or_else(|| config.database.journal_path.clone())
                .context("no journal path given and FILE_STORAGE_PATH is empty")?;
            return inspect_journal(path).await;
        }
        command => command,
    };

    let store = RedirectStore::open(&config).await?;

    match command {
        Commands::Resolve { code } => match store.resolve_redirect(&code).await? {
            Resolution::Active { original_url } => {
                println!("✓ {} -> {} (active)", code, original_url)
            }
            Resolution::Tombstoned { original_url } => {
                println!("⚠ {} -> {} (deleted)", code, original_url)
            }
            Resolution::NotFound => println!("✗ No redirect with code '{}'", code),
        },
        Commands::List { owner_id } => {
            let records = store.list_by_owner(&owner_id).await?;
            if records.is_empty() {
                println!("No active redirects for '{}'.", owner_id);
            } else {
                println!("{:<16} {:<25} {}", "Code", "Created", "Original URL");
                println!("{}", "-".repeat(80));
                for record in records {
                    println!(
                        "{:<16} {:<25} {}",
                        record.code,
                        record.created_at.format("%Y-%m-%d %H:%M:%S"),
                        record.original_url
                    );
                }
            }
        }
        Commands::Delete { owner_id, codes } => {
            let affected = store.delete_batch(&codes, &owner_id).await?;
            println!(
                "✓ Deleted {} of {} redirect(s) for '{}'",
                affected,
                codes.len(),
                owner_id
            );
        }
        Commands::Ping => {
            if store.health_check().await {
                println!("✓ Backend {:?} is healthy", config.database.backend);
            } else {
                store.shutdown().await?;
                anyhow::bail!("backend {:?} did not answer", config.database.backend);
            }
        }
        Commands::InspectJournal { .. } => {}
    }

    store.shutdown().await?;
    Ok(())
}

async fn inspect_journal(path: PathBuf) -> Result<()> {
    let replay = journal::replay(&path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;

    let mut states: HashMap<String, bool> = HashMap::new();
    let mut creates = 0usize;
    let mut tombstones = 0usize;
    for entry in &replay.entries {
        match entry {
            JournalEntry::Create(record) => {
                creates += 1;
                states.entry(record.code.clone()).or_insert(true);
            }
            JournalEntry::Tombstone { code, .. } => {
                tombstones += 1;
                if let Some(active) = states.get_mut(code) {
                    *active = false;
                }
            }
        }
    }
    let active = states.values().filter(|active| **active).count();

    println!("Journal: {}", path.display());
    println!("  create entries:    {}", creates);
    println!("  tombstone entries: {}", tombstones);
    println!("  corrupt lines:     {}", replay.corrupt_lines);
    println!("  codes:             {} ({} active)", states.len(), active);
    Ok(())
}
