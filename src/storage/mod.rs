pub mod memory;
pub mod postgres;
mod sql;
pub mod sqlite;
pub mod trait_def;

pub use memory::InMemoryStorage;
pub use postgres::PostgresStorage;
pub use sql::PoolSettings;
pub use sqlite::SqliteStorage;
pub use trait_def::{Storage, StorageError, StorageResult};

use crate::config::{DatabaseBackend, DatabaseConfig};
use std::sync::Arc;
use tracing::{debug, info};

/// Open and initialize the one backend selected by `config`.
pub async fn connect(config: &DatabaseConfig) -> StorageResult<Arc<dyn Storage>> {
    let url = config.url.as_deref().unwrap_or_default();

    let storage: Arc<dyn Storage> = match config.backend {
        DatabaseBackend::Memory => match config.journal_path.as_ref() {
            Some(path) => {
                info!(path = %path.display(), "Using in-memory storage with journal");
                Arc::new(InMemoryStorage::with_journal(path).await?)
            }
            None => {
                info!("Using in-memory storage without journal");
                Arc::new(InMemoryStorage::new())
            }
        },
        DatabaseBackend::Sqlite => {
            info!("Using SQLite storage: {}", url);
            Arc::new(SqliteStorage::new(url, &config.pool_settings()).await?)
        }
        DatabaseBackend::Postgres => {
            info!("Using PostgreSQL storage");
            Arc::new(PostgresStorage::new(url, &config.pool_settings()).await?)
        }
    };

    if config.backend != DatabaseBackend::Memory {
        if let Some(path) = config.journal_path.as_ref() {
            debug!(
                path = %path.display(),
                "journal is only used by the memory backend, ignoring it"
            );
        }
    }

    storage.init().await?;
    Ok(storage)
}
