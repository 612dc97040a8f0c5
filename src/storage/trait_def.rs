use crate::journal::JournalError;
use crate::models::Redirect;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("an active redirect already exists for {0}")]
    UrlConflict(String),
    #[error("short code {0} already exists")]
    CodeConflict(String),
    #[error("{op} timed out after {timeout:?}")]
    Timeout { op: &'static str, timeout: Duration },
    #[error("storage backend unavailable: {0}")]
    Unavailable(String),
    #[error("stored data is invalid: {0}")]
    InvalidData(String),
    #[error(transparent)]
    Journal(#[from] JournalError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StorageError {
    /// Whether retrying the same call later could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Timeout { .. } | StorageError::Unavailable(_))
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Durable keyed storage of redirect records.
///
/// Implementations enforce at most one active record per URL and one record per
/// code themselves; callers checking first does not close the race.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Initialize the storage (create schema, etc.)
    async fn init(&self) -> StorageResult<()>;

    /// Look up a record by code, whatever its state.
    async fn get_by_code(&self, code: &str) -> StorageResult<Option<Redirect>>;

    /// Look up the active record for a URL.
    async fn get_by_url(&self, original_url: &str) -> StorageResult<Option<Redirect>>;

    /// Insert one record.
    ///
    /// Fails with [`StorageError::UrlConflict`] when an active record already
    /// holds the URL and [`StorageError::CodeConflict`] when the code is taken.
    async fn insert(&self, record: Redirect) -> StorageResult<Redirect>;

    /// Insert many records independently.
    ///
    /// Records that hit a uniqueness rule are skipped and left out of the
    /// returned list; everything else is stored.
    async fn insert_batch(&self, records: Vec<Redirect>) -> StorageResult<Vec<Redirect>>;

    /// Tombstone the active records among `codes`, optionally restricted to
    /// one owner. Returns how many records changed state.
    async fn soft_delete(&self, codes: &[String], owner_filter: Option<&str>) -> StorageResult<u64>;

    /// All active records created by `owner_id`, in no particular order.
    async fn list_by_owner(&self, owner_id: &str) -> StorageResult<Vec<Redirect>>;

    /// Liveness check.
    async fn health_check(&self) -> bool;

    /// Release pools and file handles. Safe to call more than once.
    async fn close(&self) -> StorageResult<()>;
}
