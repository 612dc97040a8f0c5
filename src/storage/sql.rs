//! Pieces shared by the SQLite and PostgreSQL backends.

use crate::models::{Redirect, RedirectState};
use crate::storage::{Storage, StorageError, StorageResult};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::time::Duration;
use uuid::Uuid;

/// Rows per multi-row statement; keeps bind counts well under driver limits.
pub(crate) const BATCH_CHUNK: usize = 500;

/// Connection pool and timeout settings for relational backends.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub max_open: u32,
    /// Advisory only. sqlx pools have no idle cap: they open connections on
    /// demand and close any that sit idle for `idle_timeout`.
    pub max_idle: u32,
    pub idle_timeout: Duration,
    /// Upper bound for each storage operation, including pool acquisition.
    pub operation_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_open: 30,
            max_idle: 30,
            idle_timeout: Duration::from_secs(600),
            operation_timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct RedirectRow {
    pub id: String,
    pub original_url: String,
    pub code: String,
    pub owner_id: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub tombstoned: bool,
}

impl TryFrom<RedirectRow> for Redirect {
    type Error = StorageError;

    fn try_from(row: RedirectRow) -> StorageResult<Self> {
        let id = Uuid::parse_str(&row.id)
            .map_err(|e| StorageError::InvalidData(format!("invalid id '{}': {e}", row.id)))?;
        Ok(Redirect {
            id,
            original_url: row.original_url,
            code: row.code,
            owner_id: row.owner_id,
            created_at: from_millis(row.created_at)?,
            updated_at: from_millis(row.updated_at)?,
            state: if row.tombstoned {
                RedirectState::Tombstoned
            } else {
                RedirectState::Active
            },
        })
    }
}

pub(crate) fn rows_to_redirects(rows: Vec<RedirectRow>) -> StorageResult<Vec<Redirect>> {
    rows.into_iter().map(Redirect::try_from).collect()
}

fn from_millis(millis: i64) -> StorageResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| StorageError::InvalidData(format!("invalid timestamp {millis}")))
}

pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .is_some_and(sqlx::error::DatabaseError::is_unique_violation)
}

pub(crate) fn map_sqlx_error(err: sqlx::Error) -> StorageError {
    let message = err.to_string();

    match err {
        sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed
        | sqlx::Error::Io(_)
        | sqlx::Error::Tls(_) => StorageError::Unavailable(message),
        sqlx::Error::ColumnIndexOutOfBounds { .. }
        | sqlx::Error::ColumnNotFound(_)
        | sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::TypeNotFound { .. }
        | sqlx::Error::Decode(_)
        | sqlx::Error::RowNotFound => StorageError::InvalidData(message),
        other => StorageError::Other(other.into()),
    }
}

/// Run one storage operation under `timeout`, leaving driver errors unmapped.
///
/// On expiry the operation future is dropped, which hands any acquired
/// connection back to the pool.
pub(crate) async fn deadline<T, F>(
    op: &'static str,
    timeout: Duration,
    fut: F,
) -> StorageResult<Result<T, sqlx::Error>>
where
    F: Future<Output = Result<T, sqlx::Error>>,
{
    tokio::time::timeout(timeout, fut).await.map_err(|_| {
        tracing::warn!(op, ?timeout, "storage operation timed out");
        StorageError::Timeout { op, timeout }
    })
}

pub(crate) async fn with_timeout<T, F>(op: &'static str, timeout: Duration, fut: F) -> StorageResult<T>
where
    F: Future<Output = Result<T, sqlx::Error>>,
{
    deadline(op, timeout, fut).await?.map_err(map_sqlx_error)
}

/// Work out which uniqueness rule a failed insert tripped.
pub(crate) async fn classify_conflict<S>(storage: &S, record: &Redirect) -> StorageError
where
    S: Storage + ?Sized,
{
    match storage.get_by_url(&record.original_url).await {
        Ok(Some(_)) => StorageError::UrlConflict(record.original_url.clone()),
        Ok(None) => StorageError::CodeConflict(record.code.clone()),
        Err(err) => err,
    }
}
