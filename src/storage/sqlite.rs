use crate::models::Redirect;
use crate::storage::sql::{
    classify_conflict, deadline, is_unique_violation, map_sqlx_error, rows_to_redirects,
    with_timeout, PoolSettings, RedirectRow, BATCH_CHUNK,
};
use crate::storage::{Storage, StorageResult};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Connection, QueryBuilder, Sqlite, SqlitePool};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

pub struct SqliteStorage {
    pool: Arc<SqlitePool>,
    timeout: Duration,
}

impl SqliteStorage {
    pub async fn new(database_url: &str, settings: &PoolSettings) -> StorageResult<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(map_sqlx_error)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(settings.operation_timeout);

        // An in-memory database lives only as long as one of its connections
        // does, so keep one and never recycle it by age.
        let min_connections = u32::from(is_in_memory(database_url));
        let pool = SqlitePoolOptions::new()
            .max_connections(settings.max_open)
            .min_connections(min_connections)
            .idle_timeout(settings.idle_timeout)
            .max_lifetime(None)
            .acquire_timeout(settings.operation_timeout)
            .connect_with(options)
            .await
            .map_err(map_sqlx_error)?;

        Ok(Self {
            pool: Arc::new(pool),
            timeout: settings.operation_timeout,
        })
    }
}

fn is_in_memory(database_url: &str) -> bool {
    database_url.contains(":memory:") || database_url.contains("mode=memory")
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn init(&self) -> StorageResult<()> {
        with_timeout(
            "init",
            self.timeout,
            sqlx::query(
                r#"
                CREATE TABLE IF NOT EXISTS redirects (
                    id TEXT PRIMARY KEY,
                    original_url TEXT NOT NULL,
                    code TEXT NOT NULL,
                    owner_id TEXT,
                    created_at INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL,
                    tombstoned BOOLEAN NOT NULL DEFAULT FALSE
                )
                "#,
            )
            .execute(self.pool.as_ref()),
        )
        .await?;

        // Codes are never reused, even after a tombstone
        with_timeout(
            "init",
            self.timeout,
            sqlx::query("CREATE UNIQUE INDEX IF NOT EXISTS idx_redirects_code ON redirects(code)")
                .execute(self.pool.as_ref()),
        )
        .await?;

        with_timeout(
            "init",
            self.timeout,
            sqlx::query(
                r#"
                CREATE UNIQUE INDEX IF NOT EXISTS idx_redirects_active_url
                ON redirects(original_url)
                WHERE tombstoned = FALSE
                "#,
            )
            .execute(self.pool.as_ref()),
        )
        .await?;

        with_timeout(
            "init",
            self.timeout,
            sqlx::query("CREATE INDEX IF NOT EXISTS idx_redirects_owner ON redirects(owner_id)")
                .execute(self.pool.as_ref()),
        )
        .await?;

        Ok(())
    }

    async fn get_by_code(&self, code: &str) -> StorageResult<Option<Redirect>> {
        let row = with_timeout(
            "get_by_code",
            self.timeout,
            sqlx::query_as::<_, RedirectRow>(
                r#"
                SELECT id, original_url, code, owner_id, created_at, updated_at, tombstoned
                FROM redirects
                WHERE code = ?
                "#,
            )
            .bind(code)
            .fetch_optional(self.pool.as_ref()),
        )
        .await?;

        row.map(Redirect::try_from).transpose()
    }

    async fn get_by_url(&self, original_url: &str) -> StorageResult<Option<Redirect>> {
        let row = with_timeout(
            "get_by_url",
            self.timeout,
            sqlx::query_as::<_, RedirectRow>(
                r#"
                SELECT id, original_url, code, owner_id, created_at, updated_at, tombstoned
                FROM redirects
                WHERE original_url = ? AND tombstoned = FALSE
                LIMIT 1
                "#,
            )
            .bind(original_url)
            .fetch_optional(self.pool.as_ref()),
        )
        .await?;

        row.map(Redirect::try_from).transpose()
    }

    async fn insert(&self, record: Redirect) -> StorageResult<Redirect> {
        let result = deadline(
            "insert",
            self.timeout,
            sqlx::query(
                r#"
                INSERT INTO redirects (id, original_url, code, owner_id, created_at, updated_at, tombstoned)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(record.id.to_string())
            .bind(&record.original_url)
            .bind(&record.code)
            .bind(record.owner_id.as_deref())
            .bind(record.created_at.timestamp_millis())
            .bind(record.updated_at.timestamp_millis())
            .bind(!record.is_active())
            .execute(self.pool.as_ref()),
        )
        .await?;

        match result {
            Ok(_) => Ok(record),
            Err(err) if is_unique_violation(&err) => Err(classify_conflict(self, &record).await),
            Err(err) => Err(map_sqlx_error(err)),
        }
    }

    async fn insert_batch(&self, records: Vec<Redirect>) -> StorageResult<Vec<Redirect>> {
        let mut inserted = Vec::with_capacity(records.len());

        for chunk in records.chunks(BATCH_CHUNK) {
            let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
                "INSERT INTO redirects (id, original_url, code, owner_id, created_at, updated_at, tombstoned) ",
            );
            builder.push_values(chunk, |mut row, record| {
                row.push_bind(record.id.to_string())
                    .push_bind(record.original_url.clone())
                    .push_bind(record.code.clone())
                    .push_bind(record.owner_id.clone())
                    .push_bind(record.created_at.timestamp_millis())
                    .push_bind(record.updated_at.timestamp_millis())
                    .push_bind(!record.is_active());
            });
            builder.push(
                " ON CONFLICT DO NOTHING \
                 RETURNING id, original_url, code, owner_id, created_at, updated_at, tombstoned",
            );

            let rows = with_timeout(
                "insert_batch",
                self.timeout,
                builder
                    .build_query_as::<RedirectRow>()
                    .fetch_all(self.pool.as_ref()),
            )
            .await?;
            inserted.extend(rows_to_redirects(rows)?);
        }

        Ok(inserted)
    }

    async fn soft_delete(&self, codes: &[String], owner_filter: Option<&str>) -> StorageResult<u64> {
        let now = Utc::now().timestamp_millis();
        let mut affected = 0;

        for chunk in codes.chunks(BATCH_CHUNK) {
            let mut builder: QueryBuilder<Sqlite> =
                QueryBuilder::new("UPDATE redirects SET tombstoned = TRUE, updated_at = ");
            builder.push_bind(now);
            builder.push(" WHERE tombstoned = FALSE");
            if let Some(owner) = owner_filter {
                builder.push(" AND owner_id = ").push_bind(owner.to_owned());
            }
            builder.push(" AND code IN (");
            let mut separated = builder.separated(", ");
            for code in chunk {
                separated.push_bind(code.clone());
            }
            separated.push_unseparated(")");

            let result = with_timeout(
                "soft_delete",
                self.timeout,
                builder.build().execute(self.pool.as_ref()),
            )
            .await?;
            affected += result.rows_affected();
        }

        Ok(affected)
    }

    async fn list_by_owner(&self, owner_id: &str) -> StorageResult<Vec<Redirect>> {
        let rows = with_timeout(
            "list_by_owner",
            self.timeout,
            sqlx::query_as::<_, RedirectRow>(
                r#"
                SELECT id, original_url, code, owner_id, created_at, updated_at, tombstoned
                FROM redirects
                WHERE owner_id = ? AND tombstoned = FALSE
                "#,
            )
            .bind(owner_id)
            .fetch_all(self.pool.as_ref()),
        )
        .await?;

        rows_to_redirects(rows)
    }

    async fn health_check(&self) -> bool {
        let ping = async {
            let mut conn = self.pool.acquire().await?;
            conn.ping().await
        };

        match with_timeout("health_check", self.timeout, ping).await {
            Ok(()) => true,
            Err(err) => {
                warn!(error = %err, "sqlite health check failed");
                false
            }
        }
    }

    async fn close(&self) -> StorageResult<()> {
        self.pool.close().await;
        Ok(())
    }
}
