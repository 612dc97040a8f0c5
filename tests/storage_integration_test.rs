//! Integration tests for the storage backends
//!
//! Every backend runs the same checks so they stay interchangeable.
//!
//! Tests can be filtered by database backend using the DATABASE_BACKEND environment variable:
//! - `DATABASE_BACKEND=sqlite cargo test` - Run only SQLite tests
//! - `DATABASE_BACKEND=postgres cargo test` - Run only PostgreSQL tests (needs DATABASE_URL)
//! - By default, every backend with a reachable database is tested

use marten::models::{Redirect, RedirectState};
use marten::storage::{
    InMemoryStorage, PoolSettings, PostgresStorage, SqliteStorage, Storage, StorageError,
};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Get the database backend to test from environment variable
fn should_test_backend(backend: &str) -> bool {
    match std::env::var("DATABASE_BACKEND") {
        Ok(val) => val.to_lowercase() == backend.to_lowercase(),
        Err(_) => true, // Test all backends if not specified
    }
}

fn test_settings() -> PoolSettings {
    // One connection: shared-cache in-memory SQLite fails on table locks
    // instead of waiting out busy_timeout. File databases get a real pool below.
    PoolSettings {
        max_open: 1,
        max_idle: 1,
        operation_timeout: Duration::from_secs(10),
        ..PoolSettings::default()
    }
}

async fn create_sqlite_storage() -> Arc<dyn Storage> {
    let storage = SqliteStorage::new("sqlite::memory:", &test_settings())
        .await
        .unwrap();
    storage.init().await.unwrap();
    Arc::new(storage)
}

async fn create_postgres_storage() -> Option<Arc<dyn Storage>> {
    let db_url = std::env::var("DATABASE_URL").ok()?;
    if !db_url.starts_with("postgres") {
        return None;
    }
    let settings = PoolSettings {
        max_open: 5,
        max_idle: 1,
        ..test_settings()
    };
    let storage = PostgresStorage::new(&db_url, &settings).await.ok()?;
    storage.init().await.ok()?;
    Some(Arc::new(storage))
}

/// Storages selected for this run.
async fn backends() -> Vec<(&'static str, Arc<dyn Storage>)> {
    let mut selected: Vec<(&'static str, Arc<dyn Storage>)> = Vec::new();
    if should_test_backend("memory") {
        selected.push(("memory", Arc::new(InMemoryStorage::new())));
    }
    if should_test_backend("sqlite") {
        selected.push(("sqlite", create_sqlite_storage().await));
    }
    if should_test_backend("postgres") {
        if let Some(storage) = create_postgres_storage().await {
            selected.push(("postgres", storage));
        }
    }
    selected
}

/// Unique URL and code so runs against a shared database do not collide.
fn unique(tag: &str) -> (String, String) {
    let id = Uuid::now_v7().simple().to_string();
    (
        format!("https://example.com/{tag}/{id}"),
        format!("{tag}{}", &id[id.len() - 10..]),
    )
}

#[tokio::test]
async fn test_insert_and_lookup() {
    for (name, storage) in backends().await {
        let (url, code) = unique("lookup");
        let record = Redirect::new(url.as_str(), code.as_str(), Some("owner-1"));
        storage.insert(record.clone()).await.unwrap();

        let by_code = storage.get_by_code(&code).await.unwrap().unwrap();
        assert_eq!(by_code, record, "{name}: get_by_code");

        let by_url = storage.get_by_url(&url).await.unwrap().unwrap();
        assert_eq!(by_url.code, code, "{name}: get_by_url");

        assert!(
            storage.get_by_code("no-such-code").await.unwrap().is_none(),
            "{name}: missing code"
        );
    }
}

#[tokio::test]
async fn test_insert_reports_conflict_kind() {
    for (name, storage) in backends().await {
        let (url, code) = unique("conflict");
        storage
            .insert(Redirect::new(url.as_str(), code.as_str(), None))
            .await
            .unwrap();

        let (other_url, other_code) = unique("conflict");
        let err = storage
            .insert(Redirect::new(url.as_str(), other_code.as_str(), None))
            .await
            .unwrap_err();
        assert!(
            matches!(err, StorageError::UrlConflict(_)),
            "{name}: expected URL conflict, got {err:?}"
        );

        let err = storage
            .insert(Redirect::new(other_url.as_str(), code.as_str(), None))
            .await
            .unwrap_err();
        assert!(
            matches!(err, StorageError::CodeConflict(_)),
            "{name}: expected code conflict, got {err:?}"
        );
    }
}

#[tokio::test]
async fn test_soft_delete_is_owner_scoped_and_terminal() {
    for (name, storage) in backends().await {
        let (url, code) = unique("delete");
        storage
            .insert(Redirect::new(url.as_str(), code.as_str(), Some("alice")))
            .await
            .unwrap();
        let codes = vec![code.clone()];

        assert_eq!(
            storage.soft_delete(&codes, Some("mallory")).await.unwrap(),
            0,
            "{name}: foreign owner"
        );
        assert_eq!(storage.soft_delete(&codes, Some("alice")).await.unwrap(), 1);
        assert_eq!(
            storage.soft_delete(&codes, Some("alice")).await.unwrap(),
            0,
            "{name}: second delete"
        );

        let record = storage.get_by_code(&code).await.unwrap().unwrap();
        assert_eq!(record.state, RedirectState::Tombstoned, "{name}");
        assert!(record.updated_at >= record.created_at, "{name}");
        assert!(storage.get_by_url(&url).await.unwrap().is_none(), "{name}");

        // The URL is free again, the code is not
        let (_, fresh_code) = unique("delete");
        storage
            .insert(Redirect::new(url.as_str(), fresh_code.as_str(), Some("alice")))
            .await
            .unwrap();
        let err = storage
            .insert(Redirect::new(unique("delete").0.as_str(), code.as_str(), None))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::CodeConflict(_)), "{name}");
    }
}

#[tokio::test]
async fn test_insert_batch_skips_only_conflicting_rows() {
    for (name, storage) in backends().await {
        let (taken_url, taken_code) = unique("batch");
        storage
            .insert(Redirect::new(taken_url.as_str(), taken_code.as_str(), None))
            .await
            .unwrap();

        let fresh: Vec<Redirect> = (0..5)
            .map(|_| {
                let (url, code) = unique("batch");
                Redirect::new(url.as_str(), code.as_str(), Some("bob"))
            })
            .collect();
        let mut records = fresh.clone();
        records.push(Redirect::new(
            taken_url.as_str(),
            unique("batch").1.as_str(),
            Some("bob"),
        ));
        records.push(Redirect::new(
            unique("batch").0.as_str(),
            taken_code.as_str(),
            Some("bob"),
        ));

        let inserted = storage.insert_batch(records).await.unwrap();
        let mut inserted_codes: Vec<_> = inserted.iter().map(|r| r.code.clone()).collect();
        let mut expected: Vec<_> = fresh.iter().map(|r| r.code.clone()).collect();
        inserted_codes.sort();
        expected.sort();
        assert_eq!(inserted_codes, expected, "{name}");

        for record in &fresh {
            assert!(
                storage.get_by_code(&record.code).await.unwrap().is_some(),
                "{name}: {} missing",
                record.code
            );
        }
    }
}

#[tokio::test]
async fn test_large_batch_spans_chunks() {
    for (name, storage) in backends().await {
        let records: Vec<Redirect> = (0..1_200)
            .map(|_| {
                let (url, code) = unique("bulk");
                Redirect::new(url.as_str(), code.as_str(), None)
            })
            .collect();
        let codes: Vec<String> = records.iter().map(|r| r.code.clone()).collect();

        let inserted = storage.insert_batch(records).await.unwrap();
        assert_eq!(inserted.len(), 1_200, "{name}");

        let affected = storage.soft_delete(&codes, None).await.unwrap();
        assert_eq!(affected, 1_200, "{name}");
    }
}

#[tokio::test]
async fn test_list_by_owner_returns_active_records() {
    for (name, storage) in backends().await {
        let owner = format!("owner-{}", Uuid::now_v7());
        let mut codes = Vec::new();
        for _ in 0..3 {
            let (url, code) = unique("list");
            storage
                .insert(Redirect::new(url.as_str(), code.as_str(), Some(owner.as_str())))
                .await
                .unwrap();
            codes.push(code);
        }
        storage
            .soft_delete(&codes[..1], Some(owner.as_str()))
            .await
            .unwrap();

        let mut listed: Vec<_> = storage
            .list_by_owner(&owner)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.code)
            .collect();
        listed.sort();
        let mut expected = codes[1..].to_vec();
        expected.sort();
        assert_eq!(listed, expected, "{name}");
    }
}

#[tokio::test]
async fn test_concurrent_inserts_of_one_url() {
    for (name, storage) in backends().await {
        let (url, _) = unique("race");
        let mut handles = vec![];

        for _ in 0..10 {
            let storage = Arc::clone(&storage);
            let url = url.clone();
            handles.push(tokio::spawn(async move {
                let (_, code) = unique("race");
                storage
                    .insert(Redirect::new(url.as_str(), code.as_str(), None))
                    .await
            }));
        }

        let mut success_count = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => success_count += 1,
                Err(StorageError::UrlConflict(_)) => {}
                Err(e) => panic!("{name}: unexpected error: {e:?}"),
            }
        }
        assert_eq!(success_count, 1, "{name}: exactly one insert should win");
    }
}

#[tokio::test]
async fn test_health_and_close() {
    for (name, storage) in backends().await {
        assert!(storage.health_check().await, "{name}");
        storage.close().await.unwrap();
        storage.close().await.unwrap();
    }
}

#[tokio::test]
async fn test_sqlite_file_database_survives_reopen() {
    if !should_test_backend("sqlite") {
        return;
    }

    let dir = tempfile::TempDir::new().unwrap();
    let url = format!("sqlite://{}", dir.path().join("marten.db").display());
    let (original_url, code) = unique("file");

    {
        let storage = SqliteStorage::new(&url, &PoolSettings::default())
            .await
            .unwrap();
        storage.init().await.unwrap();
        storage
            .insert(Redirect::new(original_url.as_str(), code.as_str(), Some("u1")))
            .await
            .unwrap();
        storage.close().await.unwrap();
    }

    let storage = SqliteStorage::new(&url, &PoolSettings::default())
        .await
        .unwrap();
    storage.init().await.unwrap();
    let record = storage.get_by_code(&code).await.unwrap().unwrap();
    assert_eq!(record.original_url, original_url);
    assert!(record.is_active());
}

#[tokio::test]
async fn test_sqlite_file_pool_races_inserts() {
    if !should_test_backend("sqlite") {
        return;
    }

    let dir = tempfile::TempDir::new().unwrap();
    let url = format!("sqlite://{}", dir.path().join("race.db").display());
    let settings = PoolSettings {
        max_open: 8,
        max_idle: 8,
        ..test_settings()
    };
    let storage: Arc<dyn Storage> = Arc::new(SqliteStorage::new(&url, &settings).await.unwrap());
    storage.init().await.unwrap();

    let (url, _) = unique("filerace");
    let mut handles = vec![];
    for _ in 0..16 {
        let storage = Arc::clone(&storage);
        let url = url.clone();
        handles.push(tokio::spawn(async move {
            let (_, code) = unique("filerace");
            storage
                .insert(Redirect::new(url.as_str(), code.as_str(), None))
                .await
        }));
    }

    let mut winners = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => winners += 1,
            Err(StorageError::UrlConflict(_)) => {}
            Err(e) => panic!("unexpected error: {e:?}"),
        }
    }
    assert_eq!(winners, 1);
}
