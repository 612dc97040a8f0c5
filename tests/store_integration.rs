//! Redirect store integration tests
//!
//! These drive the store end to end over real backends: creation races,
//! ownership, tombstones, and recovery from the journal after a restart.

use marten::codegen::CodeGenerator;
use marten::config::Config;
use marten::models::BatchItem;
use marten::storage::{InMemoryStorage, PoolSettings, SqliteStorage, Storage};
use marten::{RedirectStore, Resolution, StoreError, StoreOptions};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

/// Returns the given codes in order, then keeps returning the last one.
struct FixedCodes(Mutex<Vec<&'static str>>);

impl FixedCodes {
    fn new(codes: &[&'static str]) -> Arc<Self> {
        let mut codes = codes.to_vec();
        codes.reverse();
        Arc::new(Self(Mutex::new(codes)))
    }
}

impl CodeGenerator for FixedCodes {
    fn generate(&self, _length: usize) -> String {
        let mut codes = self.0.lock().unwrap();
        if codes.len() > 1 {
            codes.pop().unwrap().to_string()
        } else {
            codes[0].to_string()
        }
    }
}

fn memory_store() -> RedirectStore {
    RedirectStore::new(Arc::new(InMemoryStorage::new()), StoreOptions::default())
}

/// Shared-cache in-memory SQLite, pinned to one connection since it reports
/// table locks instead of waiting.
async fn sqlite_store() -> RedirectStore {
    let settings = PoolSettings {
        max_open: 1,
        max_idle: 1,
        ..PoolSettings::default()
    };
    let storage = SqliteStorage::new("sqlite::memory:", &settings)
        .await
        .unwrap();
    storage.init().await.unwrap();
    RedirectStore::new(Arc::new(storage), StoreOptions::default())
}

/// File-backed SQLite with a pool wide enough for writers to race.
async fn sqlite_file_store(dir: &TempDir) -> RedirectStore {
    let url = format!("sqlite://{}", dir.path().join("marten.db").display());
    let settings = PoolSettings {
        max_open: 8,
        max_idle: 8,
        ..PoolSettings::default()
    };
    let storage = SqliteStorage::new(&url, &settings).await.unwrap();
    storage.init().await.unwrap();
    RedirectStore::new(Arc::new(storage), StoreOptions::default())
}

async fn journal_store(path: &Path) -> RedirectStore {
    let storage = InMemoryStorage::with_journal(path).await.unwrap();
    RedirectStore::new(Arc::new(storage), StoreOptions::default())
}

#[tokio::test]
async fn test_example_scenario() {
    let store = memory_store().with_generator(FixedCodes::new(&["Ab12Cd34Ef"]));

    let first = store
        .create_redirect("https://example.com/a", Some("u1"))
        .await
        .unwrap();
    assert_eq!(first.code, "Ab12Cd34Ef");
    assert!(first.created);

    let second = store
        .create_redirect("https://example.com/a", Some("u2"))
        .await
        .unwrap();
    assert_eq!(second.code, "Ab12Cd34Ef");
    assert!(!second.created);

    assert_eq!(
        store.resolve_redirect("Ab12Cd34Ef").await.unwrap(),
        Resolution::Active {
            original_url: "https://example.com/a".to_string()
        }
    );

    let affected = store
        .delete_batch(&["Ab12Cd34Ef".to_string()], "u1")
        .await
        .unwrap();
    assert_eq!(affected, 1);

    assert!(matches!(
        store.resolve_redirect("Ab12Cd34Ef").await.unwrap(),
        Resolution::Tombstoned { .. }
    ));
}

#[tokio::test]
async fn test_round_trip_on_both_backends() {
    for store in [memory_store(), sqlite_store().await] {
        let url = "https://example.com/some/long/path?q=1";
        let outcome = store.create_redirect(url, None).await.unwrap();
        assert!(outcome.created);
        assert_eq!(outcome.code.len(), 10);
        assert!(outcome.code.chars().all(|c| c.is_ascii_alphanumeric()));

        assert_eq!(
            store.resolve_redirect(&outcome.code).await.unwrap(),
            Resolution::Active {
                original_url: url.to_string()
            }
        );
        assert_eq!(
            store.short_url(&outcome.code),
            format!("http://localhost:8080/{}", outcome.code)
        );
    }
}

#[tokio::test]
async fn test_concurrent_creates_share_one_code() {
    let dir = TempDir::new().unwrap();
    for store in [
        memory_store(),
        sqlite_store().await,
        sqlite_file_store(&dir).await,
    ] {
        let store = Arc::new(store);
        let mut handles = vec![];

        for i in 0..32 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .create_redirect("https://example.com/popular", Some(&format!("user{i}")))
                    .await
            }));
        }

        let mut created = 0;
        let mut codes = HashMap::new();
        for handle in handles {
            let outcome = handle.await.unwrap().unwrap();
            if outcome.created {
                created += 1;
            }
            *codes.entry(outcome.code).or_insert(0) += 1;
        }

        assert_eq!(created, 1, "exactly one create should insert");
        assert_eq!(codes.len(), 1, "every caller should get the same code");
    }
}

#[tokio::test]
async fn test_tombstone_is_terminal_and_frees_url() {
    let store = memory_store();
    let original = store
        .create_redirect("https://example.com/a", Some("u1"))
        .await
        .unwrap();
    let codes = vec![original.code.clone()];

    assert_eq!(store.delete_batch(&codes, "u1").await.unwrap(), 1);
    assert_eq!(store.delete_batch(&codes, "u1").await.unwrap(), 0);

    // A new create for the same URL mints a new code; the old one stays gone
    let again = store
        .create_redirect("https://example.com/a", Some("u1"))
        .await
        .unwrap();
    assert!(again.created);
    assert_ne!(again.code, original.code);
    assert!(matches!(
        store.resolve_redirect(&original.code).await.unwrap(),
        Resolution::Tombstoned { .. }
    ));
}

#[tokio::test]
async fn test_ownership_isolation() {
    let store = sqlite_store().await;
    let mine = store
        .create_redirect("https://example.com/mine", Some("alice"))
        .await
        .unwrap();
    let theirs = store
        .create_redirect("https://example.com/theirs", Some("bob"))
        .await
        .unwrap();

    let affected = store
        .delete_batch(&[mine.code.clone(), theirs.code.clone()], "bob")
        .await
        .unwrap();
    assert_eq!(affected, 1);

    assert!(matches!(
        store.resolve_redirect(&mine.code).await.unwrap(),
        Resolution::Active { .. }
    ));
    let listed: Vec<_> = store
        .list_by_owner("alice")
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.code)
        .collect();
    assert_eq!(listed, vec![mine.code]);
    assert!(store.list_by_owner("bob").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_anonymous_redirects_cannot_be_deleted() {
    let store = memory_store();
    let outcome = store
        .create_redirect("https://example.com/anon", Some("   "))
        .await
        .unwrap();

    assert_eq!(
        store
            .delete_batch(&[outcome.code.clone()], "")
            .await
            .unwrap(),
        0
    );
    assert!(store.list_by_owner("").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_invalid_urls_are_rejected() {
    let store = memory_store();
    for bad in ["", "example.com", "http://", "::not-a-url::"] {
        let err = store.create_redirect(bad, None).await.unwrap_err();
        assert!(
            matches!(err, StoreError::InvalidUrl { .. }),
            "{bad:?} gave {err:?}"
        );
        assert!(!err.is_retryable());
    }
}

#[tokio::test]
async fn test_batch_on_sqlite() {
    let store = sqlite_store().await;
    let existing = store
        .create_redirect("https://example.com/0", Some("u1"))
        .await
        .unwrap();

    let items: Vec<BatchItem> = (0..20)
        .map(|i| BatchItem {
            correlation_id: format!("id-{i}"),
            original_url: format!("https://example.com/{}", i % 10),
        })
        .collect();

    let outcomes = store.create_batch(items, Some("u1")).await.unwrap();
    assert_eq!(outcomes.len(), 20);

    let mut by_url: HashMap<usize, String> = HashMap::new();
    for (i, outcome) in outcomes.iter().enumerate() {
        assert_eq!(outcome.correlation_id, format!("id-{i}"));
        let code = outcome.result.clone().unwrap();
        let previous = by_url.entry(i % 10).or_insert_with(|| code.clone());
        assert_eq!(*previous, code, "repeated URLs share a code");
    }
    assert_eq!(by_url[&0], existing.code);

    let listed = store.list_by_owner("u1").await.unwrap();
    assert_eq!(listed.len(), 10);
}

#[tokio::test]
async fn test_journal_recovery_after_restart() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("short-url-db.json");

    let (kept, deleted) = {
        let store = journal_store(&path).await;
        let kept = store
            .create_redirect("https://example.com/kept", Some("u1"))
            .await
            .unwrap();
        let deleted = store
            .create_redirect("https://example.com/deleted", Some("u1"))
            .await
            .unwrap();
        store
            .create_batch(
                vec![BatchItem {
                    correlation_id: "b".to_string(),
                    original_url: "https://example.com/batched".to_string(),
                }],
                Some("u2"),
            )
            .await
            .unwrap();
        store
            .delete_batch(&[deleted.code.clone()], "u1")
            .await
            .unwrap();
        store.shutdown().await.unwrap();
        (kept, deleted)
    };

    let store = journal_store(&path).await;
    assert_eq!(
        store.resolve_redirect(&kept.code).await.unwrap(),
        Resolution::Active {
            original_url: "https://example.com/kept".to_string()
        }
    );
    assert_eq!(
        store.resolve_redirect(&deleted.code).await.unwrap(),
        Resolution::Tombstoned {
            original_url: "https://example.com/deleted".to_string()
        }
    );
    assert_eq!(store.list_by_owner("u2").await.unwrap().len(), 1);

    // Recovered state keeps creation idempotent
    let again = store
        .create_redirect("https://example.com/kept", None)
        .await
        .unwrap();
    assert_eq!(again.code, kept.code);
    assert!(!again.created);
}

#[tokio::test]
async fn test_open_from_config_uses_journal() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("journal.json");
    let path_str = path.to_string_lossy().to_string();

    let vars: HashMap<&str, &str> = HashMap::from([
        ("DATABASE_BACKEND", "memory"),
        ("FILE_STORAGE_PATH", path_str.as_str()),
        ("BASE_URL", "https://sho.rt"),
    ]);
    let config = Config::from_lookup(|key| vars.get(key).map(|v| v.to_string())).unwrap();

    let store = RedirectStore::open(&config).await.unwrap();
    let outcome = store
        .create_redirect("https://example.com/configured", None)
        .await
        .unwrap();
    assert!(store.short_url(&outcome.code).starts_with("https://sho.rt/"));
    assert!(store.health_check().await);
    store.shutdown().await.unwrap();

    let contents = std::fs::read_to_string(&path).unwrap();
    assert_eq!(contents.lines().count(), 1);
}

#[tokio::test]
async fn test_operations_fail_after_shutdown() {
    let store = sqlite_store().await;
    store.shutdown().await.unwrap();
    store.shutdown().await.unwrap();

    assert!(!store.health_check().await);
    assert!(matches!(
        store.resolve_redirect("anything").await,
        Err(StoreError::ShutDown)
    ));
    assert!(matches!(
        store.delete_batch(&["x".to_string()], "u1").await,
        Err(StoreError::ShutDown)
    ));
}
