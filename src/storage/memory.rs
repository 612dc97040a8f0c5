use crate::journal::{self, Journal, JournalEntry};
use crate::models::Redirect;
use crate::storage::{Storage, StorageError, StorageResult};
use async_trait::async_trait;
use chrono::{SubsecRound, Utc};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
struct Inner {
    by_code: HashMap<String, Redirect>,
    /// URL -> code, for active records only
    by_url: HashMap<String, String>,
    journal: Option<Journal>,
    closed: bool,
}

impl Inner {
    fn check_insert(&self, record: &Redirect) -> StorageResult<()> {
        self.check_open()?;
        if self.by_url.contains_key(&record.original_url) {
            return Err(StorageError::UrlConflict(record.original_url.clone()));
        }
        if self.by_code.contains_key(&record.code) {
            return Err(StorageError::CodeConflict(record.code.clone()));
        }
        Ok(())
    }

    fn apply_create(&mut self, record: Redirect) {
        if record.is_active() {
            self.by_url
                .insert(record.original_url.clone(), record.code.clone());
        }
        self.by_code.insert(record.code.clone(), record);
    }

    fn apply_tombstone(&mut self, code: &str, at: chrono::DateTime<Utc>) -> bool {
        let Some(record) = self.by_code.get_mut(code) else {
            return false;
        };
        if !record.tombstone(at) {
            return false;
        }
        if self.by_url.get(&record.original_url).map(String::as_str) == Some(code) {
            self.by_url.remove(&record.original_url);
        }
        true
    }

    fn replay(&mut self, entries: Vec<JournalEntry>) -> usize {
        let mut ignored = 0;
        for entry in entries {
            match entry {
                JournalEntry::Create(record) => {
                    if let Err(err) = self.check_insert(&record) {
                        warn!(code = %record.code, error = %err, "ignoring conflicting journal entry");
                        ignored += 1;
                        continue;
                    }
                    self.apply_create(record);
                }
                JournalEntry::Tombstone { code, at } => {
                    if !self.by_code.contains_key(&code) {
                        warn!(code = %code, "journal tombstone for unknown code");
                        ignored += 1;
                        continue;
                    }
                    self.apply_tombstone(&code, at);
                }
            }
        }
        ignored
    }

    /// Writes after `close` would bypass the journal.
    fn check_open(&self) -> StorageResult<()> {
        if self.closed {
            return Err(StorageError::Unavailable("storage is closed".to_string()));
        }
        Ok(())
    }

    async fn append_journal(&mut self, entries: &[JournalEntry]) -> StorageResult<()> {
        if let Some(journal) = self.journal.as_mut() {
            journal.append(entries).await?;
        }
        Ok(())
    }
}

/// In-process storage keyed by code and by active URL.
///
/// All access goes through one reader/writer lock. When opened with a journal,
/// every mutation is appended to the journal under the write lock before it is
/// applied, so the map never runs ahead of the file.
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    inner: RwLock<Inner>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild state from the journal at `path`, then keep appending to it.
    pub async fn with_journal(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref();
        let replay = journal::replay(path).await?;
        let replayed = replay.entries.len();

        let mut inner = Inner::default();
        let ignored = inner.replay(replay.entries);
        let active = inner.by_url.len();
        inner.journal = Some(Journal::open(path).await?);

        info!(
            path = %path.display(),
            entries = replayed,
            records = inner.by_code.len(),
            active,
            corrupt = replay.corrupt_lines,
            ignored,
            "restored redirects from journal"
        );

        Ok(Self {
            inner: RwLock::new(inner),
        })
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn init(&self) -> StorageResult<()> {
        Ok(())
    }

    async fn get_by_code(&self, code: &str) -> StorageResult<Option<Redirect>> {
        let inner = self.inner.read().await;
        Ok(inner.by_code.get(code).cloned())
    }

    async fn get_by_url(&self, original_url: &str) -> StorageResult<Option<Redirect>> {
        let inner = self.inner.read().await;
        Ok(inner
            .by_url
            .get(original_url)
            .and_then(|code| inner.by_code.get(code))
            .cloned())
    }

    async fn insert(&self, record: Redirect) -> StorageResult<Redirect> {
        let mut inner = self.inner.write().await;
        inner.check_insert(&record)?;
        inner
            .append_journal(&[JournalEntry::Create(record.clone())])
            .await?;
        inner.apply_create(record.clone());
        Ok(record)
    }

    async fn insert_batch(&self, records: Vec<Redirect>) -> StorageResult<Vec<Redirect>> {
        let mut inner = self.inner.write().await;
        inner.check_open()?;

        let mut codes = HashSet::new();
        let mut urls = HashSet::new();
        let mut accepted = Vec::with_capacity(records.len());
        for record in records {
            let duplicate = !codes.insert(record.code.clone())
                || (record.is_active() && !urls.insert(record.original_url.clone()));
            if duplicate {
                debug!(code = %record.code, "skipping batch record colliding within batch");
                continue;
            }
            if let Err(err) = inner.check_insert(&record) {
                debug!(code = %record.code, error = %err, "skipping conflicting batch record");
                continue;
            }
            accepted.push(record);
        }

        let entries: Vec<JournalEntry> = accepted.iter().cloned().map(JournalEntry::Create).collect();
        inner.append_journal(&entries).await?;
        for record in &accepted {
            inner.apply_create(record.clone());
        }

        Ok(accepted)
    }

    async fn soft_delete(&self, codes: &[String], owner_filter: Option<&str>) -> StorageResult<u64> {
        let mut inner = self.inner.write().await;
        inner.check_open()?;
        let at = Utc::now().trunc_subsecs(3);

        let mut seen = HashSet::new();
        let entries: Vec<JournalEntry> = codes
            .iter()
            .filter(|code| seen.insert(code.as_str()))
            .filter(|code| {
                inner.by_code.get(code.as_str()).is_some_and(|record| {
                    record.is_active() && owner_filter.is_none_or(|owner| record.is_owned_by(owner))
                })
            })
            .map(|code| JournalEntry::Tombstone {
                code: code.clone(),
                at,
            })
            .collect();

        inner.append_journal(&entries).await?;

        let mut affected = 0;
        for entry in &entries {
            if let JournalEntry::Tombstone { code, at } = entry {
                if inner.apply_tombstone(code, *at) {
                    affected += 1;
                }
            }
        }

        Ok(affected)
    }

    async fn list_by_owner(&self, owner_id: &str) -> StorageResult<Vec<Redirect>> {
        let inner = self.inner.read().await;
        Ok(inner
            .by_code
            .values()
            .filter(|record| record.is_active() && record.is_owned_by(owner_id))
            .cloned()
            .collect())
    }

    async fn health_check(&self) -> bool {
        true
    }

    async fn close(&self) -> StorageResult<()> {
        let mut inner = self.inner.write().await;
        inner.closed = true;
        if let Some(mut journal) = inner.journal.take() {
            journal.sync().await?;
            debug!(path = %journal.path().display(), "journal closed");
        }
        Ok(())
    }
}
