//! The redirect store: the single entry point request handlers call.
//!
//! It validates input, generates codes, and turns backend conflicts into the
//! outcomes callers expect. All uniqueness rules are enforced by the backend;
//! the store only decides what to do when one trips.

use crate::codegen::{CodeGenerator, RandomCodeGenerator, DEFAULT_CODE_LENGTH};
use crate::config::Config;
use crate::models::{BatchItem, Redirect};
use crate::storage::{self, Storage, StorageError};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{RwLock, RwLockReadGuard};
use tracing::{debug, info, info_span, warn, Instrument, Span};
use url::Url;

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("no free short code found after {attempts} attempts")]
    CodeSpaceExhausted { attempts: u32 },
    #[error("{op} failed for '{key}': {source}")]
    Storage {
        op: &'static str,
        key: String,
        #[source]
        source: Arc<StorageError>,
    },
    #[error("redirect store is shut down")]
    ShutDown,
}

impl StoreError {
    /// Whether the same call may succeed if repeated later.
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::CodeSpaceExhausted { .. } => true,
            StoreError::Storage { source, .. } => source.is_transient(),
            StoreError::InvalidUrl { .. } | StoreError::ShutDown => false,
        }
    }

    fn storage(op: &'static str, key: impl Into<String>) -> impl FnOnce(StorageError) -> Self {
        let key = key.into();
        move |source| StoreError::Storage {
            op,
            key,
            source: Arc::new(source),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub base_url: String,
    pub code_length: usize,
    /// Codes tried per creation before giving up.
    pub max_attempts: u32,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            code_length: DEFAULT_CODE_LENGTH,
            max_attempts: 8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateOutcome {
    pub code: String,
    /// `false` when an active redirect for the URL already existed.
    pub created: bool,
}

#[derive(Debug, Clone)]
pub struct BatchOutcome {
    pub correlation_id: String,
    pub result: StoreResult<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Active { original_url: String },
    Tombstoned { original_url: String },
    NotFound,
}

pub struct RedirectStore {
    backend: Arc<dyn Storage>,
    generator: Arc<dyn CodeGenerator>,
    options: StoreOptions,
    span: Span,
    /// Operations hold a read guard while they run; shutdown takes the write
    /// guard, so the backend is never closed under an operation.
    closed: RwLock<bool>,
}

impl RedirectStore {
    pub fn new(backend: Arc<dyn Storage>, options: StoreOptions) -> Self {
        Self {
            backend,
            generator: Arc::new(RandomCodeGenerator),
            options,
            span: info_span!("redirect_store"),
            closed: RwLock::new(false),
        }
    }

    /// Connect the backend named in `config` and build a store over it.
    pub async fn open(config: &Config) -> anyhow::Result<Self> {
        let backend = storage::connect(&config.database).await?;
        let options = StoreOptions {
            base_url: config.shortener.base_url.clone(),
            code_length: config.shortener.code_length,
            max_attempts: config.shortener.max_attempts,
        };
        Ok(Self::new(backend, options))
    }

    pub fn with_generator(mut self, generator: Arc<dyn CodeGenerator>) -> Self {
        self.generator = generator;
        self
    }

    /// Run every store operation inside `span`.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn options(&self) -> &StoreOptions {
        &self.options
    }

    /// The public URL for `code`.
    pub fn short_url(&self, code: &str) -> String {
        format!("{}/{}", self.options.base_url.trim_end_matches('/'), code)
    }

    /// Shorten `original_url`, reusing the active code if one exists.
    pub async fn create_redirect(
        &self,
        original_url: &str,
        owner_id: Option<&str>,
    ) -> StoreResult<CreateOutcome> {
        let _open = self.enter().await?;
        let url = validate_url(original_url)?;
        let owner = normalize_owner(owner_id);

        self.create_validated(&url, owner)
            .instrument(self.span.clone())
            .await
    }

    async fn create_validated(&self, url: &str, owner: Option<&str>) -> StoreResult<CreateOutcome> {
        if let Some(existing) = self.active_for(url).await? {
            debug!(code = %existing, "URL already shortened");
            return Ok(CreateOutcome {
                code: existing,
                created: false,
            });
        }

        for attempt in 1..=self.options.max_attempts {
            let code = self.generator.generate(self.options.code_length);

            let taken = self
                .backend
                .get_by_code(&code)
                .await
                .map_err(StoreError::storage("get_by_code", &code))?;
            if taken.is_some() {
                debug!(attempt, code = %code, "generated code already in use");
                continue;
            }

            match self.backend.insert(Redirect::new(url, code.as_str(), owner)).await {
                Ok(record) => {
                    info!(code = %record.code, "redirect created");
                    return Ok(CreateOutcome {
                        code: record.code,
                        created: true,
                    });
                }
                Err(StorageError::UrlConflict(_)) => {
                    // Lost a race with a concurrent create of the same URL
                    if let Some(winner) = self.active_for(url).await? {
                        debug!(code = %winner, "concurrent create won");
                        return Ok(CreateOutcome {
                            code: winner,
                            created: false,
                        });
                    }
                }
                Err(StorageError::CodeConflict(_)) => {
                    debug!(attempt, code = %code, "code taken during insert");
                }
                Err(err) => return Err(StoreError::storage("insert", url)(err)),
            }
        }

        warn!(
            attempts = self.options.max_attempts,
            length = self.options.code_length,
            "could not find a free short code"
        );
        Err(StoreError::CodeSpaceExhausted {
            attempts: self.options.max_attempts,
        })
    }

    async fn active_for(&self, url: &str) -> StoreResult<Option<String>> {
        let record = self
            .backend
            .get_by_url(url)
            .await
            .map_err(StoreError::storage("get_by_url", url))?;
        Ok(record.map(|r| r.code))
    }

    /// Shorten many URLs at once.
    ///
    /// Items succeed or fail independently and come back in input order.
    /// Items repeating a URL share one code. A failed lookup only fails the
    /// items for that URL. A backend failure of the bulk insert fails the whole
    /// call; repeating it is safe since creation is idempotent.
    pub async fn create_batch(
        &self,
        items: Vec<BatchItem>,
        owner_id: Option<&str>,
    ) -> StoreResult<Vec<BatchOutcome>> {
        let _open = self.enter().await?;
        let owner = normalize_owner(owner_id);

        self.create_batch_inner(items, owner)
            .instrument(self.span.clone())
            .await
    }

    async fn create_batch_inner(
        &self,
        items: Vec<BatchItem>,
        owner: Option<&str>,
    ) -> StoreResult<Vec<BatchOutcome>> {
        let mut results: HashMap<String, StoreResult<String>> = HashMap::new();
        let mut item_urls = Vec::with_capacity(items.len());
        let mut pending: Vec<String> = Vec::new();
        let mut seen = HashSet::new();

        for item in &items {
            match validate_url(&item.original_url) {
                Ok(url) => {
                    if seen.insert(url.clone()) {
                        match self.active_for(&url).await {
                            Ok(Some(code)) => {
                                results.insert(url.clone(), Ok(code));
                            }
                            Ok(None) => pending.push(url.clone()),
                            Err(err) => {
                                warn!(url = %url, error = %err, "batch lookup failed");
                                results.insert(url.clone(), Err(err));
                            }
                        }
                    }
                    item_urls.push(Ok(url));
                }
                Err(err) => item_urls.push(Err(err)),
            }
        }

        let mut codes = HashSet::with_capacity(pending.len());
        let records: Vec<Redirect> = pending
            .iter()
            .map(|url| {
                let mut code = self.generator.generate(self.options.code_length);
                for _ in 1..self.options.max_attempts {
                    if !codes.contains(&code) {
                        break;
                    }
                    code = self.generator.generate(self.options.code_length);
                }
                codes.insert(code.clone());
                Redirect::new(url.as_str(), code, owner)
            })
            .collect();

        let requested = records.len();
        let inserted = self
            .backend
            .insert_batch(records)
            .await
            .map_err(StoreError::storage("insert_batch", format!("{requested} records")))?;
        let inserted_count = inserted.len();
        for record in inserted {
            results.insert(record.original_url, Ok(record.code));
        }

        // Anything the backend skipped goes through the single-record path,
        // which handles both a taken code and a URL won by someone else.
        for url in &pending {
            if !results.contains_key(url) {
                let outcome = self.create_validated(url, owner).await.map(|o| o.code);
                results.insert(url.clone(), outcome);
            }
        }

        info!(
            items = items.len(),
            inserted = inserted_count,
            retried = requested - inserted_count,
            "batch processed"
        );

        Ok(items
            .into_iter()
            .zip(item_urls)
            .map(|(item, url)| BatchOutcome {
                correlation_id: item.correlation_id,
                result: url.and_then(|url| {
                    results.get(&url).cloned().unwrap_or(Err(StoreError::CodeSpaceExhausted {
                        attempts: self.options.max_attempts,
                    }))
                }),
            })
            .collect())
    }

    /// Look up what `code` points to.
    pub async fn resolve_redirect(&self, code: &str) -> StoreResult<Resolution> {
        let _open = self.enter().await?;

        let record = self
            .backend
            .get_by_code(code)
            .instrument(self.span.clone())
            .await
            .map_err(StoreError::storage("get_by_code", code))?;

        Ok(match record {
            None => Resolution::NotFound,
            Some(r) if r.is_active() => Resolution::Active {
                original_url: r.original_url,
            },
            Some(r) => Resolution::Tombstoned {
                original_url: r.original_url,
            },
        })
    }

    /// Tombstone the codes among `codes` that `owner_id` created.
    ///
    /// Codes that are unknown, already deleted, or owned by someone else are
    /// skipped. Returns how many records were deleted.
    pub async fn delete_batch(&self, codes: &[String], owner_id: &str) -> StoreResult<u64> {
        let _open = self.enter().await?;

        let Some(owner) = normalize_owner(Some(owner_id)) else {
            debug!("delete without owner ignored");
            return Ok(0);
        };
        if codes.is_empty() {
            return Ok(0);
        }

        async {
            let affected = self
                .backend
                .soft_delete(codes, Some(owner))
                .await
                .map_err(StoreError::storage("soft_delete", owner))?;
            info!(
                owner = %owner,
                requested = codes.len(),
                affected,
                "redirects deleted"
            );
            Ok::<u64, StoreError>(affected)
        }
        .instrument(self.span.clone())
        .await
    }

    /// Active redirects created by `owner_id`, oldest first.
    pub async fn list_by_owner(&self, owner_id: &str) -> StoreResult<Vec<Redirect>> {
        let _open = self.enter().await?;

        let Some(owner) = normalize_owner(Some(owner_id)) else {
            return Ok(Vec::new());
        };

        let mut records = self
            .backend
            .list_by_owner(owner)
            .instrument(self.span.clone())
            .await
            .map_err(StoreError::storage("list_by_owner", owner))?;
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.code.cmp(&b.code)));
        Ok(records)
    }

    pub async fn health_check(&self) -> bool {
        let Ok(_open) = self.enter().await else {
            return false;
        };
        self.backend
            .health_check()
            .instrument(self.span.clone())
            .await
    }

    /// Release backend resources once running operations finish. Later calls
    /// are no-ops.
    pub async fn shutdown(&self) -> StoreResult<()> {
        let mut closed = self.closed.write().await;
        if *closed {
            return Ok(());
        }
        *closed = true;

        self.backend
            .close()
            .instrument(self.span.clone())
            .await
            .map_err(StoreError::storage("close", "backend"))?;
        info!(parent: &self.span, "redirect store shut down");
        Ok(())
    }

    async fn enter(&self) -> StoreResult<RwLockReadGuard<'_, bool>> {
        let closed = self.closed.read().await;
        if *closed {
            return Err(StoreError::ShutDown);
        }
        Ok(closed)
    }
}

/// Accept absolute URLs with a host; returns the trimmed input unchanged.
fn validate_url(raw: &str) -> StoreResult<String> {
    let trimmed = raw.trim();
    let invalid = |reason: String| StoreError::InvalidUrl {
        url: raw.to_string(),
        reason,
    };

    if trimmed.is_empty() {
        return Err(invalid("empty".to_string()));
    }
    let parsed = Url::parse(trimmed).map_err(|e| invalid(e.to_string()))?;
    if parsed.cannot_be_a_base() || parsed.host_str().is_none_or(str::is_empty) {
        return Err(invalid("missing host".to_string()));
    }

    Ok(trimmed.to_string())
}

fn normalize_owner(owner: Option<&str>) -> Option<&str> {
    owner.map(str::trim).filter(|o| !o.is_empty())
}
