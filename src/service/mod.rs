//! Cache orchestrator: memory → durable store → origin.
//!
//! [`CacheService::request`] answers from the fastest tier that has data:
//!
//! 1. **Memory.** An entry placed in memory less than
//!    `memory_fresh_window` ago is returned with no I/O.
//! 2. **Durable store.** A fresh record is copied to memory and returned.
//!    A stale record is copied to memory, handed to the refresh queue, and
//!    returned immediately. The caller never waits on a refresh.
//! 3. **Origin.** Only when no tier has anything does the caller wait on
//!    the network. Concurrent cold requests for one key share one fetch.
//!
//! Background refreshes send `If-None-Match` with the stored ETag. A 304
//! keeps the stored payload and only bumps its timestamp. A 5xx or
//! transport failure is never cached; the memory entry is dropped and the
//! error goes to whoever is waiting (the cold caller, or the queue's retry
//! policy). A 4xx is handed to a cold caller as-is, but a background refresh
//! treats it as a failure and keeps the stale entry.
//!
//! When a background refresh changes a payload, listeners registered with
//! [`CacheService::on_update`] are told, rate-limited by the [`Notifier`].

mod builder;

pub use builder::CacheServiceBuilder;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::SystemTime;

use async_trait::async_trait;
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use moka::future::Cache;
use tracing::{debug, info, warn};

use crate::config::{CacheConfig, default_storage_dir};
use crate::key::CacheKey;
use crate::notify::{ListenerId, Notifier};
use crate::origin::{FetchRequest, FetchResponse, Origin};
use crate::queue::{RefreshHandler, RefreshQueue, RefreshTask, TaskState};
use crate::store::DiskStore;
use crate::telemetry;
use crate::types::{Body, CacheEntry, Freshness};
use crate::{CacheError, Result};

type SharedFetch = Shared<BoxFuture<'static, Result<Body>>>;

/// An in-progress cold fetch. `id` lets a finished fetch remove only its
/// own map entry.
struct ColdFetch {
    id: u64,
    started: tokio::time::Instant,
    fetch: SharedFetch,
}

/// Memory-tier value. `cached_at` drives memory freshness; the entry's own
/// timestamp may be much older when it was copied from a stale record.
#[derive(Debug, Clone)]
struct MemoryEntry {
    entry: CacheEntry,
    cached_at: tokio::time::Instant,
}

/// State shared between the request path and the refresh queue.
struct Core {
    config: CacheConfig,
    origin: Arc<dyn Origin>,
    memory: Cache<CacheKey, MemoryEntry>,
    store: OnceLock<DiskStore>,
    notifier: Notifier,
    cold_fetches: Mutex<HashMap<CacheKey, ColdFetch>>,
    next_fetch_id: AtomicU64,
}

/// Stale-while-revalidate cache in front of a slow origin.
///
/// Cheap to clone; clones share every tier. Independent instances (e.g. one
/// per registry source) are fully isolated.
#[derive(Clone)]
pub struct CacheService {
    core: Arc<Core>,
    queue: Arc<RefreshQueue<Revalidator>>,
}

impl CacheService {
    /// Create a new builder.
    pub fn builder() -> CacheServiceBuilder {
        CacheServiceBuilder::new()
    }

    pub(crate) fn new(
        origin: Arc<dyn Origin>,
        config: CacheConfig,
        storage_dir: Option<PathBuf>,
    ) -> Self {
        let store = OnceLock::new();
        if let Some(dir) = storage_dir {
            let _ = store.set(DiskStore::new(dir, config.store.clone()));
        }
        let core = Arc::new(Core {
            memory: Cache::builder()
                .max_capacity(config.memory_max_entries)
                .build(),
            notifier: Notifier::new(config.notification_coalesce, config.notification_settle),
            origin,
            store,
            cold_fetches: Mutex::new(HashMap::new()),
            next_fetch_id: AtomicU64::new(0),
            config,
        });
        let queue = RefreshQueue::new(
            Revalidator {
                core: Arc::clone(&core),
            },
            core.config.queue.clone(),
        );
        Self {
            core,
            queue: Arc::new(queue),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.core.config
    }

    /// Bind the durable store to `storage_dir` (or the platform cache dir).
    ///
    /// Only the first call has any effect; returns whether this call bound
    /// the store. A directory that cannot be created is logged, and the
    /// store then degrades to misses.
    pub async fn initialize(&self, storage_dir: Option<PathBuf>) -> bool {
        if self.core.store.get().is_some() {
            return false;
        }
        let dir = storage_dir.unwrap_or_else(default_storage_dir);
        if let Err(e) = tokio::fs::create_dir_all(&dir).await {
            warn!(dir = %dir.display(), error = %e, "failed to create cache directory");
        }
        let bound = self
            .core
            .store
            .set(DiskStore::new(&dir, self.core.config.store.clone()))
            .is_ok();
        if bound {
            info!(dir = %dir.display(), "durable cache initialized");
        }
        bound
    }

    /// The durable store, once bound.
    pub fn store(&self) -> Option<&DiskStore> {
        self.core.store.get()
    }

    /// Result for `url`, scoped by `credential`.
    ///
    /// Fails only when no tier has data and the origin fetch fails.
    pub async fn request(&self, url: &str, credential: Option<&str>) -> Result<Body> {
        let key = CacheKey::new(url, credential);
        let config = &self.core.config;

        let remembered = self.core.memory.get(&key).await;
        if let Some(hit) = &remembered {
            if hit.cached_at.elapsed() < config.memory_fresh_window {
                metrics::counter!(telemetry::CACHE_HITS_TOTAL, "tier" => "memory").increment(1);
                return Ok(hit.entry.payload.clone());
            }
        }

        if let Some(store) = self.core.store.get() {
            if let Some(entry) = store.get(&key).await {
                let freshness = entry.freshness(SystemTime::now(), config.durable_fresh_window);
                let payload = entry.payload.clone();
                self.core.remember(&key, entry).await;
                if freshness == Freshness::Stale {
                    metrics::counter!(telemetry::STALE_SERVED_TOTAL).increment(1);
                    debug!(key = %key, "serving stale entry, refresh scheduled");
                    self.queue.enqueue(url, credential);
                } else {
                    metrics::counter!(telemetry::CACHE_HITS_TOTAL, "tier" => "durable")
                        .increment(1);
                }
                return Ok(payload);
            }
        }

        metrics::counter!(telemetry::CACHE_MISSES_TOTAL).increment(1);
        let prior = remembered.map(|m| m.entry);
        Core::fetch_cold(&self.core, key, url, credential, prior).await
    }

    /// Subscribe to "fresher data is available for this URL" events.
    pub fn on_update<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.core.notifier.subscribe(Arc::new(listener))
    }

    /// Unsubscribe; returns whether the listener was registered.
    pub fn off_update(&self, id: ListenerId) -> bool {
        self.core.notifier.unsubscribe(id)
    }

    /// Drop `url` from memory and the durable store.
    pub async fn invalidate(&self, url: &str, credential: Option<&str>) {
        let key = CacheKey::new(url, credential);
        self.core.memory.invalidate(&key).await;
        if let Some(store) = self.core.store.get() {
            store.delete(&key).await;
        }
    }

    /// Drop everything from memory and the durable store.
    pub async fn clear(&self) {
        self.core.memory.invalidate_all();
        if let Some(store) = self.core.store.get() {
            store.clear().await;
        }
    }

    /// Keys held by the durable store.
    pub async fn keys(&self) -> Vec<CacheKey> {
        match self.core.store.get() {
            Some(store) => store.list_keys().await,
            None => Vec::new(),
        }
    }

    /// Remove durable records older than the store's `max_age`.
    pub async fn prune(&self) -> usize {
        match self.core.store.get() {
            Some(store) => store.prune_expired().await,
            None => 0,
        }
    }

    /// Refresh-queue state of `(url, credential)`.
    pub fn refresh_state(&self, url: &str, credential: Option<&str>) -> Option<TaskState> {
        self.queue.state(url, credential)
    }

    /// Number of background refreshes not yet finished.
    pub fn pending_refreshes(&self) -> usize {
        self.queue.pending()
    }

    /// Stop scheduling background refreshes. Requests keep working.
    pub fn shutdown(&self) {
        self.queue.shutdown();
    }
}

impl Core {
    async fn remember(&self, key: &CacheKey, entry: CacheEntry) {
        self.memory
            .insert(
                key.clone(),
                MemoryEntry {
                    entry,
                    cached_at: tokio::time::Instant::now(),
                },
            )
            .await;
    }

    /// Newest known entry for `key`: the durable record, else memory.
    async fn prior_entry(&self, key: &CacheKey) -> Option<CacheEntry> {
        if let Some(store) = self.store.get() {
            if let Some(entry) = store.get(key).await {
                return Some(entry);
            }
        }
        self.memory.get(key).await.map(|m| m.entry)
    }

    /// Cold path: fetch, sharing one in-progress fetch per key.
    ///
    /// A fetch older than `fetch_timeout` is never joined: if every waiter
    /// was cancelled it may still sit in the map, with its deadline spent.
    async fn fetch_cold(
        this: &Arc<Self>,
        key: CacheKey,
        url: &str,
        credential: Option<&str>,
        prior: Option<CacheEntry>,
    ) -> Result<Body> {
        let fetch = {
            let mut cold = lock(&this.cold_fetches);
            let joinable = cold
                .get(&key)
                .filter(|c| c.started.elapsed() < this.config.fetch_timeout)
                .map(|c| c.fetch.clone());
            if let Some(existing) = joinable {
                metrics::counter!(telemetry::COALESCED_TOTAL).increment(1);
                debug!(key = %key, "joining in-progress fetch");
                existing
            } else {
                let id = this.next_fetch_id.fetch_add(1, Ordering::Relaxed);
                let core = Arc::clone(this);
                let fetch_key = key.clone();
                let url = url.to_string();
                let credential = credential.map(str::to_string);
                let fetch = async move {
                    let result = core
                        .fetch_and_store(&fetch_key, &url, credential, prior)
                        .await;
                    let mut cold = lock(&core.cold_fetches);
                    if cold.get(&fetch_key).is_some_and(|c| c.id == id) {
                        cold.remove(&fetch_key);
                    }
                    result
                }
                .boxed()
                .shared();
                let replaced = cold.insert(
                    key.clone(),
                    ColdFetch {
                        id,
                        started: tokio::time::Instant::now(),
                        fetch: fetch.clone(),
                    },
                );
                if replaced.is_some() {
                    debug!(key = %key, "replaced abandoned fetch");
                }
                fetch
            }
        };
        fetch.await
    }

    async fn fetch_and_store(
        &self,
        key: &CacheKey,
        url: &str,
        credential: Option<String>,
        prior: Option<CacheEntry>,
    ) -> Result<Body> {
        let response = self
            .fetch_origin(key, url, credential, prior.as_ref())
            .await?;
        self.write_back(key, url, prior, response).await
    }

    /// One origin round trip under the fetch timeout.
    ///
    /// Transport errors, timeouts, 5xx and a 304 with nothing to fall back
    /// on are errors; any of them drops the memory entry for `key`.
    async fn fetch_origin(
        &self,
        key: &CacheKey,
        url: &str,
        credential: Option<String>,
        prior: Option<&CacheEntry>,
    ) -> Result<FetchResponse> {
        let timeout = self.config.fetch_timeout;
        let request = FetchRequest::new(url, timeout)
            .credential(credential)
            .etag(prior.and_then(|p| p.etag.clone()));

        let result = match tokio::time::timeout(timeout, self.origin.fetch(&request)).await {
            Ok(Ok(response)) if response.is_server_error() => Err(CacheError::Api {
                status: response.status_code,
                message: format!("origin error for {url}"),
            }),
            Ok(Ok(response)) if response.is_not_modified() && prior.is_none() => {
                Err(CacheError::NotModifiedWithoutPayload {
                    url: url.to_string(),
                })
            }
            Ok(result) => result,
            Err(_) => Err(CacheError::Timeout(timeout)),
        };

        match &result {
            Ok(response) => {
                metrics::counter!(telemetry::ORIGIN_FETCHES_TOTAL, "status" => "ok").increment(1);
                debug!(key = %key, status = response.status_code, "origin fetch complete");
            }
            Err(e) => {
                metrics::counter!(telemetry::ORIGIN_FETCHES_TOTAL, "status" => "error")
                    .increment(1);
                debug!(key = %key, error = %e, "origin fetch failed");
                self.memory.invalidate(key).await;
            }
        }
        result
    }

    /// Record an origin answer in every tier and return the payload.
    ///
    /// 2xx replaces the durable record; 304 re-uses `prior`'s payload with a
    /// new timestamp; a cold 4xx lives in memory only.
    async fn write_back(
        &self,
        key: &CacheKey,
        url: &str,
        prior: Option<CacheEntry>,
        response: FetchResponse,
    ) -> Result<Body> {
        let (payload, etag, durable) = if response.is_not_modified() {
            let prior = prior.ok_or_else(|| CacheError::NotModifiedWithoutPayload {
                url: url.to_string(),
            })?;
            (prior.payload, response.etag.or(prior.etag), true)
        } else {
            let durable = response.is_success();
            let etag = response.etag.clone();
            (response.into_body(), etag, durable)
        };

        if durable {
            if let Some(store) = self.store.get() {
                store.set(key, payload.clone(), url, etag.clone()).await;
            }
        }
        self.remember(
            key,
            CacheEntry {
                payload: payload.clone(),
                timestamp: SystemTime::now(),
                etag,
                origin_url: url.to_string(),
            },
        )
        .await;
        Ok(payload)
    }
}

/// Refresh-queue handler: revalidate against the origin, write back, notify.
struct Revalidator {
    core: Arc<Core>,
}

#[async_trait]
impl RefreshHandler for Revalidator {
    type Output = (Option<CacheEntry>, FetchResponse);

    async fn fetch(&self, task: &RefreshTask) -> Result<Self::Output> {
        let key = task.key();
        let prior = self.core.prior_entry(&key).await;
        let response = self
            .core
            .fetch_origin(&key, &task.url, task.credential.clone(), prior.as_ref())
            .await?;
        // Whatever is cached beats an error body; 429 is retried.
        if !response.is_success() && !response.is_not_modified() {
            return Err(CacheError::Api {
                status: response.status_code,
                message: format!("refresh of {} rejected", task.url),
            });
        }
        Ok((prior, response))
    }

    async fn on_complete(&self, task: &RefreshTask, output: Self::Output) {
        let (prior, response) = output;
        let key = task.key();
        let previous = prior.as_ref().map(|p| p.payload.clone());
        match self.core.write_back(&key, &task.url, prior, response).await {
            Ok(payload) if previous.as_ref() != Some(&payload) => {
                self.core.notifier.notify(&task.url);
            }
            Ok(_) => debug!(key = %key, "revalidated, payload unchanged"),
            Err(e) => warn!(key = %key, error = %e, "failed to record refreshed entry"),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
