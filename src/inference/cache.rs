//! Engine cache
//!
//! Bounded, concurrency-safe cache of constructed engines keyed by model
//! identifier.
//!
//! # Concurrency
//!
//! A single mutex guards the slot table. It is held only to decide hit, miss
//! or "already loading", never across a construction. The first caller to
//! miss on an identifier installs a `Loading` slot and spawns the
//! construction as a detached task; every caller for that identifier
//! (including the first) waits on the same watch channel. Dropping a waiting
//! future therefore never cancels a construction, and a completed engine is
//! cached whether or not anybody is still waiting for it.
//!
//! # Eviction
//!
//! Least recently used among entries that are not in use. An entry is in use
//! while any handle other than the cache's own is alive. When every entry
//! over capacity is in use the cache temporarily holds more than its
//! capacity; the next insertion or hit trims it back.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use thiserror::Error;
use tokio::sync::watch;

use crate::inference::engine::{Engine, EngineError, EngineLoader, SamplingConfig};
use crate::inference::registry::{EngineRegistry, ModelSpec};

/// Default number of engines kept resident
pub const DEFAULT_CACHE_CAPACITY: usize = 5;

/// Building an engine failed. Shared by every caller that waited on the
/// failed construction.
#[derive(Debug, Error, Clone)]
#[error("Failed to load model '{model}': {source}")]
pub struct EngineConstructionError {
    pub model: String,
    #[source]
    pub source: EngineError,
}

impl EngineConstructionError {
    fn new(model: impl Into<String>, source: EngineError) -> Self {
        Self {
            model: model.into(),
            source,
        }
    }
}

/// One constructed engine, owned by the cache and by every request using it.
pub struct LoadedEngine {
    model: String,
    instance_id: u64,
    engine: Box<dyn Engine>,
    serial: Mutex<()>,
}

impl LoadedEngine {
    fn new(model: String, instance_id: u64, engine: Box<dyn Engine>) -> Self {
        Self {
            model,
            instance_id,
            engine,
            serial: Mutex::new(()),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Unique per construction; two handles with the same id share one engine.
    pub fn instance_id(&self) -> u64 {
        self.instance_id
    }

    /// Runs the engine. Blocking; call from a blocking task.
    ///
    /// Calls are serialized unless the engine declares itself safe for
    /// concurrent generation.
    pub fn generate(&self, prompt: &str, config: &SamplingConfig) -> Result<String, EngineError> {
        if self.engine.supports_concurrent_generation() {
            return self.engine.generate(prompt, config);
        }
        let _guard = self.serial.lock().unwrap_or_else(PoisonError::into_inner);
        self.engine.generate(prompt, config)
    }
}

impl std::fmt::Debug for LoadedEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedEngine")
            .field("model", &self.model)
            .field("instance_id", &self.instance_id)
            .finish()
    }
}

/// Shared ownership of a cached engine. Never released while a clone is alive.
pub type EngineHandle = Arc<LoadedEngine>;

type ConstructionOutcome = Option<Result<EngineHandle, EngineConstructionError>>;

struct CacheEntry {
    handle: EngineHandle,
    last_used: u64,
}

enum Slot {
    Ready(CacheEntry),
    Loading(watch::Receiver<ConstructionOutcome>),
}

#[derive(Default)]
struct CacheState {
    slots: HashMap<String, Slot>,
    /// Recency clock, bumped on every hit and insertion
    clock: u64,
    next_instance: u64,
}

impl CacheState {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn ready_count(&self) -> usize {
        self.slots
            .values()
            .filter(|slot| matches!(slot, Slot::Ready(_)))
            .count()
    }

    /// Removes idle entries, oldest first, until at most `capacity` remain.
    /// Returns the evicted handles so they can be dropped outside the lock.
    fn evict_over(&mut self, capacity: usize) -> Vec<EngineHandle> {
        let mut evicted = Vec::new();

        while self.ready_count() > capacity {
            let victim = self
                .slots
                .iter()
                .filter_map(|(name, slot)| match slot {
                    Slot::Ready(entry) if Arc::strong_count(&entry.handle) == 1 => {
                        Some((entry.last_used, name.clone()))
                    }
                    _ => None,
                })
                .min();

            let Some((_, name)) = victim else {
                tracing::debug!(
                    "Engine cache over capacity ({} > {}) but every entry is in use",
                    self.ready_count(),
                    capacity
                );
                break;
            };

            if let Some(Slot::Ready(entry)) = self.slots.remove(&name) {
                tracing::info!("Evicted model from cache: {}", name);
                evicted.push(entry.handle);
            }
        }

        evicted
    }
}

fn lock(state: &Mutex<CacheState>) -> MutexGuard<'_, CacheState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Sender side of one construction.
///
/// If the construction task is dropped before publishing (runtime shutdown,
/// panic outside the blocking task) the `Loading` slot is removed so the
/// next `acquire` starts over instead of waiting on a dead channel.
struct PendingConstruction {
    state: Arc<Mutex<CacheState>>,
    model: String,
    tx: Option<watch::Sender<ConstructionOutcome>>,
}

impl PendingConstruction {
    fn publish(mut self, outcome: Result<EngineHandle, EngineConstructionError>) {
        if let Some(tx) = self.tx.take() {
            tx.send_replace(Some(outcome));
        }
    }
}

impl Drop for PendingConstruction {
    fn drop(&mut self) {
        if self.tx.is_none() {
            return;
        }

        let mut state = lock(&self.state);
        if matches!(state.slots.get(&self.model), Some(Slot::Loading(_))) {
            state.slots.remove(&self.model);
            tracing::warn!("Construction of '{}' was interrupted", self.model);
        }
    }
}

/// Bounded LRU cache of engines with single-flight construction per key.
pub struct EngineCache {
    registry: EngineRegistry,
    loader: Arc<dyn EngineLoader>,
    capacity: usize,
    state: Arc<Mutex<CacheState>>,
}

impl EngineCache {
    /// Creates an empty cache. A capacity of zero is treated as one.
    pub fn new(registry: EngineRegistry, loader: Arc<dyn EngineLoader>, capacity: usize) -> Self {
        Self {
            registry,
            loader,
            capacity: capacity.max(1),
            state: Arc::new(Mutex::new(CacheState::default())),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn registry(&self) -> &EngineRegistry {
        &self.registry
    }

    /// Number of constructed engines currently held.
    pub fn len(&self) -> usize {
        lock(&self.state).ready_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a constructed engine for `model` is resident.
    pub fn contains(&self, model: &str) -> bool {
        matches!(lock(&self.state).slots.get(model), Some(Slot::Ready(_)))
    }

    /// Resident model identifiers, sorted.
    pub fn loaded_models(&self) -> Vec<String> {
        let state = lock(&self.state);
        let mut names: Vec<String> = state
            .slots
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Ready(_)))
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Returns the engine for `model`, constructing it on a miss.
    ///
    /// Concurrent callers for the same identifier share one construction and
    /// all observe its outcome. A failed construction is not cached.
    pub async fn acquire(&self, model: &str) -> Result<EngineHandle, EngineConstructionError> {
        let mut construction = {
            let mut state = lock(&self.state);
            let tick = state.tick();

            match state.slots.get_mut(model) {
                Some(Slot::Ready(entry)) => {
                    entry.last_used = tick;
                    let handle = entry.handle.clone();
                    let evicted = state.evict_over(self.capacity);
                    drop(state);
                    drop(evicted);
                    tracing::debug!("Engine cache hit: {}", model);
                    return Ok(handle);
                }
                Some(Slot::Loading(rx)) => {
                    tracing::debug!("Waiting for in-flight construction: {}", model);
                    rx.clone()
                }
                None => {
                    let spec = self.registry.get(model).cloned().ok_or_else(|| {
                        EngineConstructionError::new(
                            model,
                            EngineError::ModelNotFound(format!(
                                "'{model}' is not a registered model"
                            )),
                        )
                    })?;
                    let (tx, rx) = watch::channel(None);
                    state
                        .slots
                        .insert(model.to_string(), Slot::Loading(rx.clone()));
                    drop(state);
                    self.spawn_construction(spec, tx);
                    rx
                }
            }
        };

        let outcome = construction
            .wait_for(Option::is_some)
            .await
            .map(|outcome| outcome.clone());

        match outcome {
            Ok(Some(result)) => result,
            _ => Err(EngineConstructionError::new(
                model,
                EngineError::WorkerError("engine construction was abandoned".to_string()),
            )),
        }
    }

    fn spawn_construction(
        &self,
        spec: ModelSpec,
        tx: watch::Sender<ConstructionOutcome>,
    ) {
        let state = Arc::clone(&self.state);
        let loader = Arc::clone(&self.loader);
        let capacity = self.capacity;
        let guard = PendingConstruction {
            state: Arc::clone(&state),
            model: spec.name.clone(),
            tx: Some(tx),
        };

        tokio::spawn(async move {
            let name = spec.name.clone();
            let started = Instant::now();
            tracing::info!("Loading model: {}", name);

            let result = match tokio::task::spawn_blocking(move || loader.load(&spec)).await {
                Ok(result) => result,
                Err(e) => Err(EngineError::WorkerError(format!(
                    "engine loader panicked: {e}"
                ))),
            };

            let (outcome, evicted) = {
                let mut state = lock(&state);
                match result {
                    Ok(engine) => {
                        state.next_instance += 1;
                        let instance_id = state.next_instance;
                        let last_used = state.tick();
                        let handle = Arc::new(LoadedEngine::new(name.clone(), instance_id, engine));
                        state.slots.insert(
                            name.clone(),
                            Slot::Ready(CacheEntry {
                                handle: handle.clone(),
                                last_used,
                            }),
                        );
                        let evicted = state.evict_over(capacity);
                        (Ok(handle), evicted)
                    }
                    Err(source) => {
                        state.slots.remove(&name);
                        (Err(EngineConstructionError::new(name.clone(), source)), Vec::new())
                    }
                }
            };
            drop(evicted);

            match &outcome {
                Ok(_) => tracing::info!(
                    "Model loaded successfully: {} ({:.2?})",
                    name,
                    started.elapsed()
                ),
                Err(e) => tracing::error!("{}", e),
            }

            guard.publish(outcome);
        });
    }

    /// Best-effort warm-up. Each identifier is acquired in turn; failures are
    /// logged and skipped. Returns the identifiers that loaded.
    pub async fn preload(&self, models: &[String]) -> Vec<String> {
        let mut loaded = Vec::new();

        for model in models {
            match self.acquire(model).await {
                Ok(_) => loaded.push(model.clone()),
                Err(e) => {
                    tracing::warn!("Preload failed, will load on demand: {}", e);
                }
            }
        }

        tracing::info!("Model preloading complete: {}/{} loaded", loaded.len(), models.len());
        loaded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::testing::FakeLoader;
    use std::time::Duration;

    fn registry(names: &[&str]) -> EngineRegistry {
        EngineRegistry::new(
            names
                .iter()
                .map(|n| ModelSpec::new(*n, format!("{n} model")))
                .collect(),
        )
    }

    fn cache(names: &[&str], loader: &Arc<FakeLoader>, capacity: usize) -> EngineCache {
        EngineCache::new(registry(names), loader.clone(), capacity)
    }

    #[tokio::test]
    async fn test_repeated_acquire_constructs_once() {
        let loader = Arc::new(FakeLoader::new());
        let cache = cache(&["a", "b"], &loader, 5);

        let first = cache.acquire("a").await.unwrap();
        let second = cache.acquire("a").await.unwrap();
        let third = cache.acquire("a").await.unwrap();

        assert_eq!(first.instance_id(), second.instance_id());
        assert!(Arc::ptr_eq(&first, &third));
        assert_eq!(loader.loads("a"), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_first_access_constructs_once() {
        let loader = Arc::new(FakeLoader::new().with_load_delay(Duration::from_millis(100)));
        let cache = Arc::new(cache(&["a"], &loader, 5));

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let cache = cache.clone();
            tasks.push(tokio::spawn(async move { cache.acquire("a").await }));
        }

        let mut ids = Vec::new();
        for task in tasks {
            ids.push(task.await.unwrap().unwrap().instance_id());
        }

        assert_eq!(loader.loads("a"), 1);
        assert!(ids.iter().all(|id| *id == ids[0]));
    }

    #[tokio::test]
    async fn test_lru_eviction_when_over_capacity() {
        let loader = Arc::new(FakeLoader::new());
        let cache = cache(&["a", "b", "c"], &loader, 2);

        drop(cache.acquire("a").await.unwrap());
        drop(cache.acquire("b").await.unwrap());
        // Touch "a" so "b" becomes least recently used.
        drop(cache.acquire("a").await.unwrap());
        drop(cache.acquire("c").await.unwrap());

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.loaded_models(), vec!["a".to_string(), "c".to_string()]);

        // "b" was evicted, so it is constructed again.
        drop(cache.acquire("b").await.unwrap());
        assert_eq!(loader.loads("b"), 2);
        assert_eq!(loader.loads("a"), 1);
    }

    #[tokio::test]
    async fn test_in_use_entry_is_not_evicted() {
        let loader = Arc::new(FakeLoader::new());
        let cache = cache(&["a", "b", "c"], &loader, 1);

        let held = cache.acquire("a").await.unwrap();
        drop(cache.acquire("b").await.unwrap());

        // Both entries were in use when "b" was inserted.
        assert!(cache.contains("a"));
        assert!(cache.contains("b"));

        drop(cache.acquire("c").await.unwrap());
        assert!(cache.contains("a"));
        assert!(!cache.contains("b"));
        assert_eq!(loader.released("b"), 1);

        drop(held);
        // Releasing "a" and hitting "c" trims back to capacity.
        drop(cache.acquire("c").await.unwrap());
        assert_eq!(cache.len(), 1);
        assert!(cache.contains("c"));
    }

    #[tokio::test]
    async fn test_evicted_engine_is_released() {
        let loader = Arc::new(FakeLoader::new());
        let cache = cache(&["a", "b"], &loader, 1);

        drop(cache.acquire("a").await.unwrap());
        assert_eq!(loader.released("a"), 0);
        drop(cache.acquire("b").await.unwrap());
        assert_eq!(loader.released("a"), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_construction_failure_shared_and_not_cached() {
        let loader = Arc::new(FakeLoader::new().failing_loads("a", 1).gated("a"));
        let cache = cache(&["a"], &loader, 5);

        let opener = {
            let loader = loader.clone();
            tokio::spawn(async move {
                loader.wait_until_loading("a").await;
                tokio::time::sleep(Duration::from_millis(50)).await;
                loader.open_gate("a");
            })
        };
        let results = futures::future::join_all((0..4).map(|_| cache.acquire("a"))).await;
        opener.await.unwrap();

        for result in results {
            let err = result.unwrap_err();
            assert_eq!(err.model, "a");
            assert!(err.to_string().contains("Failed to load model 'a'"));
        }
        assert_eq!(loader.loads("a"), 1);
        assert!(!cache.contains("a"));

        // The next independent request retries.
        assert!(cache.acquire("a").await.is_ok());
        assert_eq!(loader.loads("a"), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_other_keys_not_blocked_by_construction() {
        let loader = Arc::new(FakeLoader::new().gated("slow"));
        let cache = Arc::new(cache(&["slow", "fast"], &loader, 5));

        let slow = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.acquire("slow").await })
        };
        loader.wait_until_loading("slow").await;

        let fast = tokio::time::timeout(Duration::from_secs(5), cache.acquire("fast")).await;
        assert!(fast.expect("fast model blocked by slow construction").is_ok());
        assert!(!slow.is_finished());

        loader.open_gate("slow");
        assert!(slow.await.unwrap().is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_abandoned_waiter_still_caches_engine() {
        let loader = Arc::new(FakeLoader::new().gated("a"));
        let cache = Arc::new(cache(&["a"], &loader, 5));

        let waiter = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.acquire("a").await })
        };
        loader.wait_until_loading("a").await;
        waiter.abort();
        let _ = waiter.await;

        loader.open_gate("a");
        let handle = cache.acquire("a").await.unwrap();
        assert_eq!(handle.model(), "a");
        assert_eq!(loader.loads("a"), 1);
    }

    #[test]
    fn test_interrupted_construction_is_retried() {
        let loader = Arc::new(FakeLoader::new().gated("a"));
        let cache = Arc::new(cache(&["a"], &loader, 5));

        let first = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        first.block_on(async {
            let waiter = {
                let cache = cache.clone();
                tokio::spawn(async move { cache.acquire("a").await })
            };
            loader.wait_until_loading("a").await;
            waiter.abort();
        });
        // Drops the construction task while its load is still blocked.
        first.shutdown_background();
        loader.open_gate("a");

        let second = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let handle = second.block_on(cache.acquire("a")).unwrap();
        assert_eq!(handle.model(), "a");
        assert!(cache.contains("a"));
    }

    #[tokio::test]
    async fn test_unknown_identifier_is_rejected() {
        let loader = Arc::new(FakeLoader::new());
        let cache = cache(&["a"], &loader, 5);

        let err = cache.acquire("zzz").await.unwrap_err();
        assert!(matches!(err.source, EngineError::ModelNotFound(_)));
        assert_eq!(loader.total_loads(), 0);
    }

    #[tokio::test]
    async fn test_preload_tolerates_failures() {
        let loader = Arc::new(FakeLoader::new().failing_loads("b", usize::MAX));
        let cache = cache(&["a", "b", "c"], &loader, 5);

        let loaded = cache
            .preload(&["a".to_string(), "b".to_string(), "c".to_string()])
            .await;

        assert_eq!(loaded, vec!["a".to_string(), "c".to_string()]);
        assert!(cache.contains("a"));
        assert!(!cache.contains("b"));
        assert!(cache.contains("c"));
    }

    #[tokio::test]
    async fn test_capacity_zero_is_one() {
        let loader = Arc::new(FakeLoader::new());
        let cache = cache(&["a"], &loader, 0);
        assert_eq!(cache.capacity(), 1);
    }
}
