use crate::error::{DataSetError, Result};
use crate::model::{EntityKind, Id, Identified};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

pub type CacheKey = (EntityKind, Id);

type Entry = Arc<dyn Any + Send + Sync>;

/// Number of weak entries after which dead ones are first swept on insert
const WEAK_SWEEP_THRESHOLD: usize = 1024;

/// Memoisation policy of one build scope
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheMode {
    /// Every lookup misses; loaders always run
    Disabled,
    /// Entries live as long as the cache
    #[default]
    Strong,
    /// Entries live as long as somebody else holds them
    Weak,
}

impl std::str::FromStr for CacheMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "disabled" => Ok(CacheMode::Disabled),
            "strong" => Ok(CacheMode::Strong),
            "weak" => Ok(CacheMode::Weak),
            other => Err(format!("unknown cache mode: {}", other)),
        }
    }
}

/// Storage behaviour behind an [`IdentityCache`]
pub trait CachePolicy: Send + Sync {
    fn mode(&self) -> CacheMode;

    fn lookup(&self, key: &CacheKey) -> Option<Entry>;

    /// Store `value` unless a live entry already exists; returns whichever wins
    fn store(&self, key: CacheKey, value: Entry) -> Entry;

    fn clear(&self);

    fn len(&self) -> usize;
}

#[derive(Debug, Default)]
pub struct DisabledPolicy;

impl CachePolicy for DisabledPolicy {
    fn mode(&self) -> CacheMode {
        CacheMode::Disabled
    }

    fn lookup(&self, _key: &CacheKey) -> Option<Entry> {
        None
    }

    fn store(&self, _key: CacheKey, value: Entry) -> Entry {
        value
    }

    fn clear(&self) {}

    fn len(&self) -> usize {
        0
    }
}

#[derive(Default)]
pub struct StrongPolicy {
    entries: Mutex<HashMap<CacheKey, Entry>>,
}

impl CachePolicy for StrongPolicy {
    fn mode(&self) -> CacheMode {
        CacheMode::Strong
    }

    fn lookup(&self, key: &CacheKey) -> Option<Entry> {
        self.entries.lock().get(key).cloned()
    }

    fn store(&self, key: CacheKey, value: Entry) -> Entry {
        self.entries.lock().entry(key).or_insert(value).clone()
    }

    fn clear(&self) {
        self.entries.lock().clear();
    }

    fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

/// Shared across concurrent requests; only map-level locking is needed.
pub struct WeakPolicy {
    entries: RwLock<WeakEntries>,
}

struct WeakEntries {
    map: HashMap<CacheKey, Weak<dyn Any + Send + Sync>>,
    /// Size that triggers the next sweep; doubles with the live set
    sweep_at: usize,
}

impl Default for WeakPolicy {
    fn default() -> Self {
        Self {
            entries: RwLock::new(WeakEntries {
                map: HashMap::new(),
                sweep_at: WEAK_SWEEP_THRESHOLD,
            }),
        }
    }
}

impl CachePolicy for WeakPolicy {
    fn mode(&self) -> CacheMode {
        CacheMode::Weak
    }

    fn lookup(&self, key: &CacheKey) -> Option<Entry> {
        self.entries.read().map.get(key).and_then(Weak::upgrade)
    }

    fn store(&self, key: CacheKey, value: Entry) -> Entry {
        let mut entries = self.entries.write();
        if let Some(existing) = entries.map.get(&key).and_then(Weak::upgrade) {
            return existing;
        }
        if entries.map.len() >= entries.sweep_at {
            entries.map.retain(|_, weak| weak.strong_count() > 0);
            entries.sweep_at = (entries.map.len() * 2).max(WEAK_SWEEP_THRESHOLD);
        }
        entries.map.insert(key, Arc::downgrade(&value));
        value
    }

    fn clear(&self) {
        let mut entries = self.entries.write();
        entries.map.clear();
        entries.sweep_at = WEAK_SWEEP_THRESHOLD;
    }

    fn len(&self) -> usize {
        self.entries
            .read()
            .map
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }
}

/// Maps (kind, id) to the one instance built for it in the current scope
pub struct IdentityCache {
    policy: Box<dyn CachePolicy>,
}

impl IdentityCache {
    pub fn new(mode: CacheMode) -> Self {
        let policy: Box<dyn CachePolicy> = match mode {
            CacheMode::Disabled => Box::new(DisabledPolicy),
            CacheMode::Strong => Box::<StrongPolicy>::default(),
            CacheMode::Weak => Box::<WeakPolicy>::default(),
        };
        Self { policy }
    }

    pub fn with_policy(policy: Box<dyn CachePolicy>) -> Self {
        Self { policy }
    }

    pub fn mode(&self) -> CacheMode {
        self.policy.mode()
    }

    pub fn get<T: Identified>(&self, id: &Id) -> Option<Arc<T>> {
        self.policy
            .lookup(&(T::KIND, *id))
            .and_then(|entry| entry.downcast::<T>().ok())
    }

    /// Insert `value`, returning the canonical instance for its id
    pub fn put<T: Identified>(&self, value: Arc<T>) -> Arc<T> {
        let key = (T::KIND, value.id());
        let entry: Entry = value.clone();
        self.policy.store(key, entry).downcast::<T>().unwrap_or(value)
    }

    /// Return the cached instance or build it with `loader`.
    /// The loader is expected to be total; returning `None` is a contract
    /// violation.
    pub fn compute_if_absent<T, F>(&self, id: &Id, loader: F) -> Result<Arc<T>>
    where
        T: Identified,
        F: FnOnce() -> Result<Option<Arc<T>>>,
    {
        self.try_compute_if_absent(id, loader)?
            .ok_or(DataSetError::CacheContractViolation { kind: T::KIND, id: *id })
    }

    /// Like [`compute_if_absent`](Self::compute_if_absent) but the loader may
    /// come back empty, in which case nothing is stored.
    pub fn try_compute_if_absent<T, F>(&self, id: &Id, loader: F) -> Result<Option<Arc<T>>>
    where
        T: Identified,
        F: FnOnce() -> Result<Option<Arc<T>>>,
    {
        if let Some(hit) = self.get::<T>(id) {
            log::debug!("identity cache hit: {} {}", T::KIND, id);
            return Ok(Some(hit));
        }

        // The loader may re-enter the cache, so no lock is held here
        Ok(loader()?.map(|value| self.put(value)))
    }

    pub fn clear(&self) {
        self.policy.clear();
    }

    pub fn len(&self) -> usize {
        self.policy.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for IdentityCache {
    fn default() -> Self {
        Self::new(CacheMode::default())
    }
}

impl std::fmt::Debug for IdentityCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityCache")
            .field("mode", &self.mode())
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{generate_id, ListValue};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn list_value(id: Id, text: &str) -> Arc<ListValue> {
        Arc::new(ListValue {
            id,
            attribute_id: generate_id(),
            text: text.to_string(),
        })
    }

    #[test]
    fn test_strong_compute_if_absent_is_idempotent() {
        let cache = IdentityCache::new(CacheMode::Strong);
        let id = generate_id();
        let calls = AtomicUsize::new(0);

        let load = || {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(Some(list_value(id, "red")))
        };
        let first = cache.compute_if_absent(&id, load).unwrap();
        let second = cache
            .compute_if_absent(&id, || {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(Some(list_value(id, "red")))
            })
            .unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_disabled_always_invokes_loader() {
        let cache = IdentityCache::new(CacheMode::Disabled);
        let id = generate_id();
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            cache
                .compute_if_absent(&id, || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(Some(list_value(id, "red")))
                })
                .unwrap();
        }

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(cache.get::<ListValue>(&id).is_none());
    }

    #[test]
    fn test_empty_loader_violates_contract() {
        let cache = IdentityCache::new(CacheMode::Strong);
        let id = generate_id();

        let result = cache.compute_if_absent::<ListValue, _>(&id, || Ok(None));
        assert!(matches!(
            result,
            Err(DataSetError::CacheContractViolation { kind: EntityKind::ListValue, .. })
        ));
    }

    #[test]
    fn test_try_compute_stores_nothing_on_empty() {
        let cache = IdentityCache::new(CacheMode::Strong);
        let id = generate_id();

        let result = cache.try_compute_if_absent::<ListValue, _>(&id, || Ok(None)).unwrap();
        assert!(result.is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_weak_entry_evicted_when_unreferenced() {
        let cache = IdentityCache::new(CacheMode::Weak);
        let id = generate_id();

        let held = cache.put(list_value(id, "red"));
        assert!(cache.get::<ListValue>(&id).is_some());

        drop(held);
        assert!(cache.get::<ListValue>(&id).is_none());
    }

    #[test]
    fn test_put_keeps_first_instance() {
        let cache = IdentityCache::new(CacheMode::Strong);
        let id = generate_id();

        let first = cache.put(list_value(id, "red"));
        let second = cache.put(list_value(id, "blue"));

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.text, "red");
    }

    #[test]
    fn test_weak_cache_concurrent_access() {
        let cache = Arc::new(IdentityCache::new(CacheMode::Weak));
        let ids: Vec<Id> = (0..16).map(|_| generate_id()).collect();
        let keep: Vec<Arc<ListValue>> = ids.iter().map(|id| list_value(*id, "v")).collect();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let cache = cache.clone();
                let keep = keep.clone();
                std::thread::spawn(move || {
                    for value in &keep {
                        let canonical = cache.put(value.clone());
                        assert_eq!(canonical.id, value.id);
                        assert!(cache.get::<ListValue>(&value.id).is_some());
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(cache.len(), ids.len());
    }
}
