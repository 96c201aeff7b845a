use crate::cache::{IdentityCache, LazyRef};
use crate::error::Result;
use crate::logic::assembly::TreeAssembler;
use crate::model::{Attribute, DataSet, DataSetList, Id};
use crate::store::RowSource;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

/// Rows asked for in one foreign list, and which of them were already fetched
#[derive(Debug, Default)]
struct Demand {
    requested: HashSet<Id>,
    loaded: HashSet<Id>,
    attributes_loaded: bool,
}

/// Per-build registry of foreign rows that reference attributes point at.
///
/// Assembly only records demand. The first dereference of a handle into a
/// foreign list loads every row demanded from that list so far in a single
/// batch, so N references into one list cost one fetch. Every list loaded
/// into the build is pinned here and lives as long as the registry.
pub struct ReferenceRegistry {
    cache: Arc<IdentityCache>,
    source: Arc<dyn RowSource>,
    demands: Mutex<HashMap<Id, Demand>>,
    pinned: Mutex<HashMap<Id, Arc<DataSetList>>>,
    this: Weak<ReferenceRegistry>,
}

impl ReferenceRegistry {
    pub fn new(cache: Arc<IdentityCache>, source: Arc<dyn RowSource>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            cache,
            source,
            demands: Mutex::new(HashMap::new()),
            pinned: Mutex::new(HashMap::new()),
            this: this.clone(),
        })
    }

    pub fn cache(&self) -> &Arc<IdentityCache> {
        &self.cache
    }

    pub fn demand_row(&self, data_set_list_id: Id, data_set_id: Id) {
        self.demands
            .lock()
            .entry(data_set_list_id)
            .or_default()
            .requested
            .insert(data_set_id);
    }

    /// Record that a row has been materialized; it will not be fetched again
    pub fn note_loaded(&self, data_set_list_id: Id, data_set_id: Id) {
        let mut demands = self.demands.lock();
        let demand = demands.entry(data_set_list_id).or_default();
        demand.requested.insert(data_set_id);
        demand.loaded.insert(data_set_id);
    }

    /// Number of rows still waiting for a batch load in `data_set_list_id`
    pub fn pending(&self, data_set_list_id: &Id) -> usize {
        self.demands
            .lock()
            .get(data_set_list_id)
            .map_or(0, |demand| demand.requested.difference(&demand.loaded).count())
    }

    pub fn pin(&self, list: Arc<DataSetList>) {
        self.pinned.lock().entry(list.id).or_insert(list);
    }

    pub fn pinned(&self, data_set_list_id: &Id) -> Option<Arc<DataSetList>> {
        self.pinned.lock().get(data_set_list_id).cloned()
    }

    /// Every list loaded into this build
    pub fn lists(&self) -> Vec<Arc<DataSetList>> {
        self.pinned.lock().values().cloned().collect()
    }

    fn scope(&self) -> ResolverScope {
        ResolverScope {
            registry: self.this.clone(),
            cache: Arc::downgrade(&self.cache),
            source: self.source.clone(),
        }
    }

    /// Lazy handle on a list, resolved through this registry
    pub fn list_ref(&self, data_set_list_id: Id) -> LazyRef<DataSetList> {
        let scope = self.scope();
        LazyRef::new(
            data_set_list_id,
            Arc::new(move |id: &Id| match scope.registry() {
                Some(registry) => registry.provide_schema(id),
                None => Ok(None),
            }),
        )
    }

    /// Lazy handle on a row of `data_set_list_id`, resolved through this registry
    pub fn row_ref(&self, data_set_list_id: Id, data_set_id: Id) -> LazyRef<DataSet> {
        let scope = self.scope();
        LazyRef::new(
            data_set_id,
            Arc::new(move |id: &Id| match scope.registry() {
                Some(registry) => registry.provide_row(&data_set_list_id, id),
                None => {
                    log::debug!("graph dropped before data set {} was resolved", id);
                    Ok(None)
                }
            }),
        )
    }

    pub fn provide_row(&self, data_set_list_id: &Id, data_set_id: &Id) -> Result<Option<Arc<DataSet>>> {
        if let Some(row) = self.cache.get::<DataSet>(data_set_id) {
            return Ok(Some(row));
        }
        if let Some(row) = self.pinned(data_set_list_id).and_then(|list| list.data_set(data_set_id)) {
            return Ok(Some(row));
        }

        self.demand_row(*data_set_list_id, *data_set_id);
        Ok(self
            .batch_load(data_set_list_id)?
            .and_then(|list| list.data_set(data_set_id)))
    }

    pub fn provide_schema(&self, data_set_list_id: &Id) -> Result<Option<Arc<DataSetList>>> {
        if let Some(list) = self.cache.get::<DataSetList>(data_set_list_id) {
            self.pin(list.clone());
            return Ok(Some(list));
        }
        if let Some(list) = self.pinned(data_set_list_id) {
            return Ok(Some(list));
        }
        self.batch_load(data_set_list_id)
    }

    pub fn provide_attribute(&self, data_set_list_id: &Id, attribute_id: &Id) -> Result<Option<Arc<Attribute>>> {
        if let Some(attribute) = self.cache.get::<Attribute>(attribute_id) {
            return Ok(Some(attribute));
        }
        if let Some(attribute) = self.pinned(data_set_list_id).and_then(|list| list.attribute(attribute_id)) {
            return Ok(Some(attribute));
        }
        Ok(self
            .batch_load(data_set_list_id)?
            .and_then(|list| list.attribute(attribute_id)))
    }

    /// Fetch every demanded but unloaded row of one list in a single stream.
    /// Ids are marked loaded before assembly starts, so a reference cycle
    /// back into the same list ends at the pinned copy instead of recursing.
    fn batch_load(&self, data_set_list_id: &Id) -> Result<Option<Arc<DataSetList>>> {
        let pending = {
            let mut demands = self.demands.lock();
            let demand = demands.entry(*data_set_list_id).or_default();
            let pending: Vec<Id> = demand.requested.difference(&demand.loaded).copied().collect();
            if pending.is_empty() && demand.attributes_loaded {
                None
            } else {
                demand.loaded.extend(pending.iter().copied());
                demand.attributes_loaded = true;
                Some(pending)
            }
        };
        let Some(pending) = pending else {
            return Ok(self.pinned(data_set_list_id));
        };

        log::debug!(
            "batch loading {} data sets of data set list {}",
            pending.len(),
            data_set_list_id
        );
        let stream = self.source.open_batch(data_set_list_id, &pending)?;
        let loaded = TreeAssembler::new(self, *data_set_list_id).assemble(stream)?;
        Ok(loaded.or_else(|| self.pinned(data_set_list_id)))
    }
}

/// What a lazy handle needs to resolve. Objects reused from a shared cache
/// can outlive the build that created them; their handles then resolve
/// through a fresh registry over the same cache, as long as it is alive.
struct ResolverScope {
    registry: Weak<ReferenceRegistry>,
    cache: Weak<IdentityCache>,
    source: Arc<dyn RowSource>,
}

impl ResolverScope {
    fn registry(&self) -> Option<Arc<ReferenceRegistry>> {
        if let Some(registry) = self.registry.upgrade() {
            return Some(registry);
        }
        let cache = self.cache.upgrade()?;
        log::debug!("build scope dropped, resolving through a fresh registry");
        Some(ReferenceRegistry::new(cache, self.source.clone()))
    }
}

impl std::fmt::Debug for ReferenceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReferenceRegistry")
            .field("cache", &self.cache)
            .field("lists", &self.pinned.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheMode;
    use crate::model::generate_id;
    use crate::store::{FlatRow, RowQuery, RowStream};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts opened streams and returns nothing
    #[derive(Default)]
    struct CountingSource {
        opened: AtomicUsize,
        last_batch: Mutex<Vec<Id>>,
    }

    impl RowSource for CountingSource {
        fn open(&self, query: &RowQuery) -> Result<RowStream> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            *self.last_batch.lock() = query.data_set_ids.clone().unwrap_or_default();
            Ok(RowStream::from_rows(Vec::<FlatRow>::new()))
        }
    }

    fn registry(source: Arc<CountingSource>) -> Arc<ReferenceRegistry> {
        ReferenceRegistry::new(Arc::new(IdentityCache::new(CacheMode::Strong)), source)
    }

    #[test]
    fn test_demand_accumulates_into_one_batch() {
        let source = Arc::new(CountingSource::default());
        let registry = registry(source.clone());
        let list = generate_id();
        let (a, b) = (generate_id(), generate_id());

        registry.demand_row(list, a);
        registry.demand_row(list, b);
        assert_eq!(registry.pending(&list), 2);

        assert!(registry.provide_row(&list, &a).unwrap().is_none());
        assert_eq!(source.opened.load(Ordering::SeqCst), 1);
        let mut batch = source.last_batch.lock().clone();
        batch.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(batch, expected);

        // b was part of that batch; asking again does not refetch
        assert!(registry.provide_row(&list, &b).unwrap().is_none());
        assert_eq!(source.opened.load(Ordering::SeqCst), 1);
        assert_eq!(registry.pending(&list), 0);
    }

    #[test]
    fn test_loaded_rows_are_not_demanded_again() {
        let source = Arc::new(CountingSource::default());
        let registry = registry(source.clone());
        let list = generate_id();
        let row = generate_id();

        registry.note_loaded(list, row);
        registry.demand_row(list, row);
        assert_eq!(registry.pending(&list), 0);
    }

    #[test]
    fn test_shared_cache_outlives_registry() {
        let source = Arc::new(CountingSource::default());
        let cache = Arc::new(IdentityCache::new(CacheMode::Weak));
        let registry = ReferenceRegistry::new(cache.clone(), source.clone());
        let handle = registry.row_ref(generate_id(), generate_id());

        drop(registry);
        assert!(handle.get().unwrap().is_none());
        assert_eq!(source.opened.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dropped_registry_leaves_handles_empty() {
        let source = Arc::new(CountingSource::default());
        let registry = registry(source.clone());
        let handle = registry.row_ref(generate_id(), generate_id());

        drop(registry);
        assert!(handle.get().unwrap().is_none());
        assert_eq!(source.opened.load(Ordering::SeqCst), 0);
    }
}
