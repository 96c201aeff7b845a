use crate::cache::{CacheMode, IdentityCache, ReferenceRegistry};
use crate::error::Result;
use crate::logic::assembly::{AssemblyStats, TreeAssembler};
use crate::logic::resolve::{OverrideResolver, ResolvedValue};
use crate::model::{Attribute, DataSet, DataSetList, Id};
use crate::store::{RowQuery, RowSource};
use std::sync::Arc;

/// Builds [`DataSetListGraph`]s from a row source.
///
/// Each build gets its own cache scope in the configured mode, unless a
/// shared cache was supplied, in which case builds reuse whatever instances
/// are still alive in it.
#[derive(Clone)]
pub struct GraphBuilder {
    source: Arc<dyn RowSource>,
    mode: CacheMode,
    shared: Option<Arc<IdentityCache>>,
}

impl GraphBuilder {
    pub fn new(source: Arc<dyn RowSource>) -> Self {
        Self {
            source,
            mode: CacheMode::Strong,
            shared: None,
        }
    }

    pub fn with_cache_mode(mut self, mode: CacheMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_shared_cache(mut self, cache: Arc<IdentityCache>) -> Self {
        self.shared = Some(cache);
        self
    }

    pub fn cache_mode(&self) -> CacheMode {
        self.shared.as_ref().map_or(self.mode, |cache| cache.mode())
    }

    fn scope(&self) -> Arc<IdentityCache> {
        match &self.shared {
            Some(cache) => cache.clone(),
            None => Arc::new(IdentityCache::new(self.mode)),
        }
    }

    /// Full graph of one list; `None` when the list does not exist
    pub fn build(&self, data_set_list_id: &Id) -> Result<Option<DataSetListGraph>> {
        self.build_query(&RowQuery::list(*data_set_list_id))
    }

    pub fn build_query(&self, query: &RowQuery) -> Result<Option<DataSetListGraph>> {
        let registry = ReferenceRegistry::new(self.scope(), self.source.clone());
        let stream = self.source.open(query)?;
        let (root, stats) = TreeAssembler::new(&registry, query.data_set_list_id).assemble_with_stats(stream)?;
        Ok(root.map(|root| DataSetListGraph { root, registry, stats }))
    }
}

impl std::fmt::Debug for GraphBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphBuilder")
            .field("mode", &self.cache_mode())
            .field("shared", &self.shared.is_some())
            .finish()
    }
}

/// One assembled list plus every foreign list its references reached.
/// Objects stay alive as long as the graph does.
#[derive(Debug)]
pub struct DataSetListGraph {
    root: Arc<DataSetList>,
    registry: Arc<ReferenceRegistry>,
    stats: AssemblyStats,
}

impl DataSetListGraph {
    pub fn root(&self) -> &Arc<DataSetList> {
        &self.root
    }

    pub fn stats(&self) -> AssemblyStats {
        self.stats
    }

    pub fn cache(&self) -> &Arc<IdentityCache> {
        self.registry.cache()
    }

    pub fn data_set(&self, id: &Id) -> Option<Arc<DataSet>> {
        self.root.data_set(id)
    }

    pub fn data_set_by_name(&self, name: &str) -> Option<Arc<DataSet>> {
        self.root.data_set_by_name(name)
    }

    /// Lists pulled in so far, the root included
    pub fn loaded_lists(&self) -> Vec<Arc<DataSetList>> {
        self.registry.lists()
    }

    /// Find an attribute of any list loaded into this graph
    pub fn attribute(&self, id: &Id) -> Option<Arc<Attribute>> {
        self.registry.lists().iter().find_map(|list| list.attribute(id))
    }

    /// Effective value of `target` reached from row `data_set_id` through `chain`
    pub fn resolve(&self, data_set_id: &Id, target: &Id, chain: &[Id]) -> Result<Option<ResolvedValue>> {
        match self.data_set(data_set_id) {
            Some(start) => OverrideResolver::new(target, chain).resolve(&start).map(Some),
            None => Ok(None),
        }
    }

    /// Resolve a path spelled with attribute names, starting at the root list
    pub fn resolve_by_name(&self, data_set: &str, chain: &[&str], target: &str) -> Result<Option<ResolvedValue>> {
        let Some(start) = self.data_set_by_name(data_set) else {
            return Ok(None);
        };

        let mut list = self.root.clone();
        let mut hops = Vec::with_capacity(chain.len());
        for name in chain {
            let Some(hop) = list.attribute_by_name(name) else {
                return Ok(None);
            };
            let Some(next) = hop.reference_list()? else {
                return Ok(None);
            };
            hops.push(hop.id);
            list = next;
        }
        let Some(target) = list.attribute_by_name(target) else {
            return Ok(None);
        };

        OverrideResolver::new(&target.id, &hops).resolve(&start).map(Some)
    }
}
