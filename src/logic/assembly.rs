use crate::cache::{LazyRef, ReferenceRegistry};
use crate::error::{DataSetError, Result};
use crate::model::{
    Attribute, AttributeChain, AttributePath, AttributeType, DataSet, DataSetList, FileRef, Id, ListValue, Parameter,
    ParameterValue, VisibilityArea,
};
use crate::store::{AttributeColumns, DataSetColumns, FlatRow, ListValueColumns, ParameterColumns, PathColumns, RowStream};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AssemblyStats {
    pub rows: usize,
    pub skipped: usize,
}

/// Single-pass builder turning a sorted row stream into one linked
/// [`DataSetList`].
///
/// The first sighting of an id allocates the object (through the identity
/// cache), later sightings only attach children that were not seen yet.
/// Rows contradicting what is already known are logged and skipped.
///
/// Overrides whose target belongs to the root list but was left out of the
/// stream are replayed once the stream is released, so fetching the target
/// never opens a second stream on the list mid-assembly.
pub struct TreeAssembler<'a> {
    registry: &'a ReferenceRegistry,
    root_id: Id,
    root: Option<Arc<DataSetList>>,
    data_sets: HashMap<Id, Arc<DataSet>>,
    attributes: HashMap<Id, Arc<Attribute>>,
    list_values: HashMap<Id, Arc<ListValue>>,
    parameters: HashMap<Id, Arc<Parameter>>,
    paths: HashMap<Id, Arc<AttributePath>>,
    deferred: Vec<FlatRow>,
    drained: bool,
    stats: AssemblyStats,
}

impl<'a> TreeAssembler<'a> {
    pub fn new(registry: &'a ReferenceRegistry, root_id: Id) -> Self {
        Self {
            registry,
            root_id,
            root: None,
            data_sets: HashMap::new(),
            attributes: HashMap::new(),
            list_values: HashMap::new(),
            parameters: HashMap::new(),
            paths: HashMap::new(),
            deferred: Vec::new(),
            drained: false,
            stats: AssemblyStats::default(),
        }
    }

    /// Consume `stream` and return the assembled list, or `None` when the
    /// stream held no row for it. The stream is released on every exit.
    pub fn assemble(self, stream: RowStream) -> Result<Option<Arc<DataSetList>>> {
        self.assemble_with_stats(stream).map(|(root, _)| root)
    }

    pub fn assemble_with_stats(mut self, mut stream: RowStream) -> Result<(Option<Arc<DataSetList>>, AssemblyStats)> {
        for row in stream.by_ref() {
            let row = row?;
            self.stats.rows += 1;
            self.take(&row)?;
        }
        stream.close();

        self.drained = true;
        for row in std::mem::take(&mut self.deferred) {
            self.take(&row)?;
        }

        log::debug!(
            "assembled data set list {}: {} rows, {} skipped, {} data sets, {} attributes",
            self.root_id,
            self.stats.rows,
            self.stats.skipped,
            self.data_sets.len(),
            self.attributes.len()
        );
        Ok((self.root, self.stats))
    }

    fn take(&mut self, row: &FlatRow) -> Result<()> {
        match self.accept(row) {
            Ok(()) => Ok(()),
            Err(DataSetError::InconsistentGraph(reason)) => {
                self.stats.skipped += 1;
                log::warn!("skipping row of data set list {}: {}", row.data_set_list_id, reason);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    fn accept(&mut self, row: &FlatRow) -> Result<()> {
        let list = self.list(row)?;

        let Some(data_set_cols) = &row.data_set else {
            // Schema-only rows describe attributes of a list without selected rows
            if let Some(attribute_cols) = &row.attribute {
                let attribute = self.attribute(&list, attribute_cols)?;
                self.list_value(&attribute, row.list_value.as_ref())?;
            }
            return Ok(());
        };
        let data_set = self.data_set(&list, data_set_cols)?;

        if let Some(path_cols) = &row.path {
            if !self.drained && self.target_outside_stream(path_cols) {
                self.deferred.push(row.clone());
                return Ok(());
            }
            return self.override_parameter(&list, &data_set, path_cols, row.parameter.as_ref());
        }

        if let Some(attribute_cols) = &row.attribute {
            let attribute = self.attribute(&list, attribute_cols)?;
            self.list_value(&attribute, row.list_value.as_ref())?;
            if let Some(parameter_cols) = &row.parameter {
                self.direct_parameter(&data_set, &attribute, parameter_cols)?;
            }
        }
        Ok(())
    }

    fn list(&mut self, row: &FlatRow) -> Result<Arc<DataSetList>> {
        if let Some(root) = &self.root {
            if root.id == row.data_set_list_id {
                return Ok(root.clone());
            }
        }
        if row.data_set_list_id != self.root_id {
            return Err(DataSetError::inconsistent(format!(
                "row belongs to data set list {}, expected {}",
                row.data_set_list_id, self.root_id
            )));
        }

        let registry = self.registry;
        let list = match registry.pinned(&row.data_set_list_id) {
            Some(list) => list,
            None => registry.cache().compute_if_absent(&row.data_set_list_id, || {
                let area = registry.cache().compute_if_absent(&row.visibility_area_id, || {
                    Ok(Some(Arc::new(VisibilityArea {
                        id: row.visibility_area_id,
                        name: row.visibility_area_name.clone(),
                    })))
                })?;
                Ok(Some(Arc::new(DataSetList::new(
                    row.data_set_list_id,
                    row.data_set_list_name.clone(),
                    area,
                    row.test_plan_id,
                    crate::model::AuditInfo {
                        created_by: row.created_by.clone(),
                        created_when: row.created_when,
                        modified_by: row.modified_by.clone(),
                        modified_when: row.modified_when,
                    },
                ))))
            })?,
        };
        registry.pin(list.clone());
        self.root = Some(list.clone());
        Ok(list)
    }

    fn data_set(&mut self, list: &Arc<DataSetList>, cols: &DataSetColumns) -> Result<Arc<DataSet>> {
        if let Some(data_set) = self.data_sets.get(&cols.id) {
            return Ok(data_set.clone());
        }

        let data_set = match list.data_set(&cols.id) {
            Some(data_set) => data_set,
            None => self.registry.cache().compute_if_absent(&cols.id, || {
                Ok(Some(Arc::new(DataSet::new(
                    cols.id,
                    list.id,
                    cols.name.clone(),
                    cols.ordering,
                    cols.locked,
                ))))
            })?,
        };
        if data_set.data_set_list_id != list.id {
            return Err(DataSetError::inconsistent(format!(
                "data set {} is cached under data set list {}",
                data_set.id, data_set.data_set_list_id
            )));
        }

        list.attach_data_set(data_set.clone());
        self.registry.note_loaded(list.id, data_set.id);
        self.data_sets.insert(data_set.id, data_set.clone());
        Ok(data_set)
    }

    fn attribute(&mut self, list: &Arc<DataSetList>, cols: &AttributeColumns) -> Result<Arc<Attribute>> {
        if let Some(attribute) = self.attributes.get(&cols.id) {
            return Ok(attribute.clone());
        }

        let attribute = match list.attribute(&cols.id) {
            Some(attribute) => attribute,
            None => {
                let attribute_type: AttributeType = cols
                    .attribute_type
                    .parse()
                    .map_err(|err: DataSetError| DataSetError::inconsistent(err.to_string()))?;
                let registry = self.registry;
                registry.cache().compute_if_absent(&cols.id, || {
                    let reference = cols.reference_list_id.map(|list_id| registry.list_ref(list_id));
                    let attribute =
                        Attribute::new(cols.id, list.id, cols.name.clone(), cols.ordering, attribute_type, reference)
                            .map_err(|err| DataSetError::inconsistent(err.to_string()))?;
                    Ok(Some(Arc::new(attribute)))
                })?
            }
        };
        if attribute.data_set_list_id != list.id {
            return Err(DataSetError::inconsistent(format!(
                "attribute {} belongs to data set list {}",
                attribute.id, attribute.data_set_list_id
            )));
        }

        list.attach_attribute(attribute.clone());
        self.attributes.insert(attribute.id, attribute.clone());
        Ok(attribute)
    }

    fn list_value(&mut self, attribute: &Arc<Attribute>, cols: Option<&ListValueColumns>) -> Result<()> {
        let Some(cols) = cols else {
            return Ok(());
        };
        if self.list_values.contains_key(&cols.id) {
            return Ok(());
        }
        if attribute.attribute_type != AttributeType::List {
            return Err(DataSetError::inconsistent(format!(
                "list value {} offered for {} attribute '{}'",
                cols.id, attribute.attribute_type, attribute.name
            )));
        }

        let value = self.registry.cache().compute_if_absent(&cols.id, || {
            Ok(Some(Arc::new(ListValue {
                id: cols.id,
                attribute_id: attribute.id,
                text: cols.text.clone(),
            })))
        })?;
        attribute.attach_list_value(value.clone());
        self.list_values.insert(value.id, value);
        Ok(())
    }

    fn direct_parameter(
        &mut self,
        data_set: &Arc<DataSet>,
        attribute: &Arc<Attribute>,
        cols: &ParameterColumns,
    ) -> Result<()> {
        // List-value fan-out repeats the same parameter once per option
        if self.parameters.contains_key(&cols.id) || data_set.has_parameter(&cols.id) {
            return Ok(());
        }

        let value = self.build_value(attribute, cols)?;
        let parameter = self.registry.cache().compute_if_absent(&cols.id, || {
            Ok(Some(Arc::new(Parameter::direct(cols.id, data_set.id, attribute.id, value))))
        })?;
        if parameter.data_set_id != data_set.id || parameter.attribute_id != attribute.id {
            return Err(DataSetError::inconsistent(format!(
                "parameter {} is cached for another data set or attribute",
                parameter.id
            )));
        }

        data_set.attach_parameter(parameter.clone());
        self.parameters.insert(parameter.id, parameter);
        Ok(())
    }

    fn override_parameter(
        &mut self,
        list: &Arc<DataSetList>,
        data_set: &Arc<DataSet>,
        path_cols: &PathColumns,
        cols: Option<&ParameterColumns>,
    ) -> Result<()> {
        let path = match self.paths.get(&path_cols.id) {
            Some(path) => path.clone(),
            None => {
                let chain: AttributeChain = path_cols
                    .chain_key
                    .parse()
                    .map_err(|err: DataSetError| DataSetError::inconsistent(err.to_string()))?;
                if chain.is_empty() {
                    return Err(DataSetError::inconsistent(format!("attribute path {} has no chain", path_cols.id)));
                }
                let target = self.target_attribute(path_cols)?.ok_or_else(|| {
                    DataSetError::inconsistent(format!(
                        "override target attribute {} not found in data set list {}",
                        path_cols.target_attribute_id, path_cols.target_list_id
                    ))
                })?;
                let path = self.registry.cache().compute_if_absent(&path_cols.id, || {
                    Ok(Some(Arc::new(AttributePath::with_id(
                        path_cols.id,
                        list.id,
                        data_set.id,
                        chain,
                        target,
                    ))))
                })?;
                self.paths.insert(path.id, path.clone());
                path
            }
        };

        let Some(cols) = cols else {
            return Ok(());
        };
        if self.parameters.contains_key(&cols.id) || data_set.has_parameter(&cols.id) {
            return Ok(());
        }

        let value = self.build_value(&path.target, cols)?;
        let parameter = self.registry.cache().compute_if_absent(&cols.id, || {
            Ok(Some(Arc::new(Parameter::overlap(cols.id, data_set.id, path.clone(), value))))
        })?;
        data_set.attach_parameter(parameter.clone());
        self.parameters.insert(parameter.id, parameter);
        Ok(())
    }

    fn target_outside_stream(&self, cols: &PathColumns) -> bool {
        cols.target_list_id == self.root_id
            && !self.paths.contains_key(&cols.id)
            && self.local_target(cols).is_none()
    }

    fn local_target(&self, cols: &PathColumns) -> Option<Arc<Attribute>> {
        if let Some(attribute) = self.attributes.get(&cols.target_attribute_id) {
            return Some(attribute.clone());
        }
        if cols.target_list_id != self.root_id {
            return None;
        }
        self.root.as_ref().and_then(|root| root.attribute(&cols.target_attribute_id))
    }

    /// Target of an override, possibly living in another list
    fn target_attribute(&self, cols: &PathColumns) -> Result<Option<Arc<Attribute>>> {
        if let Some(attribute) = self.local_target(cols) {
            return Ok(Some(attribute));
        }
        self.registry
            .provide_attribute(&cols.target_list_id, &cols.target_attribute_id)
    }

    /// Decode the raw payload columns according to the attribute type
    fn build_value(&self, attribute: &Arc<Attribute>, cols: &ParameterColumns) -> Result<ParameterValue> {
        let populated = [
            cols.text.is_some(),
            cols.list_value_id.is_some(),
            cols.data_set_ref_id.is_some(),
        ]
        .into_iter()
        .filter(|set| *set)
        .count();
        if populated > 1 {
            return Err(DataSetError::inconsistent(format!(
                "parameter {} carries more than one payload",
                cols.id
            )));
        }

        let mismatch = || {
            DataSetError::inconsistent(format!(
                "parameter {} payload does not fit {} attribute '{}'",
                cols.id, attribute.attribute_type, attribute.name
            ))
        };

        match attribute.attribute_type {
            AttributeType::Text | AttributeType::Encrypted => match (&cols.text, populated) {
                (Some(text), _) => Ok(ParameterValue::Text(text.clone())),
                (None, 0) => Ok(ParameterValue::Empty),
                _ => Err(mismatch()),
            },
            AttributeType::List => match (cols.list_value_id, populated) {
                (Some(id), _) => Ok(ParameterValue::ListValue(Self::list_value_ref(attribute, id))),
                (None, 0) => Ok(ParameterValue::Empty),
                _ => Err(mismatch()),
            },
            AttributeType::File if populated == 0 => Ok(ParameterValue::File(FileRef { parameter_id: cols.id })),
            AttributeType::File => Err(mismatch()),
            AttributeType::Dsl | AttributeType::Change => match (cols.data_set_ref_id, populated) {
                (Some(id), _) => {
                    let list_id = attribute.reference_id().ok_or_else(mismatch)?;
                    self.registry.demand_row(list_id, id);
                    Ok(ParameterValue::DataSetRef(self.registry.row_ref(list_id, id)))
                }
                (None, 0) => Ok(ParameterValue::Empty),
                _ => Err(mismatch()),
            },
        }
    }

    /// Options fan out after the parameter row, so the chosen one may not be
    /// attached yet; the handle looks it up on the attribute when needed.
    fn list_value_ref(attribute: &Arc<Attribute>, id: Id) -> LazyRef<ListValue> {
        if let Some(value) = attribute.list_value(&id) {
            return LazyRef::resolved(id, &value);
        }
        let owner = Arc::downgrade(attribute);
        LazyRef::new(
            id,
            Arc::new(move |id: &Id| Ok(owner.upgrade().and_then(|attribute| attribute.list_value(id)))),
        )
    }
}
