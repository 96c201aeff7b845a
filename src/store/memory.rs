use crate::error::{DataSetError, Result};
use crate::model::{
    generate_id, generate_path_id, AttributeChain, AttributeType, AuditInfo, EntityKind, Id, DEFAULT_MAX_CHAIN_DEPTH,
};
use crate::store::collaborators::{AuditSink, LogAuditSink};
use crate::store::records::{
    AttributePathRecord, AttributeRecord, DataSetListRecord, DataSetRecord, ListValueRecord, NewAttribute,
    ParameterInput, ParameterRecord, VisibilityAreaRecord,
};
use crate::store::row_stream::{
    AttributeColumns, DataSetColumns, FlatRow, ListValueColumns, ParameterColumns, PathColumns, RowQuery, RowSource,
    RowStream,
};
use crate::store::traits::{AttributeStore, DataSetListStore, DataSetStore, ParameterStore, VisibilityAreaStore};
use crate::store::validation::{check_chain, check_new_attribute, check_payload};
use itertools::Itertools;
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// Lists touched by one transaction, reported to the audit sink on commit
type Touched = BTreeSet<Id>;

#[derive(Debug, Clone, Default)]
struct MemoryState {
    areas: HashMap<Id, VisibilityAreaRecord>,
    lists: HashMap<Id, DataSetListRecord>,
    attributes: HashMap<Id, AttributeRecord>,
    list_values: HashMap<Id, ListValueRecord>,
    data_sets: HashMap<Id, DataSetRecord>,
    parameters: HashMap<Id, ParameterRecord>,
    paths: HashMap<Id, AttributePathRecord>,
}

impl MemoryState {
    fn list(&self, id: &Id) -> Result<&DataSetListRecord> {
        self.lists.get(id).ok_or(DataSetError::not_found(EntityKind::DataSetList, *id))
    }

    fn attribute(&self, id: &Id) -> Result<&AttributeRecord> {
        self.attributes.get(id).ok_or(DataSetError::not_found(EntityKind::Attribute, *id))
    }

    fn data_set(&self, id: &Id) -> Result<&DataSetRecord> {
        self.data_sets.get(id).ok_or(DataSetError::not_found(EntityKind::DataSet, *id))
    }

    fn writable_data_set(&self, id: &Id) -> Result<&DataSetRecord> {
        let data_set = self.data_set(id)?;
        if data_set.locked {
            return Err(DataSetError::RowLocked(*id));
        }
        Ok(data_set)
    }

    fn attributes_of(&self, list_id: &Id) -> Vec<&AttributeRecord> {
        self.attributes
            .values()
            .filter(|a| &a.data_set_list_id == list_id)
            .sorted_by_key(|a| (a.ordering, a.id))
            .collect()
    }

    fn data_sets_of(&self, list_id: &Id) -> Vec<&DataSetRecord> {
        self.data_sets
            .values()
            .filter(|ds| &ds.data_set_list_id == list_id)
            .sorted_by_key(|ds| (ds.ordering, ds.id))
            .collect()
    }

    fn list_values_of(&self, attribute_id: &Id) -> Vec<&ListValueRecord> {
        self.list_values
            .values()
            .filter(|lv| &lv.attribute_id == attribute_id)
            .sorted_by(|a, b| a.text.cmp(&b.text))
            .collect()
    }

    fn direct_parameter(&self, data_set_id: &Id, attribute_id: &Id) -> Option<&ParameterRecord> {
        self.parameters
            .values()
            .find(|p| &p.data_set_id == data_set_id && &p.attribute_id == attribute_id && p.path_id.is_none())
    }

    fn path_parameter(&self, path_id: &Id) -> Option<&ParameterRecord> {
        self.parameters.values().find(|p| p.path_id.as_ref() == Some(path_id))
    }

    fn check_payload(&self, attribute: &AttributeRecord, input: &ParameterInput) -> Result<()> {
        let list_value = match input {
            ParameterInput::ListValue(id) => self.list_values.get(id),
            _ => None,
        };
        let data_set = match input {
            ParameterInput::DataSetRef(id) => self.data_sets.get(id),
            _ => None,
        };
        check_payload(attribute, input, list_value, data_set)
    }

    fn touch_data_set(&self, data_set_id: &Id, touched: &mut Touched) {
        if let Some(data_set) = self.data_sets.get(data_set_id) {
            touched.insert(data_set.data_set_list_id);
        }
    }

    fn remove_path(&mut self, path_id: &Id, touched: &mut Touched) {
        self.parameters.retain(|_, p| p.path_id.as_ref() != Some(path_id));
        if let Some(path) = self.paths.remove(path_id) {
            touched.insert(path.data_set_list_id);
        }
    }

    /// Drop matching parameters; override paths lose their anchor with them
    fn remove_parameters<F>(&mut self, doomed: F, touched: &mut Touched)
    where
        F: Fn(&ParameterRecord) -> bool,
    {
        let anchored: Vec<Id> = self
            .parameters
            .values()
            .filter(|p| doomed(p))
            .filter_map(|p| p.path_id)
            .collect();
        self.parameters.retain(|_, p| !doomed(p));
        for path_id in &anchored {
            self.remove_path(path_id, touched);
        }
    }

    fn remove_attribute(&mut self, attribute_id: &Id, touched: &mut Touched) {
        let doomed_paths: Vec<Id> = self
            .paths
            .values()
            .filter(|path| &path.target_attribute_id == attribute_id || path.chain.contains(attribute_id))
            .map(|path| path.id)
            .collect();
        for path_id in &doomed_paths {
            self.remove_path(path_id, touched);
        }

        self.remove_parameters(|p| &p.attribute_id == attribute_id, touched);
        self.list_values.retain(|_, lv| &lv.attribute_id != attribute_id);
        if let Some(attribute) = self.attributes.remove(attribute_id) {
            touched.insert(attribute.data_set_list_id);
        }
    }

    fn remove_data_set(&mut self, data_set_id: &Id, touched: &mut Touched) {
        let owned_paths: Vec<Id> = self
            .paths
            .values()
            .filter(|path| &path.data_set_id == data_set_id)
            .map(|path| path.id)
            .collect();
        for path_id in &owned_paths {
            self.remove_path(path_id, touched);
        }

        // Clear references held by other rows
        let referencing: Vec<Id> = self
            .parameters
            .values()
            .filter(|p| p.data_set_ref_id.as_ref() == Some(data_set_id))
            .map(|p| p.data_set_id)
            .collect();
        for row in &referencing {
            self.touch_data_set(row, touched);
        }
        self.remove_parameters(
            |p| &p.data_set_id == data_set_id || p.data_set_ref_id.as_ref() == Some(data_set_id),
            touched,
        );

        if let Some(data_set) = self.data_sets.remove(data_set_id) {
            touched.insert(data_set.data_set_list_id);
        }
    }

    fn remove_data_set_list(&mut self, list_id: &Id, touched: &mut Touched) {
        let owned_attributes: Vec<Id> = self.attributes_of(list_id).iter().map(|a| a.id).collect();
        for attribute_id in &owned_attributes {
            self.remove_attribute(attribute_id, touched);
        }
        let owned_rows: Vec<Id> = self.data_sets_of(list_id).iter().map(|ds| ds.id).collect();
        for data_set_id in &owned_rows {
            self.remove_data_set(data_set_id, touched);
        }

        let referencing: Vec<Id> = self
            .attributes
            .values()
            .filter(|a| a.reference_list_id.as_ref() == Some(list_id))
            .map(|a| a.id)
            .collect();
        for attribute_id in &referencing {
            log::info!("removing attribute {} that referenced deleted list {}", attribute_id, list_id);
            self.remove_attribute(attribute_id, touched);
        }

        self.lists.remove(list_id);
        touched.insert(*list_id);
    }

    fn header_row(list: &DataSetListRecord, area: Option<&VisibilityAreaRecord>) -> FlatRow {
        FlatRow {
            visibility_area_id: list.visibility_area_id,
            visibility_area_name: area.map(|a| a.name.clone()).unwrap_or_default(),
            data_set_list_id: list.id,
            data_set_list_name: list.name.clone(),
            test_plan_id: list.test_plan_id,
            created_by: list.audit.created_by.clone(),
            created_when: list.audit.created_when,
            modified_by: list.audit.modified_by.clone(),
            modified_when: list.audit.modified_when,
            data_set: None,
            attribute: None,
            list_value: None,
            path: None,
            parameter: None,
        }
    }

    fn data_set_columns(data_set: &DataSetRecord) -> DataSetColumns {
        DataSetColumns {
            id: data_set.id,
            name: data_set.name.clone(),
            ordering: data_set.ordering,
            locked: data_set.locked,
        }
    }

    fn parameter_columns(parameter: &ParameterRecord) -> ParameterColumns {
        ParameterColumns {
            id: parameter.id,
            text: parameter.text.clone(),
            list_value_id: parameter.list_value_id,
            data_set_ref_id: parameter.data_set_ref_id,
        }
    }

    /// Rows of one (data set, attribute) pair, fanned out per list option
    fn attribute_rows(
        &self,
        header: &FlatRow,
        data_set: Option<&DataSetRecord>,
        attribute: &AttributeRecord,
        rows: &mut Vec<FlatRow>,
    ) {
        let mut row = header.clone();
        row.data_set = data_set.map(Self::data_set_columns);
        row.attribute = Some(AttributeColumns {
            id: attribute.id,
            name: attribute.name.clone(),
            attribute_type: attribute.attribute_type.as_str().to_string(),
            reference_list_id: attribute.reference_list_id,
            ordering: attribute.ordering,
        });
        row.parameter = data_set
            .and_then(|ds| self.direct_parameter(&ds.id, &attribute.id))
            .map(Self::parameter_columns);

        let options = self.list_values_of(&attribute.id);
        if options.is_empty() {
            rows.push(row);
            return;
        }
        for option in options {
            let mut fanned = row.clone();
            fanned.list_value = Some(ListValueColumns {
                id: option.id,
                text: option.text.clone(),
            });
            rows.push(fanned);
        }
    }

    fn flat_rows(&self, query: &RowQuery) -> Vec<FlatRow> {
        let Some(list) = self.lists.get(&query.data_set_list_id) else {
            return Vec::new();
        };
        let header = Self::header_row(list, self.areas.get(&list.visibility_area_id));
        let attributes: Vec<&AttributeRecord> = self
            .attributes_of(&list.id)
            .into_iter()
            .filter(|a| query.selects_attribute(&a.id))
            .collect();
        let data_sets: Vec<&DataSetRecord> = self
            .data_sets_of(&list.id)
            .into_iter()
            .filter(|ds| query.selects_data_set(&ds.id))
            .collect();

        let mut rows = Vec::new();
        if data_sets.is_empty() {
            if attributes.is_empty() {
                rows.push(header);
                return rows;
            }
            for attribute in &attributes {
                self.attribute_rows(&header, None, attribute, &mut rows);
            }
            return rows;
        }

        for data_set in &data_sets {
            if attributes.is_empty() {
                let mut row = header.clone();
                row.data_set = Some(Self::data_set_columns(data_set));
                rows.push(row);
            }
            for attribute in &attributes {
                self.attribute_rows(&header, Some(*data_set), attribute, &mut rows);
            }

            let paths = self
                .paths
                .values()
                .filter(|path| path.data_set_id == data_set.id)
                .filter(|path| path.chain.hops().first().map_or(false, |hop| query.selects_attribute(hop)))
                .sorted_by_key(|path| path.id);
            for path in paths {
                let Some(parameter) = self.path_parameter(&path.id) else {
                    continue;
                };
                let Some(target) = self.attributes.get(&path.target_attribute_id) else {
                    continue;
                };
                let mut row = header.clone();
                row.data_set = Some(Self::data_set_columns(data_set));
                row.path = Some(PathColumns {
                    id: path.id,
                    chain_key: path.chain.to_string(),
                    target_attribute_id: target.id,
                    target_list_id: target.data_set_list_id,
                });
                row.parameter = Some(Self::parameter_columns(parameter));
                rows.push(row);
            }
        }

        // Already generated in order; the stable sort keeps that guarantee explicit
        rows.sort_by_key(FlatRow::sort_key);
        rows
    }
}

/// Process-local store. Each mutation runs against a copy of the state that
/// replaces the original only if every step succeeds.
pub struct MemoryStore {
    state: RwLock<MemoryState>,
    audit: Arc<dyn AuditSink>,
    max_chain_depth: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(MemoryState::default()),
            audit: Arc::new(LogAuditSink),
            max_chain_depth: DEFAULT_MAX_CHAIN_DEPTH,
        }
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn with_max_chain_depth(mut self, max_chain_depth: usize) -> Self {
        self.max_chain_depth = max_chain_depth;
        self
    }

    fn read<T>(&self, f: impl FnOnce(&MemoryState) -> T) -> T {
        f(&self.state.read())
    }

    fn transaction<T>(&self, f: impl FnOnce(&mut MemoryState, &mut Touched) -> Result<T>) -> Result<T> {
        let mut touched = Touched::new();
        let result = {
            let mut state = self.state.write();
            let mut next = state.clone();
            let result = f(&mut next, &mut touched)?;
            *state = next;
            result
        };
        for list_id in &touched {
            self.audit.data_set_list_modified(list_id);
        }
        Ok(result)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RowSource for MemoryStore {
    fn open(&self, query: &RowQuery) -> Result<RowStream> {
        let rows = self.read(|state| state.flat_rows(query));
        log::debug!("memory row stream for {}: {} rows", query.data_set_list_id, rows.len());
        Ok(RowStream::from_rows(rows))
    }
}

#[async_trait::async_trait]
impl VisibilityAreaStore for MemoryStore {
    async fn get_visibility_area(&self, id: &Id) -> Result<Option<VisibilityAreaRecord>> {
        Ok(self.read(|state| state.areas.get(id).cloned()))
    }

    async fn create_visibility_area(&self, name: &str) -> Result<VisibilityAreaRecord> {
        self.transaction(|state, _| {
            let area = VisibilityAreaRecord {
                id: generate_id(),
                name: name.to_string(),
            };
            state.areas.insert(area.id, area.clone());
            Ok(area)
        })
    }

    async fn delete_visibility_area(&self, id: &Id) -> Result<bool> {
        self.transaction(|state, touched| {
            if !state.areas.contains_key(id) {
                return Ok(false);
            }
            let lists: Vec<Id> = state
                .lists
                .values()
                .filter(|list| &list.visibility_area_id == id)
                .map(|list| list.id)
                .collect();
            for list_id in &lists {
                state.remove_data_set_list(list_id, touched);
            }
            state.areas.remove(id);
            Ok(true)
        })
    }
}

#[async_trait::async_trait]
impl DataSetListStore for MemoryStore {
    async fn get_data_set_list(&self, id: &Id) -> Result<Option<DataSetListRecord>> {
        Ok(self.read(|state| state.lists.get(id).cloned()))
    }

    async fn list_data_set_lists(&self, visibility_area_id: &Id) -> Result<Vec<DataSetListRecord>> {
        Ok(self.read(|state| {
            state
                .lists
                .values()
                .filter(|list| &list.visibility_area_id == visibility_area_id)
                .sorted_by(|a, b| a.name.cmp(&b.name))
                .cloned()
                .collect()
        }))
    }

    async fn create_data_set_list(
        &self,
        visibility_area_id: &Id,
        name: &str,
        test_plan_id: Option<Id>,
        user: Option<String>,
    ) -> Result<DataSetListRecord> {
        self.transaction(|state, touched| {
            if !state.areas.contains_key(visibility_area_id) {
                return Err(DataSetError::not_found(EntityKind::VisibilityArea, *visibility_area_id));
            }
            if state
                .lists
                .values()
                .any(|list| &list.visibility_area_id == visibility_area_id && list.name == name)
            {
                return Err(DataSetError::DuplicateName {
                    kind: EntityKind::DataSetList,
                    name: name.to_string(),
                });
            }
            let list = DataSetListRecord {
                id: generate_id(),
                visibility_area_id: *visibility_area_id,
                name: name.to_string(),
                test_plan_id,
                audit: AuditInfo::created(user),
            };
            state.lists.insert(list.id, list.clone());
            touched.insert(list.id);
            Ok(list)
        })
    }

    async fn rename_data_set_list(&self, id: &Id, name: &str, user: Option<String>) -> Result<DataSetListRecord> {
        self.transaction(|state, touched| {
            let area_id = state.list(id)?.visibility_area_id;
            if state
                .lists
                .values()
                .any(|list| list.visibility_area_id == area_id && list.name == name && &list.id != id)
            {
                return Err(DataSetError::DuplicateName {
                    kind: EntityKind::DataSetList,
                    name: name.to_string(),
                });
            }
            let list = state
                .lists
                .get_mut(id)
                .ok_or(DataSetError::not_found(EntityKind::DataSetList, *id))?;
            list.name = name.to_string();
            list.audit.touch(user);
            touched.insert(*id);
            Ok(list.clone())
        })
    }

    async fn delete_data_set_list(&self, id: &Id) -> Result<bool> {
        self.transaction(|state, touched| {
            if !state.lists.contains_key(id) {
                return Ok(false);
            }
            state.remove_data_set_list(id, touched);
            Ok(true)
        })
    }
}

#[async_trait::async_trait]
impl AttributeStore for MemoryStore {
    async fn get_attribute(&self, id: &Id) -> Result<Option<AttributeRecord>> {
        Ok(self.read(|state| state.attributes.get(id).cloned()))
    }

    async fn list_attributes(&self, data_set_list_id: &Id) -> Result<Vec<AttributeRecord>> {
        Ok(self.read(|state| state.attributes_of(data_set_list_id).into_iter().cloned().collect()))
    }

    async fn list_values(&self, attribute_id: &Id) -> Result<Vec<ListValueRecord>> {
        Ok(self.read(|state| state.list_values_of(attribute_id).into_iter().cloned().collect()))
    }

    async fn create_attribute(&self, data_set_list_id: &Id, attribute: NewAttribute) -> Result<AttributeRecord> {
        self.transaction(|state, touched| {
            state.list(data_set_list_id)?;
            let reference_exists = attribute
                .reference_list_id
                .map_or(false, |list_id| state.lists.contains_key(&list_id));
            check_new_attribute(&attribute, reference_exists)?;

            let siblings = state.attributes_of(data_set_list_id);
            if siblings.iter().any(|a| a.name == attribute.name) {
                return Err(DataSetError::DuplicateName {
                    kind: EntityKind::Attribute,
                    name: attribute.name.clone(),
                });
            }
            let ordering = siblings.iter().map(|a| a.ordering + 1).max().unwrap_or(0);

            let record = AttributeRecord {
                id: generate_id(),
                data_set_list_id: *data_set_list_id,
                name: attribute.name.clone(),
                ordering,
                attribute_type: attribute.attribute_type,
                reference_list_id: attribute.reference_list_id,
            };
            for text in &attribute.list_values {
                let value = ListValueRecord {
                    id: generate_id(),
                    attribute_id: record.id,
                    text: text.clone(),
                };
                state.list_values.insert(value.id, value);
            }
            state.attributes.insert(record.id, record.clone());
            touched.insert(*data_set_list_id);
            Ok(record)
        })
    }

    async fn add_list_value(&self, attribute_id: &Id, text: &str) -> Result<ListValueRecord> {
        self.transaction(|state, touched| {
            let attribute = state.attribute(attribute_id)?;
            if attribute.attribute_type != AttributeType::List {
                return Err(DataSetError::InvalidAttribute(format!(
                    "'{}' is not a LIST attribute",
                    attribute.name
                )));
            }
            let list_id = attribute.data_set_list_id;
            if state.list_values_of(attribute_id).iter().any(|lv| lv.text == text) {
                return Err(DataSetError::DuplicateName {
                    kind: EntityKind::ListValue,
                    name: text.to_string(),
                });
            }
            let value = ListValueRecord {
                id: generate_id(),
                attribute_id: *attribute_id,
                text: text.to_string(),
            };
            state.list_values.insert(value.id, value.clone());
            touched.insert(list_id);
            Ok(value)
        })
    }

    async fn delete_list_value(&self, id: &Id) -> Result<bool> {
        self.transaction(|state, touched| {
            let Some(value) = state.list_values.remove(id) else {
                return Ok(false);
            };
            state.remove_parameters(|p| p.list_value_id.as_ref() == Some(id), touched);
            if let Some(attribute) = state.attributes.get(&value.attribute_id) {
                touched.insert(attribute.data_set_list_id);
            }
            Ok(true)
        })
    }

    async fn delete_attribute(&self, id: &Id) -> Result<bool> {
        self.transaction(|state, touched| {
            if !state.attributes.contains_key(id) {
                return Ok(false);
            }
            state.remove_attribute(id, touched);
            Ok(true)
        })
    }
}

#[async_trait::async_trait]
impl DataSetStore for MemoryStore {
    async fn get_data_set(&self, id: &Id) -> Result<Option<DataSetRecord>> {
        Ok(self.read(|state| state.data_sets.get(id).cloned()))
    }

    async fn list_data_sets(&self, data_set_list_id: &Id) -> Result<Vec<DataSetRecord>> {
        Ok(self.read(|state| state.data_sets_of(data_set_list_id).into_iter().cloned().collect()))
    }

    async fn create_data_set(&self, data_set_list_id: &Id, name: &str) -> Result<DataSetRecord> {
        self.transaction(|state, touched| {
            state.list(data_set_list_id)?;
            let siblings = state.data_sets_of(data_set_list_id);
            if siblings.iter().any(|ds| ds.name == name) {
                return Err(DataSetError::DuplicateName {
                    kind: EntityKind::DataSet,
                    name: name.to_string(),
                });
            }
            let ordering = siblings.iter().map(|ds| ds.ordering + 1).max().unwrap_or(0);
            let record = DataSetRecord {
                id: generate_id(),
                data_set_list_id: *data_set_list_id,
                name: name.to_string(),
                ordering,
                locked: false,
            };
            state.data_sets.insert(record.id, record.clone());
            touched.insert(*data_set_list_id);
            Ok(record)
        })
    }

    async fn set_data_set_locked(&self, id: &Id, locked: bool) -> Result<DataSetRecord> {
        self.transaction(|state, touched| {
            let data_set = state
                .data_sets
                .get_mut(id)
                .ok_or(DataSetError::not_found(EntityKind::DataSet, *id))?;
            data_set.locked = locked;
            touched.insert(data_set.data_set_list_id);
            Ok(data_set.clone())
        })
    }

    async fn delete_data_set(&self, id: &Id) -> Result<bool> {
        self.transaction(|state, touched| {
            if !state.data_sets.contains_key(id) {
                return Ok(false);
            }
            state.remove_data_set(id, touched);
            Ok(true)
        })
    }
}

#[async_trait::async_trait]
impl ParameterStore for MemoryStore {
    async fn get_parameter(&self, data_set_id: &Id, attribute_id: &Id) -> Result<Option<ParameterRecord>> {
        Ok(self.read(|state| state.direct_parameter(data_set_id, attribute_id).cloned()))
    }

    async fn set_parameter(
        &self,
        data_set_id: &Id,
        attribute_id: &Id,
        input: ParameterInput,
    ) -> Result<ParameterRecord> {
        self.transaction(|state, touched| {
            let list_id = state.writable_data_set(data_set_id)?.data_set_list_id;
            let attribute = state.attribute(attribute_id)?;
            if attribute.data_set_list_id != list_id {
                return Err(DataSetError::InvalidAttribute(format!(
                    "attribute '{}' does not belong to the data set's list",
                    attribute.name
                )));
            }
            state.check_payload(attribute, &input)?;

            let existing = state.direct_parameter(data_set_id, attribute_id).map(|p| p.id);
            let record = match existing.and_then(|id| state.parameters.get_mut(&id)) {
                Some(parameter) => {
                    parameter.apply(&input);
                    parameter.clone()
                }
                None => {
                    let parameter = ParameterRecord::new(*data_set_id, *attribute_id, None, &input);
                    state.parameters.insert(parameter.id, parameter.clone());
                    parameter
                }
            };
            touched.insert(list_id);
            Ok(record)
        })
    }

    async fn clear_parameter(&self, data_set_id: &Id, attribute_id: &Id) -> Result<bool> {
        self.transaction(|state, touched| {
            let list_id = state.writable_data_set(data_set_id)?.data_set_list_id;
            let Some(id) = state.direct_parameter(data_set_id, attribute_id).map(|p| p.id) else {
                return Ok(false);
            };
            state.parameters.remove(&id);
            touched.insert(list_id);
            Ok(true)
        })
    }

    async fn get_override_path(
        &self,
        data_set_id: &Id,
        target_attribute_id: &Id,
        chain: &[Id],
    ) -> Result<Option<AttributePathRecord>> {
        Ok(self.read(|state| {
            let list_id = state.data_sets.get(data_set_id)?.data_set_list_id;
            let path_id = generate_path_id(&list_id, data_set_id, target_attribute_id, chain);
            state.paths.get(&path_id).cloned()
        }))
    }

    async fn list_paths(&self, data_set_id: &Id) -> Result<Vec<AttributePathRecord>> {
        Ok(self.read(|state| {
            state
                .paths
                .values()
                .filter(|path| &path.data_set_id == data_set_id)
                .sorted_by_key(|path| path.chain.len())
                .cloned()
                .collect()
        }))
    }

    async fn set_override(
        &self,
        data_set_id: &Id,
        target_attribute_id: &Id,
        chain: &[Id],
        input: ParameterInput,
    ) -> Result<ParameterRecord> {
        let max_depth = self.max_chain_depth;
        self.transaction(|state, touched| {
            let list_id = state.writable_data_set(data_set_id)?.data_set_list_id;
            let target = check_chain(list_id, chain, target_attribute_id, &state.attributes, max_depth)?;
            state.check_payload(target, &input)?;

            let path_id = generate_path_id(&list_id, data_set_id, target_attribute_id, chain);
            state.paths.entry(path_id).or_insert_with(|| AttributePathRecord {
                id: path_id,
                data_set_list_id: list_id,
                data_set_id: *data_set_id,
                target_attribute_id: *target_attribute_id,
                chain: AttributeChain::new(chain.to_vec()),
            });

            let existing = state.path_parameter(&path_id).map(|p| p.id);
            let record = match existing.and_then(|id| state.parameters.get_mut(&id)) {
                Some(parameter) => {
                    parameter.apply(&input);
                    parameter.clone()
                }
                None => {
                    let parameter = ParameterRecord::new(*data_set_id, *target_attribute_id, Some(path_id), &input);
                    state.parameters.insert(parameter.id, parameter.clone());
                    parameter
                }
            };
            touched.insert(list_id);
            Ok(record)
        })
    }

    async fn clear_override(&self, data_set_id: &Id, target_attribute_id: &Id, chain: &[Id]) -> Result<bool> {
        self.transaction(|state, touched| {
            let list_id = state.writable_data_set(data_set_id)?.data_set_list_id;
            let path_id = generate_path_id(&list_id, data_set_id, target_attribute_id, chain);
            if !state.paths.contains_key(&path_id) {
                return Ok(false);
            }
            state.remove_path(&path_id, touched);
            Ok(true)
        })
    }
}
