use crate::model::{DataSetList, EntityKind, Id, Identified, Parameter};
use itertools::Itertools;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Direct parameters keyed by attribute, overrides in attach order
#[derive(Debug, Default)]
struct Slots {
    direct: Vec<Arc<Parameter>>,
    by_attribute: HashMap<Id, usize>,
    overrides: Vec<Arc<Parameter>>,
    ids: HashSet<Id>,
}

/// One row of a data set list
#[derive(Debug)]
pub struct DataSet {
    pub id: Id,
    pub data_set_list_id: Id,
    pub name: String,
    pub ordering: i32,
    /// Locked rows reject value mutation
    pub locked: bool,
    slots: RwLock<Slots>,
}

impl DataSet {
    pub fn new(id: Id, data_set_list_id: Id, name: String, ordering: i32, locked: bool) -> Self {
        Self {
            id,
            data_set_list_id,
            name,
            ordering,
            locked,
            slots: RwLock::new(Slots::default()),
        }
    }

    /// Parameter held for a direct attribute of this row's list
    pub fn parameter(&self, attribute_id: &Id) -> Option<Arc<Parameter>> {
        let slots = self.slots.read();
        slots
            .by_attribute
            .get(attribute_id)
            .map(|&position| slots.direct[position].clone())
    }

    /// Override recorded on this row for `target` reached through `chain`
    pub fn override_for(&self, target: &Id, chain: &[Id]) -> Option<Arc<Parameter>> {
        self.slots
            .read()
            .overrides
            .iter()
            .find(|parameter| {
                parameter
                    .path
                    .as_ref()
                    .is_some_and(|path| path.addresses(target, chain))
            })
            .cloned()
    }

    pub fn parameters(&self) -> Vec<Arc<Parameter>> {
        self.slots.read().direct.clone()
    }

    pub fn overrides(&self) -> Vec<Arc<Parameter>> {
        self.slots.read().overrides.clone()
    }

    pub fn has_parameter(&self, parameter_id: &Id) -> bool {
        self.slots.read().ids.contains(parameter_id)
    }

    /// Attach a direct or override parameter; returns false when a parameter
    /// with the same id is already attached.
    pub fn attach_parameter(&self, parameter: Arc<Parameter>) -> bool {
        let mut slots = self.slots.write();
        if !slots.ids.insert(parameter.id) {
            return false;
        }
        if parameter.is_override() {
            slots.overrides.push(parameter);
        } else {
            let position = slots.direct.len();
            slots.by_attribute.entry(parameter.attribute_id).or_insert(position);
            slots.direct.push(parameter);
        }
        true
    }

    /// Direct parameters in the list's sorted attribute view; parameters for
    /// attributes unknown to `list` keep their storage order at the end.
    pub fn sorted_parameters(&self, list: &DataSetList) -> Vec<Arc<Parameter>> {
        let position: HashMap<Id, usize> = list
            .sorted_attributes()
            .iter()
            .enumerate()
            .map(|(position, attribute)| (attribute.id, position))
            .collect();
        self.slots
            .read()
            .direct
            .iter()
            .cloned()
            .sorted_by_key(|parameter| position.get(&parameter.attribute_id).copied().unwrap_or(usize::MAX))
            .collect()
    }
}

impl Identified for DataSet {
    const KIND: EntityKind = EntityKind::DataSet;

    fn id(&self) -> Id {
        self.id
    }
}
