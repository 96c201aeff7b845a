use crate::model::{Attribute, AuditInfo, Children, DataSet, EntityKind, Id, Identified, VisibilityArea};
use itertools::Itertools;
use parking_lot::RwLock;
use std::sync::Arc;

/// A named schema: ordered attributes plus the rows holding their values
#[derive(Debug)]
pub struct DataSetList {
    pub id: Id,
    pub name: String,
    pub visibility_area: Arc<VisibilityArea>,
    pub test_plan_id: Option<Id>,
    pub audit: AuditInfo,
    attributes: RwLock<Children<Attribute>>,
    data_sets: RwLock<Children<DataSet>>,
}

impl DataSetList {
    pub fn new(
        id: Id,
        name: String,
        visibility_area: Arc<VisibilityArea>,
        test_plan_id: Option<Id>,
        audit: AuditInfo,
    ) -> Self {
        Self {
            id,
            name,
            visibility_area,
            test_plan_id,
            audit,
            attributes: RwLock::new(Children::default()),
            data_sets: RwLock::new(Children::default()),
        }
    }

    /// Attributes in storage order (by position)
    pub fn attributes(&self) -> Vec<Arc<Attribute>> {
        self.attributes.read().to_vec()
    }

    pub fn data_sets(&self) -> Vec<Arc<DataSet>> {
        self.data_sets.read().to_vec()
    }

    pub fn attribute(&self, id: &Id) -> Option<Arc<Attribute>> {
        self.attributes.read().get(id)
    }

    pub fn attribute_by_name(&self, name: &str) -> Option<Arc<Attribute>> {
        self.attributes.read().iter().find(|a| a.name == name).cloned()
    }

    pub fn data_set(&self, id: &Id) -> Option<Arc<DataSet>> {
        self.data_sets.read().get(id)
    }

    pub fn data_set_by_name(&self, name: &str) -> Option<Arc<DataSet>> {
        self.data_sets.read().iter().find(|ds| ds.name == name).cloned()
    }

    /// Returns false when the attribute was already attached
    pub fn attach_attribute(&self, attribute: Arc<Attribute>) -> bool {
        self.attributes.write().insert(attribute)
    }

    /// Returns false when the data set was already attached
    pub fn attach_data_set(&self, data_set: Arc<DataSet>) -> bool {
        self.data_sets.write().insert(data_set)
    }

    /// Display view: plain attributes first, then references, each by name.
    /// The stable sort leaves equal keys in storage order.
    pub fn sorted_attributes(&self) -> Vec<Arc<Attribute>> {
        self.attributes
            .read()
            .iter()
            .cloned()
            .sorted_by(|a, b| (a.is_reference(), &a.name).cmp(&(b.is_reference(), &b.name)))
            .collect()
    }
}

impl Identified for DataSetList {
    const KIND: EntityKind = EntityKind::DataSetList;

    fn id(&self) -> Id {
        self.id
    }
}
