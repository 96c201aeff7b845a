use crate::cache::LazyRef;
use crate::error::Result;
use crate::model::{AttributePath, DataSet, EntityKind, Id, Identified, ListValue};
use std::sync::Arc;

/// Pointer to a binary attachment; the bytes live with the attachment store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileRef {
    pub parameter_id: Id,
}

/// Payload of a parameter. Which variant is legal is decided by the type of
/// the owning attribute.
#[derive(Debug)]
pub enum ParameterValue {
    Empty,
    Text(String),
    ListValue(LazyRef<ListValue>),
    File(FileRef),
    DataSetRef(LazyRef<DataSet>),
}

impl ParameterValue {
    pub fn kind(&self) -> &'static str {
        match self {
            ParameterValue::Empty => "empty",
            ParameterValue::Text(_) => "text",
            ParameterValue::ListValue(_) => "list value",
            ParameterValue::File(_) => "file",
            ParameterValue::DataSetRef(_) => "data set reference",
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ParameterValue::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn referenced_data_set_id(&self) -> Option<Id> {
        match self {
            ParameterValue::DataSetRef(reference) => Some(reference.id()),
            _ => None,
        }
    }

    pub fn list_value_id(&self) -> Option<Id> {
        match self {
            ParameterValue::ListValue(value) => Some(value.id()),
            _ => None,
        }
    }
}

/// Value of one attribute within one data set. Overrides carry the path
/// they stand in front of.
#[derive(Debug)]
pub struct Parameter {
    pub id: Id,
    pub data_set_id: Id,
    /// Direct attribute, or the path's target attribute for overrides
    pub attribute_id: Id,
    pub path: Option<Arc<AttributePath>>,
    pub value: ParameterValue,
}

impl Parameter {
    pub fn direct(id: Id, data_set_id: Id, attribute_id: Id, value: ParameterValue) -> Self {
        Self {
            id,
            data_set_id,
            attribute_id,
            path: None,
            value,
        }
    }

    pub fn overlap(id: Id, data_set_id: Id, path: Arc<AttributePath>, value: ParameterValue) -> Self {
        Self {
            id,
            data_set_id,
            attribute_id: path.target_attribute_id(),
            path: Some(path),
            value,
        }
    }

    pub fn is_override(&self) -> bool {
        self.path.is_some()
    }

    /// Follow a data set reference payload
    pub fn referenced_data_set(&self) -> Result<Option<Arc<DataSet>>> {
        match &self.value {
            ParameterValue::DataSetRef(reference) => reference.get(),
            _ => Ok(None),
        }
    }

    pub fn list_value(&self) -> Result<Option<Arc<ListValue>>> {
        match &self.value {
            ParameterValue::ListValue(value) => value.get(),
            _ => Ok(None),
        }
    }
}

impl Identified for Parameter {
    const KIND: EntityKind = EntityKind::Parameter;

    fn id(&self) -> Id {
        self.id
    }
}
