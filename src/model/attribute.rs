use crate::cache::LazyRef;
use crate::error::{DataSetError, Result};
use crate::model::{Children, DataSetList, EntityKind, Id, Identified};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttributeType {
    Text,
    Encrypted,
    List,
    File,
    Dsl,
    Change,
}

impl AttributeType {
    /// DSL and CHANGE attributes hold references to rows of another list
    pub fn is_reference(&self) -> bool {
        matches!(self, AttributeType::Dsl | AttributeType::Change)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AttributeType::Text => "TEXT",
            AttributeType::Encrypted => "ENCRYPTED",
            AttributeType::List => "LIST",
            AttributeType::File => "FILE",
            AttributeType::Dsl => "DSL",
            AttributeType::Change => "CHANGE",
        }
    }
}

impl std::str::FromStr for AttributeType {
    type Err = DataSetError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "TEXT" => Ok(AttributeType::Text),
            "ENCRYPTED" => Ok(AttributeType::Encrypted),
            "LIST" => Ok(AttributeType::List),
            "FILE" => Ok(AttributeType::File),
            "DSL" => Ok(AttributeType::Dsl),
            "CHANGE" => Ok(AttributeType::Change),
            other => Err(DataSetError::InvalidAttribute(format!("unknown attribute type: {}", other))),
        }
    }
}

impl std::fmt::Display for AttributeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One option of a LIST attribute
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListValue {
    pub id: Id,
    pub attribute_id: Id,
    pub text: String,
}

impl Identified for ListValue {
    const KIND: EntityKind = EntityKind::ListValue;

    fn id(&self) -> Id {
        self.id
    }
}

/// Column definition of a data set list
#[derive(Debug)]
pub struct Attribute {
    pub id: Id,
    pub data_set_list_id: Id,
    pub name: String,
    /// Column display order
    pub ordering: i32,
    pub attribute_type: AttributeType,
    reference: Option<LazyRef<DataSetList>>,
    list_values: RwLock<Children<ListValue>>,
}

impl Attribute {
    /// Build an attribute, enforcing that a reference list is present exactly
    /// when the type is DSL or CHANGE.
    pub fn new(
        id: Id,
        data_set_list_id: Id,
        name: String,
        ordering: i32,
        attribute_type: AttributeType,
        reference: Option<LazyRef<DataSetList>>,
    ) -> Result<Self> {
        match (attribute_type.is_reference(), &reference) {
            (true, None) => {
                return Err(DataSetError::InvalidAttribute(format!(
                    "{} attribute '{}' has no reference data set list",
                    attribute_type, name
                )))
            }
            (false, Some(_)) => {
                return Err(DataSetError::InvalidAttribute(format!(
                    "{} attribute '{}' cannot reference a data set list",
                    attribute_type, name
                )))
            }
            _ => {}
        }

        Ok(Self {
            id,
            data_set_list_id,
            name,
            ordering,
            attribute_type,
            reference,
            list_values: RwLock::new(Children::default()),
        })
    }

    pub fn is_reference(&self) -> bool {
        self.attribute_type.is_reference()
    }

    pub fn reference_id(&self) -> Option<Id> {
        self.reference.as_ref().map(LazyRef::id)
    }

    /// The list whose rows are this attribute's value domain, loading it if needed
    pub fn reference_list(&self) -> Result<Option<Arc<DataSetList>>> {
        match &self.reference {
            Some(reference) => reference.get(),
            None => Ok(None),
        }
    }

    pub fn list_values(&self) -> Vec<Arc<ListValue>> {
        self.list_values.read().to_vec()
    }

    pub fn list_value(&self, id: &Id) -> Option<Arc<ListValue>> {
        self.list_values.read().get(id)
    }

    /// Attach a list option; returns false when it was already attached
    pub fn attach_list_value(&self, value: Arc<ListValue>) -> bool {
        self.list_values.write().insert(value)
    }
}

impl Identified for Attribute {
    const KIND: EntityKind = EntityKind::Attribute;

    fn id(&self) -> Id {
        self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::generate_id;

    #[test]
    fn test_reference_required_for_dsl() {
        let result = Attribute::new(generate_id(), generate_id(), "address".into(), 0, AttributeType::Dsl, None);
        assert!(matches!(result, Err(DataSetError::InvalidAttribute(_))));
    }

    #[test]
    fn test_reference_rejected_for_text() {
        let reference = LazyRef::detached(generate_id());
        let result = Attribute::new(
            generate_id(),
            generate_id(),
            "city".into(),
            0,
            AttributeType::Text,
            Some(reference),
        );
        assert!(matches!(result, Err(DataSetError::InvalidAttribute(_))));
    }

    #[test]
    fn test_list_value_attached_once() {
        let attribute =
            Attribute::new(generate_id(), generate_id(), "color".into(), 0, AttributeType::List, None).unwrap();
        let value = Arc::new(ListValue {
            id: generate_id(),
            attribute_id: attribute.id,
            text: "red".into(),
        });

        assert!(attribute.attach_list_value(value.clone()));
        assert!(!attribute.attach_list_value(value.clone()));
        assert_eq!(attribute.list_values().len(), 1);
        assert!(attribute.list_value(&value.id).is_some());
    }

    #[test]
    fn test_attribute_type_round_trips_through_str() {
        for ty in [
            AttributeType::Text,
            AttributeType::Encrypted,
            AttributeType::List,
            AttributeType::File,
            AttributeType::Dsl,
            AttributeType::Change,
        ] {
            assert_eq!(ty.as_str().parse::<AttributeType>().unwrap(), ty);
        }
        assert!(AttributeType::Change.is_reference());
        assert!(!AttributeType::List.is_reference());
    }
}
