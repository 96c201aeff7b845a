use crate::model::{AttributeChain, AttributeType, AuditInfo, Id};
use serde::{Deserialize, Serialize};

// Persisted shapes. The graph types in `model` are built from these through
// the row stream; stores and the HTTP layer speak records.

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisibilityAreaRecord {
    pub id: Id,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSetListRecord {
    pub id: Id,
    pub visibility_area_id: Id,
    pub name: String,
    pub test_plan_id: Option<Id>,
    #[serde(flatten)]
    pub audit: AuditInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeRecord {
    pub id: Id,
    pub data_set_list_id: Id,
    pub name: String,
    pub ordering: i32,
    pub attribute_type: AttributeType,
    pub reference_list_id: Option<Id>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListValueRecord {
    pub id: Id,
    pub attribute_id: Id,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSetRecord {
    pub id: Id,
    pub data_set_list_id: Id,
    pub name: String,
    pub ordering: i32,
    pub locked: bool,
}

/// Raw parameter row; at most one payload column is populated
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterRecord {
    pub id: Id,
    pub data_set_id: Id,
    pub attribute_id: Id,
    pub path_id: Option<Id>,
    pub text: Option<String>,
    pub list_value_id: Option<Id>,
    pub data_set_ref_id: Option<Id>,
}

impl ParameterRecord {
    pub fn new(data_set_id: Id, attribute_id: Id, path_id: Option<Id>, input: &ParameterInput) -> Self {
        let mut record = Self {
            id: crate::model::generate_id(),
            data_set_id,
            attribute_id,
            path_id,
            text: None,
            list_value_id: None,
            data_set_ref_id: None,
        };
        record.apply(input);
        record
    }

    /// Replace the payload, clearing every other column
    pub fn apply(&mut self, input: &ParameterInput) {
        self.text = None;
        self.list_value_id = None;
        self.data_set_ref_id = None;
        match input {
            ParameterInput::Text(text) => self.text = Some(text.clone()),
            ParameterInput::ListValue(id) => self.list_value_id = Some(*id),
            ParameterInput::DataSetRef(id) => self.data_set_ref_id = Some(*id),
            ParameterInput::File => {}
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributePathRecord {
    pub id: Id,
    pub data_set_list_id: Id,
    pub data_set_id: Id,
    pub target_attribute_id: Id,
    pub chain: AttributeChain,
}

/// Payload written by `set_parameter` / `set_override`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ParameterInput {
    Text(String),
    ListValue(Id),
    DataSetRef(Id),
    /// Slot for an attachment kept by the attachment store under the parameter id
    File,
}

impl ParameterInput {
    /// Whether this payload may be stored under an attribute of `ty`
    pub fn fits(&self, ty: AttributeType) -> bool {
        match self {
            ParameterInput::Text(_) => matches!(ty, AttributeType::Text | AttributeType::Encrypted),
            ParameterInput::ListValue(_) => ty == AttributeType::List,
            ParameterInput::DataSetRef(_) => ty.is_reference(),
            ParameterInput::File => ty == AttributeType::File,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewAttribute {
    pub name: String,
    pub attribute_type: AttributeType,
    #[serde(default)]
    pub reference_list_id: Option<Id>,
    #[serde(default)]
    pub list_values: Vec<String>,
}

impl NewAttribute {
    pub fn text(name: &str) -> Self {
        Self {
            name: name.to_string(),
            attribute_type: AttributeType::Text,
            reference_list_id: None,
            list_values: Vec::new(),
        }
    }

    pub fn reference(name: &str, list_id: Id) -> Self {
        Self {
            name: name.to_string(),
            attribute_type: AttributeType::Dsl,
            reference_list_id: Some(list_id),
            list_values: Vec::new(),
        }
    }

    pub fn list(name: &str, values: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            attribute_type: AttributeType::List,
            reference_list_id: None,
            list_values: values.iter().map(|v| v.to_string()).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::generate_id;

    #[test]
    fn test_apply_keeps_single_payload() {
        let mut record = ParameterRecord::new(generate_id(), generate_id(), None, &ParameterInput::Text("Paris".into()));
        assert_eq!(record.text.as_deref(), Some("Paris"));

        let row = generate_id();
        record.apply(&ParameterInput::DataSetRef(row));
        assert!(record.text.is_none());
        assert_eq!(record.data_set_ref_id, Some(row));
    }

    #[test]
    fn test_payload_fits_attribute_type() {
        assert!(ParameterInput::Text("x".into()).fits(AttributeType::Encrypted));
        assert!(!ParameterInput::Text("x".into()).fits(AttributeType::Dsl));
        assert!(ParameterInput::DataSetRef(generate_id()).fits(AttributeType::Change));
        assert!(ParameterInput::File.fits(AttributeType::File));
        assert!(!ParameterInput::ListValue(generate_id()).fits(AttributeType::Text));
    }
}
