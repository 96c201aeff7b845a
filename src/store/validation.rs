use crate::error::{DataSetError, Result};
use crate::model::{EntityKind, Id};
use crate::store::records::{AttributeRecord, DataSetRecord, ListValueRecord, NewAttribute, ParameterInput};
use std::collections::{HashMap, HashSet};

/// Reference list present exactly for DSL/CHANGE; list values only for LIST
pub fn check_new_attribute(attribute: &NewAttribute, reference_list_exists: bool) -> Result<()> {
    if attribute.name.trim().is_empty() {
        return Err(DataSetError::InvalidAttribute("attribute name is empty".into()));
    }
    let ty = attribute.attribute_type;
    match (ty.is_reference(), attribute.reference_list_id) {
        (true, None) => {
            return Err(DataSetError::InvalidAttribute(format!(
                "{} attribute '{}' needs a reference data set list",
                ty, attribute.name
            )))
        }
        (true, Some(list_id)) if !reference_list_exists => {
            return Err(DataSetError::not_found(EntityKind::DataSetList, list_id));
        }
        (false, Some(_)) => {
            return Err(DataSetError::InvalidAttribute(format!(
                "{} attribute '{}' cannot reference a data set list",
                ty, attribute.name
            )))
        }
        _ => {}
    }
    if ty != crate::model::AttributeType::List && !attribute.list_values.is_empty() {
        return Err(DataSetError::InvalidAttribute(format!(
            "{} attribute '{}' cannot own list values",
            ty, attribute.name
        )));
    }
    let mut seen = HashSet::new();
    for value in &attribute.list_values {
        if !seen.insert(value.as_str()) {
            return Err(DataSetError::DuplicateName {
                kind: EntityKind::ListValue,
                name: value.clone(),
            });
        }
    }
    Ok(())
}

/// The payload must suit the attribute type, and referenced list values and
/// data sets must belong to the attribute's domain.
pub fn check_payload(
    attribute: &AttributeRecord,
    input: &ParameterInput,
    list_value: Option<&ListValueRecord>,
    data_set: Option<&DataSetRecord>,
) -> Result<()> {
    if !input.fits(attribute.attribute_type) {
        return Err(DataSetError::TypeMismatch(format!(
            "{:?} cannot be stored in {} attribute '{}'",
            input, attribute.attribute_type, attribute.name
        )));
    }
    match input {
        ParameterInput::ListValue(id) => match list_value {
            Some(value) if value.attribute_id == attribute.id => Ok(()),
            Some(_) => Err(DataSetError::TypeMismatch(format!(
                "list value {} is not an option of '{}'",
                id, attribute.name
            ))),
            None => Err(DataSetError::not_found(EntityKind::ListValue, *id)),
        },
        ParameterInput::DataSetRef(id) => match data_set {
            Some(row) if Some(row.data_set_list_id) == attribute.reference_list_id => Ok(()),
            Some(_) => Err(DataSetError::TypeMismatch(format!(
                "data set {} is not in the list referenced by '{}'",
                id, attribute.name
            ))),
            None => Err(DataSetError::not_found(EntityKind::DataSet, *id)),
        },
        ParameterInput::Text(_) | ParameterInput::File => Ok(()),
    }
}

/// Walk `chain` from `start_list_id` hop by hop and return the target
/// attribute it reaches. Every hop must be a reference attribute of the
/// list the previous hop pointed at.
pub fn check_chain<'a>(
    start_list_id: Id,
    chain: &[Id],
    target_attribute_id: &Id,
    attributes: &'a HashMap<Id, AttributeRecord>,
    max_depth: usize,
) -> Result<&'a AttributeRecord> {
    if chain.is_empty() {
        return Err(DataSetError::InvalidPath(
            "an override needs at least one reference attribute".into(),
        ));
    }
    if chain.len() > max_depth {
        return Err(DataSetError::ChainDepthExceeded {
            depth: chain.len(),
            max: max_depth,
        });
    }

    let mut list_id = start_list_id;
    for hop in chain {
        let attribute = attributes
            .get(hop)
            .ok_or(DataSetError::not_found(EntityKind::Attribute, *hop))?;
        if attribute.data_set_list_id != list_id {
            return Err(DataSetError::InvalidPath(format!(
                "attribute '{}' is not part of data set list {}",
                attribute.name, list_id
            )));
        }
        list_id = attribute.reference_list_id.ok_or_else(|| {
            DataSetError::InvalidPath(format!("attribute '{}' is not a reference", attribute.name))
        })?;
    }

    let target = attributes
        .get(target_attribute_id)
        .ok_or(DataSetError::not_found(EntityKind::Attribute, *target_attribute_id))?;
    if target.data_set_list_id != list_id {
        return Err(DataSetError::InvalidPath(format!(
            "target attribute '{}' is not reachable through the chain",
            target.name
        )));
    }
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{generate_id, AttributeType};

    fn attribute(list: Id, name: &str, ty: AttributeType, reference: Option<Id>) -> AttributeRecord {
        AttributeRecord {
            id: generate_id(),
            data_set_list_id: list,
            name: name.into(),
            ordering: 0,
            attribute_type: ty,
            reference_list_id: reference,
        }
    }

    #[test]
    fn test_chain_walks_reference_lists() {
        let (person, address) = (generate_id(), generate_id());
        let hop = attribute(person, "address", AttributeType::Dsl, Some(address));
        let city = attribute(address, "city", AttributeType::Text, None);
        let attributes: HashMap<Id, AttributeRecord> =
            [(hop.id, hop.clone()), (city.id, city.clone())].into_iter().collect();

        let target = check_chain(person, &[hop.id], &city.id, &attributes, 15).unwrap();
        assert_eq!(target.id, city.id);

        // Starting from the wrong list breaks the first hop
        assert!(matches!(
            check_chain(address, &[hop.id], &city.id, &attributes, 15),
            Err(DataSetError::InvalidPath(_))
        ));
    }

    #[test]
    fn test_chain_depth_capped() {
        let chain: Vec<Id> = (0..16).map(|_| generate_id()).collect();
        let attributes = HashMap::new();
        let result = check_chain(generate_id(), &chain, &generate_id(), &attributes, 15);
        assert!(matches!(
            result,
            Err(DataSetError::ChainDepthExceeded { depth: 16, max: 15 })
        ));
    }

    #[test]
    fn test_empty_chain_rejected() {
        let attributes = HashMap::new();
        let result = check_chain(generate_id(), &[], &generate_id(), &attributes, 15);
        assert!(matches!(result, Err(DataSetError::InvalidPath(_))));
    }

    #[test]
    fn test_new_attribute_rules() {
        let mut dsl = NewAttribute::reference("address", generate_id());
        assert!(check_new_attribute(&dsl, true).is_ok());
        assert!(matches!(check_new_attribute(&dsl, false), Err(DataSetError::NotFound { .. })));

        dsl.reference_list_id = None;
        assert!(matches!(check_new_attribute(&dsl, false), Err(DataSetError::InvalidAttribute(_))));

        let duplicated = NewAttribute::list("color", &["red", "red"]);
        assert!(matches!(check_new_attribute(&duplicated, false), Err(DataSetError::DuplicateName { .. })));
    }
}
