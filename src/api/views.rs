use crate::error::Result;
use crate::logic::{AssemblyStats, DataSetListGraph, ResolvedValue, ValueFormatter, ValueSource};
use crate::model::{Attribute, AttributeType, AuditInfo, DataSet, DataSetList, Id, Parameter, VisibilityArea};
use crate::store::MacroContext;
use serde::Serialize;
use std::sync::Arc;

// JSON shapes served by the tree and resolve endpoints. Values are rendered
// through the formatter, so these never carry raw encrypted text.

#[derive(Debug, Serialize)]
pub struct DataSetListView {
    pub id: Id,
    pub name: String,
    pub visibility_area: VisibilityArea,
    pub test_plan_id: Option<Id>,
    #[serde(flatten)]
    pub audit: AuditInfo,
    pub attributes: Vec<AttributeView>,
    pub data_sets: Vec<DataSetView>,
    pub stats: StatsView,
}

#[derive(Debug, Serialize)]
pub struct AttributeView {
    pub id: Id,
    pub name: String,
    pub attribute_type: AttributeType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference_list_id: Option<Id>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub list_values: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct DataSetView {
    pub id: Id,
    pub name: String,
    pub locked: bool,
    pub values: Vec<ValueView>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub overrides: Vec<OverrideView>,
}

#[derive(Debug, Serialize)]
pub struct ValueView {
    pub attribute_id: Id,
    pub attribute: String,
    pub value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_set_ref_id: Option<Id>,
}

#[derive(Debug, Serialize)]
pub struct OverrideView {
    pub path_id: Id,
    pub chain: Vec<Id>,
    pub target_attribute_id: Id,
    pub target_attribute: String,
    pub value: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct StatsView {
    pub rows: usize,
    pub skipped: usize,
}

impl From<AssemblyStats> for StatsView {
    fn from(stats: AssemblyStats) -> Self {
        Self {
            rows: stats.rows,
            skipped: stats.skipped,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ResolveView {
    pub data_set_id: Id,
    pub target_attribute_id: Id,
    pub chain: Vec<Id>,
    pub value: Option<String>,
    pub source: ValueSource,
}

impl AttributeView {
    fn new(attribute: &Attribute) -> Self {
        Self {
            id: attribute.id,
            name: attribute.name.clone(),
            attribute_type: attribute.attribute_type,
            reference_list_id: attribute.reference_id(),
            list_values: attribute.list_values().iter().map(|value| value.text.clone()).collect(),
        }
    }
}

/// Render the root list of `graph`. `sorted` switches attributes and values
/// to the display order (plain attributes first, then by name).
pub fn list_view(graph: &DataSetListGraph, formatter: &ValueFormatter, sorted: bool) -> Result<DataSetListView> {
    let list = graph.root();
    let attributes = if sorted {
        list.sorted_attributes()
    } else {
        list.attributes()
    };

    let mut data_sets = Vec::new();
    for data_set in list.data_sets() {
        data_sets.push(data_set_view(list, &data_set, formatter, sorted)?);
    }

    Ok(DataSetListView {
        id: list.id,
        name: list.name.clone(),
        visibility_area: (*list.visibility_area).clone(),
        test_plan_id: list.test_plan_id,
        audit: list.audit.clone(),
        attributes: attributes.iter().map(|attribute| AttributeView::new(attribute)).collect(),
        data_sets,
        stats: graph.stats().into(),
    })
}

fn data_set_view(
    list: &Arc<DataSetList>,
    data_set: &Arc<DataSet>,
    formatter: &ValueFormatter,
    sorted: bool,
) -> Result<DataSetView> {
    let context = MacroContext {
        data_set_list_id: list.id,
        data_set_id: data_set.id,
    };
    let parameters = if sorted {
        data_set.sorted_parameters(list)
    } else {
        data_set.parameters()
    };

    let mut values = Vec::with_capacity(parameters.len());
    for parameter in &parameters {
        let Some(attribute) = list.attribute(&parameter.attribute_id) else {
            continue;
        };
        values.push(ValueView {
            attribute_id: attribute.id,
            attribute: attribute.name.clone(),
            value: formatter.format(&attribute, parameter, &context)?,
            data_set_ref_id: parameter.value.referenced_data_set_id(),
        });
    }

    let mut overrides = Vec::new();
    for parameter in data_set.overrides() {
        if let Some(view) = override_view(&parameter, formatter, &context)? {
            overrides.push(view);
        }
    }

    Ok(DataSetView {
        id: data_set.id,
        name: data_set.name.clone(),
        locked: data_set.locked,
        values,
        overrides,
    })
}

fn override_view(
    parameter: &Parameter,
    formatter: &ValueFormatter,
    context: &MacroContext,
) -> Result<Option<OverrideView>> {
    let Some(path) = &parameter.path else {
        return Ok(None);
    };
    let target = &path.target;
    Ok(Some(OverrideView {
        path_id: path.id,
        chain: path.chain.hops().to_vec(),
        target_attribute_id: target.id,
        target_attribute: target.name.clone(),
        value: formatter.format(&target, parameter, context)?,
    }))
}

pub fn resolve_view(
    data_set_id: Id,
    target: &Attribute,
    chain: &[Id],
    resolved: &ResolvedValue,
    formatter: &ValueFormatter,
    context: &MacroContext,
) -> Result<ResolveView> {
    Ok(ResolveView {
        data_set_id,
        target_attribute_id: target.id,
        chain: chain.to_vec(),
        value: formatter.format_resolved(target, resolved, context)?,
        source: resolved.source.clone(),
    })
}
