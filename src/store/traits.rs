use crate::error::Result;
use crate::model::Id;
use crate::store::records::{
    AttributePathRecord, AttributeRecord, DataSetListRecord, DataSetRecord, ListValueRecord, NewAttribute,
    ParameterInput, ParameterRecord, VisibilityAreaRecord,
};
use crate::store::row_stream::RowSource;

#[async_trait::async_trait]
pub trait VisibilityAreaStore: Send + Sync {
    async fn get_visibility_area(&self, id: &Id) -> Result<Option<VisibilityAreaRecord>>;
    async fn create_visibility_area(&self, name: &str) -> Result<VisibilityAreaRecord>;
    /// Cascades to every owned data set list
    async fn delete_visibility_area(&self, id: &Id) -> Result<bool>;
}

#[async_trait::async_trait]
pub trait DataSetListStore: Send + Sync {
    async fn get_data_set_list(&self, id: &Id) -> Result<Option<DataSetListRecord>>;
    async fn list_data_set_lists(&self, visibility_area_id: &Id) -> Result<Vec<DataSetListRecord>>;
    /// Name must be unique within the visibility area
    async fn create_data_set_list(
        &self,
        visibility_area_id: &Id,
        name: &str,
        test_plan_id: Option<Id>,
        user: Option<String>,
    ) -> Result<DataSetListRecord>;
    async fn rename_data_set_list(&self, id: &Id, name: &str, user: Option<String>) -> Result<DataSetListRecord>;
    /// Cascades to attributes and data sets, and deletes attributes of other
    /// lists that referenced this one
    async fn delete_data_set_list(&self, id: &Id) -> Result<bool>;
}

#[async_trait::async_trait]
pub trait AttributeStore: Send + Sync {
    async fn get_attribute(&self, id: &Id) -> Result<Option<AttributeRecord>>;
    /// Attributes of a list ordered by position
    async fn list_attributes(&self, data_set_list_id: &Id) -> Result<Vec<AttributeRecord>>;
    async fn list_values(&self, attribute_id: &Id) -> Result<Vec<ListValueRecord>>;
    async fn create_attribute(&self, data_set_list_id: &Id, attribute: NewAttribute) -> Result<AttributeRecord>;
    async fn add_list_value(&self, attribute_id: &Id, text: &str) -> Result<ListValueRecord>;
    /// Clears parameters that selected the value
    async fn delete_list_value(&self, id: &Id) -> Result<bool>;
    /// Cascades to parameters, list values and every attribute path whose
    /// target or chain contains the attribute
    async fn delete_attribute(&self, id: &Id) -> Result<bool>;
}

#[async_trait::async_trait]
pub trait DataSetStore: Send + Sync {
    async fn get_data_set(&self, id: &Id) -> Result<Option<DataSetRecord>>;
    async fn list_data_sets(&self, data_set_list_id: &Id) -> Result<Vec<DataSetRecord>>;
    /// Name must be unique within the list
    async fn create_data_set(&self, data_set_list_id: &Id, name: &str) -> Result<DataSetRecord>;
    async fn set_data_set_locked(&self, id: &Id, locked: bool) -> Result<DataSetRecord>;
    /// Cascades to parameters and owned paths, and clears references to it
    async fn delete_data_set(&self, id: &Id) -> Result<bool>;
}

#[async_trait::async_trait]
pub trait ParameterStore: Send + Sync {
    async fn get_parameter(&self, data_set_id: &Id, attribute_id: &Id) -> Result<Option<ParameterRecord>>;
    async fn set_parameter(&self, data_set_id: &Id, attribute_id: &Id, input: ParameterInput)
        -> Result<ParameterRecord>;
    async fn clear_parameter(&self, data_set_id: &Id, attribute_id: &Id) -> Result<bool>;
    async fn get_override_path(
        &self,
        data_set_id: &Id,
        target_attribute_id: &Id,
        chain: &[Id],
    ) -> Result<Option<AttributePathRecord>>;
    async fn list_paths(&self, data_set_id: &Id) -> Result<Vec<AttributePathRecord>>;
    /// Write the override for `target` reached through `chain` from the data set
    async fn set_override(
        &self,
        data_set_id: &Id,
        target_attribute_id: &Id,
        chain: &[Id],
        input: ParameterInput,
    ) -> Result<ParameterRecord>;
    /// Remove the override and its path; false when none existed
    async fn clear_override(&self, data_set_id: &Id, target_attribute_id: &Id, chain: &[Id]) -> Result<bool>;
}

pub trait Store:
    VisibilityAreaStore + DataSetListStore + AttributeStore + DataSetStore + ParameterStore + RowSource + Send + Sync
{
}

impl<T> Store for T where
    T: VisibilityAreaStore + DataSetListStore + AttributeStore + DataSetStore + ParameterStore + RowSource + Send + Sync
{
}
