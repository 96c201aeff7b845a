use crate::error::Result;
use crate::model::Id;
use chrono::{DateTime, Utc};

/// One row of the joined data set list / data set / attribute / override /
/// parameter relation. Direct rows carry `attribute`; override rows carry
/// `path`. Rows without a data set describe attributes of an empty
/// selection, and a row with neither describes the bare list.
#[derive(Debug, Clone, PartialEq)]
pub struct FlatRow {
    pub visibility_area_id: Id,
    pub visibility_area_name: String,
    pub data_set_list_id: Id,
    pub data_set_list_name: String,
    pub test_plan_id: Option<Id>,
    pub created_by: Option<String>,
    pub created_when: DateTime<Utc>,
    pub modified_by: Option<String>,
    pub modified_when: DateTime<Utc>,
    pub data_set: Option<DataSetColumns>,
    pub attribute: Option<AttributeColumns>,
    pub list_value: Option<ListValueColumns>,
    pub path: Option<PathColumns>,
    pub parameter: Option<ParameterColumns>,
}

impl FlatRow {
    pub fn is_override(&self) -> bool {
        self.path.is_some()
    }

    /// (data set order, attribute order); rows without a data set come first
    /// and override rows follow the direct rows of their data set.
    pub fn sort_key(&self) -> (i32, i32) {
        let data_set = self.data_set.as_ref().map_or(i32::MIN, |ds| ds.ordering);
        let attribute = match (&self.attribute, &self.path) {
            (Some(attribute), _) => attribute.ordering,
            (None, Some(_)) => i32::MAX,
            (None, None) => i32::MIN,
        };
        (data_set, attribute)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DataSetColumns {
    pub id: Id,
    pub name: String,
    pub ordering: i32,
    pub locked: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AttributeColumns {
    pub id: Id,
    pub name: String,
    /// Raw type tag as stored
    pub attribute_type: String,
    pub reference_list_id: Option<Id>,
    pub ordering: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ListValueColumns {
    pub id: Id,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PathColumns {
    pub id: Id,
    pub chain_key: String,
    pub target_attribute_id: Id,
    pub target_list_id: Id,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParameterColumns {
    pub id: Id,
    pub text: Option<String>,
    pub list_value_id: Option<Id>,
    pub data_set_ref_id: Option<Id>,
}

/// Which part of a data set list a row stream covers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowQuery {
    pub data_set_list_id: Id,
    /// `None` selects every data set; `Some(empty)` selects none
    pub data_set_ids: Option<Vec<Id>>,
    pub attribute_ids: Option<Vec<Id>>,
}

impl RowQuery {
    pub fn list(data_set_list_id: Id) -> Self {
        Self {
            data_set_list_id,
            data_set_ids: None,
            attribute_ids: None,
        }
    }

    pub fn batch(data_set_list_id: Id, data_set_ids: Vec<Id>) -> Self {
        Self {
            data_set_list_id,
            data_set_ids: Some(data_set_ids),
            attribute_ids: None,
        }
    }

    pub fn with_data_sets(mut self, ids: Vec<Id>) -> Self {
        self.data_set_ids = Some(ids);
        self
    }

    pub fn with_attributes(mut self, ids: Vec<Id>) -> Self {
        self.attribute_ids = Some(ids);
        self
    }

    pub fn selects_data_set(&self, id: &Id) -> bool {
        self.data_set_ids.as_ref().map_or(true, |ids| ids.contains(id))
    }

    pub fn selects_attribute(&self, id: &Id) -> bool {
        self.attribute_ids.as_ref().map_or(true, |ids| ids.contains(id))
    }
}

/// Forward-only stream of [`FlatRow`]s. The backing resource is released
/// exactly once: on [`close`](RowStream::close) or on drop.
pub struct RowStream {
    rows: Box<dyn Iterator<Item = Result<FlatRow>> + Send>,
    on_close: Option<Box<dyn FnOnce() + Send>>,
}

impl RowStream {
    pub fn new(rows: impl Iterator<Item = Result<FlatRow>> + Send + 'static) -> Self {
        Self {
            rows: Box::new(rows),
            on_close: None,
        }
    }

    pub fn from_rows(rows: Vec<FlatRow>) -> Self {
        Self::new(rows.into_iter().map(Ok))
    }

    pub fn empty() -> Self {
        Self::from_rows(Vec::new())
    }

    /// Run `release` when the stream is closed or dropped
    pub fn on_close(mut self, release: impl FnOnce() + Send + 'static) -> Self {
        self.on_close = Some(Box::new(release));
        self
    }

    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(release) = self.on_close.take() {
            release();
        }
    }
}

impl Iterator for RowStream {
    type Item = Result<FlatRow>;

    fn next(&mut self) -> Option<Self::Item> {
        self.rows.next()
    }
}

impl Drop for RowStream {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for RowStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowStream")
            .field("open", &self.on_close.is_some())
            .finish()
    }
}

/// The query-engine collaborator: yields pre-sorted, pre-filtered rows
pub trait RowSource: Send + Sync {
    fn open(&self, query: &RowQuery) -> Result<RowStream>;

    /// Rows of exactly `data_set_ids` within one list
    fn open_batch(&self, data_set_list_id: &Id, data_set_ids: &[Id]) -> Result<RowStream> {
        self.open(&RowQuery::batch(*data_set_list_id, data_set_ids.to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_stream_released_once() {
        let closed = Arc::new(AtomicUsize::new(0));
        let counter = closed.clone();
        let stream = RowStream::empty().on_close(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        stream.close();
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_stream_released_on_drop() {
        let closed = Arc::new(AtomicUsize::new(0));
        let counter = closed.clone();
        {
            let _stream = RowStream::empty().on_close(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_query_selection() {
        let (a, b) = (crate::model::generate_id(), crate::model::generate_id());
        let query = RowQuery::list(crate::model::generate_id()).with_data_sets(vec![a]);

        assert!(query.selects_data_set(&a));
        assert!(!query.selects_data_set(&b));
        assert!(query.selects_attribute(&b));
        assert!(!RowQuery::batch(a, Vec::new()).selects_data_set(&a));
    }
}
