use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

pub type Id = Uuid;

/// Kinds of entity addressable through the identity cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    VisibilityArea,
    DataSetList,
    Attribute,
    ListValue,
    DataSet,
    Parameter,
    AttributePath,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::VisibilityArea => "visibility area",
            EntityKind::DataSetList => "data set list",
            EntityKind::Attribute => "attribute",
            EntityKind::ListValue => "list value",
            EntityKind::DataSet => "data set",
            EntityKind::Parameter => "parameter",
            EntityKind::AttributePath => "attribute path",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Implemented by every graph entity that can live in the identity cache
pub trait Identified: Send + Sync + 'static {
    const KIND: EntityKind;

    fn id(&self) -> Id;
}

/// Who touched a data set list and when
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditInfo {
    pub created_by: Option<String>,
    pub created_when: DateTime<Utc>,
    pub modified_by: Option<String>,
    pub modified_when: DateTime<Utc>,
}

impl AuditInfo {
    pub fn created(user: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            created_by: user.clone(),
            created_when: now,
            modified_by: user,
            modified_when: now,
        }
    }

    pub fn touch(&mut self, user: Option<String>) {
        self.modified_by = user;
        self.modified_when = Utc::now();
    }
}

pub fn generate_id() -> Id {
    Uuid::new_v4()
}

/// Derive the id of an attribute path from its full address.
/// The same (list, data set, target, chain) always maps to the same id, so
/// repeated overrides at one address reuse one path.
pub fn generate_path_id(data_set_list_id: &Id, data_set_id: &Id, target_attribute_id: &Id, chain: &[Id]) -> Id {
    let mut hasher = Sha256::new();
    hasher.update(data_set_list_id.as_bytes());
    hasher.update(data_set_id.as_bytes());
    hasher.update(target_attribute_id.as_bytes());
    for hop in chain {
        hasher.update(hop.as_bytes());
    }
    let digest = hasher.finalize();

    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    // Stamp as an RFC 4122 name-based UUID
    bytes[6] = (bytes[6] & 0x0f) | 0x50;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;
    Uuid::from_bytes(bytes)
}

/// Children of a graph node in attach order, indexed by id so attaching and
/// lookup stay constant time while a large list is assembled.
#[derive(Debug)]
pub struct Children<T> {
    items: Vec<Arc<T>>,
    index: HashMap<Id, usize>,
}

impl<T> Default for Children<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            index: HashMap::new(),
        }
    }
}

impl<T: Identified> Children<T> {
    pub fn get(&self, id: &Id) -> Option<Arc<T>> {
        self.index.get(id).map(|&position| self.items[position].clone())
    }

    pub fn contains(&self, id: &Id) -> bool {
        self.index.contains_key(id)
    }

    /// Returns false when a child with the same id is already present
    pub fn insert(&mut self, item: Arc<T>) -> bool {
        match self.index.entry(item.id()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(self.items.len());
                self.items.push(item);
                true
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<T>> {
        self.items.iter()
    }

    pub fn to_vec(&self) -> Vec<Arc<T>> {
        self.items.clone()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
