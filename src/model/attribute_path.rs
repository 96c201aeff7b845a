use crate::error::DataSetError;
use crate::model::{generate_path_id, Attribute, EntityKind, Id, Identified};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Separator of the compact chain key used in row streams and storage
pub const CHAIN_KEY_SEPARATOR: char = '_';

/// Longest chain an override may be written through
pub const DEFAULT_MAX_CHAIN_DEPTH: usize = 15;

/// Ordered reference attribute ids leading from a data set to a target attribute
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttributeChain(Vec<Id>);

impl AttributeChain {
    pub fn new(hops: Vec<Id>) -> Self {
        Self(hops)
    }

    pub fn hops(&self) -> &[Id] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Structural containment; ids are compared whole, never as substrings
    pub fn contains(&self, attribute_id: &Id) -> bool {
        self.0.contains(attribute_id)
    }

    pub fn into_inner(self) -> Vec<Id> {
        self.0
    }
}

impl From<Vec<Id>> for AttributeChain {
    fn from(hops: Vec<Id>) -> Self {
        Self(hops)
    }
}

impl fmt::Display for AttributeChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, hop) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "{}", CHAIN_KEY_SEPARATOR)?;
            }
            write!(f, "{}", hop)?;
        }
        Ok(())
    }
}

impl FromStr for AttributeChain {
    type Err = DataSetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Ok(Self::default());
        }
        s.split(CHAIN_KEY_SEPARATOR)
            .map(|hop| {
                hop.parse::<Id>()
                    .map_err(|e| DataSetError::InvalidPath(format!("bad chain key '{}': {}", s, e)))
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Self)
    }
}

/// Address of an override: the chain of reference attributes followed from
/// one data set down to a target attribute.
#[derive(Debug)]
pub struct AttributePath {
    pub id: Id,
    pub data_set_list_id: Id,
    pub data_set_id: Id,
    pub chain: AttributeChain,
    pub target: Arc<Attribute>,
}

impl AttributePath {
    pub fn new(data_set_list_id: Id, data_set_id: Id, chain: AttributeChain, target: Arc<Attribute>) -> Self {
        let id = generate_path_id(&data_set_list_id, &data_set_id, &target.id, chain.hops());
        Self {
            id,
            data_set_list_id,
            data_set_id,
            chain,
            target,
        }
    }

    /// Path with an id already assigned by storage
    pub fn with_id(
        id: Id,
        data_set_list_id: Id,
        data_set_id: Id,
        chain: AttributeChain,
        target: Arc<Attribute>,
    ) -> Self {
        Self {
            id,
            data_set_list_id,
            data_set_id,
            chain,
            target,
        }
    }

    pub fn target_attribute_id(&self) -> Id {
        self.target.id
    }

    /// True when this path addresses `target` through exactly `chain`
    pub fn addresses(&self, target: &Id, chain: &[Id]) -> bool {
        &self.target.id == target && self.chain.hops() == chain
    }
}

impl Identified for AttributePath {
    const KIND: EntityKind = EntityKind::AttributePath;

    fn id(&self) -> Id {
        self.id
    }
}
