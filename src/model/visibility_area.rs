use crate::model::{EntityKind, Id, Identified};
use serde::{Deserialize, Serialize};

/// Top-level container owning data set lists
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisibilityArea {
    pub id: Id,
    pub name: String,
}

impl Identified for VisibilityArea {
    const KIND: EntityKind = EntityKind::VisibilityArea;

    fn id(&self) -> Id {
        self.id
    }
}
