use crate::model::{EntityKind, Id};

pub type Result<T> = std::result::Result<T, DataSetError>;

/// Errors raised by the data set graph core and its stores.
#[derive(Debug, thiserror::Error)]
pub enum DataSetError {
    /// Requested entity is absent. Local lookups return `Option` instead.
    #[error("{kind} not found: {id}")]
    NotFound { kind: EntityKind, id: Id },

    /// A stream row contradicts what is already known about the graph
    #[error("inconsistent graph: {0}")]
    InconsistentGraph(String),

    /// Override chain is longer than the configured cap
    #[error("attribute chain depth {depth} exceeds maximum of {max}")]
    ChainDepthExceeded { depth: usize, max: usize },

    /// A hop on an override chain holds no data set reference
    #[error("override target unreachable: attribute {attribute_id} on data set {data_set_id} holds no reference")]
    UnreachableOverrideTarget { data_set_id: Id, attribute_id: Id },

    /// A `compute_if_absent` loader produced nothing
    #[error("cache loader returned nothing for {kind} {id}")]
    CacheContractViolation { kind: EntityKind, id: Id },

    #[error("{kind} named '{name}' already exists")]
    DuplicateName { kind: EntityKind, name: String },

    #[error("invalid attribute: {0}")]
    InvalidAttribute(String),

    #[error("invalid attribute path: {0}")]
    InvalidPath(String),

    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    #[error("data set {0} is locked")]
    RowLocked(Id),

    #[error("storage error: {0}")]
    Storage(String),
}

impl DataSetError {
    pub fn not_found(kind: EntityKind, id: Id) -> Self {
        Self::NotFound { kind, id }
    }

    pub fn inconsistent(message: impl Into<String>) -> Self {
        Self::InconsistentGraph(message.into())
    }

    pub fn storage(err: impl std::fmt::Display) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<sqlx::Error> for DataSetError {
    fn from(err: sqlx::Error) -> Self {
        Self::storage(err)
    }
}
