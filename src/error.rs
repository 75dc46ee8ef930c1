use thiserror::Error;

/// Errors raised by the relation/index layer.
#[derive(Debug, Error)]
pub enum RelationError {
    #[error("Storage error: {0}")]
    Storage(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("relation already exists: {0}")]
    AlreadyExists(String),

    #[error("relation does not exist: {0}")]
    NoSuchRelation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid: {0}")]
    Invalid(String),

    #[error("corrupt record: {0}")]
    Corrupt(String),
}

/// The one error surface callers of the executor see.
#[derive(Debug, Error)]
pub enum SqlExecError {
    #[error("DbRelationError: {0}")]
    Relation(#[from] RelationError),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("unrecognized statement: {0}")]
    Shape(String),

    #[error("unsupported column definition: {0}")]
    Definition(String),

    #[error("{0}")]
    Guard(String),
}
