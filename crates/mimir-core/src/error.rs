use thiserror::Error;

/// A feed `handle` that failed validation against `^[-a-z0-9_]+$`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid handle: {0:?}")]
pub struct InvalidHandle(pub String);

/// Errors shared across the aggregator and monitor that don't belong to a
/// single crate's own error enum (handle validation, canonical-form JSON
/// round-tripping used for entry equality).
#[derive(Error, Debug)]
pub enum CoreError {
    #[error(transparent)]
    InvalidHandle(#[from] InvalidHandle),

    #[error("failed to canonicalize entry for comparison: {0}")]
    Canonicalize(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CoreError>;
