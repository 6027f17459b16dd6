use serde::Serialize;

use crate::entity::EntityId;

/// ParqueDB error types
#[derive(Debug, thiserror::Error)]
pub enum ParqueError {
    #[error("version conflict on {ns}/{id}: expected {expected}, actual {actual:?}")]
    VersionConflict {
        expected: u64,
        actual: Option<u64>,
        ns: String,
        id: String,
    },

    #[error("entity not found: {ns}/{id}")]
    EntityNotFound { ns: String, id: String },

    #[error("validation failed for `{field}`: {reason}")]
    Validation { field: String, reason: String },

    #[error("relationship {operation:?} on {ns}.{relation} failed: {kind:?}{}", target_context(.target_id))]
    Relationship {
        operation: RelationshipOp,
        ns: String,
        relation: String,
        target_id: Option<String>,
        kind: RelationshipErrorKind,
    },

    #[error("event {operation} failed ({kind:?}){}", entity_context(.entity_id))]
    Event {
        operation: String,
        entity_id: Option<String>,
        kind: EventErrorKind,
    },

    #[error("query rejected ({kind:?}): {detail}")]
    Query { kind: QueryErrorKind, detail: String },

    #[error("storage failure ({kind:?}): {detail}")]
    Storage {
        kind: StorageErrorKind,
        detail: String,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("arrow error: {0}")]
    Arrow(String),

    #[error("internal error: {0}")]
    Internal(String),
}

fn target_context(target_id: &Option<String>) -> String {
    match target_id {
        Some(id) => format!(" (target {id})"),
        None => String::new(),
    }
}

fn entity_context(entity_id: &Option<String>) -> String {
    match entity_id {
        Some(id) => format!(" for {id}"),
        None => String::new(),
    }
}

/// Which relationship operation produced the error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RelationshipOp {
    Link,
    Unlink,
    Hydrate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum RelationshipErrorKind {
    UndefinedRelation,
    TargetMissing,
    TargetDeleted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum EventErrorKind {
    NotFound,
    FutureTime,
    DidNotExist,
    OnDeleted,
    WriteFailed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum QueryErrorKind {
    InvalidFilter,
    InvalidCursor,
    InvalidPagination,
    InjectionDetected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum StorageErrorKind {
    CircuitOpen,
    Timeout,
    Io,
    Corrupted,
}

impl ParqueError {
    /// Shorthand for a version conflict against a reconstructed entity.
    pub fn version_conflict(expected: u64, actual: Option<u64>, id: &EntityId) -> Self {
        Self::VersionConflict {
            expected,
            actual,
            ns: id.namespace.clone(),
            id: id.local_id.clone(),
        }
    }

    pub fn entity_not_found(id: &EntityId) -> Self {
        Self::EntityNotFound {
            ns: id.namespace.clone(),
            id: id.local_id.clone(),
        }
    }

    pub fn storage_io(detail: impl Into<String>) -> Self {
        Self::Storage {
            kind: StorageErrorKind::Io,
            detail: detail.into(),
        }
    }

    pub fn query(kind: QueryErrorKind, detail: impl Into<String>) -> Self {
        Self::Query {
            kind,
            detail: detail.into(),
        }
    }

    /// Transient errors are eligible for retry by the compaction worker.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Storage {
                kind: StorageErrorKind::Io | StorageErrorKind::Timeout,
                ..
            }
        )
    }
}

impl From<arrow::error::ArrowError> for ParqueError {
    fn from(err: arrow::error::ArrowError) -> Self {
        ParqueError::Arrow(err.to_string())
    }
}

impl From<parquet::errors::ParquetError> for ParqueError {
    fn from(err: parquet::errors::ParquetError) -> Self {
        ParqueError::Storage {
            kind: StorageErrorKind::Io,
            detail: err.to_string(),
        }
    }
}

impl From<std::io::Error> for ParqueError {
    fn from(err: std::io::Error) -> Self {
        ParqueError::Storage {
            kind: StorageErrorKind::Io,
            detail: err.to_string(),
        }
    }
}

/// Custom Result type for ParqueDB operations
pub type Result<T> = std::result::Result<T, ParqueError>;
