use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum GraphError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict with existing entity {id} (identical: {identical})")]
    Conflict { id: Uuid, identical: bool },

    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    /// A read raced a write or delete in another region. Retry the whole query.
    #[error("Conflict with write/delete operations in another region: {0}")]
    RegionConflict(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Protected entity cannot be deleted: {0}")]
    ProtectedEntity(String),

    #[error("Invalid edge: {0}")]
    InvalidEdge(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Search visited more than {limit} candidates")]
    SearchLimitExceeded { limit: usize },

    #[error("Search deadline exceeded after {0} ms")]
    DeadlineExceeded(u64),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Cache error: {0}")]
    CacheError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Internal error: {0}")]
    InternalError(#[from] anyhow::Error),
}

impl GraphError {
    /// Only cross-region races are safe for the caller to retry as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, GraphError::RegionConflict(_))
    }

    pub fn not_found(kind: &str, id: impl std::fmt::Display) -> Self {
        GraphError::NotFound(format!("{} {}", kind, id))
    }
}

impl From<sqlx::Error> for GraphError {
    fn from(err: sqlx::Error) -> Self {
        crate::region::classify_sqlx_error(err)
    }
}

impl From<redis::RedisError> for GraphError {
    fn from(err: redis::RedisError) -> Self {
        GraphError::CacheError(err.to_string())
    }
}

impl From<serde_json::Error> for GraphError {
    fn from(err: serde_json::Error) -> Self {
        GraphError::InternalError(err.into())
    }
}

pub type Result<T> = std::result::Result<T, GraphError>;
