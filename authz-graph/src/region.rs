//! Cross-region conflict detection.
//!
//! A tenant's graph can be written independently in several regions. A read
//! made during attribute resolution may race a write or delete in another
//! region that has not replicated yet. Such races are reported as
//! [`GraphError::RegionConflict`] so callers retry instead of trusting a
//! transient "no attribute" answer.

use crate::error::GraphError;
use crate::models::Edge;
use crate::store::GraphStore;
use tracing::{error, warn};

pub const UNIQUE_VIOLATION: &str = "23505";
pub const FOREIGN_KEY_VIOLATION: &str = "23503";
pub const SERIALIZATION_FAILURE: &str = "40001";
pub const DEADLOCK_DETECTED: &str = "40P01";
/// Raised by multi-region deployments when a read observes an uncommitted intent
pub const READ_WITHIN_UNCERTAINTY: &str = "40003";

pub const REGION_CONFLICT_MESSAGE: &str =
    "Conflict with write/delete operations in another region. Please retry the call";

/// SQLSTATE codes that signal a concurrent write elsewhere
pub fn is_transaction_conflict(code: &str) -> bool {
    matches!(
        code,
        SERIALIZATION_FAILURE | DEADLOCK_DETECTED | READ_WITHIN_UNCERTAINTY
    )
}

fn sqlstate(err: &sqlx::Error) -> Option<String> {
    match err {
        sqlx::Error::Database(db) => db.code().map(|c| c.into_owned()),
        _ => None,
    }
}

pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    sqlstate(err).as_deref() == Some(UNIQUE_VIOLATION)
}

pub fn is_foreign_key_violation(err: &sqlx::Error) -> bool {
    sqlstate(err).as_deref() == Some(FOREIGN_KEY_VIOLATION)
}

/// Map a storage error onto the graph error taxonomy
pub fn classify_sqlx_error(err: sqlx::Error) -> GraphError {
    match sqlstate(&err) {
        Some(code) if is_transaction_conflict(&code) => {
            warn!("Transaction conflict ({}): {}", code, err);
            GraphError::RegionConflict(REGION_CONFLICT_MESSAGE.to_string())
        }
        _ => match err {
            sqlx::Error::RowNotFound => GraphError::NotFound("row".to_string()),
            other => GraphError::StorageError(other.to_string()),
        },
    }
}

/// An edge whose edge type cannot be loaded means the cached edges and the
/// types have drifted apart, typically because another region deleted the
/// type. Drop cached edge data and ask the caller to retry.
pub async fn edge_type_desync(store: &dyn GraphStore, edge: &Edge) -> GraphError {
    error!(
        "Edge {} references missing edge type {}; flushing cached edges",
        edge.base.id, edge.edge_type_id
    );
    if let Err(e) = store.invalidate_edge_cache().await {
        error!("Failed to flush edge cache after desync: {}", e);
    }
    GraphError::RegionConflict(REGION_CONFLICT_MESSAGE.to_string())
}
