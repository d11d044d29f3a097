use thiserror::Error;

use crate::analyzer::ReasoningError;
use crate::store::StoreError;

/// Errors surfaced by a correlation run. Per-candidate analysis failures are
/// logged and counted instead of being raised here, so one bad evidence item
/// never aborts its siblings.
#[derive(Debug, Error)]
pub enum CorrelationError {
    #[error("audit context not found for audit {0}")]
    ContextNotFound(i32),

    #[error("reasoning service error: {0}")]
    Reasoning(#[from] ReasoningError),

    #[error("relational store error: {0}")]
    Store(#[from] StoreError),

    #[error("persistence failure: {0}")]
    Persistence(String),

    #[error("no compliance row resolvable for matched compliance id {compliance_id}")]
    MappingUnresolved { compliance_id: i32 },

    #[error("verification dispatch failed: {0}")]
    Dispatch(String),
}
