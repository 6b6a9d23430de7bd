//! Rate Limit Error Types
//!
//! `Exceeded` and `BatchTooLarge` are expected control flow for callers of
//! `consume` on non-degradable operations, not faults. Storage failures only
//! surface here when the configured policy is fail-closed.

use chrono::{DateTime, Utc};

use super::windows::LimitKind;
use crate::store::StorageError;

/// Error types for admission and consumption
#[derive(Debug, thiserror::Error)]
pub enum RateLimitError {
    /// A window limit was hit and the operation type is not degradable
    #[error("{kind} limit exceeded for {operation_type}: {current}/{limit}, resets at {reset_time}")]
    Exceeded {
        operation_type: String,
        kind: LimitKind,
        current: u64,
        limit: u64,
        reset_time: DateTime<Utc>,
    },

    /// Requested amount is above the per-request ceiling. Never subject to
    /// graceful degradation.
    #[error("batch of {amount} exceeds max batch size {max_batch_size} for {operation_type}")]
    BatchTooLarge {
        operation_type: String,
        amount: u64,
        max_batch_size: u64,
    },

    /// Storage failed and the configured policy is fail-closed
    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),

    /// Storage was reported unavailable without an underlying error to
    /// attach, e.g. a fail-closed decision surfaced through `check`.
    #[error("storage unavailable for {operation_type}")]
    StorageUnavailable { operation_type: String },
}
