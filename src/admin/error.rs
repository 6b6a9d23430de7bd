//! Admin Operation Error Types

use crate::store::StorageError;

/// Error types for admin override and reset operations
#[derive(Debug, thiserror::Error)]
pub enum AdminError {
    /// Overrides are switched off in the admin configuration
    #[error("admin overrides are disabled")]
    OverridesDisabled,

    /// Emergency (all-identifier) overrides are switched off
    #[error("emergency overrides are disabled")]
    EmergencyDisabled,

    /// Configuration requires a justification and none was given
    #[error("a justification is required to grant an override")]
    JustificationRequired,

    /// The target (identifier, operation_type) has no usage entry
    #[error("no usage entry for {key}")]
    UnknownKey { key: String },

    /// The acting user may not perform this action
    #[error("user {user:?} is not permitted to {action}")]
    PermissionDenied { user: String, action: String },

    /// The underlying store failed
    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),
}
