//! Storage Error Types
//!
//! Failures are isolated per key: one corrupt or unreadable entry never
//! prevents operations on other keys.

use std::path::PathBuf;

/// Error types for durable usage storage
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Filesystem failure while reading or writing a storage file
    #[error("I/O failure on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Persisted state for one key failed to parse. Other keys are
    /// unaffected; the damaged file is left in place for inspection.
    #[error("corrupt entry for key {key}: {detail}")]
    CorruptEntry { key: String, detail: String },

    /// Entry could not be serialized; nothing was written
    #[error("failed to serialize state for key {key}: {source}")]
    Serialize {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    /// Store I/O exceeded the configured deadline
    #[error("storage operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
}

impl StorageError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn corrupt(key: impl Into<String>, detail: impl ToString) -> Self {
        Self::CorruptEntry {
            key: key.into(),
            detail: detail.to_string(),
        }
    }
}
