use std::fmt;

use thiserror::Error;

/// Backend operation that produced a [`StorageError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Write,
    Read,
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Operation::Write => "write",
            Operation::Read => "read",
            Operation::Delete => "delete",
        })
    }
}

/// Failure to obtain a usable store handle.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// Master key or other key material could not be loaded or generated.
    #[error("key material unavailable: {reason}")]
    KeyMaterial { reason: String },
    /// The OS refused access to the backing store.
    #[error("access denied: {reason}")]
    AccessDenied { reason: String },
    /// The backing store cannot be reached (missing service, daemon down).
    #[error("store unavailable: {reason}")]
    Unavailable { reason: String },
    /// Disk I/O failed while opening the store.
    #[error("i/o failure: {reason}")]
    Io { reason: String },
    /// The persisted store exists but cannot be parsed.
    #[error("store corrupted: {reason}")]
    Corrupted { reason: String },
}

/// Failure reported by the backing store, including handle acquisition.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Failed to initialize secure storage: {0}")]
    Provider(#[from] ProviderError),
    /// A write/read/delete call returned a non-success status.
    #[error("Failed to {operation} secure storage item: {status}")]
    Backend { operation: Operation, status: String },
}

impl StorageError {
    pub fn backend(operation: Operation, status: impl fmt::Display) -> Self {
        StorageError::Backend {
            operation,
            status: status.to_string(),
        }
    }
}

/// Errors surfaced by the executor to its callers.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SecureStoreError {
    /// Caller omitted or malformed a required argument. Raised before any backend call.
    #[error("{message}")]
    InvalidArgument { message: String },
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl SecureStoreError {
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        SecureStoreError::InvalidArgument {
            message: message.into(),
        }
    }

    /// Stable error code reported over the method-call channel.
    pub fn code(&self) -> &'static str {
        match self {
            SecureStoreError::InvalidArgument { .. } => "INVALID_ARGUMENT",
            SecureStoreError::Storage(_) => "STORAGE_ERROR",
        }
    }
}

impl From<ProviderError> for SecureStoreError {
    fn from(err: ProviderError) -> Self {
        SecureStoreError::Storage(StorageError::Provider(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_failures_report_as_storage_errors() {
        let err = SecureStoreError::from(ProviderError::Io {
            reason: "disk full".into(),
        });
        assert_eq!(err.code(), "STORAGE_ERROR");
        assert_eq!(
            err.to_string(),
            "Failed to initialize secure storage: i/o failure: disk full"
        );
    }

    #[test]
    fn backend_message_embeds_status() {
        let err = SecureStoreError::from(StorageError::backend(Operation::Delete, "-25299"));
        assert_eq!(err.to_string(), "Failed to delete secure storage item: -25299");
    }
}
