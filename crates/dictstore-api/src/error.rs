//! Error taxonomy shared by every backend.
//!
//! A missing key and an exhausted cursor are not errors; they come back as
//! `Ok(None)` / `Ok(false)`. Everything else is a `DbError`, and
//! [`DbError::class`] tells the caller whether the store is merely unusable
//! right now or actually broken.

use std::path::PathBuf;

use thiserror::Error;

/// Coarse classification used by callers to decide how to react.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Store not loaded, disabled, read-only, or in the wrong lifecycle
    /// state. Nothing was attempted; surfaced as "temporarily disabled".
    UnusableState,
    /// I/O failure, corruption or lock contention; surfaced as
    /// "store corrupted, consider rebuild".
    BackendFailure,
    /// The backend does not offer this capability.
    Unsupported,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DbError {
    #[error("store `{name}` is disabled")]
    Disabled { name: String },

    #[error("store `{name}` is not loaded")]
    NotLoaded { name: String },

    #[error("store `{name}` is read-only")]
    ReadOnly { name: String },

    /// Lifecycle operation that needs a closed store
    #[error("store `{name}` is open; close it first")]
    StillOpen { name: String },

    #[error("store `{name}` is already open")]
    AlreadyOpen { name: String },

    /// The store behind a cursor was closed
    #[error("cursor is no longer valid: its store was closed")]
    CursorInvalidated,

    #[error("a transaction is already in progress")]
    TransactionActive,

    #[error("no transaction in progress")]
    NoTransaction,

    #[error("no storage at {}", .path.display())]
    Missing { path: PathBuf },

    #[error("storage at {} is locked by another writer", .path.display())]
    Locked { path: PathBuf },

    #[error("storage at {} is corrupted: {reason}", .path.display())]
    Corrupted { path: PathBuf, reason: String },

    /// Any other backend failure, with the backend's own message
    #[error("backend failure: {0}")]
    Backend(String),

    /// A mutation inside the transaction failed, so commit rolled everything back
    #[error("transaction aborted: {reason}")]
    TransactionAborted { reason: String },

    #[error("recovery of store `{name}` failed: {reason}")]
    RecoveryFailed { name: String, reason: String },

    #[error("`{operation}` is not supported by this backend")]
    Unsupported { operation: &'static str },

    #[error("no backend registered for extension `{0}`")]
    UnknownBackend(String),
}

impl DbError {
    pub fn class(&self) -> ErrorClass {
        match self {
            DbError::Disabled { .. }
            | DbError::NotLoaded { .. }
            | DbError::ReadOnly { .. }
            | DbError::StillOpen { .. }
            | DbError::AlreadyOpen { .. }
            | DbError::CursorInvalidated
            | DbError::TransactionActive
            | DbError::NoTransaction => ErrorClass::UnusableState,
            DbError::Missing { .. }
            | DbError::Locked { .. }
            | DbError::Corrupted { .. }
            | DbError::Backend(_)
            | DbError::TransactionAborted { .. }
            | DbError::RecoveryFailed { .. } => ErrorClass::BackendFailure,
            DbError::Unsupported { .. } | DbError::UnknownBackend(_) => ErrorClass::Unsupported,
        }
    }

    /// Damage that `Recoverable::recover` may be able to repair.
    pub fn is_corruption(&self) -> bool {
        matches!(self, DbError::Corrupted { .. })
    }
}

pub type DbResult<T> = Result<T, DbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let name = "words".to_string();
        assert_eq!(DbError::Disabled { name: name.clone() }.class(), ErrorClass::UnusableState);
        assert_eq!(DbError::ReadOnly { name }.class(), ErrorClass::UnusableState);
        assert_eq!(DbError::CursorInvalidated.class(), ErrorClass::UnusableState);
        assert_eq!(DbError::Backend("disk".into()).class(), ErrorClass::BackendFailure);
        assert_eq!(
            DbError::Unsupported { operation: "begin_transaction" }.class(),
            ErrorClass::Unsupported
        );
    }

    #[test]
    fn test_only_corruption_is_recoverable() {
        let corrupted = DbError::Corrupted { path: "/tmp/x".into(), reason: "crc".into() };
        assert!(corrupted.is_corruption());
        assert!(!DbError::Locked { path: "/tmp/x".into() }.is_corruption());
    }

    #[test]
    fn test_display_names_the_store() {
        let err = DbError::StillOpen { name: "words".into() };
        assert!(err.to_string().contains("`words`"));
    }
}
