//! Engine error → contract error.

use dictstore_api::{DbError, DbState};
use dictstore_engine::EngineError;

/// Classify an engine failure for the store behind `state`.
///
/// A closed engine can only be observed through a cursor that outlived its
/// store, so it surfaces as `CursorInvalidated`.
pub(crate) fn db_error(state: &DbState, err: EngineError) -> DbError {
    match err {
        EngineError::NotFound { path } => DbError::Missing { path },
        EngineError::Locked { path } => DbError::Locked { path },
        EngineError::Closed => DbError::CursorInvalidated,
        EngineError::ReadOnly => DbError::ReadOnly { name: state.name().to_string() },
        err if err.is_corruption() => DbError::Corrupted {
            path: state.file_path().to_path_buf(),
            reason: err.to_string(),
        },
        err => DbError::Backend(err.to_string()),
    }
}
