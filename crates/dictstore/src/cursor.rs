//! Cursors over a live [`ClawEngine`].
//!
//! Every step is a fresh ordered lookup against the engine's table, so a
//! cursor never holds a lock between calls. Once the store closes its engine
//! the next lookup fails and the cursor reports `CursorInvalidated`.

use std::fmt;
use std::ops::Bound;
use std::sync::Arc;

use dictstore_api::{DbError, DbResult, OrderedSource, PrefixCursor, Record};
use dictstore_engine::{ClawEngine, EngineError};

use crate::namespace;

/// Cursor type handed out by [`ClawDb`](crate::ClawDb).
pub type ClawCursor = PrefixCursor<EngineSource>;

/// One key space of an engine, viewed as an ordered source.
pub struct EngineSource {
    engine: Arc<ClawEngine>,
    namespace: u8,
}

impl EngineSource {
    pub(crate) fn new(engine: Arc<ClawEngine>, namespace: u8) -> Self {
        Self { engine, namespace }
    }
}

impl OrderedSource for EngineSource {
    fn first_from(&self, from: Bound<&[u8]>) -> DbResult<Option<Record>> {
        let bound = namespace::physical_bound(self.namespace, from);
        let found = self
            .engine
            .seek(namespace::borrow_bound(&bound))
            .map_err(|err| match err {
                EngineError::Closed => DbError::CursorInvalidated,
                err => DbError::Backend(err.to_string()),
            })?;
        Ok(found.and_then(|(key, value)| {
            namespace::logical_key(self.namespace, &key).map(|logical| (logical.to_vec(), value))
        }))
    }
}

impl fmt::Debug for EngineSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineSource")
            .field("path", &self.engine.path())
            .field("namespace", &self.namespace)
            .finish()
    }
}
