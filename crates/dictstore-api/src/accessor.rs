//! Ordered, prefix-scoped cursors.
//!
//! Every backend yields records in ascending byte-wise key order and honours
//! the same prefix predicate, [`matches_prefix`]. Backends that can answer
//! "first record at or after this key" get the whole cursor protocol for free
//! by wrapping that lookup in a [`PrefixCursor`].

use std::ops::Bound;

use crate::error::DbResult;

/// One key-value record.
pub type Record = (Vec<u8>, Vec<u8>);

/// True iff `prefix` is empty or `key` starts with it, byte for byte.
pub fn matches_prefix(prefix: &[u8], key: &[u8]) -> bool {
    key.starts_with(prefix)
}

/// A cursor over one store's records.
///
/// A cursor is produced by exactly one store. Once that store is closed,
/// operations that read records fail with `DbError::CursorInvalidated`.
pub trait DbAccessor: Send {
    /// Rewind to the start of the prefix range and clear exhaustion.
    fn reset(&mut self);

    /// Reposition to the first key >= `key` (an absolute key, not relative
    /// to the prefix).
    ///
    /// Returns `true` if a matching record is now available. If the new
    /// position lies outside the prefix range the cursor is exhausted. An
    /// exhausted cursor stays exhausted until `reset`.
    fn jump(&mut self, key: &[u8]) -> DbResult<bool>;

    /// Produce the next record, or `None` once no matching record is left.
    fn next_record(&mut self) -> DbResult<Option<Record>>;

    fn exhausted(&self) -> bool;

    fn prefix(&self) -> &[u8];

    fn matches_prefix(&self, key: &[u8]) -> bool {
        matches_prefix(self.prefix(), key)
    }
}

/// An ordered key space a [`PrefixCursor`] can walk.
pub trait OrderedSource: Send {
    /// The first record whose key lies at or after `from`.
    fn first_from(&self, from: Bound<&[u8]>) -> DbResult<Option<Record>>;
}

/// Cursor protocol shared by all backends.
///
/// Positions are keys, not iterators, so each step is a fresh ordered lookup
/// and writes made during a scan are seen if they land ahead of the position.
#[derive(Debug)]
pub struct PrefixCursor<S> {
    source: S,
    prefix: Vec<u8>,
    /// Next record is the first key inside this bound
    position: Bound<Vec<u8>>,
    exhausted: bool,
}

impl<S: OrderedSource> PrefixCursor<S> {
    pub fn new(source: S, prefix: impl Into<Vec<u8>>) -> Self {
        let prefix = prefix.into();
        Self { source, position: Bound::Included(prefix.clone()), prefix, exhausted: false }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    fn lookup(&self) -> DbResult<Option<Record>> {
        let from = match &self.position {
            Bound::Included(key) => Bound::Included(key.as_slice()),
            Bound::Excluded(key) => Bound::Excluded(key.as_slice()),
            Bound::Unbounded => Bound::Unbounded,
        };
        self.source.first_from(from)
    }
}

impl<S: OrderedSource> DbAccessor for PrefixCursor<S> {
    fn reset(&mut self) {
        self.position = Bound::Included(self.prefix.clone());
        self.exhausted = false;
    }

    fn jump(&mut self, key: &[u8]) -> DbResult<bool> {
        if self.exhausted {
            return Ok(false);
        }
        // Keys below the prefix can never match.
        let target = if key < self.prefix.as_slice() { self.prefix.as_slice() } else { key };
        match self.source.first_from(Bound::Included(target))? {
            Some((found, _)) if matches_prefix(&self.prefix, &found) => {
                self.position = Bound::Included(found);
                Ok(true)
            }
            _ => {
                self.exhausted = true;
                Ok(false)
            }
        }
    }

    fn next_record(&mut self) -> DbResult<Option<Record>> {
        if self.exhausted {
            return Ok(None);
        }
        match self.lookup()? {
            Some((key, value)) if matches_prefix(&self.prefix, &key) => {
                self.position = Bound::Excluded(key.clone());
                Ok(Some((key, value)))
            }
            _ => {
                self.exhausted = true;
                Ok(None)
            }
        }
    }

    fn exhausted(&self) -> bool {
        self.exhausted
    }

    fn prefix(&self) -> &[u8] {
        &self.prefix
    }
}
