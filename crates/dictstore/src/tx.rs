//! Buffered write transactions.
//!
//! Mutations made inside a transaction are staged here, keyed by physical
//! key, and reach the engine as one atomic batch at commit. Point reads on
//! the owning store see staged writes first; cursors only see committed
//! state.

use std::collections::BTreeMap;

use dictstore_engine::BatchOp;

/// What a point read finds in the buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Staged<'a> {
    /// Written in this transaction.
    Value(&'a [u8]),
    /// Erased in this transaction.
    Erased,
    /// Not touched; fall through to the engine.
    Untouched,
}

/// Pending mutations of one open transaction.
#[derive(Debug, Default)]
pub struct TxBuffer {
    writes: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
    poisoned: Option<String>,
}

impl TxBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.writes.insert(key, Some(value));
    }

    pub fn erase(&mut self, key: Vec<u8>) {
        self.writes.insert(key, None);
    }

    pub fn lookup(&self, key: &[u8]) -> Staged<'_> {
        match self.writes.get(key) {
            Some(Some(value)) => Staged::Value(value),
            Some(None) => Staged::Erased,
            None => Staged::Untouched,
        }
    }

    /// Mark the transaction as doomed; commit will abort it. The first
    /// failure is kept.
    pub fn poison(&mut self, reason: impl Into<String>) {
        if self.poisoned.is_none() {
            self.poisoned = Some(reason.into());
        }
    }

    pub fn poisoned(&self) -> Option<&str> {
        self.poisoned.as_deref()
    }

    pub fn len(&self) -> usize {
        self.writes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    /// Staged writes in key order, ready for the engine.
    pub fn into_ops(self) -> Vec<BatchOp> {
        self.writes
            .into_iter()
            .map(|(key, value)| BatchOp { key, value })
            .collect()
    }
}
