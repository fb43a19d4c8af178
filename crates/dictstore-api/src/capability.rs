//! Optional capabilities a store may offer.
//!
//! A backend opts in by implementing the trait and returning itself from
//! `Db::as_transactional` / `Db::as_recoverable`. Callers must check for the
//! capability before relying on it.

use crate::error::{DbError, DbResult};

/// Atomic batching of mutations.
///
/// The provided methods are the contract for backends without transactions:
/// every call fails with `DbError::Unsupported` and `in_transaction` stays
/// false. Transactions do not nest.
pub trait Transactional {
    /// Fails with `TransactionActive` if a transaction is already open.
    fn begin_transaction(&self) -> DbResult<()> {
        Err(DbError::Unsupported { operation: "begin_transaction" })
    }

    /// Make every mutation since `begin_transaction` durable and visible at
    /// once. Fails with `NoTransaction` outside a transaction.
    fn commit_transaction(&self) -> DbResult<()> {
        Err(DbError::Unsupported { operation: "commit_transaction" })
    }

    /// Discard every mutation since `begin_transaction`.
    fn abort_transaction(&self) -> DbResult<()> {
        Err(DbError::Unsupported { operation: "abort_transaction" })
    }

    fn in_transaction(&self) -> bool {
        false
    }
}

/// Repair of a crashed or damaged store.
///
/// Runs against a closed store as a separate step from `open`. An error means
/// the store cannot be repaired and must be restored from a snapshot or
/// rebuilt.
pub trait Recoverable {
    fn recover(&self) -> DbResult<()>;
}
