//! dictstore API: the contract every dictionary store backend satisfies
//!
//! - [`Db`]: lifecycle, CRUD, metadata, backup/restore, disablement
//! - [`DbAccessor`]: ordered, prefix-scoped cursors
//! - [`Transactional`] / [`Recoverable`]: optional capabilities
//! - [`DbComponent`] / [`DbRegistry`]: name + extension → path → store
//!
//! Backends live elsewhere; this crate does no I/O.

pub mod accessor;
pub mod capability;
pub mod component;
pub mod db;
pub mod error;
pub mod resolver;

pub use accessor::{matches_prefix, DbAccessor, OrderedSource, PrefixCursor, Record};
pub use capability::{Recoverable, Transactional};
pub use component::{DbClass, DbComponent, DbFactory, DbRegistry};
pub use db::{open_or_recover, Db, DbState};
pub use error::{DbError, DbResult, ErrorClass};
pub use resolver::{DirResolver, ResourceResolver};
