//! dictstore: dictionary store backends
//!
//! Two implementations of the [`dictstore_api::Db`] contract:
//!
//! - [`ClawDb`] (`.claw`): a store directory on `dictstore-engine`, with
//!   write-ahead logging, transactions and crash recovery
//! - [`FlatDb`] (`.flat`): one snapshot file loaded into memory on open and
//!   rewritten on close
//!
//! Both keep metadata and data records in separate key spaces of one ordered
//! table. [`registry`] wires both into a [`dictstore_api::DbRegistry`].

pub mod claw;
pub mod cursor;
mod error;
pub mod flat;
pub mod namespace;
pub mod tx;

use std::sync::Arc;

use dictstore_api::{DbComponent, DbRegistry, ResourceResolver};
use dictstore_engine::Config;

pub use claw::{ClawDb, META_DB_NAME, META_ENGINE_VERSION};
pub use cursor::{ClawCursor, EngineSource};
pub use flat::{FlatDb, FlatOptions};

/// A registry with both backends, resolving paths through `resolver`.
pub fn registry(resolver: Arc<dyn ResourceResolver>, config: Config, flat: FlatOptions) -> DbRegistry {
    let registry = DbRegistry::new();
    registry.register(Arc::new(DbComponent::<ClawDb>::new(Arc::clone(&resolver), config)));
    registry.register(Arc::new(DbComponent::<FlatDb>::new(resolver, flat)));
    registry
}
